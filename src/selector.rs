//! The managed selector loop and its cross-thread handle.
//!
//! One `ManagedSelector` owns one `mio::Poll` and runs on one thread.
//! Everything it does happens on that thread; the only cross-thread
//! surface is `submit`, which enqueues a [`Change`] under a three-state
//! atomic protocol and wakes the loop when it is blocked in the kernel
//! wait.
//!
//! The protocol: `PROCESSING` means the loop thread is running on-thread
//! work and will look at the pending list again before blocking, so a
//! producer only has to enqueue. `SELECTING` means the loop is (or is
//! about to be) blocked in the wait, so a producer must also wake it.
//! `LOCKED` is the short mutual-exclusion window for the pending list
//! itself. A producer that wakes the loop releases the lock back to
//! `PROCESSING`, not `SELECTING` — the loop is about to exit the wait
//! anyway, and this spares the next producer a redundant wakeup.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Token, Waker};
use tracing::{debug, trace, warn};

use crate::change::{
    Change, ConnectRequest, ConnectShared, DumpRequest, PendingConnect, UserAttachment,
};
use crate::config::Config;
use crate::endpoint::SelectableEndPoint;
use crate::error::Error;
use crate::manager::SelectorManager;
use crate::mux::{Attachment, Channel, Interests, KeyView, Multiplexer, RegisterError};
use crate::scheduler::TimerHandle;
use crate::sync::Latch;

// change-protocol states
const PROCESSING: u8 = 0;
const SELECTING: u8 = 1;
const LOCKED: u8 = 2;

// lifecycle states
const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Bound on the wait for a `DumpKeys` snapshot.
const DUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between the loop thread and producers.
pub(crate) struct Shared {
    id: usize,
    state: AtomicU8,
    /// Pending changes. Mutated only while the mutating thread holds
    /// `LOCKED`; see the `Sync` impl below.
    add: UnsafeCell<Vec<Change>>,
    waker: Waker,
    lifecycle: AtomicU8,
    owner: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: `add` is only touched by a thread that has CAS-ed `state` to
// LOCKED, and is released with a `Release` store that the next locker
// observes with an `Acquire` load/CAS. That hand-off serializes all
// access to the Vec and publishes pushed changes to the loop's drain.
// Every other field is itself Sync.
unsafe impl Sync for Shared {}

impl Shared {
    /// Enqueue a change for the loop thread, waking it if it is blocked
    /// in the kernel wait. Callable from any thread, including the loop
    /// thread itself — running the change inline could recurse without
    /// bound on a busy server, so it is always queued.
    fn submit(&self, change: Change) {
        debug!(id = self.id, change = ?change, "queued change");
        let mut change = Some(change);
        loop {
            match self.state.load(Ordering::Acquire) {
                PROCESSING => {
                    if self
                        .state
                        .compare_exchange(PROCESSING, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                    // SAFETY: LOCKED is held, see the Sync impl.
                    unsafe { (*self.add.get()).push(change.take().expect("change consumed")) };
                    self.state.store(PROCESSING, Ordering::Release);
                    return;
                }
                SELECTING => {
                    if self
                        .state
                        .compare_exchange(SELECTING, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                    // SAFETY: LOCKED is held, see the Sync impl.
                    unsafe { (*self.add.get()).push(change.take().expect("change consumed")) };
                    if let Err(e) = self.waker.wake() {
                        debug!(id = self.id, error = %e, "wakeup failed");
                    }
                    self.state.store(PROCESSING, Ordering::Release);
                    return;
                }
                _ => thread::yield_now(),
            }
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == RUNNING
    }

    fn is_stopping(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == STOPPING
    }

    fn is_selector_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }
}

/// A single-threaded managed selector.
///
/// Create with [`ManagedSelector::new`], then either hand the loop its
/// own thread with [`start`](ManagedSelector::start) or drive it from an
/// existing thread with [`run`](ManagedSelector::run). All interaction
/// afterwards goes through the [`SelectorHandle`].
pub struct ManagedSelector {
    id: usize,
    mux: Multiplexer,
    run: Vec<Change>,
    selected: Vec<Token>,
    shared: Arc<Shared>,
    manager: Arc<dyn SelectorManager>,
    config: Config,
}

impl ManagedSelector {
    pub fn new(
        id: usize,
        manager: Arc<dyn SelectorManager>,
        config: Config,
    ) -> Result<Self, Error> {
        let mux = Multiplexer::new(config.events_capacity)?;
        let waker = mux.make_waker()?;
        let shared = Arc::new(Shared {
            id,
            state: AtomicU8::new(PROCESSING),
            add: UnsafeCell::new(Vec::new()),
            waker,
            lifecycle: AtomicU8::new(RUNNING),
            owner: OnceLock::new(),
            join: Mutex::new(None),
        });
        Ok(ManagedSelector {
            id,
            mux,
            run: Vec::new(),
            selected: Vec::new(),
            shared,
            manager,
            config,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// A cloneable cross-thread handle to this loop.
    pub fn handle(&self) -> SelectorHandle {
        SelectorHandle {
            shared: self.shared.clone(),
            manager: self.manager.clone(),
            connect_timeout: self.config.connect_timeout,
            stop_timeout: self.config.stop_timeout,
        }
    }

    /// Spawn the loop on its own thread and return the handle.
    pub fn start(self) -> Result<SelectorHandle, Error> {
        let handle = self.handle();
        let mut selector = self;
        let thread = thread::Builder::new()
            .name(format!("muxio-selector-{}", selector.id))
            .spawn(move || selector.run())
            .map_err(Error::Io)?;
        *handle.shared.join.lock().unwrap() = Some(thread);
        Ok(handle)
    }

    /// Run the loop on the current thread until stopped.
    pub fn run(&mut self) {
        let _ = self.shared.owner.set(thread::current().id());
        if self.config.priority_delta != 0 {
            apply_priority_delta(self.config.priority_delta);
        }
        debug!(id = self.id, "selector loop starting");
        while self.is_running() {
            self.select();
        }
        // One more pass per iteration of stopping: late changes and
        // already-selected work get drained before the thread exits.
        while self.is_stopping() {
            self.select();
        }
        debug!(id = self.id, "selector loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    pub fn is_selector_thread(&self) -> bool {
        self.shared.is_selector_thread()
    }

    /// Number of registered keys.
    pub fn key_count(&self) -> usize {
        self.mux.len()
    }

    /// Current interest ops of a key, if it exists.
    pub fn interests(&self, token: Token) -> Option<Interests> {
        self.mux.key(token).map(|key| key.interests)
    }

    /// Rewrite a key's interest ops and apply them to the registration.
    pub fn set_interests(&mut self, token: Token, ops: Interests) -> Result<(), Error> {
        let key = self.mux.key_mut(token).ok_or(Error::StaleKey)?;
        key.interests = ops;
        self.mux.apply_interests(token)?;
        Ok(())
    }

    /// Drop a key, closing its channel. If an endpoint was attached it
    /// is closed as well.
    pub fn close_key(&mut self, token: Token) {
        let endpoint = self
            .mux
            .key(token)
            .and_then(|key| key.attachment.endpoint().cloned());
        if self.mux.remove(token).is_some() {
            debug!(id = self.id, token = token.0, "closed key");
        }
        if let Some(endpoint) = endpoint {
            self.close_endpoint(&endpoint);
        }
    }

    /// One loop iteration: drain pending changes, block in the kernel
    /// wait, dispatch readiness, update keys.
    ///
    /// Failures are contained here; the loop never exits because of a
    /// single iteration's error.
    pub fn select(&mut self) {
        if let Err(e) = self.do_select() {
            if self.is_running() {
                warn!(id = self.id, error = %e, "selector loop failed");
            } else {
                debug!(id = self.id, error = %e, "selector loop failed while stopping");
            }
        }
    }

    fn do_select(&mut self) -> Result<(), Error> {
        // Run changes until none are pending, then publish SELECTING.
        // The PROCESSING -> SELECTING transition goes through the same
        // LOCKED window that publishes the pending list, so a change
        // can never be enqueued without either this loop seeing it or
        // the producer seeing SELECTING and waking us.
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                PROCESSING => {
                    let mut batch = mem::take(&mut self.run);
                    for change in batch.drain(..) {
                        self.run_change(change);
                    }
                    self.run = batch;

                    if self
                        .shared
                        .state
                        .compare_exchange(PROCESSING, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                    // SAFETY: LOCKED is held, see the Sync impl on Shared.
                    let add = unsafe { &mut *self.shared.add.get() };
                    if add.is_empty() {
                        self.shared.state.store(SELECTING, Ordering::Release);
                        break;
                    }
                    mem::swap(&mut self.run, add);
                    self.shared.state.store(PROCESSING, Ordering::Release);
                }
                _ => thread::yield_now(),
            }
        }

        trace!(id = self.id, "selector loop waiting on select");
        let waited = self.mux.wait();

        // Reconcile state after the wait. Seeing PROCESSING here is
        // benign: a producer woke us and already flipped the state.
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                SELECTING => {
                    if self
                        .shared
                        .state
                        .compare_exchange(SELECTING, PROCESSING, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        break;
                    }
                }
                PROCESSING => break,
                _ => thread::yield_now(),
            }
        }

        let selected = waited?;
        trace!(
            id = self.id,
            selected,
            keys = self.mux.len(),
            "selector loop woken up from select"
        );

        // Dispatch, then yield so dispatched work can run, then update
        // keys in a second sweep so momentary interest flips made by
        // that work have settled before the registration is rewritten.
        let mut ready = mem::take(&mut self.selected);
        self.mux.collect_ready(&mut ready);
        for &token in &ready {
            self.process_key(token);
        }
        thread::yield_now();
        for &token in &ready {
            self.update_key(token);
        }
        ready.clear();
        self.selected = ready;
        Ok(())
    }

    /// Run one change, containing failures: a misbehaving change must
    /// not take the loop down.
    fn run_change(&mut self, change: Change) {
        debug!(id = self.id, change = ?change, "running change");
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute_change(change))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(id = self.id, error = %e, "change failed"),
            Err(_) => debug!(id = self.id, "change panicked"),
        }
    }

    fn execute_change(&mut self, change: Change) -> Result<(), Error> {
        match change {
            Change::Acceptor(listener) => {
                match self.mux.register(
                    Channel::Listener(listener),
                    Interests::ACCEPT,
                    Attachment::Nil,
                ) {
                    Ok(token) => {
                        debug!(id = self.id, token = token.0, "acceptor registered");
                    }
                    Err(RegisterError { error, .. }) => {
                        // dropping the returned channel closes it
                        warn!(id = self.id, error = %error, "failed to register acceptor");
                    }
                }
                Ok(())
            }
            Change::Accept(stream, attachment) => {
                match self
                    .mux
                    .register(Channel::Stream(stream), Interests::NONE, Attachment::Nil)
                {
                    Ok(token) => {
                        if let Err((e, _)) = self.create_endpoint(token, attachment) {
                            debug!(id = self.id, token = token.0, error = %e, "accept failed");
                            self.mux.remove(token);
                        }
                    }
                    Err(RegisterError { error, .. }) => {
                        debug!(id = self.id, error = %error, "accept registration failed");
                    }
                }
                Ok(())
            }
            Change::Connect(request) => {
                let ConnectRequest {
                    stream,
                    attachment,
                    shared,
                    timeout,
                } = request;
                let pending = PendingConnect {
                    attachment,
                    shared: shared.clone(),
                    timeout,
                };
                match self.mux.register(
                    Channel::Stream(stream),
                    Interests::CONNECT,
                    Attachment::Pending(pending),
                ) {
                    Ok(token) => {
                        shared.set_token(token);
                        debug!(id = self.id, token = token.0, "connect registered");
                    }
                    Err(RegisterError {
                        error,
                        channel,
                        attachment,
                    }) => {
                        let (Channel::Stream(stream), Attachment::Pending(pending)) =
                            (channel, attachment)
                        else {
                            return Ok(());
                        };
                        let PendingConnect {
                            attachment,
                            shared,
                            timeout,
                        } = pending;
                        self.fail_connect(stream, &shared, &timeout, attachment, error);
                    }
                }
                Ok(())
            }
            Change::ConnectTimeout(weak) => {
                let Some(shared) = weak.upgrade() else {
                    return Ok(());
                };
                let Some(token) = shared.token() else {
                    return Ok(());
                };
                // The slab slot may have been reused; only act if the
                // key still carries this very connect.
                let still_pending = self
                    .mux
                    .key(token)
                    .map(|key| match &key.attachment {
                        Attachment::Pending(pending) => Arc::ptr_eq(&pending.shared, &shared),
                        _ => false,
                    })
                    .unwrap_or(false);
                if !still_pending {
                    return Ok(());
                }
                debug!(
                    id = self.id,
                    token = token.0,
                    "channel timed out while connecting, closing it"
                );
                let Some(key) = self.mux.remove(token) else {
                    return Ok(());
                };
                let Channel::Stream(stream) = key.channel else {
                    return Ok(());
                };
                let Attachment::Pending(pending) = key.attachment else {
                    return Ok(());
                };
                let PendingConnect {
                    attachment,
                    shared,
                    timeout,
                } = pending;
                self.fail_connect(
                    stream,
                    &shared,
                    &timeout,
                    attachment,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                );
                Ok(())
            }
            Change::Stop(latch) => {
                self.run_stop(&latch);
                Ok(())
            }
            Change::DumpKeys(request) => {
                self.dump_keys(&request);
                Ok(())
            }
            Change::Task(task) => {
                task(self);
                Ok(())
            }
        }
    }

    /// Dispatch one ready key by attachment.
    fn process_key(&mut self, token: Token) {
        enum Dispatch {
            Invalid(Option<Arc<dyn SelectableEndPoint>>),
            Selected(Arc<dyn SelectableEndPoint>),
            Connect,
            Accept,
            Unexpected,
        }

        let dispatch = match self.mux.key(token) {
            None => {
                debug!(id = self.id, token = token.0, "ignoring cancelled key");
                return;
            }
            Some(key) if !key.valid => Dispatch::Invalid(key.attachment.endpoint().cloned()),
            Some(key) => match &key.attachment {
                Attachment::Live(endpoint) => Dispatch::Selected(endpoint.clone()),
                Attachment::Pending(_) => Dispatch::Connect,
                Attachment::Nil if key.ready.contains(Interests::ACCEPT) => Dispatch::Accept,
                Attachment::Nil => Dispatch::Unexpected,
            },
        };

        match dispatch {
            Dispatch::Invalid(endpoint) => {
                debug!(id = self.id, token = token.0, "ignoring invalid key");
                self.mux.remove(token);
                if let Some(endpoint) = endpoint {
                    self.close_endpoint(&endpoint);
                }
            }
            Dispatch::Selected(endpoint) => {
                let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
                    if let Some(key) = self.mux.key_mut(token) {
                        endpoint.on_selected(&mut KeyView::new(token, key));
                    }
                }))
                .is_err();
                if panicked {
                    warn!(id = self.id, token = token.0, "could not process key");
                    self.mux.remove(token);
                    self.close_endpoint(&endpoint);
                }
            }
            Dispatch::Connect => self.process_connect(token),
            Dispatch::Accept => self.process_accept(token),
            Dispatch::Unexpected => {
                warn!(
                    id = self.id,
                    token = token.0,
                    "unexpected readiness for unattached key"
                );
                self.mux.remove(token);
            }
        }
    }

    /// Second-sweep pass: let the endpoint rewrite its interest ops,
    /// then bring the OS registration in line and clear ready ops.
    fn update_key(&mut self, token: Token) {
        let Some(key) = self.mux.key(token) else {
            return;
        };
        if !key.valid {
            self.close_invalid(token);
            return;
        }
        if let Some(endpoint) = key.attachment.endpoint().cloned() {
            let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(key) = self.mux.key_mut(token) {
                    endpoint.update_key(&mut KeyView::new(token, key));
                }
            }))
            .is_err();
            if panicked {
                warn!(id = self.id, token = token.0, "could not update key");
                self.mux.remove(token);
                self.close_endpoint(&endpoint);
                return;
            }
            if self.mux.key(token).map(|key| !key.valid).unwrap_or(false) {
                self.close_invalid(token);
                return;
            }
        }
        if let Err(e) = self.mux.apply_interests(token) {
            warn!(id = self.id, token = token.0, error = %e, "could not apply interest ops");
            let endpoint = self
                .mux
                .key(token)
                .and_then(|key| key.attachment.endpoint().cloned());
            self.mux.remove(token);
            if let Some(endpoint) = endpoint {
                self.close_endpoint(&endpoint);
            }
            return;
        }
        if let Some(key) = self.mux.key_mut(token) {
            key.ready = Interests::NONE;
        }
    }

    fn close_invalid(&mut self, token: Token) {
        debug!(id = self.id, token = token.0, "closing cancelled key");
        let endpoint = self
            .mux
            .key(token)
            .and_then(|key| key.attachment.endpoint().cloned());
        self.mux.remove(token);
        if let Some(endpoint) = endpoint {
            self.close_endpoint(&endpoint);
        }
    }

    /// Accept every pending connection on a ready listener.
    fn process_accept(&mut self, token: Token) {
        loop {
            let accepted = {
                let Some(key) = self.mux.key(token) else {
                    return;
                };
                let Some(listener) = key.channel.listener() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(id = self.id, peer = %addr, "accepted connection");
                    if let Err(e) = self.manager.accepted(stream) {
                        warn!(id = self.id, error = %e, "accepted connection rejected");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(id = self.id, token = token.0, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Complete (or fail) an outbound connect whose key became ready.
    fn process_connect(&mut self, token: Token) {
        let Some(key) = self.mux.key_mut(token) else {
            return;
        };
        let pending = match mem::replace(&mut key.attachment, Attachment::Nil) {
            Attachment::Pending(pending) => pending,
            other => {
                key.attachment = other;
                return;
            }
        };
        let PendingConnect {
            attachment,
            shared,
            timeout,
        } = pending;

        let manager = self.manager.clone();
        let finished = {
            let Some(key) = self.mux.key(token) else {
                return;
            };
            let Some(stream) = key.channel.stream() else {
                return;
            };
            panic::catch_unwind(AssertUnwindSafe(|| manager.finish_connect(stream)))
                .unwrap_or_else(|_| Err(io::Error::other("finish_connect panicked")))
        };

        match finished {
            Ok(true) => {
                timeout.cancel();
                if let Some(key) = self.mux.key_mut(token) {
                    key.interests = Interests::NONE;
                }
                if let Err(e) = self.mux.apply_interests(token) {
                    if let Some(stream) = self.take_stream(token) {
                        self.fail_connect(stream, &shared, &timeout, attachment, e);
                    }
                    return;
                }
                debug!(id = self.id, token = token.0, "connect finished");
                if let Err((e, attachment)) = self.create_endpoint(token, attachment) {
                    debug!(id = self.id, token = token.0, error = %e, "endpoint creation failed");
                    let cause = match e {
                        Error::Io(e) => e,
                        other => io::Error::other(other.to_string()),
                    };
                    if let Some(stream) = self.take_stream(token) {
                        self.fail_connect(stream, &shared, &timeout, attachment, cause);
                    }
                }
            }
            Ok(false) => {
                if let Some(stream) = self.take_stream(token) {
                    self.fail_connect(
                        stream,
                        &shared,
                        &timeout,
                        attachment,
                        io::Error::new(io::ErrorKind::ConnectionRefused, "connect failed"),
                    );
                }
            }
            Err(e) => {
                if let Some(stream) = self.take_stream(token) {
                    self.fail_connect(stream, &shared, &timeout, attachment, e);
                }
            }
        }
    }

    /// Remove a key and recover its stream, if it was a stream key.
    fn take_stream(&mut self, token: Token) -> Option<TcpStream> {
        match self.mux.remove(token)?.channel {
            Channel::Stream(stream) => Some(stream),
            Channel::Listener(_) => None,
        }
    }

    /// Fail a connect attempt exactly once: cancel the timeout, close
    /// the channel (by dropping it after notification) and tell the
    /// manager. Losing the `failed` race makes this a no-op.
    fn fail_connect(
        &self,
        stream: TcpStream,
        shared: &ConnectShared,
        timeout: &TimerHandle,
        attachment: Option<UserAttachment>,
        cause: io::Error,
    ) {
        if shared.try_fail() {
            timeout.cancel();
            debug!(id = self.id, error = %cause, "connect failed");
            self.manager.connection_failed(stream, cause, attachment);
        }
    }

    /// Build endpoint + connection for a key and attach the endpoint.
    ///
    /// On failure before the attachment was consumed it is handed back
    /// so the caller can route it into its own failure notification.
    fn create_endpoint(
        &mut self,
        token: Token,
        attachment: Option<UserAttachment>,
    ) -> Result<(), (Error, Option<UserAttachment>)> {
        let handle = self.handle();
        let manager = self.manager.clone();

        let endpoint = {
            let Some(key) = self.mux.key(token) else {
                return Err((Error::StaleKey, attachment));
            };
            let Some(stream) = key.channel.stream() else {
                return Err((Error::StaleKey, attachment));
            };
            match manager.new_endpoint(stream, &handle, token) {
                Ok(endpoint) => endpoint,
                Err(e) => return Err((Error::Io(e), attachment)),
            }
        };
        manager.endpoint_opened(&endpoint);

        let connection = {
            let Some(key) = self.mux.key(token) else {
                return Err((Error::StaleKey, None));
            };
            let Some(stream) = key.channel.stream() else {
                return Err((Error::StaleKey, None));
            };
            match manager.new_connection(stream, &endpoint, attachment) {
                Ok(connection) => connection,
                Err(e) => return Err((Error::Io(e), None)),
            }
        };
        endpoint.set_connection(connection.clone());
        manager.connection_opened(&connection);

        if let Some(key) = self.mux.key_mut(token) {
            key.attachment = Attachment::Live(endpoint);
        }
        debug!(id = self.id, token = token.0, "created endpoint");
        Ok(())
    }

    /// The `Stop` change: close every endpoint's connection on the
    /// executor (bounded per endpoint), close the multiplexer, release
    /// the caller's latch. The latch is released even if something in
    /// here fails.
    fn run_stop(&mut self, latch: &Latch) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            debug!(id = self.id, "stopping selector");
            for token in self.mux.tokens() {
                let endpoint = self
                    .mux
                    .key(token)
                    .and_then(|key| key.attachment.endpoint().cloned());
                let Some(endpoint) = endpoint else { continue };

                // Closing a connection may block on worker coordination;
                // do it on the executor and bound how long we wait.
                let closer = Arc::new(Latch::new());
                let released = closer.clone();
                let connection = endpoint.connection();
                self.manager.execute(Box::new(move || {
                    if let Some(connection) = connection {
                        let _ = panic::catch_unwind(AssertUnwindSafe(|| connection.close()));
                    }
                    released.count_down();
                }));
                if !closer.wait_timeout(self.config.stop_timeout) {
                    warn!(id = self.id, token = token.0, "endpoint close timed out");
                }
            }
            self.mux.close();
        }));
        latch.count_down();
        if result.is_err() {
            debug!(id = self.id, "stop change panicked");
        }
    }

    /// The `DumpKeys` change: snapshot attachment kind plus interest and
    /// ready ops for every key.
    fn dump_keys(&mut self, request: &DumpRequest) {
        let mut lines = Vec::with_capacity(self.mux.len() + 1);
        lines.push(format!("keys={}", self.mux.len()));
        for token in self.mux.tokens() {
            let Some(key) = self.mux.key(token) else {
                continue;
            };
            if key.valid {
                lines.push(format!(
                    "{} token={} iops={} rops={}",
                    key.attachment.kind(),
                    token.0,
                    key.interests,
                    key.ready
                ));
            } else {
                lines.push(format!(
                    "{} token={} iops=-1 rops=-1",
                    key.attachment.kind(),
                    token.0
                ));
            }
        }
        *request.sink.lock().unwrap() = lines;
        request.latch.count_down();
    }

    fn close_endpoint(&self, endpoint: &Arc<dyn SelectableEndPoint>) {
        if panic::catch_unwind(AssertUnwindSafe(|| endpoint.close())).is_err() {
            debug!(id = self.id, "endpoint close panicked");
        }
    }
}

/// Cloneable cross-thread handle to a [`ManagedSelector`].
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<Shared>,
    manager: Arc<dyn SelectorManager>,
    connect_timeout: Duration,
    stop_timeout: Duration,
}

impl SelectorHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// True iff called from the thread running the loop.
    pub fn is_selector_thread(&self) -> bool {
        self.shared.is_selector_thread()
    }

    /// Enqueue a change for the loop thread. Safe from any thread.
    pub fn submit(&self, change: Change) {
        self.shared.submit(change);
    }

    /// Enqueue arbitrary work with loop-thread access.
    pub fn submit_task(&self, task: impl FnOnce(&mut ManagedSelector) + Send + 'static) {
        self.submit(Change::Task(Box::new(task)));
    }

    /// Register a listening socket; accepted streams are handed to
    /// [`SelectorManager::accepted`].
    pub fn register_acceptor(&self, listener: TcpListener) {
        self.submit(Change::Acceptor(listener));
    }

    /// Register an accepted stream on this loop and build its endpoint.
    pub fn accept(&self, stream: TcpStream, attachment: Option<UserAttachment>) {
        self.submit(Change::Accept(stream, attachment));
    }

    /// Track an in-progress outbound connect on this loop, with a
    /// connect timeout scheduled on the manager's scheduler.
    ///
    /// The stream should come from `mio::net::TcpStream::connect`.
    pub fn connect(&self, stream: TcpStream, attachment: Option<UserAttachment>) {
        let shared = Arc::new(ConnectShared::new());
        let weak = Arc::downgrade(&shared);
        let submitter = self.clone();
        let timeout = self.manager.scheduler().schedule(
            self.connect_timeout,
            Box::new(move || submitter.submit(Change::ConnectTimeout(weak))),
        );
        self.submit(Change::Connect(ConnectRequest {
            stream,
            attachment,
            shared,
            timeout,
        }));
    }

    /// Fire the close notifications for an endpoint: `connection_closed`
    /// (if a connection is set) then `endpoint_closed`. Performs no I/O.
    pub fn destroy_endpoint(&self, endpoint: &Arc<dyn SelectableEndPoint>) {
        debug!(id = self.shared.id, "destroyed endpoint");
        if let Some(connection) = endpoint.connection() {
            self.manager.connection_closed(&connection);
        }
        self.manager.endpoint_closed(endpoint);
    }

    /// Stop the loop: close all endpoints (each bounded by the stop
    /// timeout), close the multiplexer, and join the loop thread.
    ///
    /// Returns `true` if shutdown completed within the stop timeout.
    /// Returns immediately (with `true`) if the loop is already
    /// stopping or stopped.
    pub fn stop(&self) -> bool {
        if self
            .shared
            .lifecycle
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return true;
        }
        debug!(id = self.shared.id, "stopping selector loop");
        let latch = Arc::new(Latch::new());
        self.submit(Change::Stop(latch.clone()));
        let completed = latch.wait_timeout(self.stop_timeout);
        self.shared.lifecycle.store(STOPPED, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            debug!(id = self.shared.id, error = %e, "wakeup failed during stop");
        }
        if !self.is_selector_thread() {
            if let Some(thread) = self.shared.join.lock().unwrap().take() {
                let _ = thread.join();
            }
        }
        if !completed {
            warn!(id = self.shared.id, "selector stop timed out");
        }
        completed
    }

    /// Append a diagnostic snapshot of the loop: its current state and
    /// one line per registered key. Blocks up to five seconds while the
    /// loop takes the snapshot.
    pub fn dump(&self, out: &mut dyn io::Write, indent: &str) -> io::Result<()> {
        let state = match self.shared.state.load(Ordering::Acquire) {
            SELECTING => "selecting",
            LOCKED => "locked",
            _ => "processing",
        };
        writeln!(out, "{indent}selector id={} state={}", self.shared.id, state)?;

        let sink = Arc::new(Mutex::new(Vec::new()));
        let latch = Arc::new(Latch::new());
        self.submit(Change::DumpKeys(DumpRequest {
            sink: sink.clone(),
            latch: latch.clone(),
        }));
        if latch.wait_timeout(DUMP_TIMEOUT) {
            for line in sink.lock().unwrap().iter() {
                writeln!(out, "{indent}  {line}")?;
            }
        } else {
            writeln!(out, "{indent}  <keys unavailable>")?;
        }
        Ok(())
    }
}

/// Apply a nice-value delta to the current thread. Linux only; a no-op
/// elsewhere.
#[cfg(target_os = "linux")]
fn apply_priority_delta(delta: i32) {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        let current = libc::getpriority(libc::PRIO_PROCESS, tid);
        libc::setpriority(libc::PRIO_PROCESS, tid, current + delta);
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority_delta(_delta: i32) {}
