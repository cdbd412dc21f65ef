//! Shared fixtures: a recording manager and a minimal endpoint.

#![allow(dead_code)]

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::TcpStream;
use mio::Token;
use muxio::{
    Config, Connection, EndPoint, Interests, KeyView, ManagedSelector, Scheduler,
    SelectableEndPoint, SelectorHandle, SelectorManager, TimerScheduler, UserAttachment,
};

/// Lifecycle observations, in the order the manager saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    NewEndpoint,
    NewConnection,
    EndpointOpened,
    EndpointClosed,
    ConnectionOpened,
    ConnectionClosed,
    ConnectionFailed(io::ErrorKind),
    Accepted,
}

pub struct TestConnection {
    pub closed: AtomicBool,
}

impl Connection for TestConnection {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct TestEndPoint {
    connection: Mutex<Option<Arc<dyn Connection>>>,
    pub data: Mutex<Vec<u8>>,
    pub closed: AtomicBool,
    pub panic_on_selected: AtomicBool,
    selected_tx: Sender<ThreadId>,
}

impl EndPoint for TestEndPoint {
    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().unwrap().clone()
    }

    fn set_connection(&self, connection: Arc<dyn Connection>) {
        *self.connection.lock().unwrap() = Some(connection);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl SelectableEndPoint for TestEndPoint {
    fn on_selected(&self, key: &mut KeyView<'_>) {
        let _ = self.selected_tx.send(thread::current().id());
        if self.panic_on_selected.load(Ordering::Acquire) {
            panic!("endpoint failure injected");
        }
        if key.ready_ops().contains(Interests::READ) {
            let mut buf = [0u8; 4096];
            while let Some(stream) = key.stream() {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.data.lock().unwrap().extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
    }

    fn update_key(&self, key: &mut KeyView<'_>) {
        key.set_interests(Interests::READ);
    }
}

/// A `SelectorManager` that records every observation and drives the
/// default single-loop wiring: accepted streams come back to the same
/// loop as accept changes.
pub struct TestManager {
    handle: Mutex<Option<SelectorHandle>>,
    scheduler: TimerScheduler,
    events: Mutex<Vec<(Event, ThreadId)>>,
    pub endpoints: Mutex<Vec<Arc<TestEndPoint>>>,
    pub connections: Mutex<Vec<Arc<TestConnection>>>,
    pub selected_rx: Receiver<ThreadId>,
    selected_tx: Sender<ThreadId>,
    pub executor_dispatches: AtomicUsize,
    /// When set, `finish_connect` reports the attempt as not connected.
    pub refuse_connects: AtomicBool,
    /// When set, `execute` drops tasks instead of running them.
    pub stall_executor: AtomicBool,
    /// Last accept/connect attachment that reached `new_connection`.
    pub last_attachment: Mutex<Option<u32>>,
}

impl TestManager {
    pub fn new() -> Arc<Self> {
        let (selected_tx, selected_rx) = unbounded();
        Arc::new(TestManager {
            handle: Mutex::new(None),
            scheduler: TimerScheduler::new(),
            events: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            selected_rx,
            selected_tx,
            executor_dispatches: AtomicUsize::new(0),
            refuse_connects: AtomicBool::new(false),
            stall_executor: AtomicBool::new(false),
            last_attachment: Mutex::new(None),
        })
    }

    pub fn set_handle(&self, handle: SelectorHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap()
            .push((event, thread::current().id()));
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| *event)
            .collect()
    }

    pub fn event_threads(&self) -> Vec<(Event, ThreadId)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| wanted(e)).count()
    }

    pub fn failed_count(&self) -> usize {
        self.count(|e| matches!(e, Event::ConnectionFailed(_)))
    }

    /// Poll until `predicate` holds or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&TestManager) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl SelectorManager for TestManager {
    fn new_endpoint(
        &self,
        _stream: &TcpStream,
        selector: &SelectorHandle,
        token: Token,
    ) -> io::Result<Arc<dyn SelectableEndPoint>> {
        self.record(Event::NewEndpoint);
        let endpoint = Arc::new(TestEndPoint {
            connection: Mutex::new(None),
            data: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            panic_on_selected: AtomicBool::new(false),
            selected_tx: self.selected_tx.clone(),
        });
        self.endpoints.lock().unwrap().push(endpoint.clone());
        // A real endpoint declares its first fill interest itself; do the
        // same so fresh keys start listening for reads.
        selector.submit_task(move |selector| {
            let _ = selector.set_interests(token, Interests::READ);
        });
        Ok(endpoint)
    }

    fn new_connection(
        &self,
        _stream: &TcpStream,
        _endpoint: &Arc<dyn SelectableEndPoint>,
        attachment: Option<UserAttachment>,
    ) -> io::Result<Arc<dyn Connection>> {
        self.record(Event::NewConnection);
        if let Some(value) = attachment.and_then(|a| a.downcast::<u32>().ok()) {
            *self.last_attachment.lock().unwrap() = Some(*value);
        }
        let connection = Arc::new(TestConnection {
            closed: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }

    fn accepted(&self, stream: TcpStream) -> io::Result<()> {
        self.record(Event::Accepted);
        let handle = self.handle.lock().unwrap().clone();
        match handle {
            Some(handle) => {
                handle.accept(stream, None);
                Ok(())
            }
            None => Err(io::Error::other("no selector handle installed")),
        }
    }

    fn finish_connect(&self, stream: &TcpStream) -> io::Result<bool> {
        if self.refuse_connects.load(Ordering::Acquire) {
            return Ok(false);
        }
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn endpoint_opened(&self, _endpoint: &Arc<dyn SelectableEndPoint>) {
        self.record(Event::EndpointOpened);
    }

    fn endpoint_closed(&self, _endpoint: &Arc<dyn SelectableEndPoint>) {
        self.record(Event::EndpointClosed);
    }

    fn connection_opened(&self, _connection: &Arc<dyn Connection>) {
        self.record(Event::ConnectionOpened);
    }

    fn connection_closed(&self, _connection: &Arc<dyn Connection>) {
        self.record(Event::ConnectionClosed);
    }

    fn connection_failed(
        &self,
        _stream: TcpStream,
        cause: io::Error,
        _attachment: Option<UserAttachment>,
    ) {
        self.record(Event::ConnectionFailed(cause.kind()));
    }

    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.executor_dispatches.fetch_add(1, Ordering::AcqRel);
        if self.stall_executor.load(Ordering::Acquire) {
            return;
        }
        thread::spawn(task);
    }

    fn scheduler(&self) -> &dyn Scheduler {
        &self.scheduler
    }
}

pub struct Fixture {
    pub manager: Arc<TestManager>,
    pub handle: SelectorHandle,
}

/// Start one selector loop on its own thread with the given config.
pub fn start_selector(config: Config) -> Fixture {
    let manager = TestManager::new();
    let selector = ManagedSelector::new(0, manager.clone(), config).expect("selector setup");
    let handle = selector.start().expect("selector start");
    manager.set_handle(handle.clone());
    Fixture { manager, handle }
}

/// The loop thread's id, observed from inside a submitted change.
pub fn loop_thread_id(handle: &SelectorHandle) -> ThreadId {
    let (tx, rx) = unbounded();
    handle.submit_task(move |_selector| {
        let _ = tx.send(thread::current().id());
    });
    rx.recv_timeout(Duration::from_secs(2))
        .expect("loop thread did not respond")
}
