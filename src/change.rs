//! Deferred work units executed on the loop thread.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use mio::net::{TcpListener, TcpStream};
use mio::Token;

use crate::scheduler::TimerHandle;
use crate::selector::ManagedSelector;
use crate::sync::Latch;

/// Opaque user payload carried from `accept`/`connect` submission through
/// to `SelectorManager::new_connection` (or `connection_failed`).
pub type UserAttachment = Box<dyn Any + Send>;

/// A unit of deferred work, run exactly once on the loop thread.
///
/// External callers mostly submit `Task`; the other variants are the
/// loop's own protocol, built by the `SelectorHandle` convenience
/// methods.
pub enum Change {
    /// Register a listening socket with accept interest.
    Acceptor(TcpListener),
    /// Register an accepted stream and build its endpoint.
    Accept(TcpStream, Option<UserAttachment>),
    /// Register an in-progress outbound connect.
    Connect(ConnectRequest),
    /// Timer-fired check that a pending connect has not stalled.
    ConnectTimeout(Weak<ConnectShared>),
    /// Close all endpoints and the multiplexer, then release the latch.
    Stop(Arc<Latch>),
    /// Snapshot key state into the request's sink.
    DumpKeys(DumpRequest),
    /// Arbitrary user work with loop-thread access.
    Task(Box<dyn FnOnce(&mut ManagedSelector) + Send>),
}

impl fmt::Debug for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Change::Acceptor(_) => "acceptor",
            Change::Accept(..) => "accept",
            Change::Connect(_) => "connect",
            Change::ConnectTimeout(_) => "connect-timeout",
            Change::Stop(_) => "stop",
            Change::DumpKeys(_) => "dump-keys",
            Change::Task(_) => "task",
        };
        f.write_str(name)
    }
}

/// State shared between a pending connect and its scheduled timeout.
///
/// `failed` transitions false -> true at most once; whichever of success
/// or failure wins it owns the cleanup. The timeout task holds only a
/// `Weak` to this, so a finished connect leaves nothing for a late timer
/// fire to act on.
pub struct ConnectShared {
    failed: AtomicBool,
    token: OnceLock<Token>,
}

impl ConnectShared {
    pub(crate) fn new() -> Self {
        ConnectShared {
            failed: AtomicBool::new(false),
            token: OnceLock::new(),
        }
    }

    /// Win the failure flag. Returns true exactly once.
    pub(crate) fn try_fail(&self) -> bool {
        self.failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_token(&self, token: Token) {
        let _ = self.token.set(token);
    }

    pub(crate) fn token(&self) -> Option<Token> {
        self.token.get().copied()
    }
}

/// An outbound connect on its way to the loop thread.
pub struct ConnectRequest {
    pub(crate) stream: TcpStream,
    pub(crate) attachment: Option<UserAttachment>,
    pub(crate) shared: Arc<ConnectShared>,
    pub(crate) timeout: TimerHandle,
}

/// Connect state parked in the key while the kernel works on it.
pub struct PendingConnect {
    pub(crate) attachment: Option<UserAttachment>,
    pub(crate) shared: Arc<ConnectShared>,
    pub(crate) timeout: TimerHandle,
}

/// Sink + latch pair for the diagnostic key dump.
pub struct DumpRequest {
    pub(crate) sink: Arc<Mutex<Vec<String>>>,
    pub(crate) latch: Arc<Latch>,
}
