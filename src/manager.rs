//! The contract between a selector loop and its owning manager.

use std::io;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;

use crate::change::UserAttachment;
use crate::endpoint::{Connection, SelectableEndPoint};
use crate::scheduler::Scheduler;
use crate::selector::SelectorHandle;

/// Everything the loop consumes from the pool that owns it: factories
/// for endpoints and connections, accept/connect completion, lifecycle
/// notifications, and the hand-off points for worker execution and
/// delayed tasks.
///
/// All callback invocations except `execute`d closures and scheduled
/// tasks happen on the loop thread.
pub trait SelectorManager: Send + Sync {
    /// Build the endpoint for a newly accepted or connected stream.
    fn new_endpoint(
        &self,
        stream: &TcpStream,
        selector: &SelectorHandle,
        token: Token,
    ) -> io::Result<Arc<dyn SelectableEndPoint>>;

    /// Build the connection object layered on a fresh endpoint. Consumes
    /// the user attachment that travelled with the accept/connect.
    fn new_connection(
        &self,
        stream: &TcpStream,
        endpoint: &Arc<dyn SelectableEndPoint>,
        attachment: Option<UserAttachment>,
    ) -> io::Result<Arc<dyn Connection>>;

    /// A listener produced a new stream. The manager decides which loop
    /// gets it (typically by submitting an accept change there). On
    /// `Err` the stream has been consumed and closed by the callee.
    fn accepted(&self, stream: TcpStream) -> io::Result<()>;

    /// Whether a connect-ready stream has actually finished connecting.
    ///
    /// `Ok(false)` means still in progress; `Err` means the attempt
    /// failed. The default follows the mio idiom: a queued socket error
    /// is the failure, a readable peer address is success.
    fn finish_connect(&self, stream: &TcpStream) -> io::Result<bool> {
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn endpoint_opened(&self, _endpoint: &Arc<dyn SelectableEndPoint>) {}

    fn endpoint_closed(&self, _endpoint: &Arc<dyn SelectableEndPoint>) {}

    fn connection_opened(&self, _connection: &Arc<dyn Connection>) {}

    fn connection_closed(&self, _connection: &Arc<dyn Connection>) {}

    /// An outbound connect failed (refused, timed out, or errored during
    /// registration). Receives the stream by value; dropping it closes
    /// the socket. Invoked at most once per connect attempt.
    fn connection_failed(
        &self,
        stream: TcpStream,
        cause: io::Error,
        attachment: Option<UserAttachment>,
    );

    /// Hand blocking or substantive work to the worker pool.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);

    /// The delayed-task service used for connect timeouts.
    fn scheduler(&self) -> &dyn Scheduler;
}
