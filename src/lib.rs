//! Managed selector event loops for non-blocking network I/O.
//!
//! A [`ManagedSelector`] is a single-threaded event loop that multiplexes
//! non-blocking TCP channels (listeners, outbound connects, established
//! connections) over one `mio::Poll` and drives lifecycle callbacks on
//! attached endpoints. A process typically runs several loops, one per
//! core, owned by a pool that implements [`SelectorManager`].
//!
//! Cross-thread interaction goes exclusively through
//! [`SelectorHandle::submit`]: a deferred [`Change`] executed on the loop
//! thread, with a lock-free state machine deciding whether the submitter
//! must wake the loop out of its kernel wait. Readiness is dispatched to
//! [`SelectableEndPoint`]s in two sweeps per iteration: `on_selected`
//! first, then — after a yield — `update_key`, so interest flips made by
//! handed-off work settle before the loop rewrites registrations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use muxio::{Config, ManagedSelector, SelectorManager};
//!
//! # fn manager() -> Arc<dyn SelectorManager> { unimplemented!() }
//! let manager: Arc<dyn SelectorManager> = manager();
//! let selector = ManagedSelector::new(0, manager, Config::default()).unwrap();
//! let handle = selector.start().unwrap();
//!
//! let listener = muxio::net::bind_listener("127.0.0.1:0".parse().unwrap(), 1024).unwrap();
//! handle.register_acceptor(listener);
//! // ... later
//! handle.stop();
//! ```

pub mod change;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod mux;
pub mod net;
pub mod scheduler;
pub mod selector;
pub mod sync;

pub use change::{Change, UserAttachment};
pub use config::Config;
pub use endpoint::{Connection, EndPoint, SelectableEndPoint};
pub use error::Error;
pub use manager::SelectorManager;
pub use mux::{Attachment, Channel, Interests, KeyView};
pub use scheduler::{Scheduler, TimerHandle, TimerScheduler};
pub use selector::{ManagedSelector, SelectorHandle};
pub use sync::Latch;

// The multiplexer's key token; endpoints and managers see it in
// callbacks and key views.
pub use mio::Token;
