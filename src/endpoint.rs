use std::sync::Arc;

use crate::mux::KeyView;

/// The framing/protocol object layered on top of an endpoint.
///
/// Created by the manager when an endpoint opens; the loop only ever
/// closes it (during shutdown) and reports its lifecycle upward.
pub trait Connection: Send + Sync {
    fn close(&self);
}

/// One connected channel, from the framework's point of view.
///
/// Endpoints are shared with worker threads; their internal locking is
/// their own concern. The loop calls `close` when it gives up on a key
/// and queries/sets the connection during endpoint creation.
pub trait EndPoint: Send + Sync {
    fn connection(&self) -> Option<Arc<dyn Connection>>;

    fn set_connection(&self, connection: Arc<dyn Connection>);

    fn close(&self);
}

/// An endpoint attached to a readiness key.
///
/// Both callbacks run on the loop thread and must not block; substantive
/// work belongs on the manager's executor. `on_selected` is invoked when
/// the key has ready ops; `update_key` runs in a second sweep after all
/// dispatch for the iteration, so momentary interest flips made by
/// worker threads can settle before the loop rewrites the registration.
pub trait SelectableEndPoint: EndPoint {
    fn on_selected(&self, key: &mut KeyView<'_>);

    fn update_key(&self, key: &mut KeyView<'_>);
}
