pub mod candidates;
pub mod host;
pub mod joiner;

use crate::error::SignalingError;
use crate::store::{SignalingStore, SubscriptionId};
use tokio::sync::oneshot;

pub use host::{HostHandle, HostState, ReplayHook};
pub use joiner::{JoinTarget, JoinerHandle, JoinerState, RemoteIndicators};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SignalingError>>;

/// Detaches the listener held in `slot`, if any.
pub(crate) fn release(store: &dyn SignalingStore, slot: &mut Option<SubscriptionId>) {
    if let Some(id) = slot.take() {
        store.unsubscribe(id);
    }
}
