pub mod resource;
pub mod ricart_agrawala;
pub mod sets;
pub mod stop;

use serde::{Deserialize, Serialize};

pub use resource::ResourceServer;
pub use ricart_agrawala::RicartAgrawala;
pub use sets::{DeferredQueue, PendingSet};
pub use stop::StopSignal;

/// Where a peer is in its request cycle: `Idle -> Wanting -> Held -> Idle`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    #[default]
    Idle,
    Wanting,
    Held,
}

/// The single exclusive resource the peers compete for.
///
/// Implementations must refuse a second concurrent occupant with
/// [`crate::Error::ResourceBusy`] rather than queueing it: only the
/// distributed protocol is allowed to serialize access.
pub trait Resource {
    /// Blocks for the duration of the critical section.
    fn use_resource(&self) -> crate::Result<()>;
}

impl<R: Resource + ?Sized> Resource for std::sync::Arc<R> {
    fn use_resource(&self) -> crate::Result<()> {
        (**self).use_resource()
    }
}
