pub mod lamport_clock;
pub mod message;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use lamport_clock::LamportClock;
pub use message::Message;

pub type Timestamp = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// Shared by reference between the request loop and inbound handlers, hence &self
pub trait LogicalClock {
    // Local event: advance by one
    fn tick(&self) -> Timestamp;
    // Received event: jump past the sender's clock
    fn observe(&self, external: Timestamp) -> Timestamp;
    fn time(&self) -> Timestamp;
}
