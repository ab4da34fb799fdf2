pub mod local;
pub mod tcp;

use std::sync::Arc;

use crate::order::{Message, PeerId};
use crate::Result;

pub use local::LocalBus;
pub use tcp::{Client, TcpBus};

/// Point-to-point delivery between peers.
///
/// `send` is synchronous: it returns the target's immediate reply, or `None`
/// if the target deferred and will answer later through its own `send`.
/// An unreachable target is reported as [`crate::Error::PeerUnreachable`];
/// retrying is up to the caller.
pub trait MessageBus {
    fn send(&self, message: Message, target: PeerId) -> Result<Option<Message>>;
}

impl<B: MessageBus + ?Sized> MessageBus for Arc<B> {
    fn send(&self, message: Message, target: PeerId) -> Result<Option<Message>> {
        (**self).send(message, target)
    }
}
