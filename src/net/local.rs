use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use super::MessageBus;
use crate::order::{Message, PeerId};
use crate::sync::RicartAgrawala;
use crate::{Error, Result};

/// In-process bus: delivery is a direct call into the target's state machine.
#[derive(Clone, Default)]
pub struct LocalBus {
    registry: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
    peers: HashMap<PeerId, Arc<RicartAgrawala>>,
    disconnected: HashSet<PeerId>,
}

impl LocalBus {
    pub fn register(&self, core: Arc<RicartAgrawala>) {
        self.registry.write().peers.insert(core.id(), core);
    }

    // Sends to `id` fail until reconnected
    pub fn disconnect(&self, id: PeerId) {
        self.registry.write().disconnected.insert(id);
    }

    pub fn reconnect(&self, id: PeerId) {
        self.registry.write().disconnected.remove(&id);
    }
}

impl MessageBus for LocalBus {
    fn send(&self, message: Message, target: PeerId) -> Result<Option<Message>> {
        // Never dispatch under the registry lock, handlers may send in turn
        let core = {
            let registry = self.registry.read();
            if registry.disconnected.contains(&target) {
                return Err(Error::PeerUnreachable {
                    peer: target,
                    reason: "disconnected".into(),
                });
            }
            registry.peers.get(&target).cloned()
        };
        match core {
            Some(core) => Ok(core.dispatch(message)),
            None => Err(Error::PeerUnreachable {
                peer: target,
                reason: "not registered".into(),
            }),
        }
    }
}
