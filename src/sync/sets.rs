use std::collections::BTreeSet;

use crate::order::PeerId;

/// Requesters we postponed while we had priority. Flushed on release.
#[derive(Debug, Default)]
pub struct DeferredQueue(BTreeSet<PeerId>);

impl DeferredQueue {
    pub fn defer(&mut self, id: PeerId) {
        self.0.insert(id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.0.contains(&id)
    }

    // Leaves the queue empty
    pub fn drain(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.0).into_iter().collect()
    }
}

/// Peers whose reply to our outstanding request has not arrived yet.
#[derive(Debug, Default)]
pub struct PendingSet(BTreeSet<PeerId>);

impl PendingSet {
    pub fn reset<I: IntoIterator<Item = PeerId>>(&mut self, ids: I) {
        self.0 = ids.into_iter().collect();
    }

    // false if we were not waiting on `id`
    pub fn remove(&mut self, id: PeerId) -> bool {
        self.0.remove(&id)
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
