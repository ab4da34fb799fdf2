use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::{DeferredQueue, PendingSet, ProcessState};
use crate::order::{LamportClock, LogicalClock, Message, PeerId, Timestamp};
use crate::{Error, Result};

/// Ricart–Agrawala distributed mutex, one instance per peer.
///
/// This is the protocol only: it never sends anything itself. Operations that
/// need messages delivered return them to the caller (see [`crate::peer::Peer`]),
/// and inbound messages are fed in through [`RicartAgrawala::dispatch`].
///
/// Requests are totally ordered by `(timestamp, sender id)`. A peer that is
/// `Held`, or `Wanting` with a smaller request, defers the other side's reply
/// until it releases.
pub struct RicartAgrawala {
    id: PeerId,
    peers: Vec<PeerId>,
    clock: LamportClock,
    inner: Mutex<Inner>,
    // Signalled whenever `pending` empties or the request is withdrawn
    granted: Condvar,
}

#[derive(Debug, Default)]
struct Inner {
    state: ProcessState,
    // Present iff state is Wanting or Held
    outstanding: Option<Message>,
    deferred: DeferredQueue,
    pending: PendingSet,
}

impl RicartAgrawala {
    pub fn new<I: IntoIterator<Item = PeerId>>(id: PeerId, peers: I) -> Self {
        Self {
            id,
            peers: peers.into_iter().filter(|&p| p != id).collect(),
            clock: LamportClock::default(),
            inner: Mutex::new(Inner::default()),
            granted: Condvar::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn time(&self) -> Timestamp {
        self.clock.time()
    }

    pub fn outstanding(&self) -> Option<Message> {
        self.inner.lock().outstanding
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.lock().deferred.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Idle -> Wanting. Returns the request to broadcast to every peer.
    ///
    /// Everyone is marked pending before the first message leaves, so a reply
    /// that races ahead of its own synchronous response is never lost.
    pub fn begin_request(&self) -> Result<Message> {
        let mut inner = self.inner.lock();
        if inner.state != ProcessState::Idle {
            return Err(Error::ProtocolViolation {
                op: "request",
                state: inner.state,
            });
        }
        let request = Message::Request {
            sender_id: self.id,
            time: self.clock.tick(),
        };
        inner.outstanding = Some(request);
        inner.state = ProcessState::Wanting;
        inner.pending.reset(self.peers.iter().copied());
        info!("{} requesting at {}", self.id, request.time());
        Ok(request)
    }

    /// Grant now (returns the reply) or defer until we release (returns `None`).
    pub fn handle_request(&self, sender_id: PeerId, time: Timestamp) -> Option<Message> {
        let mut inner = self.inner.lock();
        self.clock.observe(time);

        let has_priority = match (inner.state, inner.outstanding) {
            (ProcessState::Held, _) => true,
            (ProcessState::Wanting, Some(own)) => (own.time(), self.id) < (time, sender_id),
            _ => false,
        };
        if has_priority {
            info!("{} deferring {sender_id}", self.id);
            inner.deferred.defer(sender_id);
            return None;
        }

        let reply = Message::Reply {
            sender_id: self.id,
            time: self.clock.tick(),
        };
        info!("{} granting {sender_id} at {}", self.id, reply.time());
        Some(reply)
    }

    pub fn handle_reply(&self, sender_id: PeerId, time: Timestamp) {
        let mut inner = self.inner.lock();
        self.clock.observe(time);

        if !inner.pending.remove(sender_id) {
            // Late grant for a request we already withdrew, or a duplicate
            warn!("{} ignoring unexpected reply from {sender_id}", self.id);
            return;
        }
        if inner.pending.is_empty() {
            self.granted.notify_all();
        }
    }

    pub fn dispatch(&self, message: Message) -> Option<Message> {
        debug!("{} received {message:?}", self.id);
        match message {
            Message::Request { sender_id, time } => self.handle_request(sender_id, time),
            Message::Reply { sender_id, time } => {
                self.handle_reply(sender_id, time);
                None
            }
        }
    }

    pub fn is_granted(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == ProcessState::Wanting && inner.pending.is_empty()
    }

    /// Blocks until every peer has replied, or `deadline` passes.
    ///
    /// Fails with `ProtocolViolation` if the request is withdrawn (or was
    /// never made) and with `Timeout` on the deadline. Neither changes state:
    /// the caller decides whether to withdraw.
    pub fn wait_granted(&self, deadline: Option<Instant>) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            if inner.state != ProcessState::Wanting {
                return Err(Error::ProtocolViolation {
                    op: "wait",
                    state: inner.state,
                });
            }
            if inner.pending.is_empty() {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.granted.wait_until(&mut inner, deadline).timed_out()
                        && !inner.pending.is_empty()
                    {
                        return Err(Error::Timeout);
                    }
                }
                None => self.granted.wait(&mut inner),
            }
        }
    }

    /// Wanting (all replies in) -> Held.
    pub fn enter(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ProcessState::Wanting || !inner.pending.is_empty() {
            return Err(Error::ProtocolViolation {
                op: "use",
                state: inner.state,
            });
        }
        inner.state = ProcessState::Held;
        Ok(())
    }

    /// Held or Wanting -> Idle.
    ///
    /// Returns one reply per deferred requester; the caller must deliver them.
    /// Releasing from `Wanting` withdraws the request: replies still in flight
    /// for it will be ignored if they arrive while idle, but are
    /// indistinguishable from grants for a later request.
    pub fn release(&self) -> Result<Vec<(PeerId, Message)>> {
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Idle {
            return Err(Error::ProtocolViolation {
                op: "release",
                state: inner.state,
            });
        }
        if inner.state == ProcessState::Wanting {
            if !inner.pending.is_empty() {
                info!("{} withdrawing request", self.id);
            }
            inner.pending.clear();
            self.granted.notify_all();
        }
        inner.state = ProcessState::Idle;
        inner.outstanding = None;

        let replies = inner
            .deferred
            .drain()
            .into_iter()
            .map(|to| {
                let reply = Message::Reply {
                    sender_id: self.id,
                    time: self.clock.tick(),
                };
                (to, reply)
            })
            .collect();
        Ok(replies)
    }
}
