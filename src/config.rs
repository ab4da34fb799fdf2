use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;

use crate::order::PeerId;
use crate::{Error, Result};

/// Uniform duration range `[lower, upper]`.
///
/// `lower` is a floor fixed at construction, only `upper` moves afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceTime {
    lower: Duration,
    upper: Duration,
}

impl ServiceTime {
    pub const RESOURCE_FLOOR: Duration = Duration::from_secs(10);
    pub const PEER_FLOOR: Duration = Duration::from_secs(5);

    pub fn new(lower: Duration, upper: Duration) -> Result<Self> {
        if upper < lower {
            return Err(Error::InvalidConfig(format!(
                "service time {upper:?} below floor {lower:?}"
            )));
        }
        Ok(Self { lower, upper })
    }

    pub fn fixed(t: Duration) -> Self {
        Self { lower: t, upper: t }
    }

    pub fn lower(&self) -> Duration {
        self.lower
    }

    pub fn upper(&self) -> Duration {
        self.upper
    }

    pub fn set_upper(&mut self, upper: Duration) -> Result<()> {
        *self = Self::new(self.lower, upper)?;
        Ok(())
    }

    pub fn sample(&self) -> Duration {
        rand::thread_rng().gen_range(self.lower..=self.upper)
    }
}

/// Where every peer listens. Every participant must appear, including ourselves.
#[derive(Clone, Debug, Default)]
pub struct PeerMap(BTreeMap<PeerId, SocketAddr>);

impl PeerMap {
    pub fn new(addrs: impl IntoIterator<Item = (PeerId, SocketAddr)>) -> Self {
        Self(addrs.into_iter().collect())
    }

    pub fn addr(&self, id: PeerId) -> Result<SocketAddr> {
        self.0
            .get(&id)
            .copied()
            .ok_or_else(|| Error::InvalidConfig(format!("{id} missing from peer address map")))
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.0.keys().copied()
    }

    // Everyone except `id`, after checking `id` is a member
    pub fn others(&self, id: PeerId) -> Result<Vec<PeerId>> {
        self.addr(id)?;
        Ok(self.ids().filter(|&p| p != id).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, SocketAddr)> + '_ {
        self.0.iter().map(|(&id, &addr)| (id, addr))
    }
}
