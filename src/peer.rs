use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ServiceTime;
use crate::net::MessageBus;
use crate::order::{Message, PeerId, Timestamp};
use crate::sync::{ProcessState, Resource, RicartAgrawala, StopSignal};
use crate::{Error, Result};

/// A participant: the protocol state machine wired to a bus and the resource.
///
/// Inbound messages bypass this type entirely and go straight to
/// [`Peer::core`], so they are never blocked behind a pending request.
pub struct Peer<B, R> {
    core: Arc<RicartAgrawala>,
    bus: B,
    resource: R,
    // Pause between two requests of the background loop
    think_time: Mutex<ServiceTime>,
}

impl<B: MessageBus, R: Resource> Peer<B, R> {
    pub fn new(core: Arc<RicartAgrawala>, bus: B, resource: R) -> Self {
        Self {
            core,
            bus,
            resource,
            think_time: Mutex::new(ServiceTime::fixed(ServiceTime::PEER_FLOOR)),
        }
    }

    pub fn with_think_time(self, think_time: ServiceTime) -> Self {
        Self {
            think_time: Mutex::new(think_time),
            ..self
        }
    }

    pub fn core(&self) -> &Arc<RicartAgrawala> {
        &self.core
    }

    pub fn id(&self) -> PeerId {
        self.core.id()
    }

    pub fn state(&self) -> ProcessState {
        self.core.state()
    }

    pub fn time(&self) -> Timestamp {
        self.core.time()
    }

    pub fn think_time(&self) -> ServiceTime {
        *self.think_time.lock()
    }

    pub fn set_think_time(&self, t: Duration) -> Result<()> {
        self.think_time.lock().set_upper(t)?;
        info!("{} think time set to {t:?}", self.id());
        Ok(())
    }

    /// Broadcasts a request and blocks until every peer has granted it.
    ///
    /// If a peer cannot be reached the request is withdrawn, as on timeout,
    /// and the delivery error is returned. Nothing is retried.
    pub fn request_resource(&self) -> Result<()> {
        self.request(None)
    }

    /// Like [`Peer::request_resource`], but gives up at `deadline`.
    ///
    /// On timeout the request is withdrawn and everyone we deferred is granted.
    /// Peers that deferred us still owe a reply, which arrives late and is
    /// dropped while idle but could be mistaken for a grant of our next
    /// request. The algorithm has no way to tell them apart.
    pub fn request_resource_until(&self, deadline: Instant) -> Result<()> {
        self.request(Some(deadline))
    }

    fn request(&self, deadline: Option<Instant>) -> Result<()> {
        let request = self.core.begin_request()?;
        if let Err(e) = self.broadcast(request) {
            warn!("{} broadcast failed, withdrawing: {e}", self.id());
            if let Err(e) = self.release_resource() {
                warn!("{} withdraw failed: {e}", self.id());
            }
            return Err(e);
        }

        match self.core.wait_granted(deadline) {
            Err(Error::Timeout) => {
                warn!("{} gave up waiting for replies", self.id());
                self.release_resource()?;
                Err(Error::Timeout)
            }
            r => r,
        }
    }

    fn broadcast(&self, request: Message) -> Result<()> {
        for &p in self.core.peers() {
            match self.bus.send(request, p)? {
                Some(Message::Reply { sender_id, time }) => {
                    self.core.handle_reply(sender_id, time)
                }
                Some(other) => {
                    return Err(Error::Remote(format!(
                        "{p} answered a request with {other:?}"
                    )))
                }
                None => debug!("{} deferred by {p}", self.id()),
            }
        }
        Ok(())
    }

    /// Enters the critical section. Only valid once the request is granted.
    pub fn use_resource(&self) -> Result<()> {
        self.core.enter()?;
        info!("{} using resource", self.id());
        self.resource.use_resource()
    }

    /// Leaves the critical section (or withdraws the request) and sends the
    /// deferred replies.
    ///
    /// Every deferred peer is tried even if some are unreachable; the first
    /// delivery failure is returned.
    pub fn release_resource(&self) -> Result<()> {
        let replies = self.core.release()?;
        info!("{} freeing resource, {} deferred", self.id(), replies.len());
        let mut result = Ok(());
        for (to, reply) in replies {
            if let Err(e) = self.bus.send(reply, to) {
                warn!("{} could not grant {to}: {e}", self.id());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Requests the resource and returns a guard that releases it on drop.
    pub fn lock(&self) -> Result<PeerGuard<'_, B, R>> {
        self.request_resource()?;
        Ok(PeerGuard { peer: self })
    }

    /// Think, request, use, release; until `stop`.
    ///
    /// Errors end the current round only.
    pub fn run(&self, stop: &StopSignal) {
        info!("{} started", self.id());
        loop {
            let t = self.think_time.lock().sample();
            if stop.sleep(t) {
                break;
            }
            if let Err(e) = self.round() {
                warn!("{} round failed: {e}", self.id());
                if self.state() != ProcessState::Idle {
                    if let Err(e) = self.release_resource() {
                        warn!("{} withdraw failed: {e}", self.id());
                    }
                }
            }
        }
        info!("{} stopped", self.id());
    }

    fn round(&self) -> Result<()> {
        info!("{} requesting resource", self.id());
        let guard = self.lock()?;
        guard.use_resource()
    }
}

/// Proof that every peer has granted our request.
pub struct PeerGuard<'a, B: MessageBus, R: Resource> {
    peer: &'a Peer<B, R>,
}

impl<'a, B: MessageBus, R: Resource> PeerGuard<'a, B, R> {
    pub fn use_resource(&self) -> Result<()> {
        self.peer.use_resource()
    }
}

impl<'a, B: MessageBus, R: Resource> Drop for PeerGuard<'a, B, R> {
    fn drop(&mut self) {
        if let Err(e) = self.peer.release_resource() {
            warn!("{} release failed: {e}", self.peer.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ServiceTime;
    use crate::net::LocalBus;
    use crate::order::PeerId;
    use crate::peer::Peer;
    use crate::sync::{ProcessState, Resource, ResourceServer, RicartAgrawala, StopSignal};
    use crate::Error;
    use parking_lot::Mutex;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    type TestPeer<R> = Peer<LocalBus, Arc<R>>;

    fn cluster<R: Resource>(n: u32, resource: &Arc<R>) -> (LocalBus, Vec<Arc<TestPeer<R>>>) {
        let bus = LocalBus::default();
        let ps = (0..n)
            .map(|i| {
                let core = Arc::new(RicartAgrawala::new(PeerId(i), (0..n).map(PeerId)));
                bus.register(core.clone());
                Arc::new(Peer::new(core, bus.clone(), resource.clone()))
            })
            .collect();
        (bus, ps)
    }

    // Counts occupants instead of refusing them
    #[derive(Default)]
    struct Occupancy {
        inside: AtomicUsize,
        max_inside: AtomicUsize,
        entries: AtomicUsize,
    }
    impl Resource for Occupancy {
        fn use_resource(&self) -> crate::Result<()> {
            let n = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside.fetch_max(n, Ordering::SeqCst);
            self.entries.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn rand_timeout() {
        let mut rng = rand::thread_rng();
        let t = rng.gen_range(0..=10);
        std::thread::sleep(Duration::from_millis(t));
    }

    #[test]
    fn mutual_exclusion() {
        const N_PEERS: u32 = 4;
        const ROUNDS: usize = 20;
        let occupancy = Arc::new(Occupancy::default());
        let (_bus, ps) = cluster(N_PEERS, &occupancy);
        let held = Arc::new(AtomicUsize::new(0));

        let ths = ps
            .iter()
            .map(|p| {
                let p = p.clone();
                let held = held.clone();
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        rand_timeout();
                        let guard = p.lock().unwrap();
                        assert_eq!(held.fetch_add(1, Ordering::SeqCst), 0);
                        guard.use_resource().unwrap();
                        assert_eq!(p.state(), ProcessState::Held);
                        held.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();
        ths.into_iter().for_each(|th| th.join().unwrap());

        assert_eq!(occupancy.max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(
            occupancy.entries.load(Ordering::SeqCst),
            N_PEERS as usize * ROUNDS
        );
        for p in &ps {
            assert_eq!(p.state(), ProcessState::Idle);
            assert_eq!(p.core().deferred_len(), 0);
            assert_eq!(p.core().pending_len(), 0);
        }
    }

    #[test]
    fn resource_server_never_busy() {
        let resource = Arc::new(ResourceServer::new(
            ServiceTime::new(Duration::from_millis(1), Duration::from_millis(3)).unwrap(),
        ));
        let (_bus, ps) = cluster(3, &resource);
        let ths = ps
            .iter()
            .map(|p| {
                let p = p.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        rand_timeout();
                        p.request_resource().unwrap();
                        p.use_resource().unwrap();
                        p.release_resource().unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        ths.into_iter().for_each(|th| th.join().unwrap());
    }

    #[test]
    fn entry_follows_request_order() {
        const N_PEERS: u32 = 5;
        let occupancy = Arc::new(Occupancy::default());
        let (_bus, ps) = cluster(N_PEERS, &occupancy);
        let entered = Arc::new(Mutex::new(Vec::new()));

        let ths = ps
            .iter()
            .map(|p| {
                let p = p.clone();
                let entered = entered.clone();
                std::thread::spawn(move || {
                    rand_timeout();
                    let guard = p.lock().unwrap();
                    let own = p.core().outstanding().unwrap();
                    entered.lock().push((own.time(), own.sender_id()));
                    guard.use_resource().unwrap();
                })
            })
            .collect::<Vec<_>>();
        ths.into_iter().for_each(|th| th.join().unwrap());

        let entered = entered.lock();
        assert_eq!(entered.len(), N_PEERS as usize);
        assert!(entered.iter().zip(&entered[1..]).all(|(s, t)| s < t));
    }

    #[test]
    fn unreachable_peer_is_surfaced() {
        let occupancy = Arc::new(Occupancy::default());
        let (bus, ps) = cluster(3, &occupancy);
        bus.disconnect(PeerId(2));

        assert!(matches!(
            ps[0].request_resource(),
            Err(Error::PeerUnreachable { peer: PeerId(2), .. })
        ));
        // Withdrawn, not left hanging
        assert_eq!(ps[0].state(), ProcessState::Idle);
        assert_eq!(ps[0].core().outstanding(), None);
        assert!(matches!(
            ps[0].use_resource(),
            Err(Error::ProtocolViolation { .. })
        ));

        bus.reconnect(PeerId(2));
        ps[0].request_resource().unwrap();
        ps[0].use_resource().unwrap();
        ps[0].release_resource().unwrap();
    }

    #[test]
    fn failed_lock_does_not_block_others() {
        let occupancy = Arc::new(Occupancy::default());
        let (bus, ps) = cluster(3, &occupancy);
        bus.disconnect(PeerId(2));
        assert!(matches!(
            ps[0].lock(),
            Err(Error::PeerUnreachable { peer: PeerId(2), .. })
        ));
        bus.reconnect(PeerId(2));

        // P0 must not hold P1 off with a dead request
        let deadline = Instant::now() + Duration::from_millis(200);
        ps[1].request_resource_until(deadline).unwrap();
        ps[1].use_resource().unwrap();
        ps[1].release_resource().unwrap();
        assert_eq!(occupancy.entries.load(Ordering::SeqCst), 1);
        assert_eq!(ps[0].core().deferred_len(), 0);
    }

    #[test]
    fn request_deadline() {
        let occupancy = Arc::new(Occupancy::default());
        let (_bus, ps) = cluster(2, &occupancy);

        let guard = ps[1].lock().unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(
            ps[0].request_resource_until(deadline),
            Err(Error::Timeout)
        ));
        assert_eq!(ps[0].state(), ProcessState::Idle);
        assert_eq!(ps[1].core().deferred_len(), 1);

        // The late grant lands on an idle peer and changes nothing
        drop(guard);
        assert_eq!(ps[1].state(), ProcessState::Idle);
        assert_eq!(ps[0].state(), ProcessState::Idle);
        assert_eq!(ps[0].core().pending_len(), 0);
    }

    #[test]
    fn blocked_until_holder_releases() {
        let occupancy = Arc::new(Occupancy::default());
        let (_bus, ps) = cluster(3, &occupancy);

        let guard = ps[0].lock().unwrap();
        guard.use_resource().unwrap();
        let th = std::thread::spawn({
            let p = ps[1].clone();
            move || p.request_resource()
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!th.is_finished());
        assert_eq!(ps[1].state(), ProcessState::Wanting);

        drop(guard);
        th.join().unwrap().unwrap();
        ps[1].use_resource().unwrap();
        ps[1].release_resource().unwrap();
    }

    #[test]
    fn think_time_floor() {
        let occupancy = Arc::new(Occupancy::default());
        let (_bus, ps) = cluster(2, &occupancy);
        assert!(matches!(
            ps[0].set_think_time(Duration::from_secs(4)),
            Err(Error::InvalidConfig(_))
        ));
        ps[0].set_think_time(Duration::from_secs(8)).unwrap();
        assert_eq!(ps[0].think_time().upper(), Duration::from_secs(8));
    }

    #[test]
    fn background_loop() {
        let occupancy = Arc::new(Occupancy::default());
        let bus = LocalBus::default();
        let think = ServiceTime::new(Duration::from_millis(1), Duration::from_millis(5)).unwrap();
        let ps = (0..3)
            .map(|i| {
                let core = Arc::new(RicartAgrawala::new(PeerId(i), (0..3).map(PeerId)));
                bus.register(core.clone());
                Arc::new(Peer::new(core, bus.clone(), occupancy.clone()).with_think_time(think))
            })
            .collect::<Vec<_>>();
        let stop = Arc::new(StopSignal::default());

        let ths = ps
            .iter()
            .map(|p| {
                let p = p.clone();
                let stop = stop.clone();
                std::thread::spawn(move || p.run(&stop))
            })
            .collect::<Vec<_>>();
        std::thread::sleep(Duration::from_millis(200));
        stop.stop();
        ths.into_iter().for_each(|th| th.join().unwrap());

        assert!(occupancy.entries.load(Ordering::SeqCst) > 3);
        assert_eq!(occupancy.max_inside.load(Ordering::SeqCst), 1);
    }
}
