//! The store: shared state and the threads that drive region peers.
//!
//! Scheduling model is single-writer per region. Every peer owns one event
//! loop thread; the loop drains a batch of [`PeerMsg`]s from its mailbox,
//! dispatches each through [`PeerMsgHandler`], then runs the Ready cycle
//! once for the batch. Regions never share mutable state directly — the
//! store-wide region map sits behind its own mutex, tick scheduling goes
//! through a bounded queue, and routing through the [`Router`].

mod peer;
mod peer_msg_handler;
mod peer_storage;
mod transport;

pub use peer::{Peer, Proposal};
pub use peer_msg_handler::PeerMsgHandler;
pub use peer_storage::{ApplySnapResult, Engines, PeerStorage, RaftDb};
pub use transport::{ChannelTransport, Transport};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::config::Config;
use crate::msg::PeerMsg;
use crate::region::Region;

/// Store-wide map of hosted regions, updated on membership changes and
/// snapshot installs. Never hold the lock across engine IO.
#[derive(Debug, Default)]
pub struct StoreMeta {
    pub regions: HashMap<u64, Region>,
}

/// Bounded queue of region ids due for a tick. Decouples the regions that
/// want ticks from the driver thread that delivers them; a full queue drops
/// the push, the next tick re-arms the region.
#[derive(Clone)]
pub struct TickQueue {
    tx: Sender<u64>,
}

impl TickQueue {
    pub fn new(capacity: usize) -> (TickQueue, Receiver<u64>) {
        let (tx, rx) = channel::bounded(capacity);
        (TickQueue { tx }, rx)
    }

    pub fn push(&self, region_id: u64) {
        match self.tx.try_send(region_id) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(region = region_id, "tick queue full, dropping tick");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Routes messages to region mailboxes.
#[derive(Clone, Default)]
pub struct Router {
    mailboxes: Arc<Mutex<HashMap<u64, Sender<PeerMsg>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, region_id: u64, tx: Sender<PeerMsg>) {
        self.mailboxes.lock().unwrap().insert(region_id, tx);
    }

    pub fn deregister(&self, region_id: u64) {
        self.mailboxes.lock().unwrap().remove(&region_id);
    }

    /// Deliver a message; returns whether the region had a live mailbox.
    pub fn send(&self, region_id: u64, msg: PeerMsg) -> bool {
        let tx = self.mailboxes.lock().unwrap().get(&region_id).cloned();
        match tx {
            Some(tx) => tx.send(msg).is_ok(),
            None => {
                tracing::debug!(region = region_id, "no mailbox for region, dropping message");
                false
            }
        }
    }
}

/// Shared context handed to every region handler.
pub struct StoreContext<T: Transport> {
    pub cfg: Config,
    pub store_meta: Arc<Mutex<StoreMeta>>,
    pub tick_queue: TickQueue,
    pub trans: T,
}

/// A running store: spawns one event-loop thread per region plus the tick
/// driver.
pub struct RaftStore<T: Transport + Clone + 'static> {
    ctx: Arc<StoreContext<T>>,
    router: Router,
    tick_rx: Option<Receiver<u64>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<T: Transport + Clone + 'static> RaftStore<T> {
    pub fn new(cfg: Config, trans: T) -> crate::error::Result<Self> {
        cfg.validate()?;
        let (tick_queue, tick_rx) = TickQueue::new(cfg.tick_queue_capacity);
        let ctx = Arc::new(StoreContext {
            cfg,
            store_meta: Arc::new(Mutex::new(StoreMeta::default())),
            tick_queue,
            trans,
        });
        Ok(Self {
            ctx,
            router: Router::new(),
            tick_rx: Some(tick_rx),
            handles: Vec::new(),
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn context(&self) -> Arc<StoreContext<T>> {
        self.ctx.clone()
    }

    /// Spawn the event loop for one peer and bootstrap its tick schedule.
    pub fn spawn_peer(&mut self, peer: Peer) -> Sender<PeerMsg> {
        let region_id = peer.region_id();
        let (tx, rx) = channel::unbounded();
        self.router.register(region_id, tx.clone());
        self.ctx
            .store_meta
            .lock()
            .unwrap()
            .regions
            .insert(region_id, peer.region().clone());

        let ctx = self.ctx.clone();
        let router = self.router.clone();
        self.handles.push(thread::spawn(move || {
            run_peer_loop(peer, ctx, router, rx);
        }));
        let _ = tx.send(PeerMsg::Start);
        tx
    }

    /// Start delivering ticks. Call once after spawning the initial peers.
    pub fn start_ticker(&mut self) {
        let rx = match self.tick_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let router = self.router.clone();
        let interval = self.ctx.cfg.tick_interval;
        self.handles.push(thread::spawn(move || {
            run_tick_driver(rx, router, interval);
        }));
    }

    /// Drop all mailboxes and wait for the event loops and tick driver to
    /// exit. Mailbox senders still held by callers keep their loops alive.
    pub fn shutdown(self) {
        let RaftStore {
            ctx,
            router,
            tick_rx,
            handles,
        } = self;
        router.mailboxes.lock().unwrap().clear();
        // Release our tick-queue sender so the driver can observe
        // disconnection once the peer loops are gone.
        drop(ctx);
        drop(tick_rx);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// One region's event loop: drain a batch, dispatch it, run the Ready
/// cycle once per batch.
fn run_peer_loop<T: Transport>(
    mut peer: Peer,
    ctx: Arc<StoreContext<T>>,
    router: Router,
    rx: Receiver<PeerMsg>,
) {
    const BATCH_LIMIT: usize = 64;
    let region_id = peer.region_id();
    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        while batch.len() < BATCH_LIMIT {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        let mut handler = PeerMsgHandler::new(&mut peer, &ctx);
        for msg in batch {
            handler.handle_msg(msg);
        }
        handler.handle_raft_ready();
        if peer.stopped {
            break;
        }
    }
    router.deregister(region_id);
    tracing::info!(region = region_id, "peer event loop exited");
}

/// Delivers `PeerMsg::Tick` to every region that asked for one, once per
/// interval. Exits when every queue sender is gone.
fn run_tick_driver(rx: Receiver<u64>, router: Router, interval: Duration) {
    loop {
        thread::sleep(interval);
        let mut due = HashSet::new();
        let mut disconnected = false;
        loop {
            match rx.try_recv() {
                Ok(region_id) => {
                    due.insert(region_id);
                }
                Err(channel::TryRecvError::Empty) => break,
                Err(channel::TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }
        for region_id in due.drain() {
            router.send(region_id, PeerMsg::Tick);
        }
        if disconnected {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{RaftCmdRequest, Request, RequestHeader};
    use crate::msg::{Callback, RaftCommand};
    use crate::region::{PeerMeta, RegionEpoch};
    use std::time::Instant;

    #[test]
    fn test_tick_queue_drops_when_full() {
        let (queue, rx) = TickQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3); // dropped, no panic
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_router_unknown_region() {
        let router = Router::new();
        assert!(!router.send(1, PeerMsg::Tick));
    }

    fn single_peer_region() -> Region {
        Region {
            id: 1,
            start_key: Vec::new(),
            end_key: Vec::new(),
            epoch: RegionEpoch::default(),
            peers: vec![PeerMeta::new(1, 1)],
        }
    }

    /// End-to-end smoke test: a single-region store elects itself through
    /// the tick driver and serves a Put.
    #[test]
    fn test_single_region_store_serves_put() {
        let cfg = Config {
            tick_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let trans = ChannelTransport::new();
        let mut store = RaftStore::new(cfg.clone(), trans).unwrap();
        let engines = Engines::open_temporary().unwrap();
        let peer = Peer::new(&cfg, engines, single_peer_region(), 1).unwrap();
        let router = store.router();
        store.spawn_peer(peer);
        store.start_ticker();

        let header = RequestHeader {
            region_id: 1,
            peer: PeerMeta::new(1, 1),
            region_epoch: RegionEpoch::default(),
            term: 0,
        };
        let request = RaftCmdRequest::new(
            header,
            vec![Request::Put {
                cf: "default".into(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
        );

        // Keep proposing until the election settles and the put applies.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut served = false;
        while Instant::now() < deadline {
            let (cb, rx) = Callback::new();
            router.send(1, PeerMsg::RaftCommand(RaftCommand::new(request.clone(), cb)));
            match rx.blocking_recv() {
                Ok(Ok(_)) => {
                    served = true;
                    break;
                }
                _ => thread::sleep(Duration::from_millis(20)),
            }
        }
        assert!(served, "store never served the put");
        store.shutdown();
    }
}
