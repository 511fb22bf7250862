//! Simulated swarm participant.
//!
//! A node owns its block store and two bandwidth ledgers, lends upload
//! capacity to peers through the two-phase block protocol, and runs a
//! download loop that feeds jobs into a bounded worker pool until every block
//! is complete or the node is disposed.

pub mod bandwidth;
pub mod blocks;
pub mod handle;
pub mod pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use bandwidth::{BandwidthLedger, ReservationKey};
pub use blocks::{BlockState, BlockStore};
pub use handle::{BlockGrant, NodeStatus, PeerHandle, TransportError};
pub use pool::{PoolError, WorkerPool};

use crate::config::{ReservationPolicy, SwarmConfig};
use crate::directory::Directory;
use crate::events::{EventBus, ManagerEvent, NodeEvent, Subscription};
use crate::manager::ManagerHandle;
use crate::timing::{self, TransferSchedule};

/// Parameters fixed at node creation.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    /// Maximum upload rate in bytes per second
    pub max_upload: f64,
    /// Maximum download rate in bytes per second
    pub max_download: f64,
    pub is_seed: bool,
    pub rng_seed: u64,
}

impl NodeSpec {
    pub fn seed(name: impl Into<String>, max_upload: f64, max_download: f64) -> Self {
        Self {
            name: name.into(),
            max_upload,
            max_download,
            is_seed: true,
            rng_seed: rand::random(),
        }
    }

    pub fn peer(name: impl Into<String>, max_upload: f64, max_download: f64) -> Self {
        Self {
            is_seed: false,
            ..Self::seed(name, max_upload, max_download)
        }
    }

    pub fn with_rng_seed(mut self, rng_seed: u64) -> Self {
        self.rng_seed = rng_seed;
        self
    }
}

/// Derives a per-node RNG seed.
///
/// With a base seed the result depends only on (base, ordinal), so every
/// node's selection sequence is reproducible; without one it is random.
pub fn node_rng_seed(base: Option<u64>, ordinal: u64) -> u64 {
    match base {
        Some(base) => base ^ ordinal.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        None => rand::random(),
    }
}

/// A negotiated transfer with its download-side reservation already held.
struct Candidate {
    peer: Arc<dyn PeerHandle>,
    key: ReservationKey,
    bandwidth: f64,
}

#[derive(Default)]
struct NodeTasks {
    download_loop: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// Swarm participant.
pub struct Node {
    name: String,
    block_size: u64,
    time_dilation: f64,
    max_selection_attempts: u32,
    retry_backoff: (Duration, Duration),
    dispose_grace: Duration,
    policy: ReservationPolicy,
    blocks: BlockStore,
    upload: BandwidthLedger,
    download: BandwidthLedger,
    peers: RwLock<IndexMap<String, Arc<dyn PeerHandle>>>,
    rng: Mutex<ChaCha8Rng>,
    // Held across peer calls, so it must be an async mutex.
    negotiation: tokio::sync::Mutex<()>,
    seed: AtomicBool,
    disposed: AtomicBool,
    // Fired once on dispose to cut in-flight transfer steps short.
    stop: Notify,
    started: Instant,
    finished: Mutex<Option<Instant>>,
    events: EventBus<NodeEvent>,
    pool: WorkerPool,
    manager: Arc<dyn ManagerHandle>,
    tasks: Mutex<NodeTasks>,
}

impl Node {
    /// Creates a node, registers it with the manager bound under
    /// `manager_name`, and starts its download loop unless it is a seed.
    ///
    /// # Errors
    /// - `SwarmError::Configuration` - `config` fails validation
    /// - `SwarmError::Registry` - No manager is bound under `manager_name`,
    ///   another node holds the same name, or the manager is unreachable
    pub async fn join(
        spec: NodeSpec,
        config: &SwarmConfig,
        directory: &Directory<dyn ManagerHandle>,
        manager_name: &str,
    ) -> crate::Result<Arc<Self>> {
        config.validate()?;
        let manager = directory.lookup(manager_name)?;
        let block_count = config.file.block_count();
        let now = Instant::now();

        let node = Arc::new(Self {
            name: spec.name,
            block_size: config.file.block_size,
            time_dilation: config.simulation.time_dilation,
            max_selection_attempts: config.simulation.max_selection_attempts,
            retry_backoff: (
                config.simulation.retry_backoff_min,
                config.simulation.retry_backoff_max,
            ),
            dispose_grace: config.simulation.dispose_grace,
            policy: config.reservation.clone(),
            blocks: if spec.is_seed {
                BlockStore::complete(block_count)
            } else {
                BlockStore::empty(block_count)
            },
            upload: BandwidthLedger::new(spec.max_upload),
            download: BandwidthLedger::new(spec.max_download),
            peers: RwLock::new(IndexMap::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(spec.rng_seed)),
            negotiation: tokio::sync::Mutex::new(()),
            seed: AtomicBool::new(spec.is_seed),
            disposed: AtomicBool::new(false),
            stop: Notify::new(),
            started: now,
            finished: Mutex::new(spec.is_seed.then_some(now)),
            events: EventBus::new(config.simulation.event_buffer),
            pool: WorkerPool::new(config.simulation.worker_pool_size),
            manager,
            tasks: Mutex::new(NodeTasks::default()),
        });

        // Subscribe first so no population change between registration and
        // the initial listing is missed.
        let population = node.manager.subscribe().await?;
        node.manager
            .register_node(Arc::clone(&node) as Arc<dyn PeerHandle>)
            .await?;

        for peer in node.manager.nodes().await? {
            node.learn_peer(peer);
        }

        let listener = Self::spawn_listener(&node, population);
        let download_loop = (!spec.is_seed).then(|| tokio::spawn(Arc::clone(&node).run()));
        {
            let mut tasks = node.tasks.lock();
            tasks.listener = Some(listener);
            tasks.download_loop = download_loop;
        }

        tracing::info!(
            "Node {} joined: seed={}, up={:.0} B/s, down={:.0} B/s, {} workers, {} peers",
            node.name,
            spec.is_seed,
            spec.max_upload,
            spec.max_download,
            node.pool.size(),
            node.known_peers().len()
        );
        Ok(node)
    }

    fn spawn_listener(
        node: &Arc<Self>,
        mut population: Subscription<ManagerEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(node);
        tokio::spawn(async move {
            while let Some(delivery) = population.recv().await {
                let Some(node) = weak.upgrade() else {
                    break;
                };
                node.apply_population_event(delivery.event);
            }
        })
    }

    fn apply_population_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::NodeAdded { node, .. } => self.learn_peer(node),
            ManagerEvent::NodeRemoved { name } => self.forget_peer(&name),
        }
    }

    fn learn_peer(&self, peer: Arc<dyn PeerHandle>) {
        if peer.name() == self.name || self.is_disposed() {
            return;
        }
        self.peers.write().insert(peer.name().to_string(), peer);
    }

    fn forget_peer(&self, name: &str) {
        if self.peers.write().shift_remove(name).is_some() {
            tracing::debug!("{}: forgot peer {}", self.name, name);
        }
    }

    /// Names of the peers this node currently knows, excluding itself.
    pub fn known_peers(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    // Download side

    async fn run(self: Arc<Self>) {
        tracing::debug!("{}: download loop started", self.name);
        while !self.is_disposed() && !self.is_seed() {
            let job = Arc::clone(&self).download_round();
            if self.pool.submit(job).await.is_err() {
                break;
            }
        }
        tracing::debug!("{}: download loop stopped", self.name);
    }

    async fn download_round(self: Arc<Self>) {
        if self.is_disposed() || self.is_seed() {
            return;
        }
        match self.select_candidate().await {
            Some(candidate) => {
                self.transfer(candidate).await;
                self.check_seed_status().await;
            }
            None => self.back_off().await,
        }
    }

    /// Finds a (block, peer) pair that grants bandwidth and reserves the
    /// grant against this node's download capacity.
    ///
    /// The block is claimed locally before asking, and released again on any
    /// refusal. Peers are offered only the download capacity still available,
    /// so concurrent transfers never exceed the node's maximum. Gives up after
    /// `max_selection_attempts` tries or once no capacity is left.
    async fn select_candidate(&self) -> Option<Candidate> {
        let _turn = self.negotiation.lock().await;

        for _ in 0..self.max_selection_attempts {
            if self.is_disposed() {
                return None;
            }

            let capacity = self.download.available();
            if capacity <= 0.0 {
                tracing::trace!("{}: download capacity exhausted", self.name);
                return None;
            }

            let block = {
                let mut rng = self.rng.lock();
                self.blocks.claim_missing(&mut *rng)
            }?;

            let Some(peer) = self.random_peer() else {
                self.blocks.clear(block);
                return None;
            };

            let grant = match peer.request_block(&self.name, block, capacity).await {
                Ok(grant) => grant,
                Err(e) => {
                    tracing::warn!("{}: peer {} unreachable: {}", self.name, peer.name(), e);
                    self.blocks.clear(block);
                    self.forget_peer(peer.name());
                    continue;
                }
            };
            let Some(bandwidth) = grant.bandwidth() else {
                self.blocks.clear(block);
                continue;
            };

            let key = ReservationKey::new(peer.name(), block);
            if self.download.reserve(key.clone(), bandwidth) {
                return Some(Candidate {
                    peer,
                    key,
                    bandwidth,
                });
            }

            tracing::debug!(
                "{}: grant of {:.0} B/s for {} does not fit, returning it",
                self.name,
                bandwidth,
                key
            );
            self.return_grant(&peer, block).await;
            self.blocks.clear(block);
        }

        tracing::debug!(
            "{}: no candidate after {} attempts, {} blocks missing",
            self.name,
            self.max_selection_attempts,
            self.blocks.missing_count()
        );
        None
    }

    /// Finalizes a grant on the lending peer, forgetting it if unreachable.
    async fn return_grant(&self, peer: &Arc<dyn PeerHandle>, block: u32) {
        if let Err(e) = peer.finalize_block(&self.name, block).await {
            tracing::warn!("{}: finalize on {} failed: {}", self.name, peer.name(), e);
            self.forget_peer(peer.name());
        }
    }

    fn random_peer(&self) -> Option<Arc<dyn PeerHandle>> {
        let peers = self.peers.read();
        if peers.is_empty() {
            return None;
        }
        let index = self.rng.lock().random_range(0..peers.len());
        peers.get_index(index).map(|(_, peer)| Arc::clone(peer))
    }

    async fn transfer(&self, candidate: Candidate) {
        let Candidate {
            peer,
            key,
            bandwidth,
        } = candidate;
        let block = key.block;

        let schedule = TransferSchedule::for_block(self.block_size, bandwidth, self.time_dilation);
        tracing::debug!(
            "{}: block {} from {} at {:.0} B/s, {} steps of {:?}",
            self.name,
            block,
            peer.name(),
            bandwidth,
            schedule.increments(),
            schedule.step()
        );

        self.blocks.set_progress(block, 0.0);
        let increment = schedule.increment_value();
        for step in 1..=schedule.increments() {
            // Created before the flag check so a concurrent dispose is not missed.
            let stopped = self.stop.notified();
            if self.is_disposed() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(schedule.step()) => {}
                _ = stopped => break,
            }
            if step == schedule.increments() {
                self.blocks.mark_complete(block);
            } else {
                self.blocks.set_progress(block, f64::from(step) * increment);
            }
        }

        self.download.release(&key);
        self.events.publish(NodeEvent {
            name: self.name.clone(),
            progress: self.progress(),
        });

        self.return_grant(&peer, block).await;
        // Second release is a no-op once the key is gone.
        self.download.release(&key);

        if !self.blocks.is_complete(block) {
            tracing::debug!("{}: block {} incomplete, returning it", self.name, block);
            self.blocks.clear(block);
        }
    }

    async fn check_seed_status(self: &Arc<Self>) {
        if !self.blocks.all_complete() {
            return;
        }
        {
            let mut finished = self.finished.lock();
            if finished.is_some() {
                return;
            }
            *finished = Some(Instant::now());
        }
        self.seed.store(true, Ordering::Release);

        tracing::info!(
            "{} became a seed after {} simulated ms",
            self.name,
            self.transfer_time_ms()
        );
        if let Err(e) = self
            .manager
            .add_seed(Arc::clone(self) as Arc<dyn PeerHandle>)
            .await
        {
            tracing::warn!("{}: seed promotion failed: {}", self.name, e);
        }
    }

    async fn back_off(&self) {
        let (min, max) = self.retry_backoff;
        let pause = if max > min {
            let nanos = {
                let mut rng = self.rng.lock();
                rng.random_range(min.as_nanos() as u64..=max.as_nanos() as u64)
            };
            Duration::from_nanos(nanos)
        } else {
            min
        };
        tokio::time::sleep(pause).await;
    }

    // Upload side

    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Unavailable {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn grant_block(&self, requester: &str, index: u32, max_download: f64) -> BlockGrant {
        if !self.blocks.is_complete(index) {
            return BlockGrant::NotHeld;
        }
        match self
            .upload
            .grant(ReservationKey::new(requester, index), max_download, &self.policy)
        {
            Some(bandwidth) => {
                tracing::debug!(
                    "{}: lent {:.0} B/s to {} for block {}",
                    self.name,
                    bandwidth,
                    requester,
                    index
                );
                BlockGrant::Granted(bandwidth)
            }
            None => BlockGrant::Refused,
        }
    }

    // Status

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_seed(&self) -> bool {
        self.seed.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.block_count()
    }

    pub fn max_upload_rate(&self) -> f64 {
        self.upload.maximum()
    }

    pub fn max_download_rate(&self) -> f64 {
        self.download.maximum()
    }

    pub fn available_upload_rate(&self) -> f64 {
        self.upload.available()
    }

    pub fn available_download_rate(&self) -> f64 {
        self.download.available()
    }

    pub fn current_upload_rate(&self) -> f64 {
        self.upload.in_use()
    }

    pub fn current_download_rate(&self) -> f64 {
        self.download.in_use()
    }

    /// Reservations lent to peers and not yet finalized.
    pub fn upload_count(&self) -> usize {
        self.upload.open_reservations()
    }

    /// Reservations borrowed from peers for transfers under way.
    pub fn download_count(&self) -> usize {
        self.download.open_reservations()
    }

    /// Bandwidth this node currently lends to `peer`.
    pub fn lent_to(&self, peer: &str) -> f64 {
        self.upload.reserved_for(peer)
    }

    /// Completion value of one block, `-1` when missing.
    pub fn block_completion(&self, index: u32) -> f64 {
        self.blocks.completion(index)
    }

    pub fn progress(&self) -> f64 {
        self.blocks.progress()
    }

    /// Simulated milliseconds between start and completion, or until now
    /// while still downloading.
    pub fn transfer_time_ms(&self) -> u64 {
        let end = self.finished.lock().unwrap_or_else(Instant::now);
        timing::simulated_millis(end.saturating_duration_since(self.started), self.time_dilation)
    }

    pub fn estimated_time_ms(&self) -> Option<u64> {
        timing::estimated_millis(self.transfer_time_ms(), self.progress())
    }

    pub fn snapshot(&self) -> NodeStatus {
        NodeStatus {
            name: self.name.clone(),
            is_seed: self.is_seed(),
            block_size: self.block_size,
            block_count: self.block_count(),
            max_upload_rate: self.max_upload_rate(),
            max_download_rate: self.max_download_rate(),
            current_upload_rate: self.current_upload_rate(),
            current_download_rate: self.current_download_rate(),
            available_upload_rate: self.available_upload_rate(),
            available_download_rate: self.available_download_rate(),
            upload_count: self.upload_count(),
            download_count: self.download_count(),
            progress: self.progress(),
            transfer_time_ms: self.transfer_time_ms(),
            estimated_time_ms: self.estimated_time_ms(),
            blocks: self.blocks.snapshot(),
        }
    }

    pub fn subscribe_progress(&self) -> Subscription<NodeEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_progress_with_lease(&self, ttl: Duration) -> Subscription<NodeEvent> {
        self.events.subscribe_with_lease(ttl)
    }

    /// Stops the node: no new jobs start, running jobs drain, then the node
    /// leaves the manager. Repeated calls return immediately.
    pub async fn dispose(&self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Disposing node {}", self.name);
        self.stop.notify_waiters();

        tokio::time::sleep(self.dispose_grace).await;
        self.pool.shutdown().await;

        let download_loop = self.tasks.lock().download_loop.take();
        if let Some(download_loop) = download_loop {
            if let Err(e) = download_loop.await {
                tracing::warn!("{}: download loop ended abnormally: {}", self.name, e);
            }
        }

        if let Err(e) = self.manager.deregister_node(&self.name).await {
            tracing::warn!("{}: deregistration failed: {}", self.name, e);
        }

        let listener = self.tasks.lock().listener.take();
        if let Some(listener) = listener {
            listener.abort();
        }
        self.peers.write().clear();
    }
}

#[async_trait]
impl PeerHandle for Node {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request_block(
        &self,
        requester: &str,
        index: u32,
        max_download: f64,
    ) -> Result<BlockGrant, TransportError> {
        self.ensure_live()?;
        Ok(self.grant_block(requester, index, max_download))
    }

    async fn finalize_block(&self, requester: &str, index: u32) -> Result<(), TransportError> {
        self.ensure_live()?;
        self.upload.release(&ReservationKey::new(requester, index));
        Ok(())
    }

    async fn is_seed(&self) -> Result<bool, TransportError> {
        self.ensure_live()?;
        Ok(Node::is_seed(self))
    }

    async fn transfer_time_ms(&self) -> Result<u64, TransportError> {
        self.ensure_live()?;
        Ok(Node::transfer_time_ms(self))
    }

    async fn current_download_rate(&self) -> Result<f64, TransportError> {
        self.ensure_live()?;
        Ok(Node::current_download_rate(self))
    }

    async fn status(&self) -> Result<NodeStatus, TransportError> {
        self.ensure_live()?;
        Ok(self.snapshot())
    }

    async fn subscribe(&self) -> Result<Subscription<NodeEvent>, TransportError> {
        self.ensure_live()?;
        Ok(self.subscribe_progress())
    }

    async fn dispose(&self) -> Result<(), TransportError> {
        self.teardown().await;
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("seed", &self.is_seed())
            .field("disposed", &self.is_disposed())
            .field("progress", &self.progress())
            .finish()
    }
}
