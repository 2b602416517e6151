//! The sync driver: peer table, session deduplication, periodic drive,
//! allow-listing, and counters.
//!
//! The service owns no sockets. Hosts provide a [`Connector`] for dialing and
//! feed accepted streams in through the channel passed to
//! [`start`](SyncService::start); discovery and listening stay outside the
//! core.

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::codec::CodecError;
use crate::net::{self, ConnectError, SessionId, StateProvider, SyncOutcome};

/// Hard wall-clock deadline for one whole sync session (dial + exchange).
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// How often the periodic driver kicks off a sync per peer.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Opaque peer identifier, as issued by the host's transport.
///
/// Ordering is lexicographic; ties between head-to-head sessions are broken
/// on it.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps a transport-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(s.to_owned()))
    }
}

/// Dials peers on behalf of the service. Implemented by the host transport;
/// tests use an in-memory mesh.
pub trait Connector: Send + Sync + 'static {
    /// The bidirectional byte stream the transport yields.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a fresh stream to `peer`.
    fn connect(&self, peer: &PeerId) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Optional set of trusted peers.
///
/// In strict mode the responder drops streams from peers not on the list;
/// otherwise the list is advisory. Optionally persisted as a JSON array.
#[derive(Debug, Default)]
pub struct Allowlist {
    peers: Mutex<BTreeSet<PeerId>>,
    path: Option<PathBuf>,
    strict: bool,
}

impl Allowlist {
    /// An empty, unpersisted allowlist.
    pub fn new(strict: bool) -> Self {
        Allowlist {
            strict,
            ..Default::default()
        }
    }

    /// Loads the list from a JSON file, treating a missing file as empty.
    /// The file is rewritten on every [`add`](Allowlist::add).
    pub fn load(path: impl AsRef<Path>, strict: bool) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let peers = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<BTreeSet<PeerId>>(&bytes)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => return Err(err),
        };
        Ok(Allowlist {
            peers: Mutex::new(peers),
            path: Some(path),
            strict,
        })
    }

    /// Adds a trusted peer, persisting the list if it is file-backed.
    pub fn add(&self, peer: PeerId) -> io::Result<()> {
        let snapshot = {
            let mut peers = self.peers.lock();
            peers.insert(peer);
            peers.clone()
        };
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&snapshot)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    /// Whether an inbound stream from `peer` may proceed.
    pub fn permits(&self, peer: &PeerId) -> bool {
        !self.strict || self.peers.lock().contains(peer)
    }

    /// Number of listed peers.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// True if no peer is listed.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

/// Atomic sync counters, per service instance.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl SyncMetrics {
    /// Reads all counters at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Sessions started, including deduplicated ones.
    pub attempts: u64,
    /// Sessions that completed their exchange.
    pub successes: u64,
    /// Sessions that failed or timed out.
    pub failures: u64,
}

/// Service configuration.
#[derive(Debug)]
pub struct SyncConfig {
    /// Interval of the periodic driver.
    pub sync_interval: Duration,
    /// Optional trusted-peer set checked on inbound streams.
    pub allowlist: Option<Allowlist>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            allowlist: None,
        }
    }
}

/// Drives pairwise syncs against a table of known peers.
#[derive(Debug)]
pub struct SyncService<C: Connector> {
    inner: Arc<Inner<C>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Inner<C: Connector> {
    local_id: PeerId,
    connector: C,
    provider: Arc<dyn StateProvider>,
    config: SyncConfig,
    peers: Mutex<BTreeSet<PeerId>>,
    active: Mutex<BTreeSet<PeerId>>,
    metrics: SyncMetrics,
    cancel: CancellationToken,
}

/// Removes the peer from the active-session set when the session ends, on
/// every exit path.
struct ActiveGuard<'a, C: Connector> {
    inner: &'a Inner<C>,
    peer: &'a PeerId,
}

impl<C: Connector> Drop for ActiveGuard<'_, C> {
    fn drop(&mut self) {
        self.inner.active.lock().remove(self.peer);
    }
}

impl<C: Connector> SyncService<C> {
    /// Creates a stopped service.
    pub fn new(
        local_id: PeerId,
        connector: C,
        provider: Arc<dyn StateProvider>,
        config: SyncConfig,
    ) -> Self {
        SyncService {
            inner: Arc::new(Inner {
                local_id,
                connector,
                provider,
                config,
                peers: Mutex::default(),
                active: Mutex::default(),
                metrics: SyncMetrics::default(),
                cancel: CancellationToken::new(),
            }),
            tasks: Mutex::default(),
        }
    }

    /// The identifier this service presents to peers.
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    /// Spawns the accept loop over `inbound` and the periodic driver.
    pub fn start(&self, inbound: flume::Receiver<(PeerId, C::Stream)>) {
        let mut tasks = self.tasks.lock();
        let accept = {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.accept_loop(inbound).await })
        };
        let drive = {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.drive().await })
        };
        tasks.push(accept);
        tasks.push(drive);
    }

    /// Cancels the background tasks and waits for them to finish. In-flight
    /// sessions are bounded by their own deadlines.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Adds a peer to the table driven by the periodic loop.
    pub fn add_peer(&self, peer: PeerId) {
        self.inner.peers.lock().insert(peer);
    }

    /// Removes a peer from the table.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.inner.peers.lock().remove(peer);
    }

    /// The currently known peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.lock().iter().cloned().collect()
    }

    /// Runs one sync attempt against `peer` now.
    ///
    /// If a session with this peer is already in flight the attempt is
    /// suppressed and reported as success: the running session will carry the
    /// data.
    pub async fn sync_with(&self, peer: &PeerId) -> Result<SyncOutcome, ConnectError> {
        self.inner.sync_with(peer).await
    }

    /// Hands an accepted inbound stream to the responder.
    pub async fn handle_incoming(&self, peer: PeerId, stream: C::Stream) {
        self.inner.handle_incoming(peer, stream).await
    }

    /// Reads the session counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl<C: Connector> Inner<C> {
    async fn sync_with(&self, peer: &PeerId) -> Result<SyncOutcome, ConnectError> {
        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

        if !self.active.lock().insert(peer.clone()) {
            debug!(%peer, "sync already in flight, suppressing duplicate session");
            return Ok(SyncOutcome::Unchanged);
        }
        let _guard = ActiveGuard { inner: self, peer };

        let session = SessionId::generate();
        debug!(%peer, %session, "sync[dial]: start");
        let result = tokio::time::timeout(SESSION_TIMEOUT, async {
            let stream = self
                .connector
                .connect(peer)
                .await
                .map_err(|err| ConnectError::Codec(CodecError::Io(err)))?;
            net::run_initiator(stream, self.provider.as_ref(), session.clone()).await
        })
        .await
        .unwrap_or(Err(ConnectError::Timeout));

        match &result {
            Ok(outcome) => {
                self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                debug!(%peer, %session, ?outcome, "sync[dial]: done");
            }
            Err(err) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                debug!(%peer, %session, ?err, "sync[dial]: failed");
            }
        }
        result
    }

    async fn handle_incoming(&self, peer: PeerId, stream: C::Stream) {
        if let Some(allowlist) = &self.config.allowlist {
            if !allowlist.permits(&peer) {
                warn!(%peer, "rejected stream from peer not on the allowlist");
                return;
            }
        }
        // Head-to-head collision: both sides initiated at once. The peer
        // with the greater id keeps its initiator role; the other side's
        // inbound stream proceeds instead.
        if self.local_id > peer && self.active.lock().contains(&peer) {
            debug!(%peer, "dropping inbound stream, local session wins the tie-break");
            return;
        }

        match net::run_responder(stream, self.provider.as_ref()).await {
            Ok(outcome) => debug!(%peer, ?outcome, "sync[accept]: done"),
            Err(err) => warn!(%peer, ?err, "sync[accept]: failed"),
        }
    }

    async fn accept_loop(self: Arc<Self>, inbound: flume::Receiver<(PeerId, C::Stream)>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                incoming = inbound.recv_async() => {
                    let Ok((peer, stream)) = incoming else { break };
                    let inner = self.clone();
                    tokio::spawn(async move { inner.handle_incoming(peer, stream).await });
                }
            }
        }
    }

    async fn drive(self: Arc<Self>) {
        let period = self.config.sync_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let peers: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
                    for peer in peers {
                        let inner = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = inner.sync_with(&peer).await {
                                warn!(%peer, ?err, "periodic sync failed");
                            }
                        });
                    }
                }
            }
        }
    }
}
