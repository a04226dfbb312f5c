//! Simulated peer sessions.
//!
//! Drives the processor the way a transfer client would: every session walks
//! through handshake, metadata exchange, piece negotiation and data transfer,
//! with faults injected from a seeded RNG so runs are reproducible.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    config::ConfigError,
    context::{ProcessingContext, TorrentId},
    event::ProcessingEvent,
    finalizer::ContextFinalizer,
    listener::{Listener, ListenerSource},
    stage::{ProcessingStage, StageRef, StageResult, TerminateOnError},
};

const PEER_PORT: u16 = 6881;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SimulationConfig {
    pub transfers: usize,
    pub pieces: u32,
    pub piece_length: u32,
    pub failure_rate: f64,
    pub cache_hit_rate: f64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            transfers: 16,
            pieces: 32,
            piece_length: 16 * 1024,
            failure_rate: 0.02,
            cache_hit_rate: 0.25,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, rate) in [
            ("failure-rate", self.failure_rate),
            ("cache-hit-rate", self.cache_hit_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {rate}"
                )));
            }
        }
        if self.pieces == 0 {
            return Err(ConfigError::Invalid("pieces must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {0} rejected the handshake")]
    HandshakeRejected(SocketAddr),
    #[error("peer {0} did not provide metadata")]
    MissingMetadata(SocketAddr),
    #[error("peer {peer} sent corrupted piece {piece}")]
    CorruptedPiece { peer: SocketAddr, piece: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Handshake,
    MetadataExchange,
    PieceNegotiation,
    DataTransfer,
    SeedCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub piece_count: u32,
    pub piece_length: u32,
}

/// State of one simulated peer connection.
pub struct PeerSession {
    index: usize,
    peer: SocketAddr,
    torrent_id: TorrentId,
    metadata: Option<Metadata>,
    wanted: Vec<u32>,
    transferred: u64,
    phases: Vec<Phase>,
    failure: Option<String>,
    failure_rate: f64,
    rng: SmallRng,
}

impl PeerSession {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn wanted(&self) -> &[u32] {
        &self.wanted
    }

    fn fault(&mut self) -> bool {
        self.rng.gen_bool(self.failure_rate)
    }
}

impl ProcessingContext for PeerSession {
    fn torrent_id(&self) -> Option<TorrentId> {
        Some(self.torrent_id)
    }

    fn record_failure(&mut self, _stage: &str, error: &anyhow::Error) {
        self.failure = Some(error.to_string());
    }
}

/// Summary published by the finalizer once a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub index: usize,
    pub peer: SocketAddr,
    pub phases: Vec<Phase>,
    pub transferred: u64,
    pub failure: Option<String>,
}

/// Peers currently holding an open connection. Shared by every run.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    open: Arc<DashMap<SocketAddr, TorrentId>>,
}

impl ConnectionTable {
    fn open(&self, peer: SocketAddr, torrent: TorrentId) {
        self.open.insert(peer, torrent);
    }

    fn close(&self, peer: &SocketAddr) -> bool {
        self.open.remove(peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[derive(Default)]
struct SwarmStats {
    finalized: AtomicUsize,
    bytes: AtomicU64,
    sessions: Mutex<Vec<SessionSummary>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub finalized: usize,
    pub bytes: u64,
    pub degraded: usize,
}

struct Handshake {
    connections: ConnectionTable,
    next: StageRef<PeerSession>,
}

impl ProcessingStage<PeerSession> for Handshake {
    fn name(&self) -> &str {
        "handshake"
    }

    fn after(&self) -> Option<ProcessingEvent> {
        Some(ProcessingEvent::HandshakeCompleted)
    }

    fn execute(&self, session: &mut PeerSession) -> StageResult<PeerSession> {
        session.phases.push(Phase::Handshake);
        if session.fault() {
            return Err(PeerError::HandshakeRejected(session.peer).into());
        }
        self.connections.open(session.peer, session.torrent_id);
        Ok(Some(self.next.clone()))
    }
}

struct MetadataExchange {
    metadata: Metadata,
    next: StageRef<PeerSession>,
}

impl ProcessingStage<PeerSession> for MetadataExchange {
    fn name(&self) -> &str {
        "metadata-exchange"
    }

    fn after(&self) -> Option<ProcessingEvent> {
        Some(ProcessingEvent::MetadataExchanged)
    }

    fn execute(&self, session: &mut PeerSession) -> StageResult<PeerSession> {
        session.phases.push(Phase::MetadataExchange);
        if session.fault() {
            return Err(PeerError::MissingMetadata(session.peer).into());
        }
        session.metadata = Some(self.metadata);
        Ok(Some(self.next.clone()))
    }
}

struct PieceNegotiation {
    next: StageRef<PeerSession>,
}

impl ProcessingStage<PeerSession> for PieceNegotiation {
    fn name(&self) -> &str {
        "piece-negotiation"
    }

    fn after(&self) -> Option<ProcessingEvent> {
        Some(ProcessingEvent::PiecesNegotiated)
    }

    fn execute(&self, session: &mut PeerSession) -> StageResult<PeerSession> {
        session.phases.push(Phase::PieceNegotiation);
        let metadata = session
            .metadata
            .ok_or(PeerError::MissingMetadata(session.peer))?;
        // the remote peer has roughly half of the pieces
        session.wanted = (0..metadata.piece_count)
            .filter(|_| session.rng.gen_bool(0.5))
            .collect();
        Ok(Some(self.next.clone()))
    }
}

struct DataTransfer;

impl ProcessingStage<PeerSession> for DataTransfer {
    fn name(&self) -> &str {
        "data-transfer"
    }

    fn after(&self) -> Option<ProcessingEvent> {
        Some(ProcessingEvent::DownloadComplete)
    }

    fn execute(&self, session: &mut PeerSession) -> StageResult<PeerSession> {
        session.phases.push(Phase::DataTransfer);
        let piece_length = session
            .metadata
            .map(|m| m.piece_length)
            .ok_or(PeerError::MissingMetadata(session.peer))?;
        for piece in session.wanted.clone() {
            if session.fault() {
                return Err(PeerError::CorruptedPiece {
                    peer: session.peer,
                    piece,
                }
                .into());
            }
            session.transferred += u64::from(piece_length);
        }
        Ok(None)
    }
}

struct SeedCheck;

impl ProcessingStage<PeerSession> for SeedCheck {
    fn name(&self) -> &str {
        "seed-check"
    }

    fn execute(&self, session: &mut PeerSession) -> StageResult<PeerSession> {
        session.phases.push(Phase::SeedCheck);
        Ok(None)
    }
}

/// A set of simulated sessions sharing one chain, listener source and
/// connection table.
pub struct Swarm {
    config: SimulationConfig,
    seed: u64,
    connections: ConnectionTable,
    stats: Arc<SwarmStats>,
    head: StageRef<PeerSession>,
    listeners: Arc<ListenerSource<PeerSession>>,
}

impl Swarm {
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(rand::random);
        let connections = ConnectionTable::default();

        let transfer: StageRef<PeerSession> = Arc::new(DataTransfer);
        let negotiation: StageRef<PeerSession> = Arc::new(PieceNegotiation {
            next: transfer.clone(),
        });
        // a peer without metadata is not worth failing the session for
        let metadata = TerminateOnError::new(Arc::new(MetadataExchange {
            metadata: Metadata {
                piece_count: config.pieces,
                piece_length: config.piece_length,
            },
            next: negotiation.clone(),
        }))
        .into_ref();
        let head: StageRef<PeerSession> = Arc::new(Handshake {
            connections: connections.clone(),
            next: metadata,
        });

        let mut listeners = ListenerSource::new();
        listeners
            .add_listener(
                ProcessingEvent::HandshakeCompleted,
                Listener::named("skip-known-metadata", move |session: &PeerSession, proposed| {
                    if session.metadata.is_some() {
                        Ok(Some(negotiation.clone()))
                    } else {
                        Ok(proposed.cloned())
                    }
                }),
            )
            .add_listener(
                ProcessingEvent::PiecesNegotiated,
                Listener::named("nothing-wanted", |session: &PeerSession, proposed| {
                    if session.wanted.is_empty() {
                        Ok(None)
                    } else {
                        Ok(proposed.cloned())
                    }
                }),
            )
            .add_listener(ProcessingEvent::DownloadComplete, {
                let seed_check: StageRef<PeerSession> = Arc::new(SeedCheck);
                Listener::named("seed-check", move |session: &PeerSession, proposed| {
                    match proposed {
                        None if session.transferred > 0 => Ok(Some(seed_check.clone())),
                        other => Ok(other.cloned()),
                    }
                })
            });

        tracing::debug!(seed, transfers = config.transfers, "simulated swarm ready");
        Ok(Self {
            config,
            seed,
            connections,
            stats: Arc::default(),
            head,
            listeners: Arc::new(listeners),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn chain_head(&self) -> StageRef<PeerSession> {
        self.head.clone()
    }

    pub fn listeners(&self) -> Arc<ListenerSource<PeerSession>> {
        self.listeners.clone()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Creates the context of the `index`-th session.
    pub fn session(&self, index: usize) -> PeerSession {
        let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let mut torrent = [0; TorrentId::LEN];
        rng.fill(&mut torrent);
        let metadata = rng.gen_bool(self.config.cache_hit_rate).then_some(Metadata {
            piece_count: self.config.pieces,
            piece_length: self.config.piece_length,
        });
        let host = u32::try_from(index).unwrap_or(u32::MAX) & 0x00ff_ffff;
        PeerSession {
            index,
            peer: SocketAddr::from((Ipv4Addr::from(0x0a00_0000 | host), PEER_PORT)),
            torrent_id: TorrentId::new(torrent),
            metadata,
            wanted: Vec::new(),
            transferred: 0,
            phases: Vec::new(),
            failure: None,
            failure_rate: self.config.failure_rate,
            rng,
        }
    }

    /// Closes the session's connection and publishes its summary.
    pub fn finalizer(&self) -> impl ContextFinalizer<PeerSession> {
        let connections = self.connections.clone();
        let stats = self.stats.clone();
        move |session: &mut PeerSession| -> anyhow::Result<()> {
            connections.close(&session.peer);
            stats.finalized.fetch_add(1, Ordering::SeqCst);
            stats.bytes.fetch_add(session.transferred, Ordering::SeqCst);
            stats.sessions.lock().push(SessionSummary {
                index: session.index,
                peer: session.peer,
                phases: std::mem::take(&mut session.phases),
                transferred: session.transferred,
                failure: session.failure.take(),
            });
            Ok(())
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            finalized: self.stats.finalized.load(Ordering::SeqCst),
            bytes: self.stats.bytes.load(Ordering::SeqCst),
            degraded: self
                .stats
                .sessions
                .lock()
                .iter()
                .filter(|s| s.failure.is_some())
                .count(),
        }
    }

    /// Summaries of all finalized sessions, ordered by session index.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut sessions = self.stats.sessions.lock().clone();
        sessions.sort_by_key(|s| s.index);
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{executor::GlobalExecutor, processor::ChainProcessor};

    fn config(failure_rate: f64, cache_hit_rate: f64) -> SimulationConfig {
        SimulationConfig {
            transfers: 4,
            pieces: 16,
            failure_rate,
            cache_hit_rate,
            seed: Some(42),
            ..Default::default()
        }
    }

    #[test]
    fn sessions_are_reproducible() {
        let a = Swarm::new(config(0.1, 0.5)).unwrap();
        let b = Swarm::new(config(0.1, 0.5)).unwrap();
        for i in 0..4 {
            let (sa, sb) = (a.session(i), b.session(i));
            assert_eq!(sa.torrent_id, sb.torrent_id);
            assert_eq!(sa.peer, sb.peer);
            assert_eq!(sa.metadata, sb.metadata);
        }
        assert_ne!(a.session(0).peer, a.session(1).peer);
    }

    #[test]
    fn fault_free_session_walks_every_phase() {
        let swarm = Swarm::new(config(0.0, 0.0)).unwrap();
        let processor = ChainProcessor::new(swarm.chain_head(), GlobalExecutor)
            .with_finalizer(swarm.finalizer());
        let mut session = swarm.session(0);
        processor.process(&mut session, &swarm.listeners()).unwrap();

        let summary = swarm.summaries().pop().unwrap();
        assert_eq!(
            summary.phases,
            [
                Phase::Handshake,
                Phase::MetadataExchange,
                Phase::PieceNegotiation,
                Phase::DataTransfer,
                Phase::SeedCheck,
            ]
        );
        assert!(summary.transferred > 0);
        assert!(swarm.connections().is_empty());
    }

    #[test]
    fn cached_metadata_skips_exchange() {
        let swarm = Swarm::new(config(0.0, 1.0)).unwrap();
        let processor = ChainProcessor::new(swarm.chain_head(), GlobalExecutor)
            .with_finalizer(swarm.finalizer());
        processor
            .process(&mut swarm.session(0), &swarm.listeners())
            .unwrap();
        let phases = &swarm.summaries()[0].phases;
        assert!(!phases.contains(&Phase::MetadataExchange));
        assert_eq!(phases[0], Phase::Handshake);
        assert_eq!(phases[1], Phase::PieceNegotiation);
    }

    #[test]
    fn rejected_handshake_fails_the_run() {
        let swarm = Swarm::new(config(1.0, 0.0)).unwrap();
        let processor = ChainProcessor::new(swarm.chain_head(), GlobalExecutor)
            .with_finalizer(swarm.finalizer());
        let err = processor
            .process(&mut swarm.session(0), &swarm.listeners())
            .unwrap_err();
        assert!(matches!(
            err.stage_error().and_then(|e| e.downcast_ref::<PeerError>()),
            Some(PeerError::HandshakeRejected(_))
        ));
        assert_eq!(swarm.stats().finalized, 1);
        assert_eq!(swarm.summaries()[0].phases, [Phase::Handshake]);
    }

    #[test]
    fn invalid_rates_are_rejected() {
        assert!(Swarm::new(config(-0.1, 0.0)).is_err());
        assert!(Swarm::new(config(0.0, f64::NAN)).is_err());
    }
}
