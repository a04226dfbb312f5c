//! Per-run processing state and the identifiers used to tag diagnostics.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Mutable state threaded through every stage and listener of a single run.
///
/// A context is moved into the run when it is submitted and is never shared
/// across runs. Implementors that need to observe the state after the run
/// completes should keep shared handles (e.g. an `Arc`) inside the context.
pub trait ProcessingContext: Send + 'static {
    /// Identifier of the torrent this run is working on, if already known.
    ///
    /// Only used to annotate diagnostics.
    fn torrent_id(&self) -> Option<TorrentId>;

    /// Called by [`TerminateOnError`](crate::stage::TerminateOnError) when the
    /// wrapped stage fails and the run is terminated gracefully.
    fn record_failure(&mut self, _stage: &str, _error: &anyhow::Error) {}
}

/// Info hash of a torrent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TorrentId([u8; TorrentId::LEN]);

impl TorrentId {
    pub const LEN: usize = 20;

    pub const fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Encoded representation used in logs and config files.
    pub fn encode(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn decode(encoded: &str) -> Result<Self, bs58::decode::Error> {
        let mut bytes = [0; Self::LEN];
        let written = bs58::decode(encoded).onto(&mut bytes)?;
        if written != Self::LEN {
            return Err(bs58::decode::Error::BufferTooSmall);
        }
        Ok(Self(bytes))
    }
}

impl Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl fmt::Debug for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TorrentId").field(&self.encode()).finish()
    }
}

/// Unique identifier of one chain run, assigned on submission.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Ulid);

impl RunId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Milliseconds since the unix epoch at which the run was submitted.
    pub fn submitted_at(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RunId").field(&self.0.to_string()).finish()
    }
}

/// Formats an optional torrent id for structured log fields.
pub(crate) struct DisplayTorrent(pub Option<TorrentId>);

impl Display for DisplayTorrent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => write!(f, "{id}"),
            None => f.write_str("<unknown>"),
        }
    }
}
