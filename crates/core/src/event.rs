use std::fmt::{self, Display};

/// Transition point reached after a stage finishes, used as the lookup key
/// for listeners.
///
/// Events carry no ordering or hierarchy; two events are the same event only
/// if they compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ProcessingEvent {
    /// Peer handshake completed and both sides agreed on the torrent.
    HandshakeCompleted,
    /// Torrent metadata was fetched from peers or a local source.
    TorrentFetched,
    /// Metadata exchange with the remote peer finished.
    MetadataExchanged,
    /// The set of files to download was chosen.
    FilesChosen,
    /// Pieces to request from the peer were negotiated.
    PiecesNegotiated,
    /// All requested data has been transferred.
    DownloadComplete,
    /// Collaborator-defined transition.
    Custom(&'static str),
}

impl Display for ProcessingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeCompleted => f.write_str("handshake-completed"),
            Self::TorrentFetched => f.write_str("torrent-fetched"),
            Self::MetadataExchanged => f.write_str("metadata-exchanged"),
            Self::FilesChosen => f.write_str("files-chosen"),
            Self::PiecesNegotiated => f.write_str("pieces-negotiated"),
            Self::DownloadComplete => f.write_str("download-complete"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}
