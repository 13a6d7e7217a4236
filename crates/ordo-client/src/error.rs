// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use ordo_archiver::ArchiveError;
use ordo_proto::wire::WireError;
use ordo_proto::BlobError;
use thiserror::Error;

/// Failures surfaced by the client and the dispatch layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket I/O failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be encoded or decoded.
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    /// A transaction blob could not be encoded or decoded.
    #[error("blob: {0}")]
    Blob(#[from] BlobError),
    /// The first frame from the sequencer was not a greeting.
    #[error("expected greeting, got {0}")]
    NoGreeting(&'static str),
    /// The sequencer closed the connection.
    #[error("sequencer closed the connection")]
    Disconnected,
    /// Replay stopped on an archive contract violation; the local replica is
    /// no longer trustworthy.
    #[error("replay halted: {0}")]
    Halted(ArchiveError),
    /// The dispatch worker is gone (flow closed).
    #[error("dispatch worker closed")]
    Closed,
}
