use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`crate::sink::DecoderSink`].
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("decoder unavailable: {0}")]
    Unavailable(String),

    #[error("decoder rejected unit {seq}: {reason}")]
    Rejected { seq: u64, reason: String },

    #[error("decoder closed")]
    Closed,

    #[error("decoder panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures opening an ingest source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("asset not found: {0}")]
    AssetNotFound(String),

    #[error("external source cannot be opened from a reader")]
    External,

    #[error("open {url} error: {reason}")]
    Open { url: String, reason: String },

    #[error("no h264 video stream in {0}")]
    NoVideoStream(String),
}

/// The only error that is fatal to a session: it never reached `Running`.
#[derive(Error, Debug)]
pub enum DecoderInitError {
    #[error("decoder sink could not be acquired: {0}")]
    Sink(#[source] SinkError),

    #[error("ingest source could not be opened: {0}")]
    Source(#[from] SourceError),

    #[error("invalid session config: {0}")]
    Config(String),

    #[error("feeder thread could not be spawned: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Steady-state failures. These are counted or logged, never propagated
/// out of a running session.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("unparseable input: {0}")]
    Parse(String),

    #[error("ingest queue full, unit {seq} dropped")]
    QueueOverflow { seq: u64 },

    #[error("submit of unit {seq} failed: {source}")]
    DecodeSubmit {
        seq: u64,
        #[source]
        source: SinkError,
    },

    #[error("feeder did not stop within {0:?}, abandoned")]
    StopTimeout(Duration),
}
