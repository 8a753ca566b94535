//! Typed error kinds for the media and sync stacks.
//!
//! Recovery policy:
//! - `DecodeTransient` and `Gpu` are recovered locally in the tick (the layer
//!   keeps showing the previous frame and stays playing)
//! - `HardwareUnavailable` falls through to the next backend during open only
//! - fatal open errors propagate to the layer assignment site via the loader
//!   callback

use thiserror::Error;

/// Error kinds shared by input sources, the decode queue, GPU texture
/// management and the sync stack.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Operation invoked before `open` succeeded. Soft: caller retries or
    /// surfaces to the UI.
    #[error("source not ready")]
    NotReady,

    /// Frame index out of range, malformed crop rectangle, wrong read path
    /// for the codec. Caller logic error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// One packet failed to decode or no frame emerged within the bail
    /// count. Retried locally; returned to the caller when retries exhaust.
    #[error("transient decode failure: {0}")]
    DecodeTransient(String),

    /// Codec open failure, missing stream, seek failure after retry. The
    /// source should be closed and re-opened.
    #[error("decode failure: {0}")]
    DecodeFatal(String),

    /// A GPU call returned an error or failed a post-condition check. The
    /// texture involved has been released; the decoded frame is dropped.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// The selected hardware backend cannot be initialized. Callers fall
    /// back to software and log once at info.
    #[error("hardware decoder unavailable: {0}")]
    HardwareUnavailable(String),

    /// The MIDI port cannot be opened. Callers fall back to the null sync
    /// source and continue.
    #[error("sync source unavailable: {0}")]
    SyncUnavailable(String),

    /// An async open failed; delivered through the loader callback.
    #[error("load failed: {0}")]
    LoaderFailure(String),
}

pub type MediaResult<T> = Result<T, MediaError>;
