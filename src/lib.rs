//! stagecomposer - Multi-layer video composition engine for live show control
//!
//! Decodes one or more video streams, synchronizes playback frame-accurately
//! to an external MIDI Time Code master, applies per-layer transforms and
//! hands the composed layer set to an external renderer.
//!
//! The crate is organized around three coupled subsystems:
//! - `media`: per-layer decoding (software, hardware-accelerated with
//!   GPU-resident surfaces, and Hap block-texture upload), pre-buffered
//!   decode queues and the async source loader
//! - `sync`: the MTC decoder, MIDI drivers and the SyncSource clock variants
//! - `layer`: the per-layer playback state machine and display transforms
//!
//! The engine loop in `app` ties them together: poll sync, update each layer,
//! prepare each layer's display frame, hand off to the compositor.

pub mod app;
pub mod error;
pub mod layer;
pub mod media;
pub mod sync;

pub use app::{Engine, Settings};
pub use error::MediaError;
