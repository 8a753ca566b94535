//! Synchronization sources
//!
//! A `SyncSource` is the clock a layer follows: it resolves to a frame
//! index on every poll plus a rolling flag (transport advancing). Variants:
//! - `NullSyncSource`: never connected, manual control only
//! - `MidiSyncSource`: MTC over a `MidiDriver`
//! - `FramerateConverter`: decorator rescaling another source's frame
//!   numbers from its native rate to the project rate
//!
//! Frame-rate conversion never happens inside the MTC decoder; it is the
//! converter's job alone.

pub mod midi;
pub mod mtc;

use crate::error::MediaResult;
use midi::{MidiDriver, MidiDriverFactory, NullMidiDriver};

/// Polymorphic clock.
pub trait SyncSource: Send {
    /// Connect to the transport. `param` is source specific (MIDI port id,
    /// `"-1"` for autodetect).
    fn connect(&mut self, param: &str) -> MediaResult<()>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    /// Poll the clock: `(frame_index, rolling)`. Frame is -1 while no
    /// timecode has been received.
    fn poll_frame(&mut self) -> (i64, bool);

    /// Last frame returned by `poll_frame`.
    fn current_frame(&self) -> i64;

    /// Self-reported frame rate of this clock.
    fn framerate(&self) -> f64;

    fn name(&self) -> &'static str;
}

/// Always-disconnected source.
#[derive(Debug, Default)]
pub struct NullSyncSource;

impl SyncSource for NullSyncSource {
    fn connect(&mut self, _param: &str) -> MediaResult<()> {
        Err(crate::error::MediaError::SyncUnavailable(
            "null sync source".into(),
        ))
    }

    fn disconnect(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }

    fn poll_frame(&mut self) -> (i64, bool) {
        (-1, false)
    }

    fn current_frame(&self) -> i64 {
        -1
    }

    fn framerate(&self) -> f64 {
        0.0
    }

    fn name(&self) -> &'static str {
        "None"
    }
}

/// MTC synchronization over a MIDI driver.
pub struct MidiSyncSource {
    driver: Box<dyn MidiDriver>,
    framerate: f64,
    current_frame: i64,
    connected: bool,
}

impl Default for MidiSyncSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiSyncSource {
    pub fn new() -> Self {
        Self {
            driver: Box::new(NullMidiDriver),
            framerate: 25.0,
            current_frame: -1,
            connected: false,
        }
    }

    /// Select a MIDI driver by name. Fails while connected.
    pub fn choose_driver(&mut self, driver_name: &str) -> bool {
        if self.connected {
            return false;
        }
        match MidiDriverFactory::create(driver_name) {
            Some(driver) if driver.is_supported() => {
                self.driver = driver;
                true
            }
            _ => false,
        }
    }

    pub fn set_framerate(&mut self, fps: f64) {
        if fps > 0.0 {
            self.framerate = fps;
        }
    }

    pub fn set_clock_adjustment(&mut self, enabled: bool) {
        self.driver.set_clock_adjustment(enabled);
    }

    pub fn set_clock_convert(&mut self, mode: mtc::MidiClockConvert) {
        self.driver.set_clock_convert(mode);
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }
}

impl SyncSource for MidiSyncSource {
    fn connect(&mut self, param: &str) -> MediaResult<()> {
        if self.connected {
            self.disconnect();
        }

        // Nothing selected yet: pick the first working driver
        if self.driver.name() == "None" {
            self.driver = MidiDriverFactory::create_first_available();
        }

        self.driver.set_framerate(self.framerate);
        self.driver.open(param)?;
        self.connected = true;
        self.current_frame = -1;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.driver.close();
            self.connected = false;
            self.current_frame = -1;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected && self.driver.is_connected()
    }

    fn poll_frame(&mut self) -> (i64, bool) {
        if !self.is_connected() {
            return (-1, false);
        }

        self.driver.set_framerate(self.framerate);
        let frame = self.driver.poll_frame();
        if frame >= 0 {
            self.current_frame = frame;
        }

        // Drivers with their own rolling heuristic win; otherwise any
        // positive frame seen in this poll counts as rolling.
        let rolling = if self.driver.has_rolling_detection() {
            frame >= 0 && self.driver.is_rolling()
        } else {
            frame >= 0
        };

        (frame, rolling)
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
    }

    fn framerate(&self) -> f64 {
        self.framerate
    }

    fn name(&self) -> &'static str {
        "MIDI"
    }
}

/// Decorator converting another source's frame numbers to the project rate.
pub struct FramerateConverter {
    inner: Box<dyn SyncSource>,
    source_fps: f64,
    project_fps: f64,
    current_frame: i64,
}

impl FramerateConverter {
    pub fn new(inner: Box<dyn SyncSource>, source_fps: f64, project_fps: f64) -> Self {
        Self {
            inner,
            source_fps,
            project_fps,
            current_frame: -1,
        }
    }

    fn convert(&self, frame: i64) -> i64 {
        if frame < 0 || self.source_fps <= 0.0 {
            return frame;
        }
        (frame as f64 * self.project_fps / self.source_fps).round() as i64
    }
}

impl SyncSource for FramerateConverter {
    fn connect(&mut self, param: &str) -> MediaResult<()> {
        self.inner.connect(param)
    }

    fn disconnect(&mut self) {
        self.inner.disconnect();
        self.current_frame = -1;
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn poll_frame(&mut self) -> (i64, bool) {
        let (frame, rolling) = self.inner.poll_frame();
        let converted = self.convert(frame);
        if converted >= 0 {
            self.current_frame = converted;
        }
        (converted, rolling)
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
    }

    fn framerate(&self) -> f64 {
        self.project_fps
    }

    fn name(&self) -> &'static str {
        "FramerateConverter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;

    /// Scripted source used to exercise the converter.
    struct ScriptedSync {
        frames: Vec<i64>,
        cursor: usize,
        fps: f64,
    }

    impl SyncSource for ScriptedSync {
        fn connect(&mut self, _param: &str) -> MediaResult<()> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn poll_frame(&mut self) -> (i64, bool) {
            let frame = self.frames.get(self.cursor).copied().unwrap_or(-1);
            self.cursor = (self.cursor + 1).min(self.frames.len());
            (frame, frame >= 0)
        }
        fn current_frame(&self) -> i64 {
            -1
        }
        fn framerate(&self) -> f64 {
            self.fps
        }
        fn name(&self) -> &'static str {
            "Scripted"
        }
    }

    #[test]
    fn null_source_reports_disconnected() {
        let mut sync = NullSyncSource;
        assert!(!sync.is_connected());
        assert_eq!(sync.poll_frame(), (-1, false));
        assert!(matches!(
            sync.connect("-1"),
            Err(MediaError::SyncUnavailable(_))
        ));
    }

    #[test]
    fn converter_scales_and_rounds() {
        // 30 fps MTC into a 25 fps project
        let inner = ScriptedSync {
            frames: vec![0, 30, 45, 300, -1],
            cursor: 0,
            fps: 30.0,
        };
        let mut conv = FramerateConverter::new(Box::new(inner), 30.0, 25.0);

        assert_eq!(conv.poll_frame(), (0, true));
        assert_eq!(conv.poll_frame(), (25, true));
        // 45 * 25 / 30 = 37.5, rounds up
        assert_eq!(conv.poll_frame(), (38, true));
        assert_eq!(conv.poll_frame(), (250, true));
        assert_eq!(conv.framerate(), 25.0);

        // Disconnected polls pass -1 through untouched
        assert_eq!(conv.poll_frame(), (-1, false));
        assert_eq!(conv.current_frame(), 250);
    }

    #[test]
    fn midi_source_starts_disconnected() {
        let sync = MidiSyncSource::new();
        assert!(!sync.is_connected());
        assert_eq!(sync.current_frame(), -1);
        assert_eq!(sync.driver_name(), "None");
    }

    #[test]
    fn choose_driver_rejected_while_connected() {
        let mut sync = MidiSyncSource::new();
        assert!(sync.choose_driver("midir"));
        assert_eq!(sync.driver_name(), "midir");
        assert!(!sync.choose_driver("bogus"));
    }
}
