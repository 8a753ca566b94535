//! MIDI drivers
//!
//! A driver owns the OS-level MIDI input and turns quarter-frame/full-frame
//! messages into a frame counter. The midir driver runs the OS callback
//! thread; the decoder is polled under a mutex from the engine thread. A
//! Null driver is always available as the fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use midir::{Ignore, MidiInput, MidiInputConnection};
use parking_lot::Mutex;

use crate::error::{MediaError, MediaResult};
use crate::sync::mtc::{MidiClockConvert, MtcDecoder};

/// Timecode is considered rolling while emissions keep arriving within this
/// wall-clock window. 250 ms is ten quarter-frame periods at 30 fps, enough
/// to ride out scheduler jitter without reporting a parked transport as
/// rolling.
pub const ROLLING_WINDOW: Duration = Duration::from_millis(250);

const OPEN_RETRIES: u32 = 10;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Abstract MIDI transport.
pub trait MidiDriver: Send {
    /// Open the MIDI input. `port_id` is driver specific; `"-1"` requests
    /// autodetect.
    fn open(&mut self, port_id: &str) -> MediaResult<()>;
    fn close(&mut self);
    fn is_connected(&self) -> bool;

    /// Latest complete frame index, or -1 if none received yet.
    fn poll_frame(&mut self) -> i64;

    /// Whether the transport appears to be advancing.
    fn is_rolling(&self) -> bool {
        false
    }

    /// True when this driver has a real rolling heuristic; callers fall
    /// back to "frame seen this poll" otherwise.
    fn has_rolling_detection(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
    fn is_supported(&self) -> bool;

    fn set_framerate(&mut self, _fps: f64) {}
    fn set_clock_adjustment(&mut self, _enabled: bool) {}

    /// Select how MTC timecode maps onto the project frame rate.
    fn set_clock_convert(&mut self, _mode: crate::sync::mtc::MidiClockConvert) {}
}

/// Always-available driver that never connects.
#[derive(Debug, Default)]
pub struct NullMidiDriver;

impl MidiDriver for NullMidiDriver {
    fn open(&mut self, _port_id: &str) -> MediaResult<()> {
        Err(MediaError::SyncUnavailable("null driver".into()))
    }

    fn close(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }

    fn poll_frame(&mut self) -> i64 {
        -1
    }

    fn name(&self) -> &'static str {
        "None"
    }

    fn is_supported(&self) -> bool {
        true
    }
}

/// State shared between the midir callback thread and the polling thread.
struct MtcShared {
    decoder: Mutex<MtcDecoder>,
    /// Set on every completed emission; drives rolling detection.
    last_emission: Mutex<Option<Instant>>,
}

/// MTC receiver on top of a midir input port.
pub struct MidirMtcDriver {
    connection: Option<MidiInputConnection<()>>,
    shared: Arc<MtcShared>,
    framerate: f64,
    clock_adjust: bool,
    convert_mode: MidiClockConvert,
    /// Poll period in seconds for stuck-transport accounting; 0 derives it
    /// from the frame rate.
    delay: f64,
    last_frame: i64,
    stuck_polls: u32,
    connected: bool,
}

impl Default for MidirMtcDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MidirMtcDriver {
    pub fn new() -> Self {
        Self {
            connection: None,
            shared: Arc::new(MtcShared {
                decoder: Mutex::new(MtcDecoder::new()),
                last_emission: Mutex::new(None),
            }),
            framerate: 25.0,
            clock_adjust: false,
            convert_mode: MidiClockConvert::UseMtcFps,
            delay: 0.0,
            last_frame: -1,
            stuck_polls: 0,
            connected: false,
        }
    }

    pub fn set_delay(&mut self, delay: f64) {
        self.delay = delay;
    }

    fn try_connect(&mut self, port_id: &str) -> MediaResult<()> {
        let mut input = MidiInput::new("stagecomposer")
            .map_err(|e| MediaError::SyncUnavailable(format!("midi init failed: {e}")))?;
        // Quarter-frame messages are system common and filtered by default
        input.ignore(Ignore::None);

        let ports = input.ports();
        if ports.is_empty() {
            return Err(MediaError::SyncUnavailable("no MIDI input ports".into()));
        }

        let port = if port_id.is_empty() || port_id == "-1" {
            // Autodetect: first available port
            ports[0].clone()
        } else if let Ok(index) = port_id.parse::<usize>() {
            ports
                .get(index)
                .cloned()
                .ok_or_else(|| MediaError::SyncUnavailable(format!("no MIDI port {index}")))?
        } else {
            ports
                .iter()
                .find(|p| {
                    input
                        .port_name(p)
                        .map(|n| n.contains(port_id))
                        .unwrap_or(false)
                })
                .cloned()
                .ok_or_else(|| {
                    MediaError::SyncUnavailable(format!("no MIDI port matching '{port_id}'"))
                })?
        };

        let port_name = input.port_name(&port).unwrap_or_else(|_| "?".into());
        let shared = self.shared.clone();

        let connection = input
            .connect(
                &port,
                "mtc-in",
                move |_timestamp, message, _| {
                    Self::handle_message(&shared, message);
                },
                (),
            )
            .map_err(|e| MediaError::SyncUnavailable(format!("midi connect failed: {e}")))?;

        log::info!("MidirMtcDriver: listening on '{}'", port_name);
        self.connection = Some(connection);
        self.connected = true;
        Ok(())
    }

    fn handle_message(shared: &MtcShared, message: &[u8]) {
        match message.first() {
            // Quarter frame: status + one data byte
            Some(0xF1) if message.len() >= 2 => {
                let complete = shared.decoder.lock().process_byte(message[1]);
                if complete {
                    *shared.last_emission.lock() = Some(Instant::now());
                }
            }
            // Full-frame SysEx locate
            Some(0xF0) => {
                if shared.decoder.lock().process_full_frame(message) {
                    *shared.last_emission.lock() = Some(Instant::now());
                }
            }
            _ => {}
        }
    }
}

impl MidiDriver for MidirMtcDriver {
    fn open(&mut self, port_id: &str) -> MediaResult<()> {
        if self.connected {
            self.close();
        }

        // The OS MIDI binding can race service startup; bounded retries.
        let mut last_err = MediaError::SyncUnavailable("midi open not attempted".into());
        for attempt in 0..OPEN_RETRIES {
            match self.try_connect(port_id) {
                Ok(()) => {
                    self.shared.decoder.lock().reset();
                    *self.shared.last_emission.lock() = None;
                    self.last_frame = -1;
                    self.stuck_polls = 0;
                    return Ok(());
                }
                Err(e) => {
                    if attempt + 1 < OPEN_RETRIES {
                        log::debug!("MidirMtcDriver: open attempt {} failed: {e}", attempt + 1);
                        std::thread::sleep(OPEN_RETRY_DELAY);
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.connected = false;
        self.last_frame = -1;
        self.stuck_polls = 0;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn poll_frame(&mut self) -> i64 {
        if !self.connected {
            return -1;
        }

        let decoder = self.shared.decoder.lock();
        let mut frame = decoder.poll_frame_converted(self.framerate, self.convert_mode);
        if frame < 0 {
            return -1;
        }

        if self.clock_adjust {
            // Stuck-transport detection: the same frame observed for more
            // than ceil(4 * fps / period) polls means the master stopped
            // mid-set; reset so stale timecode is not replayed.
            if self.last_frame == frame {
                self.stuck_polls += 1;
                let period = if self.delay > 0.0 {
                    self.delay
                } else {
                    1.0 / self.framerate
                };
                let threshold = (4.0 * self.framerate / period).ceil() as u32;
                if self.stuck_polls > threshold {
                    drop(decoder);
                    self.shared.decoder.lock().reset();
                    *self.shared.last_emission.lock() = None;
                    return -1;
                }
            } else {
                self.stuck_polls = 0;
                self.last_frame = frame;
            }

            // Quarter-frame nudge to smooth apparent jitter
            frame += (decoder.quarter_tick() as f64 / 4.0).round() as i64;
        } else {
            self.last_frame = frame;
        }

        frame
    }

    fn is_rolling(&self) -> bool {
        self.shared
            .last_emission
            .lock()
            .map(|at| at.elapsed() < ROLLING_WINDOW)
            .unwrap_or(false)
    }

    fn has_rolling_detection(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "midir"
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn set_framerate(&mut self, fps: f64) {
        if fps > 0.0 {
            self.framerate = fps;
        }
    }

    fn set_clock_adjustment(&mut self, enabled: bool) {
        self.clock_adjust = enabled;
    }

    fn set_clock_convert(&mut self, mode: MidiClockConvert) {
        self.convert_mode = mode;
    }
}

impl Drop for MidirMtcDriver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Driver factory.
pub struct MidiDriverFactory;

impl MidiDriverFactory {
    /// Create a driver by name; `None`/empty selects the null driver.
    pub fn create(driver_name: &str) -> Option<Box<dyn MidiDriver>> {
        let name = driver_name.to_ascii_lowercase();
        match name.as_str() {
            "" | "none" => Some(Box::new(NullMidiDriver)),
            "midir" | "midi" | "mtc" => Some(Box::new(MidirMtcDriver::new())),
            _ => None,
        }
    }

    /// First driver that reports itself supported; null as last resort.
    pub fn create_first_available() -> Box<dyn MidiDriver> {
        let driver = MidirMtcDriver::new();
        if driver.is_supported() {
            return Box::new(driver);
        }
        Box::new(NullMidiDriver)
    }

    pub fn available_drivers() -> Vec<&'static str> {
        let mut drivers = vec!["None"];
        if MidirMtcDriver::new().is_supported() {
            drivers.push("midir");
        }
        drivers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_driver_never_connects() {
        let mut driver = NullMidiDriver;
        assert!(driver.open("-1").is_err());
        assert!(!driver.is_connected());
        assert_eq!(driver.poll_frame(), -1);
        assert!(driver.is_supported());
    }

    #[test]
    fn factory_names() {
        assert!(MidiDriverFactory::create("None").is_some());
        assert!(MidiDriverFactory::create("midir").is_some());
        assert!(MidiDriverFactory::create("MTC").is_some());
        assert!(MidiDriverFactory::create("bogus").is_none());
        assert!(MidiDriverFactory::available_drivers().contains(&"None"));
    }

    #[test]
    fn callback_feeds_decoder() {
        let shared = MtcShared {
            decoder: Mutex::new(MtcDecoder::new()),
            last_emission: Mutex::new(None),
        };

        // 00:00:49:09 @ 25 fps, wrapped as wire messages
        for data in [0x09u8, 0x10, 0x21, 0x33, 0x40, 0x50, 0x60, 0x72] {
            MidirMtcDriver::handle_message(&shared, &[0xF1, data]);
        }
        assert_eq!(shared.decoder.lock().poll_frame(), 1234);
        assert!(shared.last_emission.lock().is_some());
    }

    #[test]
    fn sysex_locate_feeds_decoder() {
        let shared = MtcShared {
            decoder: Mutex::new(MtcDecoder::new()),
            last_emission: Mutex::new(None),
        };
        let sysex = [0xF0, 0x7F, 0x7F, 0x01, 0x01, 0x20, 0x00, 0x10, 0x00, 0xF7];
        MidirMtcDriver::handle_message(&shared, &sysex);
        assert_eq!(shared.decoder.lock().poll_frame(), 25 * 16);
    }
}
