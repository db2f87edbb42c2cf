//! Hardware seam for scripts and host functions.
//!
//! [`Pins`] is what `PINMODE`, `DWRITE`, `AREAD` and friends talk to. The
//! simulator and the tests use [`SimPins`], which keeps pin levels in memory
//! and records every write.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Pin direction and pull configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
    InputPullup,
    InputPulldown,
    /// Board-specific mode number passed through untouched.
    Other(i32),
}

impl PinMode {
    /// Parses a mode keyword or a raw mode number.
    pub fn parse(token: &[u8]) -> PinMode {
        const NAMES: [(&[u8], PinMode); 8] = [
            (b"IN", PinMode::Input),
            (b"INPUT", PinMode::Input),
            (b"OUT", PinMode::Output),
            (b"OUTPUT", PinMode::Output),
            (b"INPU", PinMode::InputPullup),
            (b"PULLUP", PinMode::InputPullup),
            (b"INPD", PinMode::InputPulldown),
            (b"PULLDOWN", PinMode::InputPulldown),
        ];

        NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, mode)| *mode)
            .unwrap_or_else(|| PinMode::from_raw(crate::protocol::args::parse_int(token)))
    }

    pub fn from_raw(raw: i32) -> PinMode {
        match raw {
            0 => PinMode::Input,
            1 => PinMode::Output,
            2 => PinMode::InputPullup,
            3 => PinMode::InputPulldown,
            other => PinMode::Other(other),
        }
    }
}

/// GPIO, ADC/PWM and timing primitives.
///
/// Implementations must be shareable between the dispatcher and the worker
/// thread, so every method takes `&self`.
pub trait Pins: Send + Sync {
    fn pin_mode(&self, pin: i32, mode: PinMode);
    fn digital_write(&self, pin: i32, high: bool);
    fn digital_read(&self, pin: i32) -> bool;
    fn analog_write(&self, pin: i32, value: i32);
    fn analog_read(&self, pin: i32) -> i32;

    /// Microsecond delay; the default sleeps the calling thread.
    fn delay_us(&self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }

    /// Millisecond delay; the default sleeps the calling thread.
    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// One recorded pin operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinEvent {
    Mode(i32, PinMode),
    Digital(i32, bool),
    Analog(i32, i32),
}

#[derive(Default)]
struct SimState {
    levels: BTreeMap<i32, i32>,
    modes: BTreeMap<i32, PinMode>,
    events: Vec<PinEvent>,
}

/// In-memory pin bank.
///
/// Reads return the last value written to (or injected on) the pin; unset
/// pins read as 0, except pins configured with a pull-up, which read high.
#[derive(Default)]
pub struct SimPins {
    state: Mutex<SimState>,
    record: bool,
}

impl SimPins {
    /// Pin bank that keeps levels but does not record events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin bank that also records every write in order.
    pub fn recording() -> Self {
        Self {
            state: Mutex::default(),
            record: true,
        }
    }

    /// Sets the level seen by subsequent reads, as if driven externally.
    pub fn inject(&self, pin: i32, value: i32) {
        self.with_state(|s| {
            s.levels.insert(pin, value);
        });
    }

    pub fn level(&self, pin: i32) -> Option<i32> {
        self.with_state(|s| s.levels.get(&pin).copied())
    }

    pub fn mode(&self, pin: i32) -> Option<PinMode> {
        self.with_state(|s| s.modes.get(&pin).copied())
    }

    /// Drains the recorded events.
    pub fn take_events(&self) -> Vec<PinEvent> {
        self.with_state(|s| std::mem::take(&mut s.events))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn push(&self, event: PinEvent) {
        let record = self.record;
        self.with_state(|s| {
            match event {
                PinEvent::Mode(pin, mode) => {
                    s.modes.insert(pin, mode);
                }
                PinEvent::Digital(pin, high) => {
                    s.levels.insert(pin, high as i32);
                }
                PinEvent::Analog(pin, value) => {
                    s.levels.insert(pin, value);
                }
            }
            if record {
                s.events.push(event);
            }
        });
    }
}

impl Pins for SimPins {
    fn pin_mode(&self, pin: i32, mode: PinMode) {
        self.push(PinEvent::Mode(pin, mode));
    }

    fn digital_write(&self, pin: i32, high: bool) {
        self.push(PinEvent::Digital(pin, high));
    }

    fn digital_read(&self, pin: i32) -> bool {
        self.with_state(|s| match s.levels.get(&pin) {
            Some(level) => *level != 0,
            None => s.modes.get(&pin) == Some(&PinMode::InputPullup),
        })
    }

    fn analog_write(&self, pin: i32, value: i32) {
        self.push(PinEvent::Analog(pin, value));
    }

    fn analog_read(&self, pin: i32) -> i32 {
        self.with_state(|s| s.levels.get(&pin).copied().unwrap_or(0))
    }
}
