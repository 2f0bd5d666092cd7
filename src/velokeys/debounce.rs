//! Per-switch debouncing.
//!
//! A variation of the integrator debounce described at
//! <https://www.kennethkuhn.com/electronics/debounce.c>: every update
//! where the sample disagrees with the latched state counts up by the
//! elapsed time, every update where it agrees counts back down. Once
//! the count reaches the threshold the state flips and the count
//! starts over.
//!
//! With a press threshold of 0 a press latches on the very first
//! active sample ("instant activate") while releases still have to
//! hold for `release_threshold_ms`.

use static_assertions::const_assert;

pub const DEBOUNCE_COUNTER_BITS: u32 = 14;
pub const DEBOUNCE_COUNTER_MAX: u16 = (1 << DEBOUNCE_COUNTER_BITS) - 1;

const_assert!(DEBOUNCE_COUNTER_BITS < 16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Duration a switch must be pressed to latch as pressed.
    pub press_threshold_ms: u32,

    /// Duration a switch must be released to latch as released.
    pub release_threshold_ms: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Debounce state of one switch. There is one per matrix cell.
pub struct DebounceState {
    pressed: bool,
    changed: bool,

    /// Always within `0..=DEBOUNCE_COUNTER_MAX`.
    counter: u16,
}

impl DebounceState {
    pub const fn new() -> DebounceState {
        DebounceState {
            pressed: false,
            changed: false,
            counter: 0,
        }
    }

    /// Feed one sample. `elapsed_ms` is the time since the previous
    /// update.
    pub fn update(&mut self, active: bool, elapsed_ms: u32, config: &DebounceConfig) {
        self.changed = false;

        if active == self.pressed {
            self.decrement_counter(elapsed_ms);
            return;
        }

        if u32::from(self.counter) < self.threshold(config) {
            self.increment_counter(elapsed_ms);
            return;
        }

        self.pressed = !self.pressed;
        self.counter = 0;
        self.changed = true;
    }

    /// Whether the switch is latched as pressed, or might be pressed
    /// and the debouncer has not made up its mind yet. While any cell
    /// says true the scanner keeps polling quickly.
    pub fn is_active(&self) -> bool {
        self.pressed || self.counter > 0
    }

    pub fn is_pressed(&self) -> bool {
        self.pressed
    }

    /// Whether the latched state flipped on the most recent update.
    pub fn get_changed(&self) -> bool {
        self.changed
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    fn threshold(&self, config: &DebounceConfig) -> u32 {
        if self.pressed {
            config.release_threshold_ms
        } else {
            config.press_threshold_ms
        }
    }

    fn increment_counter(&mut self, elapsed_ms: u32) {
        let sum = u32::from(self.counter).saturating_add(elapsed_ms);
        self.counter = sum.min(u32::from(DEBOUNCE_COUNTER_MAX)) as u16;
    }

    fn decrement_counter(&mut self, elapsed_ms: u32) {
        self.counter = u32::from(self.counter).saturating_sub(elapsed_ms) as u16;
    }
}
