/*! Module for a velocity-sensing musical keyboard built on a GPIO
 * switch matrix.
 *
 * Every musical key sits over two switches. The "upper" switch closes
 * early in the key's travel and the "lower" switch closes at the
 * bottom. How long it takes to get from one to the other is how hard
 * the key was struck, which is what a MIDI synth calls velocity.
 *
 * # The pieces, leaf first
 *
 * - [`debounce`]: an integrator filter per matrix cell, turning noisy
 *   samples into a latched pressed/released value plus a "changed on
 *   this tick" flag.
 *
 * - [`scheduler`]: an ordered queue of delayed jobs keyed by an opaque
 *   parameter. Dispatch is driven either by a dedicated thread or by a
 *   reprogrammable one-shot timer. Timestamps are a free-running
 *   microsecond counter that wraps at 2^32, see [`clock`].
 *
 * - [`matrix`]: the scan engine. Idle with interrupts armed until a
 *   switch closes, then polls every scan period until everything is
 *   released and settled again. It reschedules itself through the
 *   scheduler instead of spinning.
 *
 * - [`velocity`]: pairs the upper and lower switch events of each key,
 *   bounds the wait for the lower switch with a scheduler timeout, and
 *   emits press/release events with a velocity.
 *
 * - `Keyboard`: wires the above together and lets any number of client
 *   threads (or tokio tasks) register for the key events they want.
 *
 * Data flows: matrix scanner → velocity engine → registered clients.
 *
 * # Locks
 *
 * Each component owns one mutex for its shared state and never holds
 * it while calling another component or a listener. Listeners can
 * therefore call straight back into the keyboard, `stop()` included.
 *
 * Two locks are held across calls out, and only to keep work from
 * overlapping: the scheduler's dispatch lock (around the work
 * callback) and the scanner's pass lock (around the scan callback).
 * Neither callback may re-enter `run_pending()` or `read()`.
 */

pub mod clock;
pub mod debounce;
pub mod event;
mod event_reg;
mod event_reg_async;
pub mod hw_specific;
mod keyboard;
mod macros;
pub mod matrix;
pub mod runnable;
pub mod scheduler;
pub mod sim;
pub mod velocity;

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use debounce::{DebounceConfig, DebounceState};
pub use event::{Broadcast, Bubbling, ListenerId};
pub use keyboard::{Keyboard, KeyboardConfig};
pub use matrix::{
    DiodeDirection, EdgeCallback, MatrixGeometry, MatrixPins, MatrixScanner, ScanConfig, ScanMode,
};
pub use scheduler::{OneShotTimer, Scheduler};
pub use velocity::{KeyState, TimerState, VelocityConfig, VelocityEngine, VelocityEvent};

#[derive(Error, Debug)]
pub enum KError {
    #[error("Bad matrix geometry: {reason}")]
    BadGeometry { reason: String },

    #[error("Bad configuration: {reason}")]
    BadConfig { reason: String },

    #[error("Bad key location row {row}, col {col} (matrix is {rows} x {cols})")]
    BadKeyLocation {
        row: u8,
        col: u8,
        rows: usize,
        cols: usize,
    },

    #[error("GPIO failure: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("Spawn of thread {name} failed: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("Already initialized, can only be set up once")]
    AlreadyInitialized,
}

/// The work the shared scheduler knows how to run.
///
/// At most one job per distinct value should be queued at a time,
/// `Scheduler::cancel()` removes the first one it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Run the next matrix scan pass.
    ScanPass,

    /// The lower switch of this key (by key index) did not arrive in
    /// time.
    KeyTimeout(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPosition {
    /// Key is not being pressed.
    Up,

    /// Key is being pressed down.
    Down,
}

impl From<KeyPosition> for bool {
    fn from(key_position: KeyPosition) -> bool {
        match key_position {
            KeyPosition::Up => false,
            KeyPosition::Down => true,
        }
    }
}

impl From<bool> for KeyPosition {
    fn from(if_down: bool) -> Self {
        if if_down {
            KeyPosition::Down
        } else {
            KeyPosition::Up
        }
    }
}

/// Auxiliary keys living on the control row of the matrix, identified
/// by the column they are wired to. Columns 0 and 1 of that row are
/// not populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlKey {
    Back = 2,
    Select = 3,
    Menu = 4,
    Right1 = 5,
    Right2 = 6,
    Right3 = 7,
    Right4 = 8,
}

impl TryFrom<u8> for ControlKey {
    type Error = u8;

    fn try_from(col: u8) -> Result<Self, Self::Error> {
        match col {
            2 => Ok(ControlKey::Back),
            3 => Ok(ControlKey::Select),
            4 => Ok(ControlKey::Menu),
            5 => Ok(ControlKey::Right1),
            6 => Ok(ControlKey::Right2),
            7 => Ok(ControlKey::Right3),
            8 => Ok(ControlKey::Right4),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// One of these gets queued for every key press or release a client
/// registered for.
pub struct KeyEvent {
    /// Logical key row (a pair of physical matrix rows).
    pub row: u8,

    /// Matrix column.
    pub col: u8,

    /// Which key, by index position (`row * cols + col`).
    pub key_index: usize,

    /// Strike velocity, 0-255. Meaningless (0) for releases.
    pub velocity: u8,

    /// Whether the key went up or down.
    pub key_position: KeyPosition,

    /// When the event happened, in wrapping microseconds from the
    /// keyboard's `Clock`.
    pub event_us: u32,

    /// Incrementing event serial number, per registration.
    pub event_num: usize,

    /// Number of events queued, including this one, when it was
    /// queued.
    pub additional_events_still_queued: usize,
}

#[derive(Debug)]
struct EventRegInner {
    /// We are interested in press events from these keys.
    press_mask: Vec<bool>,

    /// We are interested in release events from these keys.
    release_mask: Vec<bool>,

    /// Where wanted events are stored. New events are added to the
    /// end with `push_back()`, so lowest indexes are the oldest
    /// events.
    event_queue: Arc<Mutex<VecDeque<KeyEvent>>>,

    /// Most events we will hold before dropping the oldest.
    queue_capacity: usize,

    /// Used to wake blocked async subscribers.
    async_sender: tokio::sync::watch::Sender<()>,
    async_receiver: tokio::sync::watch::Receiver<()>,

    /// Used to wake blocked synchronous subscribers.
    sync_sender: crossbeam_channel::Sender<usize>,
    sync_receiver: crossbeam_channel::Receiver<usize>,

    /// Number of events queued so far.
    event_count: usize,
}

#[derive(Debug, Clone)]
/// Struct for getting key events via synchronous (blocking)
/// methods. To obtain one of these call `Keyboard::register_events()`.
/// This can also be used as an iterator.
///
/// If you want an async (Tokio) version call
/// `register_events_async()` instead.
pub struct EventReg {
    /// The keyboard keeps only a weak reference to this, so when the
    /// client drops the last clone the registration goes away.
    reg_inner: Arc<Mutex<EventRegInner>>,

    /// Timeout used when events are read as an iterator. This value
    /// can be changed while running.
    pub iter_timeout: Duration,

    /// Size of event queue. (Changing this value has no effect, the
    /// queue was already created.)
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
/// Struct for getting key events via async (Tokio) methods. To obtain
/// one of these call `Keyboard::register_events_async()`.
pub struct EventRegAsync {
    /// This uses `EventReg` under the hood.
    pub real_event_reg: EventReg,

    /// Size of event queue. (Changing this value has no effect, the
    /// queue was already created.)
    pub queue_capacity: usize,
}

/// An alternative to calling a generic `.unwrap()`, this is something
/// that can't accidentally be applied to an `Option` or the wrong
/// kind of `Result`.
///
///    `some_mutex.lock().unwrap_or_else(mutex_poison);`
///
/// This will only work against a `MutexGuard`.
#[allow(clippy::needless_pass_by_value)]
fn mutex_poison<T>(g: PoisonError<MutexGuard<T>>) -> MutexGuard<'_, T> {
    panic!("mutex poisoned {g:?}")
}

/// Same as `mutex_poison()`, for a `RwLockWriteGuard`.
#[allow(clippy::needless_pass_by_value)]
fn write_poison<T>(g: PoisonError<RwLockWriteGuard<T>>) -> RwLockWriteGuard<'_, T> {
    panic!("rwlock poisoned {g:?}")
}

/// Same as `mutex_poison()`, for a `RwLockReadGuard`.
#[allow(clippy::needless_pass_by_value)]
fn read_poison<T>(g: PoisonError<RwLockReadGuard<T>>) -> RwLockReadGuard<'_, T> {
    panic!("rwlock poisoned {g:?}")
}

/// An alternative to calling a generic `.unwrap()`, this is something
/// that can't accidentally be applied to an `Option` or the wrong
/// kind of `Result`.
///
///    `some_sender.try_send(x).unwrap_or_else(try_send_error);`
///
/// This will only work against a `crossbeam_channel::TrySendError`.
#[allow(clippy::needless_pass_by_value)]
fn try_send_error<T>(g: crossbeam_channel::TrySendError<T>) {
    panic!("crossbeam channel is full {g:?}")
}
