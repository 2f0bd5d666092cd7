/*! Turns pairs of switch events into key strikes with a velocity.
 *
 * Each musical key sits over two matrix rows: the even row is the
 * "upper" switch, which closes early in the key's travel, and the odd
 * row below it is the "lower" switch, which closes at the bottom. So
 * physical rows 0 and 1 are logical key row 0, rows 2 and 3 are
 * logical key row 1, and so on. Key index is `logical_row * cols +
 * col`.
 *
 * Per key:
 *
 * | state      | event          | action                                   |
 * |------------|----------------|------------------------------------------|
 * | `None`     | upper pressed  | note time, start timeout, → `Running`    |
 * | `Running`  | upper pressed  | double-tap: restart timing and timeout   |
 * | `Running`  | lower pressed  | cancel timeout, press with velocity, → `None` |
 * | `Running`  | timeout        | press with fallback velocity, → `TimedOut` |
 * | `Running`  | upper released | cancel timeout, → `None`                 |
 * | `TimedOut` | lower pressed  | already pressed, → `None`                |
 * | `TimedOut` | upper released | release, → `None`                        |
 * | `None`     | lower pressed  | no upper time, press with fallback       |
 * | any        | lower released | release                                  |
 *
 * Presses and releases are only sent when they change whether the key
 * is playing, so there is never a second press without a release in
 * between.
 *
 * A timeout can already be on its way when the lower switch cancels
 * it. The timeout handler checks the key is still `Running` and that
 * the full timeout really has gone by, so a late one does nothing.
 *
 * Transitions are decided under the key state lock. Cancelling,
 * scheduling and emitting wait until it has been dropped, so
 * listeners are free to call `key_state()`.
 *
 * The last matrix row can be given over to control keys. Those don't
 * go through any of this; presses are offered to the `control_keys()`
 * listeners, newest first, until one claims them.
 */

use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::velokeys::clock::is_due;
use crate::velokeys::event::{Broadcast, Bubbling};
use crate::velokeys::matrix::MatrixGeometry;
use crate::velokeys::scheduler::Scheduler;
use crate::velokeys::{mutex_poison, ControlKey, KError, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityConfig {
    /// Longest upper-to-lower time that still measures a velocity.
    pub timeout_us: u32,

    /// Velocity for strikes that couldn't be measured.
    pub fallback_velocity: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimerState {
    #[default]
    None,
    Running,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyState {
    pub timer_state: TimerState,

    /// When the upper switch closed.
    pub top_ts: u32,

    /// Velocity of the most recent press.
    pub velocity: u8,

    /// A press has been sent and its release hasn't.
    pub playing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityEvent {
    /// Logical key row.
    pub row: u8,
    pub col: u8,
    pub key_index: usize,

    /// 0 on releases.
    pub velocity: u8,
    pub pressed: bool,
    pub event_us: u32,
}

/// Velocity for a strike whose switches closed `elapsed_us` apart:
/// `round((1 - elapsed / timeout) * 255)`, halves rounding up, so 255
/// for instant and falling toward 0 at the timeout. The fallback at or
/// past it.
pub fn velocity_for(elapsed_us: u32, config: &VelocityConfig) -> u8 {
    if elapsed_us >= config.timeout_us {
        return config.fallback_velocity;
    }
    let timeout = u64::from(config.timeout_us);
    let remaining = timeout - u64::from(elapsed_us);
    let velocity = (remaining * 255 * 2 + timeout) / (timeout * 2);
    velocity.min(255) as u8
}

/// `(logical row, col, key index, now)` of a transition.
type KeyAt = (u8, u8, usize, u32);

/// What a transition asks for once the key state lock is dropped.
#[derive(Debug, Default)]
struct Followup {
    cancel_timeout: bool,

    /// Start a timeout running from this upper switch time.
    start_timeout: Option<u32>,

    event: Option<VelocityEvent>,
}

#[derive(Debug)]
pub struct VelocityEngine {
    cols: usize,

    /// Physical rows carrying keys, always even.
    key_rows: usize,
    control_row: Option<u8>,
    config: VelocityConfig,

    /// One per key, indexed by key index.
    keys: Mutex<Vec<KeyState>>,
    scheduler: Arc<Scheduler<Task>>,

    key_events: Broadcast<VelocityEvent>,
    control_keys: Bubbling<ControlKey>,
}

impl VelocityEngine {
    /// The scheduler's work callback must run `on_timeout()` for every
    /// `Task::KeyTimeout`.
    ///
    /// # Errors
    ///
    /// Will return `KError::BadConfig` if the control row isn't the
    /// last row, the remaining rows don't pair up, or the timeout is
    /// zero.
    pub fn new(
        geometry: &MatrixGeometry,
        control_row: Option<u8>,
        config: VelocityConfig,
        scheduler: Arc<Scheduler<Task>>,
    ) -> Result<VelocityEngine, KError> {
        let rows = geometry.rows();
        let key_rows = match control_row {
            Some(row) if usize::from(row) + 1 == rows => rows - 1,
            Some(row) => {
                return Err(KError::BadConfig {
                    reason: format!("control row {row} must be the last of {rows} rows"),
                })
            }
            None => rows,
        };
        if key_rows % 2 != 0 {
            return Err(KError::BadConfig {
                reason: format!("{key_rows} key rows can't be paired into upper/lower"),
            });
        }
        if config.timeout_us == 0 {
            return Err(KError::BadConfig {
                reason: "zero velocity timeout".to_string(),
            });
        }

        let num_keys = key_rows / 2 * geometry.cols();
        Ok(VelocityEngine {
            cols: geometry.cols(),
            key_rows,
            control_row,
            config,
            keys: Mutex::new(vec![KeyState::default(); num_keys]),
            scheduler,
            key_events: Broadcast::new(),
            control_keys: Bubbling::new(),
        })
    }

    pub fn num_keys(&self) -> usize {
        self.key_rows / 2 * self.cols
    }

    pub fn key_index(&self, logical_row: u8, col: u8) -> usize {
        usize::from(logical_row) * self.cols + usize::from(col)
    }

    /// Copy of one key's state.
    pub fn key_state(&self, key_index: usize) -> Option<KeyState> {
        self.keys
            .lock()
            .unwrap_or_else(mutex_poison)
            .get(key_index)
            .copied()
    }

    /// Where press and release events go.
    pub fn key_events(&self) -> &Broadcast<VelocityEvent> {
        &self.key_events
    }

    /// Where control key presses go.
    pub fn control_keys(&self) -> &Bubbling<ControlKey> {
        &self.control_keys
    }

    pub fn config(&self) -> &VelocityConfig {
        &self.config
    }

    /// Feed one debounced matrix event.
    pub fn on_scan_event(&self, row: u8, col: u8, pressed: bool) {
        if Some(row) == self.control_row {
            self.on_control_event(col, pressed);
            return;
        }
        if usize::from(row) >= self.key_rows || usize::from(col) >= self.cols {
            warn!("scan event off the keyboard: ({row}, {col})");
            return;
        }

        let logical_row = row / 2;
        let upper = row % 2 == 0;
        let key_index = self.key_index(logical_row, col);
        let now = self.scheduler.now_us();
        let at = (logical_row, col, key_index, now);

        let followup = {
            let mut keys = self.keys.lock().unwrap_or_else(mutex_poison);
            let key = &mut keys[key_index];
            trace!(
                "key {key_index} {} {}, {:?}",
                if upper { "upper" } else { "lower" },
                if pressed { "pressed" } else { "released" },
                key.timer_state
            );

            let mut followup = Followup::default();
            match (upper, pressed, key.timer_state) {
                (true, true, TimerState::None) => {
                    Self::start_timing(key, now, &mut followup);
                }
                (true, true, TimerState::Running) => {
                    debug!("key {key_index} double-tapped, timing restarted");
                    followup.cancel_timeout = true;
                    Self::start_timing(key, now, &mut followup);
                }
                (true, true, TimerState::TimedOut) => {}
                (true, false, TimerState::Running) => {
                    followup.cancel_timeout = true;
                    key.timer_state = TimerState::None;
                }
                (true, false, TimerState::TimedOut) => {
                    followup.event = Self::release(key, at);
                    key.timer_state = TimerState::None;
                }
                (true, false, TimerState::None) => {}
                (false, true, TimerState::Running) => {
                    followup.cancel_timeout = true;
                    let velocity = velocity_for(now.wrapping_sub(key.top_ts), &self.config);
                    key.timer_state = TimerState::None;
                    followup.event = Self::press(key, at, velocity);
                }
                (false, true, TimerState::TimedOut) => {
                    key.timer_state = TimerState::None;
                }
                (false, true, TimerState::None) => {
                    followup.event = Self::press(key, at, self.config.fallback_velocity);
                }
                (false, false, timer_state) => {
                    followup.event = Self::release(key, at);
                    if timer_state == TimerState::TimedOut {
                        key.timer_state = TimerState::None;
                    }
                }
            }
            followup
        }; // keys lock freed.

        self.follow_up(key_index, followup);
    }

    /// The lower switch of `key_index` didn't arrive in time.
    pub fn on_timeout(&self, key_index: usize) {
        let now = self.scheduler.now_us();
        let event = {
            let mut keys = self.keys.lock().unwrap_or_else(mutex_poison);
            let Some(key) = keys.get_mut(key_index) else {
                warn!("timeout for unknown key {key_index}");
                return;
            };

            let deadline = key.top_ts.wrapping_add(self.config.timeout_us);
            if key.timer_state != TimerState::Running || !is_due(deadline, now) {
                trace!("stale timeout for key {key_index}, {:?}", key.timer_state);
                return;
            }

            key.timer_state = TimerState::TimedOut;
            let logical_row = (key_index / self.cols) as u8;
            let col = (key_index % self.cols) as u8;
            Self::press(
                key,
                (logical_row, col, key_index, now),
                self.config.fallback_velocity,
            )
        }; // keys lock freed.

        if let Some(event) = event {
            self.key_events.emit(&event);
        }
    }

    fn on_control_event(&self, col: u8, pressed: bool) {
        if !pressed {
            return;
        }
        match ControlKey::try_from(col) {
            Ok(control_key) => {
                if !self.control_keys.emit(&control_key) {
                    trace!("{control_key:?} unclaimed");
                }
            }
            Err(col) => warn!("no control key at column {col}"),
        }
    }

    fn follow_up(&self, key_index: usize, followup: Followup) {
        if followup.cancel_timeout {
            self.scheduler.cancel(Task::KeyTimeout(key_index));
        }
        if let Some(top_ts) = followup.start_timeout {
            self.scheduler.schedule_at(
                top_ts.wrapping_add(self.config.timeout_us),
                top_ts,
                Task::KeyTimeout(key_index),
            );
        }
        if let Some(event) = followup.event {
            self.key_events.emit(&event);
        }
    }

    fn start_timing(key: &mut KeyState, now: u32, followup: &mut Followup) {
        key.top_ts = now;
        key.timer_state = TimerState::Running;
        followup.start_timeout = Some(now);
    }

    /// `None` if the key is already playing.
    fn press(key: &mut KeyState, at: KeyAt, velocity: u8) -> Option<VelocityEvent> {
        if key.playing {
            return None;
        }
        let (row, col, key_index, now) = at;
        key.playing = true;
        key.velocity = velocity;
        debug!("key {key_index} press, velocity {velocity}");
        Some(VelocityEvent {
            row,
            col,
            key_index,
            velocity,
            pressed: true,
            event_us: now,
        })
    }

    fn release(key: &mut KeyState, at: KeyAt) -> Option<VelocityEvent> {
        if !key.playing {
            return None;
        }
        let (row, col, key_index, now) = at;
        key.playing = false;
        debug!("key {key_index} release");
        Some(VelocityEvent {
            row,
            col,
            key_index,
            velocity: 0,
            pressed: false,
            event_us: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::velokeys::clock::ManualClock;
    use crate::velokeys::matrix::DiodeDirection;

    const CONFIG: VelocityConfig = VelocityConfig {
        timeout_us: 100_000,
        fallback_velocity: 150,
    };

    struct Rig {
        clock: Arc<ManualClock>,
        scheduler: Arc<Scheduler<Task>>,
        engine: Arc<VelocityEngine>,
        events: Arc<Mutex<Vec<VelocityEvent>>>,
    }

    /// Two keys wide, two logical key rows, plus a control row.
    fn rig() -> Rig {
        let geometry = MatrixGeometry {
            row_pins: vec![1, 2, 3, 4, 5],
            col_pins: vec![6, 7, 8, 9, 10, 11, 12, 13, 14],
            diode_direction: DiodeDirection::Col2Row,
            unpopulated: vec![(4, 0), (4, 1)],
        };
        let clock = Arc::new(ManualClock::new(0));
        let scheduler: Arc<Scheduler<Task>> = Arc::new(Scheduler::new(clock.clone()));
        let engine =
            Arc::new(VelocityEngine::new(&geometry, Some(4), CONFIG, scheduler.clone()).unwrap());

        let weak = Arc::downgrade(&engine);
        scheduler
            .configure(move |task| {
                if let (Task::KeyTimeout(key_index), Some(engine)) = (task, weak.upgrade()) {
                    engine.on_timeout(key_index);
                }
            })
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_cloned = events.clone();
        engine
            .key_events()
            .add_listener(move |event| events_cloned.lock().unwrap().push(*event));

        Rig {
            clock,
            scheduler,
            engine,
            events,
        }
    }

    impl Rig {
        fn at(&self, ms: u32) {
            self.clock.set(ms * 1_000);
            self.scheduler.run_pending();
        }

        fn presses(&self) -> Vec<(usize, u8)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.pressed)
                .map(|event| (event.key_index, event.velocity))
                .collect()
        }

        fn releases(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| !event.pressed)
                .count()
        }
    }

    #[test]
    fn velocity_curve() {
        assert_eq!(velocity_for(0, &CONFIG), 255);
        assert_eq!(velocity_for(20_000, &CONFIG), 204);
        assert_eq!(velocity_for(50_000, &CONFIG), 128);
        assert_eq!(velocity_for(10_000, &CONFIG), 230);
        assert_eq!(velocity_for(30_000, &CONFIG), 179);
        assert_eq!(velocity_for(99_999, &CONFIG), 0);
        assert_eq!(velocity_for(100_000, &CONFIG), 150);
        assert_eq!(velocity_for(u32::MAX, &CONFIG), 150);

        let mut last = 255;
        for elapsed_us in (0..100_000).step_by(997) {
            let velocity = velocity_for(elapsed_us, &CONFIG);
            assert!(velocity <= last);
            last = velocity;
        }
    }

    #[test]
    fn rows_must_pair_up() {
        let scheduler = Arc::new(Scheduler::new(Arc::new(ManualClock::new(0))));
        let mut geometry = MatrixGeometry {
            row_pins: vec![1, 2, 3],
            col_pins: vec![4],
            diode_direction: DiodeDirection::Row2Col,
            unpopulated: Vec::new(),
        };
        assert!(VelocityEngine::new(&geometry, None, CONFIG, scheduler.clone()).is_err());
        assert!(VelocityEngine::new(&geometry, Some(0), CONFIG, scheduler.clone()).is_err());
        let engine = VelocityEngine::new(&geometry, Some(2), CONFIG, scheduler.clone()).unwrap();
        assert_eq!(engine.num_keys(), 1);

        geometry.row_pins.pop();
        let engine = VelocityEngine::new(&geometry, None, CONFIG, scheduler).unwrap();
        assert_eq!(engine.num_keys(), 1);
    }

    #[test]
    fn measured_strike() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(2, 3, true);
        assert_eq!(rig.scheduler.len(), 1);
        rig.at(20);
        rig.engine.on_scan_event(3, 3, true);
        assert!(rig.scheduler.is_empty());

        let key_index = rig.engine.key_index(1, 3);
        assert_eq!(key_index, 12);
        assert_eq!(rig.presses(), vec![(key_index, 204)]);
        let event = rig.events.lock().unwrap()[0];
        assert_eq!((event.row, event.col, event.event_us), (1, 3, 20_000));

        let state = rig.engine.key_state(key_index).unwrap();
        assert_eq!(state.timer_state, TimerState::None);
        assert!(state.playing);

        rig.engine.on_scan_event(3, 3, false);
        rig.engine.on_scan_event(2, 3, false);
        assert_eq!(rig.releases(), 1);
    }

    #[test]
    fn timed_out_strike_presses_once() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(0, 0, true);
        rig.at(99);
        assert!(rig.presses().is_empty());
        rig.at(100);
        assert_eq!(rig.presses(), vec![(0, 150)]);
        assert_eq!(
            rig.engine.key_state(0).unwrap().timer_state,
            TimerState::TimedOut
        );

        rig.at(110);
        rig.engine.on_scan_event(1, 0, true);
        assert_eq!(rig.presses().len(), 1);
        assert_eq!(rig.engine.key_state(0).unwrap().timer_state, TimerState::None);

        rig.engine.on_scan_event(1, 0, false);
        assert_eq!(rig.releases(), 1);
    }

    #[test]
    fn partial_press_is_forgotten() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(0, 1, true);
        rig.at(30);
        rig.engine.on_scan_event(0, 1, false);
        assert!(rig.scheduler.is_empty());
        rig.at(500);
        assert!(rig.events.lock().unwrap().is_empty());
    }

    #[test]
    fn partial_press_after_timeout_releases() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(0, 1, true);
        rig.at(150);
        assert_eq!(rig.presses(), vec![(1, 150)]);
        rig.engine.on_scan_event(0, 1, false);
        assert_eq!(rig.releases(), 1);
        assert!(!rig.engine.key_state(1).unwrap().playing);
    }

    // Known edge case: the upper switch closing twice before the lower
    // one. Timing restarts from the second closing.
    #[test]
    fn double_tap_restarts_timing() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(0, 2, true);
        rig.at(60);
        rig.engine.on_scan_event(0, 2, false);
        rig.engine.on_scan_event(0, 2, true);
        assert_eq!(rig.scheduler.len(), 1);

        // The first timeout would have fired here.
        rig.at(100);
        assert!(rig.presses().is_empty());

        rig.at(110);
        rig.engine.on_scan_event(1, 2, true);
        assert_eq!(rig.presses(), vec![(2, 128)]);
    }

    #[test]
    fn double_tap_without_release() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(0, 2, true);
        rig.at(50);
        rig.engine.on_scan_event(0, 2, true);
        rig.at(149);
        assert!(rig.presses().is_empty());
        rig.at(150);
        assert_eq!(rig.presses(), vec![(2, 150)]);
    }

    #[test]
    fn stale_timeout_is_ignored() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(0, 4, true);
        rig.at(30);
        rig.engine.on_scan_event(1, 4, true);
        assert_eq!(rig.presses(), vec![(4, 179)]);

        // As if the timeout was already popped when the lower switch
        // cancelled it.
        rig.at(100);
        rig.engine.on_timeout(4);
        assert_eq!(rig.presses().len(), 1);
        assert_eq!(rig.engine.key_state(4).unwrap().timer_state, TimerState::None);

        // Running, but not for long enough.
        rig.engine.on_scan_event(1, 4, false);
        rig.engine.on_scan_event(0, 4, false);
        rig.at(200);
        rig.engine.on_scan_event(0, 4, true);
        rig.at(210);
        rig.engine.on_timeout(4);
        assert_eq!(
            rig.engine.key_state(4).unwrap().timer_state,
            TimerState::Running
        );
        assert_eq!(rig.presses().len(), 1);
        rig.engine.on_timeout(999);
    }

    #[test]
    fn lower_alone_uses_fallback() {
        let rig = rig();
        rig.at(0);
        rig.engine.on_scan_event(3, 8, true);
        rig.engine.on_scan_event(3, 8, true);
        assert_eq!(rig.presses(), vec![(17, 150)]);
        rig.engine.on_scan_event(3, 8, false);
        rig.engine.on_scan_event(3, 8, false);
        assert_eq!(rig.releases(), 1);
    }

    #[test]
    fn timing_across_the_wrap() {
        let rig = rig();
        rig.clock.set(u32::MAX - 10_000);
        rig.engine.on_scan_event(0, 0, true);
        rig.clock.advance(40_000);
        rig.scheduler.run_pending();
        rig.engine.on_scan_event(1, 0, true);
        assert_eq!(rig.presses(), vec![(0, 153)]);
    }

    #[test]
    fn control_keys_bubble() {
        let rig = rig();
        let claimed = Arc::new(Mutex::new(Vec::new()));

        let claimed_cloned = claimed.clone();
        rig.engine.control_keys().add_listener(move |key| {
            claimed_cloned.lock().unwrap().push(("menu", *key));
            true
        });
        let claimed_cloned = claimed.clone();
        rig.engine.control_keys().add_listener(move |key| {
            if *key == ControlKey::Back {
                claimed_cloned.lock().unwrap().push(("back", *key));
                true
            } else {
                false
            }
        });

        rig.engine.on_scan_event(4, 2, true);
        rig.engine.on_scan_event(4, 2, false);
        rig.engine.on_scan_event(4, 4, true);
        rig.engine.on_scan_event(4, 0, true);
        assert_eq!(
            *claimed.lock().unwrap(),
            vec![("back", ControlKey::Back), ("menu", ControlKey::Menu)]
        );
        assert!(rig.events.lock().unwrap().is_empty());
    }

    #[test]
    fn listeners_may_read_key_state() {
        let rig = rig();
        let weak = Arc::downgrade(&rig.engine);
        let states = Arc::new(Mutex::new(Vec::new()));
        let states_cloned = states.clone();
        rig.engine.key_events().add_listener(move |event| {
            let engine = weak.upgrade().unwrap();
            let state = engine.key_state(event.key_index).unwrap();
            states_cloned
                .lock()
                .unwrap()
                .push((state.timer_state, state.playing));
        });

        rig.at(0);
        rig.engine.on_scan_event(0, 0, true);
        rig.at(100);
        rig.engine.on_scan_event(0, 0, false);
        assert_eq!(
            *states.lock().unwrap(),
            vec![(TimerState::TimedOut, true), (TimerState::None, false)]
        );
    }
}
