use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::velokeys::debounce::DebounceConfig;
use crate::velokeys::matrix::{MatrixGeometry, MatrixPins, MatrixScanner, ScanConfig};
use crate::velokeys::scheduler::{OneShotTimer, Scheduler};
use crate::velokeys::velocity::{KeyState, VelocityConfig, VelocityEngine, VelocityEvent};
use crate::velokeys::{
    hw_specific, mutex_poison, Bubbling, Clock, ControlKey, EventReg, EventRegAsync,
    EventRegInner, KError, KeyEvent, KeyPosition, Task,
};

type EventRegs = Arc<Mutex<Vec<Weak<Mutex<EventRegInner>>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Everything a `Keyboard` needs to know about the board. `default()`
/// describes the real one, see `hw_specific`.
pub struct KeyboardConfig {
    pub geometry: MatrixGeometry,
    pub debounce: DebounceConfig,
    pub scan: ScanConfig,
    pub velocity: VelocityConfig,

    /// Matrix row holding the control keys, if there is one. Must be
    /// the last row.
    pub control_row: Option<u8>,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        KeyboardConfig {
            geometry: hw_specific::geometry(),
            debounce: DebounceConfig {
                press_threshold_ms: hw_specific::DEBOUNCE_PRESS_MS,
                release_threshold_ms: hw_specific::DEBOUNCE_RELEASE_MS,
            },
            scan: ScanConfig {
                scan_period_ms: hw_specific::SCAN_PERIOD_MS,
                poll_period_ms: hw_specific::POLL_PERIOD_MS,
                settle_us: hw_specific::SETTLE_US,
                poll_burst: hw_specific::POLL_BURST,
                use_interrupts: true,
            },
            velocity: VelocityConfig {
                timeout_us: hw_specific::VELOCITY_TIMEOUT_US,
                fallback_velocity: hw_specific::FALLBACK_VELOCITY,
            },
            control_row: Some(hw_specific::CONTROL_ROW),
        }
    }
}

impl KeyboardConfig {
    /// # Errors
    ///
    /// Will return `KError::BadGeometry` or `KError::BadConfig`
    /// describing the first problem found.
    pub fn validate(&self) -> Result<(), KError> {
        self.geometry.validate()?;

        let bad = |reason: String| Err(KError::BadConfig { reason });
        if self.scan.scan_period_ms == 0 || self.scan.poll_period_ms == 0 {
            return bad(format!("zero scan period in {:?}", self.scan));
        }
        // Deadlines must stay within half the clock's range to compare.
        if self.velocity.timeout_us == 0 || self.velocity.timeout_us >= 1 << 31 {
            return bad(format!("velocity timeout {} µs", self.velocity.timeout_us));
        }
        if let Some(control_row) = self.control_row {
            if usize::from(control_row) + 1 != self.geometry.rows() {
                return bad(format!("control row {control_row} is not the last row"));
            }
        }
        Ok(())
    }
}

/// A whole velocity keyboard: scanner, velocity engine, and the
/// scheduler they share, plus the client registrations key events are
/// queued for.
#[derive(Debug)]
pub struct Keyboard {
    clock: Arc<dyn Clock>,
    scheduler: Arc<Scheduler<Task>>,
    scanner: Arc<MatrixScanner>,
    velocity: Arc<VelocityEngine>,

    /// What key events clients have registered for. Held weakly, a
    /// registration goes away when its client drops it.
    event_regs: EventRegs,
    scheduler_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Keyboard {
    /// Build and wire everything. Nothing runs until `start()`.
    ///
    /// # Errors
    ///
    /// Will return `KError::BadGeometry` or `KError::BadConfig` if
    /// `config` doesn't validate.
    pub fn new<P: MatrixPins + 'static>(
        config: KeyboardConfig,
        pins: P,
        clock: Arc<dyn Clock>,
    ) -> Result<Keyboard, KError> {
        config.validate()?;

        let scheduler = Arc::new(Scheduler::new(clock.clone()));
        let velocity = Arc::new(VelocityEngine::new(
            &config.geometry,
            config.control_row,
            config.velocity,
            scheduler.clone(),
        )?);
        let scanner = MatrixScanner::new(
            config.geometry,
            config.debounce,
            config.scan,
            Box::new(pins),
            scheduler.clone(),
        )?;

        // Components only know each other weakly, dropping the
        // `Keyboard` drops them all.
        let velocity_weak = Arc::downgrade(&velocity);
        scanner.configure(move |row, col, pressed| {
            if let Some(velocity) = velocity_weak.upgrade() {
                velocity.on_scan_event(row, col, pressed);
            }
        })?;

        let scanner_weak = Arc::downgrade(&scanner);
        let velocity_weak = Arc::downgrade(&velocity);
        scheduler.configure(move |task| match task {
            Task::ScanPass => {
                if let Some(scanner) = scanner_weak.upgrade() {
                    scanner.read();
                }
            }
            Task::KeyTimeout(key_index) => {
                if let Some(velocity) = velocity_weak.upgrade() {
                    velocity.on_timeout(key_index);
                }
            }
        })?;

        let event_regs: EventRegs = Arc::new(Mutex::new(Vec::new()));
        let event_regs_cloned = event_regs.clone();
        velocity
            .key_events()
            .add_listener(move |event| Keyboard::process_event_regs(&event_regs_cloned, event));

        Ok(Keyboard {
            clock,
            scheduler,
            scanner,
            velocity,
            event_regs,
            scheduler_thread: Mutex::new(None),
        })
    }

    /// Start the scheduler thread and scanning.
    ///
    /// # Errors
    ///
    /// Will return `KError::AlreadyInitialized` if already started,
    /// `KError::Spawn` if the scheduler thread won't start.
    pub fn start(&self) -> Result<(), KError> {
        let handle = self.scheduler.init()?;
        *self.scheduler_thread.lock().unwrap_or_else(mutex_poison) = Some(handle);
        self.scanner.enable();
        debug!("keyboard started");
        Ok(())
    }

    /// Like `start()`, but dispatch is driven by a hardware one-shot
    /// timer whose interrupt handler calls `scheduler().on_timer()`.
    ///
    /// # Errors
    ///
    /// Will return `KError::AlreadyInitialized` if already started.
    pub fn start_with_timer<O: OneShotTimer + 'static>(&self, timer: O) -> Result<(), KError> {
        self.scheduler.init_timer(timer)?;
        self.scanner.enable();
        debug!("keyboard started on one-shot timer");
        Ok(())
    }

    /// Stop scanning and wait for the scheduler thread to exit. Can't
    /// be restarted.
    pub fn stop(&self) {
        self.scanner.disable();
        self.scheduler.shutdown();

        let handle = self
            .scheduler_thread
            .lock()
            .unwrap_or_else(mutex_poison)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("stop() called from the scheduler thread, not joining");
            } else if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        debug!("keyboard stopped");
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<Task>> {
        &self.scheduler
    }

    pub fn scanner(&self) -> &Arc<MatrixScanner> {
        &self.scanner
    }

    pub fn velocity(&self) -> &Arc<VelocityEngine> {
        &self.velocity
    }

    /// Where control key presses go. Return `true` from a listener to
    /// keep older listeners from seeing the press.
    pub fn control_keys(&self) -> &Bubbling<ControlKey> {
        self.velocity.control_keys()
    }

    pub fn num_keys(&self) -> usize {
        self.velocity.num_keys()
    }

    /// Velocity state of one key.
    ///
    /// # Errors
    ///
    /// Will return `KError::BadKeyLocation` for a key that doesn't
    /// exist.
    pub fn key_state(&self, key_index: usize) -> Result<KeyState, KError> {
        self.velocity
            .key_state(key_index)
            .ok_or_else(|| KError::BadKeyLocation {
                row: (key_index / self.scanner.geometry().cols()).min(255) as u8,
                col: (key_index % self.scanner.geometry().cols()) as u8,
                rows: self.num_keys() / self.scanner.geometry().cols(),
                cols: self.scanner.geometry().cols(),
            })
    }

    /// Used by client code to register for specific key events.
    ///
    /// # Arguments
    ///
    /// * `press_mask` One bool per key (by key index), true if you
    ///    want press events. Missing keys count as false.
    /// * `release_mask` Same, for release events.
    /// * `queue_length` Number of key events to queue. If queue
    ///    overflows oldest events will be discarded.
    /// * `iter_timeout` Timeout used when reading key events via
    ///    iterator.
    pub fn register_events(
        &self,
        press_mask: &[bool],
        release_mask: &[bool],
        queue_length: usize,
        iter_timeout: Duration,
    ) -> EventReg {
        let num_keys = self.num_keys();
        let fit = |mask: &[bool]| {
            let mut mask = mask.to_vec();
            mask.resize(num_keys, false);
            mask
        };

        let (async_sender, async_receiver) = tokio::sync::watch::channel(());
        let (sync_sender, sync_receiver) = crossbeam_channel::bounded(1);
        let queue_capacity = queue_length.max(1);
        let register = EventRegInner {
            press_mask: fit(press_mask),
            release_mask: fit(release_mask),
            event_queue: Arc::new(Mutex::new(VecDeque::with_capacity(queue_capacity))),
            queue_capacity,
            async_sender,
            async_receiver,
            sync_sender,
            sync_receiver,
            event_count: 0,
        };
        let register_mutex = Arc::new(Mutex::new(register));
        self.event_regs
            .lock()
            .unwrap_or_else(mutex_poison)
            .push(Arc::downgrade(&register_mutex));

        EventReg {
            reg_inner: register_mutex,
            iter_timeout,
            queue_capacity,
        }
    }

    /// Async (Tokio) flavor of `register_events()`.
    pub fn register_events_async(
        &self,
        press_mask: &[bool],
        release_mask: &[bool],
        queue_length: usize,
    ) -> EventRegAsync {
        let real_event_reg =
            self.register_events(press_mask, release_mask, queue_length, Duration::MAX);
        let queue_capacity = real_event_reg.queue_capacity;
        EventRegAsync {
            real_event_reg,
            queue_capacity,
        }
    }

    /// Number of live client registrations.
    pub fn num_registrations(&self) -> usize {
        self.event_regs
            .lock()
            .unwrap_or_else(mutex_poison)
            .iter()
            .filter(|reg| reg.strong_count() > 0)
            .count()
    }

    /// Hand one key event to every registration, forgetting any whose
    /// client has gone away.
    fn process_event_regs(event_regs: &EventRegs, event: &VelocityEvent) {
        let key_event = KeyEvent {
            row: event.row,
            col: event.col,
            key_index: event.key_index,
            velocity: event.velocity,
            key_position: KeyPosition::from(event.pressed),
            event_us: event.event_us,
            event_num: 0,
            additional_events_still_queued: 0,
        };

        let live: Vec<Arc<Mutex<EventRegInner>>> = {
            let mut event_regs = event_regs.lock().unwrap_or_else(mutex_poison);
            event_regs.retain(|reg| reg.strong_count() > 0);
            event_regs.iter().filter_map(Weak::upgrade).collect()
        }; // event_regs lock freed.

        for reg in live {
            reg.lock()
                .unwrap_or_else(mutex_poison)
                .process_one_event(key_event);
        }
    }
}

impl Drop for Keyboard {
    fn drop(&mut self) {
        self.scanner.disable();
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::velokeys::clock::ManualClock;
    use crate::velokeys::sim::SimMatrix;

    #[test]
    fn default_config_is_the_board() {
        let config = KeyboardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.geometry.rows(), hw_specific::NUM_ROWS);
        assert_eq!(config.control_row, Some(12));
    }

    #[test]
    fn bad_configs_rejected() {
        let mut config = KeyboardConfig::default();
        config.control_row = Some(3);
        assert!(matches!(config.validate(), Err(KError::BadConfig { .. })));

        let mut config = KeyboardConfig::default();
        config.velocity.timeout_us = 0;
        assert!(config.validate().is_err());

        let mut config = KeyboardConfig::default();
        config.scan.poll_period_ms = 0;
        assert!(config.validate().is_err());

        let mut config = KeyboardConfig::default();
        config.geometry.col_pins[0] = config.geometry.row_pins[0];
        assert!(matches!(
            config.validate(),
            Err(KError::BadGeometry { .. })
        ));
    }

    #[test]
    fn dropped_registrations_are_forgotten() {
        let config = KeyboardConfig::default();
        let sim = SimMatrix::new(&config.geometry);
        let keyboard = Keyboard::new(config, sim, Arc::new(ManualClock::new(0))).unwrap();
        assert_eq!(keyboard.num_keys(), 54);

        let kept = keyboard.register_events(&[true], &[], 4, Duration::ZERO);
        let dropped = keyboard.register_events(&[true], &[true], 4, Duration::ZERO);
        assert_eq!(keyboard.num_registrations(), 2);
        assert_eq!(kept.num_keys(), 54);
        drop(dropped);
        assert_eq!(keyboard.num_registrations(), 1);

        // An event sweeps the dead one out.
        keyboard.velocity().on_scan_event(1, 0, true);
        assert_eq!(keyboard.event_regs.lock().unwrap().len(), 1);
        assert_eq!(kept.event_count(), 1);

        assert!(keyboard.key_state(0).unwrap().playing);
        assert!(matches!(
            keyboard.key_state(54),
            Err(KError::BadKeyLocation { .. })
        ));
    }
}
