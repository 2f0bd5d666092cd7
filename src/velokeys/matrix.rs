/*! The matrix scan engine.
 *
 * The scanner spends most of its life Idle: every output line driven
 * active, every input line armed for a rising edge, nothing running.
 * When a switch closes, the edge callback schedules an immediate scan
 * pass and the scanner goes to Scanning. While Scanning it runs one
 * pass per scan period, rescheduling itself through the `Scheduler`,
 * until every cell's debouncer has settled back to released. Then it
 * re-arms the interrupts and is Idle again.
 *
 * If the hardware can't do edge interrupts (or they are turned off in
 * `ScanConfig`, or arming them fails) Idle means a slow poll instead,
 * one pass every poll period.
 *
 * One pass:
 *
 * 1. For each output line: drive it active, wait the settle time,
 *    sample every populated input, feed the samples into the cells'
 *    debouncers, drive it inactive again.
 *
 * 2. Report every cell whose debounced state changed, as
 *    `(row, col, pressed)`.
 *
 * 3. Decide: keep scanning or go idle.
 *
 * Passes never overlap and the reports come out in order: a pass
 * holds the pass lock from start to finish. The cell state lock is
 * only held while sampling and deciding, then dropped before the next
 * pass is scheduled and before the reports go out, so the callback may
 * look at `mode()` or `is_pressed()`, or even `disable()` the scanner.
 * The edge callback takes neither lock.
 */

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::velokeys::debounce::{DebounceConfig, DebounceState};
use crate::velokeys::scheduler::Scheduler;
use crate::velokeys::{mutex_poison, KError, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which way the diodes point, so which lines get driven.
pub enum DiodeDirection {
    /// Rows are driven, columns are sampled.
    Row2Col,

    /// Columns are driven, rows are sampled.
    Col2Row,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixGeometry {
    /// GPIO numbers, one per row.
    pub row_pins: Vec<u8>,

    /// GPIO numbers, one per column.
    pub col_pins: Vec<u8>,

    pub diode_direction: DiodeDirection,

    /// `(row, col)` cells with no switch fitted. These are never
    /// sampled and never report.
    pub unpopulated: Vec<(u8, u8)>,
}

impl MatrixGeometry {
    pub fn rows(&self) -> usize {
        self.row_pins.len()
    }

    pub fn cols(&self) -> usize {
        self.col_pins.len()
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn outputs_len(&self) -> usize {
        match self.diode_direction {
            DiodeDirection::Row2Col => self.rows(),
            DiodeDirection::Col2Row => self.cols(),
        }
    }

    pub fn inputs_len(&self) -> usize {
        match self.diode_direction {
            DiodeDirection::Row2Col => self.cols(),
            DiodeDirection::Col2Row => self.rows(),
        }
    }

    /// GPIO numbers of the driven lines, in output index order.
    pub fn output_pins(&self) -> &[u8] {
        match self.diode_direction {
            DiodeDirection::Row2Col => &self.row_pins,
            DiodeDirection::Col2Row => &self.col_pins,
        }
    }

    /// GPIO numbers of the sampled lines, in input index order.
    pub fn input_pins(&self) -> &[u8] {
        match self.diode_direction {
            DiodeDirection::Row2Col => &self.col_pins,
            DiodeDirection::Col2Row => &self.row_pins,
        }
    }

    /// Flattened cell index, `row * cols + col`.
    pub fn state_index(&self, row: u8, col: u8) -> usize {
        usize::from(row) * self.cols() + usize::from(col)
    }

    /// Which `(row, col)` a given input/output pair reads.
    pub fn index_io(&self, input: usize, output: usize) -> (u8, u8) {
        let (row, col) = match self.diode_direction {
            DiodeDirection::Row2Col => (output, input),
            DiodeDirection::Col2Row => (input, output),
        };
        (row as u8, col as u8)
    }

    pub fn is_populated(&self, row: u8, col: u8) -> bool {
        !self.unpopulated.contains(&(row, col))
    }

    /// # Errors
    ///
    /// Will return `KError::BadKeyLocation` if `(row, col)` is off
    /// the matrix.
    pub fn check_location(&self, row: u8, col: u8) -> Result<usize, KError> {
        if usize::from(row) < self.rows() && usize::from(col) < self.cols() {
            Ok(self.state_index(row, col))
        } else {
            Err(KError::BadKeyLocation {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            })
        }
    }

    /// # Errors
    ///
    /// Will return `KError::BadGeometry` if the matrix is empty, too
    /// big to address with `u8` rows and columns, uses a pin twice,
    /// or lists an unpopulated cell that isn't on the matrix.
    pub fn validate(&self) -> Result<(), KError> {
        let bad = |reason: String| Err(KError::BadGeometry { reason });

        if self.rows() == 0 || self.cols() == 0 {
            return bad(format!("empty matrix, {} x {}", self.rows(), self.cols()));
        }
        if self.rows() > usize::from(u8::MAX) || self.cols() > usize::from(u8::MAX) {
            return bad(format!("matrix too big, {} x {}", self.rows(), self.cols()));
        }

        let mut pins: Vec<u8> = self.row_pins.iter().chain(&self.col_pins).copied().collect();
        pins.sort_unstable();
        if let Some(pair) = pins.windows(2).find(|pair| pair[0] == pair[1]) {
            return bad(format!("gpio {} used twice", pair[0]));
        }

        for &(row, col) in &self.unpopulated {
            if self.check_location(row, col).is_err() {
                return bad(format!("unpopulated cell ({row}, {col}) is off the matrix"));
            }
        }
        Ok(())
    }
}

/// Called on a rising edge of any input line while interrupts are
/// enabled. Must be quick, must not block.
pub type EdgeCallback = Arc<dyn Fn() + Send + Sync>;

/// The matrix hardware, as the scanner sees it. Output and input
/// lines are numbered from 0, see `MatrixGeometry::output_pins()` and
/// `MatrixGeometry::input_pins()`.
pub trait MatrixPins: Send {
    fn set_output(&mut self, output: usize, active: bool);

    /// `true` if the line is being pulled active through a closed
    /// switch.
    fn read_input(&mut self, input: usize) -> bool;

    fn supports_interrupts(&self) -> bool {
        true
    }

    /// Arm rising-edge interrupts on every input line.
    ///
    /// # Errors
    ///
    /// Implementation specific, normally `KError::Gpio`.
    fn enable_interrupts(&mut self, on_edge: EdgeCallback) -> Result<(), KError>;

    /// # Errors
    ///
    /// Implementation specific, normally `KError::Gpio`.
    fn disable_interrupts(&mut self) -> Result<(), KError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Time between passes while Scanning.
    pub scan_period_ms: u32,

    /// Time between passes while Idle without interrupts.
    pub poll_period_ms: u32,

    /// Wait after driving an output before sampling.
    pub settle_us: u32,

    /// Extra passes after an interrupt wake, even if nothing looks
    /// pressed. A single early sample can land between bounces.
    pub poll_burst: u8,

    /// Set false to always idle by polling.
    pub use_interrupts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Not scanning, not armed, reports nothing.
    Disabled,

    /// Waiting for an edge interrupt, or polling slowly.
    Idle,

    /// Passes every scan period.
    Scanning,
}

pub type ScanCallback = Box<dyn Fn(u8, u8, bool) + Send + Sync>;

struct ScanState {
    pins: Box<dyn MatrixPins>,

    /// One per cell, indexed by `MatrixGeometry::state_index()`.
    cells: Vec<DebounceState>,

    mode: ScanMode,

    /// When the current pass was due. Advances by whole periods so
    /// passes don't drift.
    scan_time: u32,

    /// Remaining forced passes.
    poll_counter: u8,

    /// What the next pass feeds to the debouncers.
    elapsed_ms: u32,

    /// Whether `pins` currently has interrupts enabled.
    interrupts_live: bool,
}

/// How arming for edge interrupts went.
enum Arming {
    Armed,

    /// Armed, but a line was already active, so no edge is coming.
    ArmedWhileHeld,

    /// Poll instead.
    Unavailable,
}

/// What a pass leaves to do once the cell state lock is dropped.
struct PassOutcome {
    /// Cells whose debounced state flipped, in scan order.
    changes: Vec<(u8, u8, bool)>,

    /// When the next pass is due, if one is.
    next_pass_at: Option<u32>,

    /// A switch was closed while arming.
    wake: bool,
}

pub struct MatrixScanner {
    me: Weak<MatrixScanner>,
    geometry: MatrixGeometry,
    debounce: DebounceConfig,
    scan: ScanConfig,

    /// Held for a whole pass, callbacks included.
    pass: Mutex<()>,

    /// Held while sampling, never while calling out.
    state: Mutex<ScanState>,

    callback: OnceLock<ScanCallback>,
    scheduler: Arc<Scheduler<Task>>,

    /// Set while Idle with interrupts enabled. Whoever clears it first
    /// (edge callback or a pass) owns the wake.
    armed: AtomicBool,

    /// The next pass is the first one after an edge.
    wake_pending: AtomicBool,
}

impl MatrixScanner {
    /// Set up Disabled: not scanning or armed until `enable()`.
    ///
    /// The scheduler's work callback must run `read()` for every
    /// `Task::ScanPass`.
    ///
    /// # Errors
    ///
    /// Will return `KError::BadGeometry` if the geometry doesn't
    /// validate, `KError::BadConfig` if a period is zero.
    pub fn new(
        geometry: MatrixGeometry,
        debounce: DebounceConfig,
        scan: ScanConfig,
        pins: Box<dyn MatrixPins>,
        scheduler: Arc<Scheduler<Task>>,
    ) -> Result<Arc<MatrixScanner>, KError> {
        geometry.validate()?;
        if scan.scan_period_ms == 0 || scan.poll_period_ms == 0 {
            return Err(KError::BadConfig {
                reason: format!("zero scan period in {scan:?}"),
            });
        }

        let cells = vec![DebounceState::new(); geometry.len()];
        Ok(Arc::new_cyclic(|me| MatrixScanner {
            me: me.clone(),
            geometry,
            debounce,
            scan,
            pass: Mutex::new(()),
            state: Mutex::new(ScanState {
                pins,
                cells,
                mode: ScanMode::Disabled,
                scan_time: 0,
                poll_counter: 0,
                elapsed_ms: scan.scan_period_ms,
                interrupts_live: false,
            }),
            callback: OnceLock::new(),
            scheduler,
            armed: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
        }))
    }

    /// Install the `(row, col, pressed)` callback. It is called from
    /// inside a pass, so it must not call `enable()` or `read()`.
    ///
    /// # Errors
    ///
    /// `KError::AlreadyInitialized` if a callback is already installed.
    pub fn configure<F>(&self, callback: F) -> Result<(), KError>
    where
        F: Fn(u8, u8, bool) + Send + Sync + 'static,
    {
        self.callback
            .set(Box::new(callback))
            .map_err(|_| KError::AlreadyInitialized)
    }

    /// Start scanning. Runs the first pass right now, in the caller.
    pub fn enable(&self) {
        self.scheduler.cancel(Task::ScanPass);
        {
            let mut state = self.state.lock().unwrap_or_else(mutex_poison);
            state.mode = ScanMode::Scanning;
            state.scan_time = self.scheduler.now_us();
            state.poll_counter = self.scan.poll_burst;
            state.elapsed_ms = self.scan.scan_period_ms;
        }
        debug!("matrix scanner enabled");
        self.read();
    }

    /// Stop scanning and disarm. Latched cell states are kept.
    ///
    /// Safe to call from the scan callback. A pass already under way
    /// may still queue one more `Task::ScanPass`, which does nothing.
    pub fn disable(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(mutex_poison);
            self.armed.store(false, Ordering::SeqCst);
            self.wake_pending.store(false, Ordering::SeqCst);
            Self::disarm(&mut state);
            state.mode = ScanMode::Disabled;
        } // state lock freed.
        self.scheduler.cancel(Task::ScanPass);
        debug!("matrix scanner disabled");
    }

    pub fn mode(&self) -> ScanMode {
        self.state.lock().unwrap_or_else(mutex_poison).mode
    }

    /// Latched (debounced) state of one cell.
    ///
    /// # Errors
    ///
    /// Will return `KError::BadKeyLocation` if `(row, col)` is off
    /// the matrix.
    pub fn is_pressed(&self, row: u8, col: u8) -> Result<bool, KError> {
        let index = self.geometry.check_location(row, col)?;
        Ok(self.state.lock().unwrap_or_else(mutex_poison).cells[index].is_pressed())
    }

    pub fn geometry(&self) -> &MatrixGeometry {
        &self.geometry
    }

    /// What the edge interrupt does: claim the wake and ask for a pass
    /// right away. Does nothing unless armed.
    pub fn wake(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            crate::debug_waveform!(">");
            self.wake_pending.store(true, Ordering::SeqCst);
            self.scheduler.schedule(0, Task::ScanPass);
        }
    }

    /// One scan pass. Normally run by the scheduler for
    /// `Task::ScanPass`.
    pub fn read(&self) {
        let _pass = self.pass.lock().unwrap_or_else(mutex_poison);
        let now = self.scheduler.now_us();
        let Some(outcome) = self.sample_and_decide(now) else {
            return;
        }; // state lock freed.

        if let Some(next_pass_at) = outcome.next_pass_at {
            self.scheduler.cancel(Task::ScanPass);
            self.scheduler.schedule_at(next_pass_at, now, Task::ScanPass);
        }
        if outcome.wake {
            self.wake();
        }

        if let Some(callback) = self.callback.get() {
            for (row, col, pressed) in outcome.changes {
                callback(row, col, pressed);
            }
        }
    } // pass lock freed.

    /// The part of a pass done under the cell state lock. `None` if
    /// disabled.
    fn sample_and_decide(&self, now: u32) -> Option<PassOutcome> {
        let mut state = self.state.lock().unwrap_or_else(mutex_poison);
        if state.mode == ScanMode::Disabled {
            return None;
        }

        if self.wake_pending.swap(false, Ordering::SeqCst) {
            state.scan_time = now;
            state.poll_counter = self.scan.poll_burst;
            state.elapsed_ms = self.scan.scan_period_ms;
        }
        self.armed.store(false, Ordering::SeqCst);
        Self::disarm(&mut state);
        crate::debug_waveform!(".");

        self.sample_all(&mut state);

        let mut outcome = PassOutcome {
            changes: Vec::new(),
            next_pass_at: None,
            wake: false,
        };
        let mut any_active = false;
        for row in 0..self.geometry.rows() as u8 {
            for col in 0..self.geometry.cols() as u8 {
                let cell = state.cells[self.geometry.state_index(row, col)];
                any_active |= cell.is_active();
                if cell.get_changed() {
                    trace!("scan ({row}, {col}) pressed: {}", cell.is_pressed());
                    outcome.changes.push((row, col, cell.is_pressed()));
                }
            }
        }

        if state.poll_counter > 0 || any_active {
            if state.mode != ScanMode::Scanning {
                debug!("matrix scanner scanning");
            }
            state.mode = ScanMode::Scanning;
            state.poll_counter = state.poll_counter.saturating_sub(1);
            outcome.next_pass_at =
                Some(self.next_pass_at(&mut state, self.scan.scan_period_ms, now));
        } else {
            if state.mode != ScanMode::Idle {
                debug!("matrix scanner idle");
            }
            state.mode = ScanMode::Idle;
            match self.try_arm(&mut state) {
                Arming::Armed => {}
                Arming::ArmedWhileHeld => outcome.wake = true,
                Arming::Unavailable => {
                    crate::debug_waveform!("~");
                    outcome.next_pass_at =
                        Some(self.next_pass_at(&mut state, self.scan.poll_period_ms, now));
                }
            }
        }
        Some(outcome)
    }

    /// Drive each output in turn and sample the inputs it reaches.
    fn sample_all(&self, state: &mut ScanState) {
        let ScanState {
            pins,
            cells,
            elapsed_ms,
            ..
        } = state;

        for output in 0..self.geometry.outputs_len() {
            pins.set_output(output, false);
        }
        for output in 0..self.geometry.outputs_len() {
            pins.set_output(output, true);
            if self.scan.settle_us > 0 {
                thread::sleep(Duration::from_micros(self.scan.settle_us.into()));
            }
            for input in 0..self.geometry.inputs_len() {
                let (row, col) = self.geometry.index_io(input, output);
                if !self.geometry.is_populated(row, col) {
                    continue;
                }
                let active = pins.read_input(input);
                cells[self.geometry.state_index(row, col)].update(
                    active,
                    *elapsed_ms,
                    &self.debounce,
                );
            }
            pins.set_output(output, false);
        }
    }

    /// Go idle on interrupts, if we can.
    fn try_arm(&self, state: &mut ScanState) -> Arming {
        if !self.scan.use_interrupts || !state.pins.supports_interrupts() {
            return Arming::Unavailable;
        }

        for output in 0..self.geometry.outputs_len() {
            state.pins.set_output(output, true);
        }

        let me = self.me.clone();
        let on_edge: EdgeCallback = Arc::new(move || {
            if let Some(scanner) = me.upgrade() {
                scanner.wake();
            }
        });

        // Armed before the pins are, so an edge during arming isn't lost.
        self.armed.store(true, Ordering::SeqCst);
        if let Err(e) = state.pins.enable_interrupts(on_edge) {
            warn!("can't arm matrix interrupts, falling back to polling: {e}");
            self.armed.store(false, Ordering::SeqCst);
            for output in 0..self.geometry.outputs_len() {
                state.pins.set_output(output, false);
            }
            return Arming::Unavailable;
        }
        state.interrupts_live = true;
        crate::debug_waveform!("<");

        // A switch that closed between our last sample and arming
        // produced no edge.
        let inputs_len = self.geometry.inputs_len();
        if (0..inputs_len).any(|input| state.pins.read_input(input)) {
            Arming::ArmedWhileHeld
        } else {
            Arming::Armed
        }
    }

    fn disarm(state: &mut ScanState) {
        if state.interrupts_live {
            if let Err(e) = state.pins.disable_interrupts() {
                warn!("can't disarm matrix interrupts: {e}");
            }
            state.interrupts_live = false;
        }
    }

    /// Advance `scan_time` by one period and return it.
    fn next_pass_at(&self, state: &mut ScanState, period_ms: u32, now: u32) -> u32 {
        let period_us = period_ms.saturating_mul(1_000);
        let mut next = state.scan_time.wrapping_add(period_us);

        // Fell more than a period behind, don't try to catch up.
        if (now.wrapping_sub(next) as i32) >= period_us as i32 {
            next = now.wrapping_add(period_us);
        }
        state.scan_time = next;
        state.elapsed_ms = period_ms;
        next
    }
}

impl fmt::Debug for MatrixScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixScanner")
            .field("geometry", &self.geometry)
            .field("debounce", &self.debounce)
            .field("scan", &self.scan)
            .field("mode", &self.mode())
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}
