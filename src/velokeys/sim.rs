//! A simulated switch matrix, for host tests and for the demo when
//! there is no GPIO to be had.
//!
//! Switches are closed and opened from the outside with `press()` and
//! `release()`. An input line reads active if any closed switch on it
//! sits on an output line that is being driven. While interrupts are
//! enabled a rising input line calls the edge callback, like the real
//! thing would.

use std::sync::{Arc, Mutex};

use crate::velokeys::matrix::{DiodeDirection, EdgeCallback, MatrixGeometry, MatrixPins};
use crate::velokeys::{mutex_poison, KError};

#[derive(Debug, Clone)]
pub struct SimMatrix {
    inner: Arc<Mutex<SimInner>>,
}

struct SimInner {
    rows: usize,
    cols: usize,
    diode_direction: DiodeDirection,
    supports_interrupts: bool,

    /// Indexed `row * cols + col`.
    closed: Vec<bool>,
    outputs: Vec<bool>,
    on_edge: Option<EdgeCallback>,

    /// Number of `read_input()` calls, handy for checking the scanner
    /// really is idle.
    samples: usize,
}

impl std::fmt::Debug for SimInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimInner")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("interrupts", &self.on_edge.is_some())
            .field("samples", &self.samples)
            .finish_non_exhaustive()
    }
}

impl SimInner {
    /// `(row, col)` for an input/output pair.
    fn cell(&self, input: usize, output: usize) -> (usize, usize) {
        match self.diode_direction {
            DiodeDirection::Row2Col => (output, input),
            DiodeDirection::Col2Row => (input, output),
        }
    }

    fn input_of(&self, row: usize, col: usize) -> usize {
        match self.diode_direction {
            DiodeDirection::Row2Col => col,
            DiodeDirection::Col2Row => row,
        }
    }

    fn level(&self, input: usize) -> bool {
        self.outputs.iter().enumerate().any(|(output, &driven)| {
            let (row, col) = self.cell(input, output);
            driven && self.closed[row * self.cols + col]
        })
    }
}

impl SimMatrix {
    pub fn new(geometry: &MatrixGeometry) -> SimMatrix {
        SimMatrix {
            inner: Arc::new(Mutex::new(SimInner {
                rows: geometry.rows(),
                cols: geometry.cols(),
                diode_direction: geometry.diode_direction,
                supports_interrupts: true,
                closed: vec![false; geometry.len()],
                outputs: vec![false; geometry.outputs_len()],
                on_edge: None,
                samples: 0,
            })),
        }
    }

    /// Hardware that can only be polled.
    #[must_use]
    pub fn without_interrupts(self) -> SimMatrix {
        self.inner
            .lock()
            .unwrap_or_else(mutex_poison)
            .supports_interrupts = false;
        self
    }

    pub fn press(&self, row: u8, col: u8) {
        self.set(row, col, true);
    }

    pub fn release(&self, row: u8, col: u8) {
        self.set(row, col, false);
    }

    /// Close or open one switch. Out of range cells are ignored.
    pub fn set(&self, row: u8, col: u8, closed: bool) {
        let (row, col) = (usize::from(row), usize::from(col));
        let on_edge = {
            let mut inner = self.inner.lock().unwrap_or_else(mutex_poison);
            if row >= inner.rows || col >= inner.cols {
                return;
            }
            let input = inner.input_of(row, col);
            let before = inner.level(input);
            let index = row * inner.cols + col;
            inner.closed[index] = closed;
            let after = inner.level(input);
            if !before && after {
                inner.on_edge.clone()
            } else {
                None
            }
        }; // inner lock freed.

        if let Some(on_edge) = on_edge {
            on_edge();
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(mutex_poison)
            .on_edge
            .is_some()
    }

    pub fn samples(&self) -> usize {
        self.inner.lock().unwrap_or_else(mutex_poison).samples
    }
}

impl MatrixPins for SimMatrix {
    fn set_output(&mut self, output: usize, active: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(mutex_poison);
        if let Some(driven) = inner.outputs.get_mut(output) {
            *driven = active;
        }
    }

    fn read_input(&mut self, input: usize) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(mutex_poison);
        inner.samples += 1;
        inner.level(input)
    }

    fn supports_interrupts(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(mutex_poison)
            .supports_interrupts
    }

    fn enable_interrupts(&mut self, on_edge: EdgeCallback) -> Result<(), KError> {
        let mut inner = self.inner.lock().unwrap_or_else(mutex_poison);
        if !inner.supports_interrupts {
            return Err(KError::BadConfig {
                reason: "simulated matrix has no interrupts".to_string(),
            });
        }
        inner.on_edge = Some(on_edge);
        Ok(())
    }

    fn disable_interrupts(&mut self) -> Result<(), KError> {
        self.inner.lock().unwrap_or_else(mutex_poison).on_edge = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn geometry() -> MatrixGeometry {
        MatrixGeometry {
            row_pins: vec![1, 2],
            col_pins: vec![3, 4, 5],
            diode_direction: DiodeDirection::Col2Row,
            unpopulated: Vec::new(),
        }
    }

    #[test]
    fn input_needs_driven_output() {
        let mut sim = SimMatrix::new(&geometry());
        sim.press(1, 2);
        assert!(!sim.read_input(1));
        sim.set_output(2, true);
        assert!(sim.read_input(1));
        assert!(!sim.read_input(0));
        sim.set_output(2, false);
        sim.set_output(0, true);
        assert!(!sim.read_input(1));
        assert_eq!(sim.samples(), 4);
    }

    #[test]
    fn edge_only_on_rising_armed_line() {
        let mut sim = SimMatrix::new(&geometry());
        let edges = Arc::new(AtomicUsize::new(0));
        let edges_cloned = edges.clone();
        for output in 0..3 {
            sim.set_output(output, true);
        }
        sim.enable_interrupts(Arc::new(move || {
            edges_cloned.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        sim.press(0, 0);
        sim.press(0, 1); // Row 0 already high.
        sim.release(0, 0);
        sim.press(1, 1);
        assert_eq!(edges.load(Ordering::SeqCst), 2);

        sim.disable_interrupts().unwrap();
        sim.press(1, 2);
        sim.release(0, 1);
        sim.release(1, 1);
        sim.release(1, 2);
        sim.press(1, 0);
        assert_eq!(edges.load(Ordering::SeqCst), 2);
        assert!(!sim.interrupts_enabled());
    }

    #[test]
    fn polled_only_refuses_interrupts() {
        let mut sim = SimMatrix::new(&geometry()).without_interrupts();
        assert!(!sim.supports_interrupts());
        assert!(sim.enable_interrupts(Arc::new(|| {})).is_err());
    }
}
