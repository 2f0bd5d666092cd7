/** Hardware specific information should be contained to this file.
 *
 *  Matrix layout, looking at the keyboard from the player's side:
 *
 * ```text
 *     row  0  upper switches, keys  0 -  8
 *     row  1  lower switches, keys  0 -  8
 *     row  2  upper switches, keys  9 - 17
 *     row  3  lower switches, keys  9 - 17
 *       …
 *     row 10  upper switches, keys 45 - 53
 *     row 11  lower switches, keys 45 - 53
 *     row 12  control keys: -, -, Back, Select, Menu, Right1-4
 * ```
 *
 *  Columns are driven, rows are read through pull-downs (diodes
 *  column to row).
 */
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use static_assertions::const_assert;

use crate::velokeys::matrix::{DiodeDirection, EdgeCallback, MatrixGeometry, MatrixPins};
use crate::velokeys::KError;

pub const HARDWARE_NAME: &str = "Velocity keyboard, 54 keys on a 13 x 9 matrix, Raspberry Pi";

pub const NUM_ROWS: usize = 13;
pub const NUM_COLS: usize = 9;

pub const ROW_PINS: [u8; NUM_ROWS] = [4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
pub const COL_PINS: [u8; NUM_COLS] = [17, 18, 19, 20, 21, 22, 23, 24, 25];

pub const DIODE_DIRECTION: DiodeDirection = DiodeDirection::Col2Row;

pub const CONTROL_ROW: u8 = 12;

/// Cells of the control row with no switch fitted.
pub const UNPOPULATED: [(u8, u8); 2] = [(CONTROL_ROW, 0), (CONTROL_ROW, 1)];

/// Press latches on the first sample.
pub const DEBOUNCE_PRESS_MS: u32 = 0;
pub const DEBOUNCE_RELEASE_MS: u32 = 5;

pub const SCAN_PERIOD_MS: u32 = 1;

/// Idle poll period, for when interrupts can't be had.
pub const POLL_PERIOD_MS: u32 = 10;
pub const SETTLE_US: u32 = 5;
pub const POLL_BURST: u8 = 5;

pub const VELOCITY_TIMEOUT_US: u32 = 100_000;
pub const FALLBACK_VELOCITY: u8 = 150;

pub const NUM_KEYS: usize = (NUM_ROWS - 1) / 2 * NUM_COLS;

const_assert!(CONTROL_ROW as usize == NUM_ROWS - 1);
const_assert!((NUM_ROWS - 1) % 2 == 0);
const_assert!(SCAN_PERIOD_MS > 0 && SCAN_PERIOD_MS < POLL_PERIOD_MS);
const_assert!(DEBOUNCE_RELEASE_MS < (1 << crate::velokeys::debounce::DEBOUNCE_COUNTER_BITS));
const_assert!(VELOCITY_TIMEOUT_US > 0 && VELOCITY_TIMEOUT_US < (1 << 31));

/// The board's matrix layout.
pub fn geometry() -> MatrixGeometry {
    MatrixGeometry {
        row_pins: ROW_PINS.to_vec(),
        col_pins: COL_PINS.to_vec(),
        diode_direction: DIODE_DIRECTION,
        unpopulated: UNPOPULATED.to_vec(),
    }
}

/// The matrix on real GPIO lines. Outputs are driven high to select,
/// inputs are pulled down and read high through a closed switch.
#[derive(Debug)]
pub struct RppalMatrixPins {
    outputs: Vec<OutputPin>,
    inputs: Vec<InputPin>,
    _gpio: Gpio,
}

impl RppalMatrixPins {
    /// # Errors
    ///
    /// Will return `KError::Gpio` if this isn't a Raspberry Pi or a
    /// pin is already in use.
    pub fn new(geometry: &MatrixGeometry) -> Result<RppalMatrixPins, KError> {
        let gpio = Gpio::new()?;

        let mut outputs = Vec::with_capacity(geometry.outputs_len());
        for &pin in geometry.output_pins() {
            outputs.push(gpio.get(pin)?.into_output_low());
        }

        let mut inputs = Vec::with_capacity(geometry.inputs_len());
        for &pin in geometry.input_pins() {
            inputs.push(gpio.get(pin)?.into_input_pulldown());
        }

        Ok(RppalMatrixPins {
            outputs,
            inputs,
            _gpio: gpio,
        })
    }
}

impl MatrixPins for RppalMatrixPins {
    fn set_output(&mut self, output: usize, active: bool) {
        if let Some(pin) = self.outputs.get_mut(output) {
            if active {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }

    fn read_input(&mut self, input: usize) -> bool {
        self.inputs.get(input).is_some_and(InputPin::is_high)
    }

    fn enable_interrupts(&mut self, on_edge: EdgeCallback) -> Result<(), KError> {
        for pin in &mut self.inputs {
            let on_edge = on_edge.clone();
            pin.set_async_interrupt(Trigger::RisingEdge, move |_level| on_edge())?;
        }
        Ok(())
    }

    fn disable_interrupts(&mut self) -> Result<(), KError> {
        for pin in &mut self.inputs {
            pin.clear_async_interrupt()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_geometry_is_valid() {
        let geometry = geometry();
        geometry.validate().unwrap();
        assert_eq!(geometry.outputs_len(), NUM_COLS);
        assert_eq!(geometry.input_pins(), &ROW_PINS);
        assert_eq!(NUM_KEYS, 54);
        assert!(!geometry.is_populated(CONTROL_ROW, 1));
        assert!(geometry.is_populated(CONTROL_ROW, 2));
    }
}
