/** Prints to stderr, does not append a new line, and immediately
 * flushes output.
 *
 * This is the debug version, there is a no-op non-debug version,
 * too. To build with non-debug version do not build with `--features
 * debug_waveform_print`.
 */
#[cfg(feature = "debug_waveform_print")]
#[macro_export]
macro_rules! debug_waveform {
    ($( $args:expr ),*) => { eprint!( $( $args ),* ); let _ = std::io::Write::flush(&mut std::io::stderr()); }
}

/** No-op, non-debug version of the macro.
 *
 *  The other, debug, version prints to stderr, does not append a new
 *  line, and immediately flushes output. It draws an ASCII-ish
 *  "waveform" of what the matrix scanner is doing:
 *
 *  - `>` an edge interrupt woke the scanner.
 *
 *  - `.` one scan pass.
 *
 *  - `<` interrupts re-armed, the scanner is idle.
 *
 *  - `~` idle without interrupts, polling slowly.
 *
 *  So a quick tap looks something like `>......<`.
 *
 *   To run the debug version:
 *
 * ```sh
 *   cargo run --features debug_waveform_print
 * ```
 */
#[macro_export]
#[cfg(not(feature = "debug_waveform_print"))]
macro_rules! debug_waveform {
    ($( $args:expr ),*) => {};
}
