/*!

# Work in Progress

This is a work-in-progress, and like everything I do in Rust these
days, the real purpose is to be educational.

# The Problem

I want a keyboard that knows how hard it was hit. A musical keyboard,
for playing notes into a synth, where a gentle touch comes out quiet
and a hard strike comes out loud. MIDI calls this "velocity".

The usual trick, and the one I am using, is two switches under every
key. One closes near the top of the key's travel, the other at the
bottom. Hit the key hard and the two close within a few milliseconds
of each other; press it gently and it might take a tenth of a second.
Measure that time, turn it into a number from 0 to 255, done.

Except that "done" hides most of the fun.

## Lay of the Land

- 54 keys, so 108 switches, plus a few control buttons.

- Nobody has 117 spare GPIO lines, so the switches sit in a matrix:
  13 rows by 9 columns, a diode on every switch. Drive one column,
  read all 13 rows, next column.

- This is Raspberry Pi hardware, so I am again using the
  [rppal](https://docs.rs/rppal/latest/rppal/) crate for GPIO.

## Scanning Without Burning the CPU

Scanning the matrix every millisecond forever works, but it is a
silly way to spend a CPU when the keyboard is mostly sitting
there. So when nothing is pressed I drive every column, arm a
rising-edge interrupt on every row, and go to sleep. The first edge
wakes up the scanner, which scans every millisecond until every switch
has been released and settled again, and then goes back to sleep.

If the interrupts can't be had the scanner falls back to a slow poll.

## Debouncing, Again

Last time (the Keybow) I used a thread per key, sleeping until the
bouncing stopped. That doesn't fit a matrix, where I only see a
switch when I scan it. So this time each switch gets an integrator:
count up while the sample disagrees with what we believe, count down
while it agrees, flip when the count reaches the threshold. Presses
flip on the first sample (I want that timing to be as sharp as I can
get it), releases have to hold for a few milliseconds.

## One Scheduler for Everything

Two things need to happen "later": the next scan pass, and giving up
on a key whose bottom switch never arrived. Rather than a thread for
each, there is one scheduler: an ordered queue of jobs, worked off by
one thread that parks until the next job is due. Or, on hardware that
has one, by a one-shot timer interrupt.

Time is a microsecond counter that wraps every 71 minutes. All the
comparisons are done on wrapping differences, and there are tests
that start the clock a few milliseconds before the wrap to prove it.

## Events

Clients register for the key events they want, exactly like with the
Keybow: a press mask, a release mask, a queue length. Any number of
threads, or tokio tasks, can register, come and go as they please.

# Examples

At the moment `src/main.rs` is a fairly minimal example. On the real
keyboard it prints key events until you press Back. Anywhere else it
plays a few simulated strikes and prints what they came out as.

Try `RUST_LOG=velokeys=debug cargo run`.

 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;

use velokeys::velokeys;

/// Simple main() function, at this point mostly an example for using
/// `velokeys` module.
fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = velokeys::KeyboardConfig::default();
    let clock: Arc<dyn velokeys::Clock> = Arc::new(velokeys::SystemClock::new());

    match velokeys::hw_specific::RppalMatrixPins::new(&config.geometry) {
        Ok(pins) => play(&velokeys::Keyboard::new(config, pins, clock)?),
        Err(e) => {
            println!(
                "No {} here ({e}), simulating instead…",
                velokeys::hw_specific::HARDWARE_NAME
            );
            simulate(config, clock)
        }
    }
}

/// Print key events until Back is pressed.
fn play(keyboard: &velokeys::Keyboard) -> anyhow::Result<()> {
    let quit = Arc::new(AtomicBool::new(false));
    let quit_cloned = quit.clone();
    keyboard.control_keys().add_listener(move |key| {
        println!("Control key {key:?}");
        if *key == velokeys::ControlKey::Back {
            quit_cloned.store(true, Ordering::SeqCst);
        }
        true
    });

    let everything = vec![true; keyboard.num_keys()];
    let mut reg = keyboard.register_events(&everything, &everything, 64, Duration::MAX);
    keyboard.start()?;
    println!("Play some notes, Back to quit…");

    while !quit.load(Ordering::SeqCst) {
        if let Some(event) = reg.wait_next_key_event(Duration::from_millis(250)) {
            print_event(&event);
        }
    }

    keyboard.stop();
    Ok(())
}

/// A few strikes on a simulated keyboard, soft to hard.
fn simulate(config: velokeys::KeyboardConfig, clock: Arc<dyn velokeys::Clock>) -> anyhow::Result<()> {
    let sim = velokeys::sim::SimMatrix::new(&config.geometry);
    let keyboard = velokeys::Keyboard::new(config, sim.clone(), clock)?;

    let everything = vec![true; keyboard.num_keys()];
    let reg = keyboard.register_events(&everything, &everything, 64, Duration::from_millis(300));
    keyboard.start()?;

    // (key row, column, milliseconds from upper to lower switch)
    let strikes: [(u8, u8, u64); 5] = [(0, 0, 80), (1, 4, 40), (2, 2, 15), (3, 8, 3), (5, 5, 150)];
    let player = thread::spawn(move || {
        for (key_row, col, upper_to_lower_ms) in strikes {
            let (upper, lower) = (key_row * 2, key_row * 2 + 1);
            sim.press(upper, col);
            thread::sleep(Duration::from_millis(upper_to_lower_ms));
            sim.press(lower, col);
            thread::sleep(Duration::from_millis(100));
            sim.release(lower, col);
            sim.release(upper, col);
            thread::sleep(Duration::from_millis(50));
        }
    });

    // Iterator ends once nothing happens for `iter_timeout`.
    for event in reg {
        print_event(&event);
    }
    if player.join().is_err() {
        anyhow::bail!("simulated player panicked");
    }

    keyboard.stop();
    info!("simulation done");
    Ok(())
}

fn print_event(event: &velokeys::KeyEvent) {
    match event.key_position {
        velokeys::KeyPosition::Down => println!(
            "key {:2} (row {}, col {}) down, velocity {:3}   #{}",
            event.key_index, event.row, event.col, event.velocity, event.event_num
        ),
        velokeys::KeyPosition::Up => println!(
            "key {:2} (row {}, col {}) up                #{}",
            event.key_index, event.row, event.col, event.event_num
        ),
    }
}
