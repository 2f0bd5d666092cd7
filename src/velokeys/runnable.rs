//! Something that owns a thread of its own.

use std::thread;

use crate::velokeys::KError;

/// A long running body of work, given its own thread by `spawn()`.
pub trait Runnable: Send + 'static {
    fn run(&mut self);
}

/// Start `runnable` on a new named thread.
///
/// # Errors
///
/// Will return `KError::Spawn` if the OS refuses to create the thread.
pub fn spawn<R: Runnable>(name: &str, mut runnable: R) -> Result<thread::JoinHandle<()>, KError> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || runnable.run())
        .map_err(|source| KError::Spawn {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        sender: crossbeam_channel::Sender<String>,
    }

    impl Runnable for Counter {
        fn run(&mut self) {
            let name = thread::current().name().unwrap_or("").to_string();
            self.sender.send(name).unwrap();
        }
    }

    #[test]
    fn runs_on_named_thread() {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let handle = spawn("counter", Counter { sender }).unwrap();
        handle.join().unwrap();
        assert_eq!(receiver.recv().unwrap(), "counter");
    }
}
