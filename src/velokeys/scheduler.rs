//! A delayed-job scheduler keyed by an opaque parameter.
//!
//! Jobs are kept in one queue ordered by when they are due. The work
//! callback is called once per due job, in due order, never two at a
//! time. Due order is decided with wrapping arithmetic, so a job due
//! at `4_294_967_290` runs before one due at `10` when the counter is
//! about to wrap.
//!
//! There are two ways to drive dispatch:
//!
//! - `init()` starts a dedicated thread. It runs whatever is due and
//!   then parks until the head of the queue is due, or until
//!   `schedule()`/`cancel()` change the head and unpark it.
//!
//! - `init_timer()` hands over a reprogrammable one-shot timer. The
//!   timer is armed for the head of the queue, and its interrupt
//!   handler calls `on_timer()`.
//!
//! Either way the queue lock is held only while the queue is being
//! changed. It is released before the work callback runs, so the
//! callback may itself schedule and cancel.
//!
//! Cancelling never waits for a callback that is already running. A
//! job that has been taken off the queue to run can no longer be
//! cancelled (`cancel()` returns `false`) and its callback still
//! runs. Callbacks must check whatever state they act on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::velokeys::clock::{is_due, micros_until, Clock};
use crate::velokeys::runnable::{self, Runnable};
use crate::velokeys::{mutex_poison, KError};

/// A reprogrammable one-shot hardware timer.
pub trait OneShotTimer: Send + Sync {
    /// Fire once, `delay_us` from now, replacing any pending firing.
    fn trigger(&self, delay_us: u32);

    /// Cancel any pending firing.
    fn stop(&self);
}

pub type WorkFn<T> = Box<dyn Fn(T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job<T> {
    pub run_at: u32,
    pub param: T,
}

#[derive(Debug)]
struct JobQueue<T> {
    /// Ordered by `run_at`, in wrapping time.
    jobs: VecDeque<Job<T>>,

    /// Set while due jobs are being handed to the work callback. Any
    /// re-arming is left to the dispatcher until it finishes.
    dispatching: bool,
}

impl<T: PartialEq> JobQueue<T> {
    fn new() -> JobQueue<T> {
        JobQueue {
            jobs: VecDeque::new(),
            dispatching: false,
        }
    }

    /// Insert in time order, after any jobs due at the same time.
    /// Returns whether the new job is now the head.
    ///
    /// Every queued `run_at` is measured from `reference_now`, so a
    /// `run_at` that is numerically smaller than `reference_now` but
    /// is really in the future (the counter wrapped) sorts after
    /// everything due before the wrap.
    fn insert(&mut self, run_at: u32, reference_now: u32, param: T) -> bool {
        let offset = |at: u32| at.wrapping_sub(reference_now) as i32;
        let new_offset = offset(run_at);
        let position = self
            .jobs
            .iter()
            .position(|job| offset(job.run_at) > new_offset)
            .unwrap_or(self.jobs.len());
        self.jobs.insert(position, Job { run_at, param });
        position == 0
    }

    /// Remove the first job with this param, returning where it was.
    fn remove(&mut self, param: &T) -> Option<usize> {
        let position = self.jobs.iter().position(|job| job.param == *param)?;
        self.jobs.remove(position);
        Some(position)
    }

    fn pop_due(&mut self, now: u32) -> Option<Job<T>> {
        if is_due(self.jobs.front()?.run_at, now) {
            self.jobs.pop_front()
        } else {
            None
        }
    }

    fn head_run_at(&self) -> Option<u32> {
        self.jobs.front().map(|job| job.run_at)
    }
}

enum Dispatch {
    Thread(thread::Thread),
    Timer(Box<dyn OneShotTimer>),
}

/// Ordered delayed-job queue, see the module documentation.
pub struct Scheduler<T> {
    queue: Mutex<JobQueue<T>>,
    work: OnceLock<WorkFn<T>>,
    dispatch: OnceLock<Dispatch>,

    /// Taken by the first `init()` or `init_timer()`, before anything
    /// is spawned, so a second caller backs off with nothing to undo.
    dispatch_claimed: AtomicBool,

    /// Held for the whole of `run_pending()`, so the work callback
    /// never runs twice at once.
    single_flight: Mutex<()>,

    clock: Arc<dyn Clock>,
    shutdown: AtomicBool,
}

impl<T> Scheduler<T>
where
    T: Copy + PartialEq + fmt::Debug + Send + 'static,
{
    pub fn new(clock: Arc<dyn Clock>) -> Scheduler<T> {
        Scheduler {
            queue: Mutex::new(JobQueue::new()),
            work: OnceLock::new(),
            dispatch: OnceLock::new(),
            single_flight: Mutex::new(()),
            dispatch_claimed: AtomicBool::new(false),
            clock,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Install the work callback. Jobs that come due before this is
    /// called are dropped with a warning.
    ///
    /// # Errors
    ///
    /// `KError::AlreadyInitialized` if a callback is already installed.
    pub fn configure<F>(&self, work: F) -> Result<(), KError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.work
            .set(Box::new(work))
            .map_err(|_| KError::AlreadyInitialized)
    }

    /// Start the dispatch thread.
    ///
    /// # Errors
    ///
    /// `KError::AlreadyInitialized` if dispatch was already set up,
    /// `KError::Spawn` if the thread could not be started.
    pub fn init(self: &Arc<Self>) -> Result<thread::JoinHandle<()>, KError> {
        self.claim_dispatch()?;
        let handle = match runnable::spawn(
            "scheduler",
            SchedulerThread {
                scheduler: Arc::downgrade(self),
            },
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.dispatch_claimed.store(false, Ordering::Release);
                return Err(e);
            }
        };
        self.dispatch
            .set(Dispatch::Thread(handle.thread().clone()))
            .map_err(|_| KError::AlreadyInitialized)?;
        handle.thread().unpark();
        Ok(handle)
    }

    /// Drive dispatch from a one-shot timer instead of a thread. The
    /// timer's interrupt handler must call `on_timer()`.
    ///
    /// # Errors
    ///
    /// `KError::AlreadyInitialized` if dispatch was already set up.
    pub fn init_timer<O: OneShotTimer + 'static>(&self, timer: O) -> Result<(), KError> {
        self.claim_dispatch()?;
        self.dispatch
            .set(Dispatch::Timer(Box::new(timer)))
            .map_err(|_| KError::AlreadyInitialized)?;
        let queue = self.queue.lock().unwrap_or_else(mutex_poison);
        self.arm(&queue);
        Ok(())
    }

    pub fn now_us(&self) -> u32 {
        self.clock.now_us()
    }

    /// Run `param` after `delay_us`.
    pub fn schedule(&self, delay_us: u32, param: T) {
        let now = self.clock.now_us();
        self.schedule_at(now.wrapping_add(delay_us), now, param);
    }

    /// Run `param` at `run_at`, where `run_at` is understood relative
    /// to `reference_now` (a `run_at` numerically below
    /// `reference_now` and more than 2^31 µs before it has wrapped
    /// and is in the future).
    pub fn schedule_at(&self, run_at: u32, reference_now: u32, param: T) {
        let mut queue = self.queue.lock().unwrap_or_else(mutex_poison);
        let at_front = queue.insert(run_at, reference_now, param);
        trace!("schedule {param:?} at {run_at} (now {reference_now}), head: {at_front}");
        if at_front {
            self.arm(&queue);
        }
    } // queue lock freed.

    /// Remove the first queued job with this `param`. Returns whether
    /// one was found; `false` if it never existed or already fired.
    pub fn cancel(&self, param: T) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(mutex_poison);
        match queue.remove(&param) {
            Some(position) => {
                trace!("cancel {param:?}, was at {position}");
                if position == 0 {
                    self.arm(&queue);
                }
                true
            }
            None => false,
        }
    } // queue lock freed.

    /// Run every job that is due, in order. Returns how many ran.
    ///
    /// This is one step of the polling dispatcher, the whole of the
    /// timer interrupt handler, and a handy way to drive the
    /// scheduler by hand. Must not be called from the work callback.
    pub fn run_pending(&self) -> usize {
        let _single_flight = self.single_flight.lock().unwrap_or_else(mutex_poison);
        let mut ran = 0;
        loop {
            let job = {
                let mut queue = self.queue.lock().unwrap_or_else(mutex_poison);
                if let Some(job) = queue.pop_due(self.clock.now_us()) {
                    queue.dispatching = true;
                    job
                } else {
                    queue.dispatching = false;
                    if let Some(Dispatch::Timer(_)) = self.dispatch.get() {
                        self.arm(&queue);
                    }
                    break;
                }
            }; // queue lock freed.

            trace!("run {:?} due {}", job.param, job.run_at);
            match self.work.get() {
                Some(work) => work(job.param),
                None => warn!("no work callback configured, dropped {:?}", job.param),
            }
            ran += 1;
        }
        ran
    }

    /// The interrupt handler for `init_timer()` dispatch.
    pub fn on_timer(&self) -> usize {
        self.run_pending()
    }

    /// When the head of the queue is due.
    pub fn next_run_at(&self) -> Option<u32> {
        self.queue
            .lock()
            .unwrap_or_else(mutex_poison)
            .head_run_at()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(mutex_poison).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queue, in due order.
    pub fn jobs(&self) -> Vec<Job<T>> {
        self.queue
            .lock()
            .unwrap_or_else(mutex_poison)
            .jobs
            .iter()
            .copied()
            .collect()
    }

    /// Ask the dispatch thread to exit. Queued jobs stay queued.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(Dispatch::Thread(thread)) = self.dispatch.get() {
            thread.unpark();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn claim_dispatch(&self) -> Result<(), KError> {
        if self.dispatch_claimed.swap(true, Ordering::AcqRel) {
            return Err(KError::AlreadyInitialized);
        }
        Ok(())
    }

    /// Point the dispatch mechanism at the current head. Called with
    /// the queue lock held so two callers can't arm out of order.
    fn arm(&self, queue: &JobQueue<T>) {
        if queue.dispatching {
            return;
        }
        match self.dispatch.get() {
            None => {}
            Some(Dispatch::Thread(thread)) => thread.unpark(),
            Some(Dispatch::Timer(timer)) => match queue.head_run_at() {
                Some(run_at) => {
                    // A zero trigger never fires, one microsecond late won't hurt anyone.
                    let delay_us = micros_until(run_at, self.clock.now_us()).max(1);
                    timer.trigger(delay_us);
                }
                None => timer.stop(),
            },
        }
    }
}

impl<T> Drop for Scheduler<T> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        match self.dispatch.get() {
            Some(Dispatch::Thread(thread)) => thread.unpark(),
            Some(Dispatch::Timer(timer)) => timer.stop(),
            None => {}
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dispatch = match self.dispatch.get() {
            None => "none",
            Some(Dispatch::Thread(_)) => "thread",
            Some(Dispatch::Timer(_)) => "timer",
        };
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("dispatch", &dispatch)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// The polling dispatcher started by `Scheduler::init()`.
///
/// Holds only a weak reference, and drops the strong one before
/// parking, so the scheduler can be dropped out from under it. It
/// exits when that happens or on `shutdown()`.
struct SchedulerThread<T> {
    scheduler: Weak<Scheduler<T>>,
}

impl<T> Runnable for SchedulerThread<T>
where
    T: Copy + PartialEq + fmt::Debug + Send + 'static,
{
    fn run(&mut self) {
        thread::park(); // Wait for init() to finish.
        loop {
            let wait_us = {
                let Some(scheduler) = self.scheduler.upgrade() else {
                    break;
                };
                if scheduler.is_shut_down() {
                    break;
                }
                scheduler.run_pending();
                scheduler
                    .next_run_at()
                    .map(|run_at| micros_until(run_at, scheduler.now_us()))
            }; // scheduler Arc dropped.

            match wait_us {
                None => thread::park(),
                Some(0) => thread::yield_now(),
                Some(wait_us) => thread::park_timeout(Duration::from_micros(wait_us.into())),
            }
        }
        debug!("scheduler thread exiting");
    }
}
