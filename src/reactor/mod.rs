//! Single-threaded reactor
//!
//! Executes two kinds of work on one dedicated OS thread:
//! - timing tasks, ordered by absolute deadline and cancellable through a
//!   [`TimerHandle`];
//! - one-shot tasks submitted from any thread through a [`ReactorHandle`].
//!
//! ```text
//! any thread:   handle.submit_task(f) ──► crossbeam channel ─┐
//!                                                            ▼
//! reactor thread:  loop { drain channel; run earliest due of (queued task, timer);
//!                         wait until next deadline or wake }
//! ```
//!
//! Every task receives `&mut S` (the state owned by the loop) and the
//! [`Scheduler`], so state is only ever touched from the reactor thread. Tasks
//! must not block. A task reports failure through its own callback or channel,
//! the reactor never sees task errors.


use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::constants::MAX_IDLE_WAIT;
use crate::Error;
use crate::Result;

pub type Task<S> = Box<dyn FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static>;

enum Envelope<S> {
    Run { enqueued: Instant, task: Task<S> },
    Wake,
}

/// Handle of a scheduled timing task.
///
/// Sequence numbers are never reused, so a handle whose task already fired or
/// was cancelled can be cancelled again safely: it simply matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle {
    deadline: Instant,
    seq: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn key(&self) -> (Instant, u64) {
        (self.deadline, self.seq)
    }
}

/// Thread-safe entry point into a reactor.
pub struct ReactorHandle<S> {
    sender: Sender<Envelope<S>>,
    stopped: Arc<AtomicBool>,
}

impl<S> Clone for ReactorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<S> std::fmt::Debug for ReactorHandle<S> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("queued", &self.sender.len())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S: 'static> ReactorHandle<S> {
    /// Enqueues a one-shot task and wakes the loop.
    ///
    /// Returns `false` if the reactor was stopped; the task is dropped.
    pub fn submit_task<F>(
        &self,
        task: F,
    ) -> bool
    where
        F: FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    {
        if self.is_stopped() {
            trace!("reactor stopped, task dropped");
            return false;
        }
        self.sender
            .send(Envelope::Run {
                enqueued: Instant::now(),
                task: Box::new(task),
            })
            .is_ok()
    }

    /// Requests loop exit. Idempotent, callable from any thread.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(Envelope::Wake);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Reactor-thread side of scheduling, handed to every task.
pub struct Scheduler<S> {
    timers: BTreeMap<(Instant, u64), Task<S>>,
    queued: VecDeque<(Instant, Task<S>)>,
    next_seq: u64,
    handle: ReactorHandle<S>,
}

impl<S: 'static> Scheduler<S> {
    fn new(handle: ReactorHandle<S>) -> Self {
        Self {
            timers: BTreeMap::new(),
            queued: VecDeque::new(),
            next_seq: 0,
            handle,
        }
    }

    /// Schedules `task` to run once `delay` has elapsed.
    pub fn add_timing_task<F>(
        &mut self,
        delay: Duration,
        task: F,
    ) -> TimerHandle
    where
        F: FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    {
        self.next_seq += 1;
        let handle = TimerHandle {
            deadline: Instant::now() + delay,
            seq: self.next_seq,
        };
        self.timers.insert(handle.key(), Box::new(task));
        handle
    }

    /// Removes a pending timing task. Returns whether it was still pending.
    pub fn cancel_timing_task(
        &mut self,
        handle: TimerHandle,
    ) -> bool {
        self.timers.remove(&handle.key()).is_some()
    }

    pub fn is_pending(
        &self,
        handle: TimerHandle,
    ) -> bool {
        self.timers.contains_key(&handle.key())
    }

    /// Defers `task` behind the work already queued on this thread.
    pub fn submit_task<F>(
        &mut self,
        task: F,
    ) where
        F: FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    {
        self.queued.push_back((Instant::now(), Box::new(task)));
    }

    /// Handle for callbacks that complete on other threads.
    pub fn handle(&self) -> ReactorHandle<S> {
        self.handle.clone()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }
}

/// The loop itself. Owns the state `S` and the timers.
pub struct Reactor<S> {
    state: S,
    scheduler: Scheduler<S>,
    receiver: Receiver<Envelope<S>>,
}

impl<S: Send + 'static> Reactor<S> {
    pub fn new(state: S) -> Self {
        let (sender, receiver) = unbounded();
        let handle = ReactorHandle {
            sender,
            stopped: Arc::new(AtomicBool::new(false)),
        };
        Self {
            state,
            scheduler: Scheduler::new(handle),
            receiver,
        }
    }

    pub fn handle(&self) -> ReactorHandle<S> {
        self.scheduler.handle()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    /// Runs `f` inline with the same access a task gets.
    pub fn execute<R>(
        &mut self,
        f: impl FnOnce(&mut S, &mut Scheduler<S>) -> R,
    ) -> R {
        f(&mut self.state, &mut self.scheduler)
    }

    fn accept(
        &mut self,
        envelope: Envelope<S>,
    ) {
        if let Envelope::Run { enqueued, task } = envelope {
            self.scheduler.queued.push_back((enqueued, task));
        }
    }

    fn drain_submitted(&mut self) {
        while let Ok(envelope) = self.receiver.try_recv() {
            self.accept(envelope);
        }
    }

    /// Executes at most one task: the earliest of the next queued one-shot task
    /// and the next expired timer. Returns whether something ran.
    pub fn run_once(&mut self) -> bool {
        self.drain_submitted();
        let now = Instant::now();

        let due_timer = self
            .scheduler
            .timers
            .keys()
            .next()
            .copied()
            .filter(|(deadline, _)| *deadline <= now);
        let queued_at = self.scheduler.queued.front().map(|(enqueued, _)| *enqueued);

        let run_queued = match (due_timer, queued_at) {
            (Some((deadline, _)), Some(enqueued)) => enqueued < deadline,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => return false,
        };

        if run_queued {
            if let Some((_, task)) = self.scheduler.queued.pop_front() {
                task(&mut self.state, &mut self.scheduler);
            }
        } else if let Some(key) = due_timer {
            if let Some(task) = self.scheduler.timers.remove(&key) {
                trace!(seq = key.1, "timing task fired");
                task(&mut self.state, &mut self.scheduler);
            }
        }
        true
    }

    /// Runs until [`ReactorHandle::stop`] is called.
    pub fn run(&mut self) {
        debug!("Reactor loop started");
        let stopped = self.scheduler.handle.stopped.clone();

        while !stopped.load(Ordering::SeqCst) {
            while !stopped.load(Ordering::SeqCst) && self.run_once() {}
            if stopped.load(Ordering::SeqCst) {
                break;
            }

            let wait = self
                .scheduler
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(MAX_IDLE_WAIT)
                .min(MAX_IDLE_WAIT);

            crossbeam_channel::select! {
                recv(self.receiver) -> envelope => {
                    match envelope {
                        Ok(envelope) => self.accept(envelope),
                        Err(_) => {
                            warn!("Reactor channel closed unexpectedly");
                            break;
                        }
                    }
                }
                default(wait) => {}
            }
        }

        debug!(
            dropped_timers = self.scheduler.timers.len(),
            dropped_tasks = self.scheduler.queued.len(),
            "Reactor loop stopped"
        );
    }

    /// Moves the reactor onto its own named thread.
    pub fn spawn(
        self,
        name: &str,
    ) -> Result<ReactorThread<S>> {
        let handle = self.handle();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut reactor = self;
                reactor.run();
                reactor.state
            })
            .map_err(|e| Error::Fatal(format!("failed to spawn reactor thread {name}: {e}")))?;

        Ok(ReactorThread {
            handle,
            join: Mutex::new(Some(join)),
        })
    }
}

/// A reactor running on its own thread.
pub struct ReactorThread<S> {
    handle: ReactorHandle<S>,
    join: Mutex<Option<JoinHandle<S>>>,
}

impl<S: 'static> ReactorThread<S> {
    pub fn handle(&self) -> ReactorHandle<S> {
        self.handle.clone()
    }

    /// Stops the loop and waits for the thread, returning the final state.
    ///
    /// Only the first call joins. Calling it from the reactor thread itself
    /// only requests the stop.
    pub fn stop_and_join(&self) -> Option<S> {
        self.handle.stop();
        let join = self.join.lock().take()?;
        if join.thread().id() == std::thread::current().id() {
            return None;
        }
        match join.join() {
            Ok(state) => Some(state),
            Err(_) => {
                warn!("reactor thread panicked");
                None
            }
        }
    }
}

impl<S> Drop for ReactorThread<S> {
    fn drop(&mut self) {
        if !self.handle.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.handle.sender.send(Envelope::Wake);
        }
        if let Some(join) = self.join.lock().take() {
            if join.thread().id() != std::thread::current().id() {
                let _ = join.join();
            }
        }
    }
}
