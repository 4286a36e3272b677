// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A cooperative, breakpoint-driven controllable worker.
//!
//! A [`ControllableWorker`] wraps one [`Fsm`] whose seven states model the
//! worker lifecycle. External callers drive it through the control surface
//! (`start`/`stop`/`pause`/`resume`/`restart`); the spawned execution task
//! drives it back through the breakpoint operations exposed on
//! [`WorkerHandle`]. See the module-level transition table in
//! [`build_transitions`] for the full state graph.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};

use crate::fsm::{Fsm, FsmBuilder, FsmListener};

/// The seven lifecycle states of a [`ControllableWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Stopped,
    Running,
    RunningWaitingForPause,
    RunningWaitingForStop,
    Stopping,
    Paused,
    Crashed,
}

/// The nine events that drive [`WorkerState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerEvent {
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
    PauseBreakpointEncountered,
    StopBreakpointEncountered,
    Terminated,
    Crash,
}

/// Builds the worker's fixed transition table.
///
/// `RUNNING_WAITING_FOR_STOP` has a `START` transition back to `RUNNING`
/// (the stop is rescinded) but `RUNNING_WAITING_FOR_PAUSE` deliberately does
/// not: this asymmetry is part of the contract, not an oversight.
fn build_transitions() -> FsmBuilder<WorkerState, WorkerEvent> {
    use WorkerEvent::*;
    use WorkerState::*;

    let mut b = FsmBuilder::new();
    b.add_transition(Stopped, Start, Running).unwrap();

    b.add_transition(Running, Stop, RunningWaitingForStop).unwrap();
    b.add_transition(Running, Pause, RunningWaitingForPause).unwrap();
    b.add_transition(Running, Crash, Crashed).unwrap();
    b.add_transition(Running, Terminated, Stopped).unwrap();

    b.add_transition(RunningWaitingForStop, Start, Running).unwrap();
    b.add_transition(RunningWaitingForStop, StopBreakpointEncountered, Stopping)
        .unwrap();
    b.add_transition(RunningWaitingForStop, Pause, RunningWaitingForPause)
        .unwrap();
    b.add_transition(RunningWaitingForStop, Crash, Crashed).unwrap();
    b.add_transition(RunningWaitingForStop, Terminated, Stopped).unwrap();

    b.add_transition(RunningWaitingForPause, Resume, Running).unwrap();
    b.add_transition(RunningWaitingForPause, PauseBreakpointEncountered, Paused)
        .unwrap();
    b.add_transition(RunningWaitingForPause, Stop, RunningWaitingForStop)
        .unwrap();
    b.add_transition(RunningWaitingForPause, Crash, Crashed).unwrap();
    b.add_transition(RunningWaitingForPause, Terminated, Stopped).unwrap();

    b.add_transition(Paused, Resume, Running).unwrap();

    b.add_transition(Stopping, Terminated, Stopped).unwrap();
    b.add_transition(Stopping, Crash, Crashed).unwrap();

    b.add_transition(Crashed, Restart, Stopped).unwrap();

    b
}

/// Raised by the control surface when the current state has no transition
/// for the requested event. Non-fatal: the worker's state is unchanged.
#[derive(Debug, thiserror::Error)]
#[error("operation not allowed: worker {name:?} is currently {state:?}")]
pub struct OperationNotAllowed {
    pub name: String,
    pub state: WorkerState,
}

/// The error type returned by a worker's `execute` hook.
///
/// `StopRequested` is the stop sentinel: [`WorkerHandle::set_stop_breakpoint`]
/// returns it once the worker has reached [`WorkerState::Stopping`], so user
/// code can propagate it with `?` through any cleanup code and the execution
/// trampoline recognizes it and reports a clean stop rather than a crash.
/// Any other value is a genuine crash and is captured verbatim.
pub enum WorkerFailure<E> {
    StopRequested,
    Crashed(E),
}

impl<E: fmt::Debug> fmt::Debug for WorkerFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailure::StopRequested => f.write_str("StopRequested"),
            WorkerFailure::Crashed(e) => f.debug_tuple("Crashed").field(e).finish(),
        }
    }
}

impl<E> From<E> for WorkerFailure<E> {
    fn from(e: E) -> Self {
        WorkerFailure::Crashed(e)
    }
}

/// Observes worker lifecycle transitions.
///
/// Callbacks run synchronously on whichever thread drove the transition (a
/// control-plane caller, or the execution task itself). Every hook defaults
/// to a no-op.
pub trait WorkerObserver<E>: Send + Sync {
    fn running(&self) {}
    fn running_waiting_to_pause(&self) {}
    fn running_waiting_to_stop(&self) {}
    fn stopping(&self) {}
    fn stopped_after_stop_request(&self) {}
    fn stopped_normally(&self) {}
    fn paused(&self) {}
    fn crashed(&self, _failure: &E) {}
    fn restarted(&self) {}
}

/// Build-time configuration for a [`ControllableWorker`].
///
/// Deliberately small: the FSM's transition table cannot be reconfigured
/// after construction, and this crate has no environment or network surface
/// to load settings from, so there is nothing equivalent to an env-based
/// config loader to carry here.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name prefix given to the spawned execution task's OS thread.
    pub thread_name_prefix: String,
    /// `tracing` target used for this worker's log events, so multiple
    /// workers in one process can be filtered independently.
    pub tracing_target: &'static str,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "controllable-worker".to_string(),
            tracing_target: "controllable_worker",
        }
    }
}

/// Mutex/condvar gate blocking the execution task while paused.
///
/// `arm`/`release` are called synchronously from inside the FSM listener, at
/// the exact moment the state transitions into and out of `PAUSED`, so the
/// gate's own `paused` flag is always set before the triggering
/// `process_event`/`process_event_silent` call returns to its caller. The
/// wait loop only ever touches this struct's own mutex — it never calls back
/// into the FSM — so a thread blocked here can't be holding a lock the FSM
/// needs to make progress, and a `release()` that runs before the wait even
/// starts is never lost: it already flipped the flag the wait loop checks.
struct PauseGate {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Marks the gate as holding the execution task; called while entering `PAUSED`.
    fn arm(&self) {
        *self.paused.lock().unwrap() = true;
    }

    /// Releases the gate; called while leaving `PAUSED` for `RUNNING`.
    fn release(&self) {
        *self.paused.lock().unwrap() = false;
        self.condvar.notify_all();
    }

    /// Blocks the calling thread until `release` has run since the matching `arm`.
    fn wait_until_released(&self) {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.condvar.wait(paused).unwrap();
        }
    }
}

type ExecuteFn<E> = dyn Fn(&WorkerHandle<E>) -> Result<(), WorkerFailure<E>> + Send + Sync;

struct Inner<E> {
    name: String,
    config: WorkerConfig,
    fsm: Fsm<WorkerState, WorkerEvent>,
    execute: Box<ExecuteFn<E>>,
    observers: Mutex<Vec<Arc<dyn WorkerObserver<E>>>>,
    pause_gate: PauseGate,
    execution_thread: Mutex<Option<ThreadId>>,
    last_crash_failure: Mutex<Option<E>>,
}

impl<E: Send + 'static> Inner<E> {
    fn notify_observers(&self, f: impl Fn(&dyn WorkerObserver<E>)) {
        let observers = self.observers.lock().unwrap().clone();
        for o in &observers {
            f(o.as_ref());
        }
    }

    fn is_execution_thread(&self) -> bool {
        *self.execution_thread.lock().unwrap() == Some(thread::current().id())
    }
}

/// The handle passed to a worker's `execute` routine.
///
/// Exposes only the breakpoint operations; the control surface itself is
/// deliberately not reachable from here, so user code cannot trivially
/// recurse into its own control calls from inside `execute`.
pub struct WorkerHandle<E> {
    inner: Arc<Inner<E>>,
}

impl<E: Send + 'static> WorkerHandle<E> {
    /// Declares a pause breakpoint.
    ///
    /// If a pause is pending, blocks the calling (execution) thread until
    /// `resume()` is called. Otherwise returns immediately. Panics if called
    /// from any thread other than the worker's own execution task.
    pub fn set_pause_breakpoint(&self) {
        assert!(
            self.inner.is_execution_thread(),
            "set_pause_breakpoint called from outside the execution task"
        );
        self.inner
            .fsm
            .process_event_silent(WorkerEvent::PauseBreakpointEncountered);
        if self.inner.fsm.current_state() == WorkerState::Paused {
            self.inner.pause_gate.wait_until_released();
        }
    }

    /// Declares a stop breakpoint.
    ///
    /// If a stop is pending, raises [`WorkerFailure::StopRequested`] so the
    /// execution task's stack unwinds through any cleanup the user's
    /// `execute` routine performs. Otherwise returns `Ok(())`. Panics if
    /// called from any thread other than the worker's own execution task.
    pub fn set_stop_breakpoint(&self) -> Result<(), WorkerFailure<E>> {
        assert!(
            self.inner.is_execution_thread(),
            "set_stop_breakpoint called from outside the execution task"
        );
        self.inner
            .fsm
            .process_event_silent(WorkerEvent::StopBreakpointEncountered);
        if self.inner.fsm.current_state() == WorkerState::Stopping {
            return Err(WorkerFailure::StopRequested);
        }
        Ok(())
    }

    /// The worker's name, for diagnostics inside `execute`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// The internal FSM listener translating transitions into worker effects.
///
/// Holds only a [`Weak`] reference to [`Inner`] so the FSM (owned by
/// `Inner`) doesn't keep itself alive through its own listener list.
struct WorkerFsmListener<E> {
    inner: Weak<Inner<E>>,
}

impl<E: Send + 'static> FsmListener<WorkerState, WorkerEvent> for WorkerFsmListener<E> {
    fn state_changed(&self, from: &WorkerState, _event: &WorkerEvent, to: &WorkerState) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        use WorkerState::*;

        tracing::debug!(
            target: inner.config.tracing_target,
            worker = %inner.name,
            ?from,
            ?to,
            "worker state changed"
        );

        match *to {
            Running => {
                if *from == Paused {
                    inner.pause_gate.release();
                } else {
                    spawn_execution_task(&inner);
                }
                inner.notify_observers(|o| o.running());
            }
            RunningWaitingForPause => inner.notify_observers(|o| o.running_waiting_to_pause()),
            RunningWaitingForStop => inner.notify_observers(|o| o.running_waiting_to_stop()),
            Stopping => inner.notify_observers(|o| o.stopping()),
            Paused => {
                inner.pause_gate.arm();
                inner.notify_observers(|o| o.paused());
            }
            Stopped => match *from {
                Stopping => inner.notify_observers(|o| o.stopped_after_stop_request()),
                Crashed => {
                    // RESTART always clears the worker back to a clean slate.
                    *inner.last_crash_failure.lock().unwrap() = None;
                    inner.notify_observers(|o| o.restarted());
                }
                _ => inner.notify_observers(|o| o.stopped_normally()),
            },
            Crashed => {
                let failure = inner.last_crash_failure.lock().unwrap();
                tracing::error!(
                    target: inner.config.tracing_target,
                    worker = %inner.name,
                    "worker crashed"
                );
                inner.notify_observers(|o| {
                    if let Some(f) = failure.as_ref() {
                        o.crashed(f);
                    }
                });
            }
        }
    }
}

fn spawn_execution_task<E: Send + 'static>(inner: &Arc<Inner<E>>) {
    let inner = inner.clone();
    let thread_name = format!("{}-exec", inner.config.thread_name_prefix);
    let spawned = thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            *inner.execution_thread.lock().unwrap() = Some(thread::current().id());
            let handle = WorkerHandle {
                inner: inner.clone(),
            };
            tracing::info!(
                target: inner.config.tracing_target,
                worker = %inner.name,
                "execution task starting"
            );
            let result = (inner.execute)(&handle);
            // The task is about to exit; clear the recorded thread id before
            // firing the terminal event so `id()` reflects "not alive" as
            // soon as any observer can see the resulting state.
            *inner.execution_thread.lock().unwrap() = None;
            match result {
                Ok(()) | Err(WorkerFailure::StopRequested) => {
                    inner.fsm.process_event_silent(WorkerEvent::Terminated);
                }
                Err(WorkerFailure::Crashed(failure)) => {
                    *inner.last_crash_failure.lock().unwrap() = Some(failure);
                    inner.fsm.process_event_silent(WorkerEvent::Crash);
                }
            }
        })
        .expect("failed to spawn execution task thread");
    // The execution task outlives this call; it reports its own exit through
    // the FSM rather than being joined here.
    drop(spawned);
}

/// A long-running unit of user-supplied work, controllable through a
/// breakpoint-driven finite state machine.
///
/// Cloning a `ControllableWorker` is cheap and yields another handle to the
/// same underlying worker, since it shares one `Arc<Inner<E>>`.
pub struct ControllableWorker<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ControllableWorker<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Send + 'static> ControllableWorker<E> {
    /// Builds a new worker at [`WorkerState::Stopped`].
    ///
    /// `name` may be empty; a `None`/empty name is stored as `""`. `execute`
    /// is the user-supplied work routine, expected to call
    /// [`WorkerHandle::set_pause_breakpoint`] and
    /// [`WorkerHandle::set_stop_breakpoint`] at safe points.
    pub fn new(
        name: impl Into<Option<String>>,
        config: WorkerConfig,
        execute: impl Fn(&WorkerHandle<E>) -> Result<(), WorkerFailure<E>> + Send + Sync + 'static,
    ) -> Self {
        let fsm = build_transitions().create(WorkerState::Stopped);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<E>>| {
            fsm.add_listener(Arc::new(WorkerFsmListener {
                inner: weak.clone(),
            }));
            Inner {
                name: name.into().unwrap_or_default(),
                config,
                fsm,
                execute: Box::new(execute),
                observers: Mutex::new(Vec::new()),
                pause_gate: PauseGate::new(),
                execution_thread: Mutex::new(None),
                last_crash_failure: Mutex::new(None),
            }
        });
        Self { inner }
    }

    /// Registers an observer; notified after any already registered.
    pub fn add_observer(&self, observer: Arc<dyn WorkerObserver<E>>) {
        self.inner.observers.lock().unwrap().push(observer);
    }

    /// Removes a previously registered observer by pointer identity.
    pub fn remove_observer(&self, observer: &Arc<dyn WorkerObserver<E>>) {
        self.inner
            .observers
            .lock()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn control(&self, event: WorkerEvent) -> Result<(), OperationNotAllowed> {
        self.inner.fsm.process_event(event).map_err(|_| {
            let state = self.current_state();
            tracing::warn!(
                target: self.inner.config.tracing_target,
                worker = %self.inner.name,
                ?event,
                ?state,
                "operation not allowed"
            );
            OperationNotAllowed {
                name: self.inner.name.clone(),
                state,
            }
        })
    }

    pub fn start(&self) -> Result<(), OperationNotAllowed> {
        self.control(WorkerEvent::Start)
    }

    pub fn stop(&self) -> Result<(), OperationNotAllowed> {
        self.control(WorkerEvent::Stop)
    }

    pub fn pause(&self) -> Result<(), OperationNotAllowed> {
        self.control(WorkerEvent::Pause)
    }

    pub fn resume(&self) -> Result<(), OperationNotAllowed> {
        self.control(WorkerEvent::Resume)
    }

    pub fn restart(&self) -> Result<(), OperationNotAllowed> {
        self.control(WorkerEvent::Restart)
    }

    pub fn can_start(&self) -> bool {
        self.inner.fsm.is_transition_existing(&WorkerEvent::Start)
    }

    pub fn can_stop(&self) -> bool {
        self.inner.fsm.is_transition_existing(&WorkerEvent::Stop)
    }

    pub fn can_pause(&self) -> bool {
        self.inner.fsm.is_transition_existing(&WorkerEvent::Pause)
    }

    pub fn can_resume(&self) -> bool {
        self.inner.fsm.is_transition_existing(&WorkerEvent::Resume)
    }

    pub fn can_restart(&self) -> bool {
        self.inner.fsm.is_transition_existing(&WorkerEvent::Restart)
    }

    pub fn current_state(&self) -> WorkerState {
        self.inner.fsm.current_state()
    }

    pub fn is_stopped(&self) -> bool {
        self.current_state() == WorkerState::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.current_state() == WorkerState::Running
    }

    pub fn is_running_waiting_for_pause(&self) -> bool {
        self.current_state() == WorkerState::RunningWaitingForPause
    }

    pub fn is_running_waiting_for_stop(&self) -> bool {
        self.current_state() == WorkerState::RunningWaitingForStop
    }

    pub fn is_stopping(&self) -> bool {
        self.current_state() == WorkerState::Stopping
    }

    pub fn is_paused(&self) -> bool {
        self.current_state() == WorkerState::Paused
    }

    pub fn is_crashed(&self) -> bool {
        self.current_state() == WorkerState::Crashed
    }

    /// The captured failure while [`WorkerState::Crashed`], if any.
    pub fn last_crash_failure(&self) -> Option<E>
    where
        E: Clone,
    {
        self.inner.last_crash_failure.lock().unwrap().clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The execution task's thread id while alive, `None` otherwise.
    pub fn id(&self) -> Option<ThreadId> {
        *self.inner.execution_thread.lock().unwrap()
    }
}
