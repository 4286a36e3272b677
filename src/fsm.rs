// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A small, reusable finite state machine engine.
//!
//! A [`FsmBuilder`] accumulates `(from, event) -> to` triples into an
//! immutable transition table; [`FsmBuilder::create`] freezes it into a
//! running [`Fsm`]. Every event-processing call is serialized on a single
//! reentrant lock covering both the current state and listener invocation,
//! so listeners always observe a total order consistent with the order
//! events were submitted, even when a listener itself submits a new event
//! from the same thread.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use std::cell::RefCell;

use parking_lot::ReentrantMutex;

/// Bound shared by every state identifier usable with [`Fsm`].
pub trait FsmState: Eq + Hash + Clone + Debug + Send + Sync + 'static {}
impl<T: Eq + Hash + Clone + Debug + Send + Sync + 'static> FsmState for T {}

/// Bound shared by every event identifier usable with [`Fsm`].
pub trait FsmEvent: Eq + Hash + Clone + Debug + Send + Sync + 'static {}
impl<T: Eq + Hash + Clone + Debug + Send + Sync + 'static> FsmEvent for T {}

/// Observes transitions processed by a [`Fsm`].
///
/// Every hook defaults to a no-op; implementors override only the ones
/// they care about. Hooks are invoked synchronously, in registration
/// order, on whichever thread submitted the event.
pub trait FsmListener<S, E>: Send + Sync {
    /// A legal transition moved the state from `from` to `to` (`from != to`).
    fn state_changed(&self, _from: &S, _event: &E, _to: &S) {}
    /// Fired for every event with a matching table entry, loop or not.
    fn event_occurred(&self, _from: &S, _event: &E, _to: &S) {}
    /// A legal transition whose target equals its source.
    fn state_loop(&self, _state: &S, _event: &E) {}
    /// Strict-mode processing found no table entry for `(from, event)`.
    fn unexisting_transition(&self, _from: &S, _event: &E) {}
}

/// Error returned by [`FsmBuilder::add_transition`] on a duplicate key.
#[derive(Debug, thiserror::Error)]
pub enum FsmBuildError {
    #[error("duplicate transition from {from} on {event} (already goes to {existing})")]
    DuplicateTransition {
        from: String,
        event: String,
        existing: String,
    },
}

/// Error returned by [`Fsm::process_event`] in strict mode.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("no transition from state {state} for event {event}")]
    TransitionNotAllowed { state: String, event: String },
}

/// Accumulates transitions into an immutable table.
pub struct FsmBuilder<S, E> {
    transitions: HashMap<(S, E), S>,
}

impl<S: FsmState, E: FsmEvent> Default for FsmBuilder<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: FsmState, E: FsmEvent> FsmBuilder<S, E> {
    pub fn new() -> Self {
        Self {
            transitions: HashMap::new(),
        }
    }

    /// Registers `from --event--> to`. Fails if `(from, event)` is already mapped.
    pub fn add_transition(&mut self, from: S, event: E, to: S) -> Result<&mut Self, FsmBuildError> {
        let key = (from.clone(), event.clone());
        if let Some(existing) = self.transitions.get(&key) {
            return Err(FsmBuildError::DuplicateTransition {
                from: format!("{from:?}"),
                event: format!("{event:?}"),
                existing: format!("{existing:?}"),
            });
        }
        self.transitions.insert(key, to);
        Ok(self)
    }

    /// Freezes the transition table and returns a running instance at `initial_state`.
    pub fn create(self, initial_state: S) -> Fsm<S, E> {
        Fsm {
            transitions: Arc::new(self.transitions),
            core: ReentrantMutex::new(FsmCore {
                state: RefCell::new(initial_state),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }
}

struct FsmCore<S, E> {
    state: RefCell<S>,
    listeners: RefCell<Vec<Arc<dyn FsmListener<S, E>>>>,
}

/// A running, immutable-table state machine.
///
/// Cheaply cloneable via `Arc<Fsm<S, E>>` sharing; the machine itself holds
/// all mutable state behind a reentrant lock so it can be called from
/// multiple threads, including reentrantly from within a listener callback
/// running on the thread that is currently processing an event.
pub struct Fsm<S, E> {
    transitions: Arc<HashMap<(S, E), S>>,
    core: ReentrantMutex<FsmCore<S, E>>,
}

impl<S: FsmState, E: FsmEvent> Fsm<S, E> {
    /// The current state.
    pub fn current_state(&self) -> S {
        let core = self.core.lock();
        core.state.borrow().clone()
    }

    /// True iff `(current_state, event)` has a table entry.
    pub fn is_transition_existing(&self, event: &E) -> bool {
        let core = self.core.lock();
        let state = core.state.borrow().clone();
        self.transitions.contains_key(&(state, event.clone()))
    }

    /// Registers a listener; it is appended after any already registered.
    pub fn add_listener(&self, listener: Arc<dyn FsmListener<S, E>>) {
        let core = self.core.lock();
        core.listeners.borrow_mut().push(listener);
    }

    /// Removes a previously added listener by pointer identity.
    pub fn remove_listener(&self, listener: &Arc<dyn FsmListener<S, E>>) {
        let core = self.core.lock();
        core.listeners
            .borrow_mut()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Strict-mode event processing: fails loudly if no transition exists.
    pub fn process_event(&self, event: E) -> Result<(), FsmError> {
        self.process(event, true).map(|_| ())
    }

    /// Silent-mode event processing: a missing transition is a silent no-op.
    pub fn process_event_silent(&self, event: E) {
        let _ = self.process(event, false);
    }

    fn process(&self, event: E, strict: bool) -> Result<(), FsmError> {
        let core = self.core.lock();
        let from = core.state.borrow().clone();
        let key = (from.clone(), event.clone());
        let Some(to) = self.transitions.get(&key).cloned() else {
            tracing::trace!(?from, ?event, strict, "fsm: no matching transition");
            let listeners = core.listeners.borrow().clone();
            if strict {
                for l in &listeners {
                    l.unexisting_transition(&from, &event);
                }
                return Err(FsmError::TransitionNotAllowed {
                    state: format!("{from:?}"),
                    event: format!("{event:?}"),
                });
            }
            return Ok(());
        };

        *core.state.borrow_mut() = to.clone();

        let listeners = core.listeners.borrow().clone();
        for l in &listeners {
            l.event_occurred(&from, &event, &to);
        }
        if to == from {
            tracing::trace!(state = ?from, ?event, "fsm: state loop");
            for l in &listeners {
                l.state_loop(&from, &event);
            }
        } else {
            tracing::debug!(?from, ?event, ?to, "fsm: state changed");
            for l in &listeners {
                l.state_changed(&from, &event, &to);
            }
        }
        Ok(())
    }
}
