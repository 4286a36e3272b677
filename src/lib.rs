// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A cooperative, breakpoint-driven controllable worker built on a generic
//! finite state machine engine.
//!
//! [`fsm`] is a reusable, parameterized state machine: a builder
//! accumulates a transition table, and the resulting instance serializes
//! event processing and listener notification through a reentrant lock.
//!
//! [`worker`] binds that engine to a concrete seven-state worker lifecycle:
//! external callers drive it through `start`/`stop`/`pause`/`resume`/
//! `restart`, while the spawned execution task drives it back through
//! breakpoint calls at the safe points it declares for itself.

pub mod fsm;
pub mod worker;

pub use fsm::{Fsm, FsmBuildError, FsmBuilder, FsmError, FsmListener};
pub use worker::{
    ControllableWorker, OperationNotAllowed, WorkerConfig, WorkerEvent, WorkerFailure,
    WorkerHandle, WorkerObserver, WorkerState,
};
