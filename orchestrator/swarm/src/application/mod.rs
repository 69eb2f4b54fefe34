// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application
//!
//! The runner itself: event loop, snapshots, command gate and iteration.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Public runner API over the core state machine

mod commands;
pub mod iterator;
pub mod runner;
pub mod snapshot;

pub use iterator::RunnerIter;
pub use runner::{MachineRunner, MachineRunnerBuilder};
pub use snapshot::{StateCommands, StateOpaque, TypedState};
