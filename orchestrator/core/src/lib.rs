// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Swarm Machine Core
//!
//! Design surface, protocol internals and runtime state core for one role of
//! a swarm protocol, plus the event log port and an in-memory log adapter.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Everything a runner needs that does not involve a task

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
