// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Value objects and contracts of a role's swarm machine.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Design surface, protocol internals, event log port and
//!   verifier contract

pub mod branch;
pub mod config;
pub mod design;
pub mod event;
pub mod log;
pub mod protocol;
pub mod verifier;
