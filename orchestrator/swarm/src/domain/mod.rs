// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runner Domain Layer
//!
//! Pure types of the public runner API. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`status`] | `RunnerId`, `RunnerPhase`, `RunnerStatus`, `CommandLock` |
//! | [`events`] | `RunnerEvent` diagnostics |
//! | [`errors`] | `RunnerError`, `CommandError`, `CommandRejection` |

pub mod errors;
pub mod events;
pub mod status;

pub use errors::*;
pub use events::*;
pub use status::*;
