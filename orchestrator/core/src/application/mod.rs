// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod internals;

pub use internals::{DiscardReason, PushEventResult, ReactionFailure, RunnerInternals, StateAndFactory};
