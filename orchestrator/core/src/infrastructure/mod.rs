// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_log;

pub use event_log::{InMemoryEventLog, PublishHold};
