// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `swarm-machine-runner` - Public Runner API
//!
//! Runs one role's swarm-protocol machine against a shared event log and
//! exposes it through immutable snapshots, gated commands and async
//! iteration.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `RunnerId`, `RunnerStatus`, `CommandLock`, `RunnerEvent`, errors |
//! | [`application`] | Application | `MachineRunner`, `StateOpaque`, `TypedState`, `RunnerIter` |
//! | [`infrastructure`] | Infrastructure | `RunnerEventBus` diagnostics |
//!
//! ## Key Concepts
//!
//! - **Snapshot**: a `StateOpaque` copy of the live state. It expires as soon
//!   as the runner's state moves on.
//! - **Command gate**: commands run only from a current snapshot of a caught
//!   up runner with nothing queued and no other command in flight.
//! - **Time travel**: the log reordered history; the runner resets to its
//!   initial state and replays.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use swarm_machine_core::domain::design::ProtocolDesign;
//! # use swarm_machine_core::domain::event::Tags;
//! # use swarm_machine_core::infrastructure::InMemoryEventLog;
//! # use swarm_machine_runner::MachineRunner;
//! # async fn demo() -> anyhow::Result<()> {
//! let mut design = ProtocolDesign::new("warehouse", Tags::new(["warehouse"]));
//! let part_id = design.event::<String>("partID")?;
//! let idle = design.design_empty("Idle")?;
//! let requested = design.design_state::<String>("Requested")?;
//! let make = part_id.clone();
//! let request = design.command(&idle, "request", [part_id.ty()], move |_, id: String| {
//!     Ok(vec![make.make(&id)?])
//! })?;
//! design.react(&idle, [part_id.ty()], &requested, |_, e| Ok(Some(e.payload_as::<String>()?)))?;
//! let protocol = design.finish(&idle, ())?;
//!
//! let runner = MachineRunner::builder(Arc::new(InMemoryEventLog::new()), protocol).start()?;
//! let mut states = runner.iter();
//! while let Some(snapshot) = states.next().await {
//!     let snapshot = snapshot?;
//!     if let Some(idle) = snapshot.as_state(&idle) {
//!         if let Some(commands) = idle.commands() {
//!             commands.execute(&request, "x".to_string()).await?;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::*;
pub use domain::*;
