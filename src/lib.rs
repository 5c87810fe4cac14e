//! Automated in-game market purchase runner.
//!
//! This crate is the scheduling and purchase-cycle core of an automated
//! buyer for a game's in-application market: it decides which configured
//! task runs when, performs one purchase attempt per iteration, and
//! recovers from the target's periodic forced restarts. The graphical
//! management surface, template matching, input injection, and OCR
//! backends live in the embedding application and reach this crate
//! through capability traits.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      TaskRunner (worker)                       │
//! ├────────────────────────────────────────────────────────────────┤
//! │ ReadinessGate │ RoundRobin / TimeWindow │ RestartCoordinator   │
//! │               │        scheduling       │                      │
//! │               └───────────┬─────────────┘                      │
//! │                        Market                                  │
//! │        (search context, detail views, purchase cycle)          │
//! ├────────────────────────────────────────────────────────────────┤
//! │  ScreenDriver        OcrEngine          ProcessControl         │
//! │  (locate/click)      (price read)       (spawn/terminate)      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key behaviors
//!
//! - **Single worker**: the whole run executes sequentially on one
//!   future; pause/resume/stop and per-task signals are honored only at
//!   checkpoints, never mid-attempt.
//! - **Two policies**: fixed-duration round robin (per-task segments,
//!   pause-preserving timers) and time-of-day windows (wall-clock,
//!   priority preemption, midnight crossing).
//! - **Fatal vs recoverable**: startup/config/OCR-backend/restart
//!   failures abort everything; a missed item, unreadable price, or
//!   unknown purchase outcome costs one attempt and scheduling goes on.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod capability;
pub mod config;
pub mod error;
pub mod logging;
pub mod market;
pub mod poll;
pub mod readiness;
pub mod registry;
pub mod restart;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_util;

pub use capability::{LauncherProcess, OcrEngine, OcrService, ProcessControl, ScreenDriver, UmiHttpOcr};
pub use config::{AppConfig, GoodsEntry, SchedulerMode, TaskDefinition, TasksConfig};
pub use error::{FatalError, OcrError, Result};
pub use market::AttemptResult;
pub use registry::{ConfigIssue, QuantityPolicy, TaskRegistry, TaskStatus};
pub use restart::DowntimePolicy;
pub use scheduler::{RunState, RunnerEvent, StatusUpdate, TaskRunner};
