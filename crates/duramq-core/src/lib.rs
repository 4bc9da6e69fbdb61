//! # duramq-core
//!
//! A durable, database-backed job queue: jobs are rows, not in-memory
//! objects, so a crashed worker loses no work. A dispatcher writes jobs,
//! an executor claims and runs them under a hard timeout, and a
//! supervisor keeps exactly one worker alive per queue via a PID lock
//! file.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher.dispatch() ──► StoragePort.enqueue() ──► jobs table (pending)
//!                                                           │
//!                                     Executor.claim_ready()│
//!                                                           ▼
//!                                              CallableRegistry.invoke()
//!                                               /            |            \
//!                                        success          failure      timeout
//!                                           │                │             │
//!                                   mark_completed   mark_failed /   mark_failed
//!                                                    dead_letter  (treated as failure)
//! ```
//!
//! Drivers (`duramq-postgres`, `duramq-sqlite`) implement [`StoragePort`];
//! everything above that line is driver-agnostic.
//!
//! ## What this is not
//!
//! - Not a distributed task scheduler with cross-node rebalancing.
//! - Not an `eval`-based closure system — see [`codec`] for why and what
//!   replaces it.
//! - Not a cron/recurring-schedule engine; dispatch is always "run once,
//!   as soon as a worker is free."

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod management;
pub mod model;
pub mod retry;
pub mod schema;
pub mod storage;
pub mod supervisor;

pub use codec::{Callable, CallableRegistry};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use error::QueueError;
pub use execution::{Executor, ExecutorConfig};
pub use management::ManagementSurface;
pub use model::{CallableType, FailedJob, Job, JobStatus, Priority};
pub use storage::{DriverKind, QueueStats, StoragePort};
pub use supervisor::{ensure_worker_running, LockFile, SupervisorConfig};
