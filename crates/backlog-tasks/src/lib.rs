//! # backlog-tasks
//!
//! Background tasks for the backlog site.
//!
//! - Enum-keyed task registry with JSON Schema validated input
//! - Execution context that turns a handler's steps, logs and metrics into a run record
//! - Executor with retry classification and best-effort run recording
//! - Durable and in-process queue strategies, worker wiring and a fixed-interval scheduler

pub mod context;
pub mod definition;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod tasks;

pub use context::{ExecutionContext, ProgressSink, RunMeta};
pub use definition::{define_task, InputSchema, RetryPolicy, TaskDefinition, TaskHandler, Visibility};
pub use dispatch::{DurableQueue, EnqueueRequest, InProcessQueue, JobHandle, TaskQueue, TaskWorker};
pub use error::TaskError;
pub use executor::{TaskExecutor, TaskPayload};
pub use registry::{register_all_tasks, TaskName, TaskRegistry};
pub use scheduler::{Schedule, Scheduler, MAX_INTERVAL, MIN_INTERVAL};
pub use services::TaskServices;
