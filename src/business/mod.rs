//! Business logic implementations
//!
//! This module contains the business-specific implementations:
//! - Admission control with a temporary jail
//! - User store with quota enforcement and users-file sync
//! - Periodic maintenance tasks

mod pool;
mod tasks;
mod users;

pub use pool::ServerPool;
pub use tasks::{BackgroundTasks, BackgroundTasksHandle, TaskConfig, UserLauncher};
pub use users::{SyncReport, UserManager};
