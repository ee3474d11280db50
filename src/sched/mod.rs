//! L3: fork/join work stealing with coherence integration.

pub mod scheduler;
pub mod task;
pub mod worker;

pub use self::scheduler::{fork, fork_on, poll, Scheduler};
pub use self::task::{task_group_begin, task_group_end, JobRef, TaskGroup, TaskHandle, TaskStatus};
pub use self::worker::Worker;
