//! Task Store: durable record of every unit of work.

mod db;
mod task;

pub use db::{StatusCounts, TaskStore};
pub use task::{
    payload_dest, FileTaskPayload, ImageTaskPayload, MetadataTaskPayload, NewTask, Task,
    TaskKind, TaskStatus,
};
