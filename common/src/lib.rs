pub mod item;
pub mod lineage;
pub mod processor;
pub mod service;
pub mod staging;
pub mod stats;
pub mod task;
pub mod wordcount;

pub use item::WorkItem;
pub use lineage::{LineageLog, LineageRecord};
pub use processor::{accumulate_result_files, execute_task_args, Processor};
pub use service::{Completed, ExecResult, MonitorMode, TaskExecutionService};
pub use staging::Staging;
pub use stats::{RunningStats, TaskReport};
pub use task::{ResourceUsage, Task, TaskArgs, TaskCategory, TaskId, TaskKind};
