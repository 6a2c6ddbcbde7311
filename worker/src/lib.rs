pub mod worker;

pub use worker::{default_slots, LocalExecutor, WorkerLimits};
