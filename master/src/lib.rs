pub mod accumulate;
pub mod cancel;
pub mod chunksize;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod session;
pub mod source;
pub mod state;

pub use error::{Result, SchedError};
pub use session::{RunOutput, RunResult, Session};
