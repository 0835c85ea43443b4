pub mod archive;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hasher;
pub mod journal;
pub mod plan;
pub mod progress;
pub mod provenance;
pub mod report;
pub mod scanner;
pub mod storage;

pub use config::AppConfig;
pub use engine::{OrganizeEngine, PlanOutcome, UndoSelection};
pub use error::Error;
pub use progress::{ProgressReporter, SilentReporter};
pub use report::RunReport;
