pub mod advisor;
pub mod cluster;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod guard;
pub mod hasher;
pub mod index;
pub mod model;
pub mod paths;
pub mod plan;
pub mod platform;
pub mod progress;
pub mod resolver;
pub mod rules;
pub mod scanner;
pub mod summary;

pub use config::AppConfig;
pub use engine::{ApplyOptions, ApplyResult, PlanOptions, ReshelveEngine, ScanResult};
pub use error::Error;
pub use model::{ExecutionReport, FileRecord, MoveOutcome, MoveRecord};
pub use progress::{ProgressReporter, SilentReporter};
