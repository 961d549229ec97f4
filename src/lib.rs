pub mod aggregate;
pub mod artifact;
pub mod config;
pub mod destination;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod grouping;
pub mod probe;
pub mod stats;

pub use config::Config;
pub use engine::{Engine, RunSummary};
