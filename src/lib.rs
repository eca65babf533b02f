//! Distributed computation of the mean temperature of every month.
//!
//! The coordinator (rank 0) generates the temperature records, splits them in one chunk per rank
//! and sends every chunk to its rank. Each rank sums and counts the records of its chunk month by
//! month, the partial aggregates are gathered back at the coordinator and merged into the final
//! means. Every rank measures the time and the resources spent in each stage, and the coordinator
//! turns the measurements into a performance report.
//!
//! The ranks can be threads of the same process (local runtime) or processes connected via TCP
//! (remote runtime).
//!
//! ```
//! # use tempscatter::prelude::*;
//! let mut config = EnvironmentConfig::local(2);
//! config.records = 500;
//! let outcome = Environment::new(config).execute().unwrap();
//! assert_eq!(outcome.result.totals().records(), 500);
//! let report = Report::new(&outcome);
//! println!("{}", report.summary());
//! ```

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

use thiserror::Error;

pub use config::{EnvironmentConfig, RuntimeConfig};
pub use environment::Environment;
pub use scheduler::{PipelineError, PipelineOutcome, Stage};
pub use worker::current_rank;

pub(crate) mod channel;
pub mod aggregate;
pub mod config;
pub mod environment;
pub mod filter;
pub mod network;
pub mod partition;
pub mod profiler;
pub mod record;
pub mod report;
pub mod runner;
pub mod scheduler;
mod worker;

pub mod prelude {
    pub use super::aggregate::{aggregate, merge, FinalAggregate, PartialAggregate};
    pub use super::config::{EnvironmentConfig, RuntimeConfig};
    pub use super::environment::Environment;
    pub use super::record::{FixedSource, Month, Record, RecordSource, SampleSource};
    pub use super::report::Report;
    pub use super::scheduler::{PipelineError, PipelineOutcome};
}

/// Any error a run can end with.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Launch(#[from] runner::LaunchError),
    #[error(transparent)]
    Report(#[from] report::ReportError),
    #[error(transparent)]
    Filter(#[from] filter::FilterError),
}
