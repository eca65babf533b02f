//! The performance report of a run: a JSON file and a human readable summary.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profiler::{hostname, OverallMetrics, PerformanceSample, TimingBreakdown};
use crate::record::Month;
use crate::scheduler::PipelineOutcome;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot create the report directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write the report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize the report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub processes: usize,
    pub data_size: usize,
    /// Host of the coordinator.
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: DateTime<Local>,
    pub configuration: RunConfiguration,
    pub overall_metrics: OverallMetrics,
    pub timing_breakdown: TimingBreakdown,
    /// One entry per rank, in rank order.
    pub process_metrics: Vec<PerformanceSample>,
    /// Mean temperature of every month present in the data.
    pub results: BTreeMap<Month, f64>,
}

impl Report {
    pub fn new(outcome: &PipelineOutcome) -> Self {
        let hostname = outcome
            .samples
            .first()
            .map(|s| s.hostname.clone())
            .unwrap_or_else(hostname);
        Self {
            timestamp: Local::now(),
            configuration: RunConfiguration {
                processes: outcome.processes,
                data_size: outcome.records,
                hostname,
            },
            overall_metrics: outcome.statistics.overall,
            timing_breakdown: outcome.statistics.timing,
            process_metrics: outcome.samples.clone(),
            results: outcome.result.to_map(),
        }
    }

    /// Name of the report file, unique per configuration and second.
    pub fn file_name(&self) -> String {
        format!(
            "report_{}processes_{}records_{}.json",
            self.configuration.processes,
            self.configuration.data_size,
            self.timestamp.timestamp()
        )
    }

    /// Write the report as pretty printed JSON in `dir`, creating it if needed.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ReportError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| ReportError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(self.file_name());
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|source| ReportError::Write {
            path: path.clone(),
            source,
        })?;
        info!("report saved to {}", path.display());
        Ok(path)
    }

    /// The summary printed at the end of a run.
    pub fn summary(&self) -> Summary<'_> {
        Summary(self)
    }
}

/// Human readable rendition of a `Report`.
pub struct Summary<'a>(&'a Report);

impl Display for Summary<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let report = self.0;
        let overall = &report.overall_metrics;
        let timing = &report.timing_breakdown;
        writeln!(f, "Performance Summary:")?;
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "Configuration:")?;
        writeln!(
            f,
            "  Number of Processes: {}",
            report.configuration.processes
        )?;
        writeln!(f, "  Data Size: {} records", report.configuration.data_size)?;
        writeln!(f)?;
        writeln!(f, "Timing Metrics:")?;
        writeln!(f, "  Total Wall Time: {:.3} seconds", overall.total_wall_time)?;
        writeln!(f, "  Total CPU Time: {:.3} seconds", overall.total_cpu_time)?;
        writeln!(f, "  CPU Efficiency: {:.1}%", overall.cpu_efficiency)?;
        writeln!(f)?;
        writeln!(f, "Memory Metrics:")?;
        writeln!(
            f,
            "  Average Memory per Process: {:.1} MB",
            overall.avg_memory_per_process
        )?;
        writeln!(f)?;
        writeln!(f, "Parallel Performance:")?;
        writeln!(
            f,
            "  Parallel Efficiency: {:.1}%",
            overall.parallel_efficiency
        )?;
        writeln!(f)?;
        writeln!(f, "Detailed timing breakdown:")?;
        writeln!(f, "  Data Generation: {:.3}s", timing.data_generation)?;
        writeln!(f, "  Data Distribution: {:.3}s", timing.distribution)?;
        writeln!(f, "  Computation: {:.3}s", timing.computation)?;
        writeln!(f, "  Result Gathering: {:.3}s", timing.gathering)?;
        writeln!(f)?;
        writeln!(f, "Average temperature by month:")?;
        for (month, mean) in report.results.iter() {
            writeln!(f, "  Month {}: {:.2}", month, mean)?;
        }
        Ok(())
    }
}
