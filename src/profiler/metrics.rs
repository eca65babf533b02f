use serde::{Deserialize, Serialize};

use crate::network::Rank;

/// Bytes in a megabyte, as used for the memory metrics.
const MB: f64 = 1024.0 * 1024.0;

/// Time spent by a rank in each stage of the pipeline, in seconds, while the run is in progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDurations {
    /// Generation of the records. Always zero on the ranks other than the coordinator.
    pub data_generation_time: f64,
    /// From the pre-distribution barrier to the end of the post-distribution barrier.
    pub distribution_time: f64,
    /// Local aggregation, including the post-computation barrier.
    pub computation_time: f64,
    /// Gathering of the partial aggregates.
    pub gathering_time: f64,
}

/// The measurements of a single rank for a whole run.
///
/// The stage durations sit next to the other figures, both in the report and on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub rank: Rank,
    pub hostname: String,
    pub wall_time: f64,
    pub user_cpu_time: f64,
    pub system_cpu_time: f64,
    pub total_cpu_time: f64,
    /// CPU time over wall time, in percent.
    pub cpu_percent: f64,
    /// Change of the resident set size during the run, in MB. May be negative.
    pub memory_used: f64,
    pub data_generation_time: f64,
    pub distribution_time: f64,
    pub computation_time: f64,
    pub gathering_time: f64,
}

impl PerformanceSample {
    pub(crate) fn memory_delta_mb(start: u64, end: u64) -> f64 {
        (end as f64 - start as f64) / MB
    }

    pub(crate) fn cpu_percent(cpu_time: f64, wall_time: f64) -> f64 {
        if wall_time > 0.0 {
            cpu_time / wall_time * 100.0
        } else {
            0.0
        }
    }

    pub fn stages(&self) -> StageDurations {
        StageDurations {
            data_generation_time: self.data_generation_time,
            distribution_time: self.distribution_time,
            computation_time: self.computation_time,
            gathering_time: self.gathering_time,
        }
    }
}

/// The process-wide figures of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallMetrics {
    /// The wall time of the slowest rank.
    pub total_wall_time: f64,
    /// The CPU time of all the ranks.
    pub total_cpu_time: f64,
    pub cpu_efficiency: f64,
    pub avg_memory_per_process: f64,
    /// `1 / (total_wall_time * processes) * 100`.
    ///
    /// This is not the textbook parallel efficiency (speedup over the number of processes): the
    /// formula is kept as is so that reports stay comparable with older runs.
    pub parallel_efficiency: f64,
}

/// The average time spent in each stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingBreakdown {
    /// Taken from the coordinator only, the only rank that generates data.
    pub data_generation: f64,
    pub distribution: f64,
    pub computation: f64,
    pub gathering: f64,
}

/// Statistics derived from the samples of all the ranks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub overall: OverallMetrics,
    pub timing: TimingBreakdown,
}

impl RunStatistics {
    /// Compute the statistics of a run. `samples` must be in rank order.
    ///
    /// The ratios are reported as zero when the wall time is zero instead of dividing by zero.
    pub fn from_samples(samples: &[PerformanceSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let total_wall_time = samples
            .iter()
            .map(|s| s.wall_time)
            .fold(0.0, f64::max);
        let total_cpu_time: f64 = samples.iter().map(|s| s.total_cpu_time).sum();
        let avg_memory_per_process = samples.iter().map(|s| s.memory_used).sum::<f64>() / n;

        let (cpu_efficiency, parallel_efficiency) = if total_wall_time > 0.0 {
            (
                total_cpu_time / (total_wall_time * n) * 100.0,
                1.0 / (total_wall_time * n) * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        let average = |f: fn(&StageDurations) -> f64| -> f64 {
            samples.iter().map(|s| f(&s.stages())).sum::<f64>() / n
        };

        Self {
            overall: OverallMetrics {
                total_wall_time,
                total_cpu_time,
                cpu_efficiency,
                avg_memory_per_process,
                parallel_efficiency,
            },
            timing: TimingBreakdown {
                data_generation: samples[0].data_generation_time,
                distribution: average(|s| s.distribution_time),
                computation: average(|s| s.computation_time),
                gathering: average(|s| s.gathering_time),
            },
        }
    }
}
