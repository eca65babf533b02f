use std::time::{Duration, Instant};

pub use metrics::*;
pub use usage::{hostname, ResourceUsage};

use crate::network::Rank;

mod metrics;
mod usage;

/// The stages whose duration is part of a `PerformanceSample`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedStage {
    DataGeneration,
    Distribution,
    Computation,
    Gathering,
}

/// Scoped measurement of the resources used by a rank.
///
/// The measurement starts when the monitor is created and ends either with `finish`, which returns
/// the sample, or when the monitor is dropped on any other exit path (an error or a panic). In the
/// latter case the partial sample is logged, since nobody is going to collect it.
#[derive(Debug)]
pub struct Monitor {
    rank: Rank,
    hostname: String,
    start: Instant,
    start_usage: ResourceUsage,
    stages: StageDurations,
    /// True until the sample has been handed out.
    primed: bool,
}

impl Monitor {
    pub fn start(rank: Rank) -> Self {
        Self {
            rank,
            hostname: hostname(),
            start_usage: ResourceUsage::now(),
            start: Instant::now(),
            stages: Default::default(),
            primed: true,
        }
    }

    /// Time elapsed since the monitor was started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn record(&mut self, stage: TimedStage, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let slot = match stage {
            TimedStage::DataGeneration => &mut self.stages.data_generation_time,
            TimedStage::Distribution => &mut self.stages.distribution_time,
            TimedStage::Computation => &mut self.stages.computation_time,
            TimedStage::Gathering => &mut self.stages.gathering_time,
        };
        *slot = secs;
    }

    /// End the measurement and return the sample.
    pub fn finish(mut self) -> PerformanceSample {
        self.primed = false;
        self.capture()
    }

    fn capture(&self) -> PerformanceSample {
        let wall_time = self.start.elapsed();
        let usage = ResourceUsage::now();
        let user = usage.user_cpu.saturating_sub(self.start_usage.user_cpu);
        let system = usage.system_cpu.saturating_sub(self.start_usage.system_cpu);
        let total_cpu_time = (user + system).as_secs_f64();
        PerformanceSample {
            rank: self.rank,
            hostname: self.hostname.clone(),
            wall_time: wall_time.as_secs_f64(),
            user_cpu_time: user.as_secs_f64(),
            system_cpu_time: system.as_secs_f64(),
            total_cpu_time,
            cpu_percent: PerformanceSample::cpu_percent(total_cpu_time, wall_time.as_secs_f64()),
            memory_used: PerformanceSample::memory_delta_mb(
                self.start_usage.resident_bytes,
                usage.resident_bytes,
            ),
            data_generation_time: self.stages.data_generation_time,
            distribution_time: self.stages.distribution_time,
            computation_time: self.stages.computation_time,
            gathering_time: self.stages.gathering_time,
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if self.primed {
            let sample = self.capture();
            warn!(
                "rank {} stopped before completing the run, partial measurement: {:?}",
                self.rank, sample
            );
        }
    }
}

/// Measure the time from the creation of the timer until `stop`.
#[derive(Debug, Clone, Copy)]
pub struct StageTimer {
    stage: TimedStage,
    start: Instant,
}

impl StageTimer {
    pub fn start(stage: TimedStage) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    /// Store the elapsed time in the monitor and return it.
    pub fn stop(self, monitor: &mut Monitor) -> Duration {
        let elapsed = self.start.elapsed();
        monitor.record(self.stage, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_records_stages() {
        let mut monitor = Monitor::start(3);
        monitor.record(TimedStage::Distribution, Duration::from_millis(1500));
        let timer = StageTimer::start(TimedStage::Gathering);
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.stop(&mut monitor);
        let sample = monitor.finish();

        assert_eq!(sample.rank, 3);
        assert_eq!(sample.distribution_time, 1.5);
        assert_eq!(sample.data_generation_time, 0.0);
        assert_eq!(sample.gathering_time, elapsed.as_secs_f64());
        assert!(sample.wall_time >= elapsed.as_secs_f64());
        assert!(sample.total_cpu_time >= 0.0);
        assert!(sample.cpu_percent >= 0.0);
        let cpu = sample.user_cpu_time + sample.system_cpu_time;
        assert!((sample.total_cpu_time - cpu).abs() < 1e-6);
    }

    #[test]
    fn dropped_monitor_does_not_panic() {
        let monitor = Monitor::start(1);
        drop(monitor);
    }
}
