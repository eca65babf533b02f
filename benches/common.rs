#![allow(dead_code)]

use std::time::{Duration, Instant};

use criterion::black_box;

use tempscatter::record::{Record, RecordSource, SampleSource};
use tempscatter::{Environment, EnvironmentConfig};

pub const SAMPLES: usize = 20;
pub const WARM_UP: Duration = Duration::from_secs(3);
pub const DURATION: Duration = Duration::from_secs(10);

/// Records generated once and reused by every iteration of a benchmark.
pub fn sample_records(n: usize) -> Vec<Record> {
    SampleSource::new(Some(0xbe7c4)).generate(n)
}

/// Run the whole pipeline on `records` with `processes` local ranks and return its duration.
pub fn bench_pipeline(records: &[Record], processes: usize) -> Duration {
    let mut config = EnvironmentConfig::local(processes);
    config.records = records.len();
    let env = Environment::with_source(
        config,
        Box::new(tempscatter::record::FixedSource::new(records.to_vec())),
    );
    let start = Instant::now();
    let outcome = env.execute().expect("pipeline failed");
    let duration = start.elapsed();
    black_box(outcome);
    duration
}

pub fn max_cpu_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
