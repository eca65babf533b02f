#![allow(dead_code)] // not all tests use all the members

use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use itertools::{process_results, Itertools};
use log::*;

use tempscatter::aggregate::{aggregate, FinalAggregate};
use tempscatter::network::{Rank, COORDINATOR};
use tempscatter::record::{FixedSource, Record};
use tempscatter::{Environment, EnvironmentConfig, PipelineError, PipelineOutcome};

/// Port from which the integration tests start allocating sockets for the remote runtime.
const TEST_BASE_PORT: u16 = 17666;

/// The index of the current remote test, used to give each test its own port.
static TEST_INDEX: AtomicU16 = AtomicU16::new(0);

/// Helper functions for running the integration tests.
pub struct TestHelper;

impl TestHelper {
    pub fn setup() {
        let _ = env_logger::Builder::new()
            .filter(None, log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    /// Run `body` in a new thread, failing if it does not complete before the timeout.
    pub fn with_timeout<T, F>(body: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let timeout_sec = Self::parse_int_from_env("TEMPSCATTER_TEST_TIMEOUT").unwrap_or(30);
        let timeout = Duration::from_secs(timeout_sec);
        let (sender, receiver) = std::sync::mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("test-body".into())
            .spawn(move || {
                let _ = sender.send(body());
            })
            .unwrap();
        let result = match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                panic!("Test body didn't complete before the timeout of {:?}", timeout);
            }
            Err(RecvTimeoutError::Disconnected) => {
                panic!("Test body has panicked!");
            }
        };
        worker.join().expect("Test body has panicked!");
        result
    }

    /// Run the records through the local runtime with `processes` ranks.
    pub fn local_run(
        records: Vec<Record>,
        processes: usize,
    ) -> Result<PipelineOutcome, PipelineError> {
        Self::setup();
        let mut config = EnvironmentConfig::local(processes);
        config.records = records.len();
        debug!("Running test with env: {}", config);
        Self::with_timeout(move || {
            Environment::with_source(config, Box::new(FixedSource::new(records))).execute()
        })
    }

    /// A loopback address with a port no other test uses.
    pub fn next_address() -> String {
        let test_id = TEST_INDEX.fetch_add(1, Ordering::SeqCst);
        format!("127.0.0.1:{}", TEST_BASE_PORT + test_id)
    }

    /// Run the records through the remote runtime, every rank being a thread connected via TCP.
    ///
    /// Returns the result of every rank, in rank order.
    pub fn remote_run(
        records: Vec<Record>,
        processes: usize,
    ) -> Vec<Result<Option<PipelineOutcome>, PipelineError>> {
        Self::setup();
        let mut config = EnvironmentConfig::remote(Self::next_address(), processes);
        config.records = records.len();
        config.recv_timeout_secs = 10;
        debug!("Running with remote configuration: {}", config);

        Self::with_timeout(move || {
            let handles = (0..processes)
                .map(|rank: Rank| {
                    let config = config.clone();
                    let source = FixedSource::new(if rank == COORDINATOR {
                        records.clone()
                    } else {
                        Vec::new()
                    });
                    std::thread::Builder::new()
                        .name(format!("test-rank-{rank}"))
                        .spawn(move || {
                            Environment::with_source(config, Box::new(source)).execute_rank(rank)
                        })
                        .unwrap()
                })
                .collect_vec();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|e| panic!("Rank {} crashed: {:?}", rank, e))
                })
                .collect_vec()
        })
    }

    /// The result of aggregating all the records in a single pass.
    pub fn single_pass(records: &[Record]) -> FinalAggregate {
        tempscatter::aggregate::merge([aggregate(records)])
    }

    /// The numbers of ranks to test with.
    ///
    /// The list can be overridden with a comma separated list in `TEMPSCATTER_TEST_PROCESSES`.
    pub fn process_counts() -> Vec<usize> {
        Self::parse_list_from_env("TEMPSCATTER_TEST_PROCESSES").unwrap_or_else(|| vec![1, 3, 7])
    }

    /// Parse a list of arguments from an environment variable.
    ///
    /// The list should be comma separated without spaces.
    fn parse_list_from_env(var_name: &str) -> Option<Vec<usize>> {
        let content = std::env::var(var_name).ok()?;
        if content.is_empty() {
            return Some(Vec::new());
        }
        let values = content.split(',').map(usize::from_str).collect_vec();
        process_results(values.into_iter(), |values| values.collect_vec()).ok()
    }

    fn parse_int_from_env(var_name: &str) -> Option<u64> {
        let content = std::env::var(var_name).ok()?;
        u64::from_str(&content).ok()
    }
}
