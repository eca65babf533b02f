use crate::config::{ConfigError, EnvironmentConfig, RuntimeConfig};
use crate::network::{
    accept_workers, bind_coordinator, connect_coordinator, local_world, Rank, COORDINATOR,
};
use crate::record::{RecordSource, SampleSource};
use crate::scheduler::{PipelineError, PipelineOutcome, Stage};
use crate::worker::{do_work, spawn_rank};

/// Entry point of a run: holds the configuration and the source of the records.
///
/// ```
/// # use tempscatter::config::EnvironmentConfig;
/// # use tempscatter::environment::Environment;
/// let mut config = EnvironmentConfig::local(3);
/// config.records = 1000;
/// config.seed = Some(42);
/// let outcome = Environment::new(config).execute().unwrap();
/// assert_eq!(outcome.samples.len(), 3);
/// ```
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Environment {
    config: EnvironmentConfig,
    #[derivative(Debug = "ignore")]
    source: Box<dyn RecordSource + Send>,
}

impl Environment {
    /// Environment generating normally distributed temperatures.
    pub fn new(config: EnvironmentConfig) -> Self {
        let source = SampleSource::new(config.seed);
        Self::with_source(config, Box::new(source))
    }

    /// Environment whose coordinator takes the records from `source`.
    pub fn with_source(config: EnvironmentConfig, source: Box<dyn RecordSource + Send>) -> Self {
        info!("constructing environment: {}", config);
        Self { config, source }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Run all the ranks of a local runtime and return the outcome of the coordinator.
    ///
    /// Every rank is a thread of this process. If any rank fails the first error, in rank order,
    /// is returned.
    pub fn execute(self) -> Result<PipelineOutcome, PipelineError> {
        self.config.validate()?;
        let processes = match &self.config.runtime {
            RuntimeConfig::Local(local) => local.processes,
            RuntimeConfig::Remote(_) => {
                return Err(ConfigError::WrongRuntime { expected: "local" }.into())
            }
        };
        let records = self.config.records;
        let mut world = local_world(processes, self.config.recv_timeout()).into_iter();
        let coordinator = world.next().ok_or(ConfigError::NoProcesses)?;

        info!("starting {} local ranks", processes);
        let handles = world
            .map(|comm| {
                let rank = comm.rank();
                spawn_rank(comm, None, records)
                    .map_err(|source| PipelineError::Spawn { rank, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // on error the coordinator communicator is dropped here, so the workers waiting on it
        // see a disconnection instead of waiting for the timeout
        let outcome = do_work(coordinator, Some(self.source), records);

        let mut first_error = None;
        for (rank, handle) in (1..).zip(handles) {
            let result = handle
                .join()
                .unwrap_or(Err(PipelineError::Panicked { rank }));
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match (outcome, first_error) {
            (Ok(Some(outcome)), None) => Ok(outcome),
            (Err(e), _) | (Ok(_), Some(e)) => Err(e),
            // only the coordinator runs without a source
            (Ok(None), None) => Err(PipelineError::MissingSource),
        }
    }

    /// Run a single rank of a remote runtime.
    ///
    /// The coordinator waits for all the other ranks to connect and returns the outcome, every
    /// other rank connects to the coordinator and returns `None`.
    pub fn execute_rank(self, rank: Rank) -> Result<Option<PipelineOutcome>, PipelineError> {
        self.config.validate()?;
        let remote = match &self.config.runtime {
            RuntimeConfig::Remote(remote) => remote.clone(),
            RuntimeConfig::Local(_) => {
                return Err(ConfigError::WrongRuntime { expected: "remote" }.into())
            }
        };
        self.config.check_rank(rank)?;
        let timeout = self.config.recv_timeout();
        let connection_error = |source| PipelineError::Transfer {
            stage: Stage::Init,
            rank,
            source,
        };
        let (comm, source) = if rank == COORDINATOR {
            let listener = bind_coordinator(&remote.coordinator).map_err(connection_error)?;
            info!(
                "coordinator listening on {}, waiting for {} ranks",
                remote.coordinator,
                remote.processes - 1
            );
            let comm =
                accept_workers(listener, remote.processes, timeout).map_err(connection_error)?;
            (comm, Some(self.source))
        } else {
            let comm = connect_coordinator(&remote.coordinator, rank, remote.processes, timeout)
                .map_err(connection_error)?;
            (comm, None)
        };
        do_work(comm, source, self.config.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FixedSource, Month, Record};

    #[test]
    fn local_execution() {
        let mut config = EnvironmentConfig::local(4);
        config.records = 10;
        let records = (0..10)
            .map(|i| Record::new(Month::cycle(i), i as f64))
            .collect();
        let outcome = Environment::with_source(config, Box::new(FixedSource::new(records)))
            .execute()
            .unwrap();
        assert_eq!(outcome.processes, 4);
        assert_eq!(outcome.result.len(), 10);
        assert_eq!(outcome.result.mean(Month::JANUARY), Some(0.0));
        let ranks: Vec<_> = outcome.samples.iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn wrong_runtime() {
        let err = Environment::new(EnvironmentConfig::remote("127.0.0.1:0", 2))
            .execute()
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::WrongRuntime { expected: "local" })
        ));
        let err = Environment::new(EnvironmentConfig::local(0))
            .execute()
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::NoProcesses)));
    }

    #[test]
    fn remote_execution_over_loopback() {
        // reserve a free port, then release it for the coordinator
        let address = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .unwrap()
            .to_string();
        let mut config = EnvironmentConfig::remote(address, 3);
        config.records = 300;
        config.seed = Some(5);

        let workers: Vec<_> = (1..3)
            .map(|rank| {
                let config = config.clone();
                std::thread::spawn(move || Environment::new(config).execute_rank(rank))
            })
            .collect();
        let outcome = Environment::new(config)
            .execute_rank(COORDINATOR)
            .unwrap()
            .unwrap();
        for worker in workers {
            assert!(worker.join().unwrap().unwrap().is_none());
        }
        assert_eq!(outcome.result.totals().records(), 300);
        assert_eq!(outcome.samples.len(), 3);
    }
}
