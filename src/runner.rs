use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::{ConfigError, EnvironmentConfig, CONFIG_ENV_VAR, RANK_ENV_VAR};
use crate::network::Rank;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot spawn rank {rank}: {source}")]
    Spawn {
        rank: Rank,
        #[source]
        source: std::io::Error,
    },
}

/// Check if this is a process spawned by the launcher.
pub fn is_spawned_process() -> bool {
    std::env::var_os(RANK_ENV_VAR).is_some()
}

/// Spawn every rank of the configuration as a process running the current executable with the
/// same arguments, and wait until all of them complete.
///
/// The rank and the configuration are passed through the environment. The output of every process
/// is forwarded prefixed with its rank. Returns the bitwise OR of the exit codes.
pub fn spawn_local_processes(config: &EnvironmentConfig) -> Result<i32, LaunchError> {
    let processes = config.processes();
    info!("starting {} processes", processes);

    let start = Instant::now();
    let config_toml = config.to_toml()?;
    let exe = std::env::current_exe().map_err(|source| LaunchError::Spawn { rank: 0, source })?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();

    let mut children = Vec::with_capacity(processes);
    for rank in 0..processes {
        let mut child = Command::new(&exe)
            .args(&args)
            .env(RANK_ENV_VAR, rank.to_string())
            .env(CONFIG_ENV_VAR, &config_toml)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn { rank, source })?;
        let forwarders = [
            child.stdout.take().map(|out| forward(rank, out, std::io::stdout)),
            child.stderr.take().map(|err| forward(rank, err, std::io::stderr)),
        ];
        children.push((rank, child, forwarders));
    }

    let mut exit_code_or = 0;
    for (rank, mut child, forwarders) in children {
        let exit_code = match child.wait() {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                error!("failed to wait for rank {}: {}", rank, e);
                1
            }
        };
        for forwarder in forwarders.into_iter().flatten() {
            let _ = forwarder.join();
        }
        if exit_code != 0 {
            warn!("rank {} exited with code {}", rank, exit_code);
        }
        exit_code_or |= exit_code;
    }

    info!("total time: {:?}", start.elapsed());
    Ok(exit_code_or)
}

/// Copy the lines of `input` to the output, prefixing them with the rank.
fn forward<R, W, F>(rank: Rank, input: R, output: F) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    W: Write,
    F: Fn() -> W + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("forward-{rank}"))
        .spawn(move || {
            for line in BufReader::new(input).lines() {
                match line {
                    Ok(line) => {
                        let _ = writeln!(output(), "{rank}|{line}");
                    }
                    Err(e) => {
                        warn!("cannot read the output of rank {}: {}", rank, e);
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn an output forwarder")
}
