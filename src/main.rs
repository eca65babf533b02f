use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use tempscatter::config::{RunOptions, DEFAULT_RECORDS};
use tempscatter::filter;
use tempscatter::report::Report;
use tempscatter::runner::{is_spawned_process, spawn_local_processes};
use tempscatter::{Environment, Error, PipelineOutcome, RuntimeConfig};

#[derive(Debug, Parser)]
#[clap(name = "tempscatter", version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute the monthly means with the distributed pipeline and report its performance.
    Run(RunOptions),
    /// Write sample `date,temperature` lines.
    Generate {
        #[clap(short = 'n', long, default_value_t = DEFAULT_RECORDS)]
        records: usize,
        #[clap(long)]
        seed: Option<u64>,
        /// Output file, stdout if missing.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Turn `date,temperature` lines from stdin into `month<TAB>temperature` lines.
    Map,
    /// Average the sorted `key<TAB>value` lines from stdin.
    Reduce,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(options) => run(options),
        Command::Generate {
            records,
            seed,
            output,
        } => generate(records, seed, output),
        Command::Map => filter::map(std::io::stdin().lock(), std::io::stdout().lock())
            .map(|stats| {
                eprintln!("{stats}");
                0
            })
            .map_err(Error::from),
        Command::Reduce => filter::reduce(std::io::stdin().lock(), std::io::stdout().lock())
            .map(|stats| {
                eprintln!("{stats}");
                0
            })
            .map_err(Error::from),
    };

    exit_code(result, std::io::stderr().lock())
}

/// Turn the result of a command into the exit code, printing a fatal error once on `stderr`.
fn exit_code<W: Write>(result: Result<i32, Error>, mut stderr: W) -> ExitCode {
    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            let _ = writeln!(stderr, "{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: RunOptions) -> Result<i32, Error> {
    let config = options.clone().into_config()?;
    let outcome = match &config.runtime {
        RuntimeConfig::Local(_) => Some(Environment::new(config.clone()).execute()?),
        RuntimeConfig::Remote(_) if options.spawn && !is_spawned_process() => {
            return Ok(spawn_local_processes(&config)?);
        }
        RuntimeConfig::Remote(_) => {
            let rank = options.rank(&config)?;
            Environment::new(config.clone()).execute_rank(rank)?
        }
    };
    if let Some(outcome) = outcome {
        publish(&outcome, &config.report_dir);
    }
    Ok(0)
}

/// Print the summary and save the report. A report that cannot be written does not fail the run.
fn publish(outcome: &PipelineOutcome, report_dir: &std::path::Path) {
    let report = Report::new(outcome);
    println!();
    print!("{}", report.summary());
    match report.save(report_dir) {
        Ok(path) => println!("\nFull report saved to: {}", path.display()),
        Err(e) => println!("\nThe report could not be saved: {e}"),
    }
}

fn generate(records: usize, seed: Option<u64>, output: Option<PathBuf>) -> Result<i32, Error> {
    match output {
        Some(path) => {
            let file = File::create(&path).map_err(filter::FilterError::from)?;
            filter::write_samples(records, seed, BufWriter::new(file))?;
            eprintln!("Generated {records} entries and saved to {}.", path.display());
        }
        None => {
            let stdout = std::io::stdout().lock();
            filter::write_samples(records, seed, BufWriter::new(stdout))?;
        }
    }
    std::io::stderr().flush().map_err(filter::FilterError::from)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempscatter::network::TransferError;
    use tempscatter::{PipelineError, Stage};

    use super::*;

    #[test]
    fn fatal_error_is_printed_once() {
        let error = Error::from(PipelineError::Transfer {
            stage: Stage::Init,
            rank: 0,
            source: TransferError::Timeout {
                peer: 1,
                timeout: Duration::from_secs(1),
            },
        });
        let mut stderr = Vec::new();
        assert_eq!(exit_code(Err(error), &mut stderr), ExitCode::FAILURE);
        let stderr = String::from_utf8(stderr).unwrap();
        assert_eq!(
            stderr,
            "pipeline failed at stage init on rank 0: no message from rank 1 within 1s\n"
        );
    }

    #[test]
    fn exit_codes() {
        let mut stderr = Vec::new();
        assert_eq!(exit_code(Ok(0), &mut stderr), ExitCode::SUCCESS);
        assert_eq!(exit_code(Ok(3), &mut stderr), ExitCode::from(3));
        assert_eq!(exit_code(Ok(-1), &mut stderr), ExitCode::from(1));
        assert!(stderr.is_empty());
    }
}
