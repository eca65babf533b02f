//! The pipeline run by every rank: generation, distribution, local aggregation, gathering and
//! merging, separated by barriers.

use std::fmt::{Display, Formatter};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{aggregate, merge, FinalAggregate};
use crate::config::ConfigError;
use crate::network::{unexpected, Communicator, Message, Rank, TransferError, COORDINATOR};
use crate::partition::{partition, Chunk, ChunkLayout, PartitionError};
use crate::profiler::{Monitor, PerformanceSample, RunStatistics, StageTimer, TimedStage};
use crate::record::{Record, RecordSource};

/// The stages of a run, in order.
///
/// Each transition is gated on all the ranks having reported: the barriers are named after the
/// stage they close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Generated,
    Distributed,
    Aggregated,
    Gathered,
    Merged,
}

impl Stage {
    /// The stage following this one, `None` for the last one.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Init => Some(Stage::Generated),
            Stage::Generated => Some(Stage::Distributed),
            Stage::Distributed => Some(Stage::Aggregated),
            Stage::Aggregated => Some(Stage::Gathered),
            Stage::Gathered => Some(Stage::Merged),
            Stage::Merged => None,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Generated => "generated",
            Stage::Distributed => "distributed",
            Stage::Aggregated => "aggregated",
            Stage::Gathered => "gathered",
            Stage::Merged => "merged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline failed at stage {stage} on rank {rank}: {source}")]
    Transfer {
        stage: Stage,
        rank: Rank,
        #[source]
        source: TransferError,
    },
    #[error("pipeline failed at stage {stage} on rank {rank}: {source}")]
    Partition {
        stage: Stage,
        rank: Rank,
        #[source]
        source: PartitionError,
    },
    #[error("rank {rank} cannot move from stage {from} to stage {to}")]
    InvalidTransition { rank: Rank, from: Stage, to: Stage },
    #[error("the coordinator has no record source")]
    MissingSource,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start rank {rank}: {source}")]
    Spawn {
        rank: Rank,
        #[source]
        source: std::io::Error,
    },
    #[error("rank {rank} panicked")]
    Panicked { rank: Rank },
}

impl PipelineError {
    /// The rank that reported the failure, if known.
    pub fn rank(&self) -> Option<Rank> {
        match self {
            PipelineError::Transfer { rank, .. }
            | PipelineError::Partition { rank, .. }
            | PipelineError::InvalidTransition { rank, .. }
            | PipelineError::Spawn { rank, .. }
            | PipelineError::Panicked { rank } => Some(*rank),
            PipelineError::MissingSource => Some(COORDINATOR),
            PipelineError::Config(_) => None,
        }
    }
}

/// Keeps track of the stage a rank is in, rejecting transitions out of order.
#[derive(Debug, Clone, Copy)]
pub struct StageTracker {
    rank: Rank,
    current: Stage,
}

impl StageTracker {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            current: Stage::Init,
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    /// Move to `to`, which must be the stage following the current one.
    pub fn advance(&mut self, to: Stage) -> Result<(), PipelineError> {
        if self.current.next() != Some(to) {
            return Err(PipelineError::InvalidTransition {
                rank: self.rank,
                from: self.current,
                to,
            });
        }
        debug!("rank {} entered stage {}", self.rank, to);
        self.current = to;
        Ok(())
    }
}

/// What the coordinator knows at the end of a run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Number of ranks that took part in the run.
    pub processes: usize,
    /// Number of generated records.
    pub records: usize,
    pub result: FinalAggregate,
    /// One sample per rank, in rank order.
    pub samples: Vec<PerformanceSample>,
    pub statistics: RunStatistics,
}

/// Run the pipeline on one rank.
///
/// The coordinator must be given the record source and returns `Some` outcome, every other rank
/// returns `None`. Any failure is fatal for the whole run: there is no partial result.
pub fn run_rank(
    comm: &mut Communicator,
    source: Option<&mut dyn RecordSource>,
    records: usize,
) -> Result<Option<PipelineOutcome>, PipelineError> {
    let rank = comm.rank();
    let mut monitor = Monitor::start(rank);
    let mut tracker = StageTracker::new(rank);
    let transfer = |stage: Stage| transfer_error(stage, rank);

    // generation
    let data = if comm.is_coordinator() {
        let source = source.ok_or(PipelineError::MissingSource)?;
        let data = source.generate(records);
        monitor.record(TimedStage::DataGeneration, monitor.elapsed());
        info!("generated {} records", data.len());
        data
    } else {
        Vec::new()
    };

    // distribution
    synchronize(comm, &mut tracker, Stage::Generated)?;
    let timer = StageTimer::start(TimedStage::Distribution);
    let chunk = scatter(comm, data).map_err(|e| match e {
        ScatterError::Transfer(source) => transfer(Stage::Distributed)(source),
        ScatterError::Partition(source) => PipelineError::Partition {
            stage: Stage::Distributed,
            rank,
            source,
        },
    })?;
    synchronize(comm, &mut tracker, Stage::Distributed)?;
    timer.stop(&mut monitor);

    // computation
    let timer = StageTimer::start(TimedStage::Computation);
    let partial = aggregate(&chunk);
    drop(chunk);
    synchronize(comm, &mut tracker, Stage::Aggregated)?;
    timer.stop(&mut monitor);

    // gathering
    let timer = StageTimer::start(TimedStage::Gathering);
    let partials = gather(comm, partial, "partial", Message::Partial, |msg| match msg {
        Message::Partial(p) => Ok(p),
        other => Err(other),
    })
    .map_err(transfer(Stage::Gathered))?;
    timer.stop(&mut monitor);
    let sample = monitor.finish();
    let samples = gather(comm, sample, "sample", Message::Sample, |msg| match msg {
        Message::Sample(s) => Ok(s),
        other => Err(other),
    })
    .map_err(transfer(Stage::Gathered))?;
    tracker.advance(Stage::Gathered)?;

    // merging, on the coordinator only
    let (Some(partials), Some(samples)) = (partials, samples) else {
        debug!("rank {} done", rank);
        return Ok(None);
    };
    let result = merge(partials);
    let statistics = RunStatistics::from_samples(&samples);
    tracker.advance(Stage::Merged)?;
    info!(
        "merged {} months from {} ranks",
        result.len(),
        samples.len()
    );

    Ok(Some(PipelineOutcome {
        processes: comm.size(),
        records,
        result,
        samples,
        statistics,
    }))
}

/// Wait for every rank to complete `stage`, then move the tracker to it.
fn synchronize(
    comm: &mut Communicator,
    tracker: &mut StageTracker,
    stage: Stage,
) -> Result<(), PipelineError> {
    comm.barrier(stage).map_err(transfer_error(stage, comm.rank()))?;
    tracker.advance(stage)
}

fn transfer_error(stage: Stage, rank: Rank) -> impl Fn(TransferError) -> PipelineError {
    move |source| PipelineError::Transfer {
        stage,
        rank,
        source,
    }
}

#[derive(Debug)]
enum ScatterError {
    Transfer(TransferError),
    Partition(PartitionError),
}

impl From<TransferError> for ScatterError {
    fn from(e: TransferError) -> Self {
        ScatterError::Transfer(e)
    }
}

/// Distribute the records: every rank gets the chunk with its own rank.
///
/// The coordinator announces the layout, then sends each chunk point-to-point. Its own chunk is
/// kept without any round trip. `data` is ignored on the other ranks.
fn scatter(comm: &mut Communicator, data: Vec<Record>) -> Result<Chunk, ScatterError> {
    let rank = comm.rank();
    if comm.is_coordinator() {
        let layout = ChunkLayout::new(data.len(), comm.size()).map_err(ScatterError::Partition)?;
        for dest in 1..comm.size() {
            comm.send(dest, Message::Layout(layout))?;
        }
        let mut chunks = partition(data, comm.size())
            .map_err(ScatterError::Partition)?
            .into_iter();
        let own = chunks.next().unwrap_or_default();
        for (dest, chunk) in (1..).zip(chunks) {
            debug!("sending {} records to rank {}", chunk.len(), dest);
            comm.send(dest, Message::Chunk(chunk))?;
        }
        Ok(own)
    } else {
        let layout = match comm.recv(COORDINATOR)? {
            Message::Layout(layout) => layout,
            other => return Err(unexpected(COORDINATOR, "layout", &other).into()),
        };
        if layout.workers != comm.size() {
            return Err(TransferError::RankMismatch {
                expected: comm.size(),
                found: layout.workers,
            }
            .into());
        }
        let chunk = match comm.recv(COORDINATOR)? {
            Message::Chunk(chunk) => chunk,
            other => return Err(unexpected(COORDINATOR, "chunk", &other).into()),
        };
        let expected = layout.len_of(rank);
        if chunk.len() != expected {
            return Err(TransferError::ChunkSizeMismatch {
                rank,
                expected,
                found: chunk.len(),
            }
            .into());
        }
        debug!("rank {} received {} records", rank, chunk.len());
        Ok(chunk)
    }
}

/// Collect one item per rank at the coordinator, in rank order.
///
/// `wrap` builds the message sent by the other ranks and `unwrap` extracts the item from a received
/// message, giving back the message if it is not of the `expected` kind. Only the coordinator gets
/// `Some`.
fn gather<T, W, U>(
    comm: &mut Communicator,
    own: T,
    expected: &'static str,
    wrap: W,
    unwrap: U,
) -> Result<Option<Vec<T>>, TransferError>
where
    W: Fn(T) -> Message,
    U: Fn(Message) -> Result<T, Message>,
{
    if !comm.is_coordinator() {
        comm.send(COORDINATOR, wrap(own))?;
        return Ok(None);
    }
    let mut items = Vec::with_capacity(comm.size());
    items.push(own);
    for source in 1..comm.size() {
        let start = Instant::now();
        let item = unwrap(comm.recv(source)?).map_err(|other| unexpected(source, expected, &other))?;
        trace!("gathered {} from rank {} in {:?}", expected, source, start.elapsed());
        items.push(item);
    }
    Ok(Some(items))
}
