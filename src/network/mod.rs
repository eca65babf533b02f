//! Point-to-point messaging between the ranks of a run.
//!
//! The ranks are connected in a star: the coordinator (rank 0) has a link to every other rank,
//! while the other ranks only have a link to the coordinator. A link is either an in-memory channel
//! pair, when the ranks are threads of the same process, or a TCP connection.

use std::fmt::{Display, Formatter};
use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use topology::*;

use crate::aggregate::PartialAggregate;
use crate::channel::{Receiver, RecvTimeoutError, Sender};
use crate::partition::{Chunk, ChunkLayout};
use crate::profiler::PerformanceSample;
use crate::scheduler::Stage;

pub(crate) mod remote;
mod topology;

/// Identity of a participant of the run, `0..processes`.
pub type Rank = usize;

/// The rank of the coordinator: it generates the data, distributes it and merges the results.
pub const COORDINATOR: Rank = 0;

/// The messages exchanged between the ranks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// First message sent by a rank after connecting to the coordinator.
    Hello { rank: Rank },
    /// The sender reached the barrier at the end of the stage.
    BarrierReached(Stage),
    /// Every rank reached the barrier, the receiver can go on.
    BarrierRelease(Stage),
    /// How the records are split among the ranks.
    Layout(ChunkLayout),
    Chunk(Chunk),
    Partial(PartialAggregate),
    Sample(PerformanceSample),
}

impl Message {
    /// A short name of the kind of message, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::BarrierReached(_) => "barrier-reached",
            Message::BarrierRelease(_) => "barrier-release",
            Message::Layout(_) => "layout",
            Message::Chunk(_) => "chunk",
            Message::Partial(_) => "partial",
            Message::Sample(_) => "sample",
        }
    }
}

/// A failure transferring data between two ranks. Any of these is fatal for the run.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no message from rank {peer} within {timeout:?}")]
    Timeout { peer: Rank, timeout: Duration },
    #[error("rank {peer} disconnected")]
    Disconnected { peer: Rank },
    #[error("expected a {expected} message from rank {peer}, got {found}")]
    UnexpectedMessage {
        peer: Rank,
        expected: &'static str,
        found: &'static str,
    },
    #[error("rank mismatch: expected rank {expected}, got {found}")]
    RankMismatch { expected: Rank, found: Rank },
    #[error("chunk of rank {rank} has {found} records, {expected} were announced")]
    ChunkSizeMismatch {
        rank: Rank,
        expected: usize,
        found: usize,
    },
    #[error("rank {from} has no link to rank {to}")]
    NoRoute { from: Rank, to: Rank },
    #[error("network error with rank {peer} ({address}): {source}")]
    Io {
        peer: Rank,
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode a message for rank {peer}: {source}")]
    Encode {
        peer: Rank,
        #[source]
        source: bincode::error::EncodeError,
    },
    #[error("failed to decode a message from rank {peer}: {source}")]
    Decode {
        peer: Rank,
        #[source]
        source: bincode::error::DecodeError,
    },
}

/// One side of the connection between two ranks.
pub(crate) enum Link {
    Local {
        tx: Sender<Message>,
        rx: Receiver<Message>,
    },
    Remote(remote::RemoteLink),
}

impl Link {
    pub(crate) fn remote(stream: TcpStream, timeout: Duration) -> std::io::Result<Self> {
        remote::RemoteLink::new(stream, timeout).map(Link::Remote)
    }
}

/// The endpoint of a rank: sends messages to and receives messages from the other ranks.
///
/// Every operation is blocking. A receive waits at most the configured timeout.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Communicator {
    rank: Rank,
    size: usize,
    timeout: Duration,
    /// The link towards every rank, indexed by rank. `None` where no link exists.
    #[derivative(Debug = "ignore")]
    links: Vec<Option<Link>>,
}

impl Communicator {
    pub(crate) fn new(rank: Rank, size: usize, timeout: Duration, links: Vec<Option<Link>>) -> Self {
        debug_assert_eq!(links.len(), size);
        Self {
            rank,
            size,
            timeout,
            links,
        }
    }

    /// The rank of this endpoint.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The number of ranks taking part in the run.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn link(&mut self, peer: Rank) -> Result<&mut Link, TransferError> {
        let from = self.rank;
        self.links
            .get_mut(peer)
            .and_then(Option::as_mut)
            .ok_or(TransferError::NoRoute { from, to: peer })
    }

    /// Send a message to `dest`, blocking until it has been handed to the link.
    pub fn send(&mut self, dest: Rank, message: Message) -> Result<(), TransferError> {
        let rank = self.rank;
        log::trace!("rank {} sending {} to rank {}", rank, message.kind(), dest);
        match self.link(dest)? {
            Link::Local { tx, .. } => tx
                .send(message)
                .map_err(|_| TransferError::Disconnected { peer: dest }),
            Link::Remote(link) => link.send(rank, dest, &message),
        }
    }

    /// Receive the next message sent by `source`.
    pub fn recv(&mut self, source: Rank) -> Result<Message, TransferError> {
        let timeout = self.timeout;
        let message = match self.link(source)? {
            Link::Local { rx, .. } => rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => TransferError::Timeout {
                    peer: source,
                    timeout,
                },
                RecvTimeoutError::Disconnected => TransferError::Disconnected { peer: source },
            })?,
            Link::Remote(link) => link.recv(source)?,
        };
        log::trace!(
            "rank {} received {} from rank {}",
            self.rank,
            message.kind(),
            source
        );
        Ok(message)
    }

    /// Block until every rank has reached the barrier at the end of `stage`.
    ///
    /// Every rank reports to the coordinator, which waits for all the reports (in rank order) and
    /// then releases everybody.
    pub fn barrier(&mut self, stage: Stage) -> Result<(), TransferError> {
        if self.is_coordinator() {
            for rank in 1..self.size {
                match self.recv(rank)? {
                    Message::BarrierReached(s) if s == stage => {}
                    other => return Err(unexpected(rank, "barrier-reached", &other)),
                }
            }
            for rank in 1..self.size {
                self.send(rank, Message::BarrierRelease(stage))?;
            }
        } else {
            self.send(COORDINATOR, Message::BarrierReached(stage))?;
            match self.recv(COORDINATOR)? {
                Message::BarrierRelease(s) if s == stage => {}
                other => return Err(unexpected(COORDINATOR, "barrier-release", &other)),
            }
        }
        log::debug!("rank {} passed the {} barrier", self.rank, stage);
        Ok(())
    }
}

impl Display for Communicator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Communicator[r{}/{}]", self.rank, self.size)
    }
}

/// Build the error for a message of the wrong kind.
pub(crate) fn unexpected(peer: Rank, expected: &'static str, found: &Message) -> TransferError {
    TransferError::UnexpectedMessage {
        peer,
        expected,
        found: found.kind(),
    }
}
