use std::cell::RefCell;
use std::thread::JoinHandle;

use crate::network::{Communicator, Rank};
use crate::record::RecordSource;
use crate::scheduler::{run_rank, PipelineError, PipelineOutcome};

thread_local! {
    /// Rank the current thread is running the pipeline for.
    ///
    /// Access to this by calling `current_rank()`.
    static RANK: RefCell<Option<Rank>> = const { RefCell::new(None) };
}

/// Get the rank the current thread is working on.
///
/// This will return `Some(rank)` only when called from a thread spawned by `spawn_rank`, otherwise
/// `None` is returned.
pub fn current_rank() -> Option<Rank> {
    RANK.with(|x| *x.borrow())
}

/// Call a function if this struct goes out of scope without calling `defuse`, including during a
/// panic stack-unwinding.
struct CatchPanic<F: FnOnce()> {
    /// True if the function should be called.
    primed: bool,
    /// Function to call.
    ///
    /// The `Drop` implementation will move out the function.
    handler: Option<F>,
}

impl<F: FnOnce()> CatchPanic<F> {
    fn new(handler: F) -> Self {
        Self {
            primed: true,
            handler: Some(handler),
        }
    }

    /// Avoid calling the function on drop.
    fn defuse(&mut self) {
        self.primed = false;
    }
}

impl<F: FnOnce()> Drop for CatchPanic<F> {
    fn drop(&mut self) {
        if self.primed {
            if let Some(handler) = self.handler.take() {
                handler();
            }
        }
    }
}

pub(crate) type RankHandle = JoinHandle<Result<Option<PipelineOutcome>, PipelineError>>;

/// Run the pipeline of a rank in a new thread named after the rank.
pub(crate) fn spawn_rank(
    comm: Communicator,
    source: Option<Box<dyn RecordSource + Send>>,
    records: usize,
) -> std::io::Result<RankHandle> {
    let rank = comm.rank();
    debug!("starting rank {}: {}", rank, comm);
    std::thread::Builder::new()
        .name(format!("rank-{rank}"))
        .spawn(move || {
            // remember in the thread-local the rank of this thread
            RANK.with(|x| *x.borrow_mut() = Some(rank));
            do_work(comm, source, records)
        })
}

/// Run the pipeline of a rank on the current thread.
pub(crate) fn do_work(
    mut comm: Communicator,
    mut source: Option<Box<dyn RecordSource + Send>>,
    records: usize,
) -> Result<Option<PipelineOutcome>, PipelineError> {
    let rank = comm.rank();
    let mut catch_panic = CatchPanic::new(|| {
        error!("rank {} crashed!", rank);
    });
    let result = run_rank(
        &mut comm,
        source.as_deref_mut().map(|s| s as &mut dyn RecordSource),
        records,
    );
    catch_panic.defuse();
    match &result {
        Ok(_) => info!("rank {} completed", rank),
        // reported once by the caller
        Err(e) => debug!("rank {} failed: {}", rank, e),
    }
    result
}
