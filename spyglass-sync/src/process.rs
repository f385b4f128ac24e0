//! Turns dirty positions into confirmed wallet transactions

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bitcoin::Block;
use crossbeam_channel as channel;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::block_index::BlockIndex;
use crate::client::{BlockResponse, FetchRequest};
use crate::error::SyncError;
use crate::interface::SyncStorage;
use crate::job::JobCounter;
use crate::keys::TargetSet;
use crate::matcher;
use crate::primitives::{ConfirmedTransaction, Position, SubchainKey};

/// Run-once-on-drop callback signalling that every [`Work`] item of a batch
/// has reached a terminal state.
///
/// The guard is shared by every work item of the batch; it fires exactly once
/// regardless of how the batch is dropped - success, forced reset, or reorg
/// truncation.
pub(crate) struct CompletionGuard {
    on_done: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CompletionGuard {
    pub(crate) fn new(on_done: impl FnOnce() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            on_done: Some(Box::new(on_done)),
        })
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
    }
}

impl std::fmt::Debug for CompletionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionGuard").finish_non_exhaustive()
    }
}

/// One unit of work: confirm whether the block at a position matches the
/// wallet targets once downloaded.
#[derive(Debug)]
struct Work {
    position: Position,
    batch: Arc<CompletionGuard>,
    attempts: u32,
}

/// A downloaded block ready for the exact-match pass.
#[derive(Debug)]
struct ReadyWork {
    position: Position,
    block: Box<Block>,
    batch: Arc<CompletionGuard>,
}

struct MatchCompleted {
    position: Position,
    confirmed: Vec<ConfirmedTransaction>,
    batch: Arc<CompletionGuard>,
}

/// Bounds in-flight block downloads and stages completed ones.
struct Cache {
    pending: VecDeque<Work>,
    downloading: Vec<(Work, oneshot::Receiver<BlockResponse>)>,
    limit: usize,
    block_index: BlockIndex,
    fetch_request_sender: UnboundedSender<FetchRequest>,
}

impl Cache {
    fn new(
        limit: usize,
        block_index: BlockIndex,
        fetch_request_sender: UnboundedSender<FetchRequest>,
    ) -> Self {
        Self {
            pending: VecDeque::new(),
            downloading: Vec::new(),
            limit,
            block_index,
            fetch_request_sender,
        }
    }

    fn push(&mut self, work: Work) {
        self.pending.push_back(work);
    }

    /// Moves resolved downloads to ready, evicts their hashes from the block
    /// index, and tops the downloading set back up from the pending queue.
    ///
    /// Returns ready work plus the positions abandoned because the supplier
    /// is shutting down; abandoned work is not retried.
    fn pop(&mut self) -> (Vec<ReadyWork>, Vec<Position>) {
        let mut ready = Vec::new();
        let mut abandoned = Vec::new();
        let mut still_downloading = Vec::new();

        for (mut work, mut receiver) in self.downloading.drain(..) {
            match receiver.try_recv() {
                Ok(BlockResponse::Block(block)) => {
                    self.block_index.release(&work.position.hash());
                    ready.push(ReadyWork {
                        position: work.position,
                        block,
                        batch: work.batch,
                    });
                }
                Ok(BlockResponse::ShuttingDown) => {
                    self.block_index.release(&work.position.hash());
                    abandoned.push(work.position);
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    still_downloading.push((work, receiver))
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    // transient: the response was dropped without resolving;
                    // request the block again
                    self.block_index.release(&work.position.hash());
                    work.attempts += 1;
                    tracing::debug!(
                        "Re-requesting block {} (attempt {})",
                        work.position.hash(),
                        work.attempts + 1
                    );
                    self.pending.push_back(work);
                }
            }
        }
        self.downloading = still_downloading;

        while self.downloading.len() < self.limit {
            let Some(work) = self.pending.pop_front() else {
                break;
            };
            let hash = work.position.hash();
            if !self.block_index.try_reserve(&hash) {
                tracing::debug!("Block {} already downloading on this chain", hash);
            }
            let (sender, receiver) = oneshot::channel();
            match self
                .fetch_request_sender
                .send(FetchRequest::Block(sender, hash))
            {
                Ok(()) => self.downloading.push((work, receiver)),
                Err(_) => {
                    // supplier gone; equivalent to a shutdown response
                    self.block_index.release(&hash);
                    abandoned.push(work.position);
                }
            }
        }

        (ready, abandoned)
    }

    /// Drops all work above the common ancestor.
    fn reorg(&mut self, common_parent: &Position) {
        self.pending
            .retain(|work| work.position.height() <= common_parent.height());
        let (keep, drop): (Vec<_>, Vec<_>) = self
            .downloading
            .drain(..)
            .partition(|(work, _)| work.position.height() <= common_parent.height());
        for (work, _) in drop {
            self.block_index.release(&work.position.hash());
        }
        self.downloading = keep;
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.downloading.is_empty()
    }
}

/// Outcome of one [`Process::run`] pump.
#[derive(Debug, Default)]
pub(crate) struct ProcessReport {
    /// Positions with a definitive outcome this pump, with any confirmed
    /// transactions (empty vec proves a false positive).
    pub(crate) resolved: Vec<(Position, Vec<ConfirmedTransaction>)>,
    /// Whether work remains in flight and further scheduling is needed.
    pub(crate) busy: bool,
}

/// Owns download/match execution for one subchain.
///
/// Downloads are bounded by the cache limit; the exact-match stage is bounded
/// separately by the processing slots. At most one in-flight match pass
/// exists per position, enforced by the outstanding set's single ownership of
/// each work item.
pub(crate) struct Process {
    key: SubchainKey,
    cache: Cache,
    waiting: VecDeque<ReadyWork>,
    processing: usize,
    outstanding: HashMap<i64, bitcoin::BlockHash>,
    slots: usize,
    match_sender: channel::Sender<MatchCompleted>,
    match_receiver: channel::Receiver<MatchCompleted>,
    jobs: JobCounter,
}

impl Process {
    pub(crate) fn new(
        key: SubchainKey,
        cache_limit: usize,
        slots: usize,
        block_index: BlockIndex,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        jobs: JobCounter,
    ) -> Self {
        let (match_sender, match_receiver) = channel::unbounded();

        Self {
            key,
            cache: Cache::new(cache_limit, block_index, fetch_request_sender),
            waiting: VecDeque::new(),
            processing: 0,
            outstanding: HashMap::new(),
            slots,
            match_sender,
            match_receiver,
            jobs,
        }
    }

    /// Enqueues dirty positions for download and exact matching. A position
    /// already owned by an existing work item is skipped, so overlapping
    /// requests never schedule a duplicate download.
    pub(crate) fn request(&mut self, dirty: &[Position], batch: &Arc<CompletionGuard>) {
        for position in dirty {
            if self.outstanding.contains_key(&position.height()) {
                continue;
            }
            self.outstanding.insert(position.height(), position.hash());
            self.cache.push(Work {
                position: *position,
                batch: Arc::clone(batch),
                attempts: 0,
            });
        }
    }

    /// Pumps the pipeline: stages completed downloads, dispatches exact
    /// matching up to the slot bound, and persists completed matches.
    pub(crate) fn run<S>(
        &mut self,
        targets: &Arc<TargetSet>,
        storage: &Arc<S>,
    ) -> Result<ProcessReport, SyncError>
    where
        S: SyncStorage,
    {
        let (ready, abandoned) = self.cache.pop();
        for position in &abandoned {
            // supplier shutdown: work not completed, no redownload
            self.outstanding.remove(&position.height());
        }
        self.waiting.extend(ready);

        while self.processing < self.slots {
            let Some(work) = self.waiting.pop_front() else {
                break;
            };
            self.spawn_match(work, targets);
        }

        let mut report = ProcessReport::default();
        while let Ok(completed) = self.match_receiver.try_recv() {
            self.processing -= 1;
            let current = self.outstanding.get(&completed.position.height());
            if current != Some(&completed.position.hash()) {
                // reorged away while matching; leave no trace
                continue;
            }

            if !completed.confirmed.is_empty() {
                storage.add_confirmed_transactions(
                    &self.key,
                    &completed.position,
                    &completed.confirmed,
                )?;
                tracing::info!(
                    "Confirmed {} transaction(s) for {} at {}",
                    completed.confirmed.len(),
                    self.key,
                    completed.position
                );
            }
            self.outstanding.remove(&completed.position.height());
            report
                .resolved
                .push((completed.position, completed.confirmed));
        }

        report.busy = !self.is_idle();

        Ok(report)
    }

    /// Whether a work item already owns this position.
    pub(crate) fn is_outstanding(&self, position: &Position) -> bool {
        self.outstanding.contains_key(&position.height())
    }

    /// Drops pending, downloading, and in-processing work above the common
    /// ancestor.
    pub(crate) fn reorg(&mut self, common_parent: &Position) {
        self.cache.reorg(common_parent);
        self.waiting
            .retain(|work| work.position.height() <= common_parent.height());
        self.outstanding
            .retain(|height, _| *height <= common_parent.height());
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.cache.is_empty() && self.waiting.is_empty() && self.processing == 0
    }

    fn spawn_match(&mut self, work: ReadyWork, targets: &Arc<TargetSet>) {
        self.processing += 1;
        let sender = self.match_sender.clone();
        let targets = Arc::clone(targets);
        let job = self.jobs.job();
        rayon::spawn_fifo(move || {
            let confirmed = matcher::match_block(&targets, &work.block);
            let _ = sender.send(MatchCompleted {
                position: work.position,
                confirmed,
                batch: work.batch,
            });
            drop(job);
        });
    }
}
