//! Aggregate root binding one subchain to its scan pipeline

use std::sync::Arc;
use std::time::Duration;

use bitcoin::{BlockHash, OutPoint, Transaction};
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};

use crate::block_index::BlockIndex;
use crate::client::FetchRequest;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::interface::{HeaderOracle, SyncStorage, WalletSubaccount};
use crate::job::JobCounter;
use crate::keys::{KeyElement, TargetSet};
use crate::matcher;
use crate::process::{CompletionGuard, Process};
use crate::progress::Progress;
use crate::rescan::Rescan;
use crate::scan::{scan_interval, Scan, ScanOutcome};
use crate::primitives::{Position, ScanProgress, SubchainKey};

/// Messages accepted by a running [`SubchainStateData`].
///
/// External callers drive the task through [`SubchainHandle`]; the remaining
/// variants are internal completion signals.
#[derive(Debug)]
pub(crate) enum SubchainMessage {
    /// The filter indexer advanced; scan towards the new tip.
    NewFilter(Position),
    /// A previously requested block became available.
    BlockAvailable(BlockHash),
    /// Match an unconfirmed transaction against the target set.
    Mempool(Box<Transaction>),
    /// The chain reorganized; truncate all state to the common ancestor.
    Reorg {
        /// Highest block shared by the old and new branch.
        ancestor: Position,
        /// Acknowledged once truncation completes.
        done: Option<oneshot::Sender<bool>>,
    },
    /// A scan invocation finished on the CPU pool.
    ScanComplete {
        /// Dispatch generation, for discarding completions that raced a
        /// reorg.
        generation: u64,
        /// The classification outcome.
        result: Result<ScanOutcome, SyncError>,
    },
    /// A key indexing job finished on the CPU pool.
    IndexComplete {
        /// Elements derived since the previous watermark.
        elements: Vec<KeyElement>,
    },
    /// Every work item of a batch reached a terminal state.
    BatchDone(u64),
    /// Wait for outstanding background jobs, then acknowledge.
    FinishBackgroundTasks(oneshot::Sender<()>),
    /// Terminal.
    Shutdown,
}

/// Cheap, clonable front for driving a subchain task.
#[derive(Debug, Clone)]
pub struct SubchainHandle {
    sender: UnboundedSender<SubchainMessage>,
}

impl SubchainHandle {
    /// Announces a new filter tip. Returns `false` if the subchain has shut
    /// down.
    pub fn process_new_filter(&self, tip: Position) -> bool {
        self.sender.send(SubchainMessage::NewFilter(tip)).is_ok()
    }

    /// Announces that a block arrived from the supplier.
    pub fn process_block_available(&self, hash: BlockHash) -> bool {
        self.sender
            .send(SubchainMessage::BlockAvailable(hash))
            .is_ok()
    }

    /// Submits an unconfirmed transaction for matching.
    pub fn process_mempool(&self, transaction: Transaction) -> bool {
        self.sender
            .send(SubchainMessage::Mempool(Box::new(transaction)))
            .is_ok()
    }

    /// Truncates all subchain state to the common ancestor. Resolves once
    /// the truncation has completed, `false` if the subchain is gone.
    pub async fn process_reorg(&self, ancestor: Position) -> bool {
        let (done, receiver) = oneshot::channel();
        if self
            .sender
            .send(SubchainMessage::Reorg {
                ancestor,
                done: Some(done),
            })
            .is_err()
        {
            return false;
        }

        receiver.await.unwrap_or(false)
    }

    /// Waits until every outstanding background job has drained.
    pub async fn finish_background_tasks(&self) {
        let (ack, receiver) = oneshot::channel();
        if self
            .sender
            .send(SubchainMessage::FinishBackgroundTasks(ack))
            .is_ok()
        {
            let _ = receiver.await;
        }
    }

    /// Requests an orderly shutdown.
    pub fn shutdown(&self) {
        let _ = self.sender.send(SubchainMessage::Shutdown);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubchainState {
    Normal,
    ReorgInProgress,
    Shutdown,
}

/// Owns the Scan/Rescan/Process/Progress state machines for one subchain and
/// runs them as a single-threaded message loop.
pub struct SubchainStateData<H, S, W> {
    key: SubchainKey,
    config: SyncConfig,
    header_oracle: Arc<H>,
    storage: Arc<S>,
    wallet: Arc<W>,
    scan: Scan,
    rescan: Rescan,
    process: Process,
    progress: Progress<S>,
    targets: Arc<TargetSet>,
    filter_tip: Option<Position>,
    state: SubchainState,
    indexing: bool,
    scan_generation: u64,
    next_batch: u64,
    reorg_lock: Arc<Mutex<()>>,
    jobs: JobCounter,
    self_sender: UnboundedSender<SubchainMessage>,
    receiver: UnboundedReceiver<SubchainMessage>,
}

impl<H, S, W> SubchainStateData<H, S, W>
where
    H: HeaderOracle,
    S: SyncStorage,
    W: WalletSubaccount,
{
    /// Creates the aggregate, resuming scan state from storage.
    ///
    /// `block_index` and `reorg_lock` are shared by every subchain of the
    /// same chain and are handed in by the chain owner.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: SubchainKey,
        config: SyncConfig,
        header_oracle: Arc<H>,
        storage: Arc<S>,
        wallet: Arc<W>,
        block_index: BlockIndex,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        reorg_lock: Arc<Mutex<()>>,
        notification_sender: UnboundedSender<ScanProgress>,
    ) -> Result<(Self, SubchainHandle), SyncError> {
        let last_scanned = storage.last_scanned(&key)?;
        let jobs = JobCounter::new();
        let (self_sender, receiver) = mpsc::unbounded_channel();

        let scan = Scan::load(last_scanned);
        let rescan = Rescan::new(config.rescan_quiet_window);
        let process = Process::new(
            key.clone(),
            config.cache_limit(),
            config.processing_slots(),
            block_index,
            fetch_request_sender,
            jobs.clone(),
        );
        let progress = Progress::load(key.clone(), Arc::clone(&storage), notification_sender)?;

        let handle = SubchainHandle {
            sender: self_sender.clone(),
        };
        let data = Self {
            key,
            config,
            header_oracle,
            storage,
            wallet,
            scan,
            rescan,
            process,
            progress,
            targets: Arc::new(TargetSet::default()),
            filter_tip: None,
            state: SubchainState::Normal,
            indexing: false,
            scan_generation: 0,
            next_batch: 0,
            reorg_lock,
            jobs,
            self_sender,
            receiver,
        };

        Ok((data, handle))
    }

    /// Message loop. Runs until shutdown; any returned error is fatal for
    /// this subchain.
    pub async fn run(mut self) -> Result<(), SyncError> {
        tracing::info!("Subchain {} started", self.key);
        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                maybe_message = self.receiver.recv() => {
                    match maybe_message {
                        Some(message) => {
                            if !self.handle_message(message).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    if self.state == SubchainState::Normal {
                        self.pump()?;
                    }
                }
            }
        }

        tracing::info!("Subchain {} shut down", self.key);

        Ok(())
    }

    async fn handle_message(&mut self, message: SubchainMessage) -> Result<bool, SyncError> {
        match message {
            SubchainMessage::NewFilter(tip) => {
                self.filter_tip = Some(tip);
                if self.scan.caught_up(&tip) && !self.rescan.is_active() {
                    self.progress.republish();
                }
                self.pump()?;
            }
            SubchainMessage::BlockAvailable(hash) => {
                tracing::debug!("Block {} available for {}", hash, self.key);
                self.pump()?;
            }
            SubchainMessage::Mempool(transaction) => self.process_mempool(&transaction)?,
            SubchainMessage::Reorg { ancestor, done } => {
                self.handle_reorg(ancestor).await?;
                if let Some(done) = done {
                    let _ = done.send(true);
                }
            }
            SubchainMessage::ScanComplete { generation, result } => {
                self.handle_scan_complete(generation, result)?
            }
            SubchainMessage::IndexComplete { elements } => self.handle_index_complete(elements)?,
            SubchainMessage::BatchDone(id) => {
                tracing::debug!("Batch {} for {} completed", id, self.key)
            }
            SubchainMessage::FinishBackgroundTasks(ack) => {
                self.jobs.wait_idle().await;
                let _ = ack.send(());
            }
            SubchainMessage::Shutdown => {
                self.state = SubchainState::Shutdown;
                self.jobs.wait_idle().await;
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// One scheduler tick: pump the download/match pipeline, absorb its
    /// results, and dispatch the next scan invocation if one is due.
    fn pump(&mut self) -> Result<(), SyncError> {
        let report = self.process.run(&self.targets, &self.storage)?;
        if !report.resolved.is_empty() {
            let targets = Arc::make_mut(&mut self.targets);
            for (position, confirmed) in &report.resolved {
                for transaction in confirmed {
                    for output in transaction.outputs() {
                        targets.track_outpoint(
                            OutPoint {
                                txid: transaction.txid(),
                                vout: output.vout(),
                            },
                            output.element_index(),
                            output.script_pubkey().clone(),
                            position.height(),
                        );
                    }
                }
                self.rescan.resolve(position);
            }
            if let Some(tip) = self.filter_tip {
                self.rescan.try_finish(self.progress.position(), &tip);
            }
        }

        self.maybe_dispatch_scan();

        Ok(())
    }

    fn maybe_dispatch_scan(&mut self) {
        if !self.check_index() || self.scan.in_flight() || self.targets.is_empty() {
            return;
        }
        let Some(tip) = self.filter_tip else {
            return;
        };

        if self.rescan.is_active() {
            // blocks whose work was lost to a reset still need processing
            let unresolved: Vec<Position> = self
                .rescan
                .unresolved()
                .into_iter()
                .filter(|position| !self.process.is_outstanding(position))
                .collect();
            if !unresolved.is_empty() {
                let batch = self.new_batch();
                self.process.request(&unresolved, &batch);
            }

            let from = self
                .progress
                .position()
                .map_or(0, |position| position.height() + 1);
            let stop = self.rescan.stop_height(&tip);
            if from <= stop {
                self.dispatch_scan(from, stop, true);
            }
        } else {
            let from = self
                .scan
                .frontier()
                .map_or(0, |frontier| frontier.height() + 1);
            if from <= tip.height() {
                self.dispatch_scan(from, tip.height(), false);
            }
        }
    }

    fn dispatch_scan(&mut self, from: i64, stop: i64, was_rescan: bool) {
        self.scan.begin();
        self.scan_generation += 1;
        let generation = self.scan_generation;

        let header_oracle = Arc::clone(&self.header_oracle);
        let storage = Arc::clone(&self.storage);
        let targets = Arc::clone(&self.targets);
        let resolved = self.rescan.resolved_snapshot();
        let filter_type = self.key.filter_type();
        let batch = self.config.scan_batch;
        let sender = self.self_sender.clone();
        let job = self.jobs.job();

        rayon::spawn_fifo(move || {
            let result = scan_interval(
                header_oracle.as_ref(),
                storage.as_ref(),
                filter_type,
                targets.as_ref(),
                &resolved,
                from,
                stop,
                batch,
                was_rescan,
            );
            let _ = sender.send(SubchainMessage::ScanComplete { generation, result });
            drop(job);
        });
    }

    fn handle_scan_complete(
        &mut self,
        generation: u64,
        result: Result<ScanOutcome, SyncError>,
    ) -> Result<(), SyncError> {
        if generation != self.scan_generation {
            // raced a reorg; the outcome describes a stale branch
            return Ok(());
        }
        let outcome = result?;
        self.scan.complete(&outcome);

        if let Some(interrupt) = outcome.interrupt {
            tracing::debug!(
                "Scan of {} from height {} interrupted: {:?}",
                self.key,
                outcome.start_height,
                interrupt
            );
        }

        if outcome.was_rescan {
            // while a rescan is active it controls the cursor directly
            self.progress.process_update(outcome.highest_clean)?;
        } else {
            let visible = self.rescan.adjust_last_scanned(outcome.highest_clean);
            self.progress.process_update(visible)?;
        }

        if !outcome.dirty.is_empty() {
            tracing::info!(
                "{} probable match(es) for {} starting at {}",
                outcome.dirty.len(),
                self.key,
                outcome.dirty[0]
            );
            let boundary = self.rescan.process_dirty(&outcome.dirty);
            self.apply_clamp(boundary)?;
            let batch = self.new_batch();
            self.process.request(&outcome.dirty, &batch);
        }

        if let Some(tip) = self.filter_tip {
            self.rescan.try_finish(self.progress.position(), &tip);
        }
        if !outcome.caught_up {
            tracing::debug!(
                "Scan of {} yielded at {:?}, more heights remain",
                self.key,
                outcome.highest_tested
            );
        }

        self.pump()
    }

    fn handle_index_complete(&mut self, elements: Vec<KeyElement>) -> Result<(), SyncError> {
        self.indexing = false;
        if elements.is_empty() {
            return Ok(());
        }

        let persisted = self.storage.last_indexed(&self.key)?;
        let fresh: Vec<KeyElement> = elements
            .iter()
            .filter(|element| persisted.is_none_or(|last| element.index() > last))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            self.storage.add_elements(&self.key, &fresh)?;
        }

        let targets = Arc::make_mut(&mut self.targets);
        for element in &elements {
            targets.add_element(element);
        }
        tracing::debug!("Indexed {} element(s) for {}", elements.len(), self.key);

        self.pump()
    }

    /// Ensures every generated key up to `LastGenerated` has its patterns in
    /// the target set. Returns `false` while indexing is outstanding, which
    /// defers scanning.
    fn check_index(&mut self) -> bool {
        let Some(generated) = self.wallet.last_generated(self.key.subchain()) else {
            return false;
        };
        if self
            .targets
            .last_indexed()
            .is_some_and(|indexed| indexed >= generated)
        {
            return true;
        }

        if !self.indexing {
            self.indexing = true;
            let start = self.targets.last_indexed().map_or(0, |indexed| indexed + 1);
            let wallet = Arc::clone(&self.wallet);
            let kind = self.key.subchain();
            let sender = self.self_sender.clone();
            let job = self.jobs.job();

            rayon::spawn_fifo(move || {
                let elements: Vec<KeyElement> = (start..=generated)
                    .filter_map(|index| wallet.balance_element(kind, index))
                    .collect();
                let _ = sender.send(SubchainMessage::IndexComplete { elements });
                drop(job);
            });
        }

        false
    }

    fn process_mempool(&mut self, transaction: &Transaction) -> Result<(), SyncError> {
        if let Some(matched) = matcher::match_transaction(&self.targets, transaction) {
            tracing::info!("Mempool transaction {} matches {}", matched.txid(), self.key);
            self.storage.add_mempool_transaction(&self.key, &matched)?;
        }

        Ok(())
    }

    /// Truncates Scan, Rescan, Process, and Progress to the common ancestor,
    /// in that order, under the chain-wide reorg lock.
    async fn handle_reorg(&mut self, ancestor: Position) -> Result<(), SyncError> {
        self.state = SubchainState::ReorgInProgress;
        self.progress.begin_reorg();
        let guard = acquire_reorg_lock(&self.reorg_lock, &self.config).await;
        tracing::info!("Processing reorg of {} to {}", self.key, ancestor);

        // a scan completing after this point describes the old branch
        self.scan_generation += 1;
        self.scan.process_reorg(&ancestor);
        self.rescan.process_reorg(&ancestor);
        self.process.reorg(&ancestor);
        self.progress.process_reorg(&ancestor)?;
        Arc::make_mut(&mut self.targets).truncate_outpoints(ancestor.height());
        if self
            .filter_tip
            .is_some_and(|tip| tip.height() > ancestor.height())
        {
            self.filter_tip = Some(ancestor);
        }

        drop(guard);
        self.progress.finish_reorg()?;
        self.state = SubchainState::Normal;

        Ok(())
    }

    fn apply_clamp(&mut self, boundary: Option<i64>) -> Result<(), SyncError> {
        let Some(height) = boundary else {
            return Ok(());
        };
        if height < 0 {
            return self.progress.clamp(None);
        }
        if self
            .progress
            .position()
            .is_some_and(|position| position.height() > height)
        {
            if let Some(hash) = self.header_oracle.best_hash(height) {
                self.progress
                    .clamp(Some(Position::from_parts(height, hash)))?;
            }
        }

        Ok(())
    }

    fn new_batch(&mut self) -> Arc<CompletionGuard> {
        self.next_batch += 1;
        let id = self.next_batch;
        let sender = self.self_sender.clone();

        CompletionGuard::new(move || {
            let _ = sender.send(SubchainMessage::BatchDone(id));
        })
    }
}

/// Acquires the chain-wide reorg lock: bounded `try_lock` attempts with
/// jittered backoff, then a blocking fallback that guarantees forward
/// progress.
async fn acquire_reorg_lock(lock: &Arc<Mutex<()>>, config: &SyncConfig) -> OwnedMutexGuard<()> {
    for _ in 0..config.reorg_lock_retries {
        if let Ok(guard) = Arc::clone(lock).try_lock_owned() {
            return guard;
        }
        let base = config.reorg_lock_backoff;
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
        tokio::time::sleep(base + Duration::from_millis(jitter)).await;
    }

    Arc::clone(lock).lock_owned().await
}
