//! Maintains the canonical compact filter chain for one filter type

use std::sync::Arc;

use bitcoin::bip158::{self, BlockFilter, FilterHeader};
use bitcoin::hashes::Hash;
use bitcoin::Block;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::client::{self, BlockResponse, FetchRequest};
use crate::error::SyncError;
use crate::interface::{HeaderOracle, SyncStorage};
use crate::primitives::{FilterType, Position};

/// Control messages for the [`FilterIndexer`] task.
#[derive(Debug)]
pub enum IndexerMessage {
    /// A new best tip exists; extend the filter chain towards it.
    NewBlock(Position),
    /// The chain reorganized; truncate to the common ancestor.
    Reorg(Position),
    /// Terminal.
    Shutdown,
}

/// Chain-wide indexer computing and persisting one compact filter chain.
///
/// Owns `FilterTip`/`FilterHeaderTip` exclusively; subchain scanners read the
/// persisted tip but never mutate it. Outlives any individual subchain.
pub struct FilterIndexer<H, S> {
    filter_type: FilterType,
    header_oracle: Arc<H>,
    storage: Arc<S>,
    fetch_request_sender: UnboundedSender<FetchRequest>,
    tip_sender: UnboundedSender<Position>,
    current_position: Option<Position>,
    best_position: Option<Position>,
}

impl<H, S> FilterIndexer<H, S>
where
    H: HeaderOracle,
    S: SyncStorage,
{
    /// Loads the indexer, recovering the authoritative starting point from
    /// whatever the store holds. A crash may have left a filter without its
    /// header or vice versa; recovery walks backward to the last internally
    /// consistent pair.
    pub fn load(
        filter_type: FilterType,
        header_oracle: Arc<H>,
        storage: Arc<S>,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        tip_sender: UnboundedSender<Position>,
    ) -> Result<Self, SyncError> {
        let mut indexer = Self {
            filter_type,
            header_oracle,
            storage,
            fetch_request_sender,
            tip_sender,
            current_position: None,
            best_position: None,
        };

        if let Some(tip) = indexer.storage.filter_tip(filter_type)? {
            indexer.current_position = indexer.find_best_position(&tip)?;
        }

        Ok(indexer)
    }

    /// Message loop. Runs until the channel closes or a shutdown message
    /// arrives; any returned error is a fatal invariant violation.
    pub async fn run(mut self, mut receiver: UnboundedReceiver<IndexerMessage>) -> Result<(), SyncError> {
        while let Some(message) = receiver.recv().await {
            match message {
                IndexerMessage::NewBlock(best) => {
                    self.best_position = Some(best);
                    while self.calculate_next_block().await? {}
                }
                IndexerMessage::Reorg(ancestor) => self.process_reorg(&ancestor)?,
                IndexerMessage::Shutdown => break,
            }
        }

        tracing::info!("{} filter indexer shut down", self.filter_type);

        Ok(())
    }

    pub(crate) fn current_position(&self) -> Option<Position> {
        self.current_position
    }

    /// Extends the filter chain by one block.
    ///
    /// Returns `true` while more work remains. Missing data is retryable and
    /// resolves to `false` (wait for the next trigger); a rejected storage
    /// write is a fatal invariant violation and propagates.
    pub(crate) async fn calculate_next_block(&mut self) -> Result<bool, SyncError> {
        let Some(best) = self.best_position else {
            return Ok(false);
        };
        let next_height = self.current_position.map_or(0, |current| current.height() + 1);
        if next_height > best.height() {
            return Ok(false);
        }

        let Some(hash) = self.header_oracle.best_hash(next_height) else {
            // chain moved under us; wait for the next trigger
            return Ok(false);
        };

        let block = match client::get_block(&self.fetch_request_sender, hash).await? {
            BlockResponse::Block(block) => block,
            BlockResponse::ShuttingDown => return Ok(false),
        };
        if block.block_hash() != hash {
            tracing::warn!(
                "Block supplier returned {} where {} was expected",
                block.block_hash(),
                hash
            );
            return Ok(false);
        }

        // a parent mismatch is an implicit reorg signal, not a failure
        if let Some(current) = self.current_position {
            if block.header.prev_blockhash != current.hash() {
                let ancestor = self.header_oracle.common_parent(&current);
                tracing::info!(
                    "Reorg detected extending {} filters at {}, rewinding to {}",
                    self.filter_type,
                    current,
                    ancestor
                );
                self.process_reorg(&ancestor)?;
                return Ok(true);
            }
        }

        let filter = match self.compute_filter(block).await {
            Ok(filter) => filter,
            Err(bip158::Error::UtxoMissing(outpoint)) => {
                tracing::debug!(
                    "Missing previous output {} for {} filter at height {}, retrying later",
                    outpoint,
                    self.filter_type,
                    next_height
                );
                return Ok(false);
            }
            Err(reason) => {
                tracing::warn!(
                    "Failed to compute {} filter at height {}: {}",
                    self.filter_type,
                    next_height,
                    reason
                );
                return Ok(false);
            }
        };

        let previous_header = match self.current_position {
            Some(current) => match self
                .storage
                .load_filter_header(self.filter_type, &current.hash())?
            {
                Some(header) => header,
                None => {
                    // the pair we advanced from has vanished; re-derive a
                    // consistent starting point before continuing
                    match self.find_best_position(&current)? {
                        Some(recovered) => {
                            self.current_position = Some(recovered);
                            return Ok(true);
                        }
                        None => {
                            return Err(SyncError::Corruption {
                                filter_type: self.filter_type,
                                position: current,
                            })
                        }
                    }
                }
            },
            None => FilterHeader::all_zeros(),
        };
        let header = filter.filter_header(&previous_header);

        let position = Position::from_parts(next_height, hash);
        self.storage.store_filters(
            self.filter_type,
            &position,
            &[(hash, header)],
            &[(hash, filter.content)],
        )?;
        self.current_position = Some(position);
        let _ = self.tip_sender.send(position);
        tracing::debug!("Indexed {} filter at {}", self.filter_type, position);

        Ok(position.height() < best.height())
    }

    /// Recovery routine: walks backward from a candidate until both the
    /// filter and filter header exist for a height *and* its immediate
    /// predecessor (or height zero is reached). Returns `None` when nothing
    /// internally consistent survives, meaning indexing restarts from
    /// scratch.
    pub(crate) fn find_best_position(
        &self,
        candidate: &Position,
    ) -> Result<Option<Position>, SyncError> {
        let tip = self.header_oracle.best_tip();
        let mut height = candidate.height().min(tip.height());

        while height >= 0 {
            let Some(hash) = self.header_oracle.best_hash(height) else {
                height -= 1;
                continue;
            };

            let consistent = self.pair_exists(&hash)?
                && match height {
                    0 => true,
                    _ => match self.header_oracle.best_hash(height - 1) {
                        Some(parent) => self.pair_exists(&parent)?,
                        None => false,
                    },
                };
            if consistent {
                return Ok(Some(Position::from_parts(height, hash)));
            }

            height -= 1;
        }

        Ok(None)
    }

    /// Truncates both tips to the common ancestor and re-derives a
    /// consistent current position.
    pub(crate) fn process_reorg(&mut self, common_parent: &Position) -> Result<(), SyncError> {
        if self
            .current_position
            .is_some_and(|current| current.height() > common_parent.height())
        {
            self.current_position = Some(*common_parent);
        }
        if self
            .best_position
            .is_some_and(|best| best.height() > common_parent.height())
        {
            self.best_position = Some(*common_parent);
        }

        if let Some(current) = self.current_position {
            self.current_position = self.find_best_position(&current)?;
        }

        Ok(())
    }

    fn pair_exists(&self, hash: &bitcoin::BlockHash) -> Result<bool, SyncError> {
        Ok(self.storage.load_filter(self.filter_type, hash)?.is_some()
            && self
                .storage
                .load_filter_header(self.filter_type, hash)?
                .is_some())
    }

    /// Builds the GCS filter on the CPU pool; the result comes back as a
    /// message so the indexer never blocks a runtime thread.
    async fn compute_filter(&self, block: Box<Block>) -> Result<BlockFilter, bip158::Error> {
        let (sender, receiver) = oneshot::channel();
        let storage = Arc::clone(&self.storage);
        rayon::spawn_fifo(move || {
            let result = build_filter(&block, storage.as_ref());
            let _ = sender.send(result);
        });

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(bip158::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "filter computation abandoned",
            ).into())),
        }
    }
}

fn build_filter<S>(block: &Block, storage: &S) -> Result<BlockFilter, bip158::Error>
where
    S: SyncStorage,
{
    BlockFilter::new_script_filter(block, |outpoint| {
        match storage.load_output_script(outpoint) {
            Ok(Some(script)) => Ok(script),
            Ok(None) => Err(bip158::Error::UtxoMissing(*outpoint)),
            Err(error) => Err(bip158::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                error.to_string(),
            ).into())),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fetch::fetch;
    use crate::testutils::{MemoryStorage, MockOracle, ScriptedSource, TestChain};
    use tokio::sync::mpsc;

    fn harness(
        chain: &TestChain,
        source_blocks: Vec<bitcoin::Block>,
    ) -> (
        FilterIndexer<MockOracle, MemoryStorage>,
        mpsc::UnboundedReceiver<Position>,
        tokio::task::JoinHandle<()>,
    ) {
        let oracle = Arc::new(MockOracle::from_chain(chain));
        let storage = Arc::new(MemoryStorage::default());
        let (fetch_sender, fetch_receiver) = mpsc::unbounded_channel();
        let fetch_handle = tokio::spawn(fetch(fetch_receiver, ScriptedSource::new(source_blocks)));
        let (tip_sender, tip_receiver) = mpsc::unbounded_channel();
        let indexer = FilterIndexer::load(
            FilterType::Basic,
            oracle,
            storage,
            fetch_sender,
            tip_sender,
        )
        .unwrap();

        (indexer, tip_receiver, fetch_handle)
    }

    #[tokio::test]
    async fn extends_the_filter_chain_to_the_best_tip() {
        let chain = TestChain::build(6);
        let (mut indexer, mut tips, _fetch) = harness(&chain, chain.blocks.clone());
        indexer.best_position = Some(chain.position(5));

        while indexer.calculate_next_block().await.unwrap() {}

        assert_eq!(indexer.current_position(), Some(chain.position(5)));
        assert_eq!(tips.recv().await.unwrap(), chain.position(0));

        // headers chain: header(n) commits to header(n - 1)
        let storage = Arc::clone(&indexer.storage);
        let filter_one = storage
            .load_filter(FilterType::Basic, &chain.hash(1))
            .unwrap()
            .unwrap();
        let header_zero = storage
            .load_filter_header(FilterType::Basic, &chain.hash(0))
            .unwrap()
            .unwrap();
        let header_one = storage
            .load_filter_header(FilterType::Basic, &chain.hash(1))
            .unwrap()
            .unwrap();
        assert_eq!(
            BlockFilter::new(&filter_one).filter_header(&header_zero),
            header_one
        );
        assert_eq!(
            storage.filter_tip(FilterType::Basic).unwrap(),
            Some(chain.position(5))
        );
    }

    #[tokio::test]
    async fn recovery_walks_back_to_the_last_consistent_pair() {
        let chain = TestChain::build(21);
        let (mut indexer, _tips, _fetch) = harness(&chain, chain.blocks.clone());
        indexer.best_position = Some(chain.position(18));
        while indexer.calculate_next_block().await.unwrap() {}

        // height 20 gains a header but no filter, height 19 keeps both
        let storage = Arc::clone(&indexer.storage);
        storage.insert_header_only(FilterType::Basic, chain.hash(20), FilterHeader::all_zeros());

        let found = indexer
            .find_best_position(&chain.position(20))
            .unwrap()
            .unwrap();
        assert_eq!(found, chain.position(18));

        storage.insert_pair(FilterType::Basic, chain.hash(19), FilterHeader::all_zeros());
        let found = indexer
            .find_best_position(&chain.position(20))
            .unwrap()
            .unwrap();
        assert_eq!(found, chain.position(19));
    }

    #[tokio::test]
    async fn parent_mismatch_triggers_a_reorg() {
        let chain = TestChain::build(6);
        let fork = chain.fork_at(3, 3);
        let mut source_blocks = chain.blocks.clone();
        source_blocks.extend(fork.blocks.iter().skip(4).cloned());
        let (mut indexer, _tips, _fetch) = harness(&chain, source_blocks);
        indexer.best_position = Some(chain.position(5));
        while indexer.calculate_next_block().await.unwrap() {}

        // the best chain swaps everything above height 3
        let oracle = Arc::clone(&indexer.header_oracle);
        oracle.adopt(&fork, 3);

        indexer.best_position = Some(fork.position(6));
        assert!(indexer.calculate_next_block().await.unwrap());
        assert_eq!(indexer.current_position(), Some(chain.position(3)));
    }

    #[tokio::test]
    async fn empty_store_recovers_to_nothing() {
        let chain = TestChain::build(3);
        let (indexer, _tips, _fetch) = harness(&chain, Vec::new());

        assert_eq!(
            indexer.find_best_position(&chain.position(2)).unwrap(),
            None
        );
    }
}
