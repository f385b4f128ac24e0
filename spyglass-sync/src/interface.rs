//! Traits for interfacing the sync engine with its external collaborators

use bitcoin::bip158::FilterHeader;
use bitcoin::{BlockHash, OutPoint, ScriptBuf};

use crate::error::StorageError;
use crate::keys::KeyElement;
use crate::primitives::{ConfirmedTransaction, FilterType, Position, SubchainKey};

/// Read-only view of the canonical header chain.
///
/// Implementations answer relative to the best chain *at call time*; callers
/// treat a `None` answer as "the chain moved under us" and retry later.
pub trait HeaderOracle: Send + Sync + 'static {
    /// Hash of the block at `height` on the best chain, if one exists.
    fn best_hash(&self, height: i64) -> Option<BlockHash>;

    /// The current best chain tip.
    fn best_tip(&self) -> Position;

    /// The highest ancestor of `position` that lies on the best chain.
    fn common_parent(&self, position: &Position) -> Position;

    /// Whether `position` lies on the best chain.
    fn is_in_best_chain(&self, position: &Position) -> bool;
}

/// Transactional key-value persistence for filters and scan progress.
///
/// Writes within one [`SubchainKey`] are always issued from a single
/// component at a time, so implementations only need per-call atomicity:
/// a failed write must leave the prior value intact.
pub trait SyncStorage: Send + Sync + 'static {
    /// Loads the raw encoded compact filter for a block, if present.
    fn load_filter(
        &self,
        filter_type: FilterType,
        hash: &BlockHash,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    /// Loads the filter header for a block, if present.
    fn load_filter_header(
        &self,
        filter_type: FilterType,
        hash: &BlockHash,
    ) -> Result<Option<FilterHeader>, StorageError>;

    /// Atomically persists filters, headers, and the new filter tip.
    fn store_filters(
        &self,
        filter_type: FilterType,
        tip: &Position,
        headers: &[(BlockHash, FilterHeader)],
        filters: &[(BlockHash, Vec<u8>)],
    ) -> Result<(), StorageError>;

    /// The highest position for which a filter and header are persisted.
    fn filter_tip(&self, filter_type: FilterType) -> Result<Option<Position>, StorageError>;

    /// Script paid by a previously confirmed output, used when computing
    /// filters for blocks that spend it.
    fn load_output_script(&self, outpoint: &OutPoint) -> Result<Option<ScriptBuf>, StorageError>;

    /// The persisted authoritative scan cursor for a subchain.
    fn last_scanned(&self, key: &SubchainKey) -> Result<Option<Position>, StorageError>;

    /// Overwrites the persisted scan cursor for a subchain. `None` is the
    /// explicit "no progress yet" value.
    fn set_last_scanned(
        &self,
        key: &SubchainKey,
        position: Option<&Position>,
    ) -> Result<(), StorageError>;

    /// Persists exactly matched transactions for a block. Called at least
    /// once per confirmed block; implementations must deduplicate by txid.
    fn add_confirmed_transactions(
        &self,
        key: &SubchainKey,
        position: &Position,
        transactions: &[ConfirmedTransaction],
    ) -> Result<(), StorageError>;

    /// Persists a matched but unconfirmed mempool transaction.
    fn add_mempool_transaction(
        &self,
        key: &SubchainKey,
        transaction: &ConfirmedTransaction,
    ) -> Result<(), StorageError>;

    /// Highest key element index whose patterns have been indexed.
    fn last_indexed(&self, key: &SubchainKey) -> Result<Option<u32>, StorageError>;

    /// Persists newly indexed key elements and advances the indexed
    /// watermark.
    fn add_elements(&self, key: &SubchainKey, elements: &[KeyElement]) -> Result<(), StorageError>;
}

/// Key material provider for one wallet subaccount.
pub trait WalletSubaccount: Send + Sync + 'static {
    /// Index of the newest generated key in a subchain, if any exist.
    fn last_generated(&self, subchain: crate::primitives::SubchainKind) -> Option<u32>;

    /// Key material for one generated element.
    fn balance_element(
        &self,
        subchain: crate::primitives::SubchainKind,
        index: u32,
    ) -> Option<KeyElement>;
}
