//! Primitive structs shared across the sync engine

use std::cmp::Ordering;
use std::fmt;

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use getset::{CopyGetters, Getters};

/// A block position on the chain being tracked.
///
/// Positions are totally ordered by height only while both lie on the same
/// branch; comparing positions across a reorg boundary is meaningless, so
/// [`PartialOrd`] returns `None` for equal heights with differing hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Position {
    /// Block height.
    height: i64,
    /// Hash of the block occupying that height.
    hash: BlockHash,
}

impl Position {
    /// Creates a new position from parts.
    pub fn from_parts(height: i64, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.height.cmp(&other.height) {
            Ordering::Equal if self.hash == other.hash => Some(Ordering::Equal),
            // Same height on different branches is not comparable.
            Ordering::Equal => None,
            ordering => Some(ordering),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.height, self.hash)
    }
}

/// One logical scan target within a wallet subaccount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubchainKind {
    /// External (receiving) key sequence.
    External,
    /// Internal (change) key sequence.
    Internal,
    /// Incoming payment-code derived sequence.
    Incoming,
    /// Outgoing payment-code derived sequence.
    Outgoing,
    /// Notification sequence.
    Notification,
}

impl fmt::Display for SubchainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::External => "external",
            Self::Internal => "internal",
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Notification => "notification",
        };
        write!(f, "{name}")
    }
}

/// The compact filter flavor a subchain scans with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// BIP-158 basic filter.
    Basic,
    /// Extended filter.
    Extended,
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Extended => write!(f, "extended"),
        }
    }
}

/// Primary key for all persisted scan progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters, CopyGetters)]
pub struct SubchainKey {
    /// Owner nym.
    #[getset(get = "pub")]
    owner: String,
    /// Wallet subaccount id.
    #[getset(get = "pub")]
    subaccount: String,
    /// Which key sequence of the subaccount.
    #[getset(get_copy = "pub")]
    subchain: SubchainKind,
    /// Which filter chain the subchain scans against.
    #[getset(get_copy = "pub")]
    filter_type: FilterType,
}

impl SubchainKey {
    /// Creates a new subchain key from parts.
    pub fn from_parts(
        owner: String,
        subaccount: String,
        subchain: SubchainKind,
        filter_type: FilterType,
    ) -> Self {
        Self {
            owner,
            subaccount,
            subchain,
            filter_type,
        }
    }
}

impl fmt::Display for SubchainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.owner, self.subaccount, self.subchain, self.filter_type
        )
    }
}

/// Published on every committed advance of the scan cursor.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct ScanProgress {
    /// The subchain that advanced.
    #[getset(get = "pub")]
    key: SubchainKey,
    /// The new authoritative last-scanned position.
    #[getset(get_copy = "pub")]
    position: Position,
}

impl ScanProgress {
    pub(crate) fn from_parts(key: SubchainKey, position: Position) -> Self {
        Self { key, position }
    }
}

/// A transaction output confirmed to pay a wallet key element.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct ConfirmedOutput {
    /// Output index within its transaction.
    #[getset(get_copy = "pub")]
    vout: u32,
    /// Output value.
    #[getset(get_copy = "pub")]
    value: Amount,
    /// The script the output pays to.
    #[getset(get = "pub")]
    script_pubkey: ScriptBuf,
    /// Index of the matched key element within the subchain.
    #[getset(get_copy = "pub")]
    element_index: u32,
}

impl ConfirmedOutput {
    /// Creates a new confirmed output from parts.
    pub fn from_parts(vout: u32, value: Amount, script_pubkey: ScriptBuf, element_index: u32) -> Self {
        Self {
            vout,
            value,
            script_pubkey,
            element_index,
        }
    }
}

/// A transaction exactly matched against the wallet target set.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct ConfirmedTransaction {
    /// Id of the matched transaction.
    #[getset(get_copy = "pub")]
    txid: Txid,
    /// Outputs paying wallet key elements.
    #[getset(get = "pub")]
    outputs: Vec<ConfirmedOutput>,
    /// Tracked outpoints this transaction spends.
    #[getset(get = "pub")]
    spends: Vec<OutPoint>,
}

impl ConfirmedTransaction {
    /// Creates a new confirmed transaction from parts.
    pub fn from_parts(txid: Txid, outputs: Vec<ConfirmedOutput>, spends: Vec<OutPoint>) -> Self {
        Self {
            txid,
            outputs,
            spends,
        }
    }
}
