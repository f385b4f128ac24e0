//! Top level error module for the crate

use crate::primitives::{FilterType, Position};

/// Top level error enum encapsulating any error that may occur during sync.
///
/// Transient conditions (missing filters, blocks not yet available, the
/// supplier shutting down) are never surfaced through this type; components
/// resolve those locally by rescheduling themselves. Every variant here is
/// either fatal or a shutdown signal.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A storage write or read was rejected. Continuing would corrupt the
    /// scan cursor, so this aborts the affected subchain.
    #[error("Storage error. {0}")]
    Storage(#[from] StorageError),

    /// Errors associated with scanning.
    #[error("Scan error. {0}")]
    Scan(#[from] ScanError),

    /// The filter store is inconsistent and walking backward did not reach an
    /// internally consistent pair by height zero.
    #[error("Unrecoverable {filter_type} filter corruption below {position}")]
    Corruption {
        /// Filter chain that failed recovery.
        filter_type: FilterType,
        /// Candidate position recovery started from.
        position: Position,
    },

    /// A required channel peer has gone away outside of an orderly shutdown.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Errors associated with scanning.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Decoding or querying a compact filter failed.
    #[error("Filter match failed at {position}. {reason}")]
    Filter {
        /// Position whose filter failed.
        position: Position,
        /// Underlying bip158 failure.
        reason: String,
    },
}

/// Error reported by a [`crate::interface::SyncStorage`] implementation.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StorageError(pub String);
