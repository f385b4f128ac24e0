#![warn(missing_docs)]
//! Wallet-side chain-following engine
//!
//! For each tracked subchain the engine converges wallet state to the
//! canonical chain tip: compact filters are matched probabilistically
//! ([`crate::scan`]), probable matches are downloaded and confirmed exactly
//! ([`crate::process`]), progress is checkpointed crash-safely
//! ([`crate::progress`]), and every stage rewinds consistently when the chain
//! reorganizes.
//!
//! Entrypoints: [`crate::subchain::SubchainStateData`] per wallet subchain and
//! [`crate::filter_index::FilterIndexer`] per chain-wide filter type, both
//! driven over message channels; [`crate::client::fetch::fetch`] connects
//! them to the block supplier.

pub mod block_index;
pub mod client;
pub mod config;
pub mod error;
pub mod filter_index;
pub mod interface;
pub(crate) mod job;
pub mod keys;
pub(crate) mod matcher;
pub mod primitives;
pub(crate) mod process;
pub(crate) mod progress;
pub(crate) mod rescan;
pub(crate) mod scan;
pub mod subchain;
#[cfg(test)]
pub(crate) mod testutils;
