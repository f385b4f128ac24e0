//! Module for handling all requests to the block supplier

use std::future::Future;

use bitcoin::{Block, BlockHash};
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::error::SyncError;
use crate::primitives::Position;

pub mod fetch;

/// Outcome of requesting a block from the supplier.
///
/// A supplier that is stopping resolves requests with [`Self::ShuttingDown`];
/// that is "work not completed", never an error, and must not be retried.
#[derive(Debug)]
pub enum BlockResponse {
    /// The requested block.
    Block(Box<Block>),
    /// The supplier is shutting down and will not serve the request.
    ShuttingDown,
}

/// The external block supplier.
///
/// Requests are deduplicated against the chain-wide
/// [`crate::block_index::BlockIndex`] before they reach the supplier, but
/// distinct subchains may still ask for the same hash; implementations are
/// expected to serve repeated loads of one hash from cache.
pub trait BlockSource: Send + 'static {
    /// Loads a full block by hash.
    fn block(&mut self, hash: BlockHash) -> impl Future<Output = BlockResponse> + Send;

    /// The supplier's current chain tip.
    fn tip(&mut self) -> impl Future<Output = Position> + Send;
}

/// Fetch requests are sent to the [`crate::client::fetch::fetch`] task when
/// data is required from the block supplier.
///
/// Each variant includes a [`tokio::sync::oneshot::Sender`] for returning the
/// fetched data to the requester.
#[derive(Debug)]
pub enum FetchRequest {
    /// Gets a full block by hash.
    Block(oneshot::Sender<BlockResponse>, BlockHash),
    /// Gets the supplier's chain tip.
    Tip(oneshot::Sender<Position>),
}

/// Gets a full block by hash from the supplier.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub async fn get_block(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    hash: BlockHash,
) -> Result<BlockResponse, SyncError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Block(sender, hash))
        .map_err(|_| SyncError::ChannelClosed("fetch request"))?;

    receiver
        .await
        .map_err(|_| SyncError::ChannelClosed("fetch response"))
}

/// Gets the supplier's chain tip.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub async fn get_tip(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
) -> Result<Position, SyncError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Tip(sender))
        .map_err(|_| SyncError::ChannelClosed("fetch request"))?;

    receiver
        .await
        .map_err(|_| SyncError::ChannelClosed("fetch response"))
}
