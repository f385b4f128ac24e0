//! Queue and prioritise fetch requests to the block supplier

use tokio::sync::mpsc::UnboundedReceiver;

use crate::client::{BlockSource, FetchRequest};

/// Receives [`FetchRequest`]s via an [`tokio::sync::mpsc::UnboundedReceiver`]
/// for queueing, prioritisation and fetching from the block supplier.
/// Returns the data specified in the [`FetchRequest`] variant via the
/// provided [`tokio::sync::oneshot::Sender`].
///
/// Serving all supplier traffic from a single task keeps requests ordered per
/// chain and gives one place to prioritise tip queries over block downloads.
pub async fn fetch<B>(mut fetch_request_receiver: UnboundedReceiver<FetchRequest>, mut source: B)
where
    B: BlockSource,
{
    let mut fetch_request_queue: Vec<FetchRequest> = Vec::new();

    loop {
        // returns `true` here when all requests have been served and the
        // fetch_request channel has closed on shutdown
        if receive_fetch_requests(&mut fetch_request_receiver, &mut fetch_request_queue).await {
            return;
        }

        if let Some(request) = select_fetch_request(&mut fetch_request_queue) {
            fetch_from_source(&mut source, request).await;
        }
    }
}

// receives fetch requests and populates the fetch request queue
//
// returns `true` if the fetch request channel is closed and all fetch
// requests have been completed, signalling the task is no longer needed.
async fn receive_fetch_requests(
    receiver: &mut UnboundedReceiver<FetchRequest>,
    fetch_request_queue: &mut Vec<FetchRequest>,
) -> bool {
    // if there are no fetch requests to process, sleep until the next fetch
    // request is received or the channel is closed
    if fetch_request_queue.is_empty() {
        if let Some(fetch_request) = receiver.recv().await {
            fetch_request_queue.push(fetch_request);
        }
    }

    loop {
        match receiver.try_recv() {
            Ok(fetch_request) => fetch_request_queue.push(fetch_request),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => {
                if fetch_request_queue.is_empty() {
                    return true;
                } else {
                    break;
                }
            }
        }
    }

    false
}

// tip queries are answered before queued block downloads so chain-follow
// decisions never wait behind bulk transfers
fn select_fetch_request(fetch_request_queue: &mut Vec<FetchRequest>) -> Option<FetchRequest> {
    if let Some(index) = fetch_request_queue
        .iter()
        .position(|request| matches!(request, FetchRequest::Tip(_)))
    {
        return Some(fetch_request_queue.remove(index));
    }

    if fetch_request_queue.is_empty() {
        None
    } else {
        Some(fetch_request_queue.remove(0))
    }
}

async fn fetch_from_source<B>(source: &mut B, fetch_request: FetchRequest)
where
    B: BlockSource,
{
    match fetch_request {
        FetchRequest::Block(sender, hash) => {
            tracing::debug!("Fetching block. {}", hash);
            let response = source.block(hash).await;
            // a dropped receiver means the requester was reorged away
            let _ = sender.send(response);
        }
        FetchRequest::Tip(sender) => {
            tracing::debug!("Fetching supplier tip.");
            let tip = source.tip().await;
            let _ = sender.send(tip);
        }
    }
}
