//! Probabilistic and exact matching of chain data against wallet targets

use bitcoin::bip158::BlockFilter;
use bitcoin::{Block, BlockHash, Transaction};

use crate::error::ScanError;
use crate::keys::TargetSet;
use crate::primitives::{ConfirmedOutput, ConfirmedTransaction, Position};

/// First-phase test: does the block's compact filter possibly contain any of
/// the given byte patterns?
pub(crate) fn filter_matches(
    encoded_filter: &[u8],
    position: &Position,
    patterns: &[Vec<u8>],
) -> Result<bool, ScanError> {
    if patterns.is_empty() {
        return Ok(false);
    }

    let filter = BlockFilter::new(encoded_filter);
    let hash: BlockHash = position.hash();
    filter
        .match_any(&hash, &mut patterns.iter().map(|pattern| pattern.as_slice()))
        .map_err(|reason| ScanError::Filter {
            position: *position,
            reason: reason.to_string(),
        })
}

/// Second-phase test: exact script inspection of a full block.
///
/// Matches every transaction output against the element script forms and
/// every input against the tracked outpoint set. The result is definitive;
/// an empty vec proves the probabilistic match was a false positive.
pub(crate) fn match_block(targets: &TargetSet, block: &Block) -> Vec<ConfirmedTransaction> {
    block
        .txdata
        .iter()
        .filter_map(|transaction| match_transaction(targets, transaction))
        .collect()
}

/// Exact match of a single transaction, confirmed or mempool.
pub(crate) fn match_transaction(
    targets: &TargetSet,
    transaction: &Transaction,
) -> Option<ConfirmedTransaction> {
    let outputs: Vec<ConfirmedOutput> = transaction
        .output
        .iter()
        .enumerate()
        .filter_map(|(vout, txout)| {
            targets
                .element_for_script(&txout.script_pubkey)
                .map(|element_index| {
                    ConfirmedOutput::from_parts(
                        vout as u32,
                        txout.value,
                        txout.script_pubkey.clone(),
                        element_index,
                    )
                })
        })
        .collect();

    let spends: Vec<_> = transaction
        .input
        .iter()
        .map(|input| input.previous_output)
        .filter(|outpoint| targets.is_tracked(outpoint))
        .collect();

    if outputs.is_empty() && spends.is_empty() {
        return None;
    }

    Some(ConfirmedTransaction::from_parts(
        transaction.compute_txid(),
        outputs,
        spends,
    ))
}
