//! Probabilistic matching frontier for one subchain

use std::collections::BTreeMap;

use bitcoin::BlockHash;

use crate::error::SyncError;
use crate::interface::{HeaderOracle, SyncStorage};
use crate::keys::TargetSet;
use crate::matcher;
use crate::primitives::{FilterType, Position};

/// Why a scan invocation stopped before reaching its stop height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanInterrupt {
    /// The header oracle no longer knows a hash for the next height; the
    /// chain moved under us.
    Reorged,
    /// No filter is stored yet for this height; the indexer is behind.
    FilterMissing(i64),
}

/// Result of one bounded scan invocation.
#[derive(Debug)]
pub(crate) struct ScanOutcome {
    pub(crate) start_height: i64,
    pub(crate) highest_tested: Option<Position>,
    /// Highest contiguous clean position; never advanced past a dirty block.
    pub(crate) highest_clean: Option<Position>,
    pub(crate) dirty: Vec<Position>,
    pub(crate) interrupt: Option<ScanInterrupt>,
    /// Whether the stop height was reached.
    pub(crate) caught_up: bool,
    /// Whether this invocation was driven by the rescan cursor.
    pub(crate) was_rescan: bool,
}

/// Walks filters height by height, classifying blocks clean or dirty.
///
/// Two-phase: a first probabilistic pass against the flattened target
/// patterns, then a second pass against the UTXO-refined set. A block is
/// dirty only if both pass and Process has not already resolved it.
///
/// Interruptions are not errors; the partial outcome is returned and the
/// caller retries from where it left off on a later tick.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_interval<H, S>(
    header_oracle: &H,
    storage: &S,
    filter_type: FilterType,
    targets: &TargetSet,
    resolved: &BTreeMap<i64, BlockHash>,
    start_height: i64,
    stop_height: i64,
    batch: i64,
    was_rescan: bool,
) -> Result<ScanOutcome, SyncError>
where
    H: HeaderOracle,
    S: SyncStorage,
{
    let mut outcome = ScanOutcome {
        start_height,
        highest_tested: None,
        highest_clean: None,
        dirty: Vec::new(),
        interrupt: None,
        caught_up: start_height > stop_height,
        was_rescan,
    };
    if start_height > stop_height {
        return Ok(outcome);
    }

    let first_pass = targets.patterns();
    let second_pass = targets.refined_patterns();
    let bounded_stop = stop_height.min(start_height + batch - 1);

    for height in start_height..=bounded_stop {
        let Some(hash) = header_oracle.best_hash(height) else {
            outcome.interrupt = Some(ScanInterrupt::Reorged);
            return Ok(outcome);
        };
        let position = Position::from_parts(height, hash);

        let Some(encoded_filter) = storage.load_filter(filter_type, &hash)? else {
            outcome.interrupt = Some(ScanInterrupt::FilterMissing(height));
            return Ok(outcome);
        };

        let already_resolved = resolved.get(&height) == Some(&hash);
        let dirty = !already_resolved
            && matcher::filter_matches(&encoded_filter, &position, &first_pass)?
            && matcher::filter_matches(&encoded_filter, &position, &second_pass)?;

        if dirty {
            outcome.dirty.push(position);
        } else if outcome.dirty.is_empty() {
            outcome.highest_clean = Some(position);
        }
        outcome.highest_tested = Some(position);
    }

    outcome.caught_up = bounded_stop >= stop_height;

    Ok(outcome)
}

/// Per-subchain scan state: the tested frontier and the in-flight gate.
#[derive(Debug)]
pub(crate) struct Scan {
    frontier: Option<Position>,
    in_flight: bool,
}

impl Scan {
    /// Resumes from the persisted cursor.
    pub(crate) fn load(last_scanned: Option<Position>) -> Self {
        Self {
            frontier: last_scanned,
            in_flight: false,
        }
    }

    pub(crate) fn frontier(&self) -> Option<Position> {
        self.frontier
    }

    /// Whether an invocation is already running; re-triggering is a no-op
    /// while this holds.
    pub(crate) fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn begin(&mut self) {
        self.in_flight = true;
    }

    /// Absorbs a finished invocation and advances the tested frontier.
    pub(crate) fn complete(&mut self, outcome: &ScanOutcome) {
        self.in_flight = false;
        if let Some(tested) = outcome.highest_tested {
            if self
                .frontier
                .is_none_or(|frontier| tested.height() > frontier.height())
            {
                self.frontier = Some(tested);
            }
        }
    }

    pub(crate) fn caught_up(&self, filter_tip: &Position) -> bool {
        self.frontier
            .is_some_and(|frontier| frontier.height() >= filter_tip.height())
    }

    pub(crate) fn process_reorg(&mut self, common_parent: &Position) {
        self.in_flight = false;
        if self
            .frontier
            .is_some_and(|frontier| frontier.height() > common_parent.height())
        {
            self.frontier = Some(*common_parent);
        }
    }
}
