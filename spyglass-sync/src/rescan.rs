//! Lagging cursor guaranteeing no dirty block is skipped

use std::collections::BTreeMap;

use bitcoin::BlockHash;

use crate::primitives::Position;

/// Guards the externally visible scan cursor against unconfirmed dirty
/// blocks and drives re-processing of blocks that were already scanned but
/// are later found dirty.
///
/// While a rescan is active the visible cursor is controlled exclusively by
/// the rescan work loop; the normal scan's clean reports are suppressed by
/// [`Rescan::adjust_last_scanned`].
#[derive(Debug)]
pub(crate) struct Rescan {
    /// Unresolved dirty positions, ordered by height.
    dirty: BTreeMap<i64, BlockHash>,
    /// Positions Process has definitively handled since the rescan started.
    /// A probabilistic re-match of these is classified clean so the cursor
    /// can sweep over confirmed blocks.
    resolved: BTreeMap<i64, BlockHash>,
    /// Maximum of the dirty set ever observed since the last full catch-up.
    highest_dirty: Option<Position>,
    scan_dirty: bool,
    quiet_window: i64,
}

impl Rescan {
    pub(crate) fn new(quiet_window: i64) -> Self {
        Self {
            dirty: BTreeMap::new(),
            resolved: BTreeMap::new(),
            highest_dirty: None,
            scan_dirty: false,
            quiet_window,
        }
    }

    /// Whether the rescan work loop currently controls the visible cursor.
    pub(crate) fn is_active(&self) -> bool {
        self.scan_dirty
    }

    /// Gate for the normal scan's clean reports: passes them through only
    /// while no rescan is active.
    pub(crate) fn adjust_last_scanned(&self, highest_clean: Option<Position>) -> Option<Position> {
        if self.scan_dirty {
            None
        } else {
            highest_clean
        }
    }

    /// Registers newly discovered dirty positions.
    ///
    /// Returns the height the visible cursor must retreat to (one below the
    /// lowest unresolved block) so nothing downstream is treated as final
    /// past that point.
    pub(crate) fn process_dirty(&mut self, dirty: &[Position]) -> Option<i64> {
        for position in dirty {
            self.dirty.insert(position.height(), position.hash());
            self.resolved.remove(&position.height());
            if self
                .highest_dirty
                .is_none_or(|highest| position.height() > highest.height())
            {
                self.highest_dirty = Some(*position);
            }
        }
        if !dirty.is_empty() {
            self.scan_dirty = true;
        }

        self.dirty.keys().next().map(|lowest| lowest - 1)
    }

    /// Records a definitive clean/confirmed outcome from Process. Entries
    /// leave the dirty set only through here or a reorg.
    pub(crate) fn resolve(&mut self, position: &Position) {
        if self.dirty.get(&position.height()) == Some(&position.hash()) {
            self.dirty.remove(&position.height());
        }
        self.resolved.insert(position.height(), position.hash());
    }

    /// Dirty positions that still require re-processing, re-emitted on every
    /// work cycle in case their work was lost to a reset.
    pub(crate) fn unresolved(&self) -> Vec<Position> {
        self.dirty
            .iter()
            .map(|(height, hash)| Position::from_parts(*height, *hash))
            .collect()
    }

    pub(crate) fn resolved_snapshot(&self) -> BTreeMap<i64, BlockHash> {
        self.resolved.clone()
    }

    /// Height the rescan cycle may scan up to: one below the lowest
    /// unresolved dirty block, or the filter tip if none remain.
    pub(crate) fn stop_height(&self, filter_tip: &Position) -> i64 {
        self.dirty
            .keys()
            .next()
            .map_or(filter_tip.height(), |lowest| lowest - 1)
    }

    /// Checks the termination conditions after a work cycle.
    ///
    /// The rescan finishes when the cursor reaches the filter tip with no
    /// outstanding dirty blocks, or once it has progressed the quiet window
    /// past the highest dirty position with the dirty set empty. The second
    /// bound keeps one stuck block from stalling progress reporting forever.
    pub(crate) fn try_finish(&mut self, cursor: Option<Position>, filter_tip: &Position) -> bool {
        if !self.scan_dirty || !self.dirty.is_empty() {
            return false;
        }
        let Some(cursor) = cursor else {
            return false;
        };

        let at_tip = cursor.height() >= filter_tip.height();
        let quiet = self
            .highest_dirty
            .is_some_and(|highest| cursor.height() >= highest.height() + self.quiet_window);
        if at_tip || quiet {
            self.scan_dirty = false;
            self.highest_dirty = None;
            self.resolved.clear();
            tracing::debug!("Rescan finished at {}", cursor);
            return true;
        }

        false
    }

    /// Discards all state above the common ancestor. Must run under the
    /// shared reorg lock before any component observes the new tip.
    pub(crate) fn process_reorg(&mut self, common_parent: &Position) {
        self.dirty.retain(|height, _| *height <= common_parent.height());
        self.resolved
            .retain(|height, _| *height <= common_parent.height());
        if self
            .highest_dirty
            .is_some_and(|highest| highest.height() > common_parent.height())
        {
            self.highest_dirty = Some(*common_parent);
        }
    }
}
