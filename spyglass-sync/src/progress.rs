//! Single authoritative sink for what has been scanned

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::SyncError;
use crate::interface::SyncStorage;
use crate::primitives::{Position, ScanProgress, SubchainKey};

#[derive(Debug)]
enum State {
    Normal,
    /// Updates arriving while a reorg is in flight are deferred and flushed
    /// in order once the reorg completes; none is ever applied out of order
    /// relative to the reorg boundary.
    ReorgInProgress(VecDeque<Position>),
}

/// Persists the authoritative last-scanned position and publishes every
/// committed advance to external observers.
#[derive(Debug)]
pub(crate) struct Progress<S> {
    key: SubchainKey,
    storage: Arc<S>,
    position: Option<Position>,
    state: State,
    notification_sender: UnboundedSender<ScanProgress>,
}

impl<S> Progress<S>
where
    S: SyncStorage,
{
    /// Resumes from the persisted cursor.
    pub(crate) fn load(
        key: SubchainKey,
        storage: Arc<S>,
        notification_sender: UnboundedSender<ScanProgress>,
    ) -> Result<Self, SyncError> {
        let position = storage.last_scanned(&key)?;

        Ok(Self {
            key,
            storage,
            position,
            state: State::Normal,
            notification_sender,
        })
    }

    /// The externally visible cursor. Monotonically non-decreasing except
    /// across an explicit reorg or dirty-retreat clamp.
    pub(crate) fn position(&self) -> Option<Position> {
        self.position
    }

    /// Accepts a clean report. Only overwrites the persisted cursor when the
    /// report strictly exceeds the stored one; a persistence failure is a
    /// fatal invariant violation.
    pub(crate) fn process_update(&mut self, clean: Option<Position>) -> Result<(), SyncError> {
        let Some(clean) = clean else {
            return Ok(());
        };

        match &mut self.state {
            State::ReorgInProgress(queued) => {
                queued.push_back(clean);
                Ok(())
            }
            State::Normal => self.apply(clean),
        }
    }

    /// Re-announces the current position without persisting, supporting
    /// at-least-once external triggering.
    pub(crate) fn republish(&self) {
        if let Some(position) = self.position {
            let _ = self
                .notification_sender
                .send(ScanProgress::from_parts(self.key.clone(), position));
        }
    }

    /// Rewinds the cursor when a dirty block is discovered at or below it.
    /// `boundary` is one position below the earliest unresolved block;
    /// `None` retreats to "no progress yet".
    pub(crate) fn clamp(&mut self, boundary: Option<Position>) -> Result<(), SyncError> {
        let exceeds = match (&self.position, &boundary) {
            (Some(current), Some(limit)) => current.height() > limit.height(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !exceeds {
            return Ok(());
        }

        self.storage
            .set_last_scanned(&self.key, boundary.as_ref())?;
        self.position = boundary;
        if let Some(position) = boundary {
            let _ = self
                .notification_sender
                .send(ScanProgress::from_parts(self.key.clone(), position));
        }

        Ok(())
    }

    /// Defers subsequent updates until [`Self::finish_reorg`].
    pub(crate) fn begin_reorg(&mut self) {
        if matches!(self.state, State::Normal) {
            self.state = State::ReorgInProgress(VecDeque::new());
        }
    }

    /// Truncates the stored cursor to the common ancestor. Part of the reorg
    /// sequence, so it applies immediately even while updates are deferred.
    pub(crate) fn process_reorg(&mut self, common_parent: &Position) -> Result<(), SyncError> {
        tracing::info!(
            "Rewinding {} scan cursor to common ancestor {}",
            self.key,
            common_parent
        );
        self.clamp(Some(*common_parent))
    }

    /// Flushes deferred updates in arrival order and resumes normal
    /// operation.
    pub(crate) fn finish_reorg(&mut self) -> Result<(), SyncError> {
        let queued = match std::mem::replace(&mut self.state, State::Normal) {
            State::ReorgInProgress(queued) => queued,
            State::Normal => return Ok(()),
        };
        for clean in queued {
            self.apply(clean)?;
        }

        Ok(())
    }

    fn apply(&mut self, clean: Position) -> Result<(), SyncError> {
        if self
            .position
            .is_some_and(|current| clean.height() <= current.height())
        {
            return Ok(());
        }

        self.storage.set_last_scanned(&self.key, Some(&clean))?;
        self.position = Some(clean);
        let _ = self
            .notification_sender
            .send(ScanProgress::from_parts(self.key.clone(), clean));
        tracing::debug!("{} scanned to {}", self.key, clean);

        Ok(())
    }
}
