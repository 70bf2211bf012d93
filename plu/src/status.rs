//! Per-product publication status.
//!
//! A product moves through the stages in order:
//! `Pending -> ViewReady -> ImageReady -> ContentSynced`. A catalog edit moves
//! it to `NeedsResync`, from which the view stage starts over. The legacy
//! per-stage booleans are derived from this status, so combinations such as
//! "content done, view not done" cannot be stored.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    View,
    Image,
    Content,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::View, Stage::Image, Stage::Content];

    /// Name of the completion flag on the product document.
    pub const fn flag_name(&self) -> &'static str {
        match self {
            Stage::View => "viewScheduleStatus",
            Stage::Image => "imageScheduleStatus",
            Stage::Content => "contentScheduleStatus",
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::View => "view",
            Stage::Image => "image",
            Stage::Content => "content",
        }
    }

    /// The stage that must be complete before this one may run.
    pub const fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::View => None,
            Stage::Image => Some(Stage::View),
            Stage::Content => Some(Stage::Image),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    ViewReady,
    ImageReady,
    ContentSynced,
    /// The catalog entry changed after it was (partly) published.
    NeedsResync { previous_version: i32 },
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("cannot complete the {stage} stage from status {from:?}")]
pub struct TransitionError {
    pub stage: Stage,
    pub from: SyncStatus,
}

impl SyncStatus {
    /// Number of stages completed, in pipeline order.
    fn completed(&self) -> usize {
        match self {
            SyncStatus::Pending | SyncStatus::NeedsResync { .. } => 0,
            SyncStatus::ViewReady => 1,
            SyncStatus::ImageReady => 2,
            SyncStatus::ContentSynced => 3,
        }
    }

    fn after(stage: Stage) -> SyncStatus {
        match stage {
            Stage::View => SyncStatus::ViewReady,
            Stage::Image => SyncStatus::ImageReady,
            Stage::Content => SyncStatus::ContentSynced,
        }
    }

    fn position(stage: Stage) -> usize {
        match stage {
            Stage::View => 1,
            Stage::Image => 2,
            Stage::Content => 3,
        }
    }

    /// Value of the stage's completion flag.
    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed() >= Self::position(stage)
    }

    /// True when the stage has not run yet and its prerequisite is complete.
    pub fn is_ready_for(&self, stage: Stage) -> bool {
        !self.is_complete(stage)
            && stage
                .prerequisite()
                .is_none_or(|prerequisite| self.is_complete(prerequisite))
    }

    /// Status after `stage` completes. Completing an already completed stage
    /// leaves the status unchanged.
    pub fn complete(self, stage: Stage) -> Result<SyncStatus, TransitionError> {
        if self.is_complete(stage) {
            return Ok(self);
        }
        if !self.is_ready_for(stage) {
            return Err(TransitionError { stage, from: self });
        }
        Ok(Self::after(stage))
    }

    /// Status after a catalog edit. A product that never left `Pending` stays
    /// there; a pending resync keeps the oldest published version.
    pub fn resync(self, previous_version: i32) -> SyncStatus {
        match self {
            SyncStatus::Pending => SyncStatus::Pending,
            SyncStatus::NeedsResync { previous_version } => {
                SyncStatus::NeedsResync { previous_version }
            }
            _ => SyncStatus::NeedsResync { previous_version },
        }
    }
}
