//! Label automator — reflects a decided urgency into the host UI.
//!
//! Every failure here is non-fatal to the caller: the outcome is reported,
//! never thrown, and the engine decides what repeated failures mean.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::source::{HandleQuery, MenuTrigger, MessageSource, SourceHandle, UiAutomationTarget};
use crate::types::{Message, UrgencyLevel};

/// Confirmation polls: 11 × 200ms ≈ 2.2s max wait.
const CONFIRM_POLLS: u32 = 11;
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Where an application attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFailure {
    /// No live handle could be resolved for the message.
    HandleUnresolved,
    /// Selection was not confirmed and no detail-view fallback was viable.
    SelectionUnconfirmed,
    /// The label menu never opened, via either trigger.
    MenuDidNotOpen,
    /// The label entry was missing and creating it also failed.
    LabelNotFound,
    /// The host never reported the target level within the polling window.
    ConfirmationTimedOut,
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::HandleUnresolved => "could not resolve a live handle",
            Self::SelectionUnconfirmed => "selection was not confirmed",
            Self::MenuDidNotOpen => "label menu did not open",
            Self::LabelNotFound => "label entry not found and creation failed",
            Self::ConfirmationTimedOut => "label application was never confirmed",
        };
        f.write_str(text)
    }
}

/// Result of one application attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The host confirmed the target level.
    Applied,
    /// The host already reported a level — nothing to do, never double-label.
    AlreadyLabeled,
    Failed(ApplyFailure),
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied | Self::AlreadyLabeled)
    }
}

/// Applies urgency labels by simulating selection and menu interaction.
pub struct LabelAutomator {
    source: Arc<dyn MessageSource>,
    ui: Arc<dyn UiAutomationTarget>,
}

impl LabelAutomator {
    pub fn new(source: Arc<dyn MessageSource>, ui: Arc<dyn UiAutomationTarget>) -> Self {
        Self { source, ui }
    }

    /// Apply `level` to `message`. Success means the host confirmed the
    /// label (or already had one) — not merely that events were dispatched.
    pub async fn apply(&self, message: &Message, level: UrgencyLevel) -> ApplyOutcome {
        let Some(handle) = self.resolve(message).await else {
            warn!(identity = %message.identity, "Label apply failed: no handle");
            return ApplyOutcome::Failed(ApplyFailure::HandleUnresolved);
        };

        // Idempotent short-circuit: any already-applied level means done.
        if let Some(existing) = self.source.detect_level(&handle).await {
            debug!(identity = %message.identity, existing = %existing, "Level already applied");
            return ApplyOutcome::AlreadyLabeled;
        }

        if !self.ui.select(&handle).await {
            // Detail-view fallback, only when a navigable permalink exists.
            if let Some(permalink) = message.permalink.as_deref() {
                return self.apply_via_detail(permalink, &handle, level).await;
            }
            warn!(identity = %message.identity, "Label apply failed: selection unconfirmed");
            return ApplyOutcome::Failed(ApplyFailure::SelectionUnconfirmed);
        }

        if let Err(failure) = self.label_via_menu(level).await {
            warn!(identity = %message.identity, failure = %failure, "Label apply failed");
            return ApplyOutcome::Failed(failure);
        }

        self.confirm(&handle, level).await
    }

    /// Handle resolution order: live handle, identity lookup, permalink.
    async fn resolve(&self, message: &Message) -> Option<SourceHandle> {
        if let Some(handle) = &message.source_handle
            && self.source.handle_is_live(handle).await
        {
            return Some(handle.clone());
        }
        if !message.identity.trim().is_empty()
            && let Some(handle) = self
                .source
                .resolve_handle(&HandleQuery::Identity(message.identity.clone()))
                .await
        {
            return Some(handle);
        }
        if let Some(permalink) = &message.permalink {
            return self
                .source
                .resolve_handle(&HandleQuery::Permalink(permalink.clone()))
                .await;
        }
        None
    }

    /// Open the menu (toolbar first, keyboard shortcut second), pick the
    /// label by path or leaf, falling back to label creation.
    async fn label_via_menu(&self, level: UrgencyLevel) -> Result<(), ApplyFailure> {
        let mut opened = self.ui.open_label_menu(MenuTrigger::Toolbar).await;
        if !opened {
            opened = self.ui.open_label_menu(MenuTrigger::Shortcut).await;
        }
        if !opened {
            return Err(ApplyFailure::MenuDidNotOpen);
        }

        let path = level.label_path();
        if !self.ui.pick_label(path).await && !self.ui.create_label(path).await {
            self.ui.close_menu().await;
            return Err(ApplyFailure::LabelNotFound);
        }
        self.ui.close_menu().await;
        Ok(())
    }

    /// Navigate into the detail view, label there, and return.
    async fn apply_via_detail(
        &self,
        permalink: &str,
        handle: &SourceHandle,
        level: UrgencyLevel,
    ) -> ApplyOutcome {
        if !self.source.navigate(permalink).await {
            return ApplyOutcome::Failed(ApplyFailure::SelectionUnconfirmed);
        }
        let labeled = self.label_via_menu(level).await;
        // Always leave the detail view, even after a failed attempt.
        if !self.ui.go_back().await {
            warn!(permalink = %permalink, "Could not navigate back from detail view");
        }
        match labeled {
            Ok(()) => self.confirm(handle, level).await,
            Err(failure) => ApplyOutcome::Failed(failure),
        }
    }

    /// Poll the source's detected level until it reports exactly the target.
    async fn confirm(&self, handle: &SourceHandle, level: UrgencyLevel) -> ApplyOutcome {
        for _ in 0..CONFIRM_POLLS {
            if self.source.detect_level(handle).await == Some(level) {
                return ApplyOutcome::Applied;
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
        warn!(handle = %handle.as_str(), target = %level, "Label confirmation timed out");
        ApplyOutcome::Failed(ApplyFailure::ConfirmationTimedOut)
    }
}
