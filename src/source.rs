//! Capability traits for the host mailbox.
//!
//! The engine never touches host markup or UI internals directly. Everything
//! it needs from the surrounding extraction/rendering layer comes through
//! `MessageSource`, and everything it does *to* the host UI goes through
//! `UiAutomationTarget`. Implementations are host-specific; the automator
//! and orchestrator are host-agnostic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Message, UrgencyLevel};

/// Opaque reference into the message source, usable to act on one message.
///
/// The engine treats the inner value as a token — only the source that
/// issued it can interpret it, and it may go stale at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceHandle(pub String);

impl SourceHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lookup key for recovering a live handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleQuery {
    /// Look up by message identity (any surface spelling).
    Identity(String),
    /// Look up by a URL/permalink fragment derived from the message.
    Permalink(String),
}

/// What the host is currently showing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewContext {
    pub is_inbox: bool,
    pub is_message_detail: bool,
}

/// Read-side capability: the extraction layer's view of the mailbox.
///
/// Best-effort by contract — `list_visible_messages` may be incomplete,
/// `resolve_handle` may fail for messages that scrolled away, and
/// `detect_level` inspects whatever label state the host currently renders.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Current visible message set, bounded by `limit`. Free of duplicates
    /// but possibly incomplete.
    async fn list_visible_messages(&self, limit: usize) -> Vec<Message>;

    /// Urgency already applied in the host UI for this handle, if any.
    async fn detect_level(&self, handle: &SourceHandle) -> Option<UrgencyLevel>;

    /// Recover a live handle by identity or permalink fragment.
    async fn resolve_handle(&self, query: &HandleQuery) -> Option<SourceHandle>;

    /// Whether `handle` still points at a live element.
    async fn handle_is_live(&self, handle: &SourceHandle) -> bool;

    /// Navigate the host view to a permalink fragment. Returns false if the
    /// host refused or the fragment was not navigable.
    async fn navigate(&self, permalink: &str) -> bool;

    /// What the host is currently showing.
    async fn current_context(&self) -> ViewContext;
}

/// How the label menu gets opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuTrigger {
    /// Direct toolbar/menu control.
    Toolbar,
    /// Keyboard-shortcut fallback.
    Shortcut,
}

/// Write-side capability: simulated UI interaction, one confirmed step at
/// a time. Every method reports whether the host *observably* reacted —
/// dispatching an event that nothing responded to is a `false`.
#[async_trait]
pub trait UiAutomationTarget: Send + Sync {
    /// Toggle selection of the message behind `handle`. True only when a
    /// selection-state change was observed.
    async fn select(&self, handle: &SourceHandle) -> bool;

    /// Open the label-assignment menu. True when the menu became visible.
    async fn open_label_menu(&self, trigger: MenuTrigger) -> bool;

    /// Activate the menu entry matching the label path or its leaf name.
    async fn pick_label(&self, path: &str) -> bool;

    /// Create a missing label via the menu's creation flow.
    async fn create_label(&self, path: &str) -> bool;

    /// Dismiss the label menu.
    async fn close_menu(&self);

    /// Return to the previous host view (after a detail-view detour).
    async fn go_back(&self) -> bool;
}
