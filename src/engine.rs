//! Triage run orchestrator.
//!
//! The only component aware of run-level state: batching, halts, cooldowns,
//! and the status string the presentation layer displays. One engine
//! instance holds all of it — there are no process-wide singletons.
//!
//! Store writes happen *before* UI application on purpose: a crash after the
//! write still leaves the message marked triaged, so UI flakiness can never
//! cause a re-classification.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::automator::LabelAutomator;
use crate::classify::Classifier;
use crate::settings::TriageSettings;
use crate::source::{MessageSource, UiAutomationTarget};
use crate::store::{canonical_identity, TriageStore};
use crate::types::{count_by_level, LevelCounts, Message, UrgencyLevel, VerdictTarget};

/// Cooldown armed after a failed run; auto-triggered runs inside the window
/// are refused (forced runs bypass it).
pub const COOLDOWN_AFTER_FAILURE: Duration = Duration::from_secs(45);

/// Visible-set bound per collection pass.
const COLLECT_LIMIT: usize = 60;

/// Iteration cap for process-all runs, bounding pathological mailboxes.
const MAX_RUN_ITERATIONS: usize = 20;

/// Consecutive automation failures that halt the run.
const AUTOMATION_FAILURE_LIMIT: u32 = 3;

// ── Run options and outcomes ────────────────────────────────────────

/// What started this run. Only auto-triggered runs honor the cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunTrigger {
    #[default]
    Manual,
    Auto,
}

/// Options for one triage run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Bypass the duplicate-batch check and the cooldown window.
    pub force: bool,
    /// Loop until no candidates remain (bounded by the iteration cap)
    /// instead of running a single batch cycle.
    pub process_all: bool,
    /// Constrained mode: one message per batch.
    pub one_by_one: bool,
    pub trigger: RunTrigger,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No candidates remained (or the single batch cycle finished).
    Completed { triaged: usize },
    /// A halt condition fired; `reason` matches the status string.
    Halted { reason: String },
    /// An entry guard refused to start the run.
    Refused { reason: String },
}

// ── Engine ──────────────────────────────────────────────────────────

struct RunState {
    last_batch_signature: Option<String>,
    cooldown_until: Option<Instant>,
}

/// Triage engine instance — owns settings, store, run flags, and status.
pub struct TriageEngine {
    source: Arc<dyn MessageSource>,
    classifier: Arc<dyn Classifier>,
    automator: LabelAutomator,
    store: Arc<TriageStore>,
    settings: RwLock<TriageSettings>,
    running: AtomicBool,
    status: RwLock<String>,
    run_state: Mutex<RunState>,
}

impl TriageEngine {
    pub fn new(
        source: Arc<dyn MessageSource>,
        ui: Arc<dyn UiAutomationTarget>,
        classifier: Arc<dyn Classifier>,
        store: Arc<TriageStore>,
        settings: TriageSettings,
    ) -> Arc<Self> {
        let automator = LabelAutomator::new(Arc::clone(&source), ui);
        Arc::new(Self {
            source,
            classifier,
            automator,
            store,
            settings: RwLock::new(settings.normalized()),
            running: AtomicBool::new(false),
            status: RwLock::new("Idle".to_string()),
            run_state: Mutex::new(RunState {
                last_batch_signature: None,
                cooldown_until: None,
            }),
        })
    }

    /// Human-readable status, updated at every phase transition.
    pub async fn status(&self) -> String {
        self.status.read().await.clone()
    }

    pub async fn settings(&self) -> TriageSettings {
        self.settings.read().await.clone()
    }

    /// Replace the engine settings (normalized on the way in).
    pub async fn update_settings(&self, settings: TriageSettings) {
        *self.settings.write().await = settings.normalized();
    }

    /// Per-level counts for a message set (presentation-layer helper).
    pub fn count_by_level(messages: &[Message]) -> LevelCounts {
        count_by_level(messages)
    }

    /// Fire-and-forget run; observe progress via `status()`.
    pub fn spawn_run(self: &Arc<Self>, options: RunOptions) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = engine.run_triage_for_inbox(options).await;
            debug!(?outcome, "Background triage run finished");
        });
    }

    /// Run the triage state machine:
    /// Idle → Collecting → Batching → Classifying → Applying → (loop | Halted | Complete).
    pub async fn run_triage_for_inbox(&self, options: RunOptions) -> RunOutcome {
        // Overlapping runs are rejected outright; the active run's status
        // is left untouched.
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Triage run refused: already in progress");
            return RunOutcome::Refused {
                reason: "a triage run is already in progress".into(),
            };
        }
        let outcome = self.run_inner(options).await;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_inner(&self, options: RunOptions) -> RunOutcome {
        let settings = self.settings.read().await.clone();

        // ── Entry guards ────────────────────────────────────────────
        if let Err(e) = settings.ensure_ready() {
            self.set_status(format!("Triage unavailable: {e}")).await;
            return RunOutcome::Refused {
                reason: e.to_string(),
            };
        }

        let context = self.source.current_context().await;
        if !context.is_inbox {
            self.set_status("Triage runs only from the inbox view").await;
            return RunOutcome::Refused {
                reason: "not viewing the inbox".into(),
            };
        }

        if options.trigger == RunTrigger::Auto && !options.force {
            let state = self.run_state.lock().await;
            if let Some(until) = state.cooldown_until
                && Instant::now() < until
            {
                debug!("Auto triage run refused: inside cooldown window");
                return RunOutcome::Refused {
                    reason: "cooling down after a failed run".into(),
                };
            }
        }

        if let Err(e) = self.store.load().await {
            warn!(error = %e, "Triage store failed to load");
            self.set_status("Triage unavailable: stored state could not be read")
                .await;
            return RunOutcome::Refused {
                reason: format!("triage store unavailable: {e}"),
            };
        }

        info!(
            force = options.force,
            process_all = options.process_all,
            one_by_one = options.one_by_one,
            "Starting triage run"
        );

        // Identities (canonical) already sent to the classifier this run.
        let mut attempted: HashSet<String> = HashSet::new();
        let mut triaged = 0usize;
        let mut consecutive_failures = 0u32;
        let max_iterations = if options.process_all {
            MAX_RUN_ITERATIONS
        } else {
            1
        };

        for iteration in 0..max_iterations {
            // ── Collecting ──────────────────────────────────────────
            self.set_status("Collecting messages…").await;
            let visible = self.source.list_visible_messages(COLLECT_LIMIT).await;
            let mut candidates: Vec<Message> = Vec::new();
            for msg in visible {
                let canonical = canonical_identity(&msg.identity);
                if canonical.is_empty() || attempted.contains(&canonical) {
                    continue;
                }
                if self.store.get(&msg.identity).await.is_some() {
                    continue;
                }
                if let Some(level) = self.detected_level(&msg).await {
                    // Host UI already shows a level: cache it, skip the model.
                    self.store.set(&msg.identity, level).await;
                    continue;
                }
                candidates.push(msg);
            }

            if candidates.is_empty() {
                self.set_status("Inbox triage complete").await;
                info!(triaged, iteration, "Triage run complete: no candidates left");
                return RunOutcome::Completed { triaged };
            }

            // ── Batching ────────────────────────────────────────────
            let take = if options.one_by_one {
                1
            } else {
                settings.batch_size
            };
            let batch: Vec<Message> = candidates.into_iter().take(take).collect();
            let signature = batch
                .iter()
                .map(|m| canonical_identity(&m.identity))
                .collect::<Vec<_>>()
                .join(",");

            {
                let state = self.run_state.lock().await;
                if !options.force && state.last_batch_signature.as_deref() == Some(&signature) {
                    self.set_status("Waiting for new messages to triage").await;
                    return RunOutcome::Halted {
                        reason: "waiting for new data".into(),
                    };
                }
            }

            // ── Classifying ─────────────────────────────────────────
            self.set_status(format!("Classifying {} messages…", batch.len()))
                .await;
            let verdicts = match self.classifier.classify(&batch, &settings).await {
                Ok(verdicts) => verdicts,
                Err(e) => {
                    self.arm_cooldown().await;
                    self.set_status(format!("Triage halted: {e}")).await;
                    warn!(error = %e, "Triage run halted by classification failure");
                    return RunOutcome::Halted {
                        reason: e.to_string(),
                    };
                }
            };

            for msg in &batch {
                attempted.insert(canonical_identity(&msg.identity));
            }

            if verdicts.is_empty() {
                self.set_status("Triage halted: the provider returned nothing")
                    .await;
                return RunOutcome::Halted {
                    reason: "provider returned nothing".into(),
                };
            }

            // The batch counts as processed only now: a classifier error or
            // an empty verdict set leaves the signature untouched, so the
            // same candidates may be resubmitted.
            self.run_state.lock().await.last_batch_signature = Some(signature);

            // ── Applying ────────────────────────────────────────────
            self.set_status("Applying labels…").await;
            let mut applied_this_batch: HashSet<String> = HashSet::new();
            for verdict in &verdicts {
                let Some(msg) = resolve_target(&batch, &verdict.target) else {
                    warn!(
                        identity = %verdict.target.identity,
                        index = ?verdict.target.index,
                        "Verdict matched no message in the batch"
                    );
                    continue;
                };
                let canonical = canonical_identity(&msg.identity);
                if !applied_this_batch.insert(canonical) {
                    continue;
                }

                // Write-ahead: the store is the durable record of "triaged";
                // the UI label is best-effort on top of it.
                self.store.set(&msg.identity, verdict.level).await;
                triaged += 1;
                debug!(
                    identity = %msg.identity,
                    level = %verdict.level,
                    score = verdict.score,
                    reason = %verdict.reason,
                    "Verdict recorded"
                );

                let outcome = self.automator.apply(msg, verdict.level).await;
                if outcome.is_success() {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures >= AUTOMATION_FAILURE_LIMIT {
                        self.set_status("Triage halted: the mailbox UI could not be controlled")
                            .await;
                        return RunOutcome::Halted {
                            reason: "the mailbox UI could not be controlled".into(),
                        };
                    }
                }
            }

            if !options.process_all {
                self.set_status("Inbox triage complete").await;
                info!(triaged, "Single-batch triage run complete");
                return RunOutcome::Completed { triaged };
            }
        }

        self.set_status("Triage paused: iteration limit reached").await;
        RunOutcome::Halted {
            reason: "iteration limit reached".into(),
        }
    }

    /// Level already visible for a message: the transient field first, then
    /// a fresh detection when a live handle exists.
    async fn detected_level(&self, msg: &Message) -> Option<UrgencyLevel> {
        if let Some(level) = msg.detected_level {
            return Some(level);
        }
        match &msg.source_handle {
            Some(handle) => self.source.detect_level(handle).await,
            None => None,
        }
    }

    async fn arm_cooldown(&self) {
        let mut state = self.run_state.lock().await;
        state.cooldown_until = Some(Instant::now() + COOLDOWN_AFTER_FAILURE);
    }

    async fn set_status(&self, text: impl Into<String>) {
        let text = text.into();
        debug!(status = %text, "Phase transition");
        *self.status.write().await = text;
    }
}

/// Map a verdict onto its batch message: identity first, positional index
/// as the fallback. Identity matching is canonical, so a model echoing a
/// different surface spelling still lands on the right message.
fn resolve_target<'a>(batch: &'a [Message], target: &VerdictTarget) -> Option<&'a Message> {
    if !target.identity.is_empty() {
        let canonical = canonical_identity(&target.identity);
        if let Some(msg) = batch
            .iter()
            .find(|m| canonical_identity(&m.identity) == canonical)
        {
            return Some(msg);
        }
    }
    target.index.and_then(|i| batch.get(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TriageVerdict, UrgencyLevel};

    fn msg(identity: &str) -> Message {
        Message {
            identity: identity.into(),
            sender: "alice@example.com".into(),
            subject: "subject".into(),
            snippet: String::new(),
            body_text: String::new(),
            source_handle: None,
            permalink: None,
            detected_level: None,
        }
    }

    fn verdict(identity: &str, index: Option<usize>) -> TriageVerdict {
        TriageVerdict {
            target: VerdictTarget {
                identity: identity.into(),
                index,
            },
            level: UrgencyLevel::High,
            score: 80,
            reason: "test".into(),
        }
    }

    #[test]
    fn target_resolution_prefers_identity() {
        let batch = vec![msg("f:1"), msg("f:2")];
        // Identity says f:1 even though the index points at f:2.
        let resolved = resolve_target(&batch, &verdict("f:1", Some(1)).target).unwrap();
        assert_eq!(resolved.identity, "f:1");
    }

    #[test]
    fn target_resolution_matches_identity_canonically() {
        let batch = vec![msg("#thread-f:1"), msg("f:2")];
        let resolved = resolve_target(&batch, &verdict("f:1", None).target).unwrap();
        assert_eq!(resolved.identity, "#thread-f:1");
    }

    #[test]
    fn target_resolution_falls_back_to_index() {
        let batch = vec![msg("f:1"), msg("f:2")];
        let resolved = resolve_target(&batch, &verdict("f:999", Some(1)).target).unwrap();
        assert_eq!(resolved.identity, "f:2");

        let by_index_only = resolve_target(&batch, &verdict("", Some(0)).target).unwrap();
        assert_eq!(by_index_only.identity, "f:1");
    }

    #[test]
    fn target_resolution_rejects_out_of_range() {
        let batch = vec![msg("f:1")];
        assert!(resolve_target(&batch, &verdict("f:999", Some(5)).target).is_none());
        assert!(resolve_target(&batch, &verdict("", None).target).is_none());
    }
}
