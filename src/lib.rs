//! Inbox triage engine: classifies visible mailbox messages by urgency with
//! an OpenAI-compatible chat endpoint, remembers verdicts in a local store,
//! and drives the mailbox UI to apply the matching labels.

pub mod automator;
pub mod classify;
pub mod engine;
pub mod error;
pub mod settings;
pub mod source;
pub mod store;
pub mod types;

pub use automator::{ApplyFailure, ApplyOutcome, LabelAutomator};
pub use classify::{Classifier, HttpClassifier};
pub use engine::{RunOptions, RunOutcome, RunTrigger, TriageEngine};
pub use error::{ClassifyError, ConfigError, Error, Result, StoreError};
pub use settings::{Provider, TriageSettings};
pub use source::{MessageSource, SourceHandle, UiAutomationTarget};
pub use store::{LibSqlBackend, MemoryBackend, StateBackend, TriageStore};
pub use types::{Message, TriageVerdict, UrgencyLevel, VerdictTarget};
