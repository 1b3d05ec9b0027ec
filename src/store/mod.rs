//! Persistence — kv state backend and the local triage map.

mod backend;
mod triage_map;

pub use backend::{LibSqlBackend, MemoryBackend, StateBackend};
pub use triage_map::{canonical_identity, identity_aliases, is_stable_identity, TriageStore, TRIAGE_MAP_KEY};
