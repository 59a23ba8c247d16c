use std::path::PathBuf;

/// Candidate-file probe produced by the event sources (initial scan,
/// filesystem notifier, poller). Carries the metadata observed at probe
/// time so the orchestrator can coalesce redundant events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub size: u64,
    pub mod_ns: i64,
}
