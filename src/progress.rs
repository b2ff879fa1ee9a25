//! Progress events emitted to the UI collaborator.
//!
//! The engine publishes these over a bounded broadcast channel; a slow
//! consumer loses the oldest snapshots rather than stalling the download.

/// Point-in-time view of the download, emitted at least once per second
/// while the engine is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub pieces_done: usize,
    pub pieces_total: usize,
    /// Bytes that have passed hash verification.
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub peers_connected: usize,
    pub peers_total_seen: usize,
    /// Download rate over the last emission interval, in bits per second.
    pub download_rate_bps: u64,
    pub elapsed_s: u64,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Snapshot(ProgressSnapshot),
    Completed,
    Failed { cause: String },
}
