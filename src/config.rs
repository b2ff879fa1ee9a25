//! Engine configuration.
//!
//! A `Config` is built once at startup and threaded by value through
//! construction of the tracker client, scheduler and peer connections.
//! There is no process-wide state.
use thiserror::Error;

/// Largest block size the wire protocol tolerates (power of two).
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on concurrently open peer connections.
    pub max_peers: usize,
    /// Request unit in bytes. Must be a power of two no larger than
    /// [`MAX_BLOCK_SIZE`]; the protocol default of 16 KiB is what virtually
    /// every peer expects.
    pub block_size: u32,
    /// Maximum in-flight block requests per peer.
    pub pipeline_depth: usize,
    /// Maximum concurrent piece assignments per peer, which doubles as the
    /// saturation cap on how many peers may share one in-flight piece.
    pub pieces_per_peer: usize,
    /// Overrides the re-announce interval returned by the tracker, in
    /// seconds. The one-shot engine only announces once, but the value is
    /// carried for callers that wire up periodic announces.
    pub announce_interval_override: Option<u64>,
    /// Port reported to trackers in announce requests.
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 120,
            block_size: 16 * 1024,
            pipeline_depth: 64,
            pieces_per_peer: 8,
            announce_interval_override: None,
            listen_port: 6881,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("block_size {0} is not a power of two <= {MAX_BLOCK_SIZE}")]
    InvalidBlockSize(u32),

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

impl Config {
    /// Checks the constraints the scheduler and wire codec rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0
            || !self.block_size.is_power_of_two()
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(ConfigError::InvalidBlockSize(self.block_size));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Zero("max_peers"));
        }
        if self.pipeline_depth == 0 {
            return Err(ConfigError::Zero("pipeline_depth"));
        }
        if self.pieces_per_peer == 0 {
            return Err(ConfigError::Zero("pieces_per_peer"));
        }
        Ok(())
    }
}
