use serde::{Deserialize, Serialize};

/// Chain parameters shared by the state machine and the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Nonce assigned to accounts that have never transacted.
    pub initial_nonce: u64,
    /// Timestamp stamped on the genesis header.
    pub genesis_timestamp: u64,
    /// How often the deferred-transaction queue is drained, in seconds.
    pub time_queue_interval_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            initial_nonce: 0,
            genesis_timestamp: 0,
            time_queue_interval_secs: 120,
        }
    }
}
