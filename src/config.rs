//! Store configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Tuning knobs for a store and its region Raft groups.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of ticks without leader contact before an election is started.
    pub election_tick: usize,

    /// Number of ticks between leader heartbeats.
    /// Should be much smaller than `election_tick`.
    pub heartbeat_tick: usize,

    /// Maximum size of entries carried by a single append message.
    pub max_size_per_msg: u64,

    /// Maximum number of in-flight append messages per follower.
    pub max_inflight_msgs: usize,

    /// Interval at which the tick driver fires `PeerMsg::Tick`.
    pub tick_interval: Duration,

    /// Capacity of the store-wide tick queue. Pushes beyond this drop the
    /// tick; a later tick re-arms the region.
    pub tick_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_tick: 10,
            heartbeat_tick: 3,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            tick_interval: Duration::from_millis(100),
            tick_queue_capacity: 4096,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_tick == 0 {
            return Err(Error::Config("heartbeat tick must be greater than 0".into()));
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::Config(
                "election tick must be greater than heartbeat tick".into(),
            ));
        }
        if self.tick_queue_capacity == 0 {
            return Err(Error::Config("tick queue capacity must be greater than 0".into()));
        }
        Ok(())
    }

    /// Build the raft-rs config for one peer. `applied` restores the applied
    /// index after restart so committed entries are not re-delivered.
    pub(crate) fn raft_config(&self, peer_id: u64, applied: u64) -> raft::Config {
        raft::Config {
            id: peer_id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            applied,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_tick_relation() {
        let cfg = Config {
            election_tick: 2,
            heartbeat_tick: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
