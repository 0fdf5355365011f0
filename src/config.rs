//! Configuration types for pacerpc.

use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;

/// RPC configuration.
///
/// Controls request windowing, flow control, management retransmission,
/// wheel geometry, and pacing.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Request window size (max outstanding requests per session).
    /// Default: 8
    pub session_req_window: usize,
    /// Per-session transmit credits. One credit admits one request for
    /// transmission. Default: 8
    pub session_credits: usize,
    /// Management retransmit threshold in milliseconds.
    /// Default: 5
    pub mgmt_retrans_ms: u64,
    /// Number of buckets in the timing wheel.
    /// Default: 4096
    pub wheel_num_buckets: usize,
    /// Wall-time width of one wheel bucket in microseconds.
    /// Default: 0.5
    pub wheel_bucket_width_us: f64,
    /// Initial capacity of the wheel's entry arena.
    /// Default: 1024
    pub wheel_entry_cap: usize,
    /// MTU in bytes. This is the pacing quantum; data packets never exceed it.
    /// Default: 1024
    pub mtu: usize,
    /// Number of background worker threads shared by all endpoints of a Nexus.
    /// Default: 0
    pub bg_threads: usize,
    /// Upper bound on a single request or response message.
    /// Default: 64 KiB
    pub max_msg_size: usize,
    /// Maximum number of sessions per endpoint.
    /// Default: 256
    pub max_sessions: usize,
    /// Target transmit rate in bytes per second, realized by the wheel.
    /// Default: 1.25 GB/s (10 Gbit/s)
    pub target_rate_bps: f64,
    /// Optional per-slot progress watchdog in microseconds. When set, slots
    /// older than this are reported through tracing. Default: None
    pub slot_watchdog_us: Option<u64>,
    /// Depth of each endpoint's background input queue.
    /// Default: 1024
    pub bg_queue_depth: usize,
}

/// Hard cap on a single message, bounded by the 16-bit packet count.
pub const MAX_MSG_SIZE_CAP: usize = 8 * 1024 * 1024;

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            session_req_window: 8,
            session_credits: 8,
            mgmt_retrans_ms: 5,
            wheel_num_buckets: 4096,
            wheel_bucket_width_us: 0.5,
            wheel_entry_cap: 1024,
            mtu: 1024,
            bg_threads: 0,
            max_msg_size: 64 * 1024,
            max_sessions: 256,
            target_rate_bps: 1.25e9,
            slot_watchdog_us: None,
            bg_queue_depth: 1024,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request window size.
    pub fn with_req_window(mut self, session_req_window: usize) -> Self {
        self.session_req_window = session_req_window;
        self
    }

    /// Set the session credits.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    /// Set the management retransmit threshold.
    pub fn with_mgmt_retrans_ms(mut self, mgmt_retrans_ms: u64) -> Self {
        self.mgmt_retrans_ms = mgmt_retrans_ms;
        self
    }

    /// Set the wheel geometry.
    pub fn with_wheel(mut self, num_buckets: usize, bucket_width_us: f64) -> Self {
        self.wheel_num_buckets = num_buckets;
        self.wheel_bucket_width_us = bucket_width_us;
        self
    }

    /// Set the MTU.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the number of background worker threads.
    pub fn with_bg_threads(mut self, bg_threads: usize) -> Self {
        self.bg_threads = bg_threads;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Set the maximum number of sessions per endpoint.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the target transmit rate in bytes per second.
    pub fn with_target_rate_bps(mut self, target_rate_bps: f64) -> Self {
        self.target_rate_bps = target_rate_bps;
        self
    }

    /// Set the per-slot progress watchdog.
    pub fn with_slot_watchdog_us(mut self, watchdog_us: u64) -> Self {
        self.slot_watchdog_us = Some(watchdog_us);
        self
    }

    /// Usable payload bytes per data packet.
    #[inline]
    pub fn payload_per_pkt(&self) -> usize {
        self.mtu - PKT_HDR_SIZE
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.session_req_window == 0 {
            return Err(Error::InvalidConfig("session_req_window must be > 0".into()));
        }
        if self.session_credits == 0 {
            return Err(Error::InvalidConfig("session_credits must be > 0".into()));
        }
        if self.mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig(format!(
                "mtu must exceed the {PKT_HDR_SIZE}-byte packet header"
            )));
        }
        if self.wheel_num_buckets < 2 {
            return Err(Error::InvalidConfig("wheel_num_buckets must be >= 2".into()));
        }
        if self.wheel_bucket_width_us <= 0.0 {
            return Err(Error::InvalidConfig("wheel_bucket_width_us must be > 0".into()));
        }
        if self.max_msg_size == 0 || self.max_msg_size > MAX_MSG_SIZE_CAP {
            return Err(Error::InvalidConfig(format!(
                "max_msg_size must be in [1, {MAX_MSG_SIZE_CAP}]"
            )));
        }
        let max_pkts = self.max_msg_size.div_ceil(self.payload_per_pkt());
        if max_pkts > u16::MAX as usize {
            return Err(Error::InvalidConfig(
                "max_msg_size requires more packets than the header can count".into(),
            ));
        }
        if self.target_rate_bps <= 0.0 {
            return Err(Error::InvalidConfig("target_rate_bps must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::default()
            .with_req_window(16)
            .with_session_credits(16)
            .with_mgmt_retrans_ms(2)
            .with_wheel(1024, 0.25)
            .with_mtu(2048)
            .with_bg_threads(2)
            .with_max_msg_size(1 << 20)
            .with_target_rate_bps(2.0e9);

        assert_eq!(config.session_req_window, 16);
        assert_eq!(config.session_credits, 16);
        assert_eq!(config.mgmt_retrans_ms, 2);
        assert_eq!(config.wheel_num_buckets, 1024);
        assert_eq!(config.mtu, 2048);
        assert_eq!(config.bg_threads, 2);
        assert_eq!(config.max_msg_size, 1 << 20);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(RpcConfig::default().with_req_window(0).validate().is_err());
        assert!(RpcConfig::default().with_mtu(8).validate().is_err());
        assert!(RpcConfig::default().with_max_msg_size(0).validate().is_err());
        assert!(RpcConfig::default()
            .with_wheel(1, 0.5)
            .validate()
            .is_err());
    }
}
