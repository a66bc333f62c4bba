//! Overlay node configuration.

use std::time::Duration;

use bytes::Bytes;

pub const DEFAULT_SUCCESSOR_LIST_LEN: usize = 8;
pub const DEFAULT_TTL: u8 = 32;
pub const DEFAULT_FAN_OUT: usize = 3;
pub const DEFAULT_WORKER_THREADS: usize = 4;
/// Base request timeout before abandoning a request to a non-responding
/// node; scaled per destination by the measured round-trip time.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_STABILIZE_MIN: Duration = Duration::from_secs(5);
pub const DEFAULT_STABILIZE_MAX: Duration = Duration::from_secs(300);

/// How a routing driver advances lookups across the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// The initiator contacts every hop itself and merges returned
    /// candidate sets.
    Iterative,
    /// Each contacted node forwards the lookup; the owner answers the
    /// initiator directly.
    Recursive,
}

#[derive(Debug, Clone)]
/// Overlay node configuration.
pub struct Config {
    /// Identifier size in bytes; the overlay lives in a `2^(8·id_size)` ring.
    ///
    /// Defaults to [crate::common::DEFAULT_ID_SIZE].
    pub id_size: usize,
    /// Network-wide envelope signature filtering out traffic from foreign
    /// overlay instances sharing a transport. Not cryptographic.
    ///
    /// Defaults to the CRC-32 of the crate name.
    pub signature: Bytes,
    /// Routing algorithm name resolved by [crate::algorithm::create].
    ///
    /// Defaults to `"ring"`.
    pub algorithm: String,
    /// Routing driver strategy.
    ///
    /// Defaults to [RoutingStrategy::Iterative].
    pub strategy: RoutingStrategy,
    /// Bound on the successor list length (the node itself not counted).
    pub successor_list_len: usize,
    /// When true, routing tables learn from every envelope seen, not only
    /// from control-protocol replies.
    pub learn_from_all_traffic: bool,
    /// Maximum hop budget for one routing operation. Lookups fail closed
    /// when it reaches zero.
    pub ttl: u8,
    /// Per-operation query fan-out: how many candidates the algorithm is
    /// asked for per step.
    pub fan_out: usize,
    /// Lower bound of the stabilization interval; backoff resets here
    /// whenever the successor set changes.
    pub stabilize_min: Duration,
    /// Upper bound of the exponential stabilization backoff.
    pub stabilize_max: Duration,
    /// Jitter play-ratio applied to each stabilization interval, in
    /// `[0.0, 1.0]`.
    pub stabilize_play: f64,
    /// Resolve every finger slot synchronously at join time instead of
    /// relying on stabilization to converge the table.
    pub aggressive_join: bool,
    /// Number of root candidates requested when joining.
    pub join_root_candidates: usize,
    /// Base request timeout. When a round-trip estimate for a destination
    /// exists, the effective timeout is derived from it instead.
    pub request_timeout: Duration,
    /// Size of the bounded worker pool serving forked sub-operations.
    pub worker_threads: usize,
}

impl Config {
    /// The default overlay signature: CRC-32 of the crate name, big-endian.
    pub fn default_signature() -> Bytes {
        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        Bytes::copy_from_slice(&crc.checksum(b"ringroute").to_be_bytes())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id_size: crate::common::DEFAULT_ID_SIZE,
            signature: Config::default_signature(),
            algorithm: "ring".to_string(),
            strategy: RoutingStrategy::Iterative,
            successor_list_len: DEFAULT_SUCCESSOR_LIST_LEN,
            learn_from_all_traffic: true,
            ttl: DEFAULT_TTL,
            fan_out: DEFAULT_FAN_OUT,
            stabilize_min: DEFAULT_STABILIZE_MIN,
            stabilize_max: DEFAULT_STABILIZE_MAX,
            stabilize_play: 0.1,
            aggressive_join: false,
            join_root_candidates: 3,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}
