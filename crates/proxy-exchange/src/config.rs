use std::time::Duration;

use proxy_wire::FrameConfig;

const GIBIBYTE: u64 = 1024 * 1024 * 1024;
const LARGE_RECV_SIZE: u64 = 16 * GIBIBYTE;
const HISTORY_TEXT_VALUE_LEN: u64 = 65_535;
const DEFAULT_RESERVED: u64 = HISTORY_TEXT_VALUE_LEN * 4 + 4 * 1024;
const DEFAULT_ROWS_PER_PAGE: usize = 1000;
const DEFAULT_VALUES_PER_CHUNK: usize = 256;
const DEFAULT_GAP_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_VERSION_LOG_INTERVAL: Duration = Duration::from_secs(300);

/// Size and paging budget for batch assembly.
///
/// Only the ratio between the two byte thresholds matters to peers: the record
/// limit is the whole budget, the batch limit is half of it.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub max_recv_size: u64,
    /// Ceiling for `proxy config` requests, which may exceed `max_recv_size`.
    pub max_large_recv_size: u64,
    /// Headroom kept for the envelope around the data arrays.
    pub reserved: u64,
    pub rows_per_page: usize,
    pub values_per_chunk: usize,
    pub gap_retry_delay: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_recv_size: GIBIBYTE,
            max_large_recv_size: LARGE_RECV_SIZE,
            reserved: DEFAULT_RESERVED,
            rows_per_page: DEFAULT_ROWS_PER_PAGE,
            values_per_chunk: DEFAULT_VALUES_PER_CHUNK,
            gap_retry_delay: DEFAULT_GAP_RETRY_DELAY,
        }
    }
}

impl TransferLimits {
    pub fn record_limit(&self) -> usize {
        self.max_recv_size.saturating_sub(self.reserved) as usize
    }

    pub fn batch_limit(&self) -> usize {
        self.record_limit() / 2
    }
}

/// Per-process exchange settings threaded into every socket operation.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub timeout: Duration,
    pub limits: TransferLimits,
    pub compress: bool,
    pub version_log_interval: Duration,
    /// Interval between connection rounds for persistent connections; `None` fails fast.
    pub reconnect_interval: Option<Duration>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            limits: TransferLimits::default(),
            compress: false,
            version_log_interval: DEFAULT_VERSION_LOG_INTERVAL,
            reconnect_interval: None,
        }
    }
}

impl ExchangeConfig {
    pub fn frame(&self) -> FrameConfig {
        FrameConfig {
            max_size: self.limits.max_recv_size,
            compress: self.compress,
        }
    }

    /// Frame settings for the trapper, which admits large `proxy config` requests.
    pub fn listener_frame(&self) -> FrameConfig {
        FrameConfig {
            max_size: self.limits.max_large_recv_size.max(self.limits.max_recv_size),
            compress: self.compress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_limit_is_half_the_record_limit() {
        let limits = TransferLimits::default();
        assert_eq!(
            limits.record_limit() as u64,
            GIBIBYTE - (65_535 * 4 + 4096)
        );
        assert_eq!(limits.batch_limit(), limits.record_limit() / 2);
    }

    #[test]
    fn tiny_budgets_saturate() {
        let limits = TransferLimits {
            max_recv_size: 10,
            reserved: 100,
            ..TransferLimits::default()
        };
        assert_eq!(limits.record_limit(), 0);
    }
}
