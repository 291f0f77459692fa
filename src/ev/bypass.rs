use crate::core::config::EvBypassConfig;
use crate::core::reasons;

use super::profile::EvProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassVerdict {
    Bypass,
    Deny(&'static str),
}

/// EV 绕行策略：只有预热完成、期望为正且信噪比超过阈值的画像才能覆盖准入门失败
#[derive(Debug, Clone)]
pub struct EvBypassPolicy {
    pub snr_threshold: f64,
    pub min_variance: f64,
}

impl EvBypassPolicy {
    pub fn new(config: &EvBypassConfig) -> Self {
        Self {
            snr_threshold: config.snr_threshold,
            min_variance: config.min_variance,
        }
    }

    pub fn evaluate(&self, profile: &EvProfile, warmup_trades: u64) -> BypassVerdict {
        if !profile.is_warm(warmup_trades) {
            return BypassVerdict::Deny(reasons::EV_WARMUP_INCOMPLETE);
        }
        if !(profile.expected_value > 0.0) {
            return BypassVerdict::Deny(reasons::EV_NON_POSITIVE);
        }
        if !(profile.signal_to_noise(self.min_variance) > self.snr_threshold) {
            return BypassVerdict::Deny(reasons::EV_SNR_BELOW_THRESHOLD);
        }
        BypassVerdict::Bypass
    }
}
