//! Per-mode protection and evaluation settings

use serde::{Deserialize, Serialize};

/// Mode-specific protection distances (in ATR multiples) and evaluation flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Candle interval in exchange notation ("15" = 15 minutes, "60" = 1 hour)
    pub interval: String,
    /// Hard stop-loss distance from entry
    pub sl_atr: f64,
    /// Profit distance at which the trailing stop activates
    pub trail_activation_atr: f64,
    /// Trailing stop callback distance
    pub trail_callback_atr: f64,
    /// Apply the volume-spike sizing multiplier
    pub volume_boost: bool,
    /// Veto signals that fight the higher-timeframe trend
    pub htf_veto: bool,
}

impl ModeConfig {
    /// Wide hard stop, early trailing activation
    pub fn scalp_default() -> Self {
        Self {
            interval: "15".to_string(),
            sl_atr: 3.0,
            trail_activation_atr: 0.5,
            trail_callback_atr: 0.5,
            volume_boost: true,
            htf_veto: true,
        }
    }

    pub fn swing_default() -> Self {
        Self {
            interval: "60".to_string(),
            sl_atr: 5.0,
            trail_activation_atr: 1.5,
            trail_callback_atr: 1.0,
            volume_boost: false,
            htf_veto: false,
        }
    }
}
