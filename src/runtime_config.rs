// =============================================================================
// Runtime Configuration — basis radar settings with atomic save
// =============================================================================
//
// Every tunable of the radar lives here: instrument universe, history gating,
// net-APY assumptions, signal thresholds, storage and delivery channels.
//
// All fields carry `#[serde(default)]` so that a partial JSON file (or an
// empty `{}`) loads with defaults filled in.  Persistence uses an atomic
// tmp + rename so a crash mid-write never leaves a truncated file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_base_asset() -> String {
    "BTC".to_string()
}

fn default_quote_asset() -> String {
    "USD".to_string()
}

fn default_lookback_days_for_hist_z() -> u32 {
    30
}

fn default_min_history_rows_per_expiry() -> usize {
    60
}

fn default_fee_bp_est() -> f64 {
    2.0
}

fn default_poll_interval_secs() -> u64 {
    3600
}

fn default_curve_bandwidth_fraction() -> f64 {
    0.6
}

fn default_term_curve_bins() -> Vec<f64> {
    vec![0.0, 7.0, 14.0, 30.0, 60.0, 90.0, 180.0, 365.0]
}

fn default_z_hist_enter() -> f64 {
    2.0
}

fn default_z_cross_enter() -> f64 {
    1.5
}

fn default_z_term_enter() -> f64 {
    2.0
}

fn default_apy_net_min() -> f64 {
    0.0
}

fn default_history_path() -> String {
    "data/live_metrics.jsonl".to_string()
}

fn default_history_pull_rows() -> usize {
    2000
}

fn default_archive_out_dir() -> String {
    "data/archive".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// AppParams
// =============================================================================

/// Instrument universe, historical gating and net-APY assumptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppParams {
    #[serde(default = "default_base_asset")]
    pub base_asset: String,

    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Kept in the config surface for compatibility with existing files.  The
    /// historical z-score reads the last 1000 same-instrument rows regardless
    /// of age, so nothing consults this value.
    #[serde(default = "default_lookback_days_for_hist_z")]
    pub lookback_days_for_hist_z: u32,

    /// Minimum same-instrument history rows before a historical z is emitted.
    #[serde(default = "default_min_history_rows_per_expiry")]
    pub min_history_rows_per_expiry: usize,

    /// Estimated trading fee in basis points.
    #[serde(default = "default_fee_bp_est")]
    pub fee_bp_est: f64,

    /// Assumed hourly funding rate, carried through unchanged.
    #[serde(default)]
    pub funding_est_hourly: f64,

    /// Seconds between scheduled runs.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// LOWESS bandwidth as a fraction of the history points.
    #[serde(default = "default_curve_bandwidth_fraction")]
    pub curve_bandwidth_fraction: f64,
}

impl Default for AppParams {
    fn default() -> Self {
        Self {
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            lookback_days_for_hist_z: default_lookback_days_for_hist_z(),
            min_history_rows_per_expiry: default_min_history_rows_per_expiry(),
            fee_bp_est: default_fee_bp_est(),
            funding_est_hourly: 0.0,
            poll_interval_secs: default_poll_interval_secs(),
            curve_bandwidth_fraction: default_curve_bandwidth_fraction(),
        }
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// Signal entry thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_z_hist_enter")]
    pub z_hist_enter: f64,

    #[serde(default = "default_z_cross_enter")]
    pub z_cross_enter: f64,

    #[serde(default = "default_z_term_enter")]
    pub z_term_enter: f64,

    /// Minimum net APY (decimal, 0.05 = 5 %).
    #[serde(default = "default_apy_net_min")]
    pub apy_net_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            z_hist_enter: default_z_hist_enter(),
            z_cross_enter: default_z_cross_enter(),
            z_term_enter: default_z_term_enter(),
            apy_net_min: default_apy_net_min(),
        }
    }
}

// =============================================================================
// Storage / delivery sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// JSON Lines file holding every enriched row ever written.
    #[serde(default = "default_history_path")]
    pub path: String,

    /// Rows pulled from the tail of the history for each run.
    #[serde(default = "default_history_pull_rows")]
    pub history_pull_rows: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
            history_pull_rows: default_history_pull_rows(),
        }
    }
}

/// Alert channels.  Credentials may be left empty here and supplied through
/// the environment instead (environment wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Any of "telegram", "discord", "line".
    #[serde(default)]
    pub enabled_channels: Vec<String>,

    #[serde(default)]
    pub telegram_bot_token: String,

    #[serde(default)]
    pub telegram_chat_id: String,

    #[serde(default)]
    pub discord_webhook_url: String,

    #[serde(default)]
    pub line_notify_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_out_dir")]
    pub out_dir: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            out_dir: default_archive_out_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bearer token for the dashboard views.  Empty refuses every request.
    #[serde(default)]
    pub admin_token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
            admin_token: String::new(),
        }
    }
}

impl ApiConfig {
    pub fn admin_token(&self) -> Option<&str> {
        let token = self.admin_token.trim();
        (!token.is_empty()).then_some(token)
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the basis radar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub app: AppParams,

    /// Ordered bucket edges (days) for the binned term-curve fallback.
    #[serde(default = "default_term_curve_bins")]
    pub term_curve_bins: Vec<f64>,

    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            app: AppParams::default(),
            term_curve_bins: default_term_curve_bins(),
            thresholds: Thresholds::default(),
            history: HistoryConfig::default(),
            notifications: NotificationConfig::default(),
            archive: ArchiveConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            base = %config.app.base_asset,
            quote = %config.app.quote_asset,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `BASIS_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(base) = non_empty_env("BASIS_BASE_ASSET") {
            self.app.base_asset = base.to_uppercase();
        }
        if let Some(quote) = non_empty_env("BASIS_QUOTE_ASSET") {
            self.app.quote_asset = quote.to_uppercase();
        }
        if let Some(token) = resolve_secret(non_empty_env("BASIS_ADMIN_TOKEN"), &self.api.admin_token) {
            self.api.admin_token = token;
        }
        if let Some(addr) = non_empty_env("BASIS_BIND_ADDR") {
            self.api.bind_addr = addr;
        }
    }
}

/// A credential from the environment when present, else the configured value
/// when not blank.
pub fn resolve_secret(env_value: Option<String>, configured: &str) -> Option<String> {
    env_value.or_else(|| {
        let v = configured.trim();
        (!v.is_empty()).then(|| v.to_string())
    })
}

/// Value of `key` when set and not blank.
pub fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
