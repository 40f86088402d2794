// =============================================================================
// Central Application State — shared between the scheduler and the API
// =============================================================================
//
// The scheduler replaces the latest run report after every successful run;
// API handlers only ever read.  parking_lot::RwLock guards every mutable
// field; the version counter lets clients detect fresh data cheaply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::pipeline::RunReport;
use crate::runtime_config::RuntimeConfig;
use crate::stats::{self, CurveKind};
use crate::storage::{HistoryRow, HistoryStore, HistoryWindow};
use crate::types::EnrichedRow;

/// A recorded run failure for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

pub struct AppState {
    /// Incremented on every mutation.
    pub state_version: AtomicU64,

    /// Fixed at startup; runs and views read it, nothing writes it.
    pub runtime_config: RuntimeConfig,

    /// Read-only handle for the timeline view.
    pub history: Arc<dyn HistoryStore>,

    pub latest_run: RwLock<Option<RunReport>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            runtime_config: config,
            history,
            latest_run: RwLock::new(None),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Mutation ────────────────────────────────────────────────────────

    pub fn record_run(&self, report: RunReport) {
        *self.latest_run.write() = Some(report);
        self.increment_version();
    }

    /// Record a failed run.  Oldest entries are evicted past
    /// [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, msg: String) {
        let record = ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Views ───────────────────────────────────────────────────────────

    pub fn last_run_id(&self) -> Option<String> {
        self.latest_run.read().as_ref().map(|r| r.run_id.clone())
    }

    pub fn latest_rows(&self) -> Vec<EnrichedRow> {
        self.latest_run
            .read()
            .as_ref()
            .map(|r| r.rows.clone())
            .unwrap_or_default()
    }

    pub fn latest_signals(&self) -> Vec<EnrichedRow> {
        self.latest_run
            .read()
            .as_ref()
            .map(|r| r.rows.iter().filter(|row| row.is_signaled()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            last_run_id: self.last_run_id(),
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
        }
    }

    /// Headline numbers plus the term structure of the latest run.
    pub fn build_summary(&self) -> RunSummary {
        let latest = self.latest_run.read();
        let recent_errors = self.recent_errors.read().clone();

        let Some(report) = latest.as_ref() else {
            return RunSummary {
                state_version: self.current_state_version(),
                run_id: None,
                rows: 0,
                instruments: 0,
                signals: 0,
                latest_snapshot: None,
                term_curve: None,
                curve_knots: Vec::new(),
                term_structure: Vec::new(),
                recent_errors,
            };
        };

        let mut term_structure: Vec<TermPoint> = report
            .rows
            .iter()
            .map(|r| TermPoint {
                instrument: r.snapshot.instrument.clone(),
                days_to_expiry: r.snapshot.days_to_expiry,
                spread: r.spread,
                apy_annual: r.apy_annual,
                z_cross: r.z_cross,
                signal_flag: r.is_signaled(),
            })
            .collect();
        term_structure.sort_by_key(|p| p.days_to_expiry);

        RunSummary {
            state_version: self.current_state_version(),
            run_id: Some(report.run_id.clone()),
            rows: report.rows.len(),
            instruments: report.instrument_count(),
            signals: report.signal_count(),
            latest_snapshot: report.rows.iter().map(|r| r.snapshot.timestamp_utc).max(),
            term_curve: report.term_curve,
            curve_knots: report.curve_knots.clone(),
            term_structure,
            recent_errors,
        }
    }
}

/// History rows newer than `since`, each with the rolling z-score of its APY
/// over the trailing `window` rows of the same instrument and the z-scores it
/// was stored with.  Rows without a timestamp cannot be placed and are skipped.
pub fn build_timeline(history: &HistoryWindow, since: DateTime<Utc>, window: usize) -> Vec<TimelinePoint> {
    let rows: Vec<(DateTime<Utc>, &HistoryRow)> = history
        .rows()
        .iter()
        .filter_map(|r| r.timestamp_utc.filter(|ts| *ts >= since).map(|ts| (ts, r)))
        .collect();

    let z = stats::rolling_by_group(
        &rows,
        |(_, r)| r.apy_annual,
        |(_, r)| r.instrument.clone(),
        |(ts, _)| *ts,
        window,
        window,
    );

    rows.iter()
        .zip(z)
        .map(|((ts, r), apy_z_rolling)| TimelinePoint {
            timestamp_utc: *ts,
            instrument: r.instrument.clone(),
            days_to_expiry: r.days_to_expiry,
            spread: r.spread,
            apy_annual: r.apy_annual,
            apy_z_rolling,
            z_hist: r.z_hist,
            z_cross: r.z_cross,
            z_term: r.z_term,
        })
        .collect()
}

// =============================================================================
// Serialisable views
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub last_run_id: Option<String>,
    pub state_version: u64,
    pub uptime_secs: u64,
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state_version: u64,
    pub run_id: Option<String>,
    pub rows: usize,
    pub instruments: usize,
    pub signals: usize,
    pub latest_snapshot: Option<DateTime<Utc>>,
    pub term_curve: Option<CurveKind>,
    /// Fitted curve as (days_to_expiry, spread) knots.
    pub curve_knots: Vec<(f64, f64)>,
    /// Spread against days to expiry, nearest expiry first.
    pub term_structure: Vec<TermPoint>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TermPoint {
    pub instrument: String,
    pub days_to_expiry: u32,
    pub spread: f64,
    pub apy_annual: f64,
    pub z_cross: Option<f64>,
    pub signal_flag: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelinePoint {
    pub timestamp_utc: DateTime<Utc>,
    pub instrument: String,
    pub days_to_expiry: f64,
    pub spread: f64,
    pub apy_annual: f64,
    pub apy_z_rolling: Option<f64>,
    /// As stored by the run that wrote the row.
    pub z_hist: Option<f64>,
    pub z_cross: Option<f64>,
    pub z_term: Option<f64>,
}
