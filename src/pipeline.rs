// =============================================================================
// Run Pipeline — fetch, enrich, decide, persist, alert
// =============================================================================
//
// One run:
//   1. fetch the current snapshot           (failure aborts the run)
//   2. read the history tail                (failure -> empty history, warning)
//   3. compute metrics against that history
//   4. decide signals and stamp the run id
//   5. append every row to the history      (failure aborts, no alerts sent)
//   6. alert on signaled rows               (per-delivery failures only logged)
//
// Callers must not run two pipelines against the same store concurrently.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::market_data::SnapshotSource;
use crate::metrics::{instrument_count, MetricsComputer};
use crate::notify::{self, AlertSink};
use crate::runtime_config::RuntimeConfig;
use crate::signals::SignalDecider;
use crate::stats::CurveKind;
use crate::storage::{HistoryStore, HistoryWindow};
use crate::types::EnrichedRow;

/// Outcome of one successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub finished_at: DateTime<Utc>,
    pub history_rows: usize,
    pub term_curve: Option<CurveKind>,
    pub curve_knots: Vec<(f64, f64)>,
    pub alerts_delivered: usize,
    pub rows: Vec<EnrichedRow>,
}

impl RunReport {
    pub fn signal_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_signaled()).count()
    }

    pub fn instrument_count(&self) -> usize {
        instrument_count(&self.rows)
    }
}

/// First eight characters of a v4 UUID.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct Pipeline {
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn HistoryStore>,
    sinks: Vec<Box<dyn AlertSink>>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        store: Arc<dyn HistoryStore>,
        sinks: Vec<Box<dyn AlertSink>>,
    ) -> Self {
        Self {
            source,
            store,
            sinks,
        }
    }

    #[instrument(skip_all, name = "pipeline::run_once")]
    pub async fn run_once(&self, cfg: &RuntimeConfig) -> Result<RunReport> {
        let run_id = new_run_id();

        let current = self
            .source
            .fetch(&cfg.app.base_asset, &cfg.app.quote_asset)
            .await
            .context("snapshot fetch failed")?;
        if current.is_empty() {
            warn!(run_id = %run_id, base = %cfg.app.base_asset, "snapshot has no instruments");
        }

        let history = match self.store.read_tail(cfg.history.history_pull_rows).await {
            Ok(window) => window,
            Err(e) => {
                warn!(error = %e, "history unavailable, computing without it");
                HistoryWindow::empty()
            }
        };
        if history.is_empty() {
            info!("no stored history yet; z_hist and z_term stay undefined this run");
        }

        let enriched = MetricsComputer::from_config(cfg).compute(&current, &history);
        let decider = SignalDecider::new(cfg.thresholds);
        let rows: Vec<EnrichedRow> = enriched
            .rows
            .into_iter()
            .map(|row| {
                let decision = decider.decide(&row);
                row.annotate(decision, &run_id)
            })
            .collect();

        self.store
            .append(&rows)
            .await
            .context("history append failed")?;

        let alerts_delivered = notify::dispatch(&self.sinks, &rows).await;

        let report = RunReport {
            run_id,
            finished_at: Utc::now(),
            history_rows: history.len(),
            term_curve: enriched.term_curve,
            curve_knots: enriched.curve_knots,
            alerts_delivered,
            rows,
        };

        info!(
            run_id = %report.run_id,
            rows = report.rows.len(),
            signals = report.signal_count(),
            history_rows = report.history_rows,
            alerts = report.alerts_delivered,
            "run complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentType, PriceSnapshotRow};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn snap(instrument: &str, dte: u32, fut: f64) -> PriceSnapshotRow {
        PriceSnapshotRow {
            timestamp_utc: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            exchange: "deribit".into(),
            base: "BTC".into(),
            quote: "USD".into(),
            instrument_type: InstrumentType::Future,
            instrument: instrument.into(),
            expiry_ts: 0,
            days_to_expiry: dte,
            spot_price: 60_000.0,
            perp_price: 60_010.0,
            fut_price: fut,
        }
    }

    struct FakeSource {
        rows: Vec<PriceSnapshotRow>,
        fail: bool,
    }

    #[async_trait]
    impl SnapshotSource for FakeSource {
        async fn fetch(&self, _base: &str, _quote: &str) -> Result<Vec<PriceSnapshotRow>> {
            if self.fail {
                anyhow::bail!("exchange unreachable");
            }
            Ok(self.rows.clone())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<EnrichedRow>>,
        fail_read: bool,
        fail_append: bool,
    }

    #[async_trait]
    impl HistoryStore for MemoryStore {
        async fn read_tail(&self, limit: usize) -> Result<HistoryWindow> {
            if self.fail_read {
                anyhow::bail!("store offline");
            }
            let rows = self.rows.lock();
            let start = rows.len().saturating_sub(limit);
            let values = rows[start..]
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(HistoryWindow::from_values(values))
        }

        async fn append(&self, rows: &[EnrichedRow]) -> Result<()> {
            if self.fail_append {
                anyhow::bail!("store read-only");
            }
            self.rows.lock().extend_from_slice(rows);
            Ok(())
        }
    }

    struct CountingSink(Arc<Mutex<usize>>);

    #[async_trait]
    impl AlertSink for CountingSink {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn send(&self, _message: &str) -> Result<()> {
            *self.0.lock() += 1;
            Ok(())
        }
    }

    fn signaling_config() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.thresholds.z_cross_enter = 0.5;
        cfg.thresholds.apy_net_min = -100.0;
        cfg
    }

    fn two_futures() -> Vec<PriceSnapshotRow> {
        vec![snap("BTC-8MAR24", 7, 60_050.0), snap("BTC-29MAR24", 28, 60_400.0)]
    }

    fn pipeline(
        source: FakeSource,
        store: Arc<MemoryStore>,
        sent: Arc<Mutex<usize>>,
    ) -> Pipeline {
        Pipeline::new(Arc::new(source), store, vec![Box::new(CountingSink(sent))])
    }

    #[test]
    fn run_id_is_eight_hex_chars() {
        let id = new_run_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_run_id());
    }

    #[tokio::test]
    async fn run_appends_and_alerts() {
        let store = Arc::new(MemoryStore::default());
        let sent = Arc::new(Mutex::new(0));
        let p = pipeline(
            FakeSource {
                rows: two_futures(),
                fail: false,
            },
            store.clone(),
            sent.clone(),
        );

        let report = p.run_once(&signaling_config()).await.unwrap();
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.signal_count(), 2);
        assert_eq!(report.instrument_count(), 2);
        assert_eq!(report.alerts_delivered, 2);
        assert_eq!(*sent.lock(), 2);

        let stored = store.rows.lock();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.run_id == report.run_id));
    }

    #[tokio::test]
    async fn second_run_reads_first_run_as_history() {
        let store = Arc::new(MemoryStore::default());
        let sent = Arc::new(Mutex::new(0));
        let p = pipeline(
            FakeSource {
                rows: two_futures(),
                fail: false,
            },
            store.clone(),
            sent,
        );

        let cfg = RuntimeConfig::default();
        let first = p.run_once(&cfg).await.unwrap();
        assert_eq!(first.history_rows, 0);
        let second = p.run_once(&cfg).await.unwrap();
        assert_eq!(second.history_rows, 2);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(store.rows.lock().len(), 4);
    }

    #[tokio::test]
    async fn unreadable_history_still_runs() {
        let store = Arc::new(MemoryStore {
            fail_read: true,
            ..Default::default()
        });
        let p = pipeline(
            FakeSource {
                rows: two_futures(),
                fail: false,
            },
            store.clone(),
            Arc::new(Mutex::new(0)),
        );

        let report = p.run_once(&signaling_config()).await.unwrap();
        assert_eq!(report.history_rows, 0);
        assert!(report.rows.iter().all(|r| r.z_hist.is_none()));
        assert_eq!(store.rows.lock().len(), 2);
    }

    #[tokio::test]
    async fn append_failure_fails_run_without_alerts() {
        let store = Arc::new(MemoryStore {
            fail_append: true,
            ..Default::default()
        });
        let sent = Arc::new(Mutex::new(0));
        let p = pipeline(
            FakeSource {
                rows: two_futures(),
                fail: false,
            },
            store,
            sent.clone(),
        );

        assert!(p.run_once(&signaling_config()).await.is_err());
        assert_eq!(*sent.lock(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_writes_nothing() {
        let store = Arc::new(MemoryStore::default());
        let p = pipeline(
            FakeSource {
                rows: Vec::new(),
                fail: true,
            },
            store.clone(),
            Arc::new(Mutex::new(0)),
        );

        assert!(p.run_once(&RuntimeConfig::default()).await.is_err());
        assert!(store.rows.lock().is_empty());
    }
}
