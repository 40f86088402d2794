// =============================================================================
// Signal Alerts
// =============================================================================
//
// One message per signaled row per enabled channel.  Deliveries are
// independent: a failing channel is logged and the rest still go out.

pub mod channels;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::runtime_config::{non_empty_env, resolve_secret, NotificationConfig};
use crate::types::EnrichedRow;

pub use channels::{DiscordSink, LineNotifySink, TelegramSink};

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, message: &str) -> Result<()>;
}

/// Human-readable alert text for one signaled row.
pub fn format_signal_row(row: &EnrichedRow) -> String {
    let snap = &row.snapshot;
    let (side, reason) = match &row.signal {
        Some(decision) => (
            decision.side_hint.to_string(),
            decision
                .signal_reason
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(","),
        ),
        None => ("n/a".to_string(), String::new()),
    };

    format!(
        "[ARBI] {} | {} | {} | DTE={}\n\
         APY={:.2}% | zH={} zX={} zT={} | apy_net={:.2}%\n\
         Side: {} | Reason: {}",
        snap.timestamp_utc.format("%Y-%m-%d %H:%M:%S%:z"),
        snap.exchange,
        snap.instrument,
        snap.days_to_expiry,
        row.apy_annual * 100.0,
        fmt_z(row.z_hist),
        fmt_z(row.z_cross),
        fmt_z(row.z_term),
        row.apy_net * 100.0,
        side,
        reason,
    )
}

fn fmt_z(z: Option<f64>) -> String {
    match z {
        Some(v) => format!("{v:.2}"),
        None => "nan".to_string(),
    }
}

/// Build the sinks for every enabled channel that has credentials.
pub fn build_sinks(cfg: &NotificationConfig) -> Vec<Box<dyn AlertSink>> {
    let mut sinks: Vec<Box<dyn AlertSink>> = Vec::new();

    for channel in &cfg.enabled_channels {
        match channel.trim().to_lowercase().as_str() {
            "telegram" => {
                let token = resolve_secret(non_empty_env("TELEGRAM_BOT_TOKEN"), &cfg.telegram_bot_token);
                let chat = resolve_secret(non_empty_env("TELEGRAM_CHAT_ID"), &cfg.telegram_chat_id);
                match (token, chat) {
                    (Some(token), Some(chat)) => sinks.push(Box::new(TelegramSink::new(token, chat))),
                    _ => warn!("telegram enabled but bot token or chat id missing; skipped"),
                }
            }
            "discord" => {
                match resolve_secret(non_empty_env("DISCORD_WEBHOOK_URL"), &cfg.discord_webhook_url) {
                    Some(url) => sinks.push(Box::new(DiscordSink::new(url))),
                    None => warn!("discord enabled but webhook url missing; skipped"),
                }
            }
            "line" => match resolve_secret(non_empty_env("LINE_NOTIFY_TOKEN"), &cfg.line_notify_token) {
                Some(token) => sinks.push(Box::new(LineNotifySink::new(token))),
                None => warn!("line enabled but notify token missing; skipped"),
            },
            other => warn!(channel = %other, "unknown alert channel ignored"),
        }
    }

    sinks
}

/// Send an alert for every signaled row on every sink.
///
/// Returns the number of successful deliveries.
pub async fn dispatch(sinks: &[Box<dyn AlertSink>], rows: &[EnrichedRow]) -> usize {
    let mut delivered = 0;
    for row in rows.iter().filter(|r| r.is_signaled()) {
        let message = format_signal_row(row);
        for sink in sinks {
            match sink.send(&message).await {
                Ok(()) => {
                    delivered += 1;
                    info!(channel = sink.name(), instrument = %row.snapshot.instrument, "alert sent");
                }
                Err(e) => warn!(
                    channel = sink.name(),
                    instrument = %row.snapshot.instrument,
                    error = %e,
                    "alert delivery failed"
                ),
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentType, PriceSnapshotRow, SideHint, SignalDecision, SignalMetric};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn row(instrument: &str, flag: bool) -> EnrichedRow {
        EnrichedRow {
            snapshot: PriceSnapshotRow {
                timestamp_utc: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                exchange: "deribit".into(),
                base: "BTC".into(),
                quote: "USD".into(),
                instrument_type: InstrumentType::Future,
                instrument: instrument.into(),
                expiry_ts: 0,
                days_to_expiry: 28,
                spot_price: 60_000.0,
                perp_price: 60_010.0,
                fut_price: 60_500.0,
            },
            spread: 500.0,
            apy_annual: 0.1086,
            z_hist: None,
            z_cross: Some(1.734),
            z_term: Some(-2.5),
            funding_est_hourly: 0.0,
            fee_bp_est: 2.0,
            apy_net: 0.0356,
            signal: None,
            run_id: String::new(),
        }
        .annotate(
            SignalDecision {
                signal_flag: flag,
                signal_reason: vec![SignalMetric::CrossSectional, SignalMetric::Term],
                side_hint: SideHint::ShortFutureLongPerp,
                liq_depth_bp: None,
            },
            "abcd1234",
        )
    }

    struct Recorder {
        sent: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn send(&self, message: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("channel down");
            }
            self.sent.lock().push(message.to_string());
            Ok(())
        }
    }

    #[test]
    fn message_layout() {
        let msg = format_signal_row(&row("BTC-29MAR24", true));
        let lines: Vec<&str> = msg.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "[ARBI] 2024-03-01 12:00:00+00:00 | deribit | BTC-29MAR24 | DTE=28");
        assert_eq!(lines[1], "APY=10.86% | zH=nan zX=1.73 zT=-2.50 | apy_net=3.56%");
        assert_eq!(
            lines[2],
            "Side: Short Future (rich) / Long Perp (cheap) | Reason: z_cross,z_term"
        );
    }

    #[test]
    fn unknown_or_incomplete_channels_build_nothing() {
        let cfg = NotificationConfig {
            enabled_channels: vec!["pager".into()],
            ..Default::default()
        };
        assert!(build_sinks(&cfg).is_empty());
    }

    #[tokio::test]
    async fn only_signaled_rows_are_sent() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(Recorder {
            sent: sent.clone(),
            fail: false,
        })];

        let delivered = dispatch(&sinks, &[row("A", true), row("B", false), row("C", true)]).await;
        assert_eq!(delivered, 2);
        let sent = sent.lock();
        assert!(sent[0].contains("| A |"));
        assert!(sent[1].contains("| C |"));
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sinks: Vec<Box<dyn AlertSink>> = vec![
            Box::new(Recorder {
                sent: sent.clone(),
                fail: true,
            }),
            Box::new(Recorder {
                sent: sent.clone(),
                fail: false,
            }),
        ];

        let delivered = dispatch(&sinks, &[row("A", true), row("B", true)]).await;
        assert_eq!(delivered, 2);
        assert_eq!(sent.lock().len(), 2);
    }
}
