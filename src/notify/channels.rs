// =============================================================================
// Alert Channels — Telegram, Discord webhook, LINE Notify
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::AlertSink;

const TELEGRAM_API: &str = "https://api.telegram.org";
const LINE_NOTIFY_API: &str = "https://notify-api.line.me/api/notify";

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client for alert channel")
}

async fn check_status(resp: reqwest::Response, channel: &str) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{} returned {}: {}", channel, status, body);
    }
    Ok(())
}

// ── Telegram ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub struct TelegramSink {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: http_client(),
            bot_token,
            chat_id,
        }
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API, self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(&SendMessageRequest {
                chat_id: &self.chat_id,
                text: message,
            })
            .send()
            .await
            .context("telegram sendMessage request failed")?;
        check_status(resp, "telegram").await
    }
}

// ── Discord ─────────────────────────────────────────────────────────────────

pub struct DiscordSink {
    http: reqwest::Client,
    webhook_url: String,
}

impl DiscordSink {
    pub fn new(webhook_url: String) -> Self {
        Self {
            http: http_client(),
            webhook_url,
        }
    }
}

#[async_trait]
impl AlertSink for DiscordSink {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, message: &str) -> Result<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "content": message }))
            .send()
            .await
            .context("discord webhook request failed")?;
        check_status(resp, "discord").await
    }
}

// ── LINE Notify ─────────────────────────────────────────────────────────────

pub struct LineNotifySink {
    http: reqwest::Client,
    token: String,
}

impl LineNotifySink {
    pub fn new(token: String) -> Self {
        Self {
            http: http_client(),
            token,
        }
    }
}

#[async_trait]
impl AlertSink for LineNotifySink {
    fn name(&self) -> &'static str {
        "line"
    }

    async fn send(&self, message: &str) -> Result<()> {
        let resp = self
            .http
            .post(LINE_NOTIFY_API)
            .bearer_auth(&self.token)
            .form(&[("message", message)])
            .send()
            .await
            .context("LINE notify request failed")?;
        check_status(resp, "line").await
    }
}
