//! Telegram notification adapter.
//!
//! A channel whose engagement index exceeds its category average triggers an
//! alert message. Delivery failures are never escalated: the message and the
//! failure reason are appended to a durable log file and processing of the
//! remaining channels continues.

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use tgrank_core::{format_signed_percent, RankedChannel};
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const CRATE_NAME: &str = "tgrank-notify";

/// Delivery result of one `sendMessage` call. Failures carry the Bot API
/// error code and description; transport-level failures use code 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered,
    Failed { code: i64, description: String },
}

impl NotifyOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, NotifyOutcome::Delivered)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

/// Maps a Bot API response body to an outcome. An unparseable body is a
/// failure too; the caller logs it rather than dropping the message.
fn outcome_from_body(body: &str) -> NotifyOutcome {
    match serde_json::from_str::<ApiResponse>(body) {
        Ok(resp) if resp.ok => NotifyOutcome::Delivered,
        Ok(resp) => NotifyOutcome::Failed {
            code: resp.error_code.unwrap_or(0),
            description: resp
                .description
                .unwrap_or_else(|| "no description".to_string()),
        },
        Err(err) => NotifyOutcome::Failed {
            code: 0,
            description: format!("unparseable api response: {err}"),
        },
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub failure_log: PathBuf,
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    config: NotifierConfig,
}

impl TelegramNotifier {
    pub fn new(config: NotifierConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building telegram client")?;
        Ok(Self { client, config })
    }

    /// Both token and chat id must be set for delivery to be attempted.
    pub fn is_configured(&self) -> bool {
        !self.config.bot_token.is_empty() && !self.config.chat_id.is_empty()
    }

    pub async fn send(&self, text: &str) -> NotifyOutcome {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.config.bot_token
        );
        let params = [
            ("chat_id", self.config.chat_id.as_str()),
            ("text", text),
            ("parse_mode", "HTML"),
        ];

        let response = match self.client.post(&url).form(&params).send().await {
            Ok(resp) => resp,
            Err(err) => {
                return NotifyOutcome::Failed {
                    code: 0,
                    description: format!("transport error: {err}"),
                }
            }
        };

        match response.text().await {
            Ok(body) => outcome_from_body(&body),
            Err(err) => NotifyOutcome::Failed {
                code: 0,
                description: format!("reading api response: {err}"),
            },
        }
    }

    /// Durably record an undelivered message and its failure reason.
    pub async fn log_failure(&self, message: &str, outcome: &NotifyOutcome) -> anyhow::Result<()> {
        let NotifyOutcome::Failed { code, description } = outcome else {
            return Ok(());
        };
        warn!(code, description, "notification delivery failed");

        let entry = format!(
            "[{}] delivery failed ({code}: {description})\n{message}\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.failure_log)
            .await
            .with_context(|| {
                format!(
                    "opening failure log {}",
                    self.config.failure_log.display()
                )
            })?;
        file.write_all(entry.as_bytes())
            .await
            .with_context(|| {
                format!(
                    "appending to failure log {}",
                    self.config.failure_log.display()
                )
            })?;
        Ok(())
    }
}

/// Alert text for a channel above its category average.
pub fn alert_message(channel: &RankedChannel) -> String {
    format!(
        "<b>{}</b> имеет вовлеченность выше среднего в категории <b>{}</b> на <b>{}</b>\nСсылка: {}",
        channel.name,
        channel.category,
        format_signed_percent(channel.category_delta_percent),
        channel.url
    )
}
