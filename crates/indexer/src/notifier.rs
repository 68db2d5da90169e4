//! Cursor-ordered scan of activity windows, raising an alert for every
//! window whose combined activity exceeds the threshold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use ledgerwatch_core::telemetry::ALERT_TARGET;
use ledgerwatch_core::{AppError, Settings, period};
use ledgerwatch_storage::Ledger;
use ledgerwatch_storage::models::AccountActivity;
use reqwest::Client;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const SLOW_TICK: Duration = Duration::from_secs(5);
const TELEGRAM_RETRIES: u32 = 3;
const TELEGRAM_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub activity_id: i64,
    pub address: String,
    pub period: NaiveDateTime,
    pub transaction_count: i64,
    pub token_transfers: i64,
    pub volume: String,
}

impl From<&AccountActivity> for Alert {
    fn from(row: &AccountActivity) -> Self {
        Self {
            activity_id: row.id,
            address: row.address.clone(),
            period: row.period,
            transaction_count: row.transaction_count,
            token_transfers: row.token_transfers,
            volume: row.volume_eth.clone(),
        }
    }
}

impl Alert {
    /// Human-readable chat message (Telegram HTML).
    pub fn message(&self) -> String {
        format!(
            "🚨 <b>High account activity</b>\n\n\
             <b>Address:</b> <code>{}</code>\n\
             <b>Window:</b> {} – {} UTC\n\
             <b>Transactions:</b> {}\n\
             <b>Token transfers:</b> {}\n\
             <b>Volume:</b> {} wei",
            self.address,
            self.period.format("%Y-%m-%d %H:%M:%S"),
            period::period_end(self.period).format("%H:%M:%S"),
            self.transaction_count,
            self.token_transfers,
            self.volume,
        )
    }
}

/// Destination for alerts. Delivery is at-least-once at best.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), AppError>;
}

/// Structured log line on the `alerts` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AppError> {
        tracing::warn!(
            target: ALERT_TARGET,
            address = %alert.address,
            period = %alert.period,
            transaction_count = alert.transaction_count,
            token_transfers = alert.token_transfers,
            volume = %alert.volume,
            "High account activity"
        );
        Ok(())
    }
}

/// Telegram `sendMessage` with bounded retries.
pub struct TelegramSink {
    client: Client,
    api_base: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::Config(format!("telegram client: {e}")))?;
        Ok(Self {
            client,
            api_base: format!("https://api.telegram.org/bot{bot_token}"),
            chat_id: chat_id.to_string(),
        })
    }

    /// `None` unless both the bot token and chat id are set.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>, AppError> {
        if settings.telegram_bot_token.is_empty() || settings.telegram_chat_id.is_empty() {
            return Ok(None);
        }
        Self::new(&settings.telegram_bot_token, &settings.telegram_chat_id).map(Some)
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AppError> {
        let body = json!({
            "chat_id": self.chat_id,
            "text": alert.message(),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let mut last_error = String::new();
        for attempt in 0..TELEGRAM_RETRIES {
            match self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_error = format!("status {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(
                attempt = attempt + 1,
                max = TELEGRAM_RETRIES,
                error = %last_error,
                "Telegram send failed"
            );
            if attempt + 1 < TELEGRAM_RETRIES {
                tokio::time::sleep(TELEGRAM_RETRY_DELAY * (attempt + 1)).await;
            }
        }
        Err(AppError::Rpc(format!(
            "telegram send failed after {TELEGRAM_RETRIES} attempts: {last_error}"
        )))
    }
}

pub struct Notifier {
    ledger: Arc<dyn Ledger>,
    sinks: Vec<Box<dyn AlertSink>>,
    threshold: i64,
    batch_size: i64,
}

impl Notifier {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        sinks: Vec<Box<dyn AlertSink>>,
        threshold: i64,
        batch_size: i64,
    ) -> Self {
        Self {
            ledger,
            sinks,
            threshold,
            batch_size: batch_size.max(1),
        }
    }

    /// Tick every `interval`, optionally starting on the next period boundary.
    pub async fn run(self, interval: Duration, align_to_period: bool, cancel: CancellationToken) {
        if align_to_period {
            let wait = period::until_next_boundary(Utc::now().naive_utc());
            tracing::info!(wait_ms = wait.as_millis() as u64, "Aligning notifier to period boundary");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Notification tick failed");
            }
        }
        tracing::info!("Notifier stopped");
    }

    /// Evaluate the next batch of activity rows past the cursor, then move
    /// the cursor to the highest id seen. Returns the number of alerts.
    pub async fn tick(&self) -> Result<usize, AppError> {
        let started = Instant::now();
        let cursor = self.ledger.get_activity_cursor().await?;
        let rows = self.ledger.activities_after(cursor, self.batch_size).await?;
        let Some(last_id) = rows.iter().map(|row| row.id).max() else {
            return Ok(0);
        };

        let mut alerts = 0;
        for row in rows.iter().filter(|row| row.total_events() > self.threshold) {
            self.raise(&Alert::from(row)).await;
            alerts += 1;
        }

        self.ledger.advance_activity_cursor(last_id).await?;

        let elapsed = started.elapsed();
        if elapsed > SLOW_TICK {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, rows = rows.len(), "Slow notification tick");
        }
        tracing::debug!(cursor = last_id, rows = rows.len(), alerts, "Notification batch processed");
        Ok(alerts)
    }

    async fn raise(&self, alert: &Alert) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(alert).await {
                tracing::error!(sink = sink.name(), address = %alert.address, error = %e, "Alert delivery failed");
            }
        }
    }
}
