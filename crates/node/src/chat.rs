//! Telegram bot API client used for operator notifications and polled
//! commands.
//!
//! Polling asks for one update at a time, starting after the last update id
//! seen, so every message is handed out exactly once per boot.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ChatConfig;
use crate::ports::ChatLink;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub(crate) struct TelegramChat {
    http: reqwest::Client,
    base: String,
    chat_id: String,
    poll_timeout: Duration,
    last_update_id: i64,
}

impl TelegramChat {
    pub(crate) fn new(cfg: &ChatConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_s))
            .build()
            .context("failed to build chat http client")?;
        Ok(Self {
            http,
            base: format!("{}/bot{}", cfg.api_base.trim_end_matches('/'), cfg.bot_token),
            chat_id: cfg.chat_id.clone(),
            poll_timeout: Duration::from_secs(cfg.poll_timeout_s),
            last_update_id: 0,
        })
    }

    fn updates_url(&self) -> String {
        format!(
            "{}/getUpdates?offset={}&limit=1&timeout={}",
            self.base,
            self.last_update_id + 1,
            self.poll_timeout.as_secs()
        )
    }
}

impl ChatLink for TelegramChat {
    async fn send(&mut self, text: &str) -> Result<()> {
        info!(text, "sending chat message");
        let resp: ApiResponse<serde_json::Value> = self
            .http
            .post(format!("{}/sendMessage", self.base))
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await
            .map_err(redact)
            .context("sendMessage request failed")?
            .json()
            .await
            .map_err(redact)
            .context("sendMessage returned invalid json")?;

        if !resp.ok {
            bail!(
                "sendMessage rejected: {}",
                resp.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<String>> {
        let resp: ApiResponse<Vec<Update>> = self
            .http
            .get(self.updates_url())
            .send()
            .await
            .map_err(redact)
            .context("getUpdates request failed")?
            .json()
            .await
            .map_err(redact)
            .context("getUpdates returned invalid json")?;

        self.accept(resp)
    }
}

/// Request URLs carry the bot token; keep it out of error text and logs.
fn redact(e: reqwest::Error) -> reqwest::Error {
    e.without_url()
}

impl TelegramChat {
    /// Advance the offset past the returned update and extract its text.
    fn accept(&mut self, resp: ApiResponse<Vec<Update>>) -> Result<Option<String>> {
        if !resp.ok {
            bail!(
                "getUpdates rejected: {}",
                resp.description.unwrap_or_default()
            );
        }
        let Some(update) = resp.result.and_then(|r| r.into_iter().next()) else {
            return Ok(None);
        };

        self.last_update_id = update.update_id;
        let text = update.message.and_then(|m| m.text);
        debug!(update_id = update.update_id, text = ?text, "chat update received");
        Ok(text)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
