//! Telegram Bot API transport: outbound messages and the getUpdates poll loop

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{CommandHandler, Notifier, COMMAND_MENU};
use crate::config::TelegramConfig;

/// Pause after a failed poll before retrying
const POLL_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Serialize)]
struct BotCommand<'a> {
    command: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

pub struct TelegramClient {
    client: Client,
    base_url: String,
    chat_id: String,
    poll_timeout_secs: u64,
}

impl TelegramClient {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str, poll_timeout_secs: u64) -> Result<Self> {
        // Must outlive the long-poll window
        let client = Client::builder()
            .timeout(Duration::from_secs(poll_timeout_secs + 5))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token),
            chat_id: chat_id.trim().to_string(),
            poll_timeout_secs,
        })
    }

    /// Build from config with `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`
    pub fn from_config(cfg: &TelegramConfig) -> Result<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN not set")?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").context("TELEGRAM_CHAT_ID not set")?;
        Self::new(&cfg.api_url, &token, &chat_id, cfg.poll_timeout_secs)
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "Markdown",
        };
        let response: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&request)
            .send()
            .await
            .context("sendMessage request failed")?
            .json()
            .await
            .context("sendMessage response is not JSON")?;
        if !response.ok {
            bail!(
                "sendMessage rejected: {}",
                response.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Publish the command menu to the chat client
    pub async fn register_commands(&self) -> Result<()> {
        let commands: Vec<BotCommand> = COMMAND_MENU
            .iter()
            .map(|&(command, description)| BotCommand {
                command,
                description,
            })
            .collect();
        let response: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/setMyCommands", self.base_url))
            .json(&serde_json::json!({ "commands": commands }))
            .send()
            .await
            .context("setMyCommands request failed")?
            .json()
            .await?;
        if !response.ok {
            bail!(
                "setMyCommands rejected: {}",
                response.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let response: ApiResponse<Vec<Update>> = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout_secs.to_string()),
            ])
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates response is not JSON")?;
        if !response.ok {
            bail!(
                "getUpdates rejected: {}",
                response.description.unwrap_or_default()
            );
        }
        Ok(response.result.unwrap_or_default())
    }

    /// Text of messages addressed from the configured chat
    fn accepted_text(&self, update: Update) -> Option<String> {
        let message = update.message?;
        if message.chat.id.to_string() != self.chat_id {
            warn!(chat_id = message.chat.id, "ignoring message from foreign chat");
            return None;
        }
        message.text
    }

    /// Long-poll for operator commands until `shutdown` flips to true
    pub async fn run_command_loop(
        self: Arc<Self>,
        handler: Arc<CommandHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.register_commands().await {
            warn!(error = %e, "Failed to register command menu");
        }
        info!("📨 Command loop started");

        let mut offset = 0i64;
        loop {
            let updates = tokio::select! {
                _ = shutdown.changed() => break,
                res = self.get_updates(offset) => res,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let Some(text) = self.accepted_text(update) else {
                            continue;
                        };
                        let now = crate::engine::now_ms();
                        if let Some(reply) = handler.handle_text(&text, now).await {
                            if let Err(e) = self.send_message(&reply).await {
                                error!(error = %e, "Failed to send command reply");
                            }
                        } else {
                            debug!(text = %text, "not a command");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Command poll failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(POLL_BACKOFF) => {}
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }
        info!("Command loop stopped");
    }
}

#[async_trait]
impl Notifier for TelegramClient {
    async fn notify(&self, text: &str) {
        match self.send_message(text).await {
            Ok(()) => debug!("Telegram message delivered"),
            Err(e) => error!(error = %e, "Telegram message failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TelegramClient {
        TelegramClient::new("https://api.telegram.org/", "123:abc", "42", 10).unwrap()
    }

    #[test]
    fn builds_bot_url() {
        assert_eq!(client().base_url, "https://api.telegram.org/bot123:abc");
    }

    #[test]
    fn decodes_updates_and_filters_foreign_chats() {
        let body = r#"{"ok":true,"result":[
            {"update_id":7,"message":{"message_id":1,"chat":{"id":42,"type":"private"},"text":"/status"}},
            {"update_id":8,"message":{"message_id":2,"chat":{"id":99,"type":"private"},"text":"/kill"}},
            {"update_id":9,"edited_message":{"message_id":3,"chat":{"id":42}}}
        ]}"#;
        let parsed: ApiResponse<Vec<Update>> = serde_json::from_str(body).unwrap();
        assert!(parsed.ok);
        let updates = parsed.result.unwrap();
        assert_eq!(updates.len(), 3);

        let c = client();
        let texts: Vec<Option<String>> = updates.into_iter().map(|u| c.accepted_text(u)).collect();
        assert_eq!(texts, vec![Some("/status".to_string()), None, None]);
    }
}
