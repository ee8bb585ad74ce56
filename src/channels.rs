// ===============================
// src/channels.rs
// ===============================
//
// Outbound buyer messaging. LiveChannels talks to Twilio (WhatsApp/SMS)
// and Telegram; MockChannels records instead of sending so the demo and
// tests run without credentials. Send failures are logged and counted,
// never propagated into the auction loop.
//

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Args;
use crate::domain::BidChannel;
use crate::metrics::CHANNEL_SENDS;

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Deliver one message to one recipient over the given channel.
    async fn send(&self, channel: BidChannel, recipient: &str, text: &str);

    /// Fan a message out to every registered buyer contact.
    async fn broadcast(&self, text: &str);
}

/// The flash-sale announcement pushed to buyers when a lot is liquidated.
pub fn compose_flash_sale(
    species: &str,
    weight_kg: f64,
    price_per_kg: f64,
    deadline: DateTime<Utc>,
) -> String {
    let ist = FixedOffset::east_opt(5 * 3600 + 1800).expect("fixed IST offset");
    format!(
        "🔥 FLASH SALE: {:.0} kg {} at ₹{:.0}/kg, first come first served. \
         Reply BUY to claim. Offer closes {} IST.",
        weight_kg,
        species,
        price_per_kg,
        deadline.with_timezone(&ist).format("%H:%M")
    )
}

// ---------- live ----------

pub struct LiveChannels {
    http: reqwest::Client,
    twilio_account_sid: String,
    twilio_auth_token: String,
    twilio_whatsapp_from: String,
    twilio_sms_from: String,
    telegram_bot_token: String,
    telegram_channel_id: String,
    /// WhatsApp numbers of the buyer directory, used for broadcasts.
    buyer_contacts: Vec<String>,
}

impl LiveChannels {
    pub fn new(args: &Args, buyer_contacts: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            twilio_account_sid: args.twilio_account_sid.clone(),
            twilio_auth_token: args.twilio_auth_token.clone(),
            twilio_whatsapp_from: args.twilio_whatsapp_number.clone(),
            twilio_sms_from: args.twilio_sms_number.clone(),
            telegram_bot_token: args.telegram_bot_token.clone(),
            telegram_channel_id: args.telegram_channel_id.clone(),
            buyer_contacts,
        }
    }

    async fn send_twilio(&self, from: &str, to: &str, text: &str) -> Result<(), String> {
        if self.twilio_account_sid.is_empty() {
            return Err("twilio not configured".to_string());
        }
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.twilio_account_sid
        );
        let body = format!(
            "From={}&To={}&Body={}",
            urlencoding::encode(from),
            urlencoding::encode(to),
            urlencoding::encode(text)
        );
        let rsp = self
            .http
            .post(&url)
            .basic_auth(&self.twilio_account_sid, Some(&self.twilio_auth_token))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if rsp.status().is_success() {
            Ok(())
        } else {
            Err(format!("twilio status {}", rsp.status()))
        }
    }

    async fn send_telegram(&self, text: &str) -> Result<(), String> {
        if self.telegram_bot_token.is_empty() {
            return Err("telegram not configured".to_string());
        }
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.telegram_bot_token
        );
        let rsp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.telegram_channel_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if rsp.status().is_success() {
            Ok(())
        } else {
            Err(format!("telegram status {}", rsp.status()))
        }
    }
}

#[async_trait]
impl ChannelSender for LiveChannels {
    async fn send(&self, channel: BidChannel, recipient: &str, text: &str) {
        let result = match channel {
            BidChannel::Whatsapp => {
                let to = if recipient.starts_with("whatsapp:") {
                    recipient.to_string()
                } else {
                    format!("whatsapp:{recipient}")
                };
                self.send_twilio(&self.twilio_whatsapp_from, &to, text).await
            }
            BidChannel::Telegram => self.send_telegram(text).await,
            // UI bids have no outbound leg; SMS reuses the Twilio trunk.
            BidChannel::Ui => {
                self.send_twilio(&self.twilio_sms_from, recipient, text).await
            }
        };
        match result {
            Ok(()) => {
                CHANNEL_SENDS.with_label_values(&[channel.as_str(), "ok"]).inc();
                debug!(channel = channel.as_str(), recipient, "message sent");
            }
            Err(err) => {
                CHANNEL_SENDS.with_label_values(&[channel.as_str(), "error"]).inc();
                warn!(channel = channel.as_str(), recipient, %err, "message send failed");
            }
        }
    }

    async fn broadcast(&self, text: &str) {
        for contact in &self.buyer_contacts {
            self.send(BidChannel::Whatsapp, contact, text).await;
        }
        if !self.telegram_bot_token.is_empty() {
            self.send(BidChannel::Telegram, &self.telegram_channel_id.clone(), text).await;
        }
    }
}

// ---------- mock ----------

#[derive(Default)]
pub struct MockChannels {
    pub sent: Arc<Mutex<Vec<(BidChannel, String, String)>>>,
    pub broadcasts: Arc<Mutex<Vec<String>>>,
}

impl MockChannels {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelSender for MockChannels {
    async fn send(&self, channel: BidChannel, recipient: &str, text: &str) {
        CHANNEL_SENDS.with_label_values(&[channel.as_str(), "ok"]).inc();
        debug!(channel = channel.as_str(), recipient, "mock send");
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel, recipient.to_string(), text.to_string()));
    }

    async fn broadcast(&self, text: &str) {
        debug!("mock broadcast");
        self.broadcasts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }
}
