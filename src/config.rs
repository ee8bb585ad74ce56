// ===============================
// src/config.rs
// ===============================
use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use dotenvy::dotenv;

/// Which negotiation reasoner backs the auction loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReasonerMode {
    Mock,
    Anthropic,
}

impl ReasonerMode {
    pub fn from_env(key: &str, default_mode: ReasonerMode) -> ReasonerMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => ReasonerMode::Mock,
            "anthropic" => ReasonerMode::Anthropic,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonerMode::Mock => "mock",
            ReasonerMode::Anthropic => "anthropic",
        }
    }
}

/// Which messaging adapters are wired up (live providers vs. logged simulation).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    Mock,
    Live,
}

impl ChannelMode {
    pub fn from_env(key: &str, default_mode: ChannelMode) -> ChannelMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => ChannelMode::Mock,
            "live" => ChannelMode::Live,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelMode::Mock => "mock",
            ChannelMode::Live => "live",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "fishbid", about = "async fish-auction negotiation engine")]
struct Cli {
    /// HTTP API port (overrides API_PORT)
    #[arg(long)]
    api_port: Option<u16>,
    /// Prometheus exporter port (overrides METRICS_PORT)
    #[arg(long)]
    metrics_port: Option<u16>,
    /// JSONL event audit file (overrides RECORD_FILE)
    #[arg(long)]
    record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub api_port: u16,
    pub metrics_port: u16,
    pub record_file: Option<String>,

    pub reasoner_mode: ReasonerMode,
    pub channel_mode: ChannelMode,

    // Anthropic messages API (reasoner + vision)
    pub anthropic_api_key: String,
    pub anthropic_base_url: String,
    pub anthropic_model: String,

    // Twilio (WhatsApp + SMS)
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_whatsapp_number: String,
    pub twilio_sms_number: String,

    // Telegram bot
    pub telegram_bot_token: String,
    pub telegram_channel_id: String,

    // Sarvam speech API
    pub sarvam_api_key: String,
    pub sarvam_base_url: String,
}

/// Orchestration knobs. Defaults match the demo behaviour; tests override.
#[derive(Clone, Debug)]
pub struct Tuning {
    /// Reasoning-round bound before forced liquidation.
    pub max_rounds: u32,
    /// PendingDeal auto-approval window.
    pub approval_window: Duration,
    /// Deadline watcher poll interval.
    pub deadline_poll: Duration,
    /// Artificial delay between streamed log lines (UI animation only).
    pub log_pace: Duration,
    /// Pause after announcing a tool call (UI animation only).
    pub tool_pace: Duration,
    /// Risk buffer in basis points of gross.
    pub risk_buffer_bps: u32,
    /// Initial countdown gauge (seconds).
    pub countdown_start: u32,
    /// Active-thread gauge shown while the auction is live.
    pub thread_gauge: u32,
    /// Hard sale deadline, local time of day (IST).
    pub deadline_hour: u32,
    pub deadline_minute: u32,
    /// When set, a counter marks the rejected bid COUNTERED with the
    /// counter amount instead of plain REJECTED.
    pub counter_marks_bid: bool,
    /// Test hook: absolute deadline instead of the 3:30 PM rule.
    pub deadline_override: Option<DateTime<Utc>>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            approval_window: Duration::from_secs(120),
            deadline_poll: Duration::from_secs(30),
            log_pace: Duration::from_millis(300),
            tool_pace: Duration::from_millis(500),
            risk_buffer_bps: 300,
            countdown_start: 420,
            thread_gauge: 5,
            deadline_hour: 15,
            deadline_minute: 30,
            counter_marks_bid: false,
            deadline_override: None,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

pub fn load() -> (Args, Tuning) {
    let _ = dotenv();
    let cli = Cli::parse();

    let api_port = cli
        .api_port
        .or_else(|| env::var("API_PORT").ok().and_then(|s| s.parse().ok()))
        .unwrap_or(5000);
    let metrics_port = cli
        .metrics_port
        .or_else(|| env::var("METRICS_PORT").ok().and_then(|s| s.parse().ok()))
        .unwrap_or(9898);
    let record_file = cli.record_file.or_else(|| env::var("RECORD_FILE").ok());

    let anthropic_api_key = env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    // No key -> scripted reasoner, same as the unconfigured messaging adapters.
    let default_reasoner = if anthropic_api_key.is_empty() {
        ReasonerMode::Mock
    } else {
        ReasonerMode::Anthropic
    };
    let reasoner_mode = ReasonerMode::from_env("REASONER_MODE", default_reasoner);
    let channel_mode = ChannelMode::from_env("CHANNEL_MODE", ChannelMode::Mock);

    let args = Args {
        api_port,
        metrics_port,
        record_file,
        reasoner_mode,
        channel_mode,
        anthropic_api_key,
        anthropic_base_url: env::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
        anthropic_model: env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-5".to_string()),
        twilio_account_sid: env::var("TWILIO_ACCOUNT_SID").unwrap_or_default(),
        twilio_auth_token: env::var("TWILIO_AUTH_TOKEN").unwrap_or_default(),
        twilio_whatsapp_number: env::var("TWILIO_WHATSAPP_NUMBER")
            .unwrap_or_else(|_| "whatsapp:+14155238886".to_string()),
        twilio_sms_number: env::var("TWILIO_SMS_NUMBER").unwrap_or_default(),
        telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
        telegram_channel_id: env::var("TELEGRAM_CHANNEL_ID").unwrap_or_default(),
        sarvam_api_key: env::var("SARVAM_API_KEY").unwrap_or_default(),
        sarvam_base_url: env::var("SARVAM_BASE_URL")
            .unwrap_or_else(|_| "https://api.sarvam.ai".to_string()),
    };

    let mut tuning = Tuning::default();
    if let Some(n) = env_u64("MAX_ROUNDS") {
        tuning.max_rounds = n as u32;
    }
    if let Some(s) = env_u64("APPROVAL_WINDOW_SECS") {
        tuning.approval_window = Duration::from_secs(s);
    }
    if let Some(s) = env_u64("DEADLINE_POLL_SECS") {
        tuning.deadline_poll = Duration::from_secs(s);
    }
    if let Some(ms) = env_u64("LOG_PACE_MS") {
        tuning.log_pace = Duration::from_millis(ms);
    }
    if let Some(bps) = env_u64("RISK_BUFFER_BPS") {
        tuning.risk_buffer_bps = bps as u32;
    }
    if let Ok(v) = env::var("COUNTER_MARKS_BID") {
        tuning.counter_marks_bid = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }

    (args, tuning)
}
