// ===============================
// src/domain.rs
// ===============================
use chrono::{FixedOffset, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Wall-clock for every user-visible timestamp (IST, UTC+5:30).
pub fn ist_now() -> String {
    let ist = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
    Utc::now().with_timezone(&ist).format("%H:%M:%S").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityGrade {
    A,
    B,
    C,
}

/// One fish lot. Created on photo analysis, read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchRecord {
    pub species: String,
    pub species_local: String,
    pub weight_kg: f64,
    pub quality_grade: QualityGrade,
    pub quality_score: u8,
    pub freshness_hours: f64,
    pub catch_certificate_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarborOption {
    pub name: String,
    pub distance_km: u32,
    pub fuel_cost: i64,
    pub eta_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidChannel {
    Whatsapp,
    Telegram,
    Ui,
}

impl BidChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidChannel::Whatsapp => "whatsapp",
            BidChannel::Telegram => "telegram",
            BidChannel::Ui => "ui",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Some(BidChannel::Whatsapp),
            "telegram" => Some(BidChannel::Telegram),
            "ui" => Some(BidChannel::Ui),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BidSource {
    Agent,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BidStatus {
    Active,
    Rejected,
    Countered,
    Proposed,
    Accepted,
}

impl BidStatus {
    /// Lifecycle lattice: ACTIVE -> {REJECTED | COUNTERED | PROPOSED},
    /// PROPOSED -> ACCEPTED. Nothing else is reachable.
    pub fn can_transition(self, next: BidStatus) -> bool {
        matches!(
            (self, next),
            (BidStatus::Active, BidStatus::Rejected)
                | (BidStatus::Active, BidStatus::Countered)
                | (BidStatus::Active, BidStatus::Proposed)
                | (BidStatus::Proposed, BidStatus::Accepted)
        )
    }
}

/// A buyer's priced offer. Mutated in place by status/amount updates,
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub buyer_id: String,
    pub buyer_name: String,
    pub channel: BidChannel,
    pub source: BidSource,
    pub bid_amount: f64,
    pub gross_value: f64,
    pub net_after_fuel: f64,
    pub agent_action: String,
    pub status: BidStatus,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_amount: Option<f64>,
}

/// Partial in-place update for an existing bid (`bid_update` payload).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BidUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BidStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gross_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_after_fuel: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_amount: Option<f64>,
}

/// Cosmetic narration tags, not separate executing components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentTag {
    Scout,
    Negotiator,
    Auditor,
    Navigator,
    System,
    HumanBid,
}

impl AgentTag {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCOUT" => Some(AgentTag::Scout),
            "NEGOTIATOR" => Some(AgentTag::Negotiator),
            "AUDITOR" => Some(AgentTag::Auditor),
            "NAVIGATOR" => Some(AgentTag::Navigator),
            "SYSTEM" => Some(AgentTag::System),
            "HUMAN_BID" => Some(AgentTag::HumanBid),
            _ => None,
        }
    }
}

/// Append-only narration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: String,
    pub agent: AgentTag,
    pub message: String,
}

impl LogEntry {
    pub fn new(agent: AgentTag, message: impl Into<String>) -> Self {
        let suffix: u32 = rand::thread_rng().gen();
        Self {
            id: format!("log-{}-{:08x}", Utc::now().timestamp_millis(), suffix),
            timestamp: ist_now(),
            agent,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionPhase {
    Idle,
    Scanning,
    AuctionLive,
    AwaitingApproval,
    DealSecured,
    Liquidation,
}

impl AuctionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuctionPhase::DealSecured | AuctionPhase::Liquidation)
    }
}

impl Default for AuctionPhase {
    fn default() -> Self {
        AuctionPhase::Idle
    }
}

/// Aggregate economics, recomputed wholesale on each update (rupees).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Economics {
    pub gross_bid: i64,
    pub fuel_cost: i64,
    pub risk_buffer: i64,
    pub net_profit: i64,
}

impl Economics {
    /// risk buffer = round(bps/10_000 of gross); net = gross - fuel - buffer.
    pub fn derive(gross_bid: i64, fuel_cost: i64, risk_buffer_bps: u32) -> Self {
        let risk_buffer = ((gross_bid as f64) * (risk_buffer_bps as f64) / 10_000.0).round() as i64;
        Self {
            gross_bid,
            fuel_cost,
            risk_buffer,
            net_profit: gross_bid - fuel_cost - risk_buffer,
        }
    }
}

/// A tentatively accepted bid awaiting confirmation before becoming final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDeal {
    pub buyer_id: String,
    pub buyer_name: String,
    pub amount_per_kg: f64,
    pub proposed_at: chrono::DateTime<Utc>,
    pub window_secs: u64,
}

/// Result of a manual or auto approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approved: bool,
    pub auto: bool,
    pub approved_at: String,
    pub buyer_id: String,
    pub amount_per_kg: f64,
    pub approval_hash: String,
}

/// Server-sent event payloads. `type` is the wire discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuctionEvent {
    State {
        state: AuctionPhase,
    },
    Threads {
        count: u32,
    },
    Countdown {
        seconds: u32,
    },
    Deadline {
        deadline: String,
    },
    Harbors {
        harbors: Vec<HarborOption>,
        recommended: HarborOption,
    },
    Log {
        #[serde(flatten)]
        entry: LogEntry,
    },
    Bid {
        bid: Bid,
    },
    BidUpdate {
        bid_id: String,
        updates: BidUpdate,
    },
    Economics {
        data: Economics,
    },
}

impl AuctionEvent {
    /// Metric label per event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AuctionEvent::State { .. } => "state",
            AuctionEvent::Threads { .. } => "threads",
            AuctionEvent::Countdown { .. } => "countdown",
            AuctionEvent::Deadline { .. } => "deadline",
            AuctionEvent::Harbors { .. } => "harbors",
            AuctionEvent::Log { .. } => "log",
            AuctionEvent::Bid { .. } => "bid",
            AuctionEvent::BidUpdate { .. } => "bid_update",
            AuctionEvent::Economics { .. } => "economics",
        }
    }
}

/// Recorder envelope (JSONL audit file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Auction(AuctionEvent),
    Note(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_status_lattice() {
        use BidStatus::*;
        assert!(Active.can_transition(Rejected));
        assert!(Active.can_transition(Countered));
        assert!(Active.can_transition(Proposed));
        assert!(Proposed.can_transition(Accepted));

        assert!(!Active.can_transition(Accepted));
        assert!(!Rejected.can_transition(Active));
        assert!(!Rejected.can_transition(Proposed));
        assert!(!Countered.can_transition(Accepted));
        assert!(!Accepted.can_transition(Proposed));
        assert!(!Proposed.can_transition(Rejected));
    }

    #[test]
    fn economics_derivation() {
        // 445/kg * 40kg = 17800 gross, 3% buffer = 534
        let e = Economics::derive(17_800, 2_100, 300);
        assert_eq!(e.risk_buffer, 534);
        assert_eq!(e.net_profit, 17_800 - 2_100 - 534);
    }

    #[test]
    fn event_wire_shape_has_type_tag() {
        let ev = AuctionEvent::State { state: AuctionPhase::AuctionLive };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "state");
        assert_eq!(v["state"], "AUCTION_LIVE");

        let log = AuctionEvent::Log { entry: LogEntry::new(AgentTag::Scout, "scan") };
        let v = serde_json::to_value(&log).unwrap();
        assert_eq!(v["type"], "log");
        assert_eq!(v["agent"], "SCOUT");
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn agent_tag_parse() {
        assert_eq!(AgentTag::parse("NAVIGATOR"), Some(AgentTag::Navigator));
        assert_eq!(AgentTag::parse("HUMAN_BID"), Some(AgentTag::HumanBid));
        assert_eq!(AgentTag::parse("navigator"), None);
    }
}
