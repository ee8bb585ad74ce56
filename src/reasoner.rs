// ===============================
// src/reasoner.rs
// ===============================
//
// The negotiation reasoner seam. The orchestrator only sees this trait:
// transcript + tool schema in, text/tool-call blocks out. The live
// implementation speaks the Anthropic messages API; the mock one is a
// deterministic script. Keeping the seam here is what makes the
// orchestration loop testable without a network.
//

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReasonerError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider: {0}")]
    Provider(String),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Declared tool, anthropic-style JSON schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// A structured instruction returned by the reasoner, mapped onto a
/// local state-mutating handler.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub enum ReplyBlock {
    Text(String),
    ToolUse(ToolCall),
}

#[derive(Debug, Clone)]
pub struct ReasonerReply {
    pub blocks: Vec<ReplyBlock>,
    /// True when the reasoner finished its turn without requesting tools.
    pub end_turn: bool,
}

/// Accumulating negotiation transcript.
#[derive(Debug, Clone)]
pub enum TranscriptMsg {
    User(String),
    Assistant(Vec<ReplyBlock>),
    /// (tool_use_id, result) pairs fed back as the next user turn.
    ToolResults(Vec<(String, Value)>),
}

#[async_trait]
pub trait NegotiationReasoner: Send + Sync {
    async fn propose(
        &self,
        system: &str,
        transcript: &[TranscriptMsg],
        tools: &[ToolSpec],
    ) -> Result<ReasonerReply, ReasonerError>;
}

/// The six auction tools offered to the reasoner.
pub fn auction_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "check_mandi_price",
            description: "Check the current market/mandi price for a fish species in a region",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "species": { "type": "string", "description": "Fish species name" },
                    "region": { "type": "string", "description": "Market region" }
                },
                "required": ["species", "region"]
            }),
        },
        ToolSpec {
            name: "calculate_fuel_cost",
            description: "Calculate fuel cost to reach a harbor",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "harbor": { "type": "string", "description": "Harbor name" }
                },
                "required": ["harbor"]
            }),
        },
        ToolSpec {
            name: "place_bid",
            description: "Record a buyer's bid in the system",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "buyer_id": { "type": "string", "description": "Buyer identifier" },
                    "buyer_name": { "type": "string", "description": "Buyer display name" },
                    "amount_per_kg": { "type": "number", "description": "Bid amount per kg in INR" },
                    "channel": {
                        "type": "string",
                        "enum": ["whatsapp", "telegram"],
                        "description": "Communication channel"
                    }
                },
                "required": ["buyer_id", "buyer_name", "amount_per_kg", "channel"]
            }),
        },
        ToolSpec {
            name: "reject_and_counter",
            description: "Reject a bid and send a counter-offer",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "buyer_id": { "type": "string", "description": "Buyer identifier" },
                    "counter_amount": { "type": "number", "description": "Counter-offer amount per kg" },
                    "reason": { "type": "string", "description": "Reason for rejection" }
                },
                "required": ["buyer_id", "counter_amount", "reason"]
            }),
        },
        ToolSpec {
            name: "accept_deal",
            description: "Accept a buyer's bid as the final deal",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "buyer_id": { "type": "string", "description": "Buyer identifier" },
                    "final_amount": { "type": "number", "description": "Final agreed amount per kg" }
                },
                "required": ["buyer_id", "final_amount"]
            }),
        },
        ToolSpec {
            name: "trigger_liquidation",
            description: "Trigger liquidation mode when no acceptable bids received before deadline",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Reason for liquidation" }
                },
                "required": ["reason"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_schema_names() {
        let names: Vec<_> = auction_tools().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "check_mandi_price",
                "calculate_fuel_cost",
                "place_bid",
                "reject_and_counter",
                "accept_deal",
                "trigger_liquidation"
            ]
        );
    }
}
