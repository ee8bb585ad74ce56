// ===============================
// src/reasoner_anthropic.rs
// ===============================
//
// Live reasoner: Anthropic messages API with tool use. Errors abort the
// current negotiation iteration only, never the process.
//

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::Args;
use crate::reasoner::{
    NegotiationReasoner, ReasonerError, ReasonerReply, ReplyBlock, ToolCall, ToolSpec,
    TranscriptMsg,
};

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

pub struct AnthropicReasoner {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicReasoner {
    pub fn new(args: &Args) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key: args.anthropic_api_key.clone(),
            base_url: args.anthropic_base_url.trim_end_matches('/').to_string(),
            model: args.anthropic_model.clone(),
        }
    }

    fn messages_payload(
        &self,
        system: &str,
        transcript: &[TranscriptMsg],
        tools: &[ToolSpec],
    ) -> Value {
        let mut messages = Vec::new();
        for msg in transcript {
            match msg {
                TranscriptMsg::User(text) => {
                    messages.push(json!({ "role": "user", "content": text }));
                }
                TranscriptMsg::Assistant(blocks) => {
                    let content: Vec<Value> = blocks
                        .iter()
                        .map(|b| match b {
                            ReplyBlock::Text(t) => json!({ "type": "text", "text": t }),
                            ReplyBlock::ToolUse(tc) => json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.input,
                            }),
                        })
                        .collect();
                    messages.push(json!({ "role": "assistant", "content": content }));
                }
                TranscriptMsg::ToolResults(results) => {
                    let content: Vec<Value> = results
                        .iter()
                        .map(|(id, out)| {
                            json!({
                                "type": "tool_result",
                                "tool_use_id": id,
                                "content": out.to_string(),
                            })
                        })
                        .collect();
                    messages.push(json!({ "role": "user", "content": content }));
                }
            }
        }

        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "tools": tools,
            "messages": messages,
        })
    }

    fn parse_reply(body: Value) -> Result<ReasonerReply, ReasonerError> {
        if let Some(err) = body.get("error") {
            return Err(ReasonerError::Provider(
                err.get("message").and_then(|m| m.as_str()).unwrap_or("unknown").to_string(),
            ));
        }
        let content = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| ReasonerError::Malformed("missing content array".to_string()))?;

        let mut blocks = Vec::new();
        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        blocks.push(ReplyBlock::Text(text.to_string()));
                    }
                }
                Some("tool_use") => {
                    let id = block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .ok_or_else(|| ReasonerError::Malformed("tool_use without id".into()))?;
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| ReasonerError::Malformed("tool_use without name".into()))?;
                    blocks.push(ReplyBlock::ToolUse(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }));
                }
                // Unrecognized block kinds are ignored, not fatal.
                _ => {}
            }
        }

        let end_turn = body.get("stop_reason").and_then(|s| s.as_str()) == Some("end_turn");
        Ok(ReasonerReply { blocks, end_turn })
    }
}

#[async_trait]
impl NegotiationReasoner for AnthropicReasoner {
    async fn propose(
        &self,
        system: &str,
        transcript: &[TranscriptMsg],
        tools: &[ToolSpec],
    ) -> Result<ReasonerReply, ReasonerError> {
        let payload = self.messages_payload(system, transcript, tools);
        debug!(model = %self.model, messages = transcript.len(), "reasoner request");

        let rsp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await?;

        let status = rsp.status();
        let body: Value = rsp.json().await?;
        if !status.is_success() {
            return Err(ReasonerError::Provider(format!("{status}: {body}")));
        }
        Self::parse_reply(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_tool_use_blocks() {
        let body = json!({
            "content": [
                { "type": "text", "text": "[SCOUT] Checking prices" },
                { "type": "tool_use", "id": "toolu_1", "name": "check_mandi_price",
                  "input": { "species": "Pearl Spot", "region": "Kerala" } }
            ],
            "stop_reason": "tool_use"
        });
        let reply = AnthropicReasoner::parse_reply(body).unwrap();
        assert_eq!(reply.blocks.len(), 2);
        assert!(!reply.end_turn);
        match &reply.blocks[1] {
            ReplyBlock::ToolUse(tc) => {
                assert_eq!(tc.name, "check_mandi_price");
                assert_eq!(tc.input["species"], "Pearl Spot");
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn end_turn_and_provider_errors() {
        let done = json!({ "content": [], "stop_reason": "end_turn" });
        assert!(AnthropicReasoner::parse_reply(done).unwrap().end_turn);

        let err = json!({ "error": { "type": "overloaded_error", "message": "Overloaded" } });
        assert!(matches!(
            AnthropicReasoner::parse_reply(err),
            Err(ReasonerError::Provider(m)) if m == "Overloaded"
        ));
    }
}
