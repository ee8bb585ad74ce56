// ===============================
// src/voice.rs
// ===============================
//
// Malayalam voice interface over the Sarvam speech APIs. Without an API
// key every call degrades to a canned offline response so the voice flow
// stays demoable.
//

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::config::Args;

const OFFLINE_TRANSCRIPT: &str = "കരിമീൻ 45 കിലോ ഉണ്ട്, ലേലം തുടങ്ങൂ";

static WEIGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(?:കിലോ|kg|kilo)").expect("weight regex"));

/// Species keywords we accept from a skipper's voice note, Malayalam first.
static SPECIES_WORDS: &[(&str, &str)] = &[
    ("കരിമീൻ", "Pearl Spot"),
    ("ചെമ്മീൻ", "Tiger Prawns"),
    ("അയല", "Indian Mackerel"),
    ("മത്തി", "Sardine"),
    ("നെയ്‌മീൻ", "King Mackerel"),
    ("ആവോലി", "Silver Pomfret"),
    ("karimeen", "Pearl Spot"),
    ("chemmeen", "Tiger Prawns"),
    ("ayala", "Indian Mackerel"),
    ("mathi", "Sardine"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceCommand {
    pub species: String,
    pub weight_kg: f64,
    pub start_auction: bool,
}

/// Extract a catch declaration from a transcript. `None` when no species
/// keyword is present.
pub fn parse_voice_command(transcript: &str) -> Option<VoiceCommand> {
    let lower = transcript.to_lowercase();
    let species = SPECIES_WORDS
        .iter()
        .find(|(word, _)| lower.contains(&word.to_lowercase()))
        .map(|(_, english)| english.to_string())?;
    let weight_kg = WEIGHT_RE
        .captures(transcript)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(25.0);
    let start_auction = ["ലേലം", "auction", "start", "തുടങ്ങ"]
        .iter()
        .any(|w| lower.contains(&w.to_lowercase()));
    Some(VoiceCommand { species, weight_kg, start_auction })
}

/// Malayalam confirmation read back to the skipper once a deal closes.
pub fn deal_confirmation(buyer_name: &str, amount_per_kg: f64, net: f64) -> String {
    format!(
        "{buyer_name} കിലോയ്ക്ക് {amount_per_kg:.0} രൂപയ്ക്ക് വാങ്ങി. \
         ഇന്ധനച്ചെലവ് കഴിച്ച് {net:.0} രൂപ കിട്ടും. ഡീൽ ഉറപ്പിച്ചു."
    )
}

pub struct VoiceClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl VoiceClient {
    pub fn new(args: &Args) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key: args.sarvam_api_key.clone(),
            base_url: args.sarvam_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn offline(&self) -> bool {
        self.api_key.is_empty()
    }

    /// Speech to text. Offline mode returns a fixed Malayalam sample.
    pub async fn transcribe(&self, audio_base64: &str) -> String {
        if self.offline() {
            return OFFLINE_TRANSCRIPT.to_string();
        }
        let rsp = self
            .http
            .post(format!("{}/speech-to-text", self.base_url))
            .header("api-subscription-key", &self.api_key)
            .json(&json!({
                "audio": audio_base64,
                "language_code": "ml-IN",
                "model": "saarika:v2",
            }))
            .send()
            .await;
        match Self::extract(rsp, "transcript").await {
            Some(text) => text,
            None => {
                warn!("speech-to-text failed, using offline transcript");
                OFFLINE_TRANSCRIPT.to_string()
            }
        }
    }

    /// Indic text to English. Pass-through when unconfigured or failing.
    pub async fn translate(&self, text: &str) -> String {
        if self.offline() {
            return text.to_string();
        }
        let rsp = self
            .http
            .post(format!("{}/translate", self.base_url))
            .header("api-subscription-key", &self.api_key)
            .json(&json!({
                "input": text,
                "source_language_code": "ml-IN",
                "target_language_code": "en-IN",
                "mode": "formal",
                "model": "mayura:v1",
            }))
            .send()
            .await;
        match Self::extract(rsp, "translated_text").await {
            Some(t) => t,
            None => {
                warn!("translation failed, keeping the source text");
                text.to_string()
            }
        }
    }

    /// Text to speech, base64 audio. Empty string when unavailable.
    pub async fn synthesize(&self, text: &str) -> String {
        if self.offline() {
            return String::new();
        }
        let rsp = self
            .http
            .post(format!("{}/text-to-speech", self.base_url))
            .header("api-subscription-key", &self.api_key)
            .json(&json!({
                "inputs": [text],
                "target_language_code": "ml-IN",
                "speaker": "meera",
            }))
            .send()
            .await;
        match rsp {
            Ok(r) => {
                let body: Value = r.json().await.unwrap_or(Value::Null);
                body.get("audios")
                    .and_then(|a| a.as_array())
                    .and_then(|a| a.first())
                    .and_then(|a| a.as_str())
                    .unwrap_or_default()
                    .to_string()
            }
            Err(err) => {
                warn!(%err, "text-to-speech failed");
                String::new()
            }
        }
    }

    async fn extract(
        rsp: Result<reqwest::Response, reqwest::Error>,
        field: &str,
    ) -> Option<String> {
        let body: Value = rsp.ok()?.json().await.ok()?;
        body.get(field).and_then(|t| t.as_str()).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malayalam_catch_declaration_parses() {
        let cmd = parse_voice_command("കരിമീൻ 45 കിലോ ഉണ്ട്, ലേലം തുടങ്ങൂ").unwrap();
        assert_eq!(cmd.species, "Pearl Spot");
        assert_eq!(cmd.weight_kg, 45.0);
        assert!(cmd.start_auction);
    }

    #[test]
    fn romanized_and_unknown_inputs() {
        let cmd = parse_voice_command("chemmeen 12 kg").unwrap();
        assert_eq!(cmd.species, "Tiger Prawns");
        assert_eq!(cmd.weight_kg, 12.0);
        assert!(!cmd.start_auction);

        assert!(parse_voice_command("good morning").is_none());
    }

    #[tokio::test]
    async fn offline_translate_is_a_pass_through() {
        let client = VoiceClient {
            http: reqwest::Client::new(),
            api_key: String::new(),
            base_url: String::new(),
        };
        assert!(client.offline());
        assert_eq!(client.translate("കരിമീൻ 45 കിലോ").await, "കരിമീൻ 45 കിലോ");
        assert_eq!(client.transcribe("zz").await, OFFLINE_TRANSCRIPT);
    }

    #[test]
    fn weight_defaults_when_missing() {
        let cmd = parse_voice_command("മത്തി ഉണ്ട്").unwrap();
        assert_eq!(cmd.species, "Sardine");
        assert_eq!(cmd.weight_kg, 25.0);
    }
}
