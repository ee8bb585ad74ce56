// ===============================
// src/vision.rs
// ===============================
//
// Catch photo analysis. With an API key the photo goes to the Anthropic
// vision endpoint; without one, or on any failure, a conservative default
// record is issued so the auction can still start.
//

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

use crate::config::Args;
use crate::domain::{CatchRecord, QualityGrade};
use crate::market;

const API_VERSION: &str = "2023-06-01";

const VISION_PROMPT: &str = "You are a fish quality inspector at a Kerala harbor. \
Identify the species, estimate total weight in kg, grade the quality A/B/C with a \
0-100 score, and estimate hours since catch from eye clarity and skin sheen. \
Answer with only a JSON object: {\"species\": str, \"weight_kg\": number, \
\"quality_grade\": \"A\"|\"B\"|\"C\", \"quality_score\": number, \"freshness_hours\": number}";

pub struct VisionClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

/// Tamper-evident certificate for a graded lot. Not a chain anchor, just
/// a stable digest of the grading fields plus a nonce.
pub fn certificate_hash(species: &str, weight_kg: f64, score: u8) -> String {
    let nonce: u64 = rand::thread_rng().gen();
    let mut hasher = Sha256::new();
    hasher.update(species.as_bytes());
    hasher.update(weight_kg.to_le_bytes());
    hasher.update([score]);
    hasher.update(Utc::now().timestamp_millis().to_le_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("0x{}", &digest[..40])
}

fn default_record() -> CatchRecord {
    build_record("Unknown Fish", 25.0, QualityGrade::B, 75, 4.0)
}

fn build_record(
    species: &str,
    weight_kg: f64,
    grade: QualityGrade,
    score: u8,
    freshness_hours: f64,
) -> CatchRecord {
    let species_local = market::find_species(species)
        .map(|f| f.malayalam.to_string())
        .unwrap_or_else(|| species.to_string());
    CatchRecord {
        species: species.to_string(),
        species_local,
        weight_kg,
        quality_grade: grade,
        quality_score: score,
        freshness_hours,
        catch_certificate_hash: certificate_hash(species, weight_kg, score),
    }
}

/// Build a record from caller-supplied fields (SMS announcements, voice).
pub fn record_from_fields(species: &str, weight_kg: f64, grade: QualityGrade) -> CatchRecord {
    let score = match grade {
        QualityGrade::A => 92,
        QualityGrade::B => 78,
        QualityGrade::C => 62,
    };
    build_record(species, weight_kg, grade, score, 3.0)
}

impl VisionClient {
    pub fn new(args: &Args) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(45))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key: args.anthropic_api_key.clone(),
            base_url: args.anthropic_base_url.trim_end_matches('/').to_string(),
            model: args.anthropic_model.clone(),
        }
    }

    /// Grade a catch photo (base64 JPEG). Never fails; degraded inputs get
    /// the default record.
    pub async fn analyze_catch(&self, image_base64: &str) -> CatchRecord {
        if self.api_key.is_empty() || image_base64.is_empty() {
            return default_record();
        }
        match self.call_vision(image_base64).await {
            Some(record) => record,
            None => {
                warn!("vision analysis failed, issuing default record");
                default_record()
            }
        }
    }

    async fn call_vision(&self, image_base64: &str) -> Option<CatchRecord> {
        let payload = json!({
            "model": self.model,
            "max_tokens": 1024,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image", "source": {
                        "type": "base64",
                        "media_type": "image/jpeg",
                        "data": image_base64,
                    }},
                    { "type": "text", "text": VISION_PROMPT },
                ],
            }],
        });
        let rsp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .ok()?;
        if !rsp.status().is_success() {
            return None;
        }
        let body: Value = rsp.json().await.ok()?;
        let text = body
            .get("content")?
            .as_array()?
            .iter()
            .find_map(|b| b.get("text").and_then(|t| t.as_str()))?;
        parse_grading(text)
    }
}

/// Pull the JSON object out of the model's answer, tolerating prose
/// around the braces.
fn parse_grading(text: &str) -> Option<CatchRecord> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;

    let species = value.get("species")?.as_str()?;
    let weight_kg = value.get("weight_kg")?.as_f64()?;
    let grade = match value.get("quality_grade")?.as_str()? {
        "A" => QualityGrade::A,
        "B" => QualityGrade::B,
        "C" => QualityGrade::C,
        _ => return None,
    };
    let score = value.get("quality_score")?.as_u64()?.min(100) as u8;
    let freshness = value.get("freshness_hours").and_then(|f| f.as_f64()).unwrap_or(4.0);
    Some(build_record(species, weight_kg, grade, score, freshness))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_json_with_surrounding_prose() {
        let text = r#"Here is my assessment:
            {"species": "Pearl Spot", "weight_kg": 45, "quality_grade": "A",
             "quality_score": 92, "freshness_hours": 2.5}
            Fine lot overall."#;
        let record = parse_grading(text).unwrap();
        assert_eq!(record.species, "Pearl Spot");
        assert_eq!(record.species_local, "കരിമീൻ");
        assert_eq!(record.quality_grade, QualityGrade::A);
        assert_eq!(record.weight_kg, 45.0);
        assert!(record.catch_certificate_hash.starts_with("0x"));
        assert_eq!(record.catch_certificate_hash.len(), 42);
    }

    #[test]
    fn malformed_grading_rejected() {
        assert!(parse_grading("no json here").is_none());
        assert!(parse_grading(r#"{"species": "X"}"#).is_none());
        assert!(parse_grading(r#"{"species":"X","weight_kg":1,"quality_grade":"Z","quality_score":5}"#).is_none());
    }

    #[test]
    fn default_record_is_sellable() {
        let record = default_record();
        assert_eq!(record.species, "Unknown Fish");
        assert_eq!(record.weight_kg, 25.0);
        assert_eq!(record.quality_score, 75);
    }
}
