// ===============================
// src/webhook.rs
// ===============================
//
// Inbound message parsing for the Twilio (WhatsApp/SMS) and Telegram
// webhooks. Grammars are deliberately tiny: BID <n>, COUNTER <n>, BUY,
// and the SMS catch announcement AUC:<SPECIES>:<WEIGHT>:GR_<GRADE>.
//

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::domain::QualityGrade;

static BID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*BID\s+(\d+(?:\.\d+)?)").expect("bid regex"));
static COUNTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*COUNTER\s+(\d+(?:\.\d+)?)").expect("counter regex"));
static BUY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*BUY\b").expect("buy regex"));
static AUC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*AUC:([A-Za-z_ ]+):(\d+(?:\.\d+)?):GR_([ABC])").expect("auc regex")
});

#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    /// `BID 420` or `COUNTER 430`. Counters from buyers land as plain bids.
    Bid(f64),
    /// `BUY` claim on a liquidation flash sale.
    Buy,
    /// `AUC:KARIMEEN:45:GR_A` catch announcement over SMS.
    Announce { species: String, weight_kg: f64, grade: QualityGrade },
}

/// Parse one inbound message body. `None` for chatter we do not understand.
pub fn parse_command(body: &str) -> Option<InboundCommand> {
    if let Some(cap) = AUC_RE.captures(body) {
        let species = cap[1].replace('_', " ").trim().to_string();
        let weight_kg = cap[2].parse().ok()?;
        let grade = match cap[3].to_ascii_uppercase().as_str() {
            "A" => QualityGrade::A,
            "B" => QualityGrade::B,
            _ => QualityGrade::C,
        };
        return Some(InboundCommand::Announce { species, weight_kg, grade });
    }
    if let Some(cap) = BID_RE.captures(body) {
        return Some(InboundCommand::Bid(cap[1].parse().ok()?));
    }
    if let Some(cap) = COUNTER_RE.captures(body) {
        return Some(InboundCommand::Bid(cap[1].parse().ok()?));
    }
    if BUY_RE.is_match(body) {
        return Some(InboundCommand::Buy);
    }
    None
}

/// One parsed Twilio form post: who sent it and what they said.
#[derive(Debug, Clone)]
pub struct TwilioInbound {
    pub from: String,
    pub body: String,
}

pub fn parse_twilio_form(form: &str) -> Option<TwilioInbound> {
    let mut from = None;
    let mut body = None;
    for (k, v) in url::form_urlencoded::parse(form.as_bytes()) {
        match k.as_ref() {
            "From" => from = Some(v.into_owned()),
            "Body" => body = Some(v.into_owned()),
            _ => {}
        }
    }
    Some(TwilioInbound { from: from?, body: body? })
}

/// Telegram `sendMessage` update: (chat id, sender name, text).
pub fn parse_telegram_update(update: &Value) -> Option<(String, String, String)> {
    let message = update.get("message")?;
    let chat_id = message.get("chat")?.get("id")?.to_string();
    let name = message
        .get("from")
        .and_then(|f| f.get("first_name"))
        .and_then(|n| n.as_str())
        .unwrap_or("Telegram Buyer")
        .to_string();
    let text = message.get("text")?.as_str()?.to_string();
    Some((chat_id, name, text))
}

/// Short buyer id derived from a phone number, last four digits.
pub fn buyer_id_from_contact(contact: &str) -> String {
    let digits: String = contact.chars().filter(|c| c.is_ascii_digit()).collect();
    let tail = if digits.len() >= 4 { &digits[digits.len() - 4..] } else { &digits };
    format!("EXT-{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bid_counter_buy_grammars() {
        assert_eq!(parse_command("BID 420"), Some(InboundCommand::Bid(420.0)));
        assert_eq!(parse_command("  bid 415.5 please"), Some(InboundCommand::Bid(415.5)));
        assert_eq!(parse_command("COUNTER 430"), Some(InboundCommand::Bid(430.0)));
        assert_eq!(parse_command("BUY"), Some(InboundCommand::Buy));
        assert_eq!(parse_command("buying soon"), None);
        assert_eq!(parse_command("hello"), None);
    }

    #[test]
    fn sms_catch_announcement() {
        let cmd = parse_command("AUC:KARIMEEN:45:GR_A").unwrap();
        match cmd {
            InboundCommand::Announce { species, weight_kg, grade } => {
                assert_eq!(species, "KARIMEEN");
                assert_eq!(weight_kg, 45.0);
                assert_eq!(grade, QualityGrade::A);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn twilio_form_and_buyer_id() {
        let inbound =
            parse_twilio_form("From=whatsapp%3A%2B919876543210&Body=BID+420").unwrap();
        assert_eq!(inbound.from, "whatsapp:+919876543210");
        assert_eq!(inbound.body, "BID 420");
        assert_eq!(buyer_id_from_contact(&inbound.from), "EXT-3210");
    }

    #[test]
    fn telegram_update_extraction() {
        let update = json!({
            "message": {
                "chat": { "id": 987654 },
                "from": { "first_name": "Ravi" },
                "text": "COUNTER 410"
            }
        });
        let (chat, name, text) = parse_telegram_update(&update).unwrap();
        assert_eq!(chat, "987654");
        assert_eq!(name, "Ravi");
        assert_eq!(text, "COUNTER 410");
    }
}
