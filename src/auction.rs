// ===============================
// src/auction.rs
// ===============================
//
// The negotiation orchestrator. One catch in, one bounded tool-calling
// loop against the reasoner, one outcome out: DEAL_SECURED or
// LIQUIDATION. The reasoner decides WHAT to do each round; everything
// here enforces WHEN it may do it and what happens when it stops.
//

use chrono::{DateTime, FixedOffset, TimeZone, Timelike, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::channels::{compose_flash_sale, ChannelSender};
use crate::config::Tuning;
use crate::domain::{
    AgentTag, AuctionPhase, Bid, BidChannel, BidSource, BidStatus, BidUpdate, CatchRecord,
    Economics, PendingDeal,
};
use crate::market;
use crate::metrics::{AUCTIONS_STARTED, LIQUIDATIONS, REASONER_ERRORS, TOOL_CALLS};
use crate::reasoner::{auction_tools, NegotiationReasoner, ReplyBlock, TranscriptMsg};
use crate::state::Store;

const IST_OFFSET_SECS: i32 = 5 * 3600 + 1800;

/// Everything a running auction needs. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct AuctionCtx {
    pub store: Store,
    pub reasoner: Arc<dyn NegotiationReasoner>,
    pub channels: Arc<dyn ChannelSender>,
    pub tuning: Tuning,
}

fn ist() -> FixedOffset {
    FixedOffset::east_opt(IST_OFFSET_SECS).expect("fixed IST offset")
}

/// The hard sale deadline: the configured time of day (IST), today if it
/// is still ahead, otherwise tomorrow. Tests pin an absolute override.
pub fn next_deadline(tuning: &Tuning) -> DateTime<Utc> {
    if let Some(at) = tuning.deadline_override {
        return at;
    }
    let now_ist = Utc::now().with_timezone(&ist());
    let today = now_ist
        .date_naive()
        .and_hms_opt(tuning.deadline_hour, tuning.deadline_minute, 0)
        .expect("valid deadline time");
    let candidate = ist().from_local_datetime(&today).single().expect("unambiguous IST");
    let candidate = if candidate > now_ist {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    };
    candidate.with_timezone(&Utc)
}

fn deadline_label(at: DateTime<Utc>) -> String {
    let local = at.with_timezone(&ist());
    let (pm, hour12) = local.hour12();
    format!("{}:{:02} {} IST", hour12, local.minute(), if pm { "PM" } else { "AM" })
}

fn system_prompt(catch: &CatchRecord, tuning: &Tuning) -> String {
    let price = market::mandi_price(&catch.species, catch.quality_score);
    format!(
        "You are the negotiation engine for a Kerala fishing boat selling today's catch \
         before it loses freshness value.\n\
         Catch: {species} ({local}), {weight:.1} kg, Grade {grade:?} (score {score}/100), \
         {fresh:.1} h since catch, certificate {cert}.\n\
         Wholesale reference: \u{20B9}{avg}/kg (floor \u{20B9}{min}, ceiling \u{20B9}{max}).\n\
         Narrate every step as a short line prefixed with one of [SCOUT], [NEGOTIATOR], \
         [AUDITOR], [NAVIGATOR]. Check the mandi price and fuel cost first, then collect \
         bids from the buyer directory, reject or counter anything under the floor, and \
         accept the best net offer within {rounds} rounds. If nothing clears the floor in \
         time, trigger liquidation.",
        species = catch.species,
        local = catch.species_local,
        weight = catch.weight_kg,
        grade = catch.quality_grade,
        score = catch.quality_score,
        fresh = catch.freshness_hours,
        cert = catch.catch_certificate_hash,
        avg = price.average,
        min = price.min,
        max = price.max,
        rounds = tuning.max_rounds,
    )
}

fn opening_briefing(catch: &CatchRecord, deadline: &str) -> String {
    format!(
        "New catch landed: {} ({}), {:.1} kg, Grade {:?}. It must be sold by {}. \
         Start the auction.",
        catch.species, catch.species_local, catch.weight_kg, catch.quality_grade, deadline
    )
}

/// Narration lines arrive as `[TAG] message`; untagged lines default to SYSTEM.
fn parse_narration(line: &str) -> (AgentTag, String) {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            if let Some(tag) = AgentTag::parse(&rest[..end]) {
                return (tag, rest[end + 1..].trim().to_string());
            }
        }
    }
    (AgentTag::System, trimmed.to_string())
}

fn truncate_input(input: &Value) -> String {
    let s = input.to_string();
    if s.chars().count() <= 80 {
        return s;
    }
    let mut out: String = s.chars().take(80).collect();
    out.push('\u{2026}');
    out
}

/// Mark the auction LIQUIDATION and push the flash sale exactly once.
pub async fn liquidate(ctx: &AuctionCtx, reason: &str) {
    if ctx.store.phase().is_terminal() {
        return;
    }
    let catch = ctx.store.catch();
    ctx.store.add_log(AgentTag::System, format!("Liquidation triggered: {reason}"));
    ctx.store.set_phase(AuctionPhase::Liquidation);
    ctx.store.set_countdown(0);
    ctx.store.set_threads(0);
    LIQUIDATIONS.inc();

    if let Some(catch) = catch {
        let avg = market::mandi_price(&catch.species, catch.quality_score).average as f64;
        let price = (avg * 0.7).round();
        let message =
            compose_flash_sale(&catch.species, catch.weight_kg, price, next_deadline(&ctx.tuning));
        ctx.channels.broadcast(&message).await;
        ctx.store.add_log(
            AgentTag::Negotiator,
            format!("Flash sale pushed to all buyers at \u{20B9}{price:.0}/kg, first BUY wins."),
        );
    }
    info!(reason, "auction liquidated");
}

/// NAVIGATOR wrap-up after a confirmed deal.
pub fn announce_route(store: &Store) {
    if let Some(harbor) = store.recommended_harbor() {
        store.add_log(
            AgentTag::Navigator,
            format!(
                "Route confirmed: land at {} ({} km, ~{} min). Buyer will meet at the quay.",
                harbor.name, harbor.distance_km, harbor.eta_minutes
            ),
        );
    }
}

fn spawn_countdown_ticker(store: Store, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(std::time::Duration::from_secs(1)) => {
                    if store.phase().is_terminal() {
                        break;
                    }
                    store.tick_countdown();
                }
                _ = stop.changed() => break,
            }
        }
    });
}

fn spawn_deadline_watcher(ctx: AuctionCtx, deadline: DateTime<Utc>, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut warned_30 = false;
        let mut warned_10 = false;
        loop {
            tokio::select! {
                _ = sleep(ctx.tuning.deadline_poll) => {}
                _ = stop.changed() => break,
            }
            if ctx.store.phase().is_terminal() {
                break;
            }
            let remaining = deadline - Utc::now();
            let mins = remaining.num_minutes();
            if remaining.num_seconds() <= 0 {
                liquidate(&ctx, "sale deadline passed with no secured deal").await;
                break;
            }
            if mins <= 10 && !warned_10 {
                warned_10 = true;
                ctx.store.add_log(
                    AgentTag::System,
                    format!("\u{26A0} {mins} minutes to the sale deadline."),
                );
            } else if mins <= 30 && !warned_30 {
                warned_30 = true;
                ctx.store.add_log(
                    AgentTag::System,
                    format!("{mins} minutes left before the sale deadline."),
                );
            }
        }
    });
}

fn spawn_approval_timer(
    ctx: AuctionCtx,
    window: std::time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = sleep(window) => {}
            _ = stop.changed() => return,
        }
        if ctx.store.pending_deal().is_some() {
            match ctx.store.approve_deal(true) {
                Ok(approval) => {
                    debug!(buyer = %approval.buyer_id, "deal auto-approved");
                    announce_route(&ctx.store);
                }
                Err(err) => warn!(%err, "auto-approval failed"),
            }
        }
    });
}

/// Apply one reasoner tool call against the live state. Returns the tool
/// result payload and whether the negotiation is complete.
async fn dispatch_tool(
    ctx: &AuctionCtx,
    catch: &CatchRecord,
    name: &str,
    input: &Value,
    stop: &watch::Receiver<bool>,
) -> (Value, bool) {
    TOOL_CALLS.with_label_values(&[name]).inc();
    let fuel = ctx.store.recommended_harbor().map(|h| h.fuel_cost).unwrap_or(0);

    match name {
        "check_mandi_price" => {
            let species =
                input.get("species").and_then(|s| s.as_str()).unwrap_or(catch.species.as_str());
            let price = market::mandi_price(species, catch.quality_score);
            ctx.store.add_log(
                AgentTag::Scout,
                format!(
                    "Mandi rate for {species}: avg \u{20B9}{}/kg (\u{20B9}{}\u{2013}\u{20B9}{}).",
                    price.average, price.min, price.max
                ),
            );
            (
                json!({
                    "species": species,
                    "average": price.average,
                    "min": price.min,
                    "max": price.max,
                    "currency": "INR/kg",
                    "from_live_table": price.from_table,
                }),
                false,
            )
        }
        "calculate_fuel_cost" => {
            let km = input
                .get("harbor")
                .and_then(|v| v.as_str())
                .and_then(market::find_harbor)
                .map(|h| h.distance_km)
                .or_else(|| input.get("distance_km").and_then(|d| d.as_u64()).map(|d| d as u32))
                .unwrap_or(12);
            let cost = market::fuel_cost(km);
            let litres = km as f64 * market::BOAT_CONSUMPTION_L_PER_KM;
            ctx.store.add_log(
                AgentTag::Navigator,
                format!("Fuel for {km} km: {litres:.1} L diesel, \u{20B9}{cost}."),
            );
            (
                json!({
                    "distance_km": km,
                    "litres": litres,
                    "price_per_litre": market::MARINE_DIESEL_PER_LITRE,
                    "fuel_cost": cost,
                }),
                false,
            )
        }
        "place_bid" => {
            let buyer_id = input.get("buyer_id").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
            let buyer_name = input
                .get("buyer_name")
                .and_then(|v| v.as_str())
                .or_else(|| market::find_buyer(buyer_id).map(|b| b.name))
                .unwrap_or(buyer_id);
            let amount = input.get("amount_per_kg").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let channel = input
                .get("channel")
                .and_then(|v| v.as_str())
                .and_then(BidChannel::parse)
                .unwrap_or(BidChannel::Whatsapp);

            let gross = amount * catch.weight_kg;
            let bid = Bid {
                id: ctx.store.next_bid_id(),
                buyer_id: buyer_id.to_string(),
                buyer_name: buyer_name.to_string(),
                channel,
                source: BidSource::Agent,
                bid_amount: amount,
                gross_value: gross,
                net_after_fuel: gross - fuel as f64,
                agent_action: "Evaluating...".to_string(),
                status: BidStatus::Active,
                timestamp: crate::domain::ist_now(),
                original_amount: None,
            };
            let bid_id = bid.id.clone();
            ctx.store.add_bid(bid);
            ctx.store.add_log(
                AgentTag::Negotiator,
                format!(
                    "{buyer_name} offers \u{20B9}{amount:.0}/kg via {} (gross \u{20B9}{gross:.0}).",
                    channel.as_str()
                ),
            );
            (json!({ "bid_id": bid_id, "status": "ACTIVE" }), false)
        }
        "reject_and_counter" => {
            let buyer_id = input.get("buyer_id").and_then(|v| v.as_str()).unwrap_or("");
            let counter = input.get("counter_amount").and_then(|v| v.as_f64()).unwrap_or(0.0);
            match ctx.store.active_bid_of(buyer_id) {
                Some(bid) => {
                    let updates = if ctx.tuning.counter_marks_bid {
                        let gross = counter * catch.weight_kg;
                        BidUpdate {
                            status: Some(BidStatus::Countered),
                            bid_amount: Some(counter),
                            gross_value: Some(gross),
                            net_after_fuel: Some(gross - fuel as f64),
                            agent_action: Some(format!(
                                "COUNTERED at \u{20B9}{counter:.0}/kg"
                            )),
                            original_amount: Some(bid.bid_amount),
                        }
                    } else {
                        BidUpdate {
                            status: Some(BidStatus::Rejected),
                            agent_action: Some(format!(
                                "REJECTED, countered at \u{20B9}{counter:.0}/kg"
                            )),
                            original_amount: Some(bid.bid_amount),
                            ..BidUpdate::default()
                        }
                    };
                    match ctx.store.update_bid(&bid.id, updates) {
                        Ok(()) => {
                            ctx.store.add_log(
                                AgentTag::Negotiator,
                                format!(
                                    "Countered {} at \u{20B9}{counter:.0}/kg (was \u{20B9}{:.0}).",
                                    bid.buyer_name, bid.bid_amount
                                ),
                            );
                            ctx.channels
                                .send(
                                    bid.channel,
                                    &bid.buyer_id,
                                    &format!(
                                        "Your offer of \u{20B9}{:.0}/kg is below our floor. \
                                         We can close at \u{20B9}{counter:.0}/kg today.",
                                        bid.bid_amount
                                    ),
                                )
                                .await;
                            (json!({ "bid_id": bid.id, "counter_amount": counter }), false)
                        }
                        Err(err) => (json!({ "error": err.to_string() }), false),
                    }
                }
                None => (json!({ "error": format!("no active bid from {buyer_id}") }), false),
            }
        }
        "accept_deal" => {
            let buyer_id = input.get("buyer_id").and_then(|v| v.as_str()).unwrap_or("");
            let amount = input
                .get("final_amount")
                .or_else(|| input.get("amount_per_kg"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            match ctx.store.active_bid_of(buyer_id) {
                Some(bid) => {
                    let result = ctx.store.update_bid(
                        &bid.id,
                        BidUpdate {
                            status: Some(BidStatus::Proposed),
                            agent_action: Some("PROPOSED - awaiting fisherman approval".into()),
                            ..BidUpdate::default()
                        },
                    );
                    if let Err(err) = result {
                        return (json!({ "error": err.to_string() }), false);
                    }
                    let gross = (amount * catch.weight_kg).round() as i64;
                    ctx.store.set_economics(Economics::derive(
                        gross,
                        fuel,
                        ctx.tuning.risk_buffer_bps,
                    ));
                    let window = ctx.tuning.approval_window;
                    ctx.store.set_pending_deal(PendingDeal {
                        buyer_id: bid.buyer_id.clone(),
                        buyer_name: bid.buyer_name.clone(),
                        amount_per_kg: amount,
                        proposed_at: Utc::now(),
                        window_secs: window.as_secs(),
                    });
                    ctx.store.set_phase(AuctionPhase::AwaitingApproval);
                    ctx.store.set_countdown(window.as_secs() as u32);
                    ctx.store.add_log(
                        AgentTag::Auditor,
                        format!(
                            "Best offer: {} at \u{20B9}{amount:.0}/kg. Awaiting approval, \
                             auto-confirms in {}s.",
                            bid.buyer_name,
                            window.as_secs()
                        ),
                    );
                    spawn_approval_timer(ctx.clone(), window, stop.clone());
                    (
                        json!({
                            "status": "AWAITING_APPROVAL",
                            "buyer_id": bid.buyer_id,
                            "window_secs": window.as_secs(),
                        }),
                        true,
                    )
                }
                None => (json!({ "error": format!("no active bid from {buyer_id}") }), false),
            }
        }
        "trigger_liquidation" => {
            let reason = input
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("no acceptable offer")
                .to_string();
            liquidate(ctx, &reason).await;
            (json!({ "status": "LIQUIDATION" }), true)
        }
        other => {
            warn!(tool = other, "unknown tool requested");
            (json!({ "error": format!("unknown tool {other}") }), false)
        }
    }
}

/// Run one full auction for the catch already loaded into the store.
/// Returns when the negotiation loop is done; approval and deadline
/// timers keep running on their own.
pub async fn run_auction(ctx: AuctionCtx, catch: CatchRecord, stop: watch::Receiver<bool>) {
    AUCTIONS_STARTED.inc();
    let deadline = next_deadline(&ctx.tuning);
    let label = deadline_label(deadline);

    ctx.store.set_phase(AuctionPhase::AuctionLive);
    ctx.store.set_threads(ctx.tuning.thread_gauge);
    ctx.store.set_countdown(ctx.tuning.countdown_start);
    ctx.store.set_deadline(label.clone());
    let harbors = market::harbor_options();
    let recommended = harbors[0].clone();
    ctx.store.set_harbors(harbors, recommended);
    ctx.store.add_log(
        AgentTag::System,
        format!(
            "Auction live for {:.1} kg {} (Grade {:?}). Sale deadline {label}.",
            catch.weight_kg, catch.species, catch.quality_grade
        ),
    );

    spawn_countdown_ticker(ctx.store.clone(), stop.clone());
    spawn_deadline_watcher(ctx.clone(), deadline, stop.clone());

    let system = system_prompt(&catch, &ctx.tuning);
    let tools = auction_tools();
    let mut transcript = vec![TranscriptMsg::User(opening_briefing(&catch, &label))];
    let mut complete = false;
    let mut idle_turns = 0u32;

    for round in 0..ctx.tuning.max_rounds {
        if *stop.borrow() {
            debug!(round, "auction stopped");
            return;
        }
        let reply = match ctx.reasoner.propose(&system, &transcript, &tools).await {
            Ok(reply) => reply,
            Err(err) => {
                REASONER_ERRORS.inc();
                warn!(%err, round, "reasoner call failed");
                ctx.store.add_log(
                    AgentTag::System,
                    "Negotiation engine unavailable, closing the lot.",
                );
                break;
            }
        };
        // A stop raised mid-call wins; the reply is discarded.
        if *stop.borrow() {
            return;
        }

        transcript.push(TranscriptMsg::Assistant(reply.blocks.clone()));
        let mut results: Vec<(String, Value)> = Vec::new();
        for block in &reply.blocks {
            match block {
                ReplyBlock::Text(text) => {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        let (tag, message) = parse_narration(line);
                        ctx.store.add_log(tag, message);
                        sleep(ctx.tuning.log_pace).await;
                    }
                }
                ReplyBlock::ToolUse(call) => {
                    ctx.store.add_log(
                        AgentTag::System,
                        format!("\u{2192} Tool Call: {}({})", call.name, truncate_input(&call.input)),
                    );
                    sleep(ctx.tuning.tool_pace).await;
                    let (output, done) =
                        dispatch_tool(&ctx, &catch, &call.name, &call.input, &stop).await;
                    results.push((call.id.clone(), output));
                    if done {
                        complete = true;
                    }
                }
            }
        }

        if complete {
            break;
        }
        if results.is_empty() && reply.end_turn {
            // Two consecutive empty end-of-turns end the negotiation; a
            // productive round in between resets the count.
            idle_turns += 1;
            ctx.store.add_log(AgentTag::Auditor, "Round ended without a decision.");
            if idle_turns >= 2 {
                break;
            }
            transcript.push(TranscriptMsg::User(
                "The lot is still unsold. Continue the negotiation or trigger liquidation."
                    .to_string(),
            ));
        } else {
            idle_turns = 0;
            // An empty tool_results message is rejected by the live API.
            if !results.is_empty() {
                transcript.push(TranscriptMsg::ToolResults(results));
            }
        }
    }

    if !complete && !ctx.store.phase().is_terminal() {
        liquidate(&ctx, "negotiation rounds exhausted without a deal").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narration_lines_route_to_their_agent() {
        let (tag, msg) = parse_narration("[SCOUT] Checking mandi feeds");
        assert_eq!(tag, AgentTag::Scout);
        assert_eq!(msg, "Checking mandi feeds");

        let (tag, msg) = parse_narration("no prefix at all");
        assert_eq!(tag, AgentTag::System);
        assert_eq!(msg, "no prefix at all");

        let (tag, _) = parse_narration("[UNKNOWN] something");
        assert_eq!(tag, AgentTag::System);
    }

    #[test]
    fn deadline_override_wins_and_label_reads_ist() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();
        let tuning = Tuning { deadline_override: Some(at), ..Tuning::default() };
        assert_eq!(next_deadline(&tuning), at);
        // 10:00 UTC is 15:30 IST.
        assert_eq!(deadline_label(at), "3:30 PM IST");
    }

    #[test]
    fn computed_deadline_lands_on_the_configured_time() {
        let tuning = Tuning::default();
        let deadline = next_deadline(&tuning).with_timezone(&ist());
        assert_eq!(deadline.hour(), 15);
        assert_eq!(deadline.minute(), 30);
        assert!(deadline.with_timezone(&Utc) > Utc::now());
    }

    #[test]
    fn tool_input_truncation() {
        let long = json!({ "a": "x".repeat(200) });
        let shown = truncate_input(&long);
        assert!(shown.chars().count() <= 81);
        assert!(shown.ends_with('\u{2026}'));
    }
}
