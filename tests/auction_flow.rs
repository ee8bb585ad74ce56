// ===============================
// tests/auction_flow.rs
// ===============================
//
// End-to-end negotiation runs against the scripted reasoners, on paused
// tokio time so the approval window and deadline polls elapse instantly.
//

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use fishbid::auction::{run_auction, AuctionCtx};
use fishbid::channels::MockChannels;
use fishbid::config::Tuning;
use fishbid::domain::{AuctionPhase, BidStatus, CatchRecord, QualityGrade};
use fishbid::reasoner_mock::{MockReasoner, ScriptedReasoner};
use fishbid::reasoner::{ReasonerReply, ReplyBlock, ToolCall};
use fishbid::state::Store;
use fishbid::stream::EventBus;

fn sample_catch() -> CatchRecord {
    CatchRecord {
        species: "Pearl Spot".into(),
        species_local: "കരിമീൻ".into(),
        weight_kg: 40.0,
        quality_grade: QualityGrade::A,
        quality_score: 92,
        freshness_hours: 2.0,
        catch_certificate_hash: "0xabc123".into(),
    }
}

fn tuning() -> Tuning {
    Tuning {
        approval_window: Duration::from_secs(5),
        deadline_override: Some(Utc::now() + chrono::Duration::hours(6)),
        ..Tuning::default()
    }
}

fn build_ctx(
    reasoner: Arc<dyn fishbid::reasoner::NegotiationReasoner>,
    tuning: Tuning,
) -> (AuctionCtx, Store, Arc<MockChannels>) {
    let store = Store::new(EventBus::new(2048), None);
    let channels = Arc::new(MockChannels::new());
    let ctx = AuctionCtx {
        store: store.clone(),
        reasoner,
        channels: channels.clone(),
        tuning,
    };
    (ctx, store, channels)
}

fn tool_reply(name: &str, input: serde_json::Value) -> ReasonerReply {
    ReasonerReply {
        blocks: vec![ReplyBlock::ToolUse(ToolCall {
            id: format!("t-{name}"),
            name: name.to_string(),
            input,
        })],
        end_turn: false,
    }
}

#[tokio::test(start_paused = true)]
async fn mock_negotiation_rejects_lowball_and_auto_approves() {
    let (ctx, store, channels) = build_ctx(Arc::new(MockReasoner::new()), tuning());
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_auction(ctx, sample_catch(), stop_rx).await;

    // Loop ends on accept_deal: one PROPOSED, the lowball REJECTED.
    assert_eq!(store.phase(), AuctionPhase::AwaitingApproval);
    let bids = store.bids();
    assert_eq!(bids.len(), 4);
    assert!(bids.iter().any(|b| b.status == BidStatus::Rejected));
    assert_eq!(bids.iter().filter(|b| b.status == BidStatus::Proposed).count(), 1);
    // The countered buyer got an outbound message.
    assert!(!channels.sent.lock().unwrap().is_empty());

    // Approval window elapses untouched: auto-approve.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(store.phase(), AuctionPhase::DealSecured);
    let accepted: Vec<_> =
        store.bids().into_iter().filter(|b| b.status == BidStatus::Accepted).collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].buyer_id, "GGE");

    // Economics: buffer is 3% of gross, net is gross - fuel - buffer.
    let econ = store.economics().expect("economics published");
    assert_eq!(econ.risk_buffer, ((econ.gross_bid as f64) * 0.03).round() as i64);
    assert_eq!(econ.net_profit, econ.gross_bid - econ.fuel_cost - econ.risk_buffer);
    assert_eq!(econ.fuel_cost, 718); // 12 km to the recommended harbor
}

#[tokio::test(start_paused = true)]
async fn manual_approval_wins_over_the_window() {
    let scripted = ScriptedReasoner::new(vec![
        tool_reply(
            "place_bid",
            json!({ "buyer_id": "GGE", "buyer_name": "Gulf Gate Exports Pvt Ltd",
                    "amount_per_kg": 400.0, "channel": "whatsapp" }),
        ),
        tool_reply("accept_deal", json!({ "buyer_id": "GGE", "amount_per_kg": 400.0 })),
    ]);
    let (ctx, store, _channels) = build_ctx(Arc::new(scripted), tuning());
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_auction(ctx, sample_catch(), stop_rx).await;
    assert_eq!(store.phase(), AuctionPhase::AwaitingApproval);

    let approval = store.approve_deal(false).expect("manual approval");
    assert!(!approval.auto);
    assert_eq!(store.phase(), AuctionPhase::DealSecured);

    // The auto-approval timer finds nothing pending afterwards.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.phase(), AuctionPhase::DealSecured);
    let accepted =
        store.bids().into_iter().filter(|b| b.status == BidStatus::Accepted).count();
    assert_eq!(accepted, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_rounds_force_liquidation_with_one_broadcast() {
    // Eight rounds of bidding, never an accept.
    let replies: Vec<ReasonerReply> = (0..8)
        .map(|i| {
            tool_reply(
                "place_bid",
                json!({ "buyer_id": format!("B{i}"), "buyer_name": format!("Buyer {i}"),
                        "amount_per_kg": 300.0 + i as f64, "channel": "telegram" }),
            )
        })
        .collect();
    let (ctx, store, channels) = build_ctx(Arc::new(ScriptedReasoner::new(replies)), tuning());
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_auction(ctx, sample_catch(), stop_rx).await;

    assert_eq!(store.phase(), AuctionPhase::Liquidation);
    let broadcasts = channels.broadcasts.lock().unwrap().clone();
    assert_eq!(broadcasts.len(), 1);
    assert!(broadcasts[0].contains("FLASH SALE"));
    // Unaccepted bids stay ACTIVE; nothing is retroactively rejected.
    assert!(store.bids().iter().all(|b| b.status == BidStatus::Active));
}

#[tokio::test(start_paused = true)]
async fn two_idle_turns_end_the_negotiation() {
    // An empty script ends its turn every round.
    let (ctx, store, channels) =
        build_ctx(Arc::new(ScriptedReasoner::new(Vec::new())), tuning());
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_auction(ctx, sample_catch(), stop_rx).await;

    assert_eq!(store.phase(), AuctionPhase::Liquidation);
    assert_eq!(channels.broadcasts.lock().unwrap().len(), 1);
    let idle_logs = store
        .log()
        .iter()
        .filter(|l| l.message.contains("without a decision"))
        .count();
    assert_eq!(idle_logs, 2);
}

#[tokio::test(start_paused = true)]
async fn deadline_watcher_liquidates_a_stalled_negotiation() {
    // One reply whose narration pacing outlasts the deadline poll.
    let lines = vec!["[NEGOTIATOR] still talking"; 150].join("\n");
    let scripted = ScriptedReasoner::new(vec![ReasonerReply {
        blocks: vec![ReplyBlock::Text(lines)],
        end_turn: false,
    }]);
    let tuning = Tuning {
        deadline_override: Some(Utc::now() - chrono::Duration::minutes(1)),
        ..tuning()
    };
    let (ctx, store, channels) = build_ctx(Arc::new(scripted), tuning);
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_auction(ctx, sample_catch(), stop_rx).await;

    assert_eq!(store.phase(), AuctionPhase::Liquidation);
    assert_eq!(channels.broadcasts.lock().unwrap().len(), 1);
    assert!(store
        .log()
        .iter()
        .any(|l| l.message.contains("deadline passed")));
}

#[tokio::test(start_paused = true)]
async fn stop_signal_abandons_the_run_quietly() {
    let (ctx, store, channels) = build_ctx(Arc::new(MockReasoner::new()), tuning());
    store.set_catch(sample_catch());
    let (stop_tx, stop_rx) = watch::channel(false);
    stop_tx.send(true).expect("stop");

    run_auction(ctx, sample_catch(), stop_rx).await;

    // Setup ran, but no negotiation and no forced outcome.
    assert_eq!(store.phase(), AuctionPhase::AuctionLive);
    assert!(store.bids().is_empty());
    assert!(channels.broadcasts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn human_bid_joins_the_sequence_during_a_live_run() {
    let scripted = ScriptedReasoner::new(vec![
        tool_reply(
            "place_bid",
            json!({ "buyer_id": "KFE", "buyer_name": "Kochi Fresh Exports",
                    "amount_per_kg": 360.0, "channel": "whatsapp" }),
        ),
        // Keep the run narrating long enough for the injection below.
        ReasonerReply {
            blocks: vec![ReplyBlock::Text(
                vec!["[NEGOTIATOR] waiting on the buyer network"; 10].join("\n"),
            )],
            end_turn: false,
        },
    ]);
    let (ctx, store, _channels) = build_ctx(Arc::new(scripted), tuning());
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    let run_store = store.clone();
    let handle = tokio::spawn(async move {
        run_auction(ctx, sample_catch(), stop_rx).await;
        run_store
    });
    // Let the run get going, then inject a webhook-style bid.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let bid = store
        .submit_external_bid("EXT-3210", "Buyer 3210", 365.0, fishbid::domain::BidChannel::Whatsapp)
        .expect("external bid");
    assert_eq!(bid.source, fishbid::domain::BidSource::Human);

    handle.await.expect("run finished");
    let ids: Vec<String> = store.bids().iter().map(|b| b.id.clone()).collect();
    // One shared sequence, no parallel numbering.
    let mut sorted = ids.clone();
    sorted.sort_by_key(|id| id[4..].parse::<u32>().unwrap());
    assert_eq!(ids, sorted);
    assert_eq!(ids.len(), 2);
}

fn idle_reply() -> ReasonerReply {
    ReasonerReply { blocks: Vec::new(), end_turn: true }
}

fn accepting_script() -> ScriptedReasoner {
    ScriptedReasoner::new(vec![
        tool_reply(
            "place_bid",
            json!({ "buyer_id": "KFE", "buyer_name": "Kochi Fresh Exports",
                    "amount_per_kg": 380.0, "channel": "whatsapp" }),
        ),
        tool_reply("accept_deal", json!({ "buyer_id": "KFE", "final_amount": 380.0 })),
    ])
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_the_stale_approval_window() {
    let store = Store::new(EventBus::new(2048), None);
    let channels = Arc::new(MockChannels::new());

    // First auction: 5 s window, reaches AWAITING_APPROVAL, then reset.
    let ctx1 = AuctionCtx {
        store: store.clone(),
        reasoner: Arc::new(accepting_script()),
        channels: channels.clone(),
        tuning: tuning(),
    };
    let (stop1, stop_rx1) = watch::channel(false);
    store.set_catch(sample_catch());
    run_auction(ctx1, sample_catch(), stop_rx1).await;
    assert_eq!(store.phase(), AuctionPhase::AwaitingApproval);

    stop1.send(true).expect("stop first run");
    store.reset_auction();
    assert_eq!(store.phase(), AuctionPhase::Idle);

    // Second auction: 600 s window on the same store.
    let ctx2 = AuctionCtx {
        store: store.clone(),
        reasoner: Arc::new(accepting_script()),
        channels,
        tuning: Tuning { approval_window: Duration::from_secs(600), ..tuning() },
    };
    let (_stop2, stop_rx2) = watch::channel(false);
    store.set_catch(sample_catch());
    run_auction(ctx2, sample_catch(), stop_rx2).await;
    assert_eq!(store.phase(), AuctionPhase::AwaitingApproval);

    // The first run's 5 s timer must not fire into the new window.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.phase(), AuctionPhase::AwaitingApproval);

    // The second run's own window still elapses normally.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(store.phase(), AuctionPhase::DealSecured);
}

#[tokio::test(start_paused = true)]
async fn a_bid_round_resets_the_idle_count() {
    // Idle turns separated by productive rounds must not accumulate;
    // only the final two consecutive ones end the loop.
    let bid = |i: usize| {
        tool_reply(
            "place_bid",
            json!({ "buyer_id": format!("B{i}"), "buyer_name": format!("Buyer {i}"),
                    "amount_per_kg": 340.0 + i as f64, "channel": "telegram" }),
        )
    };
    let scripted =
        ScriptedReasoner::new(vec![idle_reply(), bid(0), idle_reply(), bid(1), bid(2)]);
    let (ctx, store, channels) = build_ctx(Arc::new(scripted), tuning());
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_auction(ctx, sample_catch(), stop_rx).await;

    assert_eq!(store.bids().len(), 3);
    assert_eq!(store.phase(), AuctionPhase::Liquidation);
    assert_eq!(channels.broadcasts.lock().unwrap().len(), 1);
    // Four idle rounds were logged: two scripted, two after the script drained.
    let idle_logs = store
        .log()
        .iter()
        .filter(|l| l.message.contains("without a decision"))
        .count();
    assert_eq!(idle_logs, 4);
}

// Pops scripted replies and keeps every transcript it was shown.
struct RecordingReasoner {
    replies: std::sync::Mutex<std::collections::VecDeque<ReasonerReply>>,
    transcripts: std::sync::Mutex<Vec<Vec<fishbid::reasoner::TranscriptMsg>>>,
}

impl RecordingReasoner {
    fn new(replies: Vec<ReasonerReply>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into()),
            transcripts: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl fishbid::reasoner::NegotiationReasoner for RecordingReasoner {
    async fn propose(
        &self,
        _system: &str,
        transcript: &[fishbid::reasoner::TranscriptMsg],
        _tools: &[fishbid::reasoner::ToolSpec],
    ) -> Result<ReasonerReply, fishbid::reasoner::ReasonerError> {
        self.transcripts.lock().unwrap().push(transcript.to_vec());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ReasonerReply { blocks: Vec::new(), end_turn: true }))
    }
}

#[tokio::test(start_paused = true)]
async fn narration_rounds_never_feed_back_empty_tool_results() {
    use fishbid::reasoner::TranscriptMsg;

    // Round one narrates without ending its turn or calling a tool.
    let narration = ReasonerReply {
        blocks: vec![ReplyBlock::Text("[NEGOTIATOR] probing the buyer network".into())],
        end_turn: false,
    };
    let recorder = Arc::new(RecordingReasoner::new(vec![
        narration,
        tool_reply(
            "place_bid",
            json!({ "buyer_id": "KFE", "buyer_name": "Kochi Fresh Exports",
                    "amount_per_kg": 380.0, "channel": "whatsapp" }),
        ),
        tool_reply("accept_deal", json!({ "buyer_id": "KFE", "final_amount": 380.0 })),
    ]));
    let (ctx, store, _channels) = build_ctx(recorder.clone(), tuning());
    store.set_catch(sample_catch());
    let (_stop_tx, stop_rx) = watch::channel(false);

    run_auction(ctx, sample_catch(), stop_rx).await;
    assert_eq!(store.phase(), AuctionPhase::AwaitingApproval);

    let transcripts = recorder.transcripts.lock().unwrap();
    assert_eq!(transcripts.len(), 3);
    for transcript in transcripts.iter() {
        for msg in transcript {
            if let TranscriptMsg::ToolResults(results) = msg {
                assert!(!results.is_empty(), "empty tool_results turn in transcript");
            }
        }
    }
}
