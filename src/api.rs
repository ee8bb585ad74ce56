// ===============================
// src/api.rs
// ===============================
//
// The HTTP surface: catch analysis, the SSE auction stream, manual
// approval, bid injection, channel webhooks and the voice endpoints.
// One hyper service over the shared Store; the negotiation loop runs as
// a spawned task owned by the current run's stop handle.
//

use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auction::{announce_route, run_auction, AuctionCtx};
use crate::channels::ChannelSender;
use crate::config::{Args, Tuning};
use crate::domain::{AgentTag, AuctionPhase, BidChannel};
use crate::metrics::SSE_CLIENTS;
use crate::reasoner::NegotiationReasoner;
use crate::state::{StateError, Store};
use crate::vision::{record_from_fields, VisionClient};
use crate::voice::{deal_confirmation, parse_voice_command, VoiceClient};
use crate::webhook::{
    buyer_id_from_contact, parse_command, parse_telegram_update, parse_twilio_form,
    InboundCommand,
};

#[derive(Clone)]
pub struct ApiCtx {
    pub store: Store,
    pub reasoner: Arc<dyn NegotiationReasoner>,
    pub channels: Arc<dyn ChannelSender>,
    pub vision: Arc<VisionClient>,
    pub voice: Arc<VoiceClient>,
    pub tuning: Tuning,
    /// Stop handle of the run currently driving the store, if any.
    runner: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl ApiCtx {
    pub fn new(
        store: Store,
        reasoner: Arc<dyn NegotiationReasoner>,
        channels: Arc<dyn ChannelSender>,
        vision: Arc<VisionClient>,
        voice: Arc<VoiceClient>,
        tuning: Tuning,
    ) -> Self {
        Self {
            store,
            reasoner,
            channels,
            vision,
            voice,
            tuning,
            runner: Arc::new(Mutex::new(None)),
        }
    }

    fn auction_ctx(&self) -> AuctionCtx {
        AuctionCtx {
            store: self.store.clone(),
            reasoner: self.reasoner.clone(),
            channels: self.channels.clone(),
            tuning: self.tuning.clone(),
        }
    }

    /// Cancel whatever run holds the store. The superseded loop discards
    /// its in-flight reasoner reply on the next stop check.
    fn stop_current_run(&self) {
        let mut guard = self.runner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stop) = guard.take() {
            let _ = stop.send(true);
        }
    }

    fn start_run(&self, catch: crate::domain::CatchRecord) {
        self.stop_current_run();
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.runner.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);
        let ctx = self.auction_ctx();
        tokio::spawn(async move {
            run_auction(ctx, catch, stop_rx).await;
        });
    }
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

fn bad_request(msg: &str) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, json!({ "error": msg }))
}

fn state_error_response(err: StateError) -> Response<Body> {
    let status = match err {
        StateError::NoPendingDeal
        | StateError::NoActiveAuction
        | StateError::AuctionClosed => StatusCode::CONFLICT,
        StateError::UnknownBid(_) | StateError::IllegalTransition { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };
    json_response(status, json!({ "error": err.to_string() }))
}

async fn read_json(req: Request<Body>) -> Result<Value, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| bad_request("unreadable body"))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|_| bad_request("invalid JSON body"))
}

// ---------- handlers ----------

async fn analyze_catch(ctx: &ApiCtx, req: Request<Body>) -> Response<Body> {
    let body = match read_json(req).await {
        Ok(v) => v,
        Err(rsp) => return rsp,
    };
    let image = match body.get("image_base64").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return bad_request("image_base64 is required"),
    };
    let record = ctx.vision.analyze_catch(image).await;
    ctx.store.set_catch(record.clone());
    ctx.store.set_phase(AuctionPhase::Scanning);
    ctx.store.add_log(
        AgentTag::Scout,
        format!(
            "Catch graded: {:.1} kg {} ({}), Grade {:?}, certificate {}.",
            record.weight_kg,
            record.species,
            record.species_local,
            record.quality_grade,
            record.catch_certificate_hash
        ),
    );
    json_response(StatusCode::OK, serde_json::to_value(&record).unwrap_or(Value::Null))
}

/// The SSE stream also starts the negotiation: one subscription is taken
/// before the run is spawned so the stream observes it from the start.
async fn start_auction(ctx: &ApiCtx) -> Response<Body> {
    let catch = match ctx.store.catch() {
        Some(c) => c,
        None => return bad_request("no catch analyzed yet"),
    };

    let mut sub = ctx.store.subscribe();
    // Idle/Scanning starts the run; a live run is only attached to (the
    // bid replay covers what was missed); a finished one is replayed and
    // closed immediately.
    let phase = ctx.store.phase();
    let finished = phase.is_terminal();
    if matches!(phase, AuctionPhase::Idle | AuctionPhase::Scanning) {
        ctx.start_run(catch);
    }

    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        SSE_CLIENTS.inc();
        for ev in sub.replay.drain(..) {
            if send_event(&mut sender, &ev).await.is_err() {
                SSE_CLIENTS.dec();
                return;
            }
        }
        let mut terminal = finished;
        loop {
            let next = if terminal {
                // Trailing logs after the terminal state are flushed, then
                // the sentinel closes the stream.
                match tokio::time::timeout(std::time::Duration::from_secs(2), sub.rx.recv()).await
                {
                    Ok(res) => res,
                    Err(_) => break,
                }
            } else {
                sub.rx.recv().await
            };
            match next {
                Ok(ev) => {
                    if let crate::domain::AuctionEvent::State { state } = &ev {
                        if state.is_terminal() {
                            terminal = true;
                        }
                    }
                    if send_event(&mut sender, &ev).await.is_err() {
                        SSE_CLIENTS.dec();
                        return;
                    }
                }
                // Lagging clients are dropped rather than stalled.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "sse client lagged, dropping");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = sender.send_data(Bytes::from_static(b"data: [DONE]\n\n")).await;
        SSE_CLIENTS.dec();
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .unwrap_or_default()
}

async fn send_event(
    sender: &mut hyper::body::Sender,
    ev: &crate::domain::AuctionEvent,
) -> Result<(), ()> {
    let line = serde_json::to_string(ev).map_err(|_| ())?;
    sender
        .send_data(Bytes::from(format!("data: {line}\n\n")))
        .await
        .map_err(|_| ())
}

async fn approve_deal(ctx: &ApiCtx) -> Response<Body> {
    match ctx.store.approve_deal(false) {
        Ok(approval) => {
            announce_route(&ctx.store);
            json_response(StatusCode::OK, serde_json::to_value(&approval).unwrap_or(Value::Null))
        }
        Err(err) => state_error_response(err),
    }
}

async fn place_bid(ctx: &ApiCtx, req: Request<Body>) -> Response<Body> {
    let body = match read_json(req).await {
        Ok(v) => v,
        Err(rsp) => return rsp,
    };
    let buyer_id = body.get("buyer_id").and_then(|v| v.as_str());
    let buyer_name = body.get("buyer_name").and_then(|v| v.as_str());
    let amount = body.get("amount_per_kg").and_then(|v| v.as_f64());
    let (buyer_id, buyer_name, amount) = match (buyer_id, buyer_name, amount) {
        (Some(id), Some(name), Some(a)) if a > 0.0 => (id, name, a),
        _ => return bad_request("buyer_id, buyer_name and amount_per_kg are required"),
    };
    let channel = body
        .get("channel")
        .and_then(|v| v.as_str())
        .and_then(BidChannel::parse)
        .unwrap_or(BidChannel::Ui);

    match ctx.store.submit_external_bid(buyer_id, buyer_name, amount, channel) {
        Ok(bid) => json_response(StatusCode::OK, serde_json::to_value(&bid).unwrap_or(Value::Null)),
        Err(err) => state_error_response(err),
    }
}

fn auction_status(ctx: &ApiCtx) -> Response<Body> {
    let (phase, has_catch, approved) = ctx.store.status();
    json_response(
        StatusCode::OK,
        json!({ "state": phase, "has_catch": has_catch, "deal_approved": approved }),
    )
}

async fn reset(ctx: &ApiCtx) -> Response<Body> {
    ctx.stop_current_run();
    ctx.store.reset_auction();
    info!("auction reset");
    json_response(StatusCode::OK, json!({ "ok": true }))
}

/// Shared handling for every inbound free-text command.
fn apply_inbound(ctx: &ApiCtx, buyer_id: &str, buyer_name: &str, channel: BidChannel, text: &str) {
    match parse_command(text) {
        Some(InboundCommand::Bid(amount)) => {
            if let Err(err) = ctx.store.submit_external_bid(buyer_id, buyer_name, amount, channel)
            {
                warn!(%err, buyer_id, "inbound bid rejected");
            }
        }
        Some(InboundCommand::Buy) => {
            if ctx.store.phase() == AuctionPhase::Liquidation {
                ctx.store.add_log(
                    AgentTag::HumanBid,
                    format!("{buyer_name} claimed the flash-sale lot (first BUY)."),
                );
            } else {
                warn!(buyer_id, "BUY outside liquidation ignored");
            }
        }
        Some(InboundCommand::Announce { species, weight_kg, grade }) => {
            let record = record_from_fields(&species, weight_kg, grade);
            ctx.store.set_catch(record.clone());
            ctx.store.set_phase(AuctionPhase::Scanning);
            ctx.store.add_log(
                AgentTag::System,
                format!(
                    "Catch registered over SMS: {:.1} kg {} Grade {:?}.",
                    record.weight_kg, record.species, record.quality_grade
                ),
            );
        }
        None => {}
    }
}

async fn webhook_twilio(ctx: &ApiCtx, req: Request<Body>, channel: BidChannel) -> Response<Body> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(_) => return bad_request("unreadable body"),
    };
    let form = String::from_utf8_lossy(&bytes);
    let inbound = match parse_twilio_form(&form) {
        Some(i) => i,
        None => return bad_request("From and Body are required"),
    };
    let buyer_id = buyer_id_from_contact(&inbound.from);
    let buyer_name = format!("Buyer {}", &buyer_id[4..]);
    apply_inbound(ctx, &buyer_id, &buyer_name, channel, &inbound.body);

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/xml")
        .body(Body::from("<Response></Response>"))
        .unwrap_or_default()
}

async fn webhook_telegram(ctx: &ApiCtx, req: Request<Body>) -> Response<Body> {
    let body = match read_json(req).await {
        Ok(v) => v,
        Err(rsp) => return rsp,
    };
    if let Some((chat_id, name, text)) = parse_telegram_update(&body) {
        let tail = if chat_id.len() >= 4 { &chat_id[chat_id.len() - 4..] } else { &chat_id };
        apply_inbound(ctx, &format!("TG-{tail}"), &name, BidChannel::Telegram, &text);
    }
    json_response(StatusCode::OK, json!({ "ok": true }))
}

async fn voice_transcribe(ctx: &ApiCtx, req: Request<Body>) -> Response<Body> {
    let body = match read_json(req).await {
        Ok(v) => v,
        Err(rsp) => return rsp,
    };
    let audio = body.get("audio_base64").and_then(|v| v.as_str()).unwrap_or_default();
    let transcript = ctx.voice.transcribe(audio).await;
    let transcript_english = ctx.voice.translate(&transcript).await;
    let command = parse_voice_command(&transcript);
    if let Some(cmd) = &command {
        let grade = crate::domain::QualityGrade::B;
        let record = record_from_fields(&cmd.species, cmd.weight_kg, grade);
        ctx.store.set_catch(record);
        ctx.store.set_phase(AuctionPhase::Scanning);
        if cmd.start_auction {
            if let Some(catch) = ctx.store.catch() {
                ctx.start_run(catch);
            }
        }
    }
    json_response(
        StatusCode::OK,
        json!({
            "transcript": transcript,
            "transcript_english": transcript_english,
            "command": command.as_ref().map(|c| json!({
                "species": c.species,
                "weight_kg": c.weight_kg,
                "start_auction": c.start_auction,
            })),
        }),
    )
}

async fn voice_synthesize(ctx: &ApiCtx, req: Request<Body>) -> Response<Body> {
    let body = match read_json(req).await {
        Ok(v) => v,
        Err(rsp) => return rsp,
    };
    let text = match body.get("text").and_then(|v| v.as_str()) {
        Some(t) if !t.is_empty() => t,
        _ => return bad_request("text is required"),
    };
    let audio = ctx.voice.synthesize(text).await;
    json_response(StatusCode::OK, json!({ "audio_base64": audio }))
}

async fn voice_confirm_deal(ctx: &ApiCtx, req: Request<Body>) -> Response<Body> {
    let body = match read_json(req).await {
        Ok(v) => v,
        Err(rsp) => return rsp,
    };
    let buyer_name = body.get("buyer_name").and_then(|v| v.as_str()).unwrap_or("the buyer");
    let amount = body.get("amount_per_kg").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let net = body
        .get("net_profit")
        .and_then(|v| v.as_f64())
        .or_else(|| ctx.store.economics().map(|e| e.net_profit as f64))
        .unwrap_or(0.0);
    let text = deal_confirmation(buyer_name, amount, net);
    let audio = ctx.voice.synthesize(&text).await;
    json_response(StatusCode::OK, json!({ "text": text, "audio_base64": audio }))
}

// ---------- router & server ----------

async fn route(ctx: ApiCtx, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let rsp = match (method, path.as_str()) {
        (Method::POST, "/api/analyze-catch") => analyze_catch(&ctx, req).await,
        (Method::POST, "/api/start-auction") => start_auction(&ctx).await,
        (Method::POST, "/api/approve-deal") => approve_deal(&ctx).await,
        (Method::POST, "/api/place-bid") => place_bid(&ctx, req).await,
        (Method::POST, "/api/reset") => reset(&ctx).await,
        (Method::GET, "/api/auction-status") => auction_status(&ctx),
        (Method::POST, "/api/webhook/whatsapp") => {
            webhook_twilio(&ctx, req, BidChannel::Whatsapp).await
        }
        (Method::POST, "/api/webhook/sms") => {
            webhook_twilio(&ctx, req, BidChannel::Whatsapp).await
        }
        (Method::POST, "/api/webhook/telegram") => webhook_telegram(&ctx, req).await,
        (Method::POST, "/api/voice/transcribe") => voice_transcribe(&ctx, req).await,
        (Method::POST, "/api/voice/synthesize") => voice_synthesize(&ctx, req).await,
        (Method::POST, "/api/voice/confirm-deal") => voice_confirm_deal(&ctx, req).await,
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    };
    Ok(rsp)
}

pub async fn serve(ctx: ApiCtx, args: &Args) {
    let addr = SocketAddr::from(([0, 0, 0, 0], args.api_port));
    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| route(ctx.clone(), req)))
        }
    });
    info!(%addr, "api: listening");
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        warn!(error = %e, "api server exited");
    }
}
