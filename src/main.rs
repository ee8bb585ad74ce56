// ===============================
// src/main.rs
// ===============================
/*
 # live config
 curl -s localhost:9898/metrics | egrep '^config_(reasoner_mode|channel_mode)'

 # auction activity
 curl -s localhost:9898/metrics | grep '^events_published_total'
 curl -s localhost:9898/metrics | grep '^bids_total'

 # kick off a demo run
 curl -s -X POST localhost:5000/api/analyze-catch -d '{"image_base64":"zz"}'
 curl -s -N -X POST localhost:5000/api/start-auction
*/
use std::sync::Arc;
use tokio::{select, sync::mpsc, time::Duration};
use tracing::info;

use fishbid::channels::ChannelSender;
use fishbid::domain::Event;
use fishbid::reasoner::NegotiationReasoner;
use fishbid::state::Store;
use fishbid::stream::EventBus;
use fishbid::{api, channels, config, metrics, reasoner_anthropic, reasoner_mock, recorder, vision, voice};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config & tuning ----
    let (args, tuning) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        reasoner_mode = args.reasoner_mode.as_str(),
        channel_mode = args.channel_mode.as_str(),
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        model = %args.anthropic_model,
        "startup config"
    );
    metrics::CONFIG_REASONER_MODE
        .with_label_values(&[args.reasoner_mode.as_str()])
        .set(1);
    metrics::CONFIG_CHANNEL_MODE
        .with_label_values(&[args.channel_mode.as_str()])
        .set(1);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let rec_tx = if let Some(path) = args.record_file.clone() {
        tokio::spawn(recorder::run(rec_rx, path));
        Some(rec_tx)
    } else {
        None
    };

    // ---- Event bus + store ----
    let bus = EventBus::new(4096);
    let store = Store::new(bus.clone(), rec_tx.clone());

    // ---- Reasoner (mock/anthropic) ----
    let reasoner: Arc<dyn NegotiationReasoner> = match args.reasoner_mode {
        config::ReasonerMode::Mock => Arc::new(reasoner_mock::MockReasoner::new()),
        config::ReasonerMode::Anthropic => {
            Arc::new(reasoner_anthropic::AnthropicReasoner::new(&args))
        }
    };

    // ---- Messaging channels (mock/live) ----
    let channels: Arc<dyn ChannelSender> = match args.channel_mode {
        config::ChannelMode::Mock => Arc::new(channels::MockChannels::new()),
        config::ChannelMode::Live => {
            let contacts = std::env::var("BUYER_WHATSAPP_NUMBERS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            Arc::new(channels::LiveChannels::new(&args, contacts))
        }
    };

    // ---- Vision + voice adapters ----
    let vision = Arc::new(vision::VisionClient::new(&args));
    let voice = Arc::new(voice::VoiceClient::new(&args));

    // ---- HTTP API ----
    let ctx = api::ApiCtx::new(store.clone(), reasoner, channels, vision, voice, tuning);
    tokio::spawn({
        let args = args.clone();
        async move {
            api::serve(ctx, &args).await;
        }
    });

    // ---- Heartbeat ----
    let mut bus_rx = bus.subscribe();
    let mut event_count: u64 = 0;
    loop {
        select! {
            Ok(_ev) = bus_rx.recv() => {
                event_count += 1;
            },
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                let (phase, has_catch, approved) = store.status();
                info!(events = event_count, ?phase, has_catch, approved, "heartbeat");
                event_count = 0;
            }
        }
    }
}
