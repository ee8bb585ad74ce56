// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Auction lifecycle --------
pub static AUCTIONS_STARTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("auctions_started_total", "auction runs started").unwrap());

pub static DEALS_SECURED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("deals_secured_total", "deals confirmed (manual or auto)").unwrap());

pub static LIQUIDATIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("liquidations_total", "auctions ending in liquidation").unwrap());

pub static BIDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bids_total", "bids recorded (labels: channel, source)"),
        &["channel", "source"],
    )
    .unwrap()
});

pub static TOOL_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tool_calls_total", "reasoner tool calls dispatched"),
        &["tool"],
    )
    .unwrap()
});

pub static REASONER_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("reasoner_errors_total", "failed reasoner invocations").unwrap());

// -------- Transport --------
pub static EVENTS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_published_total", "auction events published (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static SSE_CLIENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("sse_clients", "currently subscribed SSE clients").unwrap());

// -------- Channel adapters --------
pub static CHANNEL_SENDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("channel_sends_total", "outbound messages (labels: channel, outcome)"),
        &["channel", "outcome"],
    )
    .unwrap()
});

// ---- Config visibility (reasoner / channel modes) ----
pub static CONFIG_REASONER_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_reasoner_mode", "reasoner mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_CHANNEL_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_channel_mode", "channel mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(AUCTIONS_STARTED.clone())),
        REGISTRY.register(Box::new(DEALS_SECURED.clone())),
        REGISTRY.register(Box::new(LIQUIDATIONS.clone())),
        REGISTRY.register(Box::new(BIDS.clone())),
        REGISTRY.register(Box::new(TOOL_CALLS.clone())),
        REGISTRY.register(Box::new(REASONER_ERRORS.clone())),
        REGISTRY.register(Box::new(EVENTS_PUBLISHED.clone())),
        REGISTRY.register(Box::new(SSE_CLIENTS.clone())),
        REGISTRY.register(Box::new(CHANNEL_SENDS.clone())),
        REGISTRY.register(Box::new(CONFIG_REASONER_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_CHANNEL_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
