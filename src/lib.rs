// ===============================
// src/lib.rs
// ===============================
//
// AI-brokered fish auction engine: a catch photo in, a negotiated deal
// (or a liquidation flash sale) out, with every step streamed as SSE
// events. The binary in main.rs wires these modules to the HTTP surface.
//

pub mod api;
pub mod auction;
pub mod channels;
pub mod config;
pub mod domain;
pub mod market;
pub mod metrics;
pub mod reasoner;
pub mod reasoner_anthropic;
pub mod reasoner_mock;
pub mod recorder;
pub mod state;
pub mod stream;
pub mod vision;
pub mod voice;
pub mod webhook;
