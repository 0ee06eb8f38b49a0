//! Slack interface for perkbot
//!
//! - **Socket Mode** (`socket`) - event loop with reconnection logic
//! - **Slash Commands** (`commands`) - `/beneficios-broadcast-preview`
//! - **Events** (`events`) - button presses and channel joins
//! - **Block Kit** (`blocks`) - preview, report and welcome cards
//! - **Web API** (`web_api`) - the Slack implementation of the broadcast ports
//! - **Service** (`service`) - glue between Slack interactions and the broadcast campaign
//!
//! # Architecture
//!
//! ```text
//! Slack Events → EventDispatcher → BroadcastService → BroadcastCampaign
//!                    ↓                                      ↓
//!              Block Kit UI ← Response          SlackWebClient (Web API)
//! ```

pub mod blocks;
pub mod commands;
pub mod events;
pub mod service;
pub mod socket;
pub mod web_api;

pub use service::BroadcastService;
pub use socket::{ReconnectPolicy, SocketModeRunner};
pub use web_api::SlackWebClient;
