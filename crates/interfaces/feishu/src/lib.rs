//! Feishu (Lark) transport for the diary engine: the docx-backed
//! [`DocumentApi`](diarist_engine::DocumentApi), reply delivery, event
//! decoding and redelivery filtering, and chat command parsing.
pub mod blocks;
pub mod client;
pub mod dedupe;
pub mod events;
pub mod handler;
pub mod input;

pub use client::FeishuClient;
pub use dedupe::EventDeduper;
pub use events::{EnvelopeError, FeishuEvent, InboundMessage, decode_event};
pub use handler::{EventHandler, HandleOutcome};
pub use input::{Input, parse_input};
