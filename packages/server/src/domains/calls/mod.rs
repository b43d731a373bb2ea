//! Outbound calls: logs, telephony contract, initiation, webhooks.

pub mod models;
pub mod outgoing;
pub mod telephony;
pub mod webhook;
