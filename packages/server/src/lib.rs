//! Outbound-call campaign dispatcher.
//!
//! The hard core is a distributed concurrency controller: per campaign,
//! the number of simultaneously live calls never exceeds the configured
//! limit, even across worker restarts, lost carrier webhooks, and bursty
//! enqueues. The secondary core is the scheduler that releases one-shot
//! and recurring calls honoring timezone and business-hour rules.
//!
//! ```text
//! enqueue ─► waitlist ─► promoter (reserves slots) ─► ready job
//!                                                        │
//!                      campaign worker ── pre-dial lease ─┤
//!                                                        ▼
//!                      telephony ── answer ─► active lease ─► webhook ─► release
//! ```

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;
