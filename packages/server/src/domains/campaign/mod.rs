//! Campaign concurrency engine: waitlist → promotion → two-phase lease,
//! plus the janitors that keep the bookkeeping honest.

pub mod breaker;
pub mod cold_start;
pub mod janitor;
pub mod keys;
pub mod leader;
pub mod lease;
pub mod ledger;
pub mod models;
pub mod promoter;
pub mod service;
pub mod stuck;
pub mod waitlist;
pub mod worker;
