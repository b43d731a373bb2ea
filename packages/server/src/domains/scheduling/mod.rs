//! Scheduled-call engine: delayed one-shot and recurring calls with
//! timezone and business-hours handling.

pub mod business_hours;
pub mod models;
pub mod service;
