pub mod api;
pub mod cache;
pub mod config;
pub mod handlers;
pub mod humanize;
pub mod job;
pub mod notify;
pub mod observability;
pub mod postprocess;
pub mod progress;
pub mod queue;
pub mod worker;
