//! HTTP adapter between the chat transport and the queue manager

pub mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;
pub(crate) mod utils;
mod validation;

pub use server::{router, run, shutdown_signal};
