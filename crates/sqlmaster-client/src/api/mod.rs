//! API module - HTTP interface to the remote NL-to-SQL service

pub mod client;
pub mod wire;

pub use client::ApiClient;
pub use wire::{ChatResponse, SchemaPayload};
