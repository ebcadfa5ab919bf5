//! Utilities module - text helpers for source names and display

pub mod text_utils;

pub use text_utils::TextUtils;
