//! Shared domain types for turnwise: configuration, the common error type,
//! transport/backend event shapes and structured trace events.

pub mod config;
pub mod error;
pub mod event;
pub mod trace;
pub mod turn;
