//! # TideWatch Client Types
//!
//! Shared entity and API types for TideWatch, the autonomous
//! container update orchestrator. The server binary
//! (`tidewatch_core`) depends on this crate for every persisted
//! entity, event payload, and API body; external consumers can use
//! it to deserialize API responses and event-stream messages.

pub mod api;
pub mod entities;
