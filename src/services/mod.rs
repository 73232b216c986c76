//! Job-tracking services.
//!
//! Leaf adapters (`record_store`, `blob_store`) sit at the bottom; the
//! managers on top receive a [`context::JobContext`] and never touch global
//! state.

pub mod blob_store;
pub mod chunks;
pub mod clock;
pub mod context;
pub mod export_jobs;
pub mod generation_jobs;
pub mod ids;
pub mod localization;
pub mod reaper;
pub mod record_store;
pub mod waiters;
