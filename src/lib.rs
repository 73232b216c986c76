//! Background job orchestration over a shared, TTL-aware record store.
//!
//! Export jobs, generation requests, chunks and waiter subscriptions all live
//! in one record table, separated by key prefix. Managers in [`services`] are
//! cheap to clone and meant to be driven from worker tasks.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
