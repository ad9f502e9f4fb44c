//! loreferry - ferries public-inbox mailing-list archives into mail backends
//!
//! This crate provides the feed-ingestion and multi-target delivery engine:
//! epoch/commit tracking, message extraction and deduplication, the target
//! abstraction with its authentication flows, and the retry/failure-isolation
//! policy across concurrent deliveries.

pub mod auth;
pub mod config;
pub mod domain;
pub mod engine;
pub mod feeds;
pub mod storage;
pub mod targets;

pub use engine::{DeliveryEngine, ThreadSupervisor};
