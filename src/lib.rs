//! adselect - Ad selection and frequency control for a news publishing site.
//!
//! # Overview
//!
//! Given a placement request (page type, device, session, URL, optional
//! category/article context) the engine finds eligible ads, applies per-ad
//! frequency caps and per-page dedup rules from delivery history, picks a
//! bounded set of winners with at most one ad per collection, and records
//! their impressions exactly once.
//!
//! # Modules
//!
//! - [`model`]: Ads, collections, events and request/response types
//! - [`store`]: Event store, candidate repository and cache seams
//! - [`storage`]: SQLite implementation of the store seams
//! - [`frequency`]: Frequency control engine
//! - [`cache`]: Selection fingerprint and in-process TTL cache
//! - [`recorder`]: Idempotent event recording
//! - [`selection`]: Selection orchestrator
//! - [`api`]: HTTP API handlers
//! - [`config`]: Environment configuration
//! - [`error`]: Error types

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod frequency;
pub mod model;
pub mod recorder;
pub mod selection;
pub mod storage;
pub mod store;
