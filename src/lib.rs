//! Cadenza — batch music acquisition orchestration
//!
//! Core engine of the Cadenza media library: turns one submitted task (a
//! single track or an entire playlist/album/artist catalog) into a sequence
//! of resolved, downloaded, deduplicated, and filed audio assets, with
//! crash-safe task-state tracking, bounded concurrency, adaptive throttling,
//! and multi-provider fallback matching.

pub mod cli;
pub mod config;
pub mod db;
pub mod jobs;
pub mod services;
