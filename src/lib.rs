//! PerpBot Library
//!
//! Unattended risk-managed trading engine for Bybit linear USDT perpetuals

pub mod config;
pub mod control;
pub mod engine;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod mood;
pub mod persistence;
pub mod risk;
pub mod selector;
pub mod signal;
pub mod types;
