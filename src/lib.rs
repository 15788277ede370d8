//! PledgeVault Server Library
//!
//! Core credit-ledger and warehouse-receipt pledge custody engine for the
//! PledgeVault supply-chain-finance platform: credit limit accounting with
//! an append-only usage journal, the pledge endorsement workflow anchored
//! on-chain, and the read-only warning engine.

pub mod anchor;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod pledge;
pub mod warning;
