//! Netguard - Network Access-Control Engine
//!
//! This crate implements a pure, concurrent decision engine for network
//! access control: priority-ordered rules bundled into atomically activated
//! profiles, sliding-window rate limiting, permanent and temporary bans,
//! trusted zones, and a bounded ledger of evaluated connections. The engine
//! performs no packet capture or network I/O of its own; the packet path
//! calls `Controller::evaluate` once per connection attempt with a
//! caller-supplied clock.

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
