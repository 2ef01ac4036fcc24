//! # fxc-tests
//!
//! Integration tests for the Fittexxcoin P2P layer.
//!
//! This crate provides:
//! - Property-based tests for framing, send queues, eviction and outbound
//!   selection
//! - Loopback tests running connection managers over real sockets

pub mod generators;
pub mod harness;


#[cfg(test)]
mod loopback_tests;

pub use generators::*;
pub use harness::*;
