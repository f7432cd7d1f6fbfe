//! HTTP control surface for an ember node.
//!
//! Thin dispatch from JSON requests to the sandbox orchestrator, plus the
//! command-line configuration of the `ember-gateway` binary.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod routes;
