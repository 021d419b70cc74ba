//! Sandbox Core
//!
//! Idempotent, dependency-ordered provisioning of a small cloud sandbox:
//! locate-or-create for every resource, bounded waits over eventual
//! consistency, and an explicit reverse-order teardown.

pub mod blueprint;
pub mod config;
pub mod error;
pub mod factory;
pub mod locator;
pub mod provider;
pub mod resource;
pub mod sequencer;
pub mod teardown;
pub mod template;
pub mod waiter;

#[cfg(test)]
mod testing;
