//! Provisioning and bootstrapping of Consul and Nomad clusters on Hetzner Cloud.

pub mod bootstrap;
pub mod config;
pub mod consul;
pub mod inventory;
pub mod observability;
pub mod provision;
pub mod render;
pub mod secrets;

pub use bootstrap::{
    bootstrap, bootstrap_configured, configure, BootstrapError, BootstrapOutcome, Cluster,
    Configured,
};
