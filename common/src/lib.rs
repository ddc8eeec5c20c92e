//! The `common` crate provides the ambient pieces shared by the `hshstack` tooling, namely
//! log initialisation and CLI argument helpers such as [`CliSecret`].
//!
//! [`CliSecret`]: clap::CliSecret

pub mod clap;
pub mod tracing;
