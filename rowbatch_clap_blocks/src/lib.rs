//! Building blocks for [`clap`]-driven configuration of binaries embedding a write engine.
//!
//! Each block is a `#[derive(clap::Parser)]` struct meant to be `#[clap(flatten)]`-ed into a
//! binary's own config.
pub mod logging;
pub mod tokio;
pub mod writer;
