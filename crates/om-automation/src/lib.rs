//! Merge engine for Ops Manager automation configs.
//!
//! The automation config is a single JSON document shared by Ops Manager, its
//! users and the automation agents. This crate merges desired processes,
//! replica sets and sharded clusters into such a document without dropping
//! anything it does not own.
//!
//! ## Crate Features
//!
//! - `default` enables `clap`.
//! - `clap` derives [`clap::Args`] for the structs in [`options`].

pub mod automation_config;
pub mod deployment;
pub mod document;
pub mod options;
pub mod process;
pub mod prometheus;
pub mod replica_set;
pub mod scale;
pub mod sharded_cluster;
pub mod sync;
pub mod tls;

pub use automation_config::AutomationConfig;
pub use deployment::Deployment;
