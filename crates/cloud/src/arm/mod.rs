//! Azure Resource Manager.
//!
//! Covers the two ARM surfaces a template-based cluster deployment needs:
//!
//! - **Resource groups** - create-or-update, get, delete (cascading)
//! - **Deployments** - validate, create-and-wait, get

mod client;
mod models;

pub use client::{ResourceManagerClient, DEFAULT_ARM_ENDPOINT};
pub use models::*;
