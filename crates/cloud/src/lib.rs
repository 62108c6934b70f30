//! Azure REST clients for kubetest cluster deployments.
//!
//! This crate covers the Azure surface an acs-engine based e2e run touches:
//!
//! - **Authentication** - service principal client-credentials tokens
//! - **Resource Manager** - resource groups and template deployments
//! - **Blob storage** - `SharedKey` block blob uploads for build artifacts
//!
//! ## Example
//!
//! ```rust,ignore
//! use kubetest_cloud::{ResourceManagerClient, ServicePrincipal};
//!
//! let auth = ServicePrincipal::new(tenant, client_id, secret)?;
//! let arm = ResourceManagerClient::new(subscription, auth)?;
//! arm.ensure_resource_group("kubetest-rg", "westus2").await?;
//! ```

pub mod arm;
pub mod auth;
mod error;
pub mod storage;

pub use arm::{Deployment, ResourceGroup, ResourceManagerClient};
pub use auth::ServicePrincipal;
pub use error::CloudProviderError;
pub use storage::BlobStorage;
