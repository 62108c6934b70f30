//! Submission of the expanded deployment to Azure Resource Manager.

use async_trait::async_trait;
use kubetest_cloud::CloudProviderError;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::expand::DeploymentArtifacts;

#[cfg(test)]
use mockall::automock;

/// Errors deploying the cluster, split by the call that failed.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The resource group could not be created.
    #[error("failed to create resource group {name}: {source}")]
    ResourceGroup {
        name: String,
        #[source]
        source: CloudProviderError,
    },

    /// Resource Manager rejected the template or its parameters.
    #[error("deployment validation failed: {source}")]
    Validation {
        #[source]
        source: CloudProviderError,
    },

    /// The deployment was accepted but did not succeed.
    #[error("deployment failed: {source}")]
    Deployment {
        #[source]
        source: CloudProviderError,
    },
}

impl DeployError {
    /// Whether the template was rejected before anything was deployed.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

/// Resource Manager operations the deployer needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Create the resource group if absent; succeed if it already exists.
    async fn ensure_resource_group(
        &self,
        name: &str,
        location: &str,
    ) -> Result<(), CloudProviderError>;

    /// Check the template and parameters without deploying.
    async fn validate_deployment(
        &self,
        resource_group: &str,
        name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<(), CloudProviderError>;

    /// Deploy and wait for the outcome.
    async fn create_deployment(
        &self,
        resource_group: &str,
        name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<(), CloudProviderError>;

    /// Delete the resource group and everything in it.
    async fn delete_resource_group(&self, name: &str) -> Result<(), CloudProviderError>;
}

/// Ensures the resource group, validates, then deploys.
pub struct DeploymentExecutor<'a> {
    arm: &'a dyn ResourceManager,
}

impl<'a> DeploymentExecutor<'a> {
    #[must_use]
    pub fn new(arm: &'a dyn ResourceManager) -> Self {
        Self { arm }
    }

    /// Deploy `artifacts` as `cluster_name` into `resource_group`.
    ///
    /// # Errors
    /// Returns the [`DeployError`] variant of the first call that failed.
    pub async fn execute(
        &self,
        resource_group: &str,
        location: &str,
        cluster_name: &str,
        artifacts: &DeploymentArtifacts,
    ) -> Result<(), DeployError> {
        self.arm
            .ensure_resource_group(resource_group, location)
            .await
            .map_err(|source| DeployError::ResourceGroup {
                name: resource_group.to_string(),
                source,
            })?;

        self.arm
            .validate_deployment(
                resource_group,
                cluster_name,
                &artifacts.template,
                &artifacts.parameters,
            )
            .await
            .map_err(|source| DeployError::Validation { source })?;
        info!(resource_group = %resource_group, deployment = %cluster_name, "Deployment validated");

        self.arm
            .create_deployment(
                resource_group,
                cluster_name,
                &artifacts.template,
                &artifacts.parameters,
            )
            .await
            .map_err(|source| DeployError::Deployment { source })?;
        info!(resource_group = %resource_group, deployment = %cluster_name, "Deployment succeeded");

        Ok(())
    }
}
