//! Azure implementations of the deployer capabilities.

use std::path::Path;

use async_trait::async_trait;
use kubetest_cloud::{BlobStorage, CloudProviderError, ResourceManagerClient, ServicePrincipal};
use serde_json::Value;
use tracing::{debug, info};

use crate::artifacts::BlobStore;
use crate::cluster::Capabilities;
use crate::credentials::Credentials;
use crate::deploy::ResourceManager;
use crate::error::{ClusterError, Result};
use crate::fetch::HttpFetcher;
use crate::process::SystemCommandRunner;

#[async_trait]
impl ResourceManager for ResourceManagerClient {
    async fn ensure_resource_group(
        &self,
        name: &str,
        location: &str,
    ) -> Result<(), CloudProviderError> {
        ResourceManagerClient::ensure_resource_group(self, name, location).await?;
        Ok(())
    }

    async fn validate_deployment(
        &self,
        resource_group: &str,
        name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<(), CloudProviderError> {
        ResourceManagerClient::validate_deployment(self, resource_group, name, template, parameters)
            .await?;
        Ok(())
    }

    async fn create_deployment(
        &self,
        resource_group: &str,
        name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<(), CloudProviderError> {
        let deployment = ResourceManagerClient::create_deployment(
            self,
            resource_group,
            name,
            template,
            parameters,
        )
        .await?;
        debug!(id = %deployment.id, "Deployment finished");
        Ok(())
    }

    async fn delete_resource_group(&self, name: &str) -> Result<(), CloudProviderError> {
        ResourceManagerClient::delete_resource_group(self, name).await
    }
}

#[async_trait]
impl BlobStore for BlobStorage {
    async fn upload(&self, path: &Path, container: &str) -> Result<String, CloudProviderError> {
        self.upload_file(path, container).await
    }
}

impl Capabilities {
    /// Capabilities backed by Azure, the network and the local shell.
    ///
    /// The blob store is only set up when the credentials name a storage account.
    ///
    /// # Errors
    /// Returns error if a client cannot be created from the credentials.
    pub fn azure(credentials: &Credentials) -> Result<Self> {
        let auth = ServicePrincipal::new(
            &credentials.tenant_id,
            &credentials.client_id,
            &credentials.client_secret,
        )
        .map_err(ClusterError::Client)?;
        let arm = ResourceManagerClient::new(&credentials.subscription_id, auth)
            .map_err(ClusterError::Client)?;

        let blobs: Option<Box<dyn BlobStore>> = if credentials.has_storage_account() {
            let storage = BlobStorage::new(
                &credentials.storage_account_name,
                &credentials.storage_account_key,
            )
            .map_err(ClusterError::Client)?;
            Some(Box::new(storage))
        } else {
            info!("No storage account in credentials; Windows package uploads disabled");
            None
        };

        Ok(Self {
            arm: Box::new(arm),
            blobs,
            fetcher: Box::new(HttpFetcher::new().map_err(ClusterError::HttpClient)?),
            runner: Box::new(SystemCommandRunner),
        })
    }
}
