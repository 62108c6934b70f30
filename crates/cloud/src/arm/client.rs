//! Azure Resource Manager client implementation.

use std::time::{Duration, Instant};

use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::models::{
    Deployment, DeploymentMode, DeploymentRequest, DeploymentRequestProperties, ErrorResponse,
    ResourceGroup, ResourceGroupRequest, TerminalState,
};
use crate::auth::ServicePrincipal;
use crate::error::CloudProviderError;

/// Public cloud Resource Manager endpoint.
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

/// API version for resource groups and deployments.
const RESOURCES_API_VERSION: &str = "2021-04-01";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Polling interval when waiting for long-running operations.
const POLL_INTERVAL_SECS: u64 = 15;

/// How long a cluster deployment may take before we give up waiting.
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 3600;

/// Client for resource groups and template deployments in one subscription.
pub struct ResourceManagerClient {
    /// HTTP client.
    client: Client,
    /// Resource Manager endpoint.
    endpoint: String,
    /// Subscription ID.
    subscription_id: String,
    /// Token source.
    auth: ServicePrincipal,
    /// Interval between status polls.
    poll_interval: Duration,
    /// Upper bound for deployments and deletions.
    operation_timeout: Duration,
}

impl ResourceManagerClient {
    /// Create a new Resource Manager client.
    ///
    /// # Arguments
    /// * `subscription_id` - Azure subscription ID
    /// * `auth` - Service principal used to mint bearer tokens
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        subscription_id: impl Into<String>,
        auth: ServicePrincipal,
    ) -> Result<Self, CloudProviderError> {
        let subscription_id = subscription_id.into();
        if subscription_id.is_empty() {
            return Err(CloudProviderError::Config("empty subscription id".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudProviderError::Http)?;

        Ok(Self {
            client,
            endpoint: DEFAULT_ARM_ENDPOINT.to_string(),
            subscription_id,
            auth,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
        })
    }

    /// Point the client at a different Resource Manager endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Change the interval between status polls.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Change how long deployments and deletions may run.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    fn resource_group_url(&self, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourcegroups/{}?api-version={}",
            self.endpoint, self.subscription_id, name, RESOURCES_API_VERSION
        )
    }

    fn deployment_url(&self, resource_group: &str, name: &str, action: Option<&str>) -> String {
        let action = action.map(|a| format!("/{a}")).unwrap_or_default();
        format!(
            "{}/subscriptions/{}/resourcegroups/{}/providers/Microsoft.Resources/deployments/{}{}\
             ?api-version={}",
            self.endpoint, self.subscription_id, resource_group, name, action, RESOURCES_API_VERSION
        )
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, CloudProviderError> {
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(url)
            .bearer_auth(self.auth.token().await?)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated request with a JSON body.
    async fn send_json<T, B>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &B,
    ) -> Result<T, CloudProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        debug!(url = %url, method = %method, "JSON request");

        let response = self
            .client
            .request(method, url)
            .bearer_auth(self.auth.token().await?)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                CloudProviderError::Serialization(e)
            })
        } else {
            Err(Self::error_for(status, text))
        }
    }

    fn error_for(status: StatusCode, text: String) -> CloudProviderError {
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.error.to_string())
            .unwrap_or(text);

        match status {
            StatusCode::NOT_FOUND => CloudProviderError::NotFound(message),
            StatusCode::BAD_REQUEST => CloudProviderError::BadRequest(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudProviderError::Auth(message),
            _ => CloudProviderError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }

    // ========================================================================
    // Resource groups
    // ========================================================================

    /// Create the resource group, or update it in place if it already exists.
    ///
    /// # Errors
    /// Returns error if ARM rejects the request.
    pub async fn ensure_resource_group(
        &self,
        name: &str,
        location: &str,
    ) -> Result<ResourceGroup, CloudProviderError> {
        info!(resource_group = %name, location = %location, "Ensuring resource group");

        let url = self.resource_group_url(name);
        let group: ResourceGroup = self
            .send_json(reqwest::Method::PUT, &url, &ResourceGroupRequest { location })
            .await?;

        debug!(resource_group = %group.name, id = %group.id, "Resource group ready");
        Ok(group)
    }

    /// Get a resource group.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::NotFound`] if the group does not exist.
    pub async fn get_resource_group(
        &self,
        name: &str,
    ) -> Result<ResourceGroup, CloudProviderError> {
        self.get(&self.resource_group_url(name)).await
    }

    /// Delete a resource group and every resource in it, waiting until it is gone.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::NotFound`] if the group does not exist,
    /// or a timeout if deletion does not finish in time.
    pub async fn delete_resource_group(&self, name: &str) -> Result<(), CloudProviderError> {
        info!(resource_group = %name, "Deleting resource group");

        let url = self.resource_group_url(name);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(self.auth.token().await?)
            .send()
            .await?;

        let status = response.status();
        if !(status.is_success() || status == StatusCode::ACCEPTED) {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::error_for(status, text));
        }

        let start = Instant::now();
        loop {
            match self.get_resource_group(name).await {
                Err(e) if e.is_not_found() => {
                    info!(resource_group = %name, "Resource group deleted");
                    return Ok(());
                }
                Err(e) => return Err(e),
                Ok(group) => {
                    debug!(
                        resource_group = %name,
                        state = ?group.properties.map(|p| p.provisioning_state),
                        elapsed_secs = start.elapsed().as_secs(),
                        "Waiting for resource group deletion"
                    );
                }
            }

            if start.elapsed() > self.operation_timeout {
                return Err(CloudProviderError::Timeout(self.operation_timeout.as_secs()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    // ========================================================================
    // Deployments
    // ========================================================================

    /// Ask ARM whether the template would deploy, without deploying it.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::BadRequest`] when the template or
    /// parameters are rejected.
    pub async fn validate_deployment(
        &self,
        resource_group: &str,
        name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<Deployment, CloudProviderError> {
        info!(resource_group = %resource_group, deployment = %name, "Validating deployment");

        let url = self.deployment_url(resource_group, name, Some("validate"));
        let body = Self::deployment_body(template, parameters);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.auth.token().await?)
            .json(&body)
            .send()
            .await?;

        // Validation may run as a long-running operation tracked at `Location`.
        let result = if response.status() == StatusCode::ACCEPTED {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
                .ok_or_else(|| CloudProviderError::Api {
                    status: StatusCode::ACCEPTED.as_u16(),
                    message: "validation accepted without a Location header".to_string(),
                })?;
            self.wait_validation(name, &location).await?
        } else {
            Self::handle_response(response).await?
        };

        if let Some(error) = result.error {
            return Err(CloudProviderError::BadRequest(error.to_string()));
        }
        Ok(result)
    }

    /// Poll a validation operation until ARM stops answering `202 Accepted`.
    async fn wait_validation(
        &self,
        name: &str,
        location: &str,
    ) -> Result<Deployment, CloudProviderError> {
        let start = Instant::now();
        loop {
            if start.elapsed() > self.operation_timeout {
                return Err(CloudProviderError::Timeout(self.operation_timeout.as_secs()));
            }
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .client
                .get(location)
                .bearer_auth(self.auth.token().await?)
                .send()
                .await?;
            let status = response.status();
            if status == StatusCode::ACCEPTED {
                debug!(
                    deployment = %name,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Waiting for deployment validation"
                );
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                return Err(Self::error_for(status, text));
            }
            if text.trim().is_empty() {
                return Ok(Deployment::default());
            }
            return serde_json::from_str(&text).map_err(CloudProviderError::Serialization);
        }
    }

    /// Submit a deployment and wait for it to reach a terminal state.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::OperationFailed`] if the deployment
    /// ends `Failed` or `Canceled`.
    pub async fn create_deployment(
        &self,
        resource_group: &str,
        name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<Deployment, CloudProviderError> {
        info!(resource_group = %resource_group, deployment = %name, "Creating deployment");

        let url = self.deployment_url(resource_group, name, None);
        let body = Self::deployment_body(template, parameters);
        let submitted: Deployment = self.send_json(reqwest::Method::PUT, &url, &body).await?;

        debug!(
            deployment = %name,
            state = %submitted.provisioning_state(),
            "Deployment submitted"
        );

        self.wait_deployment(resource_group, name, submitted).await
    }

    /// Get a deployment.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::NotFound`] if the deployment does not exist.
    pub async fn get_deployment(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Deployment, CloudProviderError> {
        self.get(&self.deployment_url(resource_group, name, None))
            .await
    }

    async fn wait_deployment(
        &self,
        resource_group: &str,
        name: &str,
        mut current: Deployment,
    ) -> Result<Deployment, CloudProviderError> {
        let start = Instant::now();

        loop {
            match TerminalState::from_state(current.provisioning_state()) {
                Some(TerminalState::Succeeded) => {
                    info!(
                        deployment = %name,
                        elapsed_secs = start.elapsed().as_secs(),
                        "Deployment succeeded"
                    );
                    return Ok(current);
                }
                Some(state) => {
                    let message = current
                        .properties
                        .as_ref()
                        .and_then(|p| p.error.as_ref())
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    return Err(CloudProviderError::OperationFailed {
                        operation: format!("deployment {name}"),
                        state: format!("{state:?}"),
                        message,
                    });
                }
                None => {}
            }

            if start.elapsed() > self.operation_timeout {
                return Err(CloudProviderError::Timeout(self.operation_timeout.as_secs()));
            }

            tokio::time::sleep(self.poll_interval).await;
            current = self.get_deployment(resource_group, name).await?;
            debug!(
                deployment = %name,
                state = %current.provisioning_state(),
                elapsed_secs = start.elapsed().as_secs(),
                "Polling deployment status"
            );
        }
    }

    fn deployment_body<'a>(template: &'a Value, parameters: &'a Value) -> DeploymentRequest<'a> {
        DeploymentRequest {
            properties: DeploymentRequestProperties {
                template,
                parameters,
                mode: DeploymentMode::Incremental,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SUB: &str = "sub-123";

    async fn client_for(server: &MockServer) -> ResourceManagerClient {
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "token",
                "expires_in": 3600
            })))
            .mount(server)
            .await;

        let auth = ServicePrincipal::new("tenant", "client", "secret")
            .unwrap()
            .with_authority(server.uri());

        ResourceManagerClient::new(SUB, auth)
            .unwrap()
            .with_endpoint(server.uri())
            .with_poll_interval(Duration::ZERO)
            .with_operation_timeout(Duration::from_secs(5))
    }

    fn group_path(name: &str) -> String {
        format!("/subscriptions/{SUB}/resourcegroups/{name}")
    }

    fn operation_url(server: &MockServer, id: &str) -> String {
        format!("{}/operationresults/{id}", server.uri())
    }

    fn deployment_path(rg: &str, name: &str) -> String {
        format!(
            "/subscriptions/{SUB}/resourcegroups/{rg}\
             /providers/Microsoft.Resources/deployments/{name}"
        )
    }

    #[tokio::test]
    async fn test_ensure_resource_group_is_idempotent() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("PUT"))
            .and(path(group_path("kubetest-rg")))
            .and(body_partial_json(json!({ "location": "westus2" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "/subscriptions/sub-123/resourceGroups/kubetest-rg",
                "name": "kubetest-rg",
                "location": "westus2",
                "properties": { "provisioningState": "Succeeded" }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(group_path("kubetest-rg")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "kubetest-rg",
                "location": "westus2"
            })))
            .mount(&server)
            .await;

        let first = client.ensure_resource_group("kubetest-rg", "westus2").await.unwrap();
        let second = client.ensure_resource_group("kubetest-rg", "westus2").await.unwrap();
        assert_eq!(first.name, "kubetest-rg");
        assert_eq!(second.location, "westus2");
    }

    #[tokio::test]
    async fn test_validation_rejection_is_bad_request() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("POST"))
            .and(path(format!("{}/validate", deployment_path("rg", "cluster"))))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": "InvalidTemplate", "message": "Unexpected token" }
            })))
            .mount(&server)
            .await;

        let err = client
            .validate_deployment("rg", "cluster", &json!({}), &json!({}))
            .await
            .unwrap_err();

        assert!(
            matches!(err, CloudProviderError::BadRequest(ref m) if m.contains("InvalidTemplate"))
        );
    }

    #[tokio::test]
    async fn test_accepted_validation_polls_location_until_valid() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("POST"))
            .and(path(format!("{}/validate", deployment_path("rg", "cluster"))))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", operation_url(&server, "validate-1")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operationresults/validate-1"))
            .respond_with(ResponseTemplate::new(202))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operationresults/validate-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "cluster",
                "properties": { "provisioningState": "Succeeded" }
            })))
            .mount(&server)
            .await;

        let result = client
            .validate_deployment("rg", "cluster", &json!({}), &json!({}))
            .await
            .unwrap();
        assert_eq!(result.provisioning_state(), "Succeeded");
    }

    #[tokio::test]
    async fn test_accepted_validation_that_fails_is_bad_request() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("POST"))
            .and(path(format!("{}/validate", deployment_path("rg", "cluster"))))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", operation_url(&server, "validate-2")),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operationresults/validate-2"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "code": "InvalidTemplateDeployment",
                    "message": "masterCount out of range"
                }
            })))
            .mount(&server)
            .await;

        let err = client
            .validate_deployment("rg", "cluster", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CloudProviderError::BadRequest(ref m) if m.contains("InvalidTemplateDeployment")
        ));
    }

    #[tokio::test]
    async fn test_accepted_validation_without_location_is_api_error() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("POST"))
            .and(path(format!("{}/validate", deployment_path("rg", "cluster"))))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let err = client
            .validate_deployment("rg", "cluster", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudProviderError::Api { status: 202, .. }));
    }

    #[tokio::test]
    async fn test_create_deployment_polls_until_succeeded() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("PUT"))
            .and(path(deployment_path("rg", "cluster")))
            .and(body_partial_json(json!({ "properties": { "mode": "Incremental" } })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "name": "cluster",
                "properties": { "provisioningState": "Accepted" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(deployment_path("rg", "cluster")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "cluster",
                "properties": { "provisioningState": "Running" }
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(deployment_path("rg", "cluster")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "cluster",
                "properties": { "provisioningState": "Succeeded" }
            })))
            .mount(&server)
            .await;

        let deployment = client
            .create_deployment("rg", "cluster", &json!({}), &json!({}))
            .await
            .unwrap();
        assert_eq!(deployment.provisioning_state(), "Succeeded");
    }

    #[tokio::test]
    async fn test_failed_deployment_reports_error_detail() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("PUT"))
            .and(path(deployment_path("rg", "cluster")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "cluster",
                "properties": {
                    "provisioningState": "Failed",
                    "error": { "code": "DeploymentFailed", "message": "VM quota" }
                }
            })))
            .mount(&server)
            .await;

        let err = client
            .create_deployment("rg", "cluster", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudProviderError::OperationFailed { .. }));
        assert!(err.to_string().contains("VM quota"));
    }

    #[tokio::test]
    async fn test_delete_missing_group_surfaces_not_found() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("DELETE"))
            .and(path(group_path("gone-rg")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {
                    "code": "ResourceGroupNotFound",
                    "message": "Resource group 'gone-rg' could not be found."
                }
            })))
            .mount(&server)
            .await;

        let err = client.delete_resource_group("gone-rg").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("ResourceGroupNotFound"));
    }

    #[tokio::test]
    async fn test_delete_waits_for_group_to_disappear() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;

        Mock::given(method("DELETE"))
            .and(path(group_path("rg")))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(group_path("rg")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "rg",
                "location": "westus2",
                "properties": { "provisioningState": "Deleting" }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(group_path("rg")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client.delete_resource_group("rg").await.unwrap();
    }
}
