//! Azure Resource Manager request and response models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Resource groups
// ============================================================================

/// Body of a resource group create-or-update call.
#[derive(Debug, Serialize)]
pub struct ResourceGroupRequest<'a> {
    /// Azure region.
    pub location: &'a str,
}

/// A resource group as returned by ARM.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceGroup {
    /// Resource ID.
    #[serde(default)]
    pub id: String,
    /// Group name.
    pub name: String,
    /// Azure region.
    pub location: String,
    /// Group properties.
    #[serde(default)]
    pub properties: Option<ResourceGroupProperties>,
}

/// Resource group properties.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupProperties {
    /// Provisioning state (e.g. `Succeeded`, `Deleting`).
    pub provisioning_state: String,
}

// ============================================================================
// Template deployments
// ============================================================================

/// How ARM reconciles the template with existing resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeploymentMode {
    /// Leave resources not in the template alone.
    Incremental,
    /// Delete resources not in the template.
    Complete,
}

/// Body of a validate or create deployment call.
#[derive(Debug, Serialize)]
pub struct DeploymentRequest<'a> {
    /// Deployment properties.
    pub properties: DeploymentRequestProperties<'a>,
}

/// Template, parameters and mode of a deployment request.
#[derive(Debug, Serialize)]
pub struct DeploymentRequestProperties<'a> {
    /// ARM template document.
    pub template: &'a Value,
    /// Parameter values (already unwrapped from the `parameters` envelope).
    pub parameters: &'a Value,
    /// Deployment mode.
    pub mode: DeploymentMode,
}

/// A deployment as returned by ARM.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Deployment {
    /// Resource ID.
    #[serde(default)]
    pub id: String,
    /// Deployment name.
    #[serde(default)]
    pub name: String,
    /// Deployment properties.
    #[serde(default)]
    pub properties: Option<DeploymentProperties>,
    /// Error reported by the validate endpoint on older API versions.
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

impl Deployment {
    /// Provisioning state, empty when ARM omitted it.
    #[must_use]
    pub fn provisioning_state(&self) -> &str {
        self.properties
            .as_ref()
            .map_or("", |p| p.provisioning_state.as_str())
    }
}

/// Deployment properties.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProperties {
    /// Provisioning state (e.g. `Accepted`, `Running`, `Succeeded`, `Failed`).
    #[serde(default)]
    pub provisioning_state: String,
    /// Correlation ID for support requests.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Last update timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Failure details.
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

/// Provisioning states after which a deployment no longer changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Deployment completed.
    Succeeded,
    /// Deployment failed.
    Failed,
    /// Deployment was canceled.
    Canceled,
}

impl TerminalState {
    /// Classify a provisioning state string.
    #[must_use]
    pub fn from_state(state: &str) -> Option<Self> {
        match state {
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            "Canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// ARM error envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// ARM error details.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    /// Error code.
    #[serde(default)]
    pub code: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
    /// Nested errors.
    #[serde(default)]
    pub details: Vec<ErrorDetail>,
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for detail in &self.details {
            write!(f, "; {detail}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_display_includes_nested() {
        let detail: ErrorDetail = serde_json::from_value(serde_json::json!({
            "code": "InvalidTemplateDeployment",
            "message": "The template deployment is not valid",
            "details": [{ "code": "QuotaExceeded", "message": "Not enough cores" }]
        }))
        .unwrap();

        assert_eq!(
            detail.to_string(),
            "InvalidTemplateDeployment: The template deployment is not valid; \
             QuotaExceeded: Not enough cores"
        );
    }

    #[test]
    fn test_terminal_state_classification() {
        assert_eq!(TerminalState::from_state("Succeeded"), Some(TerminalState::Succeeded));
        assert_eq!(TerminalState::from_state("Canceled"), Some(TerminalState::Canceled));
        assert_eq!(TerminalState::from_state("Running"), None);
    }

    #[test]
    fn test_request_serializes_mode() {
        let template = serde_json::json!({ "resources": [] });
        let parameters = serde_json::json!({ "location": { "value": "westus2" } });
        let body = DeploymentRequest {
            properties: DeploymentRequestProperties {
                template: &template,
                parameters: &parameters,
                mode: DeploymentMode::Incremental,
            },
        };

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["properties"]["mode"], "Incremental");
        assert_eq!(value["properties"]["parameters"]["location"]["value"], "westus2");
    }
}
