//! Azure credentials file.
//!
//! The file is TOML with a single `[Creds]` table:
//!
//! ```toml
//! [Creds]
//! ClientID = "..."
//! ClientSecret = "..."
//! TenantID = "..."
//! SubscriptionID = "..."
//! StorageAccountName = "..."
//! StorageAccountKey = "..."
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Errors loading the credentials file.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// File could not be read.
    #[error("error reading credentials file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML or lacks the `[Creds]` table.
    #[error("error parsing credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A field the cloud client needs is empty.
    #[error("credentials file {path} has an empty {field}")]
    Empty { path: PathBuf, field: &'static str },
}

/// Service principal and storage account used for one run.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Application (client) ID.
    #[serde(rename = "ClientID", alias = "ClientId")]
    pub client_id: String,
    /// Application secret.
    #[serde(rename = "ClientSecret")]
    pub client_secret: String,
    /// Directory (tenant) ID.
    #[serde(rename = "TenantID", alias = "TenantId")]
    pub tenant_id: String,
    /// Subscription the cluster is billed to.
    #[serde(rename = "SubscriptionID", alias = "SubscriptionId")]
    pub subscription_id: String,
    /// Storage account receiving build artifacts.
    #[serde(rename = "StorageAccountName", default)]
    pub storage_account_name: String,
    /// Base64 key of the storage account.
    #[serde(rename = "StorageAccountKey", default)]
    pub storage_account_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .field("storage_account_name", &self.storage_account_name)
            .field("storage_account_key", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(rename = "Creds")]
    creds: Credentials,
}

impl Credentials {
    /// Whether a storage account is configured for artifact uploads.
    #[must_use]
    pub fn has_storage_account(&self) -> bool {
        !self.storage_account_name.is_empty() && !self.storage_account_key.is_empty()
    }

    /// Parse credentials from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or a service principal field is empty.
    pub fn from_toml(path: &Path, content: &str) -> Result<Self, CredentialsError> {
        let file: CredentialsFile =
            toml::from_str(content).map_err(|source| CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let creds = file.creds;

        for (field, value) in [
            ("ClientID", &creds.client_id),
            ("ClientSecret", &creds.client_secret),
            ("TenantID", &creds.tenant_id),
            ("SubscriptionID", &creds.subscription_id),
        ] {
            if value.is_empty() {
                return Err(CredentialsError::Empty {
                    path: path.to_path_buf(),
                    field,
                });
            }
        }

        Ok(creds)
    }

    /// Read credentials from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        info!(path = %path.display(), "Reading credentials file");
        let content = std::fs::read_to_string(path).map_err(|source| CredentialsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[Creds]
ClientID = "client"
ClientSecret = "secret"
TenantID = "tenant"
SubscriptionID = "sub"
StorageAccountName = "acct"
StorageAccountKey = "a2V5"
"#;

    #[test]
    fn test_parses_all_six_fields() {
        let creds = Credentials::from_toml(Path::new("creds.toml"), FULL).unwrap();
        assert_eq!(creds.client_id, "client");
        assert_eq!(creds.client_secret, "secret");
        assert_eq!(creds.tenant_id, "tenant");
        assert_eq!(creds.subscription_id, "sub");
        assert_eq!(creds.storage_account_name, "acct");
        assert_eq!(creds.storage_account_key, "a2V5");
        assert!(creds.has_storage_account());
    }

    #[test]
    fn test_storage_account_is_optional() {
        let content = "[Creds]\nClientID = \"c\"\nClientSecret = \"s\"\n\
                       TenantID = \"t\"\nSubscriptionID = \"x\"\n";
        let creds = Credentials::from_toml(Path::new("creds.toml"), content).unwrap();
        assert!(!creds.has_storage_account());
    }

    #[test]
    fn test_empty_service_principal_field_is_rejected() {
        let content = FULL.replace("\"secret\"", "\"\"");
        let err = Credentials::from_toml(Path::new("creds.toml"), &content).unwrap_err();
        assert!(matches!(err, CredentialsError::Empty { field: "ClientSecret", .. }));
    }

    #[test]
    fn test_missing_table_is_parse_error() {
        let err = Credentials::from_toml(Path::new("creds.toml"), "ClientID = \"c\"").unwrap_err();
        assert!(matches!(err, CredentialsError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Credentials::load(Path::new("/nonexistent/creds.toml")).unwrap_err();
        assert!(matches!(err, CredentialsError::Read { .. }));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::from_toml(Path::new("creds.toml"), FULL).unwrap();
        let debug = format!("{creds:?}");
        assert!(!debug.contains("secret\""));
        assert!(!debug.contains("a2V5"));
    }
}
