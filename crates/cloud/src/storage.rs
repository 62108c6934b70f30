//! Azure Blob storage uploads authorized with the storage account key.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, info};
use url::Url;

use crate::error::CloudProviderError;

type HmacSha256 = Hmac<Sha256>;

/// Storage REST API version sent with every request.
const STORAGE_API_VERSION: &str = "2020-10-02";

/// Uploads can be large archives; give them room.
const UPLOAD_TIMEOUT_SECS: u64 = 600;

/// Block blob client for one storage account.
pub struct BlobStorage {
    client: Client,
    account: String,
    key: Vec<u8>,
    endpoint: Url,
}

impl std::fmt::Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("account", &self.account)
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl BlobStorage {
    /// Create a client for `https://<account>.blob.core.windows.net`.
    ///
    /// # Arguments
    /// * `account` - Storage account name
    /// * `key` - Base64 storage account key
    ///
    /// # Errors
    /// Returns error if the key is not valid base64 or the HTTP client cannot be created.
    pub fn new(account: impl Into<String>, key: &str) -> Result<Self, CloudProviderError> {
        let account = account.into();
        if account.is_empty() {
            return Err(CloudProviderError::Config("empty storage account name".to_string()));
        }
        let key = STANDARD
            .decode(key)
            .map_err(|e| CloudProviderError::Config(format!("invalid storage account key: {e}")))?;

        let endpoint = Url::parse(&format!("https://{account}.blob.core.windows.net"))
            .map_err(|e| CloudProviderError::Config(format!("invalid storage endpoint: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .map_err(CloudProviderError::Http)?;

        Ok(Self {
            client,
            account,
            key,
            endpoint,
        })
    }

    /// Use a different blob endpoint (emulators, tests).
    ///
    /// # Errors
    /// Returns error if `endpoint` is not a valid URL.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, CloudProviderError> {
        self.endpoint = Url::parse(endpoint)
            .map_err(|e| CloudProviderError::Config(format!("invalid storage endpoint: {e}")))?;
        Ok(self)
    }

    /// URL a blob will be reachable at.
    ///
    /// # Errors
    /// Returns error if the endpoint cannot carry a path.
    pub fn blob_url(&self, container: &str, blob: &str) -> Result<Url, CloudProviderError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| {
                CloudProviderError::Config("storage endpoint cannot be a base".to_string())
            })?
            .pop_if_empty()
            .push(container)
            .push(blob);
        Ok(url)
    }

    /// Upload a local file as a block blob named after the file.
    ///
    /// Returns the public URL of the uploaded blob.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or the service rejects the upload.
    pub async fn upload_file(
        &self,
        path: &Path,
        container: &str,
    ) -> Result<String, CloudProviderError> {
        let blob = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CloudProviderError::Config(format!("no file name in {}", path.display()))
            })?
            .to_string();

        let body = tokio::fs::read(path)
            .await
            .map_err(|source| CloudProviderError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let url = self.blob_url(container, &blob)?;
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_type = "application/octet-stream";
        let authorization = self.authorization(
            "PUT",
            body.len(),
            content_type,
            &[
                ("x-ms-blob-type", "BlockBlob"),
                ("x-ms-date", &date),
                ("x-ms-version", STORAGE_API_VERSION),
            ],
            &format!("/{}/{}/{}", self.account, container, blob),
        )?;

        info!(file = %path.display(), url = %url, bytes = body.len(), "Uploading blob");

        let response = self
            .client
            .put(url.clone())
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-date", &date)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("Content-Type", content_type)
            .header("Authorization", authorization)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CloudProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        debug!(url = %url, "Blob uploaded");
        Ok(url.to_string())
    }

    /// Build the `SharedKey` authorization header value.
    ///
    /// `ms_headers` must already be sorted by name.
    fn authorization(
        &self,
        verb: &str,
        content_length: usize,
        content_type: &str,
        ms_headers: &[(&str, &str)],
        canonical_resource: &str,
    ) -> Result<String, CloudProviderError> {
        let length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };

        let mut to_sign = format!("{verb}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n");
        for (name, value) in ms_headers {
            to_sign.push_str(&format!("{name}:{value}\n"));
        }
        to_sign.push_str(canonical_resource);

        let signature = self.sign(&to_sign)?;
        Ok(format!("SharedKey {}:{signature}", self.account))
    }

    fn sign(&self, payload: &str) -> Result<String, CloudProviderError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CloudProviderError::Config(format!("unusable storage account key: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}
