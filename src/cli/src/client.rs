//! HTTP client for the Tollgate API server.

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Success envelope returned by `/api/v1` routes.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// Error envelope returned for any failed request.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    code: String,
    message: String,
    #[serde(default)]
    field: Option<String>,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = send(self.request(Method::GET, path), "GET", path).await?;
        unwrap_envelope(resp, path).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = send(self.request(Method::POST, path).json(body), "POST", path).await?;
        unwrap_envelope(resp, path).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = send(self.request(Method::DELETE, path), "DELETE", path).await?;
        unwrap_envelope(resp, path).await
    }

    /// GET a route that does not use the `ApiResponse` envelope (`/health*`).
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let resp = send(self.request(Method::GET, path), "GET", path).await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))
    }
}

async fn send(builder: RequestBuilder, method: &str, path: &str) -> Result<Response> {
    let resp = builder
        .send()
        .await
        .with_context(|| format!("{} {} failed", method, path))?;

    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    anyhow::bail!("API error ({}): {}", status, describe_error(&text))
}

/// Pull `code`, `message` and `field` out of an error body, or fall back to the raw text.
fn describe_error(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => match error.field {
            Some(field) => format!("{} [{}] (field `{}`)", error.message, error.code, field),
            None => format!("{} [{}]", error.message, error.code),
        },
        Err(_) => body.to_string(),
    }
}

async fn unwrap_envelope<T: DeserializeOwned>(resp: Response, path: &str) -> Result<T> {
    let api_resp: ApiResponse<T> = resp
        .json()
        .await
        .with_context(|| format!("Failed to parse response from {}", path))?;

    if api_resp.success {
        api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
    } else {
        Err(anyhow::anyhow!(
            "API error: {}",
            api_resp.error.unwrap_or_else(|| "Unknown error".into())
        ))
    }
}
