use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::config::Config;
use crate::config::ProviderKind;
use crate::error::Result;

/// Raw upstream reply. Non-2xx statuses flow through unchanged so the
/// client sees what it would have seen talking to the upstream directly.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: Value,
}

impl ProviderResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Adapter between the Anthropic-compatible request shape and one upstream
/// provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the web-fallback heuristic applies to this provider.
    fn web_fallback_enabled(&self) -> bool {
        false
    }

    async fn invoke(&self, request: &Value) -> Result<ProviderResponse>;
}

/// Build the provider selected by the configuration.
pub fn provider_from_config(config: &Arc<Config>) -> Arc<dyn ModelProvider> {
    match config.provider {
        ProviderKind::Databricks => Arc::new(DatabricksProvider::new(config)),
        ProviderKind::Azure => Arc::new(AzureAnthropicProvider::new(config)),
    }
}

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(600))
        .build()
        .unwrap_or_default()
}

/// Databricks model serving: the Anthropic-compatible body is forwarded
/// as-is to the serving endpoint for the requested model.
pub struct DatabricksProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    endpoint_path: Option<String>,
    default_model: String,
}

impl DatabricksProvider {
    pub fn new(config: &Arc<Config>) -> Self {
        Self {
            client: build_http_client(),
            api_base: config.databricks.api_base.trim_end_matches('/').to_string(),
            api_key: config.databricks.api_key.clone(),
            endpoint_path: config.databricks.endpoint_path.clone(),
            default_model: config.databricks.default_model.clone(),
        }
    }

    fn url_for(&self, model: &str) -> String {
        match &self.endpoint_path {
            Some(path) => format!("{}{}", self.api_base, path.replace("{model}", model)),
            None => format!("{}/serving-endpoints/{model}/invocations", self.api_base),
        }
    }
}

#[async_trait]
impl ModelProvider for DatabricksProvider {
    fn name(&self) -> &'static str {
        "databricks"
    }

    fn web_fallback_enabled(&self) -> bool {
        true
    }

    async fn invoke(&self, request: &Value) -> Result<ProviderResponse> {
        let mut body = request.clone();
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model)
            .to_string();
        if let Some(object) = body.as_object_mut() {
            object.insert("model".to_string(), Value::String(model.clone()));
        }

        let url = self.url_for(&model);
        debug!("invoking databricks endpoint {url}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        read_response(response).await
    }
}

/// Azure-hosted Anthropic: same body, different endpoint and auth headers.
pub struct AzureAnthropicProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    version: String,
    default_model: String,
}

impl AzureAnthropicProvider {
    pub fn new(config: &Arc<Config>) -> Self {
        Self {
            client: build_http_client(),
            endpoint: config.azure.endpoint.clone(),
            api_key: config.azure.api_key.clone(),
            version: config.azure.version.clone(),
            default_model: config.databricks.default_model.clone(),
        }
    }
}

#[async_trait]
impl ModelProvider for AzureAnthropicProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn invoke(&self, request: &Value) -> Result<ProviderResponse> {
        let mut body = request.clone();
        if let Some(object) = body.as_object_mut() {
            let missing_model = object
                .get("model")
                .and_then(Value::as_str)
                .is_none_or(str::is_empty);
            if missing_model {
                object.insert(
                    "model".to_string(),
                    Value::String(self.default_model.clone()),
                );
            }
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        read_response(response).await
    }
}

/// Decode the upstream reply. A body that fails to parse as JSON is kept
/// verbatim as a string so it can still be surfaced to the client.
async fn read_response(response: reqwest::Response) -> Result<ProviderResponse> {
    let status = response.status().as_u16();
    let raw = response.text().await?;
    let body = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!("upstream body is not JSON ({err}); forwarding verbatim");
            Value::String(raw)
        }
    };
    Ok(ProviderResponse { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn databricks_config(base: &str) -> Arc<Config> {
        let vars: HashMap<String, String> = [
            ("DATABRICKS_API_BASE", base),
            ("DATABRICKS_API_KEY", "pat-123"),
            ("DATABRICKS_DEFAULT_MODEL", "default-model"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Arc::new(Config::from_env_map(&vars))
    }

    #[tokio::test]
    async fn databricks_posts_to_serving_endpoint_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/serving-endpoints/my-model/invocations"))
            .and(header("authorization", "Bearer pat-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let provider = DatabricksProvider::new(&databricks_config(&server.uri()));
        let response = provider
            .invoke(&json!({"model": "my-model", "messages": []}))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn databricks_substitutes_default_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/serving-endpoints/default-model/invocations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let provider = DatabricksProvider::new(&databricks_config(&server.uri()));
        let response = provider.invoke(&json!({"messages": []})).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn upstream_errors_surface_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({"error": "rate limited"})),
            )
            .mount(&server)
            .await;

        let provider = DatabricksProvider::new(&databricks_config(&server.uri()));
        let response = provider
            .invoke(&json!({"model": "m", "messages": []}))
            .await
            .unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.body, json!({"error": "rate limited"}));
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn azure_sends_api_key_and_version_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "azure-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg_1"})))
            .mount(&server)
            .await;

        let vars: HashMap<String, String> = [
            ("MODEL_PROVIDER", "azure"),
            ("AZURE_ANTHROPIC_ENDPOINT", server.uri().as_str()),
            ("AZURE_ANTHROPIC_API_KEY", "azure-key"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = Arc::new(Config::from_env_map(&vars));
        let provider = AzureAnthropicProvider::new(&config);
        assert!(!provider.web_fallback_enabled());
        let response = provider
            .invoke(&json!({"model": "m", "messages": []}))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn non_json_body_is_forwarded_as_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let provider = DatabricksProvider::new(&databricks_config(&server.uri()));
        let response = provider
            .invoke(&json!({"model": "m", "messages": []}))
            .await
            .unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(response.body, json!("bad gateway"));
    }
}
