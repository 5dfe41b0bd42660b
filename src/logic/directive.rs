//! Generative-content directives embedded in element text.
//!
//! `{{generate-image: a red bicycle}}` (or `{{ai-image: ...}}`) is replaced by
//! the URL of an image produced for the description before the text is stored.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::model::PropertyMap;
use crate::resilience::{with_retry, CircuitBreaker, ExternalError, RetryOptions};

const DIRECTIVE_PATTERN: &str = r"\{\{\s*(?:generate-image|ai-image)\s*:\s*([^}]*?)\s*\}\}";

fn directive_regex() -> &'static Regex {
    static DIRECTIVE: OnceLock<Regex> = OnceLock::new();
    DIRECTIVE.get_or_init(|| Regex::new(DIRECTIVE_PATTERN).expect("directive pattern compiles"))
}

pub fn contains_directive(text: &str) -> bool {
    directive_regex().is_match(text)
}

#[async_trait::async_trait]
pub trait ImageGenerator: Send + Sync {
    /// URL of an image matching `description`
    async fn generate(&self, description: &str) -> Result<String, ExternalError>;
}

/// Deterministic placeholder images, no network involved
#[derive(Debug, Clone)]
pub struct PlaceholderImages {
    base_url: String,
    width: u32,
    height: u32,
}

impl PlaceholderImages {
    pub fn new(base_url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            base_url: base_url.into(),
            width,
            height,
        }
    }
}

impl Default for PlaceholderImages {
    fn default() -> Self {
        Self::new("https://placehold.co", 800, 600)
    }
}

#[async_trait::async_trait]
impl ImageGenerator for PlaceholderImages {
    async fn generate(&self, description: &str) -> Result<String, ExternalError> {
        let base = format!(
            "{}/{}x{}",
            self.base_url.trim_end_matches('/'),
            self.width,
            self.height
        );
        let url = reqwest::Url::parse_with_params(&base, &[("text", description)])
            .map_err(|e| ExternalError::Other(format!("invalid placeholder url: {}", e)))?;
        Ok(url.to_string())
    }
}

/// Image provider reached over HTTP, retried with backoff behind a circuit breaker
pub struct HttpImageGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retry: RetryOptions,
    attempt_timeout: Option<Duration>,
    breaker: Arc<CircuitBreaker>,
}

impl HttpImageGenerator {
    /// The per-attempt timeout in `retry` is enforced inside the breaker, so a
    /// provider that hangs counts as a breaker failure.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        mut retry: RetryOptions,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let attempt_timeout = retry.timeout.take();
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            retry,
            attempt_timeout,
            breaker,
        }
    }

    async fn attempt(&self, description: &str) -> Result<String, ExternalError> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.request(description))
                .await
                .unwrap_or(Err(ExternalError::Timeout(limit))),
            None => self.request(description).await,
        }
    }

    async fn request(&self, description: &str) -> Result<String, ExternalError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "prompt": description, "n": 1 }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExternalError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        image_url(&body).ok_or_else(|| {
            ExternalError::InvalidResponse("response carries no image url".to_string())
        })
    }
}

/// Accepts `{"url": ...}` and `{"data": [{"url": ...}]}`
fn image_url(body: &Value) -> Option<String> {
    body.get("url")
        .or_else(|| body.pointer("/data/0/url"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

#[async_trait::async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, description: &str) -> Result<String, ExternalError> {
        let outcome = with_retry(
            || self.breaker.execute(|| self.attempt(description)),
            &self.retry,
        )
        .await;
        log::debug!(
            "Image generation for '{}' finished after {} attempt(s) in {:?}",
            description,
            outcome.attempts,
            outcome.elapsed
        );
        outcome.into_result()
    }
}

#[derive(Clone)]
pub struct DirectiveResolver {
    generator: Arc<dyn ImageGenerator>,
}

impl DirectiveResolver {
    pub fn new(generator: Arc<dyn ImageGenerator>) -> Self {
        Self { generator }
    }

    /// Replace every directive in `text`. Text without directives is returned
    /// unchanged, and any generator failure fails the whole resolution.
    pub async fn resolve(&self, text: &str) -> Result<String, ExternalError> {
        let regex = directive_regex();
        if !regex.is_match(text) {
            return Ok(text.to_string());
        }

        let mut generated: HashMap<String, String> = HashMap::new();
        for captures in regex.captures_iter(text) {
            let description = captures.get(1).map_or("", |m| m.as_str()).to_string();
            if generated.contains_key(&description) {
                continue;
            }
            let url = self.generator.generate(&description).await?;
            if contains_directive(&url) {
                return Err(ExternalError::InvalidResponse(
                    "generated url contains a directive".to_string(),
                ));
            }
            generated.insert(description, url);
        }

        let resolved = regex.replace_all(text, |captures: &regex::Captures| {
            let description = captures.get(1).map_or("", |m| m.as_str());
            generated.get(description).cloned().unwrap_or_default()
        });
        log::debug!("Resolved {} image directive(s)", generated.len());
        Ok(resolved.into_owned())
    }

    pub async fn resolve_optional(&self, text: Option<String>) -> Result<Option<String>, ExternalError> {
        match text {
            Some(text) => Ok(Some(self.resolve(&text).await?)),
            None => Ok(None),
        }
    }

    /// Resolve directives inside the string values of a style or attribute map
    pub async fn resolve_map(&self, map: PropertyMap) -> Result<PropertyMap, ExternalError> {
        let mut resolved = PropertyMap::new();
        for (key, value) in map {
            let value = match value {
                Value::String(text) if contains_directive(&text) => {
                    Value::String(self.resolve(&text).await?)
                }
                other => other,
            };
            resolved.insert(key, value);
        }
        Ok(resolved)
    }
}
