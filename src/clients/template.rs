use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    error::RenderError,
    models::{request::TemplateRef, retry::RetryConfig},
    utils::retry_with_backoff,
};

/// Turns a template reference and its string arguments into HTML.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        template: &TemplateRef,
        args: &BTreeMap<String, String>,
    ) -> Result<String, RenderError>;
}

/// Substitute every `{{key}}` placeholder in `source`. Values are HTML
/// escaped; a placeholder without a matching argument is an error.
pub fn render_placeholders(
    source: &str,
    args: &BTreeMap<String, String>,
) -> Result<String, RenderError> {
    let mut rendered = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        let inner = &rest[start + 2..];
        let Some(len) = inner.find("}}") else {
            break;
        };

        let key = inner[..len].trim();
        let Some(value) = args.get(key) else {
            warn!(missing_variable = key, "Template contains unreplaced variable");
            return Err(RenderError::MissingVariable(key.to_string()));
        };

        rendered.push_str(&rest[..start]);
        push_escaped(&mut rendered, value);
        rest = &inner[len + 2..];
    }

    rendered.push_str(rest);
    Ok(rendered)
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

/// Templates on disk: `mailers/{name}/index.html` for the global set and
/// `app/{scope}/mailers/{name}/index.html` for scoped ones.
pub struct FileTemplates {
    root: PathBuf,
}

impl FileTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, template: &TemplateRef) -> PathBuf {
        match template {
            TemplateRef::Global(name) => self.root.join("mailers").join(name).join("index.html"),
            TemplateRef::Scoped { scope, name } => self
                .root
                .join("app")
                .join(scope)
                .join("mailers")
                .join(name)
                .join("index.html"),
        }
    }
}

#[async_trait]
impl TemplateRenderer for FileTemplates {
    async fn render(
        &self,
        template: &TemplateRef,
        args: &BTreeMap<String, String>,
    ) -> Result<String, RenderError> {
        let segments = match template {
            TemplateRef::Global(name) => vec![name.as_str()],
            TemplateRef::Scoped { scope, name } => vec![scope.as_str(), name.as_str()],
        };
        if segments
            .iter()
            .any(|s| s.contains(['/', '\\']) || *s == "..")
        {
            return Err(RenderError::NotFound(template.to_string()));
        }

        let path = self.path_for(template);
        debug!(template = %template, path = %path.display(), "Loading template from disk");

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => RenderError::NotFound(template.to_string()),
                _ => RenderError::Unavailable(format!("{}: {}", path.display(), e)),
            })?;

        render_placeholders(&source, args)
    }
}

#[derive(Debug, Deserialize)]
struct TemplateDocument {
    body: String,
}

/// Fetches template sources from the template service and renders them
/// locally.
pub struct TemplateServiceClient {
    http_client: Client,
    base_url: String,
    retry_config: RetryConfig,
}

impl TemplateServiceClient {
    pub fn new(base_url: &str, retry_config: RetryConfig) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(base_url, "Template service client initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_config,
        })
    }

    fn url_for(&self, template: &TemplateRef) -> String {
        match template {
            TemplateRef::Global(name) => format!("{}/api/v1/templates/{}", self.base_url, name),
            TemplateRef::Scoped { scope, name } => {
                format!("{}/api/v1/templates/{}/{}", self.base_url, scope, name)
            }
        }
    }

    /// `Ok(None)` when the service does not know the template.
    pub async fn fetch_template(&self, template: &TemplateRef) -> Result<Option<String>, RenderError> {
        let url = self.url_for(template);

        debug!(template = %template, "Fetching template from service");

        retry_with_backoff(&self.retry_config, || {
            let client = self.http_client.clone();
            let url = url.clone();

            async move {
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| RenderError::Unavailable(e.to_string()))?;

                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    return Err(RenderError::Unavailable(format!(
                        "Template service returned status {}",
                        status
                    )));
                }

                let document: TemplateDocument = response.json().await.map_err(|e| {
                    RenderError::Unavailable(format!("Failed to parse template JSON: {}", e))
                })?;

                Ok(Some(document.body))
            }
        })
        .await
    }
}

#[async_trait]
impl TemplateRenderer for TemplateServiceClient {
    async fn render(
        &self,
        template: &TemplateRef,
        args: &BTreeMap<String, String>,
    ) -> Result<String, RenderError> {
        let source = self
            .fetch_template(template)
            .await?
            .ok_or_else(|| RenderError::NotFound(template.to_string()))?;

        debug!(
            template = %template,
            variable_count = args.len(),
            "Rendering template"
        );

        render_placeholders(&source, args)
    }
}
