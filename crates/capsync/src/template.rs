//! Template resolution: pick a template source, fetch it if remote, and
//! extract its parameter schema.

use async_trait::async_trait;
use capsync_core::definition::ExtensionPayload;
use capsync_core::{parameters_from_template, RawDefinition, ResolvedTemplate, TemplateSource};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ResolveError;

#[derive(Debug, Error)]
pub enum FetchTemplateError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}")]
    Status { status: u16 },
    #[error("template body is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0}")]
    Unavailable(String),
    #[error("cancelled")]
    Cancelled,
}

/// Plain GET of a template URI. No retries at this layer.
#[async_trait]
pub trait TemplateFetcher: Send + Sync {
    async fn get(&self, uri: &str, cancel: &CancellationToken)
        -> Result<Vec<u8>, FetchTemplateError>;
}

/// reqwest-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher. `None` disables the request timeout.
    pub fn new(timeout: Option<Duration>) -> Result<Self, FetchTemplateError> {
        let mut builder =
            reqwest::Client::builder().user_agent(concat!("capsync/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }
}

#[async_trait]
impl TemplateFetcher for HttpFetcher {
    async fn get(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchTemplateError> {
        let request = async {
            let response = self.http.get(uri).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchTemplateError::Status {
                    status: status.as_u16(),
                });
            }
            Ok::<_, FetchTemplateError>(response.bytes().await?.to_vec())
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchTemplateError::Cancelled),
            result = request => result,
        }
    }
}

/// Resolves the template text and parameters of a definition.
#[derive(Clone)]
pub struct TemplateResolver {
    fetcher: Arc<dyn TemplateFetcher>,
}

impl std::fmt::Debug for TemplateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateResolver").finish_non_exhaustive()
    }
}

impl TemplateResolver {
    pub fn new(fetcher: Arc<dyn TemplateFetcher>) -> Self {
        Self { fetcher }
    }

    /// Resolve in priority order: schematic template, extension template,
    /// then the extension `templateURI`. At most one fetch is performed.
    pub async fn resolve(
        &self,
        definition: &RawDefinition,
        cancel: &CancellationToken,
    ) -> Result<ResolvedTemplate, ResolveError> {
        let extension =
            ExtensionPayload::decode(definition.extension()).map_err(ResolveError::InvalidExtension)?;
        let install = extension.installation();

        let (template, source) =
            if let Some(text) = definition.schematic().and_then(|s| s.template()) {
                (text.to_string(), TemplateSource::Schematic)
            } else if !extension.template.trim().is_empty() {
                (extension.template, TemplateSource::Extension)
            } else if !extension.template_uri.is_empty() {
                let uri = extension.template_uri;
                let body = self.fetch(&uri, cancel).await?;
                (body, TemplateSource::Remote { uri })
            } else {
                return Err(ResolveError::TemplateMissing);
            };

        if template.trim().is_empty() {
            return Err(ResolveError::TemplateMissing);
        }

        let parameters = parameters_from_template(&template)?;
        debug!(
            name = %definition.name,
            source = source.as_str(),
            parameters = parameters.len(),
            "resolved template"
        );
        Ok(ResolvedTemplate {
            template,
            parameters,
            install,
            source,
        })
    }

    async fn fetch(&self, uri: &str, cancel: &CancellationToken) -> Result<String, ResolveError> {
        let bytes = self.fetcher.get(uri, cancel).await.map_err(|source| match source {
            FetchTemplateError::Cancelled => ResolveError::Cancelled,
            source => ResolveError::TemplateFetch {
                uri: uri.to_string(),
                source,
            },
        })?;
        String::from_utf8(bytes).map_err(|_| ResolveError::TemplateFetch {
            uri: uri.to_string(),
            source: FetchTemplateError::InvalidUtf8,
        })
    }
}
