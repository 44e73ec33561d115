//! Error types for the resolution pipeline.
//!
//! Per-item failures ([`ItemError`]) are collected next to the successes of a
//! batch. [`FetchError`] is reserved for failures that end the operation.

use capsync_core::{Capability, DefinitionKind, ParameterError};
use std::fmt;
use thiserror::Error;

use crate::cluster::{ClusterError, DiscoveryError};
use crate::install::ChartError;
use crate::template::FetchTemplateError;

/// Pipeline stage an item failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reference,
    Template,
    Dependency,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Template => "template",
            Self::Dependency => "dependency",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure resolving a single definition.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("installing capability '{definition}'... {message}")]
    ReferenceResolution { definition: String, message: String },
    #[error("invalid definition spec: {0}")]
    InvalidDefinition(String),
    #[error("template not exist in definition")]
    TemplateMissing,
    #[error("invalid extension payload: {0}")]
    InvalidExtension(#[source] serde_json::Error),
    #[error("fetching template from {uri}: {source}")]
    TemplateFetch {
        uri: String,
        #[source]
        source: FetchTemplateError,
    },
    #[error("extracting parameters: {0}")]
    ParameterExtraction(#[from] ParameterError),
    #[error(
        "unable to install helm chart dependency {chart}({version} from {url}) for capability '{definition}': {source}"
    )]
    DependencyInstall {
        chart: String,
        version: String,
        url: String,
        definition: String,
        #[source]
        source: ChartError,
    },
    #[error("cancelled")]
    Cancelled,
}

/// A per-item failure tagged with the definition and the stage that failed.
#[derive(Debug, Error)]
#[error("{kind} '{name}' failed at {stage} stage: {source}")]
pub struct ItemError {
    pub name: String,
    pub kind: DefinitionKind,
    pub stage: Stage,
    #[source]
    pub source: ResolveError,
}

impl ItemError {
    pub fn new(name: impl Into<String>, kind: DefinitionKind, stage: Stage, source: ResolveError) -> Self {
        Self {
            name: name.into(),
            kind,
            stage,
            source,
        }
    }

    /// One-line warning for batch output.
    pub fn warning(&self) -> String {
        format!(
            "WARN: {}, you will be unable to use this {} capability",
            self, self.kind
        )
    }
}

/// Successes and per-item failures of a batch, both in list order.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub capabilities: Vec<Capability>,
    pub errors: Vec<ItemError>,
}

impl BatchResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn extend(&mut self, other: Self) {
        self.capabilities.extend(other.capabilities);
        self.errors.extend(other.errors);
    }
}

/// Failure that aborts a fetch or sync operation.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("list {} definitions: {source}", .kind.crd_kind())]
    ListFailed {
        kind: DefinitionKind,
        #[source]
        source: ClusterError,
    },
    #[error("get {} '{name}': {source}", .kind.crd_kind())]
    GetFailed {
        kind: DefinitionKind,
        name: String,
        #[source]
        source: ClusterError,
    },
    #[error("open api discovery: {0}")]
    Discovery(#[source] DiscoveryError),
    #[error("{name} is not a valid workload type or trait")]
    NotACapability { name: String },
    #[error("cancelled after resolving {} capabilities", .partial.capabilities.len())]
    Cancelled { partial: Box<BatchResult> },
    #[error(transparent)]
    Item(Box<ItemError>),
}

impl FetchError {
    pub fn cancelled(partial: BatchResult) -> Self {
        Self::Cancelled {
            partial: Box::new(partial),
        }
    }

    /// Results accumulated before a cancellation. Any other error is
    /// returned unchanged.
    pub fn into_partial(self) -> Result<BatchResult, Self> {
        match self {
            Self::Cancelled { partial } => Ok(*partial),
            other => Err(other),
        }
    }
}

impl From<ItemError> for FetchError {
    fn from(err: ItemError) -> Self {
        Self::Item(Box::new(err))
    }
}
