//! Control-plane seams: definition storage and API discovery.
//!
//! The pipeline only talks to the cluster through these traits. The kube-rs
//! backed implementation lives in [`kubernetes`]; in-memory fakes live in
//! [`crate::memory`].

pub mod kubernetes;

use async_trait::async_trait;
use capsync_core::{DefinitionKind, GroupVersionKind, GroupVersionResource, RawDefinition};
use std::sync::Arc;
use thiserror::Error;

pub use kubernetes::{KubeCluster, KubeDiscovery};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster api error: {0}")]
    Api(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error(transparent)]
    Decode(#[from] UndecodableDefinition),
    #[error("kube client error: {0}")]
    Kube(#[from] kube::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// A stored object whose spec does not decode as a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decode {kind} definition '{name}': {message}")]
pub struct UndecodableDefinition {
    pub name: String,
    pub kind: DefinitionKind,
    pub message: String,
}

/// One listed object. Decode failures stay per item.
pub type Listed = std::result::Result<RawDefinition, UndecodableDefinition>;

/// Read access to stored definitions.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// List definitions of one class in list order. An empty selector matches
    /// all. An object that fails to decode is returned in place, not as an error.
    async fn list(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        selector: Option<&str>,
    ) -> Result<Vec<Listed>>;

    /// Fetch one definition; `Ok(None)` means the object does not exist.
    async fn get(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        name: &str,
    ) -> Result<Option<RawDefinition>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// No API is registered for the requested resource or kind.
    #[error("{0}")]
    NoMatch(String),
    #[error("discovery failed: {0}")]
    Api(String),
}

/// Opens discovery handles. One handle is shared by all items of a batch.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn open(&self) -> std::result::Result<Arc<dyn ApiDiscovery>, DiscoveryError>;
}

/// Read-only view of the APIs served by the cluster.
#[async_trait]
pub trait ApiDiscovery: Send + Sync {
    /// Kinds served for a resource, preferred version first. An empty
    /// version matches every served version.
    async fn kinds_for(
        &self,
        resource: &GroupVersionResource,
    ) -> std::result::Result<Vec<GroupVersionKind>, DiscoveryError>;

    /// REST resource serving a kind. An empty version picks the preferred one.
    async fn resource_for(
        &self,
        kind: &GroupVersionKind,
    ) -> std::result::Result<GroupVersionResource, DiscoveryError>;
}

/// Message for a resource nothing serves.
pub fn no_resource_match(resource: &GroupVersionResource) -> DiscoveryError {
    DiscoveryError::NoMatch(format!("no matches for {resource}"))
}

/// Message for a kind nothing serves.
pub fn no_kind_match(kind: &GroupVersionKind) -> DiscoveryError {
    DiscoveryError::NoMatch(format!(
        "no matches for kind \"{}\" in version \"{}\"",
        kind.kind,
        kind.api_version()
    ))
}
