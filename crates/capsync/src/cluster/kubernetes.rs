//! kube-rs backed definition source and discovery.

use async_trait::async_trait;
use capsync_core::definition::{DefinitionSpec, DEFINITION_GROUP, DEFINITION_VERSION};
use capsync_core::{DefinitionKind, GroupVersionKind, GroupVersionResource, RawDefinition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    no_kind_match, no_resource_match, ApiDiscovery, ClusterError, DefinitionSource,
    DiscoveryError, DiscoveryProvider, Listed, Result, UndecodableDefinition,
};

/// Definition source and discovery provider for a live cluster.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster environment.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn api(&self, namespace: &str, kind: DefinitionKind) -> Api<DynamicObject> {
        let gvk = kube::core::GroupVersionKind::gvk(
            DEFINITION_GROUP,
            DEFINITION_VERSION,
            kind.crd_kind(),
        );
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

fn classify(err: kube::Error) -> ClusterError {
    if let kube::Error::Api(response) = &err {
        if response.code == 401 || response.code == 403 {
            return ClusterError::Unauthorized(response.message.clone());
        }
    }
    ClusterError::Kube(err)
}

fn decode(kind: DefinitionKind, metadata: ObjectMeta, mut data: serde_json::Value) -> Listed {
    let name = metadata.name.unwrap_or_default();
    let spec = data
        .get_mut("spec")
        .map(serde_json::Value::take)
        .unwrap_or_default();
    let spec = DefinitionSpec::from_value(kind, spec).map_err(|e| UndecodableDefinition {
        name: name.clone(),
        kind,
        message: e.to_string(),
    })?;
    Ok(RawDefinition {
        name,
        labels: metadata.labels.unwrap_or_default(),
        annotations: metadata.annotations.unwrap_or_default(),
        spec,
    })
}

#[async_trait]
impl DefinitionSource for KubeCluster {
    async fn list(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        selector: Option<&str>,
    ) -> Result<Vec<Listed>> {
        let mut params = ListParams::default();
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            params = params.labels(selector);
        }
        let list = self
            .api(namespace, kind)
            .list(&params)
            .await
            .map_err(classify)?;
        debug!(namespace, kind = %kind, count = list.items.len(), "listed definitions");
        Ok(list
            .items
            .into_iter()
            .map(|object| decode(kind, object.metadata, object.data))
            .collect())
    }

    async fn get(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        name: &str,
    ) -> Result<Option<RawDefinition>> {
        let object = self
            .api(namespace, kind)
            .get_opt(name)
            .await
            .map_err(classify)?;
        object
            .map(|object| decode(kind, object.metadata, object.data))
            .transpose()
            .map_err(ClusterError::from)
    }
}

#[async_trait]
impl DiscoveryProvider for KubeCluster {
    async fn open(&self) -> std::result::Result<Arc<dyn ApiDiscovery>, DiscoveryError> {
        Ok(Arc::new(KubeDiscovery::new(self.client.clone())))
    }
}

/// Resources served by one API group, preferred version first.
#[derive(Debug, Clone)]
struct GroupResources {
    resources: Vec<ApiResource>,
}

/// Discovery handle with a per-group cache.
///
/// A cached group is re-queried once when a lookup misses, so APIs registered
/// while the handle is alive (for example by a chart install) are found.
pub struct KubeDiscovery {
    client: Client,
    groups: Mutex<HashMap<String, GroupResources>>,
}

impl std::fmt::Debug for KubeDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeDiscovery").finish_non_exhaustive()
    }
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            groups: Mutex::new(HashMap::new()),
        }
    }

    async fn query_group(&self, group: &str) -> std::result::Result<GroupResources, kube::Error> {
        let api_group = kube::discovery::group(&self.client, group).await?;
        let mut resources: Vec<ApiResource> = api_group
            .recommended_resources()
            .into_iter()
            .map(|(resource, _)| resource)
            .collect();
        let preferred = api_group.preferred_version_or_latest().to_string();
        for version in api_group.versions().filter(|v| *v != preferred) {
            resources.extend(
                api_group
                    .versioned_resources(version)
                    .into_iter()
                    .map(|(resource, _)| resource),
            );
        }
        debug!(group, count = resources.len(), "discovered api group");
        Ok(GroupResources { resources })
    }

    /// Look up within a group, refreshing the cached entry once on a miss.
    async fn find<T: Send>(
        &self,
        group: &str,
        lookup: impl Fn(&GroupResources) -> Option<T> + Send,
        missing: impl Fn() -> DiscoveryError + Send,
    ) -> std::result::Result<T, DiscoveryError> {
        let mut groups = self.groups.lock().await;
        if let Some(cached) = groups.get(group) {
            if let Some(found) = lookup(cached) {
                return Ok(found);
            }
        }
        let fresh = match self.query_group(group).await {
            Ok(fresh) => fresh,
            Err(kube::Error::Discovery(_)) => return Err(missing()),
            Err(e) => return Err(DiscoveryError::Api(e.to_string())),
        };
        let found = lookup(&fresh);
        groups.insert(group.to_string(), fresh);
        found.ok_or_else(missing)
    }
}

#[async_trait]
impl ApiDiscovery for KubeDiscovery {
    async fn kinds_for(
        &self,
        resource: &GroupVersionResource,
    ) -> std::result::Result<Vec<GroupVersionKind>, DiscoveryError> {
        self.find(
            &resource.group,
            |group| {
                let kinds: Vec<GroupVersionKind> = group
                    .resources
                    .iter()
                    .filter(|r| r.plural == resource.resource)
                    .filter(|r| resource.version.is_empty() || r.version == resource.version)
                    .map(|r| GroupVersionKind::new(&r.group, &r.version, &r.kind))
                    .collect();
                (!kinds.is_empty()).then_some(kinds)
            },
            || no_resource_match(resource),
        )
        .await
    }

    async fn resource_for(
        &self,
        kind: &GroupVersionKind,
    ) -> std::result::Result<GroupVersionResource, DiscoveryError> {
        self.find(
            &kind.group,
            |group| {
                group
                    .resources
                    .iter()
                    .find(|r| {
                        r.kind == kind.kind && (kind.version.is_empty() || r.version == kind.version)
                    })
                    .map(|r| GroupVersionResource::new(&r.group, &r.version, &r.plural))
            },
            || no_kind_match(kind),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn decodes_spec_and_metadata() {
        let mut metadata = meta("scaler");
        metadata.labels = Some([("tier".to_string(), "core".to_string())].into());
        let data = json!({"spec": {"appliesToWorkloads": ["webservice"]}});

        let definition = decode(DefinitionKind::Trait, metadata, data).unwrap();
        assert_eq!(definition.name, "scaler");
        assert_eq!(definition.kind(), DefinitionKind::Trait);
        assert_eq!(definition.labels["tier"], "core");
    }

    #[test]
    fn malformed_spec_is_returned_in_place() {
        let bad = decode(
            DefinitionKind::Trait,
            meta("scaler"),
            json!({"spec": {"appliesToWorkloads": "x"}}),
        )
        .unwrap_err();
        assert_eq!(bad.name, "scaler");
        assert_eq!(bad.kind, DefinitionKind::Trait);

        let bad = decode(DefinitionKind::Component, meta("web"), json!({"spec": {"schematic": 5}}))
            .unwrap_err();
        assert_eq!(bad.name, "web");
    }
}
