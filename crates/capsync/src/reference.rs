//! Backing reference conversion and API identity resolution.

use capsync_core::definition::{DefinitionReference, DefinitionSpec, AUTODETECT_WORKLOAD_TYPE};
use capsync_core::types::parse_group_resource;
use capsync_core::{ApiIdentity, GroupVersionKind, GroupVersionResource, RawDefinition};
use std::sync::Arc;
use tracing::debug;

use crate::cluster::{ApiDiscovery, DiscoveryError};
use crate::error::ResolveError;

const NO_MATCH_MARKER: &str = "no matches for ";

/// Resolves references against one discovery handle. Built once per batch
/// and dropped with it; identities are never cached across batches.
#[derive(Clone)]
pub struct ReferenceResolver {
    discovery: Arc<dyn ApiDiscovery>,
}

impl std::fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolver").finish_non_exhaustive()
    }
}

impl ReferenceResolver {
    pub fn new(discovery: Arc<dyn ApiDiscovery>) -> Self {
        Self { discovery }
    }

    /// Backing reference of a definition.
    ///
    /// Components use `workload.type` when set, otherwise their
    /// `workload.definition` is mapped to `<plural>.<group>` through discovery.
    /// Traits use `definitionRef` as is, which may be empty.
    pub async fn backing_reference(
        &self,
        definition: &RawDefinition,
    ) -> Result<DefinitionReference, ResolveError> {
        let spec = match &definition.spec {
            DefinitionSpec::Trait(spec) => return Ok(spec.definition_ref.clone()),
            DefinitionSpec::Component(spec) => spec,
        };

        if !spec.workload.type_name.is_empty() {
            return Ok(DefinitionReference::new(&spec.workload.type_name));
        }

        let Some(workload) = &spec.workload.definition else {
            return Err(ResolveError::ReferenceResolution {
                definition: definition.name.clone(),
                message: "neither workload type nor workload definition is set".to_string(),
            });
        };

        let gvk = GroupVersionKind::from_api_version(&workload.api_version, &workload.kind)
            .map_err(|e| ResolveError::ReferenceResolution {
                definition: definition.name.clone(),
                message: e.to_string(),
            })?;
        let resource = self
            .discovery
            .resource_for(&gvk)
            .await
            .map_err(|e| rewrite_discovery_error(&definition.name, &e))?;

        debug!(name = %definition.name, kind = %gvk, resource = %resource, "converted workload definition");
        Ok(DefinitionReference {
            name: resource.group_resource(),
            version: resource.version,
        })
    }

    /// API identity served for a reference. The autodetect workload type and
    /// an empty reference resolve to no identity.
    pub async fn resolve(
        &self,
        definition_name: &str,
        reference: &DefinitionReference,
    ) -> Result<Option<ApiIdentity>, ResolveError> {
        if reference.name.is_empty() || reference.name == AUTODETECT_WORKLOAD_TYPE {
            return Ok(None);
        }

        let (group, resource) = parse_group_resource(&reference.name);
        let resource = GroupVersionResource::new(group, &reference.version, resource);
        let kinds = self
            .discovery
            .kinds_for(&resource)
            .await
            .map_err(|e| rewrite_discovery_error(definition_name, &e))?;

        Ok(kinds.first().map(ApiIdentity::from))
    }
}

/// Wrap a discovery failure with the definition name, reducing a
/// "no matches for" message to the provider it names.
pub fn rewrite_discovery_error(definition: &str, err: &DiscoveryError) -> ResolveError {
    let message = err.to_string();
    let message = match message.split_once(NO_MATCH_MARKER) {
        Some((_, provider)) => format!("expected provider: {provider}"),
        None => message,
    };
    ResolveError::ReferenceResolution {
        definition: definition.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDiscovery;
    use capsync_core::definition::{
        ComponentDefinitionSpec, TraitDefinitionSpec, WorkloadGvk, WorkloadTypeDescriptor,
    };

    fn discovery() -> MemoryDiscovery {
        let discovery = MemoryDiscovery::new();
        discovery.register("apps", "v1", "deployments", "Deployment");
        discovery.register("", "v1", "services", "Service");
        discovery
    }

    fn resolver(discovery: &MemoryDiscovery) -> ReferenceResolver {
        ReferenceResolver::new(Arc::new(discovery.clone()))
    }

    #[tokio::test]
    async fn workload_type_is_the_reference() {
        let definition = RawDefinition::component(
            "webservice",
            ComponentDefinitionSpec {
                workload: WorkloadTypeDescriptor {
                    type_name: "deployments.apps".into(),
                    definition: None,
                },
                ..ComponentDefinitionSpec::default()
            },
        );
        let reference = resolver(&discovery())
            .backing_reference(&definition)
            .await
            .unwrap();
        assert_eq!(reference.name, "deployments.apps");
        assert!(reference.version.is_empty());
    }

    #[tokio::test]
    async fn workload_definition_maps_through_discovery() {
        let definition = RawDefinition::component(
            "worker",
            ComponentDefinitionSpec {
                workload: WorkloadTypeDescriptor {
                    type_name: String::new(),
                    definition: Some(WorkloadGvk {
                        api_version: "apps/v1".into(),
                        kind: "Deployment".into(),
                    }),
                },
                ..ComponentDefinitionSpec::default()
            },
        );
        let reference = resolver(&discovery())
            .backing_reference(&definition)
            .await
            .unwrap();
        assert_eq!(reference.name, "deployments.apps");
        assert_eq!(reference.version, "v1");
    }

    #[tokio::test]
    async fn component_without_workload_fails() {
        let definition = RawDefinition::component("bare", ComponentDefinitionSpec::default());
        let err = resolver(&discovery())
            .backing_reference(&definition)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ReferenceResolution { .. }));
    }

    #[tokio::test]
    async fn trait_reference_is_passed_through() {
        let definition = RawDefinition::trait_definition(
            "ingress",
            TraitDefinitionSpec {
                definition_ref: DefinitionReference::new("ingresses.networking.k8s.io"),
                ..TraitDefinitionSpec::default()
            },
        );
        let reference = resolver(&discovery())
            .backing_reference(&definition)
            .await
            .unwrap();
        assert_eq!(reference.name, "ingresses.networking.k8s.io");
    }

    #[tokio::test]
    async fn resolves_core_and_grouped_resources() {
        let resolver = resolver(&discovery());
        let apps = resolver
            .resolve("webservice", &DefinitionReference::new("deployments.apps"))
            .await
            .unwrap();
        assert_eq!(
            apps,
            Some(ApiIdentity {
                api_version: "apps/v1".into(),
                kind: "Deployment".into()
            })
        );

        let core = resolver
            .resolve("svc", &DefinitionReference::new("services"))
            .await
            .unwrap();
        assert_eq!(core.map(|i| i.api_version), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn autodetect_and_empty_have_no_identity() {
        let discovery = discovery();
        let resolver = resolver(&discovery);
        let auto = resolver
            .resolve("auto", &DefinitionReference::new(AUTODETECT_WORKLOAD_TYPE))
            .await
            .unwrap();
        let empty = resolver
            .resolve("manualscaler", &DefinitionReference::default())
            .await
            .unwrap();
        assert!(auto.is_none());
        assert!(empty.is_none());
        assert_eq!(discovery.lookups(), 0);
    }

    #[tokio::test]
    async fn missing_provider_is_rewritten() {
        let err = resolver(&discovery())
            .resolve("scaler", &DefinitionReference::new("scaledobjects.keda.sh"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "installing capability 'scaler'... expected provider: keda.sh/, Resource=scaledobjects"
        );
    }

    #[test]
    fn other_discovery_errors_are_wrapped() {
        let err = rewrite_discovery_error("scaler", &DiscoveryError::Api("connection refused".into()));
        assert_eq!(
            err.to_string(),
            "installing capability 'scaler'... discovery failed: connection refused"
        );
    }

    #[test]
    fn kind_match_is_rewritten_to_suffix() {
        let missing = crate::cluster::no_kind_match(&GroupVersionKind::new(
            "keda.sh",
            "v1alpha1",
            "ScaledObject",
        ));
        let err = rewrite_discovery_error("scaler", &missing);
        assert_eq!(
            err.to_string(),
            "installing capability 'scaler'... expected provider: kind \"ScaledObject\" in version \"keda.sh/v1alpha1\""
        );
    }
}
