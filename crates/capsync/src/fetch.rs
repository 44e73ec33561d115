//! Batch fetcher: list definitions and resolve each one into a capability.
//!
//! Items go through backing reference conversion, template resolution,
//! dependency installation, identity resolution and assembly, in that order.
//! Identity resolution runs last because an installed chart may be what
//! registers the API. A failing item is recorded and the batch continues;
//! only list, get and discovery-open failures end the operation.

use capsync_core::{assemble, AssemblyParts, Capability, DefinitionKind, RawDefinition};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, DefinitionSource, DiscoveryProvider, Listed};
use crate::error::{BatchResult, FetchError, ItemError, ResolveError, Stage};
use crate::install::DependencyInstaller;
use crate::reference::ReferenceResolver;
use crate::template::TemplateResolver;

pub const DEFAULT_CONCURRENCY: usize = 4;

fn require_namespace(namespace: &str) -> Result<(), FetchError> {
    if namespace.is_empty() {
        return Err(FetchError::EmptyNamespace);
    }
    Ok(())
}

/// The resolution pipeline with its collaborators.
pub struct Pipeline {
    source: Arc<dyn DefinitionSource>,
    discovery: Arc<dyn DiscoveryProvider>,
    templates: TemplateResolver,
    installer: DependencyInstaller,
    concurrency: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn DefinitionSource>,
        discovery: Arc<dyn DiscoveryProvider>,
        templates: TemplateResolver,
        installer: DependencyInstaller,
    ) -> Self {
        Self {
            source,
            discovery,
            templates,
            installer,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Number of items resolved at once. Output order never depends on it.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Resolve every definition of one class in list order.
    pub async fn fetch_class(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        selector: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, FetchError> {
        require_namespace(namespace)?;
        let references = self.open_discovery().await?;
        self.fetch_with(&references, namespace, kind, selector, cancel)
            .await
    }

    /// Components followed by traits, sharing one discovery handle.
    pub async fn fetch_all(
        &self,
        namespace: &str,
        selector: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, FetchError> {
        require_namespace(namespace)?;
        let references = self.open_discovery().await?;
        let mut all = BatchResult::default();
        for kind in DefinitionKind::ALL {
            match self
                .fetch_with(&references, namespace, kind, selector, cancel)
                .await
            {
                Ok(batch) => all.extend(batch),
                Err(FetchError::Cancelled { partial }) => {
                    all.extend(*partial);
                    return Err(FetchError::cancelled(all));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(all)
    }

    /// Look up a name as a component, then as a trait, and resolve it.
    ///
    /// Only a missing component falls through to the trait lookup; any other
    /// get failure is returned as is.
    pub async fn resolve_one(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Capability, FetchError> {
        require_namespace(namespace)?;
        let definition = match self
            .get(namespace, DefinitionKind::Component, name, cancel)
            .await?
        {
            Some(definition) => definition,
            None => self
                .get(namespace, DefinitionKind::Trait, name, cancel)
                .await?
                .ok_or_else(|| FetchError::NotACapability {
                    name: name.to_string(),
                })?,
        };

        let references = self.open_discovery().await?;
        self.resolve_item(&references, namespace, &definition, cancel)
            .await
            .map_err(|err| {
                if matches!(err.source, ResolveError::Cancelled) {
                    FetchError::cancelled(BatchResult::default())
                } else {
                    FetchError::from(err)
                }
            })
    }

    async fn open_discovery(&self) -> Result<ReferenceResolver, FetchError> {
        let discovery = self.discovery.open().await.map_err(FetchError::Discovery)?;
        Ok(ReferenceResolver::new(discovery))
    }

    async fn get(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RawDefinition>, FetchError> {
        let found = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::cancelled(BatchResult::default())),
            found = self.source.get(namespace, kind, name) => found,
        };
        found.map_err(|source| match source {
            ClusterError::Decode(bad) => FetchError::from(ItemError::new(
                &bad.name,
                bad.kind,
                Stage::Template,
                ResolveError::InvalidDefinition(bad.message),
            )),
            source => FetchError::GetFailed {
                kind,
                name: name.to_string(),
                source,
            },
        })
    }

    async fn fetch_with(
        &self,
        references: &ReferenceResolver,
        namespace: &str,
        kind: DefinitionKind,
        selector: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, FetchError> {
        let listed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::cancelled(BatchResult::default())),
            listed = self.source.list(namespace, kind, selector) => listed,
        };
        let listed = listed.map_err(|source| FetchError::ListFailed { kind, source })?;
        info!(namespace, kind = %kind, count = listed.len(), "resolving definitions");

        let mut outcomes = stream::iter(listed.iter())
            .map(|item| self.resolve_listed(references, namespace, item, cancel))
            .buffered(self.concurrency);

        let mut batch = BatchResult::default();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::cancelled(batch)),
                next = outcomes.next() => next,
            };
            match next {
                None => break,
                Some(Ok(capability)) => batch.capabilities.push(capability),
                Some(Err(err)) if matches!(err.source, ResolveError::Cancelled) => {
                    return Err(FetchError::cancelled(batch));
                }
                Some(Err(err)) => {
                    warn!(
                        name = %err.name,
                        kind = %err.kind,
                        stage = %err.stage,
                        error = %err.source,
                        "capability resolution failed"
                    );
                    batch.errors.push(err);
                }
            }
        }

        debug!(
            kind = %kind,
            resolved = batch.capabilities.len(),
            failed = batch.errors.len(),
            "batch complete"
        );
        Ok(batch)
    }

    async fn resolve_listed(
        &self,
        references: &ReferenceResolver,
        namespace: &str,
        item: &Listed,
        cancel: &CancellationToken,
    ) -> Result<Capability, ItemError> {
        match item {
            Ok(definition) => {
                self.resolve_item(references, namespace, definition, cancel)
                    .await
            }
            Err(bad) => Err(ItemError::new(
                &bad.name,
                bad.kind,
                Stage::Template,
                ResolveError::InvalidDefinition(bad.message.clone()),
            )),
        }
    }

    async fn resolve_item(
        &self,
        references: &ReferenceResolver,
        namespace: &str,
        definition: &RawDefinition,
        cancel: &CancellationToken,
    ) -> Result<Capability, ItemError> {
        let kind = definition.kind();
        let fail = |stage: Stage| {
            move |source: ResolveError| ItemError::new(&definition.name, kind, stage, source)
        };

        if cancel.is_cancelled() {
            return Err(fail(Stage::Reference)(ResolveError::Cancelled));
        }

        let reference = references
            .backing_reference(definition)
            .await
            .map_err(fail(Stage::Reference))?;
        let template = self
            .templates
            .resolve(definition, cancel)
            .await
            .map_err(fail(Stage::Template))?;
        self.installer
            .ensure_installed(&definition.name, template.install.as_ref(), cancel)
            .await
            .map_err(fail(Stage::Dependency))?;
        let api_identity = references
            .resolve(&definition.name, &reference)
            .await
            .map_err(fail(Stage::Reference))?;

        Ok(assemble(AssemblyParts {
            definition,
            namespace,
            backing_reference: reference.name,
            api_identity,
            template,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::IoStreams;
    use crate::memory::{MemoryChartInstaller, MemoryCluster, MemoryDiscovery, RecordingFetcher};
    use capsync_core::definition::{
        ComponentDefinitionSpec, Schematic, TraitDefinitionSpec, WorkloadTypeDescriptor,
    };
    use capsync_core::definition::DefinitionReference;

    const TEMPLATE: &str = "parameter: {\n\treplicas: *1 | int\n}\n";

    fn component(name: &str, workload: &str) -> RawDefinition {
        RawDefinition::component(
            name,
            ComponentDefinitionSpec {
                workload: WorkloadTypeDescriptor {
                    type_name: workload.into(),
                    definition: None,
                },
                schematic: Some(Schematic::cue(TEMPLATE)),
                ..ComponentDefinitionSpec::default()
            },
        )
    }

    fn scaler() -> RawDefinition {
        RawDefinition::trait_definition(
            "scaler",
            TraitDefinitionSpec {
                applies_to_workloads: vec!["webservice".into()],
                schematic: Some(Schematic::cue(TEMPLATE)),
                ..TraitDefinitionSpec::default()
            },
        )
    }

    struct Fixture {
        cluster: MemoryCluster,
        discovery: MemoryDiscovery,
        fetcher: RecordingFetcher,
        charts: MemoryChartInstaller,
    }

    impl Fixture {
        fn new() -> Self {
            let discovery = MemoryDiscovery::new();
            discovery.register("apps", "v1", "deployments", "Deployment");
            Self {
                cluster: MemoryCluster::new(),
                discovery,
                fetcher: RecordingFetcher::new(),
                charts: MemoryChartInstaller::new(),
            }
        }

        fn pipeline(&self, concurrency: usize) -> Pipeline {
            Pipeline::new(
                Arc::new(self.cluster.clone()),
                Arc::new(self.discovery.clone()),
                TemplateResolver::new(Arc::new(self.fetcher.clone())),
                DependencyInstaller::new(Arc::new(self.charts.clone()), IoStreams::Captured),
            )
            .with_concurrency(concurrency)
        }
    }

    #[tokio::test]
    async fn preserves_list_order_with_wide_buffer() {
        let fixture = Fixture::new();
        for name in ["a", "b", "c", "d", "e", "f"] {
            fixture
                .cluster
                .insert("vela-system", component(name, "deployments.apps"));
        }

        let batch = fixture
            .pipeline(8)
            .fetch_class("vela-system", DefinitionKind::Component, None, &CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = batch.capabilities.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d", "e", "f"]);
        assert!(batch.is_clean());
    }

    #[tokio::test]
    async fn broken_items_do_not_abort_the_batch() {
        let fixture = Fixture::new();
        fixture
            .cluster
            .insert("vela-system", component("web", "deployments.apps"));
        fixture
            .cluster
            .insert("vela-system", component("queue", "queues.example.io"));
        fixture
            .cluster
            .insert("vela-system", component("worker", "deployments.apps"));

        let batch = fixture
            .pipeline(2)
            .fetch_class("vela-system", DefinitionKind::Component, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batch.capabilities.len(), 2);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].name, "queue");
        assert_eq!(batch.errors[0].stage, Stage::Reference);
    }

    #[tokio::test]
    async fn undecodable_object_is_an_item_error() {
        let fixture = Fixture::new();
        fixture
            .cluster
            .insert("vela-system", component("web", "deployments.apps"));
        fixture.cluster.insert_undecodable(
            "vela-system",
            DefinitionKind::Component,
            "broken",
            "invalid type: integer `5`, expected struct Schematic",
        );
        fixture
            .cluster
            .insert("vela-system", component("worker", "deployments.apps"));

        let batch = fixture
            .pipeline(2)
            .fetch_class("vela-system", DefinitionKind::Component, None, &CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = batch.capabilities.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["web", "worker"]);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].name, "broken");
        assert_eq!(batch.errors[0].stage, Stage::Template);
        assert!(matches!(batch.errors[0].source, ResolveError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn resolve_one_reports_undecodable_component() {
        let fixture = Fixture::new();
        fixture.cluster.insert_undecodable(
            "vela-system",
            DefinitionKind::Component,
            "broken",
            "invalid type: string \"x\", expected a sequence",
        );

        let err = fixture
            .pipeline(1)
            .resolve_one("vela-system", "broken", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            FetchError::Item(item) => {
                assert_eq!(item.name, "broken");
                assert_eq!(item.stage, Stage::Template);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_namespace_is_rejected_before_listing() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(1);
        let cancel = CancellationToken::new();

        let err = pipeline
            .fetch_class("", DefinitionKind::Component, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyNamespace));
        assert!(matches!(
            pipeline.fetch_all("", None, &cancel).await,
            Err(FetchError::EmptyNamespace)
        ));
        assert!(matches!(
            pipeline.resolve_one("", "web", &cancel).await,
            Err(FetchError::EmptyNamespace)
        ));
        assert_eq!(fixture.cluster.list_calls(), 0);
        assert_eq!(fixture.cluster.get_calls(), 0);
        assert_eq!(fixture.discovery.opens(), 0);
    }

    #[tokio::test]
    async fn list_failure_is_fatal() {
        let fixture = Fixture::new();
        fixture
            .cluster
            .insert("vela-system", component("web", "deployments.apps"));
        fixture
            .cluster
            .fail_list(DefinitionKind::Trait, "connection refused");

        let err = fixture
            .pipeline(1)
            .fetch_all("vela-system", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::ListFailed {
                kind: DefinitionKind::Trait,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fetch_all_opens_discovery_once() {
        let fixture = Fixture::new();
        fixture
            .cluster
            .insert("vela-system", component("web", "deployments.apps"));
        fixture.cluster.insert("vela-system", scaler());

        let batch = fixture
            .pipeline(4)
            .fetch_all("vela-system", None, &CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<_> = batch.capabilities.iter().map(Capability::kind).collect();
        assert_eq!(kinds, [DefinitionKind::Component, DefinitionKind::Trait]);
        assert_eq!(fixture.discovery.opens(), 1);
    }

    #[tokio::test]
    async fn selector_filters_listed_items() {
        let fixture = Fixture::new();
        fixture.cluster.insert(
            "vela-system",
            component("web", "deployments.apps").with_label("tier", "frontend"),
        );
        fixture.cluster.insert(
            "vela-system",
            component("worker", "deployments.apps").with_label("tier", "backend"),
        );

        let batch = fixture
            .pipeline(1)
            .fetch_class(
                "vela-system",
                DefinitionKind::Component,
                Some("tier=backend"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(batch.capabilities.len(), 1);
        assert_eq!(batch.capabilities[0].name, "worker");
    }

    #[tokio::test]
    async fn identity_resolves_after_chart_install() {
        let fixture = Fixture::new();
        let definition = RawDefinition::trait_definition(
            "autoscale",
            TraitDefinitionSpec {
                definition_ref: DefinitionReference::new("scaledobjects.keda.sh"),
                extension: Some(serde_json::json!({
                    "install": {"helm": {"name": "keda", "url": "https://kedacore.github.io/charts", "version": "2.8.0"}}
                })),
                schematic: Some(Schematic::cue(TEMPLATE)),
                ..TraitDefinitionSpec::default()
            },
        );
        fixture.cluster.insert("vela-system", definition);
        let discovery = fixture.discovery.clone();
        fixture.charts.on_install("keda", move || {
            discovery.register("keda.sh", "v1alpha1", "scaledobjects", "ScaledObject");
        });

        let batch = fixture
            .pipeline(1)
            .fetch_class("vela-system", DefinitionKind::Trait, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(batch.is_clean(), "{:?}", batch.errors);
        let identity = batch.capabilities[0].api_identity.clone().unwrap();
        assert_eq!(identity.api_version, "keda.sh/v1alpha1");
        assert_eq!(identity.kind, "ScaledObject");
        assert_eq!(fixture.charts.installs(), 1);
    }

    #[tokio::test]
    async fn resolve_one_does_not_fall_through_on_get_errors() {
        let fixture = Fixture::new();
        fixture.cluster.insert("vela-system", scaler());
        fixture
            .cluster
            .fail_get(DefinitionKind::Component, "forbidden");

        let err = fixture
            .pipeline(1)
            .resolve_one("vela-system", "scaler", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::GetFailed {
                kind: DefinitionKind::Component,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resolve_one_reports_component_failures_without_fallthrough() {
        let fixture = Fixture::new();
        fixture
            .cluster
            .insert("vela-system", component("dup", "queues.example.io"));
        fixture.cluster.insert(
            "vela-system",
            RawDefinition::trait_definition(
                "dup",
                TraitDefinitionSpec {
                    schematic: Some(Schematic::cue(TEMPLATE)),
                    ..TraitDefinitionSpec::default()
                },
            ),
        );

        let err = fixture
            .pipeline(1)
            .resolve_one("vela-system", "dup", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            FetchError::Item(item) => {
                assert_eq!(item.kind, DefinitionKind::Component);
                assert_eq!(item.stage, Stage::Reference);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
