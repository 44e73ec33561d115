//! In-memory implementations of every collaborator seam, with call counters.
//!
//! Used by unit and integration tests, and handy for dry runs against a
//! fixture set of definitions.

use async_trait::async_trait;
use capsync_core::{
    DefinitionKind, GroupVersionKind, GroupVersionResource, HelmChart, RawDefinition,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    no_kind_match, no_resource_match, ApiDiscovery, ClusterError, DefinitionSource,
    DiscoveryError, DiscoveryProvider, Listed, UndecodableDefinition,
};
use crate::install::{ChartError, ChartInstaller, IoStreams};
use crate::template::{FetchTemplateError, TemplateFetcher};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Definitions ---

#[derive(Default)]
struct ClusterState {
    definitions: Vec<(String, Listed)>,
    list_failures: HashMap<DefinitionKind, String>,
    get_failures: HashMap<DefinitionKind, String>,
}

/// Definition store keyed by namespace, kept in insertion order.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    lists: Arc<AtomicUsize>,
    gets: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("definitions", &lock(&self.state).definitions.len())
            .finish_non_exhaustive()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, definition: RawDefinition) {
        lock(&self.state)
            .definitions
            .push((namespace.to_string(), Ok(definition)));
    }

    /// Store an object whose spec does not decode, in list order.
    pub fn insert_undecodable(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        name: &str,
        message: &str,
    ) {
        let bad = UndecodableDefinition {
            name: name.to_string(),
            kind,
            message: message.to_string(),
        };
        lock(&self.state)
            .definitions
            .push((namespace.to_string(), Err(bad)));
    }

    /// Make every list of `kind` fail with an API error.
    pub fn fail_list(&self, kind: DefinitionKind, message: &str) {
        lock(&self.state)
            .list_failures
            .insert(kind, message.to_string());
    }

    /// Make every get of `kind` fail with an API error.
    pub fn fail_get(&self, kind: DefinitionKind, message: &str) {
        lock(&self.state)
            .get_failures
            .insert(kind, message.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DefinitionSource for MemoryCluster {
    async fn list(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        selector: Option<&str>,
    ) -> Result<Vec<Listed>, ClusterError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        if let Some(message) = state.list_failures.get(&kind) {
            return Err(ClusterError::Api(message.clone()));
        }
        let unlabeled = BTreeMap::new();
        Ok(state
            .definitions
            .iter()
            .filter(|(ns, item)| ns == namespace && listed_kind(item) == kind)
            .filter(|(_, item)| {
                let labels = item.as_ref().map_or(&unlabeled, |d| &d.labels);
                selector.map_or(true, |s| selector_matches(s, labels))
            })
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn get(
        &self,
        namespace: &str,
        kind: DefinitionKind,
        name: &str,
    ) -> Result<Option<RawDefinition>, ClusterError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        if let Some(message) = state.get_failures.get(&kind) {
            return Err(ClusterError::Api(message.clone()));
        }
        match state
            .definitions
            .iter()
            .find(|(ns, item)| ns == namespace && listed_kind(item) == kind && listed_name(item) == name)
        {
            None => Ok(None),
            Some((_, Ok(definition))) => Ok(Some(definition.clone())),
            Some((_, Err(bad))) => Err(ClusterError::Decode(bad.clone())),
        }
    }
}

fn listed_kind(item: &Listed) -> DefinitionKind {
    match item {
        Ok(definition) => definition.kind(),
        Err(bad) => bad.kind,
    }
}

fn listed_name(item: &Listed) -> &str {
    match item {
        Ok(definition) => &definition.name,
        Err(bad) => &bad.name,
    }
}

/// Equality-based label selector: `k=v`, `k==v`, `k!=v`, `k`, `!k`, comma separated.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
            {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else if let Some(key) = term.strip_prefix('!') {
                !labels.contains_key(key.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

// --- Discovery ---

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServedResource {
    group: String,
    version: String,
    plural: String,
    kind: String,
}

#[derive(Default)]
struct DiscoveryState {
    resources: Vec<ServedResource>,
    open_failure: Option<DiscoveryError>,
}

/// Discovery over a registered resource table. Registration is visible to
/// handles that are already open.
#[derive(Clone, Default)]
pub struct MemoryDiscovery {
    state: Arc<Mutex<DiscoveryState>>,
    opens: Arc<AtomicUsize>,
    lookups: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDiscovery")
            .field("resources", &lock(&self.state).resources.len())
            .finish_non_exhaustive()
    }
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `plural` as `kind` in `group/version`. Earlier registrations of a
    /// resource are preferred.
    pub fn register(&self, group: &str, version: &str, plural: &str, kind: &str) {
        lock(&self.state).resources.push(ServedResource {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            kind: kind.to_string(),
        });
    }

    pub fn fail_open(&self, message: &str) {
        lock(&self.state).open_failure = Some(DiscoveryError::Api(message.to_string()));
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryProvider for MemoryDiscovery {
    async fn open(&self) -> Result<Arc<dyn ApiDiscovery>, DiscoveryError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.state).open_failure.clone() {
            return Err(err);
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl ApiDiscovery for MemoryDiscovery {
    async fn kinds_for(
        &self,
        resource: &GroupVersionResource,
    ) -> Result<Vec<GroupVersionKind>, DiscoveryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let kinds: Vec<GroupVersionKind> = lock(&self.state)
            .resources
            .iter()
            .filter(|r| r.group == resource.group && r.plural == resource.resource)
            .filter(|r| resource.version.is_empty() || r.version == resource.version)
            .map(|r| GroupVersionKind::new(&r.group, &r.version, &r.kind))
            .collect();
        if kinds.is_empty() {
            return Err(no_resource_match(resource));
        }
        Ok(kinds)
    }

    async fn resource_for(
        &self,
        kind: &GroupVersionKind,
    ) -> Result<GroupVersionResource, DiscoveryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        lock(&self.state)
            .resources
            .iter()
            .find(|r| {
                r.group == kind.group
                    && r.kind == kind.kind
                    && (kind.version.is_empty() || r.version == kind.version)
            })
            .map(|r| GroupVersionResource::new(&r.group, &r.version, &r.plural))
            .ok_or_else(|| no_kind_match(kind))
    }
}

// --- Template fetches ---

#[derive(Default)]
struct FetcherState {
    bodies: HashMap<String, String>,
    cancel_on: HashMap<String, CancellationToken>,
}

/// Serves registered bodies and counts every fetch attempt.
#[derive(Clone, Default)]
pub struct RecordingFetcher {
    state: Arc<Mutex<FetcherState>>,
    calls: Arc<AtomicUsize>,
}

impl std::fmt::Debug for RecordingFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingFetcher")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl RecordingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, uri: &str, body: &str) {
        lock(&self.state)
            .bodies
            .insert(uri.to_string(), body.to_string());
    }

    /// Cancel `token` when `uri` is fetched.
    pub fn cancel_on(&self, uri: &str, token: CancellationToken) {
        lock(&self.state).cancel_on.insert(uri.to_string(), token);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateFetcher for RecordingFetcher {
    async fn get(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchTemplateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = {
            let state = lock(&self.state);
            if let Some(token) = state.cancel_on.get(uri) {
                token.cancel();
            }
            state.bodies.get(uri).cloned()
        };
        if cancel.is_cancelled() {
            return Err(FetchTemplateError::Cancelled);
        }
        body.map(String::into_bytes)
            .ok_or(FetchTemplateError::Status { status: 404 })
    }
}

// --- Chart installs ---

type InstallHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ChartState {
    installed: HashSet<HelmChart>,
    hooks: HashMap<String, InstallHook>,
    failure: Option<String>,
    streams: Vec<IoStreams>,
}

/// Records installs instead of running them.
#[derive(Clone, Default)]
pub struct MemoryChartInstaller {
    state: Arc<Mutex<ChartState>>,
    installs: Arc<AtomicUsize>,
    status_checks: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryChartInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChartInstaller")
            .field("installs", &self.installs())
            .finish_non_exhaustive()
    }
}

impl MemoryChartInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a chart as already present in the cluster.
    pub fn preinstall(&self, chart: &HelmChart) {
        lock(&self.state).installed.insert(chart.clone());
    }

    /// Make every install fail with `message`.
    pub fn fail_with(&self, message: &str) {
        lock(&self.state).failure = Some(message.to_string());
    }

    /// Run `hook` after a chart named `chart` is installed.
    pub fn on_install(&self, chart: &str, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.state)
            .hooks
            .insert(chart.to_string(), Arc::new(hook));
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    /// Streams passed to each install, in call order.
    pub fn streams(&self) -> Vec<IoStreams> {
        lock(&self.state).streams.clone()
    }
}

#[async_trait]
impl ChartInstaller for MemoryChartInstaller {
    async fn is_installed(
        &self,
        chart: &HelmChart,
        _cancel: &CancellationToken,
    ) -> Result<bool, ChartError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.state).installed.contains(chart))
    }

    async fn install(
        &self,
        streams: IoStreams,
        chart: &HelmChart,
        cancel: &CancellationToken,
    ) -> Result<(), ChartError> {
        if cancel.is_cancelled() {
            return Err(ChartError::Cancelled);
        }
        let hook = {
            let mut state = lock(&self.state);
            state.streams.push(streams);
            if let Some(message) = &state.failure {
                return Err(ChartError::Rejected(message.clone()));
            }
            state.installed.insert(chart.clone());
            state.hooks.get(&chart.name).map(Arc::clone)
        };
        self.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }
}
