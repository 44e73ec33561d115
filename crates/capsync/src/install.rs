//! Chart dependency installation.

use async_trait::async_trait;
use capsync_core::config::DEFAULT_NAMESPACE;
use capsync_core::{HelmChart, Installation};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ResolveError;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("{0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ChartError>;

/// Where installer output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStreams {
    /// Bound to the process's stdin, stdout and stderr for interactive prompts.
    #[default]
    Terminal,
    /// Output captured and reported on failure.
    Captured,
}

#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Whether a release of this chart already exists.
    async fn is_installed(&self, chart: &HelmChart, cancel: &CancellationToken) -> Result<bool>;

    async fn install(
        &self,
        streams: IoStreams,
        chart: &HelmChart,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Release namespace, defaulting to the system namespace.
pub fn release_namespace(chart: &HelmChart) -> &str {
    if chart.namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        &chart.namespace
    }
}

/// Installer backed by the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmCli {
    bin: PathBuf,
}

impl HelmCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn install_args(chart: &HelmChart) -> Vec<String> {
        let reference = if chart.url.is_empty() && !chart.repo.is_empty() {
            format!("{}/{}", chart.repo, chart.name)
        } else {
            chart.name.clone()
        };
        let mut args = vec!["install".to_string(), chart.name.clone(), reference];
        if !chart.url.is_empty() {
            args.extend(["--repo".to_string(), chart.url.clone()]);
        }
        if !chart.version.is_empty() {
            args.extend(["--version".to_string(), chart.version.clone()]);
        }
        args.extend([
            "--namespace".to_string(),
            release_namespace(chart).to_string(),
            "--create-namespace".to_string(),
        ]);
        args
    }

    async fn run(
        &self,
        args: &[String],
        streams: IoStreams,
        cancel: &CancellationToken,
    ) -> Result<std::process::Output> {
        let mut command = Command::new(&self.bin);
        command.args(args).kill_on_drop(true);
        match streams {
            IoStreams::Terminal => {
                command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            IoStreams::Captured => {
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        debug!(bin = %self.bin.display(), args = ?args, "running helm");
        let child = command.spawn()?;

        // Dropping the child on cancel kills it.
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ChartError::Cancelled),
            output = child.wait_with_output() => Ok(output?),
        }
    }
}

#[async_trait]
impl ChartInstaller for HelmCli {
    async fn is_installed(&self, chart: &HelmChart, cancel: &CancellationToken) -> Result<bool> {
        let args = vec![
            "status".to_string(),
            chart.name.clone(),
            "--namespace".to_string(),
            release_namespace(chart).to_string(),
        ];
        let output = self.run(&args, IoStreams::Captured, cancel).await?;
        Ok(output.status.success())
    }

    async fn install(
        &self,
        streams: IoStreams,
        chart: &HelmChart,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = Self::install_args(chart);
        let output = self.run(&args, streams, cancel).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(ChartError::CommandFailed {
            command: format!("{} {}", self.bin.display(), args.join(" ")),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Ensures declared chart dependencies are present, at most one install per
/// chart for the lifetime of the installer.
pub struct DependencyInstaller {
    installer: Arc<dyn ChartInstaller>,
    streams: IoStreams,
    ensured: Mutex<HashSet<HelmChart>>,
}

impl std::fmt::Debug for DependencyInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyInstaller")
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

impl DependencyInstaller {
    pub fn new(installer: Arc<dyn ChartInstaller>, streams: IoStreams) -> Self {
        Self {
            installer,
            streams,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// No-op without an install source. Installs are serialized so two items
    /// sharing a chart never install it twice.
    pub async fn ensure_installed(
        &self,
        definition: &str,
        install: Option<&Installation>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ResolveError> {
        let Some(Installation { helm: chart }) = install else {
            return Ok(());
        };

        let mut ensured = self.ensured.lock().await;
        if ensured.contains(chart) {
            return Ok(());
        }

        let wrap = |source: ChartError| match source {
            ChartError::Cancelled => ResolveError::Cancelled,
            source => ResolveError::DependencyInstall {
                chart: chart.name.clone(),
                version: chart.version.clone(),
                url: chart.url.clone(),
                definition: definition.to_string(),
                source,
            },
        };

        if self.installer.is_installed(chart, cancel).await.map_err(wrap)? {
            debug!(chart = %chart.name, definition, "chart already installed");
        } else {
            info!(chart = %chart.name, version = %chart.version, definition, "installing chart dependency");
            let start = Utc::now();
            self.installer
                .install(self.streams, chart, cancel)
                .await
                .map_err(wrap)?;
            let duration_ms = (Utc::now() - start).num_milliseconds();
            info!(chart = %chart.name, duration_ms, "chart dependency installed");
        }
        ensured.insert(chart.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChartInstaller;

    fn keda() -> Installation {
        Installation {
            helm: HelmChart {
                name: "keda".into(),
                url: "https://kedacore.github.io/charts".into(),
                version: "2.8.0".into(),
                ..HelmChart::default()
            },
        }
    }

    #[test]
    fn install_args_use_repo_url_and_default_namespace() {
        let args = HelmCli::install_args(&keda().helm);
        assert_eq!(
            args.join(" "),
            "install keda keda --repo https://kedacore.github.io/charts --version 2.8.0 \
             --namespace vela-system --create-namespace"
        );
    }

    #[test]
    fn install_args_use_repo_alias_without_url() {
        let chart = HelmChart {
            repo: "bitnami".into(),
            name: "redis".into(),
            namespace: "cache".into(),
            ..HelmChart::default()
        };
        assert_eq!(
            HelmCli::install_args(&chart).join(" "),
            "install redis bitnami/redis --namespace cache --create-namespace"
        );
    }

    #[tokio::test]
    async fn absent_install_source_is_noop() {
        let charts = MemoryChartInstaller::new();
        let installer = DependencyInstaller::new(Arc::new(charts.clone()), IoStreams::Captured);
        installer
            .ensure_installed("webservice", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(charts.status_checks(), 0);
    }

    #[tokio::test]
    async fn second_ensure_does_not_reinstall() {
        let charts = MemoryChartInstaller::new();
        let installer = DependencyInstaller::new(Arc::new(charts.clone()), IoStreams::Captured);
        let cancel = CancellationToken::new();

        installer.ensure_installed("scaler", Some(&keda()), &cancel).await.unwrap();
        installer.ensure_installed("scaler", Some(&keda()), &cancel).await.unwrap();

        assert_eq!(charts.installs(), 1);
    }

    #[tokio::test]
    async fn preinstalled_chart_is_not_installed_again() {
        let charts = MemoryChartInstaller::new();
        charts.preinstall(&keda().helm);
        let installer = DependencyInstaller::new(Arc::new(charts.clone()), IoStreams::Captured);

        installer
            .ensure_installed("scaler", Some(&keda()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(charts.installs(), 0);
    }

    #[tokio::test]
    async fn failure_names_chart_and_definition() {
        let charts = MemoryChartInstaller::new();
        charts.fail_with("repository unreachable");
        let installer = DependencyInstaller::new(Arc::new(charts), IoStreams::Captured);

        let err = installer
            .ensure_installed("scaler", Some(&keda()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to install helm chart dependency keda(2.8.0 from https://kedacore.github.io/charts) \
             for capability 'scaler': repository unreachable"
        );
    }
}
