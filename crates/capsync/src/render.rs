//! Terminal output for the capsync CLI.

use capsync_core::{Capability, Parameter};
use thiserror::Error;

use crate::sync::SyncReport;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml encoding failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

/// Capability list as a table or a serialized document.
pub fn render_list(capabilities: &[Capability], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(capabilities)? + "\n"),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(capabilities)?),
        OutputFormat::Table => Ok(list_table(capabilities)),
    }
}

/// One capability with its parameter table.
pub fn render_details(capability: &Capability, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(capability)? + "\n"),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(capability)?),
        OutputFormat::Table => Ok(details_table(capability)),
    }
}

fn list_table(capabilities: &[Capability]) -> String {
    if capabilities.is_empty() {
        return "No capabilities found.\n".to_string();
    }

    let mut out = format!(
        "{:<24}  {:<10}  {:<32}  {:<24}  {}\n",
        "NAME", "TYPE", "DEFINITION", "APPLIES-TO", "DESCRIPTION"
    );
    out.push_str(&"-".repeat(110));
    out.push('\n');
    for capability in capabilities {
        let applies_to = capability.applies_to().join(",");
        out.push_str(&format!(
            "{:<24}  {:<10}  {:<32}  {:<24}  {}\n",
            truncate(&capability.name, 24),
            capability.kind().as_str(),
            truncate(or_dash(&capability.backing_reference), 32),
            truncate(or_dash(&applies_to), 24),
            capability.description,
        ));
    }
    out.push('\n');
    out.push_str(&format!("{} capability(ies)\n", capabilities.len()));
    out
}

fn details_table(capability: &Capability) -> String {
    let mut out = format!("Capability: {}\n\n", capability.name);
    out.push_str(&format!("  Type:         {}\n", capability.kind()));
    out.push_str(&format!("  Namespace:    {}\n", or_dash(&capability.namespace)));
    out.push_str(&format!(
        "  Definition:   {}\n",
        or_dash(&capability.backing_reference)
    ));
    if let Some(identity) = &capability.api_identity {
        out.push_str(&format!("  API:          {identity}\n"));
    }
    if !capability.applies_to().is_empty() {
        out.push_str(&format!(
            "  Applies To:   {}\n",
            capability.applies_to().join(", ")
        ));
    }
    if let Some(chart) = capability.chart() {
        out.push_str(&format!(
            "  Install:      {} {} ({})\n",
            chart.name, chart.version, chart.url
        ));
    }
    out.push_str(&format!("  Description:  {}\n", capability.description));

    if capability.parameters.is_empty() {
        return out;
    }
    out.push_str("\n  Parameters:\n");
    out.push_str(&format!(
        "    {:<20}  {:<16}  {:<8}  {:<16}  {}\n",
        "NAME", "TYPE", "REQUIRED", "DEFAULT", "USAGE"
    ));
    out.push_str(&format!("    {}\n", "-".repeat(80)));
    for parameter in capability.parameters.iter().filter(|p| !p.ignore) {
        out.push_str(&format!(
            "    {:<20}  {:<16}  {:<8}  {:<16}  {}\n",
            truncate(&parameter_label(parameter), 20),
            truncate(&parameter.kind.to_string(), 16),
            parameter.required,
            truncate(&format_default(parameter), 16),
            parameter.description,
        ));
    }
    out
}

/// Summary lines for a sync, warnings first.
pub fn render_sync_report(report: &SyncReport, dir: &std::path::Path) -> String {
    let mut out = String::new();
    for warning in &report.warnings {
        out.push_str(warning);
        out.push('\n');
    }
    out.push_str(&format!(
        "Synced {} capability(ies) to {} ({} updated)\n",
        report.capabilities.len(),
        dir.display(),
        report.written
    ));
    out
}

fn parameter_label(parameter: &Parameter) -> String {
    if parameter.short.is_empty() {
        parameter.name.clone()
    } else {
        format!("{} (-{})", parameter.name, parameter.short)
    }
}

fn format_default(parameter: &Parameter) -> String {
    match &parameter.default {
        Some(serde_json::Value::String(s)) => format!("{s:?}"),
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsync_core::{CapabilityClass, ParameterType};

    fn scaler() -> Capability {
        Capability {
            name: "scaler".into(),
            namespace: "vela-system".into(),
            class: CapabilityClass::Trait {
                applies_to: vec!["webservice".into(), "worker".into()],
            },
            backing_reference: String::new(),
            api_identity: None,
            description: "Manually scale the component".into(),
            template: "parameter: {\n\treplicas: *1 | int\n}\n".into(),
            template_uri: None,
            parameters: vec![Parameter {
                name: "replicas".into(),
                kind: ParameterType::INT,
                required: false,
                default: Some(serde_json::json!(1)),
                description: "Number of replicas".into(),
                short: "r".into(),
                alias: String::new(),
                ignore: false,
            }],
            install_source: None,
        }
    }

    #[test]
    fn table_lists_each_capability() {
        let out = render_list(&[scaler()], OutputFormat::Table).unwrap();
        assert!(out.starts_with("NAME"));
        assert!(out.contains("scaler"));
        assert!(out.contains("webservice,worker"));
        assert!(out.ends_with("1 capability(ies)\n"));
    }

    #[test]
    fn empty_table_says_so() {
        assert_eq!(
            render_list(&[], OutputFormat::Table).unwrap(),
            "No capabilities found.\n"
        );
    }

    #[test]
    fn json_uses_capability_field_names() {
        let out = render_list(&[scaler()], OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value[0]["type"], "trait");
        assert_eq!(value[0]["appliesTo"][1], "worker");
        assert_eq!(value[0]["parameters"][0]["usage"], "Number of replicas");
    }

    #[test]
    fn details_show_parameters() {
        let out = render_details(&scaler(), OutputFormat::Table).unwrap();
        assert!(out.contains("Applies To:   webservice, worker"));
        assert!(out.contains("replicas (-r)"));
        assert!(out.contains("Number of replicas"));
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-name", 10), "a-very-...");
    }
}
