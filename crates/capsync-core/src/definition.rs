//! Raw definition objects as stored in the cluster.
//!
//! Only the fields capability resolution reads are modelled; everything else
//! in the object is ignored on decode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{HelmChart, Installation};

pub const DEFINITION_GROUP: &str = "core.oam.dev";
pub const DEFINITION_VERSION: &str = "v1beta1";
/// Workload type whose kind is detected at deploy time; it has no API identity.
pub const AUTODETECT_WORKLOAD_TYPE: &str = "autodetects.core.oam.dev";

/// Definition class. Closed set: components define workloads, traits decorate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Component,
    Trait,
}

impl DefinitionKind {
    pub const ALL: [Self; 2] = [Self::Component, Self::Trait];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Trait => "trait",
        }
    }

    pub fn crd_kind(self) -> &'static str {
        match self {
            Self::Component => "ComponentDefinition",
            Self::Trait => "TraitDefinition",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::Component => "componentdefinitions",
            Self::Trait => "traitdefinitions",
        }
    }
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A definition object read from the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDefinition {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: DefinitionSpec,
}

impl RawDefinition {
    pub fn component(name: impl Into<String>, spec: ComponentDefinitionSpec) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: DefinitionSpec::Component(spec),
        }
    }

    pub fn trait_definition(name: impl Into<String>, spec: TraitDefinitionSpec) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: DefinitionSpec::Trait(spec),
        }
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> DefinitionKind {
        self.spec.kind()
    }

    pub fn extension(&self) -> Option<&serde_json::Value> {
        match &self.spec {
            DefinitionSpec::Component(spec) => spec.extension.as_ref(),
            DefinitionSpec::Trait(spec) => spec.extension.as_ref(),
        }
    }

    pub fn schematic(&self) -> Option<&Schematic> {
        match &self.spec {
            DefinitionSpec::Component(spec) => spec.schematic.as_ref(),
            DefinitionSpec::Trait(spec) => spec.schematic.as_ref(),
        }
    }

    /// Applies-to list; empty for components.
    pub fn applies_to(&self) -> &[String] {
        match &self.spec {
            DefinitionSpec::Component(_) => &[],
            DefinitionSpec::Trait(spec) => &spec.applies_to_workloads,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionSpec {
    Component(ComponentDefinitionSpec),
    Trait(TraitDefinitionSpec),
}

impl DefinitionSpec {
    pub fn kind(&self) -> DefinitionKind {
        match self {
            Self::Component(_) => DefinitionKind::Component,
            Self::Trait(_) => DefinitionKind::Trait,
        }
    }

    /// Decode the `spec` object of a definition of the given kind.
    pub fn from_value(
        kind: DefinitionKind,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let value = if value.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            value
        };
        Ok(match kind {
            DefinitionKind::Component => Self::Component(serde_json::from_value(value)?),
            DefinitionKind::Trait => Self::Trait(serde_json::from_value(value)?),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionSpec {
    #[serde(default)]
    pub workload: WorkloadTypeDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraitDefinitionSpec {
    #[serde(default)]
    pub definition_ref: DefinitionReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to_workloads: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,
}

/// How a component names its workload: by reference name or by api version and kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadTypeDescriptor {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<WorkloadGvk>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadGvk {
    pub api_version: String,
    pub kind: String,
}

/// Reference record name (`resource.group`) and optional served version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionReference {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl DefinitionReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schematic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue: Option<CueSchematic>,
}

impl Schematic {
    pub fn cue(template: impl Into<String>) -> Self {
        Self {
            cue: Some(CueSchematic {
                template: template.into(),
            }),
        }
    }

    /// Inline template text, unless empty or whitespace only.
    pub fn template(&self) -> Option<&str> {
        self.cue
            .as_ref()
            .map(|cue| cue.template.as_str())
            .filter(|template| !template.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CueSchematic {
    #[serde(default)]
    pub template: String,
}

/// Decoded form of the free-form `extension` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(rename = "templateURI", default, skip_serializing_if = "String::is_empty")]
    pub template_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallPayload>,
}

impl ExtensionPayload {
    /// Decode an extension payload. A missing payload decodes to the empty payload.
    pub fn decode(raw: Option<&serde_json::Value>) -> Result<Self, serde_json::Error> {
        match raw {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(value) => Self::deserialize(value),
        }
    }

    /// Chart dependency, if one with a name was declared.
    pub fn installation(&self) -> Option<Installation> {
        let helm = self.install.as_ref()?.helm.as_ref()?;
        if helm.name.is_empty() {
            return None;
        }
        Some(Installation { helm: helm.clone() })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmChart>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn component_spec_decodes_workload_forms() {
        let spec = DefinitionSpec::from_value(
            DefinitionKind::Component,
            json!({
                "workload": {"definition": {"apiVersion": "apps/v1", "kind": "Deployment"}},
                "schematic": {"cue": {"template": "output: {}"}},
                "unrelated": true
            }),
        )
        .unwrap();
        let DefinitionSpec::Component(spec) = spec else {
            panic!("expected component spec");
        };
        assert!(spec.workload.type_name.is_empty());
        let gvk = spec.workload.definition.unwrap();
        assert_eq!(gvk.api_version, "apps/v1");
        assert_eq!(gvk.kind, "Deployment");
        assert_eq!(spec.schematic.unwrap().template(), Some("output: {}"));
    }

    #[test]
    fn trait_spec_decodes_applies_to() {
        let spec = DefinitionSpec::from_value(
            DefinitionKind::Trait,
            json!({
                "definitionRef": {"name": "ingresses.networking.k8s.io"},
                "appliesToWorkloads": ["webservice", "worker"]
            }),
        )
        .unwrap();
        let DefinitionSpec::Trait(spec) = spec else {
            panic!("expected trait spec");
        };
        assert_eq!(spec.definition_ref.name, "ingresses.networking.k8s.io");
        assert_eq!(spec.applies_to_workloads, vec!["webservice", "worker"]);
    }

    #[test]
    fn null_spec_decodes_as_empty() {
        let spec = DefinitionSpec::from_value(DefinitionKind::Trait, serde_json::Value::Null)
            .unwrap();
        assert_eq!(spec, DefinitionSpec::Trait(TraitDefinitionSpec::default()));
    }

    #[test]
    fn empty_schematic_template_is_absent() {
        assert_eq!(Schematic::cue("").template(), None);
        assert_eq!(Schematic::cue(" \n\t").template(), None);
        assert_eq!(Schematic::default().template(), None);
    }

    #[test]
    fn extension_payload_reads_install() {
        let raw = json!({
            "templateURI": "https://example.com/t.cue",
            "install": {"helm": {"repo": "kedacore", "name": "keda", "url": "https://kedacore.github.io/charts", "version": "2.0.0"}}
        });
        let payload = ExtensionPayload::decode(Some(&raw)).unwrap();
        assert!(payload.template.is_empty());
        assert_eq!(payload.template_uri, "https://example.com/t.cue");
        let install = payload.installation().unwrap();
        assert_eq!(install.helm.name, "keda");
        assert_eq!(install.helm.version, "2.0.0");
    }

    #[test]
    fn extension_payload_rejects_wrong_shape() {
        let raw = json!({"template": 42});
        assert!(ExtensionPayload::decode(Some(&raw)).is_err());
        assert_eq!(
            ExtensionPayload::decode(None).unwrap(),
            ExtensionPayload::default()
        );
    }

    #[test]
    fn install_without_chart_name_is_ignored() {
        let raw = json!({"install": {"helm": {"url": "https://charts.example.com"}}});
        let payload = ExtensionPayload::decode(Some(&raw)).unwrap();
        assert!(payload.installation().is_none());
    }
}
