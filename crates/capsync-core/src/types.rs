//! Core types for resolved capabilities.
//!
//! A `Capability` is the user-facing descriptor of a workload type or trait,
//! built from a raw definition stored in the cluster.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::definition::DefinitionKind;

// --- Capability record ---

/// A fully resolved capability.
///
/// Serializes to the camelCase shape consumed by downstream tooling
/// (`crdName`, `crdInfo`, `templateURI`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(flatten)]
    pub class: CapabilityClass,
    /// Name of the reference record used to resolve the API identity.
    #[serde(rename = "crdName", default, skip_serializing_if = "String::is_empty")]
    pub backing_reference: String,
    #[serde(rename = "crdInfo", default, skip_serializing_if = "Option::is_none")]
    pub api_identity: Option<ApiIdentity>,
    pub description: String,
    pub template: String,
    /// Remote template source. Cleared once `template` holds the resolved text.
    #[serde(rename = "templateURI", default, skip_serializing_if = "Option::is_none")]
    pub template_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(rename = "install", default, skip_serializing_if = "Option::is_none")]
    pub install_source: Option<Installation>,
}

impl Capability {
    pub fn kind(&self) -> DefinitionKind {
        self.class.kind()
    }

    pub fn applies_to(&self) -> &[String] {
        self.class.applies_to()
    }

    /// Chart this capability depends on, if any.
    pub fn chart(&self) -> Option<&HelmChart> {
        self.install_source.as_ref().map(|install| &install.helm)
    }
}

/// Capability class: a workload type, or a trait decorating workload kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CapabilityClass {
    #[serde(rename = "componentDefinition")]
    WorkloadDefining,
    #[serde(rename = "trait")]
    Trait {
        /// Workload kinds this trait may decorate, in declaration order.
        #[serde(rename = "appliesTo", default, skip_serializing_if = "Vec::is_empty")]
        applies_to: Vec<String>,
    },
}

impl CapabilityClass {
    pub fn kind(&self) -> DefinitionKind {
        match self {
            Self::WorkloadDefining => DefinitionKind::Component,
            Self::Trait { .. } => DefinitionKind::Trait,
        }
    }

    pub fn applies_to(&self) -> &[String] {
        match self {
            Self::WorkloadDefining => &[],
            Self::Trait { applies_to } => applies_to,
        }
    }
}

/// Concrete API identity a definition resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIdentity {
    pub api_version: String,
    pub kind: String,
}

impl From<&GroupVersionKind> for ApiIdentity {
    fn from(gvk: &GroupVersionKind) -> Self {
        Self {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
        }
    }
}

impl fmt::Display for ApiIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version, self.kind)
    }
}

/// External chart dependency declared by a definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Installation {
    pub helm: HelmChart,
}

/// Helm chart coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HelmChart {
    /// Local repository alias.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    /// Chart name, also used as the release name.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Repository URL.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
}

// --- Parameters ---

/// A single parameter extracted from a template's `parameter` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(rename = "usage", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore: bool,
}

/// Set of value kinds a parameter admits.
///
/// Mirrors CUE kinds: a disjunction like `string | null` admits both kinds,
/// `int | float` is `number`, and `_` admits everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterType(u8);

impl ParameterType {
    pub const BOTTOM: Self = Self(0);
    pub const NULL: Self = Self(1);
    pub const BOOL: Self = Self(1 << 1);
    pub const INT: Self = Self(1 << 2);
    pub const FLOAT: Self = Self(1 << 3);
    pub const STRING: Self = Self(1 << 4);
    pub const BYTES: Self = Self(1 << 5);
    pub const STRUCT: Self = Self(1 << 6);
    pub const LIST: Self = Self(1 << 7);
    pub const NUMBER: Self = Self(Self::INT.0 | Self::FLOAT.0);
    pub const TOP: Self = Self(u8::MAX);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::NULL, "null"),
        (Self::BOOL, "bool"),
        (Self::INT, "int"),
        (Self::FLOAT, "float"),
        (Self::STRING, "string"),
        (Self::BYTES, "bytes"),
        (Self::STRUCT, "struct"),
        (Self::LIST, "list"),
    ];

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_bottom(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::TOP {
            return f.write_str("_");
        }
        if self.is_bottom() {
            return f.write_str("_|_");
        }
        let mut parts = Vec::new();
        for (kind, name) in Self::NAMES {
            if kind == Self::FLOAT && self.contains(Self::NUMBER) {
                continue;
            }
            if kind == Self::INT && self.contains(Self::NUMBER) {
                parts.push("number");
                continue;
            }
            if self.contains(kind) {
                parts.push(name);
            }
        }
        f.write_str(&parts.join("|"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown parameter type: {0}")]
pub struct ParseParameterTypeError(String);

impl FromStr for ParameterType {
    type Err = ParseParameterTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "_" => return Ok(Self::TOP),
            "_|_" => return Ok(Self::BOTTOM),
            _ => {}
        }
        let mut kind = Self::BOTTOM;
        for part in s.split('|').map(str::trim) {
            let next = match part {
                "number" => Self::NUMBER,
                other => Self::NAMES
                    .iter()
                    .find(|(_, name)| *name == other)
                    .map(|(k, _)| *k)
                    .ok_or_else(|| ParseParameterTypeError(s.to_string()))?,
            };
            kind = kind.union(next);
        }
        Ok(kind)
    }
}

impl Serialize for ParameterType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ParameterType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// --- Template resolution output ---

/// Where a resolved template came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Inline template in the structured schematic.
    Schematic,
    /// Legacy `template` field of the raw extension payload.
    Extension,
    /// Fetched from a remote URI.
    Remote { uri: String },
}

impl TemplateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schematic => "schematic",
            Self::Extension => "extension",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Template text and parameter schema produced by template resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    pub template: String,
    pub parameters: Vec<Parameter>,
    pub install: Option<Installation>,
    pub source: TemplateSource,
}

// --- API identities ---

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unexpected GroupVersion string: {0}")]
    InvalidGroupVersion(String),
}

/// Group/version/kind triple as served by the API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Parse from an `apiVersion` string and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, IdentityError> {
        let (group, version) = parse_group_version(api_version)?;
        Ok(Self::new(group, version, kind))
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

/// Group/version/resource triple. `version` may be empty for partial lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// `resource.group`, or just `resource` for the core group.
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Resource={}", self.group, self.version, self.resource)
    }
}

/// Split `resource.group` at the first dot.
pub fn parse_group_resource(name: &str) -> (String, String) {
    match name.split_once('.') {
        Some((resource, group)) => (group.to_string(), resource.to_string()),
        None => (String::new(), name.to_string()),
    }
}

/// Split `group/version` (or bare `version`).
pub fn parse_group_version(api_version: &str) -> Result<(String, String), IdentityError> {
    if api_version.is_empty() || api_version == "/" {
        return Ok((String::new(), String::new()));
    }
    match api_version.split('/').collect::<Vec<_>>().as_slice() {
        [version] => Ok((String::new(), (*version).to_string())),
        [group, version] => Ok(((*group).to_string(), (*version).to_string())),
        _ => Err(IdentityError::InvalidGroupVersion(api_version.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_type_display() {
        assert_eq!(ParameterType::STRING.to_string(), "string");
        assert_eq!(ParameterType::NUMBER.to_string(), "number");
        assert_eq!(ParameterType::TOP.to_string(), "_");
        assert_eq!(ParameterType::BOTTOM.to_string(), "_|_");
        assert_eq!(
            ParameterType::STRING.union(ParameterType::NULL).to_string(),
            "null|string"
        );
        assert_eq!(
            ParameterType::NUMBER.union(ParameterType::STRING).to_string(),
            "number|string"
        );
    }

    #[test]
    fn parameter_type_parses_its_display() {
        for kind in [
            ParameterType::INT,
            ParameterType::NUMBER,
            ParameterType::STRING.union(ParameterType::NULL),
            ParameterType::TOP,
        ] {
            assert_eq!(kind.to_string().parse::<ParameterType>().unwrap(), kind);
        }
        assert!("widget".parse::<ParameterType>().is_err());
    }

    #[test]
    fn parameter_type_intersects_number() {
        assert_eq!(
            ParameterType::NUMBER.intersect(ParameterType::INT),
            ParameterType::INT
        );
        assert!(ParameterType::STRING
            .intersect(ParameterType::INT)
            .is_bottom());
    }

    #[test]
    fn group_resource_splits_at_first_dot() {
        assert_eq!(
            parse_group_resource("deployments.apps"),
            ("apps".to_string(), "deployments".to_string())
        );
        assert_eq!(
            parse_group_resource("routes.standard.oam.dev"),
            ("standard.oam.dev".to_string(), "routes".to_string())
        );
        assert_eq!(
            parse_group_resource("pods"),
            (String::new(), "pods".to_string())
        );
    }

    #[test]
    fn group_version_parsing() {
        assert_eq!(
            parse_group_version("apps/v1").unwrap(),
            ("apps".to_string(), "v1".to_string())
        );
        assert_eq!(
            parse_group_version("v1").unwrap(),
            (String::new(), "v1".to_string())
        );
        assert!(parse_group_version("a/b/c").is_err());
    }

    #[test]
    fn api_identity_from_core_group() {
        let gvk = GroupVersionKind::new("", "v1", "Service");
        let identity = ApiIdentity::from(&gvk);
        assert_eq!(identity.api_version, "v1");
        assert_eq!(identity.kind, "Service");
    }

    #[test]
    fn capability_serializes_camel_case_shape() {
        let capability = Capability {
            name: "ingress".to_string(),
            namespace: "vela-system".to_string(),
            class: CapabilityClass::Trait {
                applies_to: vec!["webservice".to_string()],
            },
            backing_reference: "ingresses.networking.k8s.io".to_string(),
            api_identity: Some(ApiIdentity {
                api_version: "networking.k8s.io/v1".to_string(),
                kind: "Ingress".to_string(),
            }),
            description: "Expose a service".to_string(),
            template: "parameter: {}".to_string(),
            template_uri: None,
            parameters: Vec::new(),
            install_source: None,
        };

        let json = serde_json::to_value(&capability).unwrap();
        assert_eq!(json["type"], "trait");
        assert_eq!(json["appliesTo"][0], "webservice");
        assert_eq!(json["crdName"], "ingresses.networking.k8s.io");
        assert_eq!(json["crdInfo"]["apiVersion"], "networking.k8s.io/v1");
        assert!(json.get("templateURI").is_none());

        let back: Capability = serde_json::from_value(json).unwrap();
        assert_eq!(back, capability);
    }
}
