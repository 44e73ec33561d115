//! Capability assembly: a pure merge of definition metadata with resolved parts.

use std::collections::BTreeMap;

use crate::config::{ANNOTATION_DESCRIPTION, DESCRIPTION_UNDEFINED};
use crate::definition::{DefinitionKind, RawDefinition};
use crate::types::{ApiIdentity, Capability, CapabilityClass, ResolvedTemplate};

/// Everything the pipeline resolved for one definition.
#[derive(Debug, Clone)]
pub struct AssemblyParts<'a> {
    pub definition: &'a RawDefinition,
    pub namespace: &'a str,
    pub backing_reference: String,
    pub api_identity: Option<ApiIdentity>,
    pub template: ResolvedTemplate,
}

/// Build the capability record. Never fails and performs no I/O.
pub fn assemble(parts: AssemblyParts<'_>) -> Capability {
    let AssemblyParts {
        definition,
        namespace,
        backing_reference,
        api_identity,
        template,
    } = parts;

    let class = match definition.kind() {
        DefinitionKind::Component => CapabilityClass::WorkloadDefining,
        DefinitionKind::Trait => CapabilityClass::Trait {
            applies_to: definition.applies_to().to_vec(),
        },
    };

    Capability {
        name: definition.name.clone(),
        namespace: namespace.to_string(),
        class,
        backing_reference,
        api_identity,
        description: description_from(&definition.annotations),
        template: template.template,
        template_uri: None,
        parameters: template.parameters,
        install_source: template.install,
    }
}

/// Description annotation with newlines collapsed, or the sentinel default.
pub fn description_from(annotations: &BTreeMap<String, String>) -> String {
    match annotations.get(ANNOTATION_DESCRIPTION) {
        Some(description) => description.replace("\r\n", " ").replace('\n', " "),
        None => DESCRIPTION_UNDEFINED.to_string(),
    }
}
