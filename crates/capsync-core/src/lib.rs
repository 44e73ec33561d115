pub mod assemble;
pub mod config;
pub mod cue;
pub mod definition;
pub mod parameters;
pub mod types;

pub use assemble::{assemble, description_from, AssemblyParts};
pub use config::Config;
pub use definition::{DefinitionKind, RawDefinition};
pub use parameters::{parameters_from_template, ParameterError};
pub use types::*;
