//! capsync - resolves capability definitions stored in a cluster into
//! capability records, and keeps a local cache of their templates.

pub mod cluster;
pub mod error;
pub mod fetch;
pub mod install;
pub mod memory;
pub mod reference;
pub mod render;
pub mod sync;
pub mod template;

pub use error::{BatchResult, FetchError, ItemError, ResolveError, Stage};
pub use fetch::Pipeline;
pub use install::{DependencyInstaller, IoStreams};
pub use sync::{sync_all, sync_one, LocalCache, SyncReport};
pub use template::TemplateResolver;
