//! Renders the documents derived from the inventory: ACL policies for Consul and the
//! node configuration consumed by the playbooks. Output only depends on the inputs, so
//! re-rendering an unchanged inventory produces identical files.

mod node_config;
mod policies;

use std::{
    fs,
    path::{Path, PathBuf},
};

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;

use crate::inventory::InventoryError;

pub use node_config::{NodeConfigRenderer, NodeConfigTemplates};
pub use policies::{ConsulPolicy, PolicyRenderer, PolicyTemplates, RenderedPolicies};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to render template '{name}': {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Renders a template, failing on any variable that is not provided.
pub fn render_template<S: Serialize>(
    name: &str,
    source: &str,
    context: S,
) -> Result<String, RenderError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    env.render_str(source, context)
        .map_err(|source| RenderError::Template {
            name: name.to_string(),
            source,
        })
}

/// Writes `contents` to `path`, creating parent directories as needed.
pub fn write_file(path: impl AsRef<Path>, contents: &str) -> Result<(), RenderError> {
    let path = path.as_ref();
    let io_error = |source| RenderError::Io {
        path: path.to_owned(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    fs::write(path, contents).map_err(io_error)
}
