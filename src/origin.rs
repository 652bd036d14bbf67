//! Provenance of a container's `Entrypoint` and `Cmd`.
//!
//! The daemon reports the effective values, which for most containers are
//! just the image defaults copied in at creation time. Carrying those copies
//! over to a new image would pin the old image's entrypoint on the new one,
//! so we remember per container whether each field was set by an operator
//! (`Explicit`), copied from the image (`Inherited`), or predates tracking
//! (`Unknown`).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::store::{JsonFile, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeOrigin {
    Explicit,
    Inherited,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeOrigins {
    pub entrypoint: RuntimeOrigin,
    pub cmd: RuntimeOrigin,
}

/// Classify a value against the default of the image it was created from.
pub fn classify(value: &Option<Vec<String>>, image_default: &Option<Vec<String>>) -> RuntimeOrigin {
    match value {
        None => RuntimeOrigin::Inherited,
        Some(v) if v.is_empty() => RuntimeOrigin::Inherited,
        Some(v) if Some(v) == image_default.as_ref() => RuntimeOrigin::Inherited,
        Some(_) => RuntimeOrigin::Explicit,
    }
}

/// Result of reconciling one runtime field for a new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledField {
    pub value: Option<Vec<String>>,
    pub origin: RuntimeOrigin,
}

/// Decide what to carry over for one field when moving to a new image.
///
/// An inherited value that still equals the old image's default is dropped
/// so the new image's default applies. Explicit and unknown values are kept.
pub fn reconcile_field(
    value: &Option<Vec<String>>,
    origin: RuntimeOrigin,
    old_image_default: &Option<Vec<String>>,
) -> ReconciledField {
    match origin {
        RuntimeOrigin::Inherited if value.is_none() || value == old_image_default => {
            ReconciledField {
                value: None,
                origin: RuntimeOrigin::Inherited,
            }
        }
        // Inherited from something other than the old default: we cannot
        // tell where it came from anymore.
        RuntimeOrigin::Inherited => ReconciledField {
            value: value.clone(),
            origin: RuntimeOrigin::Unknown,
        },
        RuntimeOrigin::Explicit | RuntimeOrigin::Unknown => ReconciledField {
            value: value.clone(),
            origin,
        },
    }
}

/// Origin to remember once `field` is set on a container of the new image.
///
/// Explicit stays explicit. Anything else that ends up equal to the new
/// image's default (or unset) is an inherited copy from now on.
pub fn settle(field: &ReconciledField, new_image_default: &Option<Vec<String>>) -> RuntimeOrigin {
    match (field.origin, classify(&field.value, new_image_default)) {
        (RuntimeOrigin::Explicit, _) => RuntimeOrigin::Explicit,
        (_, RuntimeOrigin::Inherited) => RuntimeOrigin::Inherited,
        (origin, _) => origin,
    }
}

pub struct OriginStore {
    file: JsonFile<HashMap<String, RuntimeOrigins>>,
}

impl OriginStore {
    pub fn in_memory() -> Self {
        Self {
            file: JsonFile::in_memory(),
        }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            file: JsonFile::open(path).await?,
        })
    }

    /// Origins for `container_name`, `Unknown` for untracked containers.
    pub async fn get(&self, container_name: &str) -> RuntimeOrigins {
        self.file
            .read(|map| map.get(container_name).copied().unwrap_or_default())
            .await
    }

    pub async fn set(
        &self,
        container_name: &str,
        origins: RuntimeOrigins,
    ) -> Result<(), StoreError> {
        let name = container_name.to_string();
        self.file
            .write(move |map| {
                map.insert(name, origins);
            })
            .await
    }
}
