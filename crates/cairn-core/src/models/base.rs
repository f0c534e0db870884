//! Fields common to every persisted document.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identifier::{NamespaceIdentifier, ResourceIdentifier, ResourceLocator};

/// Optimistic-concurrency token. Populated on read, minted fresh on every
/// write, and required by conditional writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBase {
    pub namespace: NamespaceIdentifier,
    pub id: ResourceIdentifier,
    pub updated: DateTime<Utc>,
    /// Soft-delete timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: String,
    /// Not part of the body; the store fills it in on read.
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl DocumentBase {
    pub fn new(locator: ResourceLocator) -> Self {
        Self {
            namespace: locator.namespace().clone(),
            id: locator.resource().clone(),
            updated: Utc::now(),
            deleted: None,
            updated_by: String::new(),
            etag: None,
        }
    }

    pub fn locator(&self) -> ResourceLocator {
        ResourceLocator::new(self.namespace.clone(), self.id.clone())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }
}
