//! On-disk directory layout for index providers
//!
//! Nothing here is stored; every path is derived from the store directory
//! and the provider descriptor. Layout:
//!
//! ```text
//! <store>/schema/index/<providerKey>-<version>            index root
//! <store>/schema/index/<providerKey>-<version>/<indexId>  one index
//! .../<indexId>/<subKey>-<subVersion>                     sub-provider
//! ```
//!
//! Non-alphanumeric characters in a provider key are sanitized to `_`
//! when forming directory names.

use crate::schema::IndexId;
use std::path::{Path, PathBuf};

/// Identifies an index provider implementation and its format version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderDescriptor {
    pub key: String,
    pub version: String,
}

impl ProviderDescriptor {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        ProviderDescriptor {
            key: key.into(),
            version: version.into(),
        }
    }

    /// Directory name for this descriptor, with the key sanitized
    fn directory_name(&self) -> String {
        format!("{}-{}", sanitize_key(&self.key), self.version)
    }
}

/// Replace non-alphanumeric characters with `_` for use in paths
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Derived directory layout for one provider under one store directory
#[derive(Debug, Clone)]
pub struct DirectoryLayout {
    store_dir: PathBuf,
    provider: ProviderDescriptor,
}

impl DirectoryLayout {
    pub fn new(store_dir: impl AsRef<Path>, provider: ProviderDescriptor) -> Self {
        DirectoryLayout {
            store_dir: store_dir.as_ref().to_path_buf(),
            provider,
        }
    }

    pub fn provider(&self) -> &ProviderDescriptor {
        &self.provider
    }

    /// Root directory for all of this provider's indexes
    pub fn root(&self) -> PathBuf {
        self.store_dir
            .join("schema")
            .join("index")
            .join(self.provider.directory_name())
    }

    /// Directory holding one index
    pub fn directory_for_index(&self, id: IndexId) -> PathBuf {
        self.root().join(id.as_u64().to_string())
    }

    /// Directory for a sub-provider nested under one index
    pub fn directory_for_sub_provider(&self, id: IndexId, sub: &ProviderDescriptor) -> PathBuf {
        self.directory_for_index(id).join(sub.directory_name())
    }
}
