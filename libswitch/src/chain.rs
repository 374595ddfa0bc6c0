//! Parent pointers and layer chains.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;

use tracing::debug;

use crate::error::{Result, SwitchError};
use crate::paths::StorageLayout;

/// Resolves version ancestry from the `parent` files under the storage root.
#[derive(Debug, Clone)]
pub struct LayerChain<'a> {
    layout: &'a StorageLayout,
}

impl<'a> LayerChain<'a> {
    pub fn new(layout: &'a StorageLayout) -> Self {
        Self { layout }
    }

    pub fn version_exists(&self, product: &str, version: &str) -> bool {
        self.layout.version_dir(product, version).is_dir()
    }

    /// The recorded parent of `version`, `None` for a root version. An empty
    /// parent file counts as no parent.
    pub fn read_parent(&self, product: &str, version: &str) -> Result<Option<String>> {
        let path = self.layout.parent_file(product, version);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let parent = contents.trim_end_matches('\n');
                Ok((!parent.is_empty()).then(|| parent.to_owned()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SwitchError::io(path)(e)),
        }
    }

    /// Record `parent` for `version`, or remove the record when `None`.
    pub fn write_parent(&self, product: &str, version: &str, parent: Option<&str>) -> Result<()> {
        let path = self.layout.parent_file(product, version);
        match parent {
            Some(parent) => fs::write(&path, parent).map_err(SwitchError::io(&path)),
            None => match fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(SwitchError::io(path)(e)),
                _ => Ok(()),
            },
        }
    }

    /// `[version, parent, grandparent, ...]` up to the root version.
    pub fn ancestry(&self, product: &str, version: &str) -> Result<Vec<String>> {
        let mut chain = vec![version.to_owned()];
        let mut seen = HashSet::from([version.to_owned()]);
        let mut current = version.to_owned();

        while let Some(parent) = self.read_parent(product, &current)? {
            if !seen.insert(parent.clone()) {
                return Err(SwitchError::CycleDetected {
                    product: product.to_owned(),
                    version: version.to_owned(),
                });
            }
            chain.push(parent.clone());
            current = parent;
        }

        debug!(product, version, ?chain, "resolved ancestry");
        Ok(chain)
    }

    /// Names of all versions of `product`, sorted.
    pub fn versions(&self, product: &str) -> Result<Vec<String>> {
        let product_dir = self.layout.product_dir(product);
        let entries = match fs::read_dir(&product_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SwitchError::io(product_dir)(e)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(SwitchError::io(&product_dir))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            versions.push(name);
        }
        versions.sort();
        Ok(versions)
    }

    /// `true` if any other version of `product` records `version` as its parent.
    pub fn has_dependents(&self, product: &str, version: &str) -> Result<bool> {
        for name in self.versions(product)? {
            if name != version && self.read_parent(product, &name)?.as_deref() == Some(version) {
                debug!(product, version, dependent = %name, "version has a dependent");
                return Ok(true);
            }
        }
        Ok(false)
    }
}
