//! Version lifecycle.
//!
//! [`Switch`] is the entry point for every operation on products and
//! versions. Each operation validates the product, takes the product lock when
//! it mutates anything, checks its preconditions against the layer chain and
//! the live mount table, and only then touches the storage tree or the mounts.
//!
//! Operations are not transactional. Transient mounts and work dirs are always
//! cleaned up, but a `duplicate`, `detach` or `commit` that fails halfway can
//! leave a partially written version behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::chain::LayerChain;
use crate::config::{Privilege, SwitchConfig, is_sub_path};
use crate::error::{Result, SwitchError};
use crate::lock::ProductLock;
use crate::mounts::{MountTable, MountTableSource, ProcMounts};
use crate::overlay::{
    MountMode, NativeMounter, OverlayController, RsyncTreeSync, SudoMounter, TransientMount,
    TreeSyncPort, UnionMountPort,
};
use crate::paths::{
    DST_MOUNT_DIR, DST_WORK_DIR, NEW_LOWER_DIR, Role, SRC_MOUNT_DIR, SRC_WORK_DIR, StorageLayout,
    validate_name,
};

/// One version as reported by [`Switch::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub name: String,
    pub parent: Option<String>,
    /// The version is the live selection of its product.
    pub selected: bool,
    /// The version contributes a layer to the live selection.
    pub mounted: bool,
}

pub struct Switch {
    config: SwitchConfig,
    layout: StorageLayout,
    mount_table: Arc<dyn MountTableSource + Send + Sync>,
    mounter: Arc<dyn UnionMountPort + Send + Sync>,
    syncer: Arc<dyn TreeSyncPort + Send + Sync>,
}

impl Switch {
    /// Wire the live ports: `/proc` for the mount table, `sudo` or mount(2)
    /// depending on [`SwitchConfig::privilege`], rsync for tree copies.
    pub fn new(config: SwitchConfig) -> Self {
        let mounter: Arc<dyn UnionMountPort + Send + Sync> = match config.privilege {
            Privilege::Sudo => Arc::new(SudoMounter),
            Privilege::Native => Arc::new(NativeMounter),
        };
        let mount_table = Arc::new(ProcMounts::new(&config.mount_table));
        let syncer = Arc::new(RsyncTreeSync::new(config.sync_progress));
        Self::with_ports(config, mount_table, mounter, syncer)
    }

    pub fn with_ports(
        config: SwitchConfig,
        mount_table: Arc<dyn MountTableSource + Send + Sync>,
        mounter: Arc<dyn UnionMountPort + Send + Sync>,
        syncer: Arc<dyn TreeSyncPort + Send + Sync>,
    ) -> Self {
        Self {
            layout: StorageLayout::new(&config.storage_root),
            config,
            mount_table,
            mounter,
            syncer,
        }
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn chain(&self) -> LayerChain<'_> {
        LayerChain::new(&self.layout)
    }

    /// Snapshot of the live selections.
    pub fn mount_table(&self) -> Result<MountTable> {
        MountTable::read(
            self.mount_table.as_ref(),
            &self.layout,
            &self.config.products_root,
        )
    }

    fn overlay(&self) -> OverlayController<'_> {
        OverlayController::new(&self.layout, self.mounter.as_ref(), self.syncer.as_ref())
    }

    fn live_mount_point(&self, product: &str) -> PathBuf {
        self.config.products_root.join(product)
    }

    // ---------------------------------------------------------------------
    // Preconditions
    // ---------------------------------------------------------------------

    /// The product must have a live directory under the products root. Its
    /// storage directory is created on first use.
    fn check_product(&self, product: &str) -> Result<()> {
        validate_name("product", product)?;
        let product_path = self.live_mount_point(product);
        if is_sub_path(&product_path, &self.config.storage_root) {
            return Err(SwitchError::Configuration(format!(
                "product {product} collides with storage"
            )));
        }
        if !product_path.is_dir() {
            return Err(SwitchError::not_found("product", product));
        }
        let storage = self.layout.product_dir(product);
        fs::create_dir_all(&storage).map_err(SwitchError::io(&storage))
    }

    fn lock(&self, product: &str) -> Result<ProductLock> {
        ProductLock::acquire(&self.layout.lock_file(product))
    }

    fn require_version(&self, product: &str, version: &str, kind: &'static str) -> Result<()> {
        validate_name(kind, version)?;
        if !self.chain().version_exists(product, version) {
            return Err(SwitchError::not_found(kind, version));
        }
        Ok(())
    }

    fn require_unmounted(&self, product: &str, version: &str) -> Result<()> {
        if self.mount_table()?.is_version_mounted(product, version) {
            return Err(SwitchError::InUse(version.to_owned()));
        }
        Ok(())
    }

    fn require_no_dependents(&self, product: &str, version: &str) -> Result<()> {
        if self.chain().has_dependents(product, version)? {
            return Err(SwitchError::Dependency(version.to_owned()));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Create an empty root version.
    #[instrument(skip(self))]
    pub fn create(&self, product: &str, version: &str) -> Result<()> {
        self.check_product(product)?;
        validate_name("version", version)?;
        let _lock = self.lock(product)?;
        self.create_version(product, version)?;
        info!(product, version, "version created");
        Ok(())
    }

    fn create_version(&self, product: &str, version: &str) -> Result<()> {
        if self.chain().version_exists(product, version) {
            return Err(SwitchError::AlreadyExists(version.to_owned()));
        }
        let version_dir = self.layout.version_dir(product, version);
        fs::create_dir(&version_dir).map_err(SwitchError::io(&version_dir))?;
        for role in [Role::Lower, Role::Upper] {
            let dir = self.layout.layer_dir(product, version, role);
            fs::create_dir(&dir).map_err(SwitchError::io(&dir))?;
        }
        Ok(())
    }

    /// Create `version` holding the flattened content of `parent`, sharing
    /// `parent`'s own parent.
    #[instrument(skip(self))]
    pub fn duplicate(&self, product: &str, version: &str, parent: &str) -> Result<()> {
        self.check_product(product)?;
        validate_name("version", version)?;
        let _lock = self.lock(product)?;
        self.require_version(product, parent, "parent")?;

        let chain = self.chain();
        self.create_version(product, version)?;
        // The write-lower mount below stacks on top of the grandparent chain.
        chain.write_parent(product, version, chain.read_parent(product, parent)?.as_deref())?;

        let mounts = [
            self.transient(
                product,
                version,
                SRC_MOUNT_DIR,
                SRC_WORK_DIR,
                parent,
                MountMode::LowerOnly,
            ),
            self.transient(
                product,
                version,
                DST_MOUNT_DIR,
                DST_WORK_DIR,
                version,
                MountMode::WriteLower,
            ),
        ];
        let overlay = self.overlay();
        overlay.with_transient_mounts(product, &mounts, |points| {
            overlay.sync_tree(&points[0], &points[1])
        })?;

        info!(product, version, parent, "version duplicated");
        Ok(())
    }

    /// Create an empty `version` layered on top of `parent`.
    #[instrument(skip(self))]
    pub fn derive(&self, product: &str, version: &str, parent: &str) -> Result<()> {
        self.check_product(product)?;
        validate_name("version", version)?;
        let _lock = self.lock(product)?;
        self.require_version(product, parent, "parent")?;

        self.create_version(product, version)?;
        self.chain().write_parent(product, version, Some(parent))?;
        info!(product, version, parent, "version derived");
        Ok(())
    }

    /// Flatten everything `version` inherits into its own `lower/` and make it
    /// a root version.
    #[instrument(skip(self))]
    pub fn detach(&self, product: &str, version: &str) -> Result<()> {
        self.check_product(product)?;
        let _lock = self.lock(product)?;
        self.require_version(product, version, "version")?;
        self.require_unmounted(product, version)?;
        let chain = self.chain();
        if chain.read_parent(product, version)?.is_none() {
            return Err(SwitchError::NoParent(version.to_owned()));
        }

        let new_lower = self.layout.scratch_dir(product, version, NEW_LOWER_DIR);
        if new_lower.is_dir() {
            fs::remove_dir_all(&new_lower).map_err(SwitchError::io(&new_lower))?;
        }
        fs::create_dir(&new_lower).map_err(SwitchError::io(&new_lower))?;

        let mounts = [self.transient(
            product,
            version,
            SRC_MOUNT_DIR,
            SRC_WORK_DIR,
            version,
            MountMode::LowerOnly,
        )];
        let overlay = self.overlay();
        let synced = overlay.with_transient_mounts(product, &mounts, |points| {
            overlay.sync_tree(&points[0], &new_lower)
        });
        if let Err(e) = synced {
            if let Err(cleanup) = fs::remove_dir_all(&new_lower) {
                warn!(path = %new_lower.display(), "failed to remove {NEW_LOWER_DIR}: {cleanup}");
            }
            return Err(e);
        }

        let lower = self.layout.layer_dir(product, version, Role::Lower);
        fs::remove_dir_all(&lower).map_err(SwitchError::io(&lower))?;
        fs::rename(&new_lower, &lower).map_err(SwitchError::io(&lower))?;
        chain.write_parent(product, version, None)?;

        info!(product, version, "version detached");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete(&self, product: &str, version: &str) -> Result<()> {
        self.check_product(product)?;
        let _lock = self.lock(product)?;
        self.require_version(product, version, "version")?;
        self.require_unmounted(product, version)?;
        self.require_no_dependents(product, version)?;

        let version_dir = self.layout.version_dir(product, version);
        fs::remove_dir_all(&version_dir).map_err(SwitchError::io(&version_dir))?;
        info!(product, version, "version deleted");
        Ok(())
    }

    /// Mount `version` read-write onto the product's live directory, replacing
    /// any current selection.
    #[instrument(skip(self))]
    pub fn select(&self, product: &str, version: &str) -> Result<()> {
        self.check_product(product)?;
        let _lock = self.lock(product)?;
        self.require_version(product, version, "version")?;

        if self.mount_table()?.is_product_mounted(product) {
            self.unmount_live(product)?;
        }
        self.overlay().mount(
            &self.live_mount_point(product),
            &self.layout.live_work_dir(product),
            product,
            version,
            MountMode::ReadWrite,
        )?;
        info!(product, version, "version selected");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn unselect(&self, product: &str) -> Result<()> {
        self.check_product(product)?;
        let _lock = self.lock(product)?;
        if !self.mount_table()?.is_product_mounted(product) {
            return Err(SwitchError::NotSelected(product.to_owned()));
        }
        self.unmount_live(product)?;
        info!(product, "product unselected");
        Ok(())
    }

    fn unmount_live(&self, product: &str) -> Result<()> {
        self.overlay().unmount(
            &self.live_mount_point(product),
            &self.layout.live_work_dir(product),
        )
    }

    /// The currently selected version of `product`, if any.
    pub fn which(&self, product: &str) -> Result<Option<String>> {
        self.check_product(product)?;
        Ok(self
            .mount_table()?
            .current_selection(product)
            .map(str::to_owned))
    }

    /// Every version of `product` with its parent and mount state.
    pub fn list(&self, product: &str) -> Result<Vec<VersionInfo>> {
        self.check_product(product)?;
        let table = self.mount_table()?;
        let chain = self.chain();
        let selection = table.current_selection(product);

        chain
            .versions(product)?
            .into_iter()
            .map(|name| {
                Ok(VersionInfo {
                    parent: chain.read_parent(product, &name)?,
                    selected: selection == Some(name.as_str()),
                    mounted: table.is_version_mounted(product, &name),
                    name,
                })
            })
            .collect()
    }

    /// Fold the writes accumulated in `upper/` into `lower/`.
    #[instrument(skip(self))]
    pub fn commit(&self, product: &str, version: &str) -> Result<()> {
        self.check_product(product)?;
        let _lock = self.lock(product)?;
        self.require_version(product, version, "version")?;
        self.require_unmounted(product, version)?;
        self.require_no_dependents(product, version)?;

        // The source mount carries `upper/` so that the accumulated writes are
        // part of what gets copied.
        let mounts = [
            self.transient(
                product,
                version,
                SRC_MOUNT_DIR,
                SRC_WORK_DIR,
                version,
                MountMode::ReadWrite,
            ),
            self.transient(
                product,
                version,
                DST_MOUNT_DIR,
                DST_WORK_DIR,
                version,
                MountMode::WriteLower,
            ),
        ];
        let overlay = self.overlay();
        overlay.with_transient_mounts(product, &mounts, |points| {
            overlay.sync_tree(&points[0], &points[1])
        })?;

        recreate_empty(&self.layout.layer_dir(product, version, Role::Upper))?;
        info!(product, version, "version committed");
        Ok(())
    }

    /// Discard the writes accumulated in `upper/`.
    #[instrument(skip(self))]
    pub fn undo(&self, product: &str, version: &str) -> Result<()> {
        self.check_product(product)?;
        let _lock = self.lock(product)?;
        self.require_version(product, version, "version")?;
        self.require_unmounted(product, version)?;

        recreate_empty(&self.layout.layer_dir(product, version, Role::Upper))?;
        info!(product, version, "version changes discarded");
        Ok(())
    }

    fn transient(
        &self,
        product: &str,
        owner: &str,
        mount_dir: &str,
        work_dir: &str,
        version: &str,
        mode: MountMode,
    ) -> TransientMount {
        TransientMount {
            mount_point: self.layout.scratch_dir(product, owner, mount_dir),
            work_dir: self.layout.scratch_dir(product, owner, work_dir),
            version: version.to_owned(),
            mode,
        }
    }
}

fn recreate_empty(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(SwitchError::io(path))?;
    }
    fs::create_dir(path).map_err(SwitchError::io(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeKernel;

    fn setup() -> (tempfile::TempDir, Arc<FakeKernel>, Switch) {
        let tmp = tempfile::tempdir().unwrap();
        let products = tmp.path().join("products");
        let storage = tmp.path().join("storage");
        fs::create_dir_all(products.join("app")).unwrap();
        fs::create_dir_all(&storage).unwrap();

        let config =
            SwitchConfig::new(products.to_str().unwrap(), storage.to_str().unwrap()).unwrap();
        let kernel = Arc::new(FakeKernel::new());
        let switch = Switch::with_ports(config, kernel.clone(), kernel.clone(), kernel.clone());
        (tmp, kernel, switch)
    }

    #[test]
    fn create_makes_empty_layers() {
        let (_tmp, _kernel, switch) = setup();
        switch.create("app", "v1").unwrap();

        let layout = switch.layout();
        assert!(layout.layer_dir("app", "v1", Role::Lower).is_dir());
        assert!(layout.layer_dir("app", "v1", Role::Upper).is_dir());
        assert!(!layout.parent_file("app", "v1").exists());
        assert_eq!(switch.chain().ancestry("app", "v1").unwrap(), vec!["v1"]);

        let err = switch.create("app", "v1").unwrap_err();
        assert!(matches!(err, SwitchError::AlreadyExists(_)));
    }

    #[test]
    fn unknown_product_is_rejected() {
        let (_tmp, _kernel, switch) = setup();
        let err = switch.create("nope", "v1").unwrap_err();
        assert!(matches!(err, SwitchError::NotFound { kind: "product", .. }));
        assert!(!switch.layout().product_dir("nope").exists());

        let err = switch.create("..", "v1").unwrap_err();
        assert!(matches!(err, SwitchError::InvalidName { .. }));
    }

    #[test]
    fn reserved_version_names_are_rejected() {
        let (_tmp, _kernel, switch) = setup();
        for name in [".empty", ".work", "a/b", ""] {
            let err = switch.create("app", name).unwrap_err();
            assert!(matches!(err, SwitchError::InvalidName { .. }), "{name:?}");
        }
    }

    #[test]
    fn derive_requires_parent() {
        let (_tmp, _kernel, switch) = setup();
        let err = switch.derive("app", "child", "base").unwrap_err();
        assert!(matches!(err, SwitchError::NotFound { kind: "parent", .. }));
        assert!(!switch.chain().version_exists("app", "child"));
    }

    #[test]
    fn undo_and_commit_refuse_mounted_versions() {
        let (_tmp, _kernel, switch) = setup();
        switch.create("app", "v1").unwrap();
        switch.select("app", "v1").unwrap();

        assert!(matches!(switch.undo("app", "v1"), Err(SwitchError::InUse(_))));
        assert!(matches!(switch.commit("app", "v1"), Err(SwitchError::InUse(_))));
        assert!(matches!(switch.delete("app", "v1"), Err(SwitchError::InUse(_))));
    }

    #[test]
    fn unselect_without_selection() {
        let (_tmp, _kernel, switch) = setup();
        let err = switch.unselect("app").unwrap_err();
        assert!(matches!(err, SwitchError::NotSelected(_)));
        assert_eq!(switch.which("app").unwrap(), None);
    }

    #[test]
    fn list_reports_chain_and_selection() {
        let (_tmp, _kernel, switch) = setup();
        switch.create("app", "base").unwrap();
        switch.derive("app", "child", "base").unwrap();
        switch.create("app", "other").unwrap();
        switch.select("app", "child").unwrap();

        let list = switch.list("app").unwrap();
        assert_eq!(
            list,
            vec![
                VersionInfo {
                    name: "base".into(),
                    parent: None,
                    selected: false,
                    mounted: true,
                },
                VersionInfo {
                    name: "child".into(),
                    parent: Some("base".into()),
                    selected: true,
                    mounted: true,
                },
                VersionInfo {
                    name: "other".into(),
                    parent: None,
                    selected: false,
                    mounted: false,
                },
            ]
        );
    }
}
