//! Live mount table.
//!
//! Selections are not recorded anywhere by this crate: the kernel mount table
//! is the only source of truth for which version of a product is live. The
//! table is read through a [`MountTableSource`], overlay entries mounted on a
//! product directory are parsed back into [`MountRecord`]s through the
//! [`StorageLayout`], and every record is validated against the layout rules
//! before it is trusted.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SwitchError};
use crate::paths::StorageLayout;

const OVERLAY_FS_TYPE: &str = "overlay";

/// One raw line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
}

impl MountEntry {
    /// Parse a `/proc/self/mounts` line:
    /// `<device> <mountpoint> <fstype> <options> <dump> <pass>`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let mount_point = fields.next()?;
        let fs_type = fields.next()?;
        let options = fields.next()?;
        Some(Self {
            source: unescape(source),
            mount_point: PathBuf::from(unescape(mount_point)),
            fs_type: fs_type.to_owned(),
            options: unescape(options),
        })
    }

    /// Values of every `key=value` option named `key`, in order.
    fn option_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.options.split(',').filter_map(move |opt| {
            opt.split_once('=')
                .and_then(|(k, v)| (k == key).then_some(v))
        })
    }

    /// Lower layers, topmost first. Handles both the classic colon separated
    /// `lowerdir=` form and repeated `lowerdir+=` options.
    fn lower_dirs(&self) -> Vec<PathBuf> {
        self.option_values("lowerdir")
            .flat_map(|v| v.split(':'))
            .chain(self.option_values("lowerdir+"))
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    fn upper_dir(&self) -> Option<PathBuf> {
        self.option_values("upperdir").next().map(PathBuf::from)
    }
}

/// Decode the octal escapes the kernel uses for whitespace and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Source of raw mount table entries.
pub trait MountTableSource {
    fn entries(&self) -> Result<Vec<MountEntry>>;
}

/// Reads the kernel mount table from procfs.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl ProcMounts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MountTableSource for ProcMounts {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        let contents =
            std::fs::read_to_string(&self.path).map_err(SwitchError::io(&self.path))?;
        Ok(contents.lines().filter_map(MountEntry::parse_line).collect())
    }
}

/// A live selection: `product` is mounted with `upper_version` writable on top
/// of `lower_versions` (nearest first, the upper version itself included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub product: String,
    pub upper_version: String,
    pub lower_versions: Vec<String>,
}

/// Validated snapshot of the overlay mounts on product directories.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    records: Vec<MountRecord>,
}

impl MountTable {
    pub fn read(
        source: &dyn MountTableSource,
        layout: &StorageLayout,
        products_root: &Path,
    ) -> Result<Self> {
        let mut records = Vec::new();
        for entry in source.entries()? {
            if entry.fs_type != OVERLAY_FS_TYPE
                || entry.mount_point.parent() != Some(products_root)
            {
                continue;
            }
            // Read-only views have no upper layer and are never selections.
            let Some(upper_dir) = entry.upper_dir() else {
                continue;
            };
            let record = parse_record(&entry, &upper_dir, layout)?;
            debug!(
                product = %record.product,
                version = %record.upper_version,
                layers = record.lower_versions.len(),
                "found live selection"
            );
            records.push(record);
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[MountRecord] {
        &self.records
    }

    pub fn is_product_mounted(&self, product: &str) -> bool {
        self.records.iter().any(|r| r.product == product)
    }

    /// `true` if `version` contributes a layer to any live mount of `product`,
    /// either as the selected version or as one of its ancestors.
    pub fn is_version_mounted(&self, product: &str, version: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.product == product && r.lower_versions.iter().any(|v| v == version))
    }

    pub fn current_selection(&self, product: &str) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.product == product)
            .map(|r| r.upper_version.as_str())
    }
}

fn parse_record(
    entry: &MountEntry,
    upper_dir: &Path,
    layout: &StorageLayout,
) -> Result<MountRecord> {
    let mount_point = entry.mount_point.display().to_string();
    let product = entry
        .mount_point
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SwitchError::inconsistent(&mount_point, "mount point has no name"))?;

    let upper = layout.parse_layer_path(upper_dir)?;
    if upper.product != product {
        return Err(SwitchError::inconsistent(
            &mount_point,
            format!("upper layer belongs to product {}", upper.product),
        ));
    }

    let mut lower_dirs = entry.lower_dirs();
    // The last lower layer is the product's empty base.
    lower_dirs.pop();

    let mut lower_versions = Vec::with_capacity(lower_dirs.len());
    for dir in &lower_dirs {
        let lower = layout.parse_layer_path(dir)?;
        if lower.product != product {
            return Err(SwitchError::inconsistent(
                &mount_point,
                format!("lower layer belongs to product {}", lower.product),
            ));
        }
        lower_versions.push(lower.version);
    }

    match lower_versions.first() {
        Some(first) if *first == upper.version => {}
        Some(first) => {
            return Err(SwitchError::inconsistent(
                &mount_point,
                format!(
                    "first lower layer {first} does not match upper layer {}",
                    upper.version
                ),
            ));
        }
        None => {
            return Err(SwitchError::inconsistent(&mount_point, "no lower layers"));
        }
    }

    Ok(MountRecord {
        product: product.to_owned(),
        upper_version: upper.version,
        lower_versions,
    })
}
