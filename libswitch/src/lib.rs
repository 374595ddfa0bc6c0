//! # libswitch: versioned overlay products for RK8s
//!
//! A *product* is a directory under the products root whose content is served
//! from one of several named *versions*. Versions live under the storage root
//! as `lower/` + `upper/` layer pairs and may derive from a parent version;
//! selecting a version overlay-mounts its layer chain onto the product
//! directory.
//!
//! The live kernel mount table is the only record of which version is
//! selected, so every operation re-derives that state from the mount table and
//! the on-disk parent pointers before it acts.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`paths`] | [`StorageLayout`]: where versions, layers and scratch dirs live. |
//! | [`mounts`] | [`MountTable`]: validated view of live selections. |
//! | [`chain`] | [`LayerChain`]: parent pointers, ancestry, dependents. |
//! | [`overlay`] | [`OverlayController`]: lower stacks, mount/unmount, tree sync. |
//! | [`switch`] | [`Switch`]: create, duplicate, derive, detach, delete, select, unselect, which, commit, undo, list. |
//! | [`lock`] | [`ProductLock`]: per-product `flock` held by mutating operations. |
//! | [`config`] | [`SwitchConfig`]: roots and privilege mode. |
//! | [`error`] | [`SwitchError`] enum covering all failure modes. |
//! | `fake` | `FakeKernel`: unprivileged stand-in for overlayfs and rsync (`fake` feature). |

pub mod chain;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod lock;
pub mod mounts;
pub mod overlay;
pub mod paths;
pub mod switch;

pub use chain::LayerChain;
pub use config::{Privilege, SwitchConfig};
pub use error::{Result, SwitchError};
pub use lock::ProductLock;
pub use mounts::{MountEntry, MountRecord, MountTable, MountTableSource, ProcMounts};
pub use overlay::{MountMode, OverlayController, OverlayRequest, TreeSyncPort, UnionMountPort};
pub use paths::{Role, StorageLayout};
pub use switch::{Switch, VersionInfo};
