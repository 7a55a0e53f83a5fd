#![deny(missing_docs)]

//! Atomic promotion of staged content and installation of the application
//! payload.
//!
//! Everything that replaces live content goes through [`swap`]: content is
//! first fully materialized in a [`StagingTree`] and only then swapped into
//! place. Mutating operations require an [`OperationPermit`] from the
//! [`OperationGate`] so that at most one of them runs at a time.

pub mod gate;
pub mod payload;
pub mod paths;
pub mod staging;
pub mod store;
pub mod swap;

pub use gate::{GateBusy, OperationGate, OperationPermit};
pub use paths::AppPaths;
pub use payload::{
    InstallError, PayloadInstaller, PayloadLayout, PayloadManifest, PayloadOptions, PayloadStatus,
};
pub use staging::StagingTree;
pub use store::{JsonFileStore, MemoryStore, StoreError, VersionStore};
pub use swap::{swap_directory, swap_file, SwapError, SwapMethod};
