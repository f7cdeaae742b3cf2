//! Shade core engine
//!
//! Remote-execution and loader-bookkeeping forging against a target process
//! holding a manually mapped module. The engine scans for the target's
//! internal loader structures, runs generated call sequences inside the
//! target, and links/unlinks bookkeeping records so the mapped module looks
//! legitimately loaded.
//!
//! All process access goes through the [`traits::MemoryIo`] seam; all
//! version-dependent target routines go through [`traits::TargetRoutines`].

pub mod editor;
pub mod executor;
pub mod lists;
pub mod locator;
pub mod offsets;
pub mod patterns;
pub mod routines;
pub mod stub;
pub mod traits;
pub mod unlink;

#[cfg(windows)]
pub mod backend;

pub use editor::{LoaderGraphEditor, ModuleHandle};
pub use executor::RemoteExecutor;
pub use locator::{Anchors, ListHeads, LoaderImage, LoaderSection, StructureLocator};
pub use patterns::{ParsedPattern, Symbol};
pub use routines::RemoteRoutines;
pub use shade_common::{Error, Result};
pub use stub::{ArgPlan, RemoteStubBuilder, StubImage};
pub use traits::{MemoryIo, TargetRoutines};
pub use unlink::UnlinkEngine;
