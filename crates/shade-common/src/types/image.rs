//! Mapped-image descriptors
//!
//! Everything the engine consumes from the PE parser collaborator. The
//! engine never parses images itself; the embedder extracts these and hands
//! them over.

use serde::{Deserialize, Serialize};

/// One image section, as mapped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionInfo {
    pub name: String,
    /// RVA of the section start
    pub virtual_address: u32,
    pub virtual_size: u32,
}

/// TLS directory of the mapped image
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TlsInfo {
    /// VA of the TLS directory itself inside the target
    pub directory: u64,
    /// Raw data range copied per thread
    pub raw_data_start: u64,
    pub raw_data_end: u64,
}

/// Exception/unwind directory of the mapped image
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// VA of the unwind directory inside the target
    pub directory: u64,
    pub size: u32,
}

/// A manually mapped module to be registered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub base: u64,
    pub size: u64,
    /// Absolute entry point address (base + entry RVA), 0 if none
    pub entry_point: u64,
    /// Base name, e.g. `test.dll`
    pub name: String,
    /// Fully qualified path written into the record
    pub full_path: String,
    pub tls: Option<TlsInfo>,
    pub exception: Option<ExceptionInfo>,
}

impl ModuleDescriptor {
    pub fn new(base: u64, size: u64, name: impl Into<String>) -> Self {
        let name = name.into();
        let full_path = format!("C:\\Windows\\System32\\{}", name);
        Self {
            base,
            size,
            entry_point: 0,
            name,
            full_path,
            tls: None,
            exception: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: u64) -> Self {
        self.entry_point = entry_point;
        self
    }

    pub fn with_tls(mut self, tls: TlsInfo) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }
}
