//! OS version profiles
//!
//! A profile is selected once per session and never mutated afterwards. It
//! pins the pattern set, the bookkeeping record layout and the conventions
//! of the target-internal routines for one OS generation.

use crate::error::{Error, Result};
use crate::types::execution::CallingConvention;
use serde::{Deserialize, Serialize};

/// Supported OS generations, oldest to newest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OsVersion {
    Win7,
    Win8,
    Win8Point1,
    Win10,
    Win10Creators,
}

impl OsVersion {
    /// All known versions, newest first. Pattern fallback walks this order
    /// starting just below the active version.
    pub const NEWEST_FIRST: [OsVersion; 5] = [
        OsVersion::Win10Creators,
        OsVersion::Win10,
        OsVersion::Win8Point1,
        OsVersion::Win8,
        OsVersion::Win7,
    ];

    /// Versions at or below `self`, newest first. The active version's own
    /// pattern set is tried first, then each older one.
    pub fn fallback_chain(self) -> impl Iterator<Item = OsVersion> {
        Self::NEWEST_FIRST.into_iter().filter(move |v| *v <= self)
    }

    pub fn name(self) -> &'static str {
        match self {
            OsVersion::Win7 => "Windows 7",
            OsVersion::Win8 => "Windows 8",
            OsVersion::Win8Point1 => "Windows 8.1",
            OsVersion::Win10 => "Windows 10",
            OsVersion::Win10Creators => "Windows 10 Creators+",
        }
    }

    /// Map a raw kernel version triple to a supported generation. Versions
    /// without a pattern set are refused up front rather than degrading
    /// every symbol lookup later.
    pub fn detect(major: u32, minor: u32, build: u32) -> Result<Self> {
        match (major, minor) {
            (6, 1) => Ok(OsVersion::Win7),
            (6, 2) => Ok(OsVersion::Win8),
            (6, 3) => Ok(OsVersion::Win8Point1),
            (10, 0) if build >= 15063 => Ok(OsVersion::Win10Creators),
            (10, 0) => Ok(OsVersion::Win10),
            _ => Err(Error::UnsupportedProfile(format!(
                "NT {}.{} build {}",
                major, minor, build
            ))),
        }
    }
}

/// Bookkeeping record layout variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordLayout {
    /// Doubly-linked lists only (hash buckets + load/memory/init order)
    Legacy,
    /// Lists plus a balanced tree keyed by base address, with shared
    /// reference-counted group records
    Graph,
}

/// Pointer width of one side of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    pub fn word_size(self) -> u64 {
        match self {
            Bitness::X86 => 4,
            Bitness::X64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Bitness::X86 => 32,
            Bitness::X64 => 64,
        }
    }
}

/// Argument shape of the target's exception-table insert routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionInsertShape {
    /// `(image_base, image_size)`
    BaseAndSize(CallingConvention),
    /// `(table, image_base, image_size)` — oldest profiles pass the table
    /// explicitly
    TableBaseSize(CallingConvention),
}

/// Immutable per-session profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsProfile {
    pub version: OsVersion,
    pub layout: RecordLayout,
    /// Convention of the TLS-registration routine
    pub tls_convention: CallingConvention,
    /// Argument shape of the exception-table insert routine
    pub exception_insert: ExceptionInsertShape,
    /// Whether the name-hash routine folds case
    pub hash_case_insensitive: bool,
}

impl OsProfile {
    /// Profile for a detected OS version
    pub fn for_version(version: OsVersion) -> Self {
        match version {
            OsVersion::Win7 => Self {
                version,
                layout: RecordLayout::Legacy,
                tls_convention: CallingConvention::Stdcall,
                exception_insert: ExceptionInsertShape::TableBaseSize(CallingConvention::Stdcall),
                hash_case_insensitive: true,
            },
            OsVersion::Win8 => Self {
                version,
                layout: RecordLayout::Graph,
                tls_convention: CallingConvention::Stdcall,
                exception_insert: ExceptionInsertShape::BaseAndSize(CallingConvention::Stdcall),
                hash_case_insensitive: true,
            },
            OsVersion::Win8Point1 => Self {
                version,
                layout: RecordLayout::Graph,
                tls_convention: CallingConvention::Thiscall,
                exception_insert: ExceptionInsertShape::BaseAndSize(CallingConvention::Fastcall),
                hash_case_insensitive: true,
            },
            OsVersion::Win10 | OsVersion::Win10Creators => Self {
                version,
                layout: RecordLayout::Graph,
                tls_convention: CallingConvention::Thiscall,
                exception_insert: ExceptionInsertShape::BaseAndSize(CallingConvention::Fastcall),
                hash_case_insensitive: true,
            },
        }
    }
}
