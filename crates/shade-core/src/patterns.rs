//! Pattern catalog
//!
//! Per-OS-version byte patterns and resolution rules for every internal
//! loader symbol the engine needs. None of these symbols are exported by
//! the target's loader image; each is found by scanning a code or data
//! section for a short instruction signature and resolving the final
//! address from the match site.
//!
//! Patterns are hex strings with `??` wildcards, e.g.
//! `"48 8D 0D ?? ?? ?? ?? E8"`.

use shade_common::{Bitness, Error, OsVersion, Result};

/// Internal loader symbols resolvable through scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Name-hash bucket array
    HashTable,
    /// Root cell of the base-address tree (graph profiles)
    ModuleIndex,
    /// TLS registration routine
    HandleTlsData,
    /// Exception-table insert routine
    InsertInvertedFunctionTable,
    /// The inverted function table itself
    InvertedFunctionTable,
    /// Name-hash routine matching the target's own lookups
    HashUnicodeString,
    /// Balanced-tree insert routine (graph profiles)
    RbInsertNode,
    /// Balanced-tree delete routine (graph profiles)
    RbRemoveNode,
    /// Cell holding the loader heap handle
    LoaderHeap,
    /// Heap allocation routine used with the loader heap handle
    AllocateHeap,
    /// Pointer-obfuscation routine for stored directory pointers
    EncodeSystemPointer,
}

impl Symbol {
    pub fn name(self) -> &'static str {
        match self {
            Symbol::HashTable => "HashTable",
            Symbol::ModuleIndex => "ModuleIndex",
            Symbol::HandleTlsData => "HandleTlsData",
            Symbol::InsertInvertedFunctionTable => "InsertInvertedFunctionTable",
            Symbol::InvertedFunctionTable => "InvertedFunctionTable",
            Symbol::HashUnicodeString => "HashUnicodeString",
            Symbol::RbInsertNode => "RbInsertNode",
            Symbol::RbRemoveNode => "RbRemoveNode",
            Symbol::LoaderHeap => "LoaderHeap",
            Symbol::AllocateHeap => "AllocateHeap",
            Symbol::EncodeSystemPointer => "EncodeSystemPointer",
        }
    }
}

/// Which section of the loader image to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    Data,
}

/// How a match site becomes a final address
#[derive(Debug, Clone, Copy)]
pub enum Resolve {
    /// `match + delta` (negative delta walks back to a function start)
    AtOffset(i64),
    /// A displacement embedded in the matched instruction bytes, read at
    /// `match + site + operand`. Instruction-pointer-relative form yields
    /// `match + site + insn_len + displacement`; the absolute form (32-bit
    /// images) uses the displacement verbatim.
    Displacement {
        site: i64,
        operand: i64,
        insn_len: i64,
        ip_relative: bool,
    },
}

/// One catalog entry
#[derive(Debug, Clone, Copy)]
pub struct SymbolPattern {
    pub symbol: Symbol,
    pub bitness: Bitness,
    pub section: SectionKind,
    pub pattern: &'static str,
    pub resolve: Resolve,
}

const fn code64(symbol: Symbol, pattern: &'static str, resolve: Resolve) -> SymbolPattern {
    SymbolPattern {
        symbol,
        bitness: Bitness::X64,
        section: SectionKind::Code,
        pattern,
        resolve,
    }
}

const fn code32(symbol: Symbol, pattern: &'static str, resolve: Resolve) -> SymbolPattern {
    SymbolPattern {
        symbol,
        bitness: Bitness::X86,
        section: SectionKind::Code,
        pattern,
        resolve,
    }
}

const REL32: Resolve = Resolve::Displacement {
    site: 0,
    operand: 3,
    insn_len: 7,
    ip_relative: true,
};

const ABS32: Resolve = Resolve::Displacement {
    site: 0,
    operand: 1,
    insn_len: 5,
    ip_relative: false,
};

// call rel32 site; the routine address is ip-relative on either bitness
const CALL_REL32: Resolve = Resolve::Displacement {
    site: 0,
    operand: 1,
    insn_len: 5,
    ip_relative: true,
};

const WIN10_CREATORS: &[SymbolPattern] = &[
    code64(Symbol::HandleTlsData, "74 33 44 8D 43 09", Resolve::AtOffset(-0x43)),
    code64(
        Symbol::InsertInvertedFunctionTable,
        "8B FA 49 8D 43 20",
        Resolve::AtOffset(-0x10),
    ),
    code64(
        Symbol::InvertedFunctionTable,
        "49 8B E8 48 8B FA 0F 84",
        Resolve::Displacement {
            site: -0xF,
            operand: 2,
            insn_len: 6,
            ip_relative: true,
        },
    ),
    code64(Symbol::HashTable, "48 8D 3D ?? ?? ?? ?? 8B D6 49 8B CE", REL32),
    code64(Symbol::ModuleIndex, "48 8D 0D ?? ?? ?? ?? 48 8B FA E8", REL32),
    code64(Symbol::LoaderHeap, "48 8B 05 ?? ?? ?? ?? 41 B8 08 00 00 00", REL32),
    code64(
        Symbol::AllocateHeap,
        "E8 ?? ?? ?? ?? 48 8B F8 48 85 C0 0F 84",
        CALL_REL32,
    ),
    code64(
        Symbol::HashUnicodeString,
        "40 53 48 83 EC 20 0F B7 42 02",
        Resolve::AtOffset(0),
    ),
    code64(Symbol::RbInsertNode, "4C 8B C9 4D 85 C0 74 2B", Resolve::AtOffset(0)),
    code64(Symbol::RbRemoveNode, "48 8B 51 08 48 85 D2 75 0E", Resolve::AtOffset(0)),
    code64(
        Symbol::EncodeSystemPointer,
        "65 48 8B 04 25 60 00 00 00 48 8B 88",
        Resolve::AtOffset(-0x12),
    ),
    code32(
        Symbol::InsertInvertedFunctionTable,
        "8D 45 F0 89 55 F8 50 8D 55 F4",
        Resolve::AtOffset(-0xB),
    ),
    code32(
        Symbol::InvertedFunctionTable,
        "8D 45 F0 89 55 F8 50 8D 55 F4",
        Resolve::Displacement {
            site: 0x4C,
            operand: 0,
            insn_len: 0,
            ip_relative: false,
        },
    ),
    code32(Symbol::HandleTlsData, "8B C1 8D 4D BC 51", Resolve::AtOffset(-0x18)),
    code32(Symbol::HashTable, "8D 34 85 ?? ?? ?? ?? E8", Resolve::Displacement {
        site: 0,
        operand: 3,
        insn_len: 7,
        ip_relative: false,
    }),
    code32(Symbol::ModuleIndex, "B9 ?? ?? ?? ?? E8 ?? ?? ?? ?? 84 C0", ABS32),
    code32(Symbol::LoaderHeap, "A1 ?? ?? ?? ?? 6A 08", ABS32),
    code32(Symbol::AllocateHeap, "E8 ?? ?? ?? ?? 8B F0 85 F6 74", CALL_REL32),
    code32(
        Symbol::HashUnicodeString,
        "8B FF 55 8B EC 0F B7 45 0A",
        Resolve::AtOffset(0),
    ),
    code32(Symbol::RbInsertNode, "8B FF 55 8B EC 53 8B 5D 10", Resolve::AtOffset(0)),
    code32(Symbol::RbRemoveNode, "8B FF 55 8B EC 51 8B 41 04", Resolve::AtOffset(0)),
    code32(
        Symbol::EncodeSystemPointer,
        "8B 0D ?? ?? ?? ?? 8B 45 08 D3 C8",
        Resolve::AtOffset(0),
    ),
];

const WIN10: &[SymbolPattern] = &[
    code64(Symbol::HandleTlsData, "74 33 44 8D 43 09", Resolve::AtOffset(-0x43)),
    code64(
        Symbol::InsertInvertedFunctionTable,
        "8B FA 49 8D 43 20",
        Resolve::AtOffset(-0x10),
    ),
    code64(
        Symbol::InvertedFunctionTable,
        "49 8B E8 48 8B FA 0F 84",
        Resolve::Displacement {
            site: -0xF,
            operand: 2,
            insn_len: 6,
            ip_relative: true,
        },
    ),
    code64(Symbol::HashTable, "48 8D 3D ?? ?? ?? ?? 8B D6 49 8B CE", REL32),
    code64(Symbol::ModuleIndex, "48 8D 0D ?? ?? ?? ?? 48 8B FA E8", REL32),
    code64(Symbol::LoaderHeap, "48 8B 05 ?? ?? ?? ?? 41 B8 08 00 00 00", REL32),
    code64(
        Symbol::AllocateHeap,
        "E8 ?? ?? ?? ?? 48 8B F8 48 85 C0 0F 84",
        CALL_REL32,
    ),
    code64(
        Symbol::HashUnicodeString,
        "40 53 48 83 EC 20 0F B7 42 02",
        Resolve::AtOffset(0),
    ),
    code64(Symbol::RbInsertNode, "4C 8B C9 4D 85 C0 74 2B", Resolve::AtOffset(0)),
    code64(Symbol::RbRemoveNode, "48 8B 51 08 48 85 D2 75 0E", Resolve::AtOffset(0)),
    code64(
        Symbol::EncodeSystemPointer,
        "65 48 8B 04 25 60 00 00 00 48 8B 88",
        Resolve::AtOffset(-0x12),
    ),
    code32(
        Symbol::InsertInvertedFunctionTable,
        "53 56 57 8B DA 8B F9 50",
        Resolve::AtOffset(-0xB),
    ),
    code32(
        Symbol::InvertedFunctionTable,
        "53 56 57 8B DA 8B F9 50",
        Resolve::Displacement {
            site: 0x22,
            operand: 0,
            insn_len: 0,
            ip_relative: false,
        },
    ),
    code32(Symbol::HandleTlsData, "50 6A 09 6A 01 8B C1", Resolve::AtOffset(-0x1B)),
    code32(Symbol::HashTable, "8D 34 85 ?? ?? ?? ?? E8", Resolve::Displacement {
        site: 0,
        operand: 3,
        insn_len: 7,
        ip_relative: false,
    }),
    code32(Symbol::ModuleIndex, "B9 ?? ?? ?? ?? E8 ?? ?? ?? ?? 84 C0", ABS32),
    code32(Symbol::LoaderHeap, "A1 ?? ?? ?? ?? 6A 08", ABS32),
    code32(Symbol::AllocateHeap, "E8 ?? ?? ?? ?? 8B F0 85 F6 74", CALL_REL32),
    code32(
        Symbol::HashUnicodeString,
        "8B FF 55 8B EC 0F B7 45 0A",
        Resolve::AtOffset(0),
    ),
    code32(Symbol::RbInsertNode, "8B FF 55 8B EC 53 8B 5D 10", Resolve::AtOffset(0)),
    code32(Symbol::RbRemoveNode, "8B FF 55 8B EC 51 8B 41 04", Resolve::AtOffset(0)),
    code32(
        Symbol::EncodeSystemPointer,
        "8B 0D ?? ?? ?? ?? 8B 45 08 D3 C8",
        Resolve::AtOffset(0),
    ),
];

const WIN8_POINT1: &[SymbolPattern] = &[
    code64(
        Symbol::HandleTlsData,
        "44 8D 43 09 4C 8D 4C 24 38",
        Resolve::AtOffset(-0x43),
    ),
    code64(
        Symbol::InsertInvertedFunctionTable,
        "8B C3 2B D3 48 8D 48 01",
        Resolve::AtOffset(-0x84),
    ),
    code64(
        Symbol::InvertedFunctionTable,
        "8B C3 2B D3 48 8D 48 01",
        Resolve::Displacement {
            site: -0x27,
            operand: 3,
            insn_len: 7,
            ip_relative: true,
        },
    ),
    code64(Symbol::HashTable, "48 8D 3D ?? ?? ?? ?? 8B D6 49 8B CE", REL32),
    code64(Symbol::ModuleIndex, "48 8D 0D ?? ?? ?? ?? 48 8B FA E8", REL32),
    code64(Symbol::LoaderHeap, "48 8B 05 ?? ?? ?? ?? 41 B8 08 00 00 00", REL32),
    code64(
        Symbol::AllocateHeap,
        "E8 ?? ?? ?? ?? 48 8B F8 48 85 C0 0F 84",
        CALL_REL32,
    ),
    code64(
        Symbol::HashUnicodeString,
        "40 53 48 83 EC 20 0F B7 42 02",
        Resolve::AtOffset(0),
    ),
    code64(Symbol::RbInsertNode, "4C 8B C9 4D 85 C0 74 2B", Resolve::AtOffset(0)),
    code64(Symbol::RbRemoveNode, "48 8B 51 08 48 85 D2 75 0E", Resolve::AtOffset(0)),
    code64(
        Symbol::EncodeSystemPointer,
        "65 48 8B 04 25 60 00 00 00 48 8B 88",
        Resolve::AtOffset(-0x12),
    ),
    code32(
        Symbol::InsertInvertedFunctionTable,
        "53 56 57 8B DA 8B F9 50",
        Resolve::AtOffset(-0xB),
    ),
    code32(
        Symbol::InvertedFunctionTable,
        "53 56 57 8B DA 8B F9 50",
        Resolve::Displacement {
            site: 0x23,
            operand: 0,
            insn_len: 0,
            ip_relative: false,
        },
    ),
    code32(Symbol::HandleTlsData, "50 6A 09 6A 01 8B C1", Resolve::AtOffset(-0x1B)),
    code32(Symbol::HashTable, "8D 34 85 ?? ?? ?? ?? E8", Resolve::Displacement {
        site: 0,
        operand: 3,
        insn_len: 7,
        ip_relative: false,
    }),
    code32(Symbol::ModuleIndex, "B9 ?? ?? ?? ?? E8 ?? ?? ?? ?? 84 C0", ABS32),
    code32(Symbol::LoaderHeap, "A1 ?? ?? ?? ?? 6A 08", ABS32),
    code32(Symbol::AllocateHeap, "E8 ?? ?? ?? ?? 8B F0 85 F6 74", CALL_REL32),
    code32(
        Symbol::HashUnicodeString,
        "8B FF 55 8B EC 0F B7 45 0A",
        Resolve::AtOffset(0),
    ),
    code32(Symbol::RbInsertNode, "8B FF 55 8B EC 53 8B 5D 10", Resolve::AtOffset(0)),
    code32(Symbol::RbRemoveNode, "8B FF 55 8B EC 51 8B 41 04", Resolve::AtOffset(0)),
    code32(
        Symbol::EncodeSystemPointer,
        "8B 0D ?? ?? ?? ?? 8B 45 08 D3 C8",
        Resolve::AtOffset(0),
    ),
];

const WIN8: &[SymbolPattern] = &[
    code64(
        Symbol::HandleTlsData,
        "48 8B 79 30 45 8D 66 01",
        Resolve::AtOffset(-0x49),
    ),
    code64(Symbol::HashTable, "48 8D 3D ?? ?? ?? ?? 8B D6 49 8B CE", REL32),
    code64(Symbol::ModuleIndex, "48 8D 0D ?? ?? ?? ?? 48 8B FA E8", REL32),
    code64(Symbol::LoaderHeap, "48 8B 05 ?? ?? ?? ?? 41 B8 08 00 00 00", REL32),
    code64(
        Symbol::AllocateHeap,
        "E8 ?? ?? ?? ?? 48 8B F8 48 85 C0 0F 84",
        CALL_REL32,
    ),
    code64(
        Symbol::HashUnicodeString,
        "40 53 48 83 EC 20 0F B7 42 02",
        Resolve::AtOffset(0),
    ),
    code64(Symbol::RbInsertNode, "4C 8B C9 4D 85 C0 74 2B", Resolve::AtOffset(0)),
    code64(Symbol::RbRemoveNode, "48 8B 51 08 48 85 D2 75 0E", Resolve::AtOffset(0)),
    code32(
        Symbol::InsertInvertedFunctionTable,
        "8B FF 55 8B EC 51 51 53 57 8B 7D 08 8D",
        Resolve::AtOffset(0),
    ),
    code32(
        Symbol::InvertedFunctionTable,
        "8B FF 55 8B EC 51 51 53 57 8B 7D 08 8D",
        Resolve::Displacement {
            site: 0x26,
            operand: 0,
            insn_len: 0,
            ip_relative: false,
        },
    ),
    code32(Symbol::HandleTlsData, "8B 45 08 89 45 A0", Resolve::AtOffset(-0xC)),
    code32(Symbol::HashTable, "8D 34 85 ?? ?? ?? ?? E8", Resolve::Displacement {
        site: 0,
        operand: 3,
        insn_len: 7,
        ip_relative: false,
    }),
    code32(Symbol::ModuleIndex, "B9 ?? ?? ?? ?? E8 ?? ?? ?? ?? 84 C0", ABS32),
    code32(Symbol::LoaderHeap, "A1 ?? ?? ?? ?? 6A 08", ABS32),
    code32(Symbol::AllocateHeap, "E8 ?? ?? ?? ?? 8B F0 85 F6 74", CALL_REL32),
    code32(
        Symbol::HashUnicodeString,
        "8B FF 55 8B EC 0F B7 45 0A",
        Resolve::AtOffset(0),
    ),
    code32(Symbol::RbInsertNode, "8B FF 55 8B EC 53 8B 5D 10", Resolve::AtOffset(0)),
    code32(Symbol::RbRemoveNode, "8B FF 55 8B EC 51 8B 41 04", Resolve::AtOffset(0)),
];

const WIN7: &[SymbolPattern] = &[
    code64(
        Symbol::HandleTlsData,
        "41 B8 09 00 00 00 48 8D 44 24 38",
        Resolve::AtOffset(-0x27),
    ),
    code64(Symbol::HashTable, "48 8D 3D ?? ?? ?? ?? 8B D6 49 8B CE", REL32),
    code64(Symbol::LoaderHeap, "48 8B 05 ?? ?? ?? ?? 41 B8 08 00 00 00", REL32),
    code64(
        Symbol::AllocateHeap,
        "E8 ?? ?? ?? ?? 48 8B F8 48 85 C0 0F 84",
        CALL_REL32,
    ),
    code64(
        Symbol::HashUnicodeString,
        "40 53 48 83 EC 20 0F B7 42 02",
        Resolve::AtOffset(0),
    ),
    code32(
        Symbol::InsertInvertedFunctionTable,
        "8B FF 55 8B EC 56 68",
        Resolve::AtOffset(0),
    ),
    code32(
        Symbol::InvertedFunctionTable,
        "89 5D E0 38",
        Resolve::Displacement {
            site: 0x1B,
            operand: 0,
            insn_len: 0,
            ip_relative: false,
        },
    ),
    code32(
        Symbol::HandleTlsData,
        "74 20 8D 45 D4 50 6A 09",
        Resolve::AtOffset(-0x14),
    ),
    code32(Symbol::HashTable, "8D 34 85 ?? ?? ?? ?? E8", Resolve::Displacement {
        site: 0,
        operand: 3,
        insn_len: 7,
        ip_relative: false,
    }),
    code32(Symbol::LoaderHeap, "A1 ?? ?? ?? ?? 6A 08", ABS32),
    code32(Symbol::AllocateHeap, "E8 ?? ?? ?? ?? 8B F0 85 F6 74", CALL_REL32),
    code32(
        Symbol::HashUnicodeString,
        "8B FF 55 8B EC 0F B7 45 0A",
        Resolve::AtOffset(0),
    ),
];

/// Pattern set for one OS version. Older versions simply lack entries for
/// symbols their loader does not have (no tree, no pointer encoding).
pub fn patterns_for(version: OsVersion) -> &'static [SymbolPattern] {
    match version {
        OsVersion::Win10Creators => WIN10_CREATORS,
        OsVersion::Win10 => WIN10,
        OsVersion::Win8Point1 => WIN8_POINT1,
        OsVersion::Win8 => WIN8,
        OsVersion::Win7 => WIN7,
    }
}

/// Parsed pattern with bytes and mask
#[derive(Debug, Clone)]
pub struct ParsedPattern {
    /// Pattern bytes (wildcards are 0)
    bytes: Vec<u8>,
    /// true = must match, false = wildcard
    mask: Vec<bool>,
}

impl ParsedPattern {
    /// Parse a `"48 8B ?? 30"` style hex pattern
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for token in pattern.split_whitespace() {
            if token == "??" || token == "?" {
                bytes.push(0);
                mask.push(false);
            } else {
                let value = u8::from_str_radix(token, 16).map_err(|_| {
                    Error::Unsupported(format!("bad pattern token '{}' in '{}'", token, pattern))
                })?;
                bytes.push(value);
                mask.push(true);
            }
        }

        if bytes.is_empty() {
            return Err(Error::Unsupported(format!("empty pattern '{}'", pattern)));
        }
        Ok(Self { bytes, mask })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the first match in `haystack`
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        if haystack.len() < self.bytes.len() {
            return None;
        }
        'outer: for start in 0..=(haystack.len() - self.bytes.len()) {
            for (i, (&b, &m)) in self.bytes.iter().zip(&self.mask).enumerate() {
                if m && haystack[start + i] != b {
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }
}
