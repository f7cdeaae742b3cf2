//! Structure locator
//!
//! Scans the target's loader image(s) for the internal symbols in the
//! pattern catalog and resolves final addresses. Results are cached for the
//! locator's lifetime. A symbol that fails to resolve is recorded absent and
//! every consumer degrades the dependent feature instead of aborting.
//!
//! When controller and target run in different bit-modes, both a 32-bit and
//! a 64-bit copy of the loader coexist in the target; the locator scans
//! whichever image a symbol's bitness calls for.

use crate::patterns::{self, ParsedPattern, Resolve, SectionKind, Symbol, SymbolPattern};
use shade_common::{Bitness, OsProfile};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, trace};

/// One scannable section of a loader image, bytes included. The embedder
/// reads these out of the target before the session starts.
#[derive(Debug, Clone)]
pub struct LoaderSection {
    pub kind: SectionKind,
    /// Absolute address of the section start in the target
    pub address: u64,
    pub data: Vec<u8>,
}

/// A loader image mapped in the target
#[derive(Debug, Clone)]
pub struct LoaderImage {
    pub bitness: Bitness,
    pub base: u64,
    pub sections: Vec<LoaderSection>,
}

impl LoaderImage {
    fn section(&self, kind: SectionKind) -> Option<&LoaderSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }
}

/// List-head anchors that come from the process environment rather than
/// from scanning. The attach collaborator extracts them once.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListHeads {
    pub load_order: u64,
    pub memory_order: u64,
    pub init_order: u64,
}

pub struct StructureLocator {
    profile: OsProfile,
    /// Target's native bitness; `locate` resolves against this image
    target_bitness: Bitness,
    images: Vec<LoaderImage>,
    cache: RwLock<HashMap<(Symbol, Bitness), Option<u64>>>,
}

impl StructureLocator {
    pub fn new(profile: OsProfile, target_bitness: Bitness, images: Vec<LoaderImage>) -> Self {
        Self {
            profile,
            target_bitness,
            images,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn profile(&self) -> &OsProfile {
        &self.profile
    }

    pub fn target_bitness(&self) -> Bitness {
        self.target_bitness
    }

    /// Resolve a symbol against the target's native loader image
    pub fn locate(&self, symbol: Symbol) -> Option<u64> {
        self.locate_for(symbol, self.target_bitness)
    }

    /// Resolve a symbol against the loader image of a specific bitness
    pub fn locate_for(&self, symbol: Symbol, bitness: Bitness) -> Option<u64> {
        if let Some(&cached) = self.cache.read().unwrap().get(&(symbol, bitness)) {
            return cached;
        }

        let resolved = self.scan(symbol, bitness);
        match resolved {
            Some(address) => trace!("{} resolved at {:#x}", symbol.name(), address),
            None => debug!(
                "{} not found in {:?} image, feature degraded",
                symbol.name(),
                bitness
            ),
        }

        self.cache
            .write()
            .unwrap()
            .insert((symbol, bitness), resolved);
        resolved
    }

    /// Newest-pattern-first scan over the profile fallback chain
    fn scan(&self, symbol: Symbol, bitness: Bitness) -> Option<u64> {
        let image = self.images.iter().find(|img| img.bitness == bitness)?;

        for version in self.profile.version.fallback_chain() {
            for entry in patterns_for_symbol(version, symbol, bitness) {
                if let Some(address) = resolve_entry(entry, image) {
                    return Some(address);
                }
            }
        }
        None
    }
}

fn patterns_for_symbol(
    version: shade_common::OsVersion,
    symbol: Symbol,
    bitness: Bitness,
) -> impl Iterator<Item = &'static SymbolPattern> {
    patterns::patterns_for(version)
        .iter()
        .filter(move |p| p.symbol == symbol && p.bitness == bitness)
}

fn resolve_entry(entry: &SymbolPattern, image: &LoaderImage) -> Option<u64> {
    let section = image.section(entry.section)?;
    let parsed = ParsedPattern::parse(entry.pattern).ok()?;
    let offset = parsed.find(&section.data)? as u64;
    let site_address = section.address + offset;

    match entry.resolve {
        Resolve::AtOffset(delta) => Some(site_address.wrapping_add_signed(delta)),
        Resolve::Displacement {
            site,
            operand,
            insn_len,
            ip_relative,
        } => {
            let read_at = (offset as i64).checked_add(site)?.checked_add(operand)?;
            let displacement = read_i32(&section.data, read_at)? as i64;
            if ip_relative {
                let next_insn = site_address.wrapping_add_signed(site + insn_len);
                Some(next_insn.wrapping_add_signed(displacement))
            } else {
                // 32-bit images embed the absolute address in the operand
                Some(displacement as u32 as u64)
            }
        }
    }
}

fn read_i32(data: &[u8], offset: i64) -> Option<i32> {
    let offset = usize::try_from(offset).ok()?;
    let bytes = data.get(offset..offset + 4)?;
    Some(i32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Capability handles for one session, obtained once from the locator and
/// passed explicitly to the editor and unlink engine. Every address is
/// optional; consumers skip the structure a missing address belongs to.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anchors {
    pub hash_table: Option<u64>,
    pub module_index: Option<u64>,
    pub inverted_table: Option<u64>,
    pub insert_inverted: Option<u64>,
    pub handle_tls: Option<u64>,
    pub hash_routine: Option<u64>,
    pub rb_insert: Option<u64>,
    pub rb_remove: Option<u64>,
    pub loader_heap: Option<u64>,
    pub allocate_heap: Option<u64>,
    pub encode_pointer: Option<u64>,
    pub lists: ListHeads,
    /// TLS-pointer field of the worker thread's environment block, for the
    /// direct-patch fallback. Extracted by the attach collaborator; absent
    /// when no fallback is possible.
    pub tls_pointer_cell: Option<u64>,
}

impl Anchors {
    pub fn from_locator(locator: &StructureLocator, lists: ListHeads) -> Self {
        Self {
            hash_table: locator.locate(Symbol::HashTable),
            module_index: locator.locate(Symbol::ModuleIndex),
            inverted_table: locator.locate(Symbol::InvertedFunctionTable),
            insert_inverted: locator.locate(Symbol::InsertInvertedFunctionTable),
            handle_tls: locator.locate(Symbol::HandleTlsData),
            hash_routine: locator.locate(Symbol::HashUnicodeString),
            rb_insert: locator.locate(Symbol::RbInsertNode),
            rb_remove: locator.locate(Symbol::RbRemoveNode),
            loader_heap: locator.locate(Symbol::LoaderHeap),
            allocate_heap: locator.locate(Symbol::AllocateHeap),
            encode_pointer: locator.locate(Symbol::EncodeSystemPointer),
            lists,
            tls_pointer_cell: None,
        }
    }

    pub fn with_tls_pointer_cell(mut self, cell: u64) -> Self {
        self.tls_pointer_cell = Some(cell);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shade_common::OsVersion;

    fn image_with_code(bitness: Bitness, base: u64, code: Vec<u8>) -> LoaderImage {
        LoaderImage {
            bitness,
            base,
            sections: vec![LoaderSection {
                kind: SectionKind::Code,
                address: base + 0x1000,
                data: code,
            }],
        }
    }

    fn locator_for(version: OsVersion, images: Vec<LoaderImage>) -> StructureLocator {
        let bitness = images[0].bitness;
        StructureLocator::new(OsProfile::for_version(version), bitness, images)
    }

    #[test]
    fn test_at_offset_resolution() {
        // Win8 x64 TLS pattern at +0x100; function start is 0x49 back
        let mut code = vec![0x90u8; 0x200];
        code[0x100..0x108].copy_from_slice(&[0x48, 0x8B, 0x79, 0x30, 0x45, 0x8D, 0x66, 0x01]);

        let locator = locator_for(
            OsVersion::Win8,
            vec![image_with_code(Bitness::X64, 0x7ff0_0000_0000, code)],
        );
        let address = locator.locate(Symbol::HandleTlsData).unwrap();
        assert_eq!(address, 0x7ff0_0000_0000 + 0x1000 + 0x100 - 0x49);
    }

    #[test]
    fn test_ip_relative_resolution() {
        // lea rdi, [rip + 0x2000] anchor for the hash table
        let mut code = vec![0x90u8; 0x100];
        code[0x40..0x47].copy_from_slice(&[0x48, 0x8D, 0x3D, 0x00, 0x20, 0x00, 0x00]);
        code[0x47..0x4C].copy_from_slice(&[0x8B, 0xD6, 0x49, 0x8B, 0xCE]);

        let locator = locator_for(
            OsVersion::Win10,
            vec![image_with_code(Bitness::X64, 0x1_0000_0000, code)],
        );
        let address = locator.locate(Symbol::HashTable).unwrap();
        // match + insn_len + disp
        assert_eq!(address, 0x1_0000_0000 + 0x1000 + 0x40 + 7 + 0x2000);
    }

    #[test]
    fn test_absolute_displacement_resolution() {
        // mov eax, [0x77a12340]; push 8 — loader heap cell on 32-bit
        let mut code = vec![0xCCu8; 0x80];
        code[0x10] = 0xA1;
        code[0x11..0x15].copy_from_slice(&0x77a1_2340u32.to_le_bytes());
        code[0x15] = 0x6A;
        code[0x16] = 0x08;

        let locator = locator_for(
            OsVersion::Win10,
            vec![image_with_code(Bitness::X86, 0x7790_0000, code)],
        );
        assert_eq!(locator.locate(Symbol::LoaderHeap), Some(0x77a1_2340));
    }

    #[test]
    fn test_fallback_to_older_profile_pattern() {
        // Image carries only the Win8-era x86 TLS pattern; active profile is
        // Win8.1, whose own pattern is absent.
        let mut code = vec![0x90u8; 0x100];
        code[0x30..0x36].copy_from_slice(&[0x8B, 0x45, 0x08, 0x89, 0x45, 0xA0]);

        let locator = locator_for(
            OsVersion::Win8Point1,
            vec![image_with_code(Bitness::X86, 0x7780_0000, code)],
        );
        let address = locator.locate(Symbol::HandleTlsData).unwrap();
        assert_eq!(address, 0x7780_0000 + 0x1000 + 0x30 - 0xC);
    }

    #[test]
    fn test_missing_symbol_is_absent_not_fatal() {
        let locator = locator_for(
            OsVersion::Win10,
            vec![image_with_code(Bitness::X64, 0x1000_0000, vec![0x90; 64])],
        );
        assert_eq!(locator.locate(Symbol::RbInsertNode), None);
        // Cached as absent: second lookup hits the cache
        assert_eq!(locator.locate(Symbol::RbInsertNode), None);
    }

    #[test]
    fn test_dual_image_scan() {
        // Cross-bitness session: 64-bit symbol resolves from the 64-bit
        // image, 32-bit symbol from the 32-bit one.
        let mut code64 = vec![0x90u8; 0x100];
        code64[0x20..0x28].copy_from_slice(&[0x48, 0x8B, 0x79, 0x30, 0x45, 0x8D, 0x66, 0x01]);
        let mut code32 = vec![0x90u8; 0x100];
        code32[0x50..0x56].copy_from_slice(&[0x8B, 0x45, 0x08, 0x89, 0x45, 0xA0]);

        let locator = locator_for(
            OsVersion::Win8,
            vec![
                image_with_code(Bitness::X64, 0x7ff0_0000_0000, code64),
                image_with_code(Bitness::X86, 0x7780_0000, code32),
            ],
        );

        assert!(locator.locate_for(Symbol::HandleTlsData, Bitness::X64).is_some());
        assert!(locator.locate_for(Symbol::HandleTlsData, Bitness::X86).is_some());
        assert_ne!(
            locator.locate_for(Symbol::HandleTlsData, Bitness::X64),
            locator.locate_for(Symbol::HandleTlsData, Bitness::X86)
        );
    }
}
