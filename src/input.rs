//! C3 — input orchestration: maps each input file into memory, selects a
//! fat-file architecture slice, classifies the file kind, atomizes
//! relocatable objects and dylib exports into [`crate::atom::Atom`]s, and
//! resolves the dylib dependency graph, per SPEC_FULL.md §4.3.
//!
//! Every parser here hands its atoms to the caller rather than inserting
//! them into [`crate::symtab::SymbolTable`] itself — that indirection is
//! what lets [`crate::linker::Linker`] drive resolution order (direct files
//! first, archives/dylibs just-in-time) without this module knowing
//! anything about the override matrix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use scroll::Pread;

use crate::archive::{self, Archive};
use crate::atom::{
    Atom, AtomContent, AtomGraph, AtomId, Combine, ContentType, Definition, Scope, Section,
    SymbolTableInclusion, SyntheticKind,
};
use crate::container::{Container, Ctx};
use crate::diagnostics;
use crate::error::{LinkerError, Result};
use crate::mach::fat::{FatArch, FatHeader, FAT_MAGIC};
use crate::mach::header::{Header, MH_DYLIB, MH_MAGIC, MH_MAGIC_64};
use crate::mach::load_command::{CommandVariant, LoadCommand};
use crate::mach::symbols::Symbols;
use crate::options::{Namespace, Options};

/// What an input file turned out to be, before we decide how to fold it
/// into the atom graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Object,
    /// LLVM bitcode: magic-recognized only, see SPEC_FULL.md Non-goals.
    LtoBitcode,
    Dylib,
    Archive,
}

const LTO_MAGIC: &[u8; 4] = b"BC\xc0\xde";

/// Classifies `bytes` (already architecture-selected, i.e. a thin Mach-O
/// slice or a whole archive/bitcode file) per the order in §4.3: object,
/// LTO, dylib, archive.
pub fn classify(bytes: &[u8]) -> Result<FileKind> {
    if bytes.len() >= 4 && &bytes[..4] == LTO_MAGIC {
        return Ok(FileKind::LtoBitcode);
    }
    if bytes.len() >= archive::SIZEOF_MAGIC && &bytes[..archive::SIZEOF_MAGIC] == archive::MAGIC {
        return Ok(FileKind::Archive);
    }
    if bytes.len() < 4 {
        return Err(LinkerError::Input("file too small to contain a Mach-O magic".into()));
    }
    let magic: u32 = bytes.pread_with(0, scroll::Endian::Big)?;
    match magic {
        MH_MAGIC | MH_MAGIC_64 => {
            let header = peek_header(bytes)?;
            if header.filetype == MH_DYLIB {
                Ok(FileKind::Dylib)
            } else {
                Ok(FileKind::Object)
            }
        }
        // big-endian magic byte order reads as the CIGAM constants here
        // since we forced big-endian above; `Header::try_from_ctx` sorts
        // out the real endianness once we commit to parsing it.
        m if m == crate::mach::header::MH_CIGAM || m == crate::mach::header::MH_CIGAM_64 => {
            let header = peek_header(bytes)?;
            if header.filetype == MH_DYLIB {
                Ok(FileKind::Dylib)
            } else {
                Ok(FileKind::Object)
            }
        }
        _ => Err(LinkerError::Input("unrecognized file format (not object, dylib, or archive)".into())),
    }
}

fn peek_header(bytes: &[u8]) -> Result<Header> {
    use scroll::ctx::TryFromCtx;
    let (header, _) = Header::try_from_ctx(bytes, scroll::Endian::Little).map_err(LinkerError::from)?;
    Ok(header)
}

/// A memory-mapped input file plus the architecture-selected slice of it
/// this link is actually consuming. Owns the mmap for the process lifetime
/// so every `Atom::content` can borrow out of it at parse time (copied into
/// `AtomContent::Bytes`, per the arena-ownership tradeoff documented on
/// that type).
pub struct MappedFile {
    pub path: PathBuf,
    mmap: Mmap,
}

impl MappedFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        // SAFETY: the file is not expected to be mutated by another process
        // while the linker holds it open; this matches every other mmap-based
        // reader in this crate's corpus.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(MappedFile { path, mmap })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Selects the architecture slice matching `(cputype, cpusubtype)`
    /// out of a fat file, or returns the whole mapping unchanged if it's
    /// already thin.
    pub fn select_arch(&self, cputype: u32, cpusubtype: u32) -> Result<&[u8]> {
        let bytes = self.bytes();
        if bytes.len() >= 4 {
            let magic: u32 = bytes.pread_with(0, scroll::Endian::Big)?;
            if magic == FAT_MAGIC || magic == crate::mach::fat::FAT_CIGAM {
                let _ = FatHeader::parse(bytes)?;
                let arches = FatArch::parse(bytes)?;
                let arch = FatArch::select(&arches, cputype, cpusubtype)?;
                return Ok(arch.slice(bytes));
            }
        }
        Ok(bytes)
    }
}

/// The outcome of atomizing one relocatable object or dylib file: the
/// atoms it contributed, already allocated into the shared graph, plus
/// bookkeeping the caller needs for symbol-table insertion and diagnostics.
pub struct ParsedInput {
    pub atoms: Vec<AtomId>,
    pub path: PathBuf,
}

/// Parses a Mach-O relocatable object's load commands, walks its segments
/// and sections, and atomizes its symbol table.
///
/// Atomization approximates ld64's "subsections via symbols" behavior: we
/// sort every section-local `nlist` entry by `(n_sect, n_value)` and slice
/// each symbol's content from its own value up to the next symbol's value
/// (or the section's end). This crate does not additionally split on
/// relocation boundaries the way a full `-dead_strip`-capable linker would
/// for symbol-less code regions — see DESIGN.md for the scope this takes.
pub struct ObjectParser<'a> {
    bytes: &'a [u8],
    header: Header,
    ctx: Ctx,
}

struct ParsedSection {
    segname: String,
    sectname: String,
    addr: u64,
    size: u64,
    offset: u32,
    align: u32,
    flags: u32,
    reloff: u32,
    nreloc: u32,
    index: usize,
}

impl<'a> ObjectParser<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        use scroll::ctx::TryFromCtx;
        let (header, _) = Header::try_from_ctx(bytes, scroll::Endian::Little).map_err(LinkerError::from)?;
        let ctx = header.ctx()?;
        Ok(ObjectParser { bytes, header, ctx })
    }

    /// Parses every load command, builds the section table, atomizes the
    /// symbol table, and allocates the resulting atoms into `graph`.
    ///
    /// Fixups are computed *before* any atom is allocated: a relocation's
    /// target is resolved to the name of the nearest symbol at or before
    /// the target address (recovering the same symbol an atom will be
    /// built from) rather than to an [`AtomId`], which doesn't exist yet
    /// for a forward reference within the same object. Every fixup this
    /// parser produces is therefore `Binding::ByNameUnbound`, resolved
    /// uniformly later by [`crate::symtab::SymbolTable`] regardless of
    /// whether the reference was originally a classic-relocation "extern"
    /// symbol-table entry or a same-object section-ordinal entry.
    pub fn atomize(&self, graph: &mut AtomGraph) -> Result<Vec<AtomId>> {
        let mut sections: Vec<ParsedSection> = Vec::new();
        let mut symtab: Option<crate::mach::load_command::SymtabCommand> = None;

        let mut offset = self.header.size();
        for _ in 0..self.header.ncmds {
            let lc = LoadCommand::parse(&self.bytes, &mut offset, self.ctx.le)?;
            match lc.command {
                CommandVariant::Segment32(seg) => {
                    self.collect_sections32(&lc, seg, &mut sections)?;
                }
                CommandVariant::Segment64(seg) => {
                    self.collect_sections64(&lc, seg, &mut sections)?;
                }
                CommandVariant::Symtab(cmd) => symtab = Some(cmd),
                _ => {}
            }
        }

        let Some(symtab) = symtab else {
            // No symbol table: still possible for a minimal object with
            // a single anonymous section; nothing to atomize without names.
            return Ok(Vec::new());
        };
        let symbols = Symbols::parse(self.bytes, &symtab, self.ctx)?;

        // (section index, value, name, nlist) for every section-relative
        // defined symbol; absolute and undefined symbols are handled
        // separately since they never participate in subsectioning.
        let mut per_section: HashMap<usize, Vec<(u64, String, crate::mach::symbols::Nlist)>> = HashMap::new();
        let mut absolutes = Vec::new();
        let mut atom_ids = Vec::new();

        for i in 0..symbols.nsyms {
            let (name, nlist) = symbols.get(i)?;
            if nlist.n_type & crate::mach::symbols::N_STAB != 0 {
                continue; // debug stabs are not atoms
            }
            if nlist.is_undefined() {
                continue; // undefined references surface via fixups, not atoms
            }
            if nlist.is_absolute() {
                absolutes.push((name, nlist));
                continue;
            }
            per_section.entry(nlist.n_sect).or_default().push((nlist.n_value, name.to_string(), nlist));
        }
        for syms in per_section.values_mut() {
            syms.sort_by_key(|(value, ..)| *value);
        }
        // Read-only name lookup table, kept around (unlike `per_section`,
        // which atom construction below drains) so relocation resolution
        // can look a target address up after its owning atom is built.
        let section_symbols: HashMap<usize, Vec<(u64, String)>> = per_section
            .iter()
            .map(|(&idx, syms)| (idx, syms.iter().map(|(v, n, _)| (*v, n.clone())).collect()))
            .collect();

        let fixups_by_owner = self.compute_fixups(&sections, &section_symbols, &symbols, graph)?;

        for (name, nlist) in absolutes {
            let atom = Atom {
                name: name.as_bytes().to_vec(),
                definition: Definition::Absolute,
                scope: scope_of(&nlist),
                combine: Combine::Never,
                symbol_table_inclusion: inclusion_of(&nlist),
                content_type: ContentType::Unclassified,
                section: Section::new("", "", ContentType::Unclassified),
                alignment: (0, 0),
                size: 0,
                object_address: nlist.n_value,
                auto_hide: false,
                overrides_dylib_weak_def: false,
                thumb: false,
                weak_imported: false,
                weak_def: nlist.is_weak_def(),
                is_lto_temporary: false,
                content: AtomContent::Bytes(Vec::new()),
                fixups: Vec::new(),
                dylib_ordinal: 0,
                group_subordinates: Vec::new(),
            };
            atom_ids.push(graph.alloc(atom));
        }

        for section in &sections {
            let mut syms = per_section.remove(&section.index).unwrap_or_default();
            syms.sort_by_key(|(value, ..)| *value);
            let content_type = classify_section(&section.segname, &section.sectname, section.flags);
            let is_zerofill = section.flags & crate::mach::constants::SECTION_TYPE
                == crate::mach::constants::S_ZEROFILL
                || section.flags & crate::mach::constants::SECTION_TYPE == crate::mach::constants::S_GB_ZEROFILL;

            if syms.is_empty() {
                // An entirely anonymous section (e.g. a lone `__const`
                // blob) still becomes one atom so it survives to layout.
                if section.size > 0 {
                    let fixups = fixups_by_owner.get(&(section.index, section.addr)).cloned().unwrap_or_default();
                    let atom = self.make_body_atom(section, "", 0, section.size, content_type, is_zerofill, false, fixups)?;
                    atom_ids.push(graph.alloc(atom));
                }
                continue;
            }

            for (idx, (value, name, nlist)) in syms.iter().enumerate() {
                let next_value = syms.get(idx + 1).map(|(v, ..)| *v).unwrap_or(section.addr + section.size);
                let size = next_value.saturating_sub(*value);
                let offset_in_section = value.saturating_sub(section.addr);
                let fixups = fixups_by_owner.get(&(section.index, *value)).cloned().unwrap_or_default();
                let atom = self.make_symbol_atom(
                    section,
                    name,
                    nlist,
                    offset_in_section,
                    size,
                    content_type,
                    is_zerofill,
                    fixups,
                )?;
                atom_ids.push(graph.alloc(atom));
            }
        }

        Ok(atom_ids)
    }

    /// Reads every section's classic `relocation_info` table and resolves
    /// each entry to a `(owner key, Fixup)` pair. The owner key is
    /// `(section index, nearest-symbol-at-or-before-the-site value)`,
    /// matching the key atom construction looks entries up by.
    fn compute_fixups(
        &self,
        sections: &[ParsedSection],
        section_symbols: &HashMap<usize, Vec<(u64, String)>>,
        symbols: &Symbols<'_>,
        graph: &mut AtomGraph,
    ) -> Result<HashMap<(usize, u64), Vec<crate::atom::Fixup>>> {
        use crate::atom::{Binding, ClusterPosition, Fixup, FixupKind, FixupTarget};
        use crate::mach::relocation::RelocationInfo;

        let mut out: HashMap<(usize, u64), Vec<Fixup>> = HashMap::new();

        for section in sections {
            for i in 0..section.nreloc as usize {
                let reloc_offset = section.reloff as usize + i * 8;
                let reloc: RelocationInfo = self.bytes.pread_with(reloc_offset, self.ctx.le)?;
                if reloc.r_address < 0 {
                    continue; // scattered relocations (legacy 32-bit PPC/x86): not modeled
                }
                let site_addr = section.addr + reloc.r_address as u64;
                let length_bytes = 1u32 << reloc.r_length();
                let raw_value = self.read_signed(section.offset as u64 + reloc.r_address as u64, length_bytes)?;

                let resolved = if reloc.r_extern() {
                    let (name, _) = symbols.get(reloc.r_symbolnum() as usize)?;
                    Some((name.to_string(), raw_value))
                } else {
                    self.resolve_local_target(reloc.r_symbolnum(), raw_value, reloc.r_pcrel(), length_bytes, site_addr, sections, section_symbols)
                };

                let Some((target_name, addend)) = resolved else { continue };
                let owner_value = nearest_at_or_before(section_symbols.get(&section.index), site_addr).unwrap_or(section.addr);
                let pending = graph.intern_pending_name(target_name.as_bytes());

                let kind = if reloc.r_pcrel() {
                    FixupKind::StoreX86PCRel32
                } else {
                    match length_bytes {
                        1 => FixupKind::Store8,
                        2 => FixupKind::StoreLittleEndian16,
                        8 => FixupKind::StoreLittleEndian64,
                        _ => FixupKind::StoreLittleEndian32,
                    }
                };

                let fixup = Fixup {
                    offset_in_atom: (site_addr - owner_value) as u32,
                    cluster: ClusterPosition::SINGLE,
                    kind,
                    binding: Binding::ByNameUnbound,
                    target: FixupTarget::PendingName(pending),
                    content_addend_only: false,
                    content_delta_to_addend_only: addend == 0,
                };
                out.entry((section.index, owner_value)).or_default().push(fixup);
            }
        }
        Ok(out)
    }

    fn resolve_local_target(
        &self,
        section_ordinal: u32,
        raw_value: i64,
        pcrel: bool,
        length_bytes: u32,
        site_addr: u64,
        sections: &[ParsedSection],
        section_symbols: &HashMap<usize, Vec<(u64, String)>>,
    ) -> Option<(String, i64)> {
        let target_section = sections.iter().find(|s| s.index == section_ordinal as usize)?;
        let target_addr = if pcrel {
            (raw_value + site_addr as i64 + length_bytes as i64) as u64
        } else {
            raw_value as u64
        };
        let syms = section_symbols.get(&target_section.index)?;
        let (value, name) = syms.iter().rev().find(|(v, _)| *v <= target_addr)?;
        Some((name.clone(), (target_addr - value) as i64))
    }

    fn read_signed(&self, byte_offset: u64, width: u32) -> Result<i64> {
        let offset = byte_offset as usize;
        let le = self.ctx.le;
        let value = match width {
            1 => self.bytes.pread_with::<u8>(offset, le)? as i64,
            2 => self.bytes.pread_with::<u16>(offset, le)? as i16 as i64,
            8 => self.bytes.pread_with::<u64>(offset, le)? as i64,
            _ => self.bytes.pread_with::<u32>(offset, le)? as i32 as i64,
        };
        Ok(value)
    }

    fn collect_sections32(
        &self,
        lc: &LoadCommand,
        seg: crate::mach::load_command::SegmentCommand32,
        sections: &mut Vec<ParsedSection>,
    ) -> Result<()> {
        let mut offset = lc.offset + crate::mach::load_command::SIZEOF_SEGMENT_COMMAND_32;
        for _ in 0..seg.nsects {
            let sect: crate::mach::load_command::Section32 = self.bytes.pread_with(offset, self.ctx.le)?;
            sections.push(ParsedSection {
                segname: cstr16(&sect.segname),
                sectname: cstr16(&sect.sectname),
                addr: sect.addr as u64,
                size: sect.size as u64,
                offset: sect.offset,
                align: sect.align,
                flags: sect.flags,
                reloff: sect.reloff,
                nreloc: sect.nreloc,
                index: sections.len() + 1,
            });
            offset += crate::mach::load_command::SIZEOF_SECTION_32;
        }
        Ok(())
    }

    fn collect_sections64(
        &self,
        lc: &LoadCommand,
        seg: crate::mach::load_command::SegmentCommand64,
        sections: &mut Vec<ParsedSection>,
    ) -> Result<()> {
        let mut offset = lc.offset + crate::mach::load_command::SIZEOF_SEGMENT_COMMAND_64;
        for _ in 0..seg.nsects {
            let sect: crate::mach::load_command::Section64 = self.bytes.pread_with(offset, self.ctx.le)?;
            sections.push(ParsedSection {
                segname: cstr16(&sect.segname),
                sectname: cstr16(&sect.sectname),
                addr: sect.addr,
                size: sect.size,
                offset: sect.offset,
                align: sect.align,
                flags: sect.flags,
                reloff: sect.reloff,
                nreloc: sect.nreloc,
                index: sections.len() + 1,
            });
            offset += crate::mach::load_command::SIZEOF_SECTION_64;
        }
        Ok(())
    }

    fn make_symbol_atom(
        &self,
        section: &ParsedSection,
        name: &str,
        nlist: &crate::mach::symbols::Nlist,
        offset_in_section: u64,
        size: u64,
        content_type: ContentType,
        is_zerofill: bool,
        fixups: Vec<crate::atom::Fixup>,
    ) -> Result<Atom> {
        let content = if is_zerofill {
            AtomContent::ZeroFill(size as usize)
        } else {
            let start = section.offset as usize + offset_in_section as usize;
            let end = start + size as usize;
            let bytes = self
                .bytes
                .get(start..end)
                .ok_or_else(|| LinkerError::Input(format!("section content out of bounds for '{}'", name)))?
                .to_vec();
            AtomContent::Bytes(bytes)
        };
        Ok(Atom {
            name: name.as_bytes().to_vec(),
            definition: if nlist.n_type & crate::mach::symbols::N_TYPE == crate::mach::symbols::N_UNDF {
                Definition::Tentative
            } else {
                Definition::Regular
            },
            scope: scope_of(nlist),
            combine: combine_for(content_type),
            symbol_table_inclusion: inclusion_of(nlist),
            content_type,
            section: Section::new(section.segname.clone(), section.sectname.clone(), content_type),
            alignment: (section.align as u8, 0),
            size,
            object_address: section.addr + offset_in_section,
            auto_hide: false,
            overrides_dylib_weak_def: false,
            thumb: false,
            weak_imported: false,
            weak_def: nlist.is_weak_def(),
            is_lto_temporary: false,
            content,
            fixups,
            dylib_ordinal: 0,
            group_subordinates: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn make_body_atom(
        &self,
        section: &ParsedSection,
        name: &str,
        offset_in_section: u64,
        size: u64,
        content_type: ContentType,
        is_zerofill: bool,
        weak_def: bool,
        fixups: Vec<crate::atom::Fixup>,
    ) -> Result<Atom> {
        let content = if is_zerofill {
            AtomContent::ZeroFill(size as usize)
        } else {
            let start = section.offset as usize + offset_in_section as usize;
            let end = start + size as usize;
            let bytes = self
                .bytes
                .get(start..end)
                .ok_or_else(|| LinkerError::Input("section content out of bounds".into()))?
                .to_vec();
            AtomContent::Bytes(bytes)
        };
        Ok(Atom {
            name: name.as_bytes().to_vec(),
            definition: Definition::Regular,
            scope: Scope::TranslationUnit,
            combine: combine_for(content_type),
            symbol_table_inclusion: SymbolTableInclusion::NotIn,
            content_type,
            section: Section::new(section.segname.clone(), section.sectname.clone(), content_type),
            alignment: (section.align as u8, 0),
            size,
            object_address: section.addr + offset_in_section,
            auto_hide: false,
            overrides_dylib_weak_def: false,
            thumb: false,
            weak_imported: false,
            weak_def,
            is_lto_temporary: false,
            content,
            fixups,
            dylib_ordinal: 0,
            group_subordinates: Vec::new(),
        })
    }
}

/// The value of the last entry in `syms` (sorted by address) at or before
/// `addr`, used to key a relocation site to the atom that will own it.
fn nearest_at_or_before(syms: Option<&Vec<(u64, String)>>, addr: u64) -> Option<u64> {
    syms?.iter().rev().find(|(v, _)| *v <= addr).map(|(v, _)| *v)
}

fn cstr16(bytes: &[u8; 16]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn scope_of(nlist: &crate::mach::symbols::Nlist) -> Scope {
    if !nlist.is_external() {
        Scope::TranslationUnit
    } else if nlist.is_private_external() {
        Scope::LinkageUnit
    } else {
        Scope::Global
    }
}

fn inclusion_of(nlist: &crate::mach::symbols::Nlist) -> SymbolTableInclusion {
    if nlist.is_external() {
        SymbolTableInclusion::In
    } else {
        SymbolTableInclusion::NotIn
    }
}

fn combine_for(content_type: ContentType) -> Combine {
    match content_type {
        ContentType::CString | ContentType::Literal4 | ContentType::Literal8 | ContentType::Literal16 => {
            Combine::ByNameAndContent
        }
        ContentType::NonLazyPointer => Combine::ByNameAndReferences,
        _ => Combine::ByName,
    }
}

/// The §4.4 input-section classification, reused here only to pick a
/// sensible [`ContentType`] at atomization time; the authoritative
/// section-merge table lives in [`crate::sections`].
fn classify_section(segname: &str, sectname: &str, flags: u32) -> ContentType {
    use crate::mach::constants::*;
    let kind = flags & SECTION_TYPE;
    if kind == S_CSTRING_LITERALS {
        return ContentType::CString;
    }
    if kind == S_4BYTE_LITERALS {
        return ContentType::Literal4;
    }
    if kind == S_8BYTE_LITERALS {
        return ContentType::Literal8;
    }
    if kind == S_16BYTE_LITERALS {
        return ContentType::Literal16;
    }
    if kind == S_NON_LAZY_SYMBOL_POINTERS {
        return ContentType::NonLazyPointer;
    }
    if kind == S_LAZY_SYMBOL_POINTERS || kind == S_LAZY_DYLIB_SYMBOL_POINTERS {
        return ContentType::LazyPointer;
    }
    if kind == S_SYMBOL_STUBS {
        return ContentType::Stub;
    }
    if kind == S_THREAD_LOCAL_REGULAR {
        return ContentType::Tlv;
    }
    if kind == S_THREAD_LOCAL_ZEROFILL {
        return ContentType::TlvZeroFill;
    }
    if kind == S_ZEROFILL || kind == S_GB_ZEROFILL {
        return ContentType::ZeroFill;
    }
    if flags & S_ATTR_PURE_INSTRUCTIONS != 0 || flags & S_ATTR_SOME_INSTRUCTIONS != 0 {
        return ContentType::Code;
    }
    match (segname, sectname) {
        ("__TEXT", "__text") => ContentType::Code,
        ("__TEXT", "__eh_frame") => ContentType::Cfi,
        ("__TEXT", "__gcc_except_tab") => ContentType::Lsda,
        ("__LD", "__compact_unwind") | (_, "__unwind_info") => ContentType::CompactUnwind,
        _ => ContentType::Unclassified,
    }
}

/// Proxy-atom reader for a Mach-O dylib: its exported `nlist` entries
/// (external, defined, not private-extern) become [`Definition::Proxy`]
/// atoms on demand. This crate does not parse the compressed dyld export
/// trie (`LC_DYLD_INFO[_ONLY]`'s export-info blob) — see DESIGN.md — so it
/// only resolves names a dylib still carries in its classic symbol table,
/// which covers every dylib this crate itself could produce and the large
/// majority of system dylibs built with symbol tables retained.
pub struct DylibParser<'a> {
    bytes: &'a [u8],
    header: Header,
    ctx: Ctx,
    pub install_name: String,
    pub reexports: Vec<String>,
    pub direct_dependencies: Vec<String>,
    pub parent_umbrella: Option<String>,
    pub allowable_clients: Vec<String>,
}

impl<'a> DylibParser<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        use scroll::ctx::TryFromCtx;
        let (header, _) = Header::try_from_ctx(bytes, scroll::Endian::Little).map_err(LinkerError::from)?;
        let ctx = header.ctx()?;
        let mut install_name = String::new();
        let mut reexports = Vec::new();
        let mut direct_dependencies = Vec::new();
        let mut parent_umbrella = None;
        let mut allowable_clients = Vec::new();

        let mut offset = header.size();
        for _ in 0..header.ncmds {
            let lc = LoadCommand::parse(&bytes, &mut offset, ctx.le)?;
            match lc.command {
                CommandVariant::IdDylib(cmd) => {
                    install_name = read_lc_str(bytes, lc.offset, cmd.dylib.name, ctx.le)?;
                }
                CommandVariant::LoadDylib(cmd) | CommandVariant::LoadWeakDylib(cmd) | CommandVariant::LoadUpwardDylib(cmd) => {
                    direct_dependencies.push(read_lc_str(bytes, lc.offset, cmd.dylib.name, ctx.le)?);
                }
                CommandVariant::ReexportDylib(cmd) => {
                    reexports.push(read_lc_str(bytes, lc.offset, cmd.dylib.name, ctx.le)?);
                }
                CommandVariant::SubFramework(cmd) => {
                    parent_umbrella = Some(read_lc_str(bytes, lc.offset, cmd.umbrella, ctx.le)?);
                }
                CommandVariant::SubClient(cmd) => {
                    allowable_clients.push(read_lc_str(bytes, lc.offset, cmd.client, ctx.le)?);
                }
                _ => {}
            }
        }

        Ok(DylibParser { bytes, header, ctx, install_name, reexports, direct_dependencies, parent_umbrella, allowable_clients })
    }

    /// Synthesizes a proxy [`Atom`] for `name` if this dylib exports it, per
    /// `searchLibraries`'s dylib branch. `ordinal` is the `compressedOrdinalForAtom`
    /// value the caller has already computed for this dylib (§4.6); stamped
    /// onto the atom here since atoms are immutable once allocated.
    pub fn synthesize_proxy(&self, graph: &mut AtomGraph, name: &[u8], ordinal: i64) -> Result<Option<AtomId>> {
        let mut offset = self.header.size();
        let mut symtab = None;
        for _ in 0..self.header.ncmds {
            let lc = LoadCommand::parse(&self.bytes, &mut offset, self.ctx.le)?;
            if let CommandVariant::Symtab(cmd) = lc.command {
                symtab = Some(cmd);
                break;
            }
        }
        let Some(symtab) = symtab else { return Ok(None) };
        let symbols = Symbols::parse(self.bytes, &symtab, self.ctx)?;
        for i in 0..symbols.nsyms {
            let (sym_name, nlist) = symbols.get(i)?;
            if sym_name.as_bytes() != name {
                continue;
            }
            if !nlist.is_external() || nlist.is_undefined() {
                continue;
            }
            let atom = Atom {
                name: name.to_vec(),
                definition: Definition::Proxy,
                scope: Scope::Global,
                combine: Combine::ByName,
                symbol_table_inclusion: SymbolTableInclusion::NotIn,
                content_type: ContentType::Unclassified,
                section: Section::new("", "", ContentType::Unclassified),
                alignment: (0, 0),
                size: 0,
                object_address: 0,
                auto_hide: false,
                overrides_dylib_weak_def: false,
                thumb: false,
                weak_imported: false,
                weak_def: nlist.is_weak_def(),
                is_lto_temporary: false,
                content: AtomContent::Proxy,
                fixups: Vec::new(),
                dylib_ordinal: ordinal,
                group_subordinates: Vec::new(),
            };
            return Ok(Some(graph.alloc(atom)));
        }
        Ok(None)
    }

    /// The client name this dylib would present to a parent umbrella's
    /// `-allowable_client` check: the leaf of its install path with a
    /// leading `lib` and trailing `.`/`_`-delimited suffix stripped.
    pub fn derived_client_name(install_path: &str) -> String {
        let leaf = install_path.rsplit('/').next().unwrap_or(install_path);
        let leaf = leaf.strip_prefix("lib").unwrap_or(leaf);
        leaf.split(['.', '_']).next().unwrap_or(leaf).to_string()
    }
}

fn read_lc_str(bytes: &[u8], command_offset: usize, lcstr: crate::mach::load_command::LcStr, le: scroll::Endian) -> Result<String> {
    let str_offset = command_offset + lcstr as usize;
    let s: &str = bytes.pread(str_offset)?;
    let _ = le;
    Ok(s.to_string())
}

/// The resolved dylib dependency graph: every dylib reachable from the
/// direct inputs, keyed by install path, plus client-restriction state
/// needed by `searchLibraries`.
pub struct DylibGraph {
    pub by_install_path: HashMap<String, DylibNode>,
    /// Install paths of dylibs named directly on the command line — the
    /// only ones `searchLibraries` consults first in two-level namespace.
    pub direct_install_paths: Vec<String>,
    /// `_dylibsToLoad` (§4.6): every install path in load order — direct
    /// dylibs first, in command-line order, then indirect dependencies in
    /// discovery order. A dylib's 1-based position here is its ordinal.
    /// Kept as an explicit `Vec` because `by_install_path` is a `HashMap`
    /// and its key order is not load order.
    load_order: Vec<String>,
}

pub struct DylibNode {
    pub mapped: MappedFile,
    pub install_name: String,
    pub reexports: Vec<String>,
    pub parent_umbrella: Option<String>,
    pub allowable_clients: Vec<String>,
    pub is_direct: bool,
}

impl DylibGraph {
    pub fn new() -> Self {
        DylibGraph { by_install_path: HashMap::new(), direct_install_paths: Vec::new(), load_order: Vec::new() }
    }

    /// Loads `path` (a direct `-lFoo`/path input) and every dylib it
    /// transitively depends on, following `@loader_path`/`@executable_path`
    /// and the configured search paths to a fixed point.
    pub fn load_direct(&mut self, path: &Path, options: &Options) -> Result<()> {
        let resolved = resolve_install_name_to_path(&path.to_string_lossy(), path, options)?;
        let node = self.load_one(&resolved, options, true)?;
        let install_name = node.install_name.clone();
        self.direct_install_paths.push(install_name.clone());
        self.load_order.push(install_name.clone());
        self.by_install_path.insert(install_name, node);
        self.close_fixed_point(options)
    }

    fn load_one(&mut self, path: &Path, options: &Options, is_direct: bool) -> Result<DylibNode> {
        let mapped = MappedFile::open(path)?;
        let slice = mapped.select_arch(options.cputype, options.cpusubtype)?.to_vec();
        let parsed = DylibParser::parse(&slice)?;
        if options.trace.dylibs {
            emit_trace_to("Dylib", path, options.trace.file.as_deref());
        }
        Ok(DylibNode {
            mapped,
            install_name: if parsed.install_name.is_empty() { path.to_string_lossy().into_owned() } else { parsed.install_name },
            reexports: parsed.reexports,
            parent_umbrella: parsed.parent_umbrella,
            allowable_clients: parsed.allowable_clients,
            is_direct,
        })
    }

    fn close_fixed_point(&mut self, options: &Options) -> Result<()> {
        loop {
            let mut to_load = Vec::new();
            for node in self.by_install_path.values() {
                let parser = DylibParser::parse(node.mapped.bytes())?;
                for dep in parser.direct_dependencies.iter().chain(parser.reexports.iter()) {
                    if !self.by_install_path.contains_key(dep) {
                        to_load.push(dep.clone());
                    }
                }
            }
            if to_load.is_empty() {
                break;
            }
            for dep in to_load {
                if self.by_install_path.contains_key(&dep) {
                    continue;
                }
                let resolved_path = resolve_install_name_to_path(&dep, Path::new(&dep), options)?;
                let node = self.load_one(&resolved_path, options, false)?;
                self.load_order.push(dep.clone());
                self.by_install_path.insert(dep, node);
            }
        }
        Ok(())
    }

    /// The client-restriction check from §4.3: permitted iff we are the
    /// umbrella, a sibling under the same umbrella, or our derived client
    /// name is in the dylib's allowable-clients list.
    pub fn client_permitted(&self, dylib_install_path: &str, our_output_name: &str, options: &Options) -> bool {
        let Some(node) = self.by_install_path.get(dylib_install_path) else { return true };
        if node.allowable_clients.is_empty() && node.parent_umbrella.is_none() {
            return true;
        }
        if let Some(client_name) = &options.client_name {
            if node.allowable_clients.iter().any(|c| c == client_name) {
                return true;
            }
        }
        if let Some(umbrella) = &node.parent_umbrella {
            if umbrella == our_output_name {
                return true; // we are building the parent umbrella itself
            }
            let our_client = DylibParser::derived_client_name(our_output_name);
            if umbrella == &our_client {
                return true; // sibling sharing the same umbrella
            }
        }
        let derived = DylibParser::derived_client_name(our_output_name);
        node.allowable_clients.iter().any(|c| c == &derived)
    }

    /// §4.3 `searchLibraries`: consult direct dylibs/archives first, then
    /// indirect dylibs (filtered to implicitly-linked ones in two-level
    /// namespace). Archives are searched by the caller, which owns them;
    /// this only covers the dylib half.
    ///
    /// Also implements §4.6 `compressedOrdinalForAtom`: the proxy atom this
    /// returns is stamped with the ordinal a bind through it should use —
    /// `FLAT_LOOKUP` under flat/forced-flat namespace, otherwise the 1-based
    /// position of the supplying dylib in `_dylibsToLoad`.
    pub fn search_for_proxy(&self, graph: &mut AtomGraph, name: &[u8], options: &Options) -> Result<Option<AtomId>> {
        for (slot, install_path) in self.load_order.iter().enumerate() {
            let Some(node) = self.by_install_path.get(install_path) else { continue };
            let parser = DylibParser::parse(node.mapped.bytes())?;
            let ordinal = if matches!(options.namespace, Namespace::Flat | Namespace::ForcedFlat) {
                crate::fixup::ORDINAL_FLAT_LOOKUP
            } else {
                slot as i64 + 1
            };
            if let Some(id) = parser.synthesize_proxy(graph, name, ordinal)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// §4.3 `searchWeakDefInDylib`: whether any reachable dylib weakly
    /// exports `name`.
    pub fn has_weak_def(&self, name: &[u8]) -> Result<bool> {
        for node in self.by_install_path.values() {
            let parser = DylibParser::parse(node.mapped.bytes())?;
            let mut offset = parser.header.size();
            for _ in 0..parser.header.ncmds {
                let lc = LoadCommand::parse(parser.bytes, &mut offset, parser.ctx.le)?;
                let CommandVariant::Symtab(cmd) = lc.command else { continue };
                let symbols = Symbols::parse(parser.bytes, &cmd, parser.ctx)?;
                for i in 0..symbols.nsyms {
                    let (sym_name, nlist) = symbols.get(i)?;
                    if sym_name.as_bytes() == name && nlist.is_weak_def() {
                        return Ok(true);
                    }
                }
                break;
            }
        }
        Ok(false)
    }
}

impl Default for DylibGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves `@loader_path`/`@executable_path`-relative and bare install
/// names against `-syslibroot`, `-L`/`-F` search paths, and
/// `Options::dylib_file_overrides`, in that priority order.
pub fn resolve_install_name_to_path(install_name: &str, loader_path: &Path, options: &Options) -> Result<PathBuf> {
    for (name, override_path) in &options.dylib_file_overrides {
        if name == install_name {
            return Ok(override_path.clone());
        }
    }
    if let Some(rest) = install_name.strip_prefix("@loader_path") {
        let base = loader_path.parent().unwrap_or_else(|| Path::new("."));
        return Ok(base.join(rest.trim_start_matches('/')));
    }
    if let Some(rest) = install_name.strip_prefix("@executable_path") {
        let base = options.output_path.parent().unwrap_or_else(|| Path::new("."));
        return Ok(base.join(rest.trim_start_matches('/')));
    }
    let direct = Path::new(install_name);
    if direct.is_absolute() && direct.exists() {
        return Ok(direct.to_path_buf());
    }
    for root in &options.syslibroot {
        let candidate = root.join(install_name.trim_start_matches('/'));
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    for dir in options.library_search_paths.iter().chain(options.framework_search_paths.iter()) {
        let candidate = dir.join(Path::new(install_name).file_name().unwrap_or_default());
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    if direct.exists() {
        return Ok(direct.to_path_buf());
    }
    Err(LinkerError::Input(format!("cannot resolve dylib install name '{}'", install_name)))
}

pub fn emit_trace(kind: &str, path: &Path) {
    emit_trace_to(kind, path, None)
}

/// Writes a trace line to `file` (appending) when set, else stderr — the
/// `LD_TRACE_FILE` redirection target for `LD_TRACE_ARCHIVES`/`LD_TRACE_DYLIBS`.
pub fn emit_trace_to(kind: &str, path: &Path, file: Option<&Path>) {
    let line = diagnostics::trace_line(kind, &path.to_string_lossy());
    match file {
        Some(trace_path) => {
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(trace_path) {
                let _ = writeln!(f, "{}", line);
            }
        }
        None => eprintln!("{}", line),
    }
}

/// Looks up `name` in `archive`'s ranlib index and, if found, atomizes the
/// defining member as a fresh object (the "searchArchives" half of
/// `searchLibraries`). `data_only` restricts the search to members whose
/// defining symbol lives in a `__DATA`/`__OBJC`-ish section, mirroring the
/// Objective-C category/selector special case in the original tool.
pub fn search_archive_for(
    archive: &Archive<'_>,
    graph: &mut AtomGraph,
    name: &[u8],
    data_only: bool,
) -> Result<Option<Vec<AtomId>>> {
    let Ok(name_str) = std::str::from_utf8(name) else { return Ok(None) };
    let Some(member) = archive.find_member_defining(name_str) else { return Ok(None) };
    let parser = ObjectParser::new(member.data)?;
    let atoms = parser.atomize(graph)?;
    if data_only {
        let filtered: Vec<AtomId> = atoms
            .into_iter()
            .filter(|&id| !matches!(graph.get(id).content_type, ContentType::Code))
            .collect();
        return Ok(Some(filtered));
    }
    Ok(Some(atoms))
}

/// Synthesizes the handful of marker atoms the driver always creates
/// regardless of input: `__dso_handle`, `__mh_*_header`, `__PAGEZERO`, and
/// (when requested) a custom-sized stack segment.
pub fn synthesize_builtin_atoms(graph: &mut AtomGraph, options: &Options) -> Vec<AtomId> {
    let mut ids = Vec::new();

    let dso_handle = Atom {
        name: b"___dso_handle".to_vec(),
        definition: Definition::Regular,
        scope: Scope::LinkageUnit,
        combine: Combine::Never,
        symbol_table_inclusion: SymbolTableInclusion::In,
        content_type: ContentType::MachHeader,
        section: Section::new("__TEXT", "__mach_header", ContentType::MachHeader),
        alignment: (3, 0),
        size: 0,
        object_address: 0,
        auto_hide: true,
        overrides_dylib_weak_def: false,
        thumb: false,
        weak_imported: false,
        weak_def: false,
        is_lto_temporary: false,
        content: AtomContent::Synthetic(SyntheticKind::DsoHandle),
        fixups: Vec::new(),
        dylib_ordinal: 0,
        group_subordinates: Vec::new(),
    };
    ids.push(graph.alloc(dso_handle));

    let header_name: &[u8] = match options.output_kind {
        crate::options::OutputKind::Dylib => b"___mh_dylib_header",
        crate::options::OutputKind::Bundle => b"___mh_bundle_header",
        crate::options::OutputKind::DynamicLinker => b"___mh_dylinker_header",
        crate::options::OutputKind::Executable => b"___mh_execute_header",
        _ => b"___mh_object_header",
    };
    let mh = Atom {
        name: header_name.to_vec(),
        definition: Definition::Regular,
        scope: Scope::Global,
        combine: Combine::Never,
        symbol_table_inclusion: SymbolTableInclusion::In,
        content_type: ContentType::MachHeader,
        section: Section::new("__TEXT", "__mach_header", ContentType::MachHeader),
        alignment: (3, 0),
        size: 0,
        object_address: 0,
        auto_hide: false,
        overrides_dylib_weak_def: false,
        thumb: false,
        weak_imported: false,
        weak_def: false,
        is_lto_temporary: false,
        content: AtomContent::Synthetic(SyntheticKind::MachHeader),
        fixups: Vec::new(),
        dylib_ordinal: 0,
        group_subordinates: Vec::new(),
    };
    ids.push(graph.alloc(mh));

    if options.pagezero_size > 0 && options.output_kind == crate::options::OutputKind::Executable {
        let pagezero = Atom {
            name: Vec::new(),
            definition: Definition::Regular,
            scope: Scope::TranslationUnit,
            combine: Combine::Never,
            symbol_table_inclusion: SymbolTableInclusion::NotIn,
            content_type: ContentType::ZeroFill,
            section: Section::new("__PAGEZERO", "__pagezero", ContentType::ZeroFill),
            alignment: (12, 0),
            size: options.pagezero_size,
            object_address: 0,
            auto_hide: false,
            overrides_dylib_weak_def: false,
            thumb: false,
            weak_imported: false,
            weak_def: false,
            is_lto_temporary: false,
            content: AtomContent::Synthetic(SyntheticKind::PageZero),
            fixups: Vec::new(),
            dylib_ordinal: 0,
            group_subordinates: Vec::new(),
        };
        ids.push(graph.alloc(pagezero));
    }

    if let Some(size) = options.stack_size {
        let stack = Atom {
            name: b"___stack".to_vec(),
            definition: Definition::Regular,
            scope: Scope::TranslationUnit,
            combine: Combine::Never,
            symbol_table_inclusion: SymbolTableInclusion::NotIn,
            content_type: ContentType::ZeroFill,
            section: Section::new("__UNIXSTACK", "__stack", ContentType::ZeroFill),
            alignment: (12, 0),
            size,
            object_address: options.stack_addr.unwrap_or(0),
            auto_hide: false,
            overrides_dylib_weak_def: false,
            thumb: false,
            weak_imported: false,
            weak_def: false,
            is_lto_temporary: false,
            content: AtomContent::Synthetic(SyntheticKind::CustomStack),
            fixups: Vec::new(),
            dylib_ordinal: 0,
            group_subordinates: Vec::new(),
        };
        ids.push(graph.alloc(stack));
    }

    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rejects_too_small_input() {
        assert!(classify(&[0u8; 2]).is_err());
    }

    #[test]
    fn classify_recognizes_archive_magic() {
        let bytes = archive::MAGIC.to_vec();
        assert_eq!(classify(&bytes).unwrap(), FileKind::Archive);
    }

    #[test]
    fn classify_recognizes_lto_bitcode_magic() {
        let mut bytes = LTO_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert_eq!(classify(&bytes).unwrap(), FileKind::LtoBitcode);
    }

    #[test]
    fn derived_client_name_strips_lib_prefix_and_suffix() {
        assert_eq!(DylibParser::derived_client_name("/usr/lib/libFoo.A.dylib"), "Foo");
        assert_eq!(DylibParser::derived_client_name("/System/Library/Frameworks/Foo.framework/Foo"), "Foo");
    }
}
