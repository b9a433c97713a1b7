//! C6 — the fixup engine: interprets the ~80 [`FixupKind`] operations
//! per atom and writes the result into the final image buffer, plus the
//! LinkEdit encoders (symbol/string table, UUID) that [`crate::mach::writer`]
//! assembles around it.
//!
//! An [`Atom`] is immutable for its whole arena lifetime (see the safety
//! note on [`crate::atom::AtomGraph::get`]), so none of this writes back
//! into the atom graph. Instead every fixup is interpreted against a
//! caller-supplied `image: &mut [u8]` — the output file's bytes, already
//! sized by [`crate::layout::run`] — at the file offset the atom was
//! assigned. A `FixupTarget::PendingName` is resolved against the
//! [`crate::symtab::SymbolTable`] at the moment its fixup runs rather than
//! up front, since there is nowhere on a frozen `Atom` to cache the
//! resolution.

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::atom::{Atom, AtomGraph, AtomId, Binding, Fixup, FixupKind, FixupTarget};
use crate::diagnostics;
use crate::error::{LinkerError, Result};
use crate::mach::symbols::{N_EXT, N_PEXT};
use crate::options::{Options, UndefinedMode};
use crate::symtab::SymbolTable;

/// Per-atom output placement the engine needs in addition to what
/// [`crate::atom::AtomLayout`] already carries: where in the output file
/// buffer the atom's bytes start.
pub struct FixupContext<'a> {
    pub graph: &'a AtomGraph,
    pub symtab: &'a SymbolTable,
    pub options: &'a Options,
    /// `AtomId` -> byte offset into the image buffer its content starts at.
    pub file_offsets: &'a HashMap<AtomId, u64>,
}

impl<'a> FixupContext<'a> {
    fn atom_address(&self, id: AtomId) -> u64 {
        self.graph.layout(id).final_address
    }

    fn section_address(&self, id: AtomId) -> u64 {
        let layout = self.graph.layout(id);
        layout.final_address - layout.section_offset
    }

    /// Resolves a fixup's target to an [`AtomId`], the same way [`Self::resolve`]
    /// does for an address, without needing an undefined-symbol policy
    /// decision. Used for properties of the target atom itself (e.g.
    /// `thumb`) rather than its final address.
    fn resolve_target_atom(&self, fixup: &Fixup) -> Option<AtomId> {
        match fixup.target {
            FixupTarget::None => None,
            FixupTarget::Atom { atom, .. } => Some(atom),
            FixupTarget::PendingName(idx) => {
                let name = self.graph.pending_name(idx);
                self.symtab.lookup(name).and_then(|slot| self.symtab.resolve_slot(slot))
            }
        }
    }

    /// Resolves a fixup's target to a concrete address and addend. Returns
    /// `None` for an unresolved, non-fatal undefined reference (suppressed
    /// or dynamic-lookup modes still need *a* value; this crate writes 0).
    fn resolve(&self, fixup: &Fixup) -> Result<Option<(u64, i64)>> {
        match fixup.target {
            FixupTarget::None => Ok(None),
            FixupTarget::Atom { atom, addend } => Ok(Some((self.atom_address(atom), addend))),
            FixupTarget::PendingName(idx) => {
                let name = self.graph.pending_name(idx);
                let resolved = self
                    .symtab
                    .lookup(name)
                    .and_then(|slot| self.symtab.resolve_slot(slot));
                match resolved {
                    Some(atom) => Ok(Some((self.atom_address(atom), 0))),
                    None => match self.options.undefined_mode {
                        UndefinedMode::Error => Err(LinkerError::Fixup(format!(
                            "undefined symbol for fixup: {}",
                            String::from_utf8_lossy(name)
                        ))),
                        UndefinedMode::Warning => {
                            diagnostics::warning(&format!(
                                "undefined symbol, used by a fixup: {}",
                                String::from_utf8_lossy(name)
                            ));
                            Ok(Some((0, 0)))
                        }
                        UndefinedMode::Suppress | UndefinedMode::DynamicLookup => Ok(Some((0, 0))),
                    },
                }
            }
        }
    }
}

fn store_width(kind: FixupKind) -> usize {
    use FixupKind::*;
    match kind {
        Store8 => 1,
        StoreLittleEndian16 | StoreBigEndian16 | StoreARMLow16 | StoreARMHigh16 | StoreThumbLow16
        | StoreThumbHigh16 => 2,
        StoreLittleEndianLow24of32 | StoreBigEndianLow24of32 => 3,
        StoreLittleEndian32
        | StoreBigEndian32
        | StoreX86BranchPCRel32
        | StoreX86PCRel32
        | StoreX86PCRel32_1
        | StoreX86PCRel32_2
        | StoreX86PCRel32_4
        | StoreX86PCRel32GOTLoad
        | StoreX86PCRel32GOTLoadNowLEA
        | StoreX86PCRel32TLVLoad
        | StoreX86PCRel32TLVLoadNowLEA
        | StoreX86Abs32TLVLoad
        | StoreX86Abs32TLVLoadNowLEA
        | StoreARMBranch24
        | StoreThumbBranch22
        | StoreARMLoad12
        | StorePPCBranch14
        | StorePPCBranch24
        | StorePPCAbsLow14
        | StorePPCAbsLow16
        | StorePPCAbsHigh16
        | StorePPCAbsHigh16AddLow
        | StoreTargetAddressLittleEndian32
        | StoreTargetAddressBigEndian32 => 4,
        StoreLittleEndian64 | StoreBigEndian64 | StoreTargetAddressLittleEndian64
        | StoreTargetAddressBigEndian64 => 8,
        _ => 0,
    }
}

/// Trailing bytes of immediate/opcode already counted toward the x86
/// instruction's end when the disassembler-reported reloc offset isn't at
/// the very end of the instruction (e.g. `mov $imm32, disp32(%rip)` has 4
/// more bytes of immediate after the 4-byte displacement field).
fn x86_pcrel_trailing(kind: FixupKind) -> u64 {
    match kind {
        FixupKind::StoreX86PCRel32_1 => 1,
        FixupKind::StoreX86PCRel32_2 => 2,
        FixupKind::StoreX86PCRel32_4 => 4,
        _ => 0,
    }
}

fn write_bytes_at(image: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
    let end = offset.checked_add(bytes.len()).ok_or_else(|| {
        LinkerError::Fixup("fixup write offset overflow".to_string())
    })?;
    if end > image.len() {
        return Err(LinkerError::Fixup(format!(
            "fixup write at {offset}..{end} is out of bounds for a {}-byte image",
            image.len()
        )));
    }
    image[offset..end].copy_from_slice(bytes);
    Ok(())
}

fn read_u32_at(image: &[u8], offset: usize, big_endian: bool) -> Result<u32> {
    let bytes: [u8; 4] = image
        .get(offset..offset + 4)
        .ok_or_else(|| LinkerError::Fixup("fixup read out of bounds".to_string()))?
        .try_into()
        .unwrap();
    Ok(if big_endian { u32::from_be_bytes(bytes) } else { u32::from_le_bytes(bytes) })
}

/// Rewrites the x86 `mov` opcode byte of a GOT/TLV-load fixup's instruction
/// into `lea` (`0x8B` -> `0x8D`), per §6's "NowLEA" variants. The opcode
/// sits two bytes before the displacement field this fixup targets: a
/// `mod=00, rm=101` (RIP-relative) ModRM byte is always between them, and
/// that byte is identical for `mov` and `lea`, so only the opcode changes.
/// Fails if the byte found there is not the mov opcode this optimization
/// expects to have left behind.
fn rewrite_mov_to_lea(image: &mut [u8], file_offset: usize) -> Result<()> {
    let opcode_offset = file_offset
        .checked_sub(2)
        .ok_or_else(|| LinkerError::Fixup("GOT/TLV-load-to-LEA rewrite has no preceding opcode byte".to_string()))?;
    let opcode = *image
        .get(opcode_offset)
        .ok_or_else(|| LinkerError::Fixup("GOT/TLV-load-to-LEA rewrite opcode byte is out of bounds".to_string()))?;
    const MOV_RM_TO_REG: u8 = 0x8B;
    const LEA: u8 = 0x8D;
    if opcode != MOV_RM_TO_REG {
        return Err(LinkerError::Fixup(format!(
            "GOT/TLV-load-to-LEA rewrite expected a {MOV_RM_TO_REG:#04x} mov opcode at offset {opcode_offset}, found {opcode:#04x}"
        )));
    }
    image[opcode_offset] = LEA;
    Ok(())
}

fn apply_store(
    image: &mut [u8],
    file_offset: usize,
    kind: FixupKind,
    pc: u64,
    value: i64,
    target_thumb: bool,
) -> Result<()> {
    use FixupKind::*;
    let width = store_width(kind);
    match kind {
        Store8 => write_bytes_at(image, file_offset, &[(value as i8 as u8)]),
        StoreLittleEndian16 | StoreARMLow16 | StoreThumbLow16 => {
            write_bytes_at(image, file_offset, &(value as i16 as u16).to_le_bytes())
        }
        StoreBigEndian16 | StoreARMHigh16 | StoreThumbHigh16 => {
            write_bytes_at(image, file_offset, &(value as i16 as u16).to_be_bytes())
        }
        StoreLittleEndianLow24of32 => {
            let v = (value as u32) & 0x00FF_FFFF;
            write_bytes_at(image, file_offset, &v.to_le_bytes()[..3])
        }
        StoreBigEndianLow24of32 => {
            let v = (value as u32) & 0x00FF_FFFF;
            write_bytes_at(image, file_offset, &v.to_be_bytes()[1..])
        }
        StoreLittleEndian32 | StoreTargetAddressLittleEndian32 => {
            write_bytes_at(image, file_offset, &(value as u32).to_le_bytes())
        }
        StoreBigEndian32 | StoreTargetAddressBigEndian32 => {
            write_bytes_at(image, file_offset, &(value as u32).to_be_bytes())
        }
        StoreLittleEndian64 | StoreTargetAddressLittleEndian64 => {
            write_bytes_at(image, file_offset, &(value as u64).to_le_bytes())
        }
        StoreBigEndian64 | StoreTargetAddressBigEndian64 => {
            write_bytes_at(image, file_offset, &(value as u64).to_be_bytes())
        }
        StoreX86Abs32TLVLoad => write_bytes_at(image, file_offset, &(value as u32).to_le_bytes()),
        StoreX86Abs32TLVLoadNowLEA => {
            rewrite_mov_to_lea(image, file_offset)?;
            write_bytes_at(image, file_offset, &(value as u32).to_le_bytes())
        }
        StoreX86BranchPCRel32
        | StoreX86PCRel32
        | StoreX86PCRel32_1
        | StoreX86PCRel32_2
        | StoreX86PCRel32_4
        | StoreX86PCRel32GOTLoad
        | StoreX86PCRel32TLVLoad => {
            let trailing = x86_pcrel_trailing(kind) as i64;
            let disp = value - (pc as i64 + 4 + trailing);
            write_bytes_at(image, file_offset, &(disp as i32 as u32).to_le_bytes())
        }
        StoreX86PCRel32GOTLoadNowLEA | StoreX86PCRel32TLVLoadNowLEA => {
            rewrite_mov_to_lea(image, file_offset)?;
            let trailing = x86_pcrel_trailing(kind) as i64;
            let disp = value - (pc as i64 + 4 + trailing);
            write_bytes_at(image, file_offset, &(disp as i32 as u32).to_le_bytes())
        }
        StoreARMBranch24 => {
            let delta = value - (pc as i64 + 8);
            if target_thumb {
                // BLX (immediate), A1 encoding: interworking call into Thumb.
                // H is bit 1 of the delta; bit 0 is always 0 (Thumb targets
                // this crate tracks are halfword-aligned instruction starts).
                let h = ((delta >> 1) & 1) as u32;
                let imm24 = ((delta >> 2) as u32) & 0x00FF_FFFF;
                let word = 0xFA00_0000 | (h << 24) | imm24;
                write_bytes_at(image, file_offset, &word.to_le_bytes())
            } else {
                let disp = delta >> 2;
                let word = read_u32_at(image, file_offset, false)?;
                let word = (word & 0xFF00_0000) | ((disp as u32) & 0x00FF_FFFF);
                write_bytes_at(image, file_offset, &word.to_le_bytes())
            }
        }
        StoreThumbBranch22 => {
            // T2 BL/BLX: calling ARM code needs the BLX suffix (bit 12 of the
            // second halfword cleared) and a target aligned on `PC & ~3`,
            // since BLX always lands on a word boundary; BL keeps the odd
            // Thumb PC as-is.
            let pc_plus4 = pc as i64 + 4;
            let base = if target_thumb { pc_plus4 } else { pc_plus4 & !0x3 };
            let disp = value - base;
            let disp = if target_thumb { disp } else { disp & !1 };
            let s = ((disp >> 22) & 1) as u32;
            let imm10 = ((disp >> 12) & 0x3FF) as u32;
            let imm11 = ((disp >> 1) & 0x7FF) as u32;
            let j1 = (((disp >> 22) ^ (disp >> 23)) & 1) as u32 ^ s;
            let j2 = (((disp >> 21) ^ (disp >> 23)) & 1) as u32 ^ s;
            let lo_op: u32 = if target_thumb { 0xD000 } else { 0xC000 };
            let hi = 0xF000 | (s << 10) | imm10;
            let lo = lo_op | (j1 << 13) | (j2 << 11) | imm11;
            write_bytes_at(image, file_offset, &(hi as u16).to_le_bytes())?;
            write_bytes_at(image, file_offset + 2, &(lo as u16).to_le_bytes())
        }
        StoreARMLoad12 => {
            let disp = value - (pc as i64 + 8);
            let word = read_u32_at(image, file_offset, false)?;
            let neg = disp < 0;
            let imm = disp.unsigned_abs() as u32 & 0xFFF;
            let word = (word & !0x00FF_FFFFu32) | imm | if neg { 0 } else { 1 << 23 };
            write_bytes_at(image, file_offset, &word.to_le_bytes())
        }
        StorePPCBranch14 => {
            let disp = value - pc as i64;
            let word = read_u32_at(image, file_offset, true)?;
            let word = (word & 0xFFFF_0003) | ((disp as u32) & 0xFFFC);
            write_bytes_at(image, file_offset, &word.to_be_bytes())
        }
        StorePPCBranch24 => {
            let disp = value - pc as i64;
            let word = read_u32_at(image, file_offset, true)?;
            let word = (word & 0xFC00_0003) | ((disp as u32) & 0x03FF_FFFC);
            write_bytes_at(image, file_offset, &word.to_be_bytes())
        }
        StorePPCAbsLow14 => {
            let word = read_u32_at(image, file_offset, true)?;
            let word = (word & 0xFFFF_0003) | ((value as u32) & 0xFFFC);
            write_bytes_at(image, file_offset, &word.to_be_bytes())
        }
        StorePPCAbsLow16 | StorePPCAbsHigh16AddLow => {
            write_bytes_at(image, file_offset, &(value as u16).to_be_bytes())
        }
        StorePPCAbsHigh16 => {
            write_bytes_at(image, file_offset, &((value >> 16) as u16).to_be_bytes())
        }
        _ => {
            let _ = width;
            Ok(())
        }
    }
}

/// Applies every fixup on every live atom into `image`, writing at the file
/// offset [`FixupContext::file_offsets`] gives each atom. Atoms without an
/// entry (coalesced away, or `AtomContent::Proxy`/`ZeroFill` with nothing to
/// patch) are skipped.
pub fn apply(image: &mut [u8], ctx: &FixupContext) -> Result<()> {
    for id in ctx.graph.live_atoms() {
        let Some(&base) = ctx.file_offsets.get(&id) else {
            continue;
        };
        apply_atom(image, id, base, ctx)?;
    }
    Ok(())
}

fn apply_atom(image: &mut [u8], id: AtomId, base: u64, ctx: &FixupContext) -> Result<()> {
    let atom: &Atom = ctx.graph.get(id);
    let mut i = 0;
    while i < atom.fixups.len() {
        let start = i;
        while i < atom.fixups.len() && !atom.fixups[i].cluster.is_last() {
            i += 1;
        }
        if i < atom.fixups.len() {
            i += 1;
        }
        apply_cluster(image, id, base, &atom.fixups[start..i], ctx)?;
    }
    Ok(())
}

fn apply_cluster(
    image: &mut [u8],
    id: AtomId,
    base: u64,
    cluster: &[Fixup],
    ctx: &FixupContext,
) -> Result<()> {
    use FixupKind::*;
    let mut accumulator: i64 = 0;
    let atom_address = ctx.atom_address(id);

    for fixup in cluster {
        if fixup.binding == Binding::None && matches!(fixup.kind, DtraceNop | DtraceZeroClear) {
            // No pass currently rewrites dtrace probe sites; leave content as-is.
            continue;
        }
        match fixup.kind {
            SetTargetAddress => {
                let (addr, addend) = ctx.resolve(fixup)?.unwrap_or((0, 0));
                accumulator = addr as i64 + addend;
            }
            SetTargetImageOffset => {
                let (addr, addend) = ctx.resolve(fixup)?.unwrap_or((0, 0));
                accumulator = addr as i64 + addend - ctx.options.pagezero_size as i64;
            }
            SetTargetSectionOffset => {
                let (addr, addend) = ctx.resolve(fixup)?.unwrap_or((0, 0));
                let section_base = if let FixupTarget::Atom { atom, .. } = fixup.target {
                    ctx.section_address(atom)
                } else {
                    ctx.section_address(id)
                };
                accumulator = addr as i64 + addend - section_base as i64;
            }
            SetTargetTLVTemplateOffset => {
                let (addr, addend) = ctx.resolve(fixup)?.unwrap_or((0, 0));
                accumulator = addr as i64 + addend;
            }
            SetLazyOffset => {
                accumulator = 0;
            }
            SubtractTargetAddress => {
                let (addr, addend) = ctx.resolve(fixup)?.unwrap_or((0, 0));
                accumulator -= addr as i64 + addend;
            }
            AddAddend => {
                if let FixupTarget::Atom { addend, .. } = fixup.target {
                    accumulator += addend;
                }
            }
            SubtractAddend => {
                if let FixupTarget::Atom { addend, .. } = fixup.target {
                    accumulator -= addend;
                }
            }
            LazyTarget => {}
            kind if kind.is_store() => {
                let pc = atom_address + fixup.offset_in_atom as u64;
                let value = if matches!(fixup.target, FixupTarget::None) && !fixup.content_addend_only
                {
                    accumulator
                } else if fixup.content_addend_only || fixup.content_delta_to_addend_only {
                    // A classic relocation (or the x86_64 external-reloc path)
                    // already carries the target; only the addend lives here.
                    match fixup.target {
                        FixupTarget::Atom { addend, .. } => addend,
                        _ => accumulator,
                    }
                } else {
                    let (addr, addend) = ctx.resolve(fixup)?.unwrap_or((0, 0));
                    addr as i64 + addend
                };
                let target_thumb = ctx.resolve_target_atom(fixup).is_some_and(|a| ctx.graph.get(a).thumb);
                let kind = if ctx.graph.layout(id).reduced_to_lea.contains(&fixup.offset_in_atom) {
                    match kind {
                        StoreX86PCRel32GOTLoad => StoreX86PCRel32GOTLoadNowLEA,
                        StoreX86PCRel32TLVLoad => StoreX86PCRel32TLVLoadNowLEA,
                        StoreX86Abs32TLVLoad => StoreX86Abs32TLVLoadNowLEA,
                        other => other,
                    }
                } else {
                    kind
                };
                apply_store(image, base as usize + fixup.offset_in_atom as usize, kind, pc, value, target_thumb)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// One finished symbol-table entry, prior to width-specific encoding.
pub struct SymbolRecord {
    pub name: Vec<u8>,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

fn nlist_flags(atom: &Atom, section_index: u8) -> (u8, u8, u16) {
    use crate::atom::{Definition, Scope, SymbolTableInclusion};
    use crate::mach::symbols::{N_ABS, N_SECT, N_UNDF, N_WEAK_DEF, N_WEAK_REF};

    let mut n_type = 0u8;
    let mut n_sect = 0u8;
    let mut n_desc = 0u16;

    match atom.definition {
        Definition::Proxy => n_type |= N_UNDF,
        Definition::Absolute => n_type |= N_ABS,
        Definition::Regular | Definition::Tentative => {
            n_type |= N_SECT;
            n_sect = section_index;
        }
    }
    match atom.scope {
        Scope::TranslationUnit => {}
        Scope::LinkageUnit => {
            n_type |= N_EXT;
            n_type |= N_PEXT;
        }
        Scope::Global => n_type |= N_EXT,
    }
    if matches!(atom.symbol_table_inclusion, SymbolTableInclusion::InAsAbsolute) {
        n_type = N_ABS | (n_type & N_EXT);
    }
    if atom.weak_def {
        n_desc |= N_WEAK_DEF;
    }
    if atom.weak_imported {
        n_desc |= N_WEAK_REF;
    }
    (n_type, n_sect, n_desc)
}

/// Builds the final symbol table (local symbols first, then defined
/// externals, then undefined externals — the order `dysymtab` indexes
/// into) and the matching string table. `section_of` maps an atom's final
/// section index (as assigned by [`crate::sections::SectionSorter`]) to its
/// 1-based Mach-O section number.
pub fn build_symbol_table(
    graph: &AtomGraph,
    section_numbers: &HashMap<u32, u8>,
) -> (Vec<SymbolRecord>, usize, usize, usize) {
    use crate::atom::{Definition, SymbolTableInclusion};

    let mut locals = Vec::new();
    let mut defined_externs = Vec::new();
    let mut undefined_externs = Vec::new();

    for id in graph.live_atoms() {
        let atom = graph.get(id);
        if matches!(atom.symbol_table_inclusion, SymbolTableInclusion::NotIn | SymbolTableInclusion::NotInFinalImage)
        {
            continue;
        }
        if atom.name.is_empty() {
            continue;
        }
        let section_index = graph
            .layout(id)
            .final_section
            .and_then(|s| section_numbers.get(&s).copied())
            .unwrap_or(0);
        let (n_type, n_sect, n_desc) = nlist_flags(atom, section_index);
        let record = SymbolRecord {
            name: atom.name.clone(),
            n_type,
            n_sect,
            n_desc,
            n_value: if matches!(atom.definition, Definition::Proxy) {
                0
            } else {
                graph.layout(id).final_address
            },
        };
        if matches!(atom.definition, Definition::Proxy) {
            undefined_externs.push(record);
        } else if n_type & N_EXT != 0 {
            defined_externs.push(record);
        } else {
            locals.push(record);
        }
    }

    defined_externs.sort_by(|a, b| a.name.cmp(&b.name));
    undefined_externs.sort_by(|a, b| a.name.cmp(&b.name));

    let ilocal = 0;
    let nlocal = locals.len();
    let iextdef = nlocal;
    let nextdef = defined_externs.len();
    let iundef = iextdef + nextdef;

    let mut all = locals;
    all.extend(defined_externs);
    all.extend(undefined_externs);
    let _ = ilocal;
    (all, nlocal, iextdef, iundef)
}

/// Serializes `records` into a `(symtab_bytes, strtab_bytes)` pair for the
/// given pointer width, string table starting with a leading NUL (as every
/// stripped symbol's `n_strx == 0` implies).
pub fn encode_symbol_table(records: &[SymbolRecord], is_64: bool, big_endian: bool) -> (Vec<u8>, Vec<u8>) {
    use crate::mach::symbols::{Nlist32, Nlist64};
    use scroll::Pwrite;

    let le = if big_endian { scroll::Endian::Big } else { scroll::Endian::Little };
    let mut strtab = vec![0u8];
    let mut offsets = Vec::with_capacity(records.len());
    for record in records {
        offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(&record.name);
        strtab.push(0);
    }

    let entry_size = if is_64 { 16 } else { 12 };
    let mut symtab = vec![0u8; entry_size * records.len()];
    for (i, record) in records.iter().enumerate() {
        let off = i * entry_size;
        if is_64 {
            let nlist = Nlist64 {
                n_strx: offsets[i],
                n_type: record.n_type,
                n_sect: record.n_sect,
                n_desc: record.n_desc,
                n_value: record.n_value,
            };
            symtab.pwrite_with(nlist, off, le).expect("fixed-size nlist64 write");
        } else {
            let nlist = Nlist32 {
                n_strx: offsets[i],
                n_type: record.n_type,
                n_sect: record.n_sect,
                n_desc: record.n_desc,
                n_value: record.n_value as u32,
            };
            symtab.pwrite_with(nlist, off, le).expect("fixed-size nlist32 write");
        }
    }
    (symtab, strtab)
}

/// A half-open byte range within the image to exclude from the UUID's MD5
/// input, for STABS debug notes whose content (a source path, a mtime)
/// would otherwise make the UUID depend on the build environment rather
/// than the link inputs.
pub type ExcludedRange = std::ops::Range<usize>;

/// Computes the content-derived UUID per SPEC_FULL.md §4.9: an MD5 digest of
/// the whole image with `exclude` ranges skipped, then RFC 4122 v3 bits
/// forced into the digest so the result reads as a valid (if non-random)
/// UUID.
pub fn compute_uuid(image: &[u8], exclude: &[ExcludedRange]) -> [u8; 16] {
    let mut hasher = Md5::new();
    let mut cursor = 0usize;
    let mut ranges: Vec<&ExcludedRange> = exclude.iter().collect();
    ranges.sort_by_key(|r| r.start);
    for range in ranges {
        let start = range.start.min(image.len());
        let end = range.end.min(image.len()).max(start);
        if start > cursor {
            hasher.update(&image[cursor..start]);
        }
        cursor = cursor.max(end);
    }
    if cursor < image.len() {
        hasher.update(&image[cursor..]);
    }
    let digest = hasher.finalize();
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&digest[..16]);
    uuid[6] = (uuid[6] & 0x0F) | 0x30; // version 3 (name-based MD5)
    uuid[8] = (uuid[8] & 0x3F) | 0x80; // RFC 4122 variant
    uuid
}

/// One pointer-sized location in an output segment that dyld must act on
/// at load time, identified the way the compressed dyld-info opcode stream
/// addresses it: by segment index (into the final segment table) plus a
/// byte offset from that segment's start.
#[derive(Debug, Clone, Copy)]
pub struct FixupLocation {
    pub segment_index: u32,
    pub segment_offset: u64,
}

/// A location dyld must rewrite at load time: rebased (slid by the image's
/// load bias) or bound (resolved against a dylib's export).
pub enum ClassifiedFixup {
    Rebase(FixupLocation),
    Bind {
        location: FixupLocation,
        symbol: Vec<u8>,
        ordinal: i64,
        weak: bool,
    },
}

const REBASE_TYPE_POINTER: u8 = 1;
const BIND_TYPE_POINTER: u8 = 1;

/// `compressedOrdinalForAtom` specials (§4.6), alongside the normal 1-based
/// `_dylibsToLoad` positions `input::DylibGraph::search_for_proxy` assigns.
pub const ORDINAL_SELF: i64 = 0;
pub const ORDINAL_MAIN_EXECUTABLE: i64 = -1;
pub const ORDINAL_FLAT_LOOKUP: i64 = -2;

/// Walks every live atom's pointer-width store fixups and classifies each
/// as a rebase (points at another atom defined in this image) or a bind
/// (points at a `Definition::Proxy`, i.e. a dylib import). Fixups that
/// resolved through `content_addend_only`/classic relocations are skipped:
/// those are already fully described by the relocation entries this crate
/// emits when `-keep_relocs` is set.
pub fn classify_pointer_fixups(
    graph: &AtomGraph,
    symtab: &SymbolTable,
    atom_segments: &HashMap<AtomId, u32>,
    atom_segment_offsets: &HashMap<AtomId, u64>,
) -> Vec<ClassifiedFixup> {
    use crate::atom::Definition;

    let mut out = Vec::new();
    for id in graph.live_atoms() {
        let atom = graph.get(id);
        let (Some(&segment_index), Some(&atom_offset)) =
            (atom_segments.get(&id), atom_segment_offsets.get(&id))
        else {
            continue;
        };
        for fixup in &atom.fixups {
            if !matches!(
                fixup.kind,
                FixupKind::StoreTargetAddressLittleEndian64
                    | FixupKind::StoreTargetAddressBigEndian64
                    | FixupKind::StoreTargetAddressLittleEndian32
                    | FixupKind::StoreTargetAddressBigEndian32
            ) {
                continue;
            }
            if fixup.content_addend_only || fixup.content_delta_to_addend_only {
                continue;
            }
            let target = match fixup.target {
                FixupTarget::Atom { atom, .. } => Some(atom),
                FixupTarget::PendingName(idx) => {
                    let name = graph.pending_name(idx);
                    symtab.lookup(name).and_then(|slot| symtab.resolve_slot(slot))
                }
                FixupTarget::None => None,
            };
            let Some(target) = target else { continue };
            let location = FixupLocation {
                segment_index,
                segment_offset: atom_offset + fixup.offset_in_atom as u64,
            };
            let target_atom = graph.get(target);
            if matches!(target_atom.definition, Definition::Proxy) {
                out.push(ClassifiedFixup::Bind {
                    location,
                    symbol: target_atom.name.clone(),
                    ordinal: target_atom.dylib_ordinal,
                    weak: target_atom.weak_imported,
                });
            } else {
                out.push(ClassifiedFixup::Rebase(location));
            }
        }
    }
    out
}

fn uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encodes `locations` as a compressed dyld rebase-info opcode stream
/// (`REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB` / `_DO_REBASE_ULEB_TIMES(1)`
/// per entry). Not the most compact encoding dyld itself would produce
/// (which runs-length-encodes consecutive pointer-sized locations), but a
/// valid one any `dyld` can walk.
pub fn encode_rebase_info(locations: &[FixupLocation]) -> Vec<u8> {
    const REBASE_OPCODE_DONE: u8 = 0x00;
    const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
    const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
    const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x40;

    let mut out = Vec::new();
    out.push(REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER);
    for loc in locations {
        out.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | (loc.segment_index as u8 & 0x0F));
        uleb128(&mut out, loc.segment_offset);
        out.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
    }
    out.push(REBASE_OPCODE_DONE);
    out
}

/// Encodes `binds` as a compressed dyld bind-info opcode stream. `binds`
/// should already be filtered to one binding strength (regular vs. weak);
/// the caller is responsible for routing `ClassifiedFixup::Bind { weak: true,
/// .. }` entries to `weak_bind_off`/`weak_bind_size` instead.
pub fn encode_bind_info(binds: &[(FixupLocation, Vec<u8>, i64)]) -> Vec<u8> {
    const BIND_OPCODE_DONE: u8 = 0x00;
    const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
    const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
    const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
    const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
    const BIND_OPCODE_DO_BIND: u8 = 0x90;

    let mut out = Vec::new();
    for (loc, symbol, ordinal) in binds {
        out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | (*ordinal as u8 & 0x0F));
        out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        out.extend_from_slice(symbol);
        out.push(0);
        out.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | (loc.segment_index as u8 & 0x0F));
        uleb128(&mut out, loc.segment_offset);
        out.push(BIND_OPCODE_DO_BIND);
    }
    out.push(BIND_OPCODE_DONE);
    out
}

/// Writes the assembled image to `path`, replacing any existing file.
/// `executable` selects the mode: `0o755` for a loadable image, `0o644` for
/// a relocatable object nothing ever executes directly.
pub fn write_file(path: &std::path::Path, image: &[u8], executable: bool) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(image)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(if executable { 0o777 } else { 0o666 });
        file.set_permissions(perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_little_endian_32_writes_value() {
        let mut image = vec![0u8; 8];
        apply_store(&mut image, 0, FixupKind::StoreLittleEndian32, 0, 0x1020_3040, false).unwrap();
        assert_eq!(&image[..4], &0x1020_3040u32.to_le_bytes());
    }

    #[test]
    fn x86_pcrel32_computes_displacement() {
        let mut image = vec![0u8; 8];
        // pc = 0x1000, instruction end at pc+4 = 0x1004, target = 0x2000.
        apply_store(&mut image, 0, FixupKind::StoreX86PCRel32, 0x1000, 0x2000, false).unwrap();
        let disp = i32::from_le_bytes(image[..4].try_into().unwrap());
        assert_eq!(disp, 0x2000 - 0x1004);
    }

    #[test]
    fn got_load_now_lea_rewrites_mov_to_lea_and_stores_direct_displacement() {
        // `movq _g@GOTPCREL(%rip), %rax` — opcode 0x8B immediately precedes
        // the 4-byte displacement field this fixup targets.
        let mut image = vec![0x48, 0x8B, 0x05, 0, 0, 0, 0];
        apply_store(&mut image, 3, FixupKind::StoreX86PCRel32GOTLoadNowLEA, 0x1000, 0x2000, false).unwrap();
        assert_eq!(image[1], 0x8D, "mov opcode should have been rewritten to lea");
        let disp = i32::from_le_bytes(image[3..7].try_into().unwrap());
        assert_eq!(disp, 0x2000 - (0x1000 + 4));
    }

    #[test]
    fn got_load_now_lea_rejects_unexpected_preceding_opcode() {
        let mut image = vec![0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
        let result = apply_store(&mut image, 3, FixupKind::StoreX86PCRel32GOTLoadNowLEA, 0x1000, 0x2000, false);
        assert!(result.is_err());
    }

    #[test]
    fn arm_branch24_selects_blx_for_thumb_target() {
        let mut image = 0xEB00_0000u32.to_le_bytes().to_vec();
        apply_store(&mut image, 0, FixupKind::StoreARMBranch24, 0x1000, 0x2002, true).unwrap();
        let word = u32::from_le_bytes(image[..4].try_into().unwrap());
        assert_eq!(word >> 24, 0xFB, "blx with H=1 for an odd-bit-1 delta");
    }

    #[test]
    fn arm_branch24_keeps_bl_for_arm_target() {
        let mut image = 0xEB00_0000u32.to_le_bytes().to_vec();
        apply_store(&mut image, 0, FixupKind::StoreARMBranch24, 0x1000, 0x2000, false).unwrap();
        let word = u32::from_le_bytes(image[..4].try_into().unwrap());
        assert_eq!(word >> 24, 0xEB, "condition/opcode byte preserved for a same-mode bl");
    }

    #[test]
    fn thumb_branch22_selects_blx_suffix_for_arm_target() {
        let mut image = vec![0u8; 4];
        apply_store(&mut image, 0, FixupKind::StoreThumbBranch22, 0x1000, 0x2000, false).unwrap();
        let lo = u16::from_le_bytes(image[2..4].try_into().unwrap());
        assert_eq!(lo & 0x1000, 0, "BLX suffix clears bit 12");
    }

    #[test]
    fn thumb_branch22_keeps_bl_suffix_for_thumb_target() {
        let mut image = vec![0u8; 4];
        apply_store(&mut image, 0, FixupKind::StoreThumbBranch22, 0x1000, 0x2001, true).unwrap();
        let lo = u16::from_le_bytes(image[2..4].try_into().unwrap());
        assert_eq!(lo & 0x1000, 0x1000, "BL suffix keeps bit 12 set");
    }

    #[test]
    fn rebase_info_ends_with_done_opcode() {
        let locs = vec![FixupLocation { segment_index: 1, segment_offset: 0x40 }];
        let encoded = encode_rebase_info(&locs);
        assert_eq!(*encoded.last().unwrap(), 0x00);
        assert_eq!(encoded[0], 0x10 | REBASE_TYPE_POINTER);
    }

    #[test]
    fn bind_info_embeds_symbol_name() {
        let locs = vec![(FixupLocation { segment_index: 0, segment_offset: 8 }, b"_foo".to_vec(), 1i64)];
        let encoded = encode_bind_info(&locs);
        assert!(encoded.windows(4).any(|w| w == b"_foo"));
        assert_eq!(*encoded.last().unwrap(), 0x00);
    }

    #[test]
    fn compute_uuid_excludes_stabs_range() {
        let image = vec![1u8; 64];
        let with_exclusion = compute_uuid(&image, &[10..20]);
        let mut different = image.clone();
        for b in &mut different[10..20] {
            *b = 0xFF;
        }
        let with_exclusion_2 = compute_uuid(&different, &[10..20]);
        assert_eq!(with_exclusion, with_exclusion_2);
        assert_eq!(with_exclusion[6] & 0xF0, 0x30);
        assert_eq!(with_exclusion[8] & 0xC0, 0x80);
    }

    #[test]
    fn compute_uuid_changes_when_included_bytes_change() {
        let image = vec![1u8; 64];
        let mut different = image.clone();
        different[40] = 0xFF;
        assert_ne!(compute_uuid(&image, &[]), compute_uuid(&different, &[]));
    }
}
