//! The driver: ties C1 through C6 together into one `link()` call, per
//! SPEC_FULL.md's module overview. Reads every input, resolves symbols to a
//! fixed point, runs the graph-mutating passes, lays out the image, applies
//! fixups, and writes the result (plus an optional `-map` file).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use scroll::Pwrite;

use crate::archive::Archive;
use crate::atom::{AtomContent, AtomGraph, AtomId, ContentType};
use crate::diagnostics;
use crate::error::{LinkerError, Result};
use crate::fixup::{self, ClassifiedFixup, FixupContext, FixupLocation};
use crate::input::{self, DylibGraph, FileKind, MappedFile, ObjectParser};
use crate::layout;
use crate::mach::cputype::{CPU_TYPE_ARM, CPU_TYPE_X86, CPU_TYPE_X86_64};
use crate::mach::header::{self, Header};
use crate::mach::load_command::*;
use crate::mach::symbols::{N_EXT, N_PEXT};
use crate::mapfile;
use crate::options::{OutputKind, Options, UndefinedMode, UuidMode};
use crate::pass::{
    BranchIslandPass, CompactUnwindPass, DeadStripPass, DtracePass, GotLoadRewritePass, ObjcOptimizationPass,
    OrderFilePass, Pass, StubGenerationPass, TlvLoweringPass,
};
use crate::sections::SectionSorter;
use crate::stabs::{self, ObjectStab};
use crate::symtab::SymbolTable;

/// A direct input file, mapped and classified but not yet atomized — kept
/// alive for the whole link so `Archive<'a>`'s borrowed member slices never
/// dangle.
struct LoadedInput {
    path: PathBuf,
    mapped: MappedFile,
    kind: FileKind,
}

/// Drives one link from a resolved [`Options`] to a written output file.
pub struct Linker {
    options: Options,
}

impl Linker {
    pub fn new(options: Options) -> Self {
        Linker { options }
    }

    pub fn run(&self) -> Result<()> {
        let options = &self.options;

        // --- Phase 0: map every direct input up front. -------------------
        // Stable storage: nothing here is ever reallocated or dropped before
        // `Archive`s borrowing out of `mapped` are done with it.
        let mut loaded: Vec<LoadedInput> = Vec::new();
        for path in &options.inputs {
            let mapped = MappedFile::open(path)?;
            let slice = mapped.select_arch(options.cputype, options.cpusubtype);
            let kind = match slice {
                Ok(bytes) => input::classify(bytes)?,
                Err(err) => {
                    if options.ignore_other_arch_input_files {
                        continue;
                    }
                    return Err(err);
                }
            };
            if options.trace.archives || options.trace.dylibs {
                input::emit_trace_to("Input", path, options.trace.file.as_deref());
            }
            loaded.push(LoadedInput { path: path.clone(), mapped, kind });
        }

        let mut graph = AtomGraph::new();
        let mut symtab = SymbolTable::new(options.commons_mode);
        symtab.ignore_duplicates = options.ignore_duplicates;
        symtab.warn_commons = options.warn_commons;

        // object_paths/atom_objects feed the map file: one ordinal per
        // object file (archive members included) atoms were pulled from.
        let mut object_paths: Vec<String> = Vec::new();
        let mut atom_objects: HashMap<AtomId, usize> = HashMap::new();
        let mut object_stabs: Vec<ObjectStab> = Vec::new();

        let mut insert_atoms = |graph: &mut AtomGraph,
                                 symtab: &mut SymbolTable,
                                 ids: Vec<AtomId>,
                                 object_index: Option<usize>,
                                 atom_objects: &mut HashMap<AtomId, usize>|
         -> Result<()> {
            for id in ids {
                let outcome = symtab.add(graph, id)?;
                if let Some(replaced) = outcome.replaced {
                    mark_coalesced(graph, replaced);
                }
                if let Some(idx) = object_index {
                    atom_objects.insert(id, idx);
                }
            }
            Ok(())
        };

        // --- Phase 1: synthesize marker atoms. ---------------------------
        let builtins = input::synthesize_builtin_atoms(&mut graph, options);
        insert_atoms(&mut graph, &mut symtab, builtins, None, &mut atom_objects)?;

        // --- Phase 2: atomize direct objects, expand archives, load dylibs.
        let mut archives: Vec<(PathBuf, Archive<'_>)> = Vec::new();
        let mut dylib_graph = DylibGraph::new();

        for input in &loaded {
            match input.kind {
                FileKind::Object => {
                    let bytes = input.mapped.select_arch(options.cputype, options.cpusubtype)?;
                    let parser = ObjectParser::new(bytes)?;
                    let ids = parser.atomize(&mut graph)?;
                    let object_index = object_paths.len();
                    object_paths.push(input.path.to_string_lossy().into_owned());
                    object_stabs.push(ObjectStab {
                        path: input.path.to_string_lossy().into_owned().into_bytes(),
                        mtime: mtime_of(&input.path),
                    });
                    insert_atoms(&mut graph, &mut symtab, ids, Some(object_index), &mut atom_objects)?;
                }
                FileKind::Archive => {
                    let bytes = input.mapped.select_arch(options.cputype, options.cpusubtype)?;
                    let archive = Archive::parse(bytes)?;
                    archives.push((input.path.clone(), archive));
                }
                FileKind::Dylib => {
                    dylib_graph.load_direct(&input.path, options)?;
                }
                FileKind::LtoBitcode => {
                    return Err(LinkerError::Input(format!(
                        "{}: LTO bitcode objects are not supported",
                        input.path.display()
                    )));
                }
            }
        }

        // --- Phase 3: just-in-time undefined-symbol resolution. ----------
        // Repeat until a full pass over every archive/dylib adds nothing: an
        // archive member pulled in late may itself reference a name another
        // archive only now needs to supply.
        loop {
            let undefined: Vec<Vec<u8>> = symtab.undefined_names().into_iter().map(|n| n.to_vec()).collect();
            if undefined.is_empty() {
                break;
            }
            let mut made_progress = false;
            for name in &undefined {
                if symtab.lookup(name).and_then(|slot| symtab.resolve_slot(slot)).is_some() {
                    continue;
                }
                let mut found = false;
                for (path, archive) in &archives {
                    if let Some(ids) = input::search_archive_for(archive, &mut graph, name, false)? {
                        if options.trace.archives {
                            input::emit_trace_to("Archive member", path, options.trace.file.as_deref());
                        }
                        let object_index = object_paths.len();
                        object_paths.push(format!("{}({})", path.display(), String::from_utf8_lossy(name)));
                        insert_atoms(&mut graph, &mut symtab, ids, Some(object_index), &mut atom_objects)?;
                        found = true;
                        made_progress = true;
                        break;
                    }
                }
                if found {
                    continue;
                }
                if let Some(id) = dylib_graph.search_for_proxy(&mut graph, name, options)? {
                    insert_atoms(&mut graph, &mut symtab, vec![id], None, &mut atom_objects)?;
                    made_progress = true;
                }
            }
            if !made_progress {
                break;
            }
        }

        // Anything still undefined: apply `-undefined <mode>`.
        let still_undefined: Vec<Vec<u8>> = symtab.undefined_names().into_iter().map(|n| n.to_vec()).collect();
        for name in &still_undefined {
            if symtab.lookup(name).and_then(|slot| symtab.resolve_slot(slot)).is_some() {
                continue;
            }
            match options.undefined_mode {
                UndefinedMode::Error => {
                    return Err(LinkerError::Resolution(format!(
                        "undefined symbol: {}",
                        String::from_utf8_lossy(name)
                    )));
                }
                UndefinedMode::Warning => {
                    diagnostics::warning(&format!("undefined symbol: {}", String::from_utf8_lossy(name)));
                }
                UndefinedMode::Suppress | UndefinedMode::DynamicLookup => {}
            }
        }

        // --- Phase 4: graph-mutating passes, in driver order. -------------
        let passes: Vec<Box<dyn Pass>> = vec![
            Box::new(DeadStripPass),
            Box::new(GotLoadRewritePass),
            Box::new(StubGenerationPass),
            Box::new(TlvLoweringPass),
            Box::new(ObjcOptimizationPass),
            Box::new(CompactUnwindPass),
            Box::new(OrderFilePass),
            Box::new(BranchIslandPass),
            Box::new(DtracePass),
        ];
        for pass in &passes {
            pass.run(&mut graph, options)?;
        }

        // --- Phase 5: section assignment. ---------------------------------
        let mut sorter = SectionSorter::new(options);
        let mut atom_sections_raw: HashMap<AtomId, usize> = HashMap::new();
        for id in graph.live_atoms().collect::<Vec<_>>() {
            let idx = sorter.assign(graph.get(id));
            atom_sections_raw.insert(id, idx);
        }
        let (sections, old_to_new) = sorter.finish();
        let atom_sections: HashMap<AtomId, usize> =
            atom_sections_raw.into_iter().map(|(id, old)| (id, old_to_new[old])).collect();

        // --- Phase 6: layout. ----------------------------------------------
        let computed_layout = layout::run(&mut graph, &atom_sections, &sections, options);

        // --- Phase 7: per-atom placement maps the fixup engine needs. ------
        let mut section_to_segment: HashMap<usize, u32> = HashMap::new();
        for (seg_idx, seg) in computed_layout.segments.iter().enumerate() {
            for &sect_idx in &seg.sections {
                section_to_segment.insert(sect_idx, seg_idx as u32);
            }
        }

        let is_64 = header_is_64(options.cputype);
        let mut section_numbers: HashMap<u32, u8> = HashMap::new();
        for (idx, _) in sections.iter().enumerate() {
            section_numbers.insert(idx as u32, (idx + 1) as u8);
        }

        let mut atom_segments: HashMap<AtomId, u32> = HashMap::new();
        let mut atom_segment_offsets: HashMap<AtomId, u64> = HashMap::new();
        let mut file_offsets: HashMap<AtomId, u64> = HashMap::new();
        for id in graph.live_atoms().collect::<Vec<_>>() {
            let Some(&sect_idx) = atom_sections.get(&id) else { continue };
            let Some(&seg_idx) = section_to_segment.get(&sect_idx) else { continue };
            let seg = &computed_layout.segments[seg_idx as usize];
            let layout_info = graph.layout(id);
            atom_segments.insert(id, seg_idx);
            atom_segment_offsets.insert(id, layout_info.final_address - seg.vmaddr);
            if matches!(graph.get(id).content, AtomContent::Bytes(_)) {
                let section_file_off = computed_layout.section_file_offsets[sect_idx];
                file_offsets.insert(id, section_file_off + layout_info.section_offset);
            }
        }

        // --- Phase 8: assemble the image buffer. ---------------------------
        let mut image = vec![0u8; computed_layout.image_size as usize];

        for id in graph.live_atoms().collect::<Vec<_>>() {
            if let (Some(&off), AtomContent::Bytes(bytes)) = (file_offsets.get(&id), &graph.get(id).content) {
                let off = off as usize;
                image[off..off + bytes.len()].copy_from_slice(bytes);
            }
        }
        nop_fill_gaps(&mut image, &graph, &atom_sections, &sections, &computed_layout, options.cputype);

        // --- Phase 9: STABS. -------------------------------------------------
        let (stabs_records, stabs_byte_len) = if matches!(options.uuid_mode, UuidMode::None) {
            (Vec::new(), 0usize)
        } else {
            let records = stabs::build_object_stabs(&object_stabs);
            let entry_size = if is_64 { 16 } else { 12 };
            (records, records_strtab_len(&records) + records.len() * entry_size)
        };
        let _ = stabs_byte_len;

        // --- Phase 10: build the final symbol/string tables. ------------------
        let (mut records, mut nlocal, mut iextdef, mut iundef) = fixup::build_symbol_table(&graph, &section_numbers);
        let nstabs = stabs_records.len();
        if nstabs > 0 {
            let mut all = stabs_records;
            all.extend(records);
            records = all;
            nlocal += nstabs;
            iextdef += nstabs;
            iundef += nstabs;
        }
        let (symtab_bytes, strtab_bytes) = fixup::encode_symbol_table(&records, is_64, !is_little_endian(options.cputype));

        // --- Phase 11: classify and encode dyld-info fixups. -------------------
        let classified = fixup::classify_pointer_fixups(&graph, &symtab, &atom_segments, &atom_segment_offsets);
        let mut rebase_locations: Vec<FixupLocation> = Vec::new();
        let mut binds_regular: Vec<(FixupLocation, Vec<u8>, i64)> = Vec::new();
        let mut binds_weak: Vec<(FixupLocation, Vec<u8>, i64)> = Vec::new();
        for item in classified {
            match item {
                ClassifiedFixup::Rebase(loc) => rebase_locations.push(loc),
                ClassifiedFixup::Bind { location, symbol, ordinal, weak } => {
                    if weak {
                        binds_weak.push((location, symbol, ordinal));
                    } else {
                        binds_regular.push((location, symbol, ordinal));
                    }
                }
            }
        }
        let rebase_bytes = if rebase_locations.is_empty() { Vec::new() } else { fixup::encode_rebase_info(&rebase_locations) };
        let bind_bytes = if binds_regular.is_empty() { Vec::new() } else { fixup::encode_bind_info(&binds_regular) };
        let weak_bind_bytes = if binds_weak.is_empty() { Vec::new() } else { fixup::encode_bind_info(&binds_weak) };

        // --- Phase 12: place LINKEDIT content. ---------------------------------
        let mut linkedit_off = align_up(computed_layout.image_size, layout::page_size(options.cputype));
        let place = |off: &mut u64, bytes: &[u8]| -> (u32, u32) {
            if bytes.is_empty() {
                return (0, 0);
            }
            let start = *off as u32;
            *off += bytes.len() as u64;
            (start, bytes.len() as u32)
        };
        let emit_dyld_info = !options.output_kind.is_object();
        let (rebase_off, rebase_size) =
            if emit_dyld_info { place(&mut linkedit_off, &rebase_bytes) } else { (0, 0) };
        let (bind_off, bind_size) = if emit_dyld_info { place(&mut linkedit_off, &bind_bytes) } else { (0, 0) };
        let (weak_bind_off, weak_bind_size) =
            if emit_dyld_info { place(&mut linkedit_off, &weak_bind_bytes) } else { (0, 0) };
        let (lazy_bind_off, lazy_bind_size) = (0u32, 0u32);
        let (export_off, export_size) = (0u32, 0u32);
        let (symoff, _symsize) = place(&mut linkedit_off, &symtab_bytes);
        let (stroff, strsize) = place(&mut linkedit_off, &strtab_bytes);
        let linkedit_size = linkedit_off - computed_layout.image_size.min(linkedit_off);

        let mut image = {
            let mut extended = image;
            extended.resize(linkedit_off as usize, 0);
            extended
        };
        if symoff > 0 {
            image[symoff as usize..symoff as usize + symtab_bytes.len()].copy_from_slice(&symtab_bytes);
        }
        if stroff > 0 {
            image[stroff as usize..stroff as usize + strtab_bytes.len()].copy_from_slice(&strtab_bytes);
        }
        if rebase_off > 0 {
            image[rebase_off as usize..rebase_off as usize + rebase_bytes.len()].copy_from_slice(&rebase_bytes);
        }
        if bind_off > 0 {
            image[bind_off as usize..bind_off as usize + bind_bytes.len()].copy_from_slice(&bind_bytes);
        }
        if weak_bind_off > 0 {
            image[weak_bind_off as usize..weak_bind_off as usize + weak_bind_bytes.len()].copy_from_slice(&weak_bind_bytes);
        }

        // --- Phase 13: load commands + mach_header. -----------------------------
        let le = scroll::Endian::Little;
        let mut commands: Vec<u8> = Vec::new();
        let mut ncmds = 0u32;

        for (seg_idx, seg) in computed_layout.segments.iter().enumerate() {
            let nsects = seg.sections.len() as u32;
            let mut sect_bytes = Vec::new();
            for &sect_idx in &seg.sections {
                let section = &sections[sect_idx];
                write_section(
                    &mut sect_bytes,
                    section,
                    computed_layout.section_addrs[sect_idx],
                    computed_layout.section_sizes[sect_idx],
                    computed_layout.section_file_offsets[sect_idx],
                    is_64,
                    le,
                )?;
            }
            if is_64 {
                let cmdsize = SIZEOF_SEGMENT_COMMAND_64 + nsects as usize * SIZEOF_SECTION_64;
                let cmd = SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: cmdsize as u32,
                    segname: segname16(&seg.name),
                    vmaddr: seg.vmaddr,
                    vmsize: seg.vmsize,
                    fileoff: seg.fileoff,
                    filesize: seg.filesize,
                    maxprot: 7,
                    initprot: segment_initprot(&seg.name),
                    nsects,
                    flags: 0,
                };
                commands.pwrite_with(cmd, commands.len(), le)?;
            } else {
                let cmdsize = SIZEOF_SEGMENT_COMMAND_32 + nsects as usize * SIZEOF_SECTION_32;
                let cmd = SegmentCommand32 {
                    cmd: LC_SEGMENT,
                    cmdsize: cmdsize as u32,
                    segname: segname16(&seg.name),
                    vmaddr: seg.vmaddr as u32,
                    vmsize: seg.vmsize as u32,
                    fileoff: seg.fileoff as u32,
                    filesize: seg.filesize as u32,
                    maxprot: 7,
                    initprot: segment_initprot(&seg.name),
                    nsects,
                    flags: 0,
                };
                commands.pwrite_with(cmd, commands.len(), le)?;
            }
            commands.extend_from_slice(&sect_bytes);
            ncmds += 1;
            let _ = seg_idx;
        }

        if emit_dyld_info {
            let cmd = DyldInfoCommand {
                cmd: LC_DYLD_INFO_ONLY,
                cmdsize: SIZEOF_DYLIB_INFO_COMMAND as u32,
                rebase_off,
                rebase_size,
                bind_off,
                bind_size,
                weak_bind_off,
                weak_bind_size,
                lazy_bind_off,
                lazy_bind_size,
                export_off,
                export_size,
            };
            let at = commands.len();
            commands.resize(at + SIZEOF_DYLIB_INFO_COMMAND, 0);
            commands.pwrite_with(cmd, at, le)?;
            ncmds += 1;
        }

        {
            let ndefined = (iundef - iextdef) as u32;
            let nundef = (records.len() - iundef) as u32;
            let cmd = SymtabCommand {
                cmd: LC_SYMTAB,
                cmdsize: SIZEOF_SYMTAB_COMMAND as u32,
                symoff,
                nsyms: records.len() as u32,
                stroff,
                strsize,
            };
            let at = commands.len();
            commands.resize(at + SIZEOF_SYMTAB_COMMAND, 0);
            commands.pwrite_with(cmd, at, le)?;
            ncmds += 1;

            let dysym = DysymtabCommand {
                cmd: LC_DYSYMTAB,
                cmdsize: SIZEOF_DYSYMTAB_COMMAND as u32,
                ilocalsym: 0,
                nlocalsym: nlocal as u32,
                iextdefsym: iextdef as u32,
                nextdefsym: ndefined,
                iundefsym: iundef as u32,
                nundefsym: nundef,
                tocoff: 0,
                ntoc: 0,
                modtaboff: 0,
                nmodtab: 0,
                extrefsymoff: 0,
                nextrefsyms: 0,
                indirectsymoff: 0,
                nindirectsyms: 0,
                extreloff: 0,
                nextrel: 0,
                locreloff: 0,
                nlocrel: 0,
            };
            let at = commands.len();
            commands.resize(at + SIZEOF_DYSYMTAB_COMMAND, 0);
            commands.pwrite_with(dysym, at, le)?;
            ncmds += 1;
        }

        let uuid_bytes_placeholder_at = if matches!(options.uuid_mode, UuidMode::None) {
            None
        } else {
            let cmd = UuidCommand { cmd: LC_UUID, cmdsize: SIZEOF_UUID_COMMAND as u32, uuid: [0u8; 16] };
            let at = commands.len();
            commands.resize(at + SIZEOF_UUID_COMMAND, 0);
            commands.pwrite_with(cmd, at, le)?;
            ncmds += 1;
            Some(at + 8) // offset of the `uuid` field within the command
        };

        let sizeofcmds = commands.len() as u32;
        let header = Header {
            magic: if is_64 { header::MH_MAGIC_64 } else { header::MH_MAGIC },
            cputype: options.cputype,
            cpusubtype: options.cpusubtype,
            filetype: options.output_kind.filetype(),
            ncmds,
            sizeofcmds,
            flags: header_flags(options),
            reserved: 0,
        };
        let header_size = header.size();
        image[0..header_size].copy_from_slice(&{
            let mut buf = vec![0u8; header_size];
            use scroll::ctx::TryIntoCtx;
            header.try_into_ctx(&mut buf[..], header.ctx()?)?;
            buf
        });
        image[header_size..header_size + commands.len()].copy_from_slice(&commands);

        // --- Phase 14: fixups. ---------------------------------------------------
        let ctx = FixupContext { graph: &graph, symtab: &symtab, options, file_offsets: &file_offsets };
        fixup::apply(&mut image, &ctx)?;

        // --- Phase 15: UUID. -------------------------------------------------------
        if let Some(field_offset) = uuid_bytes_placeholder_at {
            let uuid = match options.uuid_mode {
                UuidMode::Content => {
                    let header_offset = header_size + field_offset - header_size; // within commands buffer too, but we index into `image`
                    let _ = header_offset;
                    let mut exclude = Vec::new();
                    if symoff > 0 && nstabs > 0 {
                        // Exclude the STABS N_OSO mtime words: non-deterministic,
                        // workspace-dependent, and not load-bearing for content identity.
                        let entry_size = if is_64 { 16 } else { 12 };
                        exclude.push(symoff as usize..symoff as usize + nstabs * entry_size);
                    }
                    fixup::compute_uuid(&image, &exclude)
                }
                UuidMode::Random => random_uuid(),
                UuidMode::None => unreachable!(),
            };
            image[field_offset..field_offset + 16].copy_from_slice(&uuid);
        }

        // --- Phase 16: write. --------------------------------------------------------
        fixup::write_file(&options.output_path, &image, !options.output_kind.is_object())?;

        if let Some(map_path) = &options.map_path {
            let text = mapfile::render(
                &options.output_path,
                options.cputype,
                &object_paths,
                &sections,
                &computed_layout,
                &graph,
                &atom_objects,
            );
            std::fs::write(map_path, text)?;
        }

        Ok(())
    }
}

fn mark_coalesced(graph: &mut AtomGraph, id: AtomId) {
    if graph.layout(id).coalesced_away {
        return;
    }
    graph.layout_mut(id).coalesced_away = true;
    let subordinates = graph.get(id).group_subordinates.clone();
    for sub in subordinates {
        mark_coalesced(graph, sub);
    }
}

fn mtime_of(path: &Path) -> u32 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn records_strtab_len(records: &[fixup::SymbolRecord]) -> usize {
    1 + records.iter().map(|r| r.name.len() + 1).sum::<usize>()
}

fn header_is_64(cputype: u32) -> bool {
    cputype & crate::mach::cputype::CPU_ARCH_ABI64 != 0
}

fn is_little_endian(_cputype: u32) -> bool {
    // Every cputype this crate targets (x86, x86_64, arm, arm64) is
    // little-endian on Apple platforms; kept as a hook for PPC's big-endian
    // classic relocations, which this crate does not otherwise support.
    true
}

fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

fn segname16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn sectname16(name: &str) -> [u8; 16] {
    segname16(name)
}

fn segment_initprot(name: &str) -> u32 {
    match name {
        "__TEXT" => 5,         // r-x
        "__PAGEZERO" => 0,     // ---
        "__LINKEDIT" => 1,     // r--
        _ => 3,                // rw-
    }
}

fn section_flags(content_type: ContentType) -> u32 {
    use crate::mach::constants::cputype as _unused;
    let _ = _unused::CPU_TYPE_ARM;
    match content_type {
        ContentType::Code => crate::mach::constants::S_ATTR_PURE_INSTRUCTIONS | crate::mach::constants::S_ATTR_SOME_INSTRUCTIONS,
        ContentType::CString => crate::mach::constants::S_CSTRING_LITERALS,
        ContentType::CFString => 0,
        ContentType::UTF16String => crate::mach::constants::S_CSTRING_LITERALS,
        ContentType::Literal4 => crate::mach::constants::S_4BYTE_LITERALS,
        ContentType::Literal8 => crate::mach::constants::S_8BYTE_LITERALS,
        ContentType::Literal16 => crate::mach::constants::S_16BYTE_LITERALS,
        ContentType::NonLazyPointer => crate::mach::constants::S_NON_LAZY_SYMBOL_POINTERS,
        ContentType::LazyPointer => crate::mach::constants::S_LAZY_SYMBOL_POINTERS,
        ContentType::Stub => crate::mach::constants::S_SYMBOL_STUBS,
        ContentType::StubHelper => crate::mach::constants::S_REGULAR,
        ContentType::ZeroFill => crate::mach::constants::S_ZEROFILL,
        ContentType::TlvZeroFill => crate::mach::constants::S_THREAD_LOCAL_ZEROFILL,
        ContentType::Tlv => crate::mach::constants::S_THREAD_LOCAL_REGULAR,
        ContentType::Cfi | ContentType::Lsda | ContentType::CompactUnwind | ContentType::MachHeader
        | ContentType::DyldInfo | ContentType::Unclassified => crate::mach::constants::S_REGULAR,
    }
}

fn write_section(
    out: &mut Vec<u8>,
    section: &crate::sections::FinalSection,
    addr: u64,
    size: u64,
    fileoff: u64,
    is_64: bool,
    le: scroll::Endian,
) -> Result<()> {
    let flags = section_flags(section.content_type);
    let fileoff = if matches!(section.content_type, ContentType::ZeroFill | ContentType::TlvZeroFill) {
        0
    } else {
        fileoff
    };
    if is_64 {
        let sect = Section64 {
            sectname: sectname16(&section.section_name),
            segname: segname16(&section.segment_name),
            addr,
            size,
            offset: fileoff as u32,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };
        let at = out.len();
        out.resize(at + SIZEOF_SECTION_64, 0);
        out.pwrite_with(sect, at, le)?;
    } else {
        let sect = Section32 {
            sectname: sectname16(&section.section_name),
            segname: segname16(&section.segment_name),
            addr: addr as u32,
            size: size as u32,
            offset: fileoff as u32,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags,
            reserved1: 0,
            reserved2: 0,
        };
        let at = out.len();
        out.resize(at + SIZEOF_SECTION_32, 0);
        out.pwrite_with(sect, at, le)?;
    }
    Ok(())
}

fn header_flags(options: &Options) -> u32 {
    let mut flags = header::MH_NOUNDEFS;
    match options.output_kind {
        OutputKind::Executable | OutputKind::Dylib | OutputKind::Bundle => {
            flags = header::MH_DYLDLINK | header::MH_TWOLEVEL;
            if matches!(options.undefined_mode, UndefinedMode::Suppress | UndefinedMode::DynamicLookup) {
                flags &= !header::MH_NOUNDEFS;
            } else {
                flags |= header::MH_NOUNDEFS;
            }
        }
        _ => {}
    }
    flags
}

fn random_uuid() -> [u8; 16] {
    // `-random_uuid`: not content-derived, so it can legitimately change
    // between otherwise-identical links. Seeded from the current time since
    // this crate has no other source of entropy available at link time.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut bytes = [0u8; 16];
    bytes[..16].copy_from_slice(&(nanos as u128).to_le_bytes());
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    bytes
}

/// Fills the gaps layout leaves between atoms within code sections with the
/// architecture's no-op instruction, per SPEC_FULL.md §4.6. Data sections are
/// left zero, matching `ld64`'s own behavior (only `__TEXT,__text`-ish code
/// gets NOP padding; zero bytes elsewhere are indistinguishable from the
/// buffer's initial state).
fn nop_fill_gaps(
    image: &mut [u8],
    graph: &AtomGraph,
    atom_sections: &HashMap<AtomId, usize>,
    sections: &[crate::sections::FinalSection],
    computed_layout: &layout::Layout,
    cputype: u32,
) {
    let mut atoms_by_section: Vec<Vec<AtomId>> = vec![Vec::new(); sections.len()];
    for id in graph.live_atoms() {
        if let Some(&idx) = atom_sections.get(&id) {
            atoms_by_section[idx].push(id);
        }
    }
    for (idx, section) in sections.iter().enumerate() {
        if section.content_type != ContentType::Code {
            continue;
        }
        let mut atoms = atoms_by_section[idx].clone();
        atoms.sort_by_key(|&id| graph.layout(id).section_offset);
        let base_file_off = computed_layout.section_file_offsets[idx];
        let mut cursor = 0u64;
        for &id in &atoms {
            let layout_info = graph.layout(id);
            if layout_info.section_offset > cursor {
                let start = base_file_off + cursor;
                let end = base_file_off + layout_info.section_offset;
                nop_fill(image, start as usize..end as usize, cputype);
            }
            cursor = layout_info.section_offset + graph.get(id).size;
        }
        let section_end = computed_layout.section_sizes[idx];
        if section_end > cursor {
            let start = base_file_off + cursor;
            let end = base_file_off + section_end;
            nop_fill(image, start as usize..end as usize, cputype);
        }
    }
}

fn nop_fill(image: &mut [u8], range: std::ops::Range<usize>, cputype: u32) {
    let Some(slice) = image.get_mut(range.clone()) else { return };
    if cputype == CPU_TYPE_X86_64 || cputype == CPU_TYPE_X86 {
        slice.fill(0x90);
    } else if cputype == CPU_TYPE_ARM {
        let pattern = 0xe1a0_0000u32.to_le_bytes();
        for (i, byte) in slice.iter_mut().enumerate() {
            *byte = pattern[i % 4];
        }
    }
    // Other architectures (ARM64, or anything unrecognized): leave the
    // buffer's initial zero bytes as-is, same as ld64 does for `__TEXT`
    // gaps it doesn't NOP-pad.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segname16_truncates_and_pads() {
        let out = segname16("__TEXT");
        assert_eq!(&out[..6], b"__TEXT");
        assert_eq!(out[6], 0);
    }

    #[test]
    fn nop_fill_writes_x86_nops() {
        let mut image = vec![0u8; 8];
        nop_fill(&mut image, 2..6, CPU_TYPE_X86_64);
        assert_eq!(&image, &[0, 0, 0x90, 0x90, 0x90, 0x90, 0, 0]);
    }

    #[test]
    fn nop_fill_tiles_arm_pattern() {
        let mut image = vec![0u8; 4];
        nop_fill(&mut image, 0..4, CPU_TYPE_ARM);
        assert_eq!(image, 0xe1a0_0000u32.to_le_bytes().to_vec());
    }

    #[test]
    fn header_is_64_detects_abi64_bit() {
        assert!(header_is_64(CPU_TYPE_X86_64));
        assert!(!header_is_64(CPU_TYPE_X86));
    }
}
