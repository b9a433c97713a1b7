//! C5 — layout: the three-pass address/offset assignment described in
//! SPEC_FULL.md §4.5. Consumes the [`crate::sections::FinalSection`] table
//! [`crate::sections::SectionSorter`] built and writes each live atom's
//! [`crate::atom::AtomLayout`] in place.

use std::collections::HashMap;

use crate::atom::{AtomGraph, AtomId, ContentType};
use crate::mach::cputype::CPU_TYPE_ARM64;
use crate::options::{OutputKind, Options};
use crate::sections::FinalSection;

/// Minimum size ld64 reserves for load commands before spilling into the
/// first code section, regardless of how few load commands are actually
/// emitted.
const MINIMUM_HEADER_PAD: u64 = 0x20;
const MAXPATHLEN: u64 = 1024;

pub fn page_size(cputype: u32) -> u64 {
    if cputype == CPU_TYPE_ARM64 {
        0x4000
    } else {
        0x1000
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

/// One output segment: its address/size/file-offset window plus the
/// indices (into the sorted `FinalSection` table) of the sections it owns.
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<usize>,
}

pub struct Layout {
    pub segments: Vec<SegmentLayout>,
    pub section_addrs: Vec<u64>,
    pub section_file_offsets: Vec<u64>,
    pub section_sizes: Vec<u64>,
    pub header_pad: u64,
    pub image_size: u64,
}

fn is_no_disk_space(content_type: ContentType, segment: &str, section: &str) -> bool {
    matches!(content_type, ContentType::ZeroFill | ContentType::TlvZeroFill)
        || segment == "__PAGEZERO"
        || segment == "__UNIXSTACK"
        || section == "__common"
}

/// Runs the three layout passes over `sections` and writes every live
/// atom's [`crate::atom::AtomLayout`]. Atom-to-section assignment (via
/// [`crate::sections::SectionSorter`]) must already have happened; this
/// only needs, per atom, which (already-sorted) final-section index it was
/// assigned to.
pub fn run(
    graph: &mut AtomGraph,
    atom_sections: &HashMap<AtomId, usize>,
    sections: &[FinalSection],
    options: &Options,
) -> Layout {
    let page = page_size(options.cputype);
    let mut section_addrs = vec![0u64; sections.len()];
    let mut section_sizes = vec![0u64; sections.len()];
    let mut section_padding = vec![0u64; sections.len()];

    // Group atoms by section, preserving the order `live_atoms` yields so
    // layout is deterministic across passes.
    let mut atoms_by_section: Vec<Vec<AtomId>> = vec![Vec::new(); sections.len()];
    for id in graph.live_atoms().collect::<Vec<_>>() {
        if let Some(&idx) = atom_sections.get(&id) {
            atoms_by_section[idx].push(id);
        }
    }

    // Compute each section's total size and max alignment from its atoms.
    let mut section_align = vec![0u8; sections.len()];
    for (idx, atoms) in atoms_by_section.iter().enumerate() {
        let mut cursor = 0u64;
        for &id in atoms {
            let atom = graph.get(id);
            let align = 1u64 << atom.alignment_trailing_zeros();
            cursor = align_up(cursor, align);
            cursor += atom.size;
            section_align[idx] = section_align[idx].max(atom.alignment.0);
        }
        section_sizes[idx] = cursor;
    }

    // --- Header padding ---
    // Computed up front (it only depends on options) so pass 2/3 can reserve
    // room for the mach_header + load commands ahead of the first __TEXT
    // section, the way the marker atom's own (zero) size never would.
    let mut header_pad = MINIMUM_HEADER_PAD;
    if options.headerpad_max_install_names {
        header_pad = header_pad.max(options.segment_addresses.len() as u64 * MAXPATHLEN);
    }
    header_pad = header_pad.max(options.headerpad);
    header_pad = align_up(header_pad, page);
    if !options.output_kind.is_object() {
        if let Some(idx) = sections
            .iter()
            .position(|s| s.segment_name == "__TEXT" && s.section_name == "__mach_header")
        {
            section_sizes[idx] += header_pad;
        }
    }

    // --- Pass 1: fixed-address segments (-segaddr) ---
    let fixed: HashMap<&str, u64> =
        options.segment_addresses.iter().map(|(name, addr)| (name.as_str(), *addr)).collect();
    let mut text_fixed_end = None;
    for (idx, section) in sections.iter().enumerate() {
        if let Some(&base) = fixed.get(section.segment_name.as_str()) {
            let align = 1u64 << section_align[idx].max(3);
            let addr = align_up(base, align);
            section_addrs[idx] = addr;
            if section.segment_name == "__TEXT" {
                text_fixed_end = Some(addr + section_sizes[idx]);
            }
        }
    }

    // --- Pass 2: floating segments ---
    let mut addr = text_fixed_end.or(options.image_base).unwrap_or(match options.output_kind {
        OutputKind::Executable => options.pagezero_size,
        _ => 0,
    });
    let mut prev_segment: Option<&str> = None;
    for (idx, section) in sections.iter().enumerate() {
        if fixed.contains_key(section.segment_name.as_str()) {
            prev_segment = Some(&section.segment_name);
            continue;
        }
        if prev_segment != Some(section.segment_name.as_str()) {
            addr = align_up(addr, page);
        }
        let align = 1u64 << section_align[idx].max(0);
        let padded = align_up(addr, align.max(1));
        section_padding[idx] = padded - addr;
        section_addrs[idx] = padded;
        let hidden = section.content_type == ContentType::Unclassified && section.section_name.is_empty();
        if !(hidden && matches!(options.output_kind, OutputKind::Object | OutputKind::Preload)) {
            addr = padded + section_sizes[idx];
        }
        prev_segment = Some(&section.segment_name);
    }

    // --- Pass 3: file offsets (independent cursor) ---
    let mut section_file_offsets = vec![0u64; sections.len()];
    let mut file_cursor = 0u64;
    let mut prev_segment: Option<&str> = None;
    for (idx, section) in sections.iter().enumerate() {
        let no_disk = is_no_disk_space(section.content_type, &section.segment_name, &section.section_name);
        if no_disk {
            section_file_offsets[idx] = 0;
            prev_segment = Some(&section.segment_name);
            continue;
        }
        if prev_segment != Some(section.segment_name.as_str()) {
            file_cursor = align_up(file_cursor, page);
        }
        file_cursor += section_padding[idx];
        section_file_offsets[idx] = file_cursor;
        file_cursor += section_sizes[idx];
        prev_segment = Some(&section.segment_name);
    }
    let image_size = file_cursor;

    // --- Write atom layouts ---
    for (idx, atoms) in atoms_by_section.iter().enumerate() {
        let mut cursor = 0u64;
        for &id in atoms {
            let atom_align = 1u64 << graph.get(id).alignment_trailing_zeros();
            cursor = align_up(cursor, atom_align);
            let size = graph.get(id).size;
            let layout = graph.layout_mut(id);
            layout.final_section = Some(idx as u32);
            layout.section_offset = cursor;
            layout.final_address = section_addrs[idx] + cursor;
            cursor += size;
        }
    }

    // --- Segment table ---
    let mut segments: Vec<SegmentLayout> = Vec::new();
    let mut segment_index: HashMap<String, usize> = HashMap::new();
    for (idx, section) in sections.iter().enumerate() {
        let seg_idx = *segment_index.entry(section.segment_name.clone()).or_insert_with(|| {
            segments.push(SegmentLayout {
                name: section.segment_name.clone(),
                vmaddr: section_addrs[idx],
                vmsize: 0,
                fileoff: section_file_offsets[idx],
                filesize: 0,
                sections: Vec::new(),
            });
            segments.len() - 1
        });
        let seg = &mut segments[seg_idx];
        seg.sections.push(idx);
        let end_addr = section_addrs[idx] + section_sizes[idx];
        seg.vmsize = seg.vmsize.max(end_addr.saturating_sub(seg.vmaddr));
        let end_file = section_file_offsets[idx] + section_sizes[idx];
        seg.filesize = seg.filesize.max(end_file.saturating_sub(seg.fileoff));
    }

    Layout { segments, section_addrs, section_file_offsets, section_sizes, header_pad, image_size }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_16k_on_arm64() {
        assert_eq!(page_size(CPU_TYPE_ARM64), 0x4000);
    }

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn no_disk_space_excludes_zerofill_and_pagezero() {
        assert!(is_no_disk_space(ContentType::ZeroFill, "__DATA", "__bss"));
        assert!(is_no_disk_space(ContentType::Unclassified, "__PAGEZERO", "__pagezero"));
        assert!(!is_no_disk_space(ContentType::Code, "__TEXT", "__text"));
    }
}
