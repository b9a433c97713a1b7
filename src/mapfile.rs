//! `-map` text dump (§4.6 "Map file"): a simple consumer of the immutable
//! post-C6 state — object-file ordinals, the final section table, and every
//! live atom's address/size/owning-file — rendered the way `ld64`'s own
//! `-map` output reads, not reproduced byte-for-byte.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::atom::{Atom, AtomGraph, AtomId, ContentType};
use crate::layout::Layout;
use crate::mach::cputype::cpu_type_to_str;
use crate::sections::FinalSection;

fn synthesized_name(atom: &Atom) -> String {
    if !atom.name.is_empty() {
        return String::from_utf8_lossy(&atom.name).into_owned();
    }
    match atom.content_type {
        ContentType::NonLazyPointer => "<non-lazy-pointer>".to_string(),
        ContentType::LazyPointer => "<lazy-pointer>".to_string(),
        ContentType::Cfi => "<CFI-FDE>".to_string(),
        ContentType::CString => "<cstring-literal>".to_string(),
        ContentType::Literal4 | ContentType::Literal8 | ContentType::Literal16 => {
            "<literal>".to_string()
        }
        _ => "<anonymous>".to_string(),
    }
}

/// Renders the map file text. `object_paths` is the ordinal-ordered list of
/// input object paths (archive members included, by the path synthesized
/// for them); `atom_objects` maps each live atom to an index into it.
pub fn render(
    output_path: &std::path::Path,
    cputype: u32,
    object_paths: &[String],
    sections: &[FinalSection],
    layout: &Layout,
    graph: &AtomGraph,
    atom_objects: &HashMap<AtomId, usize>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Path: {}", output_path.display());
    let _ = writeln!(out, "# Arch: {}", cpu_type_to_str(cputype));
    let _ = writeln!(out, "# Object files:");
    let _ = writeln!(out, "[  0] linker synthesized");
    for (i, path) in object_paths.iter().enumerate() {
        let _ = writeln!(out, "[{:3}] {}", i + 1, path);
    }
    let _ = writeln!(out, "# Sections:");
    let _ = writeln!(out, "# Address\tSize\tSegment\tSection");
    for (idx, section) in sections.iter().enumerate() {
        let _ = writeln!(
            out,
            "0x{:016X}\t0x{:016X}\t{}\t{}",
            layout.section_addrs[idx], layout.section_sizes[idx], section.segment_name, section.section_name,
        );
    }
    let _ = writeln!(out, "# Symbols:");
    let _ = writeln!(out, "# Address\tSize\tFile\tName");
    let mut atoms: Vec<AtomId> = graph.live_atoms().collect();
    atoms.sort_by_key(|&id| graph.layout(id).final_address);
    for id in atoms {
        let atom = graph.get(id);
        let atom_layout = graph.layout(id);
        let file_ordinal = atom_objects.get(&id).map(|o| o + 1).unwrap_or(0);
        let _ = writeln!(
            out,
            "0x{:016X}\t0x{:016X}\t[{:3}]\t{}",
            atom_layout.final_address,
            atom.size,
            file_ordinal,
            synthesized_name(atom),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{AtomContent, Combine, Definition, Scope, Section, SymbolTableInclusion};

    #[test]
    fn renders_header_and_one_symbol() {
        let mut graph = AtomGraph::new();
        let id = graph.alloc(Atom {
            name: b"_main".to_vec(),
            definition: Definition::Regular,
            scope: Scope::Global,
            combine: Combine::Never,
            symbol_table_inclusion: SymbolTableInclusion::In,
            content_type: ContentType::Code,
            section: Section::new("__TEXT", "__text", ContentType::Code),
            alignment: (0, 0),
            size: 4,
            object_address: 0,
            auto_hide: false,
            overrides_dylib_weak_def: false,
            thumb: false,
            weak_imported: false,
            weak_def: false,
            is_lto_temporary: false,
            content: AtomContent::Bytes(vec![0; 4]),
            fixups: Vec::new(),
            dylib_ordinal: 0,
            group_subordinates: Vec::new(),
        });
        graph.layout_mut(id).final_address = 0x1000;
        let layout = Layout {
            segments: Vec::new(),
            section_addrs: vec![0x1000],
            section_file_offsets: vec![0],
            section_sizes: vec![4],
            header_pad: 0,
            image_size: 4,
        };
        let sections = vec![FinalSection {
            segment_name: "__TEXT".to_string(),
            section_name: "__text".to_string(),
            segment_order: 1,
            section_order: 10,
            content_type: ContentType::Code,
        }];
        let mut atom_objects = HashMap::new();
        atom_objects.insert(id, 0usize);
        let text = render(
            std::path::Path::new("a.out"),
            crate::mach::cputype::CPU_TYPE_X86_64,
            &["a.o".to_string()],
            &sections,
            &layout,
            &graph,
            &atom_objects,
        );
        assert!(text.contains("# Path: a.out"));
        assert!(text.contains("_main"));
        assert!(text.contains("[  1] a.o"));
    }
}
