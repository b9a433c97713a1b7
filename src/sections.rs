//! C4 — internal state & section sorter: maps every atom's input
//! `(segment, section)` pair onto the final section it will be written
//! into, and assigns each final section the `(segmentOrder, sectionOrder)`
//! pair the layout pass sorts by, per SPEC_FULL.md §4.4.

use std::collections::HashMap;

use crate::atom::{Atom, ContentType, Definition};
use crate::options::{CommonsMode, OutputKind, Options};

/// One output section: a unique `(segment, section)` name pair plus its
/// sort key and the atoms assigned to it, in insertion order.
#[derive(Debug, Clone)]
pub struct FinalSection {
    pub segment_name: String,
    pub section_name: String,
    pub segment_order: u32,
    pub section_order: u32,
    pub content_type: ContentType,
}

impl FinalSection {
    fn key(&self) -> (String, String) {
        (self.segment_name.clone(), self.section_name.clone())
    }
}

const ORDER_MAX: u32 = u32::MAX;

fn segment_order(name: &str) -> u32 {
    match name {
        "__PAGEZERO" => 0,
        "__TEXT" | "__HEADER" => 1,
        "__OBJC" => 3,
        "__IMPORT" => 4,
        "__DATA" => 2, // overridden to 5 for object-file output by the caller
        _ => 10,
    }
}

/// Section order within `__TEXT`. Anything not named here sorts as "other
/// code" (11) when it carries instructions, else as body (between 13 and
/// `INT_MAX-3`).
fn text_section_order(name: &str, content_type: ContentType) -> u32 {
    match name {
        "__mach_header" => 1,
        "__text" => 10,
        "__stubs" => 12,
        "__stub_helper" => 13,
        "__gcc_except_tab" => ORDER_MAX - 3,
        "__unwind_info" => ORDER_MAX - 2,
        "__eh_frame" => ORDER_MAX - 1,
        _ => match content_type {
            ContentType::Code => 11,
            ContentType::Lsda => ORDER_MAX - 3,
            ContentType::CompactUnwind => ORDER_MAX - 2,
            ContentType::Cfi => ORDER_MAX - 1,
            _ => 50,
        },
    }
}

/// Section order within `__DATA`. Well-known ObjC sections occupy 20..31
/// in the fixed sequence ld64 emits them in; anything else not named here
/// falls into the general "body" bucket (50) unless it's zero-fill, which
/// always sinks to the back.
fn data_section_order(name: &str, content_type: ContentType) -> u32 {
    const OBJC_SECTIONS: &[&str] = &[
        "__objc_classlist",
        "__objc_nlclasslist",
        "__objc_catlist",
        "__objc_nlcatlist",
        "__objc_protolist",
        "__objc_imageinfo",
        "__objc_const",
        "__objc_selrefs",
        "__objc_msgrefs",
        "__objc_protorefs",
        "__objc_classrefs",
        "__objc_superrefs",
    ];
    if let ContentType::ZeroFill = content_type {
        return ORDER_MAX - 2;
    }
    if let ContentType::TlvZeroFill = content_type {
        return ORDER_MAX - 3;
    }
    match name {
        "__lazy_symbol" => 8,
        "__la_symbol_ptr" => 8,
        "__nl_symbol_ptr" => 10,
        "__mod_init_func" => 12,
        "__mod_term_func" => 13,
        "__thread_data" => ORDER_MAX - 4,
        "__common" => ORDER_MAX - 2,
        "__huge" => ORDER_MAX - 1,
        _ => {
            if let Some(pos) = OBJC_SECTIONS.iter().position(|&s| s == name) {
                20 + pos as u32
            } else {
                match content_type {
                    ContentType::LazyPointer => 11,
                    ContentType::NonLazyPointer => 10,
                    ContentType::Tlv => ORDER_MAX - 4,
                    _ => 50,
                }
            }
        }
    }
}

fn section_order(segment: &str, section: &str, content_type: ContentType) -> u32 {
    match segment {
        "__TEXT" | "__HEADER" => text_section_order(section, content_type),
        "__DATA" => data_section_order(section, content_type),
        _ => 50,
    }
}

/// Rewrites an atom's raw input `(segment, section)` per the §4.4
/// coalescing table, except when building a relocatable object file (`-r`),
/// which keeps input sections as-is (other than an optional `-d` tentative
/// rewrite the caller applies separately).
fn coalesce(segment: &str, section: &str, content_type: ContentType) -> (String, String) {
    match (segment, section) {
        ("__TEXT", "__textcoal_nt") => ("__TEXT".into(), "__text".into()),
        ("__TEXT", "__const_coal") => ("__TEXT".into(), "__const".into()),
        ("__DATA", "__const_coal") => ("__DATA".into(), "__const".into()),
        ("__DATA", "__datacoal_nt") => ("__DATA".into(), "__data".into()),
        ("__TEXT", "__StaticInit") => ("__TEXT".into(), "__text".into()),
        ("__IMPORT", "__pointers") => ("__DATA".into(), "__nl_symbol_ptr".into()),
        _ => match content_type {
            ContentType::Literal4 | ContentType::Literal8 | ContentType::Literal16 | ContentType::CString => {
                ("__TEXT".into(), "__const".into())
            }
            _ => (segment.to_string(), section.to_string()),
        },
    }
}

/// Owns every `FinalSection` the output image will contain and the
/// input-section → final-section map atoms are folded through on `add`.
pub struct SectionSorter {
    sections: Vec<FinalSection>,
    index: HashMap<(String, String), usize>,
    output_kind: OutputKind,
    commons_mode: CommonsMode,
}

impl SectionSorter {
    pub fn new(options: &Options) -> Self {
        SectionSorter {
            sections: Vec::new(),
            index: HashMap::new(),
            output_kind: options.output_kind,
            commons_mode: options.commons_mode,
        }
    }

    /// Computes the final `(segment, section)` an atom belongs in and
    /// returns the index into `self.sections()`, creating the section on
    /// first use.
    pub fn assign(&mut self, atom: &Atom) -> usize {
        let (mut segment, mut section) = (atom.section.segment_name.clone(), atom.section.section_name.clone());

        if atom.definition == Definition::Tentative {
            if self.output_kind.is_object() {
                if self.commons_mode == CommonsMode::Override {
                    segment = "__DATA".into();
                    section = "__common".into();
                }
            } else {
                segment = "__DATA".into();
                section = "__common".into();
            }
        } else if !self.output_kind.is_object() {
            let (s, c) = coalesce(&segment, &section, atom.content_type);
            segment = s;
            section = c;
        }

        self.section_index(segment, section, atom.content_type)
    }

    fn section_index(&mut self, segment: String, section: String, content_type: ContentType) -> usize {
        let key = (segment.clone(), section.clone());
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let mut seg_order = segment_order(&segment);
        if segment == "__DATA" && self.output_kind.is_object() {
            seg_order = 5; // zero-fill sorts after everything else in .o output
        }
        let idx = self.sections.len();
        self.sections.push(FinalSection {
            segment_name: segment,
            section_name: section,
            segment_order: seg_order,
            section_order: section_order(&key.0, &key.1, content_type),
            content_type,
        });
        self.index.insert(key, idx);
        idx
    }

    /// The final, stably-sorted section table, per `(segmentOrder,
    /// sectionOrder)`, plus the pre-sort-index → post-sort-index mapping
    /// callers holding indices from `assign` need to remap them.
    pub fn finish(mut self) -> (Vec<FinalSection>, Vec<usize>) {
        let mut order: Vec<usize> = (0..self.sections.len()).collect();
        order.sort_by(|&a, &b| {
            let sa = &self.sections[a];
            let sb = &self.sections[b];
            (sa.segment_order, sa.section_order).cmp(&(sb.segment_order, sb.section_order))
        });
        let mut old_to_new = vec![0usize; self.sections.len()];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            old_to_new[old_idx] = new_idx;
        }
        let mut sorted = Vec::with_capacity(self.sections.len());
        // drain in `order` by swapping into place via take; sections aren't
        // Clone-cheap enough to index-sort by cloning, so move element out.
        let mut slots: Vec<Option<FinalSection>> = self.sections.drain(..).map(Some).collect();
        for &old_idx in &order {
            sorted.push(slots[old_idx].take().expect("each old index visited once"));
        }
        (sorted, old_to_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_textcoal_into_text() {
        let (seg, sect) = coalesce("__TEXT", "__textcoal_nt", ContentType::Code);
        assert_eq!((seg.as_str(), sect.as_str()), ("__TEXT", "__text"));
    }

    #[test]
    fn literal_sections_land_in_text_const() {
        let (seg, sect) = coalesce("__TEXT", "__literal4", ContentType::Literal4);
        assert_eq!((seg.as_str(), sect.as_str()), ("__TEXT", "__const"));
    }

    #[test]
    fn pagezero_sorts_before_text_and_data() {
        assert!(segment_order("__PAGEZERO") < segment_order("__TEXT"));
        assert!(segment_order("__TEXT") < segment_order("__DATA"));
    }

    #[test]
    fn text_body_sorts_between_stub_helper_and_lsda() {
        let stub_helper = text_section_order("__stub_helper", ContentType::Unclassified);
        let body = text_section_order("__cstring_weird", ContentType::Unclassified);
        let lsda = text_section_order("__gcc_except_tab", ContentType::Lsda);
        assert!(stub_helper < body);
        assert!(body < lsda);
    }

    #[test]
    fn zerofill_always_sinks_in_data() {
        let common = data_section_order("__bss", ContentType::ZeroFill);
        let regular = data_section_order("__data", ContentType::Unclassified);
        assert!(regular < common);
    }
}
