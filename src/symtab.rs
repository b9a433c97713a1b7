//! C2 — the symbol table: name/content/reference-graph resolution and
//! coalescing, per SPEC_FULL.md §4.2.
//!
//! Five tables sit in front of the indirect binding table: by-name,
//! by-content (per content type), by-references, by-name-reverse (for
//! undefined-symbol reporting) and the coalesced-away set — the last of
//! those is actually carried on [`crate::atom::AtomLayout`] rather than
//! duplicated here, since it's a per-atom fact the rest of the pipeline
//! already indexes by [`AtomId`].

use std::collections::HashMap;

use crate::atom::{Atom, AtomGraph, AtomId, Combine, Definition, Scope};
use crate::diagnostics;
use crate::error::{LinkerError, Result};
use crate::options::CommonsMode;

/// A resolved name → atom mapping. `SymbolTable` never mutates an atom's
/// identity, only which `AtomId` a slot points at — this is what makes
/// coalescing O(1) at every reference site: a `Fixup` with
/// `Binding::IndirectlyBound` stores a `u32` slot index, not the atom id
/// itself, and dereferences through [`SymbolTable::resolve_slot`].
pub struct SymbolTable {
    /// The indirect binding table: append-only, one entry per external name
    /// ever seen (defined or merely referenced).
    slots: Vec<Option<AtomId>>,
    by_name: HashMap<Vec<u8>, u32>,
    by_name_reverse: HashMap<u32, Vec<u8>>,
    by_content: HashMap<ContentKey, u32>,
    by_references: HashMap<ReferenceKey, u32>,
    /// Names for which a duplicate-symbol error has already fired, so
    /// `-undefined warning`-style suppression latches don't repeat it for
    /// every subsequent definition of the same name.
    duplicate_latch: HashMap<Vec<u8>, ()>,
    pub commons_mode: CommonsMode,
    pub ignore_duplicates: bool,
    pub warn_commons: bool,
}

/// Content-equality key for `ByNameAndContent` combine: the content bytes
/// plus the section the atom targets, since e.g. a `__TEXT,__cstring` atom
/// and a `__DATA,__const` atom with identical bytes must never coalesce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContentKey {
    segment: String,
    section: String,
    bytes: Vec<u8>,
}

/// Reference-equality key for `ByNameAndReferences` combine: not the raw
/// bytes (a non-lazy-pointer's bytes are meaningless before binding) but the
/// shape of its fixup graph — what it points to, by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReferenceKey {
    segment: String,
    section: String,
    referenced_names: Vec<Vec<u8>>,
}

/// Outcome of [`SymbolTable::add`]: which atom (if any) was coalesced away
/// as a result, for the caller to cascade group-subordinate marks.
pub struct AddOutcome {
    pub slot: u32,
    pub replaced: Option<AtomId>,
}

impl SymbolTable {
    pub fn new(commons_mode: CommonsMode) -> Self {
        SymbolTable {
            slots: Vec::new(),
            by_name: HashMap::new(),
            by_name_reverse: HashMap::new(),
            by_content: HashMap::new(),
            by_references: HashMap::new(),
            duplicate_latch: HashMap::new(),
            commons_mode,
            ignore_duplicates: false,
            warn_commons: false,
        }
    }

    /// Look up (without creating) the slot for `name`.
    pub fn lookup(&self, name: &[u8]) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Returns the atom currently occupying `slot`, or `None` if it has no
    /// live definition yet (pure undefined reference).
    pub fn resolve_slot(&self, slot: u32) -> Option<AtomId> {
        self.slots.get(slot as usize).copied().flatten()
    }

    pub fn name_of_slot(&self, slot: u32) -> Option<&[u8]> {
        self.by_name_reverse.get(&slot).map(|v| v.as_slice())
    }

    /// Returns (creating if necessary) the slot for `name`, without binding
    /// a definition to it — used when a reference to an as-yet-undefined
    /// name is first encountered.
    pub fn slot_for_name(&mut self, name: &[u8]) -> u32 {
        if let Some(&slot) = self.by_name.get(name) {
            return slot;
        }
        let slot = self.slots.len() as u32;
        self.slots.push(None);
        self.by_name.insert(name.to_vec(), slot);
        self.by_name_reverse.insert(slot, name.to_vec());
        slot
    }

    /// Every name that was referenced but never bound to a live atom — the
    /// undefined-symbol report.
    pub fn undefined_names(&self) -> Vec<&[u8]> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| self.by_name_reverse.get(&(i as u32)).map(|v| v.as_slice()).unwrap_or(&[]))
            .collect()
    }

    /// Insert `atom` (by id) into the table, applying `atom.combine`'s
    /// policy. Returns the slot it now lives in and, if a previously live
    /// atom was displaced, its id so the caller can mark it
    /// `coalesced_away` and cascade to group subordinates.
    pub fn add(&mut self, graph: &AtomGraph, id: AtomId) -> Result<AddOutcome> {
        let atom = graph.get(id);
        match atom.combine {
            Combine::Never => {
                let slot = self.fresh_slot_for(atom);
                self.slots[slot as usize] = Some(id);
                Ok(AddOutcome { slot, replaced: None })
            }
            Combine::ByName => self.add_by_name(graph, id),
            Combine::ByNameAndContent => self.add_by_content(graph, id),
            Combine::ByNameAndReferences => self.add_by_references(graph, id),
        }
    }

    fn fresh_slot_for(&mut self, atom: &Atom) -> u32 {
        if atom.name.is_empty() {
            let slot = self.slots.len() as u32;
            self.slots.push(None);
            return slot;
        }
        self.slot_for_name(&atom.name)
    }

    fn add_by_name(&mut self, graph: &AtomGraph, id: AtomId) -> Result<AddOutcome> {
        let new_atom = graph.get(id);
        let slot = self.slot_for_name(&new_atom.name);
        let existing = self.resolve_slot(slot);
        let Some(existing_id) = existing else {
            self.slots[slot as usize] = Some(id);
            return Ok(AddOutcome { slot, replaced: None });
        };
        if existing_id == id {
            return Ok(AddOutcome { slot, replaced: None });
        }
        let existing_atom = graph.get(existing_id);
        let keep_new = self.resolve_override(existing_atom, new_atom)?;
        if keep_new {
            self.slots[slot as usize] = Some(id);
            Ok(AddOutcome { slot, replaced: Some(existing_id) })
        } else {
            Ok(AddOutcome { slot, replaced: Some(id) })
        }
    }

    /// The override matrix from SPEC_FULL.md §4.2. Returns `true` if `n`
    /// (the newly-added atom) should replace `e` (the existing occupant).
    fn resolve_override(&mut self, e: &Atom, n: &Atom) -> Result<bool> {
        use Definition::*;
        match (e.definition, n.definition) {
            (Regular, Regular) => self.resolve_two_regulars(e, n),
            (Regular, Tentative) => {
                if n.size > e.size {
                    diagnostics::warning(&format!(
                        "tentative definition of '{}' has size {} which is larger than the real definition's size {}",
                        name_str(&n.name), n.size, e.size
                    ));
                }
                if e.scope != n.scope {
                    diagnostics::warning(&format!(
                        "hidden/visible symbol '{}' mismatch between a real and a tentative definition",
                        name_str(&n.name)
                    ));
                }
                Ok(false)
            }
            (Regular, Absolute) => Err(duplicate_error(&n.name)),
            (Regular, Proxy) => Ok(false),

            (Tentative, Regular) => {
                if n.size < e.size {
                    diagnostics::warning(&format!(
                        "real definition of '{}' has size {} which is smaller than the tentative definition's size {}",
                        name_str(&n.name), n.size, e.size
                    ));
                }
                if n.content_type == crate::atom::ContentType::Code {
                    return Err(LinkerError::Resolution(format!(
                        "'{}' defined as both tentative and code", name_str(&n.name)
                    )));
                }
                if e.scope != n.scope {
                    diagnostics::warning(&format!(
                        "hidden/visible symbol '{}' mismatch between a tentative and a real definition",
                        name_str(&n.name)
                    ));
                }
                Ok(true)
            }
            (Tentative, Tentative) => {
                if n.size > e.size {
                    Ok(true)
                } else {
                    if n.alignment_trailing_zeros() > e.alignment_trailing_zeros() {
                        diagnostics::warning(&format!(
                            "alignment lost for common symbol '{}'", name_str(&n.name)
                        ));
                    }
                    Ok(false)
                }
            }
            (Tentative, Absolute) => Ok(true),
            (Tentative, Proxy) => self.resolve_commons_conflict(e, n),

            (Absolute, Regular) => Err(duplicate_error(&n.name)),
            (Absolute, Tentative) => Ok(false),
            (Absolute, Absolute) => Err(duplicate_error(&n.name)),
            (Absolute, Proxy) => Ok(false),

            (Proxy, Regular) => Ok(true),
            (Proxy, Tentative) => self.resolve_commons_conflict(n, e).map(|keep_new_as_e| !keep_new_as_e),
            (Proxy, Absolute) => Ok(true),
            (Proxy, Proxy) => {
                match (e.weak_def, n.weak_def) {
                    (true, false) => Ok(true),
                    (false, true) => Ok(false),
                    _ => Err(LinkerError::Resolution(format!(
                        "'{}' has multiple dylib exports", name_str(&n.name)
                    ))),
                }
            }
        }
    }

    fn resolve_commons_conflict(&mut self, tentative: &Atom, proxy: &Atom) -> Result<bool> {
        match self.commons_mode {
            CommonsMode::UseDylibs => {
                if self.warn_commons {
                    diagnostics::warning(&format!(
                        "'{}' has a common symbol definition and a dylib export; using the dylib",
                        name_str(&proxy.name)
                    ));
                }
                let _ = tentative;
                Ok(true)
            }
            CommonsMode::Override => Ok(false),
            CommonsMode::Error => Err(LinkerError::Resolution(format!(
                "'{}' has a common symbol definition and a dylib export", name_str(&proxy.name)
            ))),
        }
    }

    fn resolve_two_regulars(&mut self, e: &Atom, n: &Atom) -> Result<bool> {
        if !e.weak_def && !n.weak_def {
            if self.ignore_duplicates {
                if self.duplicate_latch.insert(n.name.clone(), ()).is_none() {
                    diagnostics::warning(&format!("duplicate symbol '{}'", name_str(&n.name)));
                }
                return Ok(false);
            }
            return Err(duplicate_error(&n.name));
        }
        if e.weak_def != n.weak_def {
            // Exactly one weak: keep the non-weak definition.
            return Ok(!e.weak_def);
        }
        // Both weak: priority chain.
        if e.is_lto_temporary != n.is_lto_temporary {
            return Ok(!n.is_lto_temporary && e.is_lto_temporary);
        }
        if e.auto_hide != n.auto_hide {
            return Ok(e.auto_hide); // prefer the non-auto_hide one
        }
        if e.auto_hide && n.auto_hide {
            return Ok(n.alignment_trailing_zeros() > e.alignment_trailing_zeros());
        }
        if e.scope != n.scope {
            diagnostics::warning(&format!(
                "hidden/visible symbol '{}' mismatch between weak definitions",
                name_str(&n.name)
            ));
            return Ok(n.scope == Scope::Global);
        }
        Ok(n.alignment_trailing_zeros() > e.alignment_trailing_zeros())
    }

    fn add_by_content(&mut self, graph: &AtomGraph, id: AtomId) -> Result<AddOutcome> {
        let atom = graph.get(id);
        let key = content_key(atom);
        if let Some(&slot) = self.by_content.get(&key) {
            let existing_id = self.resolve_slot(slot).expect("by-content slot always bound");
            let existing = graph.get(existing_id);
            let keep_new = atom.alignment_trailing_zeros() > existing.alignment_trailing_zeros();
            if keep_new {
                self.slots[slot as usize] = Some(id);
                self.by_content.insert(key, slot);
                return Ok(AddOutcome { slot, replaced: Some(existing_id) });
            }
            return Ok(AddOutcome { slot, replaced: Some(id) });
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Some(id));
        self.by_content.insert(key, slot);
        Ok(AddOutcome { slot, replaced: None })
    }

    fn add_by_references(&mut self, graph: &AtomGraph, id: AtomId) -> Result<AddOutcome> {
        let atom = graph.get(id);
        let key = reference_key(graph, atom);
        if let Some(&slot) = self.by_references.get(&key) {
            let existing_id = self.resolve_slot(slot).expect("by-references slot always bound");
            let existing = graph.get(existing_id);
            let keep_new = atom.alignment_trailing_zeros() > existing.alignment_trailing_zeros();
            if keep_new {
                self.slots[slot as usize] = Some(id);
                self.by_references.insert(key, slot);
                return Ok(AddOutcome { slot, replaced: Some(existing_id) });
            }
            return Ok(AddOutcome { slot, replaced: Some(id) });
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Some(id));
        self.by_references.insert(key, slot);
        Ok(AddOutcome { slot, replaced: None })
    }
}

fn content_key(atom: &Atom) -> ContentKey {
    let bytes = match &atom.content {
        crate::atom::AtomContent::Bytes(b) => {
            // UTF-16 strings exclude the two trailing (NUL) bytes from the
            // hash/equality key per §4.2.
            if atom.content_type == crate::atom::ContentType::UTF16String && b.len() >= 2 {
                b[..b.len() - 2].to_vec()
            } else {
                b.clone()
            }
        }
        _ => Vec::new(),
    };
    ContentKey {
        segment: atom.section.segment_name.clone(),
        section: atom.section.section_name.clone(),
        bytes,
    }
}

fn reference_key(graph: &AtomGraph, atom: &Atom) -> ReferenceKey {
    let mut referenced_names: Vec<Vec<u8>> = atom
        .fixups
        .iter()
        .filter_map(|f| match f.target {
            crate::atom::FixupTarget::Atom { atom: target, .. } => Some(graph.get(target).name.clone()),
            _ => None,
        })
        .collect();
    referenced_names.sort();
    ReferenceKey {
        segment: atom.section.segment_name.clone(),
        section: atom.section.section_name.clone(),
        referenced_names,
    }
}

fn name_str(name: &[u8]) -> String {
    crate::diagnostics::demangle_for_display(name)
}

fn duplicate_error(name: &[u8]) -> LinkerError {
    LinkerError::Resolution(format!("duplicate symbol '{}'", name_str(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::*;

    fn atom(name: &str, def: Definition, weak: bool, auto_hide: bool) -> Atom {
        Atom {
            name: name.as_bytes().to_vec(),
            definition: def,
            scope: Scope::Global,
            combine: Combine::ByName,
            symbol_table_inclusion: SymbolTableInclusion::In,
            content_type: ContentType::Code,
            section: Section::new("__TEXT", "__text", ContentType::Code),
            alignment: (0, 0),
            size: 4,
            object_address: 0,
            auto_hide,
            overrides_dylib_weak_def: false,
            thumb: false,
            weak_imported: false,
            weak_def: weak,
            is_lto_temporary: false,
            content: AtomContent::Bytes(vec![0; 4]),
            fixups: Vec::new(),
            dylib_ordinal: 0,
            group_subordinates: Vec::new(),
        }
    }

    #[test]
    fn two_strong_regulars_duplicate_symbol_error() {
        let mut graph = AtomGraph::new();
        let mut table = SymbolTable::new(CommonsMode::UseDylibs);
        let a = graph.alloc(atom("_foo", Definition::Regular, false, false));
        let b = graph.alloc(atom("_foo", Definition::Regular, false, false));
        table.add(&graph, a).unwrap();
        let err = table.add(&graph, b).unwrap_err();
        assert!(matches!(err, LinkerError::Resolution(_)));
    }

    #[test]
    fn autohide_weak_def_loses_to_visible_one() {
        let mut graph = AtomGraph::new();
        let mut table = SymbolTable::new(CommonsMode::UseDylibs);
        let a = graph.alloc(atom("_foo", Definition::Regular, true, true));
        let b = graph.alloc(atom("_foo", Definition::Regular, true, false));
        table.add(&graph, a).unwrap();
        let outcome = table.add(&graph, b).unwrap();
        assert_eq!(outcome.replaced, Some(a));
        assert_eq!(table.resolve_slot(outcome.slot), Some(b));
    }

    #[test]
    fn tentative_then_regular_keeps_regular() {
        let mut graph = AtomGraph::new();
        let mut table = SymbolTable::new(CommonsMode::UseDylibs);
        let tentative = graph.alloc(atom("_bar", Definition::Tentative, false, false));
        let regular = graph.alloc(atom("_bar", Definition::Regular, false, false));
        table.add(&graph, tentative).unwrap();
        let outcome = table.add(&graph, regular).unwrap();
        assert_eq!(outcome.replaced, Some(tentative));
    }

    #[test]
    fn commons_use_dylibs_prefers_proxy() {
        let mut graph = AtomGraph::new();
        let mut table = SymbolTable::new(CommonsMode::UseDylibs);
        let tentative = graph.alloc(atom("_bar", Definition::Tentative, false, false));
        let proxy = graph.alloc(atom("_bar", Definition::Proxy, false, false));
        table.add(&graph, tentative).unwrap();
        let outcome = table.add(&graph, proxy).unwrap();
        assert_eq!(outcome.replaced, Some(tentative));
    }
}
