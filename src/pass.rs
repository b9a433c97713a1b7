//! Graph-mutating passes that run between C2 resolution and C4 section
//! assignment, per SPEC_FULL.md §4.3/§9. Each [`Pass`] sees the fully
//! resolved atom graph (every live [`crate::atom::Atom`] already has its
//! final identity; only layout is still undecided) and may mark atoms
//! `coalesced_away` or otherwise prepare them for layout.
//!
//! Most of the passes ld64 itself runs (stub generation, TLV lowering,
//! ObjC optimization, compact-unwind encoding, order files, branch
//! islands, dtrace probe patching) require either new machine-code
//! generation or source-format knowledge this crate's Non-goals exclude;
//! they're kept here as documented no-ops rather than silently missing; a
//! caller asking `-dead_strip` or count-on GOT-load rewriting still gets
//! the behavior.

use std::collections::HashSet;

use crate::atom::{AtomGraph, AtomId, FixupKind, FixupTarget, Scope, SymbolTableInclusion};
use crate::error::Result;
use crate::options::Options;

/// A single graph-mutating stage, run in driver order by
/// [`crate::linker::Linker`].
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut AtomGraph, options: &Options) -> Result<()>;
}

/// Marks every atom unreachable from an exported/entry root as
/// `coalesced_away`, approximating `-dead_strip`'s live-atom closure.
/// Roots are every atom with `Scope::Global` symbol-table inclusion (an
/// export is always a reason to keep something alive) plus
/// `___mh_*_header`/`___dso_handle`, since those two are always emitted.
/// The closure walks `fixups` and `group_subordinates` transitively.
pub struct DeadStripPass;

impl Pass for DeadStripPass {
    fn name(&self) -> &'static str {
        "dead-strip"
    }

    fn run(&self, graph: &mut AtomGraph, options: &Options) -> Result<()> {
        if !options.dead_strip {
            return Ok(());
        }
        let mut live: HashSet<AtomId> = HashSet::new();
        let mut stack: Vec<AtomId> = Vec::new();

        for id in graph.ids() {
            if graph.layout(id).coalesced_away {
                continue;
            }
            let atom = graph.get(id);
            let is_root = matches!(
                atom.scope,
                Scope::Global
            ) && !matches!(
                atom.symbol_table_inclusion,
                SymbolTableInclusion::NotIn
            );
            if is_root {
                stack.push(id);
            }
        }

        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            let atom = graph.get(id);
            for fixup in &atom.fixups {
                if let FixupTarget::Atom { atom: target, .. } = fixup.target {
                    if !live.contains(&target) {
                        stack.push(target);
                    }
                }
            }
            for &sub in &atom.group_subordinates {
                if !live.contains(&sub) {
                    stack.push(sub);
                }
            }
        }

        for id in graph.ids() {
            if graph.layout(id).coalesced_away {
                continue;
            }
            if !live.contains(&id) {
                graph.layout_mut(id).coalesced_away = true;
            }
        }
        Ok(())
    }
}

/// Marks `StoreX86PCRel32GOTLoad`/`StoreX86PCRel32TLVLoad`/`StoreX86Abs32TLVLoad`
/// fixups whose target is directly resolvable (a `Regular`/`Tentative`/`Absolute`
/// atom, not a dylib `Proxy` needing a real indirection slot) in
/// [`crate::atom::AtomLayout::reduced_to_lea`]. [`crate::fixup::apply`]
/// consults that table and performs the `mov`-to-`lea` opcode rewrite (§6)
/// for any marked fixup, exactly as it would for an object file that
/// already carried the `*NowLEA` relocation kind.
///
/// Only fixups already bound to a concrete [`AtomId`] at this point in the
/// pipeline (`FixupTarget::Atom`) are inspected: a fixup still carrying a
/// `FixupTarget::PendingName` hasn't been resolved against the symbol table
/// yet and can't be classified here.
pub struct GotLoadRewritePass;

impl Pass for GotLoadRewritePass {
    fn name(&self) -> &'static str {
        "got-load-rewrite"
    }

    fn run(&self, graph: &mut AtomGraph, _options: &Options) -> Result<()> {
        use crate::atom::Definition;

        let mut rewrites: Vec<(AtomId, u32)> = Vec::new();
        for id in graph.ids() {
            if graph.layout(id).coalesced_away {
                continue;
            }
            let atom = graph.get(id);
            for fixup in &atom.fixups {
                if !matches!(
                    fixup.kind,
                    FixupKind::StoreX86PCRel32GOTLoad
                        | FixupKind::StoreX86PCRel32TLVLoad
                        | FixupKind::StoreX86Abs32TLVLoad
                ) {
                    continue;
                }
                let FixupTarget::Atom { atom: target, .. } = fixup.target else { continue };
                if !matches!(graph.get(target).definition, Definition::Proxy) {
                    rewrites.push((id, fixup.offset_in_atom));
                }
            }
        }
        for (id, offset) in rewrites {
            graph.layout_mut(id).reduced_to_lea.insert(offset);
        }
        Ok(())
    }
}

macro_rules! noop_pass {
    ($name:ident, $label:expr, $doc:expr) => {
        #[doc = $doc]
        pub struct $name;
        impl Pass for $name {
            fn name(&self) -> &'static str {
                $label
            }
            fn run(&self, _graph: &mut AtomGraph, _options: &Options) -> Result<()> {
                Ok(())
            }
        }
    };
}

noop_pass!(StubGenerationPass, "stub-generation", "Symbol-stub/lazy-pointer synthesis for dylib calls: requires emitting new machine code, out of scope per SPEC_FULL.md §1 Non-goals.");
noop_pass!(TlvLoweringPass, "tlv-lowering", "Thread-local-variable descriptor/template lowering: requires synthesizing new TLV accessor thunks, out of scope.");
noop_pass!(ObjcOptimizationPass, "objc-optimization", "Objective-C selector/class-list uniquing: requires source-format (ObjC metadata) analysis beyond atom-graph structure, out of scope.");
noop_pass!(CompactUnwindPass, "compact-unwind", "Compact-unwind-info table synthesis from `__eh_frame`/LSDA atoms: decoding/encoding this format is explicitly out of scope (see `crate::mach`'s module doc).");
noop_pass!(OrderFilePass, "order-file", "`-order_file` atom reordering within a final section: no order-file parser is implemented.");
noop_pass!(BranchIslandPass, "branch-island", "ARM/PPC branch-island insertion for out-of-range branches: requires synthesizing new trampoline atoms, out of scope.");
noop_pass!(DtracePass, "dtrace", "`DtraceNop`/`DtraceZeroClear` probe-site patching: recognized as fixup kinds (see `crate::fixup`) but the probe-is-disabled rewrite itself is not performed by any pass yet.");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Atom, AtomContent, Combine, ContentType, Definition, Section};

    fn atom(name: &str, scope: Scope, inclusion: SymbolTableInclusion) -> Atom {
        Atom {
            name: name.as_bytes().to_vec(),
            definition: Definition::Regular,
            scope,
            combine: Combine::Never,
            symbol_table_inclusion: inclusion,
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
        }
    }

    #[test]
    fn dead_strip_noop_when_disabled() {
        let mut graph = AtomGraph::new();
        let a = graph.alloc(atom("_a", Scope::TranslationUnit, SymbolTableInclusion::NotIn));
        let mut options = Options::default();
        options.dead_strip = false;
        DeadStripPass.run(&mut graph, &options).unwrap();
        assert!(!graph.layout(a).coalesced_away);
    }

    #[test]
    fn dead_strip_removes_unreachable_local() {
        let mut graph = AtomGraph::new();
        let root = graph.alloc(atom("_main", Scope::Global, SymbolTableInclusion::In));
        let orphan = graph.alloc(atom("_dead", Scope::TranslationUnit, SymbolTableInclusion::NotIn));
        let mut options = Options::default();
        options.dead_strip = true;
        DeadStripPass.run(&mut graph, &options).unwrap();
        assert!(!graph.layout(root).coalesced_away);
        assert!(graph.layout(orphan).coalesced_away);
    }

    fn got_load_fixup(target: AtomId) -> crate::atom::Fixup {
        use crate::atom::{Binding, ClusterPosition};
        crate::atom::Fixup {
            offset_in_atom: 3,
            cluster: ClusterPosition::SINGLE,
            kind: FixupKind::StoreX86PCRel32GOTLoad,
            binding: Binding::DirectlyBound,
            target: FixupTarget::Atom { atom: target, addend: 0 },
            content_addend_only: false,
            content_delta_to_addend_only: false,
        }
    }

    #[test]
    fn got_load_rewrite_marks_direct_target() {
        let mut graph = AtomGraph::new();
        let callee = graph.alloc(atom("_g", Scope::Global, SymbolTableInclusion::In));
        let mut caller = atom("_f", Scope::Global, SymbolTableInclusion::In);
        caller.fixups.push(got_load_fixup(callee));
        let caller = graph.alloc(caller);

        GotLoadRewritePass.run(&mut graph, &Options::default()).unwrap();
        assert!(graph.layout(caller).reduced_to_lea.contains(&3));
    }

    #[test]
    fn got_load_rewrite_leaves_dylib_import_alone() {
        let mut graph = AtomGraph::new();
        let mut import = atom("_g", Scope::Global, SymbolTableInclusion::NotIn);
        import.definition = Definition::Proxy;
        let import = graph.alloc(import);
        let mut caller = atom("_f", Scope::Global, SymbolTableInclusion::In);
        caller.fixups.push(got_load_fixup(import));
        let caller = graph.alloc(caller);

        GotLoadRewritePass.run(&mut graph, &Options::default()).unwrap();
        assert!(!graph.layout(caller).reduced_to_lea.contains(&3));
    }
}
