//! C1 — the atom graph: the universal intermediate representation every
//! input-file parser yields, regardless of whether it came from a
//! relocatable object, an archive member, a dylib proxy, or a synthetic
//! marker this crate manufactures itself (`__dso_handle`, `__mh_*_header`,
//! `__PAGEZERO`, a custom stack).
//!
//! Atoms are bump-allocated out of a [`typed_arena::Arena`] owned by
//! [`crate::linker::Linker`] and referenced everywhere else by [`AtomId`], a
//! typed index — never by long-lived `&Atom` borrow or raw pointer. This is
//! the concrete realization of the design note in SPEC_FULL.md §9: it
//! sidesteps the self-referential-graph problem the fixup-target/atom
//! back-reference would otherwise create.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;

/// A typed index into the linker's atom arena. `NonZeroU32` so
/// `Option<AtomId>` is a free `u32`, matching the "arena-of-indices" of the
/// indirect binding table (`Vec<Option<AtomId>>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(NonZeroU32);

impl AtomId {
    pub fn new(index: u32) -> Self {
        AtomId(NonZeroU32::new(index + 1).expect("index + 1 is never zero"))
    }

    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// How an atom's definition was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition {
    /// A normal, initialized definition from an object file.
    Regular,
    /// An uninitialized common; may be replaced by a `Regular` or merged
    /// with other tentatives depending on `-commons` mode.
    Tentative,
    /// A fixed-address absolute symbol (`N_ABS`); never relocated.
    Absolute,
    /// Defined in a dylib; resolved just-in-time by [`crate::input`].
    Proxy,
}

/// Export/visibility scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Hidden entirely, not present in any symbol table (`static` linkage).
    TranslationUnit,
    /// File-local to the object but visible to other atoms in the same
    /// linkage unit (private extern / `__attribute__((visibility("hidden")))`).
    LinkageUnit,
    /// Exported; visible to other images.
    Global,
}

/// Coalescing policy consulted by [`crate::symtab::SymbolTable::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    /// Never merge with another atom of the same name; every instance is
    /// kept (e.g. `N_ABS`, non-coalesceable regulars under `-interposable`).
    Never,
    /// Merge purely by name; the override matrix in §4.2 decides the
    /// survivor.
    ByName,
    /// Merge when both name *and* content are equal (cstrings, literals).
    ByNameAndContent,
    /// Merge when both name and the reference graph are equal (non-lazy
    /// pointers, CFStrings, ObjC class-refs).
    ByNameAndReferences,
}

/// Symbol-table inclusion policy for the final image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTableInclusion {
    NotIn,
    NotInFinalImage,
    In,
    InAndNeverStrip,
    InAsAbsolute,
    InWithRandomAutoStripLabel,
}

/// Content classification, used by C4's section-merge table and by C2's
/// by-content coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Unclassified,
    Code,
    CString,
    CFString,
    UTF16String,
    Literal4,
    Literal8,
    Literal16,
    NonLazyPointer,
    LazyPointer,
    Stub,
    StubHelper,
    Cfi,
    Lsda,
    CompactUnwind,
    Tlv,
    TlvZeroFill,
    ZeroFill,
    MachHeader,
    DyldInfo,
}

/// An input section: segment+section name pair plus the type the §4.4
/// section-merge table switches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Section {
    pub segment_name: String,
    pub section_name: String,
    pub content_type: ContentType,
}

impl Section {
    pub fn new(segment_name: impl Into<String>, section_name: impl Into<String>, content_type: ContentType) -> Self {
        Section { segment_name: segment_name.into(), section_name: section_name.into(), content_type }
    }
}

/// Raw bytes an atom reveals on demand. Parsers point into the mmap'd input
/// file; synthetic atoms and `-sectcreate` blobs own their bytes.
#[derive(Debug, Clone)]
pub enum AtomContent {
    /// Borrowed content, copied out of the source file at parse time (the
    /// arena owns atoms for the process lifetime, so we copy rather than
    /// thread the mmap's lifetime through every downstream structure — see
    /// DESIGN.md for the tradeoff this crate took here).
    Bytes(Vec<u8>),
    /// `size` zero bytes; never actually materialized until the writer asks.
    ZeroFill(usize),
    /// A dylib proxy: no bytes, resolved at bind time.
    Proxy,
    /// `__dso_handle`/`__mh_*_header`/`__PAGEZERO`/custom-stack — markers
    /// the writer or layout stage special-cases instead of treating as
    /// ordinary content.
    Synthetic(SyntheticKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticKind {
    DsoHandle,
    MachHeader,
    PageZero,
    CustomStack,
}

/// Binding state of a [`Fixup`]'s reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    None,
    /// Not yet resolved; carries a name looked up in `unbound_name`.
    ByNameUnbound,
    /// Resolved directly to an atom (no further indirection possible, e.g.
    /// intra-atom references created by a pass after resolution).
    DirectlyBound,
    /// Resolved through [`crate::symtab::SymbolTable`]'s indirect binding
    /// table; the canonical way coalesced duplicates get redirected.
    IndirectlyBound,
    /// Resolved by content/reference-graph equality rather than by name.
    ByContentBound,
}

/// ~80 architecture-specific fixup operations, grouped into families per the
/// design note in SPEC_FULL.md §9. See [`crate::fixup`] for the engine that
/// interprets these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    // --- Set family: load a value into the per-atom accumulator ---
    SetTargetAddress,
    SetTargetImageOffset,
    SetTargetSectionOffset,
    SetTargetTLVTemplateOffset,
    SetLazyOffset,

    // --- Arithmetic family ---
    SubtractTargetAddress,
    AddAddend,
    SubtractAddend,

    // --- Store family: generic width/endian stores ---
    Store8,
    StoreLittleEndian16,
    StoreLittleEndian32,
    StoreLittleEndian64,
    StoreBigEndian16,
    StoreBigEndian32,
    StoreBigEndian64,
    StoreLittleEndianLow24of32,
    StoreBigEndianLow24of32,

    // --- x86 / x86_64 PC-relative stores ---
    StoreX86BranchPCRel32,
    StoreX86PCRel32,
    StoreX86PCRel32_1,
    StoreX86PCRel32_2,
    StoreX86PCRel32_4,
    StoreX86PCRel32GOTLoad,
    StoreX86PCRel32GOTLoadNowLEA,
    StoreX86PCRel32TLVLoad,
    StoreX86PCRel32TLVLoadNowLEA,
    StoreX86Abs32TLVLoad,
    StoreX86Abs32TLVLoadNowLEA,

    // --- ARM stores ---
    StoreARMBranch24,
    StoreThumbBranch22,
    StoreARMLoad12,
    StoreARMLow16,
    StoreARMHigh16,
    StoreThumbLow16,
    StoreThumbHigh16,

    // --- PPC stores ---
    StorePPCBranch14,
    StorePPCBranch24,
    StorePPCAbsLow14,
    StorePPCAbsLow16,
    StorePPCAbsHigh16,
    StorePPCAbsHigh16AddLow,

    // --- Set+Store fusions ---
    StoreTargetAddressLittleEndian32,
    StoreTargetAddressLittleEndian64,
    StoreTargetAddressBigEndian32,
    StoreTargetAddressBigEndian64,

    // --- dtrace ---
    DtraceNop,
    DtraceZeroClear,

    // --- lazy binding ---
    LazyTarget,
}

impl FixupKind {
    /// Whether this kind terminates a cluster by writing the accumulator
    /// (as opposed to a `Set`/`Arith` kind that only builds state).
    pub fn is_store(self) -> bool {
        !matches!(
            self,
            FixupKind::SetTargetAddress
                | FixupKind::SetTargetImageOffset
                | FixupKind::SetTargetSectionOffset
                | FixupKind::SetTargetTLVTemplateOffset
                | FixupKind::SetLazyOffset
                | FixupKind::SubtractTargetAddress
                | FixupKind::AddAddend
                | FixupKind::SubtractAddend
                | FixupKind::LazyTarget
        )
    }
}

/// Payload carried by a [`Fixup`], selected by its [`Binding`].
#[derive(Debug, Clone, Copy)]
pub enum FixupTarget {
    None,
    /// Direct/indirect target, after resolution: an atom id plus a signed
    /// addend.
    Atom { atom: AtomId, addend: i64 },
    /// `ByNameUnbound`: index into the parser's pending-name table, resolved
    /// during C2 resolution and replaced with `Atom`/indirect slot.
    PendingName(u32),
}

/// Position within a multi-step cluster. `k1of1` is a self-contained fixup;
/// `k1of3 k2of3 k3of3` must be processed as one atomic group per the
/// `k1ofN (k{2..N-1}ofN)* kNofN` invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterPosition {
    pub index: u8,
    pub count: u8,
}

impl ClusterPosition {
    pub const SINGLE: ClusterPosition = ClusterPosition { index: 1, count: 1 };

    pub fn is_first(self) -> bool {
        self.index == 1
    }

    pub fn is_last(self) -> bool {
        self.index == self.count
    }
}

/// One step in an atom's in-place editing program.
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    pub offset_in_atom: u32,
    pub cluster: ClusterPosition,
    pub kind: FixupKind,
    pub binding: Binding,
    pub target: FixupTarget,
    /// `contentAddendOnly` / `contentDeltaToAddendOnly`: skip target-address
    /// resolution and leave only the addend in the content, because a
    /// classic relocation entry (or the x86_64 external-reloc path) carries
    /// the target instead.
    pub content_addend_only: bool,
    pub content_delta_to_addend_only: bool,
}

/// The unit of linkage. Immutable identity; mutable layout fields are held
/// separately in [`AtomLayout`] so resolution/coalescing never needs a
/// mutable borrow of the arena-owned `Atom` itself.
#[derive(Debug, Clone)]
pub struct Atom {
    pub name: Vec<u8>,
    pub definition: Definition,
    pub scope: Scope,
    pub combine: Combine,
    pub symbol_table_inclusion: SymbolTableInclusion,
    pub content_type: ContentType,
    pub section: Section,
    /// `(p, modulus)`: `addr mod 2^p == modulus`.
    pub alignment: (u8, u32),
    pub size: u64,
    pub object_address: u64,
    pub auto_hide: bool,
    pub overrides_dylib_weak_def: bool,
    pub thumb: bool,
    pub weak_imported: bool,
    pub weak_def: bool,
    /// An LTO-temporary pseudo-regular, lowest priority in the "both weak"
    /// tie-break chain. This crate recognizes LTO objects but declines to
    /// lower them (see SPEC_FULL.md Non-goals); the flag still participates
    /// in the override matrix for atoms a pass may synthesize with this
    /// marker set.
    pub is_lto_temporary: bool,
    /// For `Definition::Proxy` atoms, the dylib ordinal `compressedOrdinalForAtom`
    /// would emit for a bind through this atom: the 1-based position of its
    /// owning dylib in `_dylibsToLoad`, or one of the `ORDINAL_*` specials in
    /// `fixup`. Meaningless for non-proxy atoms.
    pub dylib_ordinal: i64,
    pub content: AtomContent,
    pub fixups: Vec<Fixup>,
    /// Fixups marking this atom as a "group subordinate" of another (e.g. an
    /// FDE/LSDA pair, or an ObjC class's metadata members): when the parent
    /// is coalesced away, subordinates cascade the mark. Stored as atom ids
    /// once resolved.
    pub group_subordinates: Vec<AtomId>,
}

impl Atom {
    pub fn alignment_trailing_zeros(&self) -> u8 {
        self.alignment.0
    }
}

/// Mutable fields assigned after resolution: final section placement,
/// address, and the "coalesced away" mark. Indexed in parallel with the
/// atom arena by [`AtomId`].
#[derive(Debug, Clone, Default)]
pub struct AtomLayout {
    pub coalesced_away: bool,
    pub final_section: Option<u32>,
    pub section_offset: u64,
    pub final_address: u64,
    /// `offset_in_atom` of every `StoreX86PCRel32GOTLoad`/`StoreX86PCRel32TLVLoad`/
    /// `StoreX86Abs32TLVLoad` fixup [`crate::pass::GotLoadRewritePass`] has
    /// proven binds directly rather than through an indirection slot — the
    /// fixup engine treats these exactly like their `*NowLEA` counterpart.
    /// A side table rather than a `Fixup::kind` rewrite because `Atom` (and
    /// its `fixups`) is frozen for the arena's lifetime once allocated; see
    /// the safety note on `AtomGraph::get`.
    pub reduced_to_lea: HashSet<u32>,
}

/// Owns every atom for the process lifetime and the side table of mutable
/// layout fields indexed in parallel by [`AtomId`].
pub struct AtomGraph {
    arena: typed_arena::Arena<Atom>,
    atoms: Vec<*const Atom>,
    pub layout: Vec<AtomLayout>,
    by_name_index: HashMap<Vec<u8>, AtomId>,
    /// Names referenced by a [`FixupTarget::PendingName`] before the full
    /// symbol table is known. Interned rather than stored inline on
    /// [`Fixup`] so `Fixup` can stay `Copy`; looked up by index through
    /// [`crate::symtab::SymbolTable`] every time a fixup is processed,
    /// which is what lets an `Atom`'s fixups stay immutable for its entire
    /// lifetime in the arena (see the safety note on `get`).
    pending_names: Vec<Vec<u8>>,
    pending_names_index: HashMap<Vec<u8>, u32>,
}

impl AtomGraph {
    pub fn new() -> Self {
        AtomGraph {
            arena: typed_arena::Arena::new(),
            atoms: Vec::new(),
            layout: Vec::new(),
            by_name_index: HashMap::new(),
            pending_names: Vec::new(),
            pending_names_index: HashMap::new(),
        }
    }

    /// Interns `name`, returning a stable index for use in
    /// [`FixupTarget::PendingName`]. Repeated interning of the same name
    /// returns the same index.
    pub fn intern_pending_name(&mut self, name: &[u8]) -> u32 {
        if let Some(&idx) = self.pending_names_index.get(name) {
            return idx;
        }
        let idx = self.pending_names.len() as u32;
        self.pending_names.push(name.to_vec());
        self.pending_names_index.insert(name.to_vec(), idx);
        idx
    }

    pub fn pending_name(&self, index: u32) -> &[u8] {
        &self.pending_names[index as usize]
    }

    /// Allocates `atom` and returns its id. Does not touch the symbol
    /// table — see [`crate::symtab::SymbolTable::add`] for that.
    pub fn alloc(&mut self, atom: Atom) -> AtomId {
        let id = AtomId::new(self.atoms.len() as u32);
        let stored: &mut Atom = self.arena.alloc(atom);
        self.atoms.push(stored as *const Atom);
        self.layout.push(AtomLayout::default());
        if !stored.name.is_empty() {
            self.by_name_index.entry(stored.name.clone()).or_insert(id);
        }
        id
    }

    pub fn get(&self, id: AtomId) -> &Atom {
        // SAFETY: `atoms` holds pointers into `arena`'s bump storage, which
        // never moves or frees entries once allocated. We never mutate an
        // `Atom` after `alloc`, so an outstanding `&Atom` borrowing `self`
        // never aliases a live `&mut Atom`.
        unsafe { &*self.atoms[id.index()] }
    }

    pub fn layout(&self, id: AtomId) -> &AtomLayout {
        &self.layout[id.index()]
    }

    pub fn layout_mut(&mut self, id: AtomId) -> &mut AtomLayout {
        &mut self.layout[id.index()]
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = AtomId> {
        (0..self.atoms.len() as u32).map(AtomId::new)
    }

    /// Iterates atoms in insertion order, skipping any already marked
    /// coalesced-away — the deterministic order C4/C5 build sections and
    /// addresses from.
    pub fn live_atoms(&self) -> impl Iterator<Item = AtomId> + '_ {
        self.ids().filter(move |&id| !self.layout(id).coalesced_away)
    }
}

impl Default for AtomGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_atom(name: &str) -> Atom {
        Atom {
            name: name.as_bytes().to_vec(),
            definition: Definition::Regular,
            scope: Scope::Global,
            combine: Combine::ByName,
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
        }
    }

    #[test]
    fn alloc_assigns_increasing_ids_and_layout_slots() {
        let mut graph = AtomGraph::new();
        let a = graph.alloc(dummy_atom("_a"));
        let b = graph.alloc(dummy_atom("_b"));
        assert_ne!(a, b);
        assert_eq!(graph.get(a).name, b"_a");
        assert_eq!(graph.get(b).name, b"_b");
        assert!(!graph.layout(a).coalesced_away);
    }

    #[test]
    fn coalescing_a_live_atom_removes_it_from_live_atoms() {
        let mut graph = AtomGraph::new();
        let a = graph.alloc(dummy_atom("_a"));
        let b = graph.alloc(dummy_atom("_b"));
        graph.layout_mut(a).coalesced_away = true;
        let live: Vec<AtomId> = graph.live_atoms().collect();
        assert_eq!(live, vec![b]);
    }
}
