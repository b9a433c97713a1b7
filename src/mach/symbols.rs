//! "Nlist" style symbols: the classic Mach-O symbol table. Strippable, and
//! not the canonical place to look for exported symbols (see dyld export
//! trie parsing for that) — but the format the object/archive readers use to
//! build atoms, and the format C6's symbol-table encoder re-emits.

use crate::container::{self, Container};
use crate::error;
use crate::mach::load_command;
use core::fmt::{self, Debug};
use scroll::ctx::SizeWith;
use scroll::{self, ctx, Pread};

/// Mask over `n_type` selecting the STAB/PEXT/TYPE/EXT fields.
pub const N_STAB: u8 = 0xe0;
pub const N_PEXT: u8 = 0x10;
pub const N_TYPE: u8 = 0x0e;
pub const N_EXT: u8 = 0x01;

pub const N_UNDF: u8 = 0x0;
pub const N_ABS: u8 = 0x2;
pub const N_SECT: u8 = 0xe;
pub const N_INDR: u8 = 0xa;

/// `n_desc` bit indicating a weak/coalesced definition (`N_WEAK_DEF`).
pub const N_WEAK_DEF: u16 = 0x0080;
/// `n_desc` bit indicating a weak reference (`N_WEAK_REF`).
pub const N_WEAK_REF: u16 = 0x0040;

pub const NLIST_TYPE_MASK: u8 = N_TYPE;
pub const NLIST_TYPE_GLOBAL: u8 = 0x1;
pub const NLIST_TYPE_LOCAL: u8 = 0x0;

#[repr(C)]
#[derive(Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Nlist32 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u32,
}

pub const SIZEOF_NLIST_32: usize = 12;

impl Debug for Nlist32 {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "strx: {:04} type: {:#02x} sect: {:#x} desc: {:#03x} value: {:#x}",
            self.n_strx, self.n_type, self.n_sect, self.n_desc, self.n_value,
        )
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

impl Debug for Nlist64 {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "strx: {:04} type: {:#02x} sect: {:#x} desc: {:#03x} value: {:#x}",
            self.n_strx, self.n_type, self.n_sect, self.n_desc, self.n_value,
        )
    }
}

/// A width-generalized `nlist` entry, widened to `u64`/`usize` fields.
#[derive(Debug, Clone, Copy)]
pub struct Nlist {
    pub n_strx: usize,
    pub n_type: u8,
    pub n_sect: usize,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist {
    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    pub fn is_private_external(&self) -> bool {
        self.n_type & N_PEXT != 0
    }

    pub fn is_undefined(&self) -> bool {
        self.n_type & N_TYPE == N_UNDF && self.n_value == 0
    }

    pub fn is_absolute(&self) -> bool {
        self.n_type & N_TYPE == N_ABS
    }

    pub fn is_weak_def(&self) -> bool {
        self.n_desc & N_WEAK_DEF != 0
    }

    pub fn is_weak_ref(&self) -> bool {
        self.n_desc & N_WEAK_REF != 0
    }
}

impl ctx::SizeWith<container::Ctx> for Nlist {
    fn size_with(ctx: &container::Ctx) -> usize {
        match ctx.container {
            Container::Little => SIZEOF_NLIST_32,
            Container::Big => SIZEOF_NLIST_64,
        }
    }
}

impl From<Nlist32> for Nlist {
    fn from(nlist: Nlist32) -> Self {
        Nlist {
            n_strx: nlist.n_strx as usize,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect as usize,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value as u64,
        }
    }
}

impl From<Nlist64> for Nlist {
    fn from(nlist: Nlist64) -> Self {
        Nlist {
            n_strx: nlist.n_strx as usize,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect as usize,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value,
        }
    }
}

impl<'a> ctx::TryFromCtx<'a, (usize, container::Ctx)> for Nlist {
    type Error = scroll::Error;
    fn try_from_ctx(
        bytes: &'a [u8],
        (offset, container::Ctx { container, le }): (usize, container::Ctx),
    ) -> Result<(Self, usize), Self::Error> {
        match container {
            Container::Little => {
                let nlist: Nlist32 = bytes.pread_with(offset, le)?;
                Ok((nlist.into(), SIZEOF_NLIST_32))
            }
            Container::Big => {
                let nlist: Nlist64 = bytes.pread_with(offset, le)?;
                Ok((nlist.into(), SIZEOF_NLIST_64))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolsCtx {
    pub nsyms: usize,
    pub strtab: usize,
    pub ctx: container::Ctx,
}

/// A zero-copy "nlist" style symbol table ("stab"), including the string table.
pub struct Symbols<'a> {
    data: &'a [u8],
    start: usize,
    pub nsyms: usize,
    strtab: usize,
    ctx: container::Ctx,
}

impl<'a> Symbols<'a> {
    /// Creates a new symbol table with `count` elements, from the `start`
    /// offset, using the string table at `strtab`, with an explicit ctx.
    pub fn new(
        bytes: &'a [u8],
        start: usize,
        count: usize,
        strtab: usize,
        ctx: container::Ctx,
    ) -> error::Result<Symbols<'a>> {
        Ok(Symbols {
            data: bytes,
            start,
            nsyms: count,
            strtab,
            ctx,
        })
    }

    pub fn parse(
        bytes: &'a [u8],
        symtab: &load_command::SymtabCommand,
        ctx: container::Ctx,
    ) -> error::Result<Symbols<'a>> {
        Symbols::new(
            bytes,
            symtab.symoff as usize,
            symtab.nsyms as usize,
            symtab.stroff as usize,
            ctx,
        )
    }

    /// Parses a single Nlist symbol from the binary, with its accompanying name.
    pub fn get(&self, index: usize) -> scroll::Result<(&'a str, Nlist)> {
        let sym: Nlist = self
            .data
            .pread_with(self.start + (index * Nlist::size_with(&self.ctx)), self.ctx)?;
        let name = self.data.pread(self.strtab + sym.n_strx)?;
        Ok((name, sym))
    }

    pub fn iter(&self) -> impl Iterator<Item = scroll::Result<(&'a str, Nlist)>> + '_ {
        (0..self.nsyms).map(move |i| self.get(i))
    }
}

impl<'a> Debug for Symbols<'a> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(fmt, "Symbols: {{")?;
        for i in 0..self.nsyms {
            match self.get(i) {
                Ok((name, nlist)) => {
                    writeln!(
                        fmt,
                        "{: >10x} {} sect: {:#x} type: {:#02x} desc: {:#03x}",
                        nlist.n_value, name, nlist.n_sect, nlist.n_type, nlist.n_desc
                    )?;
                }
                Err(error) => {
                    writeln!(fmt, "  Bad symbol, index: {}, sym: {:?}", i, error)?;
                }
            }
        }
        writeln!(fmt, "}}")
    }
}
