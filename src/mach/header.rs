//! `mach_header` / `mach_header_64` and the `MH_*` constants.

use crate::container::{Container, Ctx};
use crate::error;
use scroll::ctx::SizeWith;
use scroll::{Pread, Pwrite};

// Constants for the flags field of the mach_header
/// the object file has no undefined references
pub const MH_NOUNDEFS: u32 = 0x1;
/// the object file is the output of an incremental link against a base file and can't be
/// link edited again
pub const MH_INCRLINK: u32 = 0x2;
/// the object file is input for the dynamic linker and can't be staticly link edited again
pub const MH_DYLDLINK: u32 = 0x4;
/// the object file's undefined references are bound by the dynamic linker when loaded.
pub const MH_BINDATLOAD: u32 = 0x8;
/// the file has its dynamic undefined references prebound.
pub const MH_PREBOUND: u32 = 0x10;
/// the file has its read-only and read-write segments split
pub const MH_SPLIT_SEGS: u32 = 0x20;
/// the image is using two-level name space bindings
pub const MH_TWOLEVEL: u32 = 0x80;
/// the executable is forcing all images to use flat name space bindings
pub const MH_FORCE_FLAT: u32 = 0x100;
/// this umbrella guarantees no multiple defintions of symbols in its sub-images so the
/// two-level namespace hints can always be used.
pub const MH_NOMULTIDEFS: u32 = 0x200;
/// the binary is not prebound but can have its prebinding redone.
pub const MH_PREBINDABLE: u32 = 0x800;
pub const MH_ALLMODSBOUND: u32 = 0x1000;
/// safe to divide up the sections into sub-sections via symbols for dead code stripping
pub const MH_SUBSECTIONS_VIA_SYMBOLS: u32 = 0x2000;
pub const MH_CANONICAL: u32 = 0x4000;
/// the final linked image contains external weak symbols
pub const MH_WEAK_DEFINES: u32 = 0x8000;
/// the final linked image uses weak symbols
pub const MH_BINDS_TO_WEAK: u32 = 0x10000;
pub const MH_ALLOW_STACK_EXECUTION: u32 = 0x20000;
pub const MH_ROOT_SAFE: u32 = 0x40000;
pub const MH_SETUID_SAFE: u32 = 0x80000;
pub const MH_NO_REEXPORTED_DYLIBS: u32 = 0x100000;
/// the OS will load the main executable at a random address.
pub const MH_PIE: u32 = 0x200000;
pub const MH_DEAD_STRIPPABLE_DYLIB: u32 = 0x400000;
/// Contains a section of type S_THREAD_LOCAL_VARIABLES
pub const MH_HAS_TLV_DESCRIPTORS: u32 = 0x800000;
pub const MH_NO_HEAP_EXECUTION: u32 = 0x1000000;
pub const MH_APP_EXTENSION_SAFE: u32 = 0x02000000;

#[inline(always)]
pub fn flag_to_str(flag: u32) -> &'static str {
    match flag {
        MH_NOUNDEFS => "MH_NOUNDEFS",
        MH_INCRLINK => "MH_INCRLINK",
        MH_DYLDLINK => "MH_DYLDLINK",
        MH_BINDATLOAD => "MH_BINDATLOAD",
        MH_PREBOUND => "MH_PREBOUND",
        MH_SPLIT_SEGS => "MH_SPLIT_SEGS",
        MH_TWOLEVEL => "MH_TWOLEVEL",
        MH_FORCE_FLAT => "MH_FORCE_FLAT",
        MH_NOMULTIDEFS => "MH_NOMULTIDEFS",
        MH_PREBINDABLE => "MH_PREBINDABLE",
        MH_ALLMODSBOUND => "MH_ALLMODSBOUND",
        MH_SUBSECTIONS_VIA_SYMBOLS => "MH_SUBSECTIONS_VIA_SYMBOLS",
        MH_CANONICAL => "MH_CANONICAL",
        MH_WEAK_DEFINES => "MH_WEAK_DEFINES",
        MH_BINDS_TO_WEAK => "MH_BINDS_TO_WEAK",
        MH_ALLOW_STACK_EXECUTION => "MH_ALLOW_STACK_EXECUTION",
        MH_ROOT_SAFE => "MH_ROOT_SAFE",
        MH_SETUID_SAFE => "MH_SETUID_SAFE",
        MH_NO_REEXPORTED_DYLIBS => "MH_NO_REEXPORTED_DYLIBS",
        MH_PIE => "MH_PIE",
        MH_DEAD_STRIPPABLE_DYLIB => "MH_DEAD_STRIPPABLE_DYLIB",
        MH_HAS_TLV_DESCRIPTORS => "MH_HAS_TLV_DESCRIPTORS",
        MH_NO_HEAP_EXECUTION => "MH_NO_HEAP_EXECUTION",
        MH_APP_EXTENSION_SAFE => "MH_APP_EXTENSION_SAFE",
        _ => "UNKNOWN FLAG",
    }
}

/// Mach Header magic constant
pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
/// Mach Header magic constant for 64-bit
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;

// Constants for the filetype field of the mach_header
/// relocatable object file
pub const MH_OBJECT: u32 = 0x1;
/// demand paged executable file
pub const MH_EXECUTE: u32 = 0x2;
/// fixed VM shared library file
pub const MH_FVMLIB: u32 = 0x3;
/// core file
pub const MH_CORE: u32 = 0x4;
/// preloaded executable file
pub const MH_PRELOAD: u32 = 0x5;
/// dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// dynamic link editor
pub const MH_DYLINKER: u32 = 0x7;
/// dynamically bound bundle file
pub const MH_BUNDLE: u32 = 0x8;
/// shared library stub for static linking only, no section contents
pub const MH_DYLIB_STUB: u32 = 0x9;
/// companion file with only debug sections
pub const MH_DSYM: u32 = 0xa;
/// x86_64 kexts
pub const MH_KEXT_BUNDLE: u32 = 0xb;

pub fn filetype_to_str(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "OBJECT",
        MH_EXECUTE => "EXECUTE",
        MH_FVMLIB => "FVMLIB",
        MH_CORE => "CORE",
        MH_PRELOAD => "PRELOAD",
        MH_DYLIB => "DYLIB",
        MH_DYLINKER => "DYLINKER",
        MH_BUNDLE => "BUNDLE",
        MH_DYLIB_STUB => "DYLIB_STUB",
        MH_DSYM => "DSYM",
        MH_KEXT_BUNDLE => "KEXT_BUNDLE",
        _ => "UNKNOWN FILETYPE",
    }
}

pub const SIZEOF_MACH_HEADER_32: usize = 28;
pub const SIZEOF_MACH_HEADER_64: usize = 32;

/// A generalized, width-independent view of `mach_header`/`mach_header_64`.
/// `reserved` is `0` and unused for 32-bit images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl Header {
    pub fn is_64(&self) -> bool {
        matches!(self.magic, MH_MAGIC_64 | MH_CIGAM_64)
    }

    pub fn is_little_endian(&self) -> bool {
        matches!(self.magic, MH_MAGIC | MH_MAGIC_64)
    }

    /// The `(container, endian)` context implied by this header's magic, for
    /// use parsing everything that follows it.
    pub fn ctx(&self) -> error::Result<Ctx> {
        let le = if self.is_little_endian() {
            scroll::Endian::Little
        } else {
            scroll::Endian::Big
        };
        let container = if self.is_64() {
            Container::Big
        } else {
            Container::Little
        };
        Ok(Ctx::new(container, le))
    }

    pub fn size(&self) -> usize {
        if self.is_64() {
            SIZEOF_MACH_HEADER_64
        } else {
            SIZEOF_MACH_HEADER_32
        }
    }
}

impl scroll::ctx::TryFromCtx<'_, scroll::Endian> for Header {
    type Error = scroll::Error;
    fn try_from_ctx(src: &[u8], le: scroll::Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let magic = src.gread_with::<u32>(offset, scroll::Endian::Big)?;
        // the magic is read big-endian above purely to detect it; re-read
        // every remaining field with the endianness it actually declares.
        let le = match magic {
            MH_MAGIC | MH_MAGIC_64 => scroll::Endian::Little,
            MH_CIGAM | MH_CIGAM_64 => scroll::Endian::Big,
            _ => le,
        };
        *offset = 0;
        let magic: u32 = src.gread_with(offset, le)?;
        let cputype: u32 = src.gread_with(offset, le)?;
        let cpusubtype: u32 = src.gread_with(offset, le)?;
        let filetype: u32 = src.gread_with(offset, le)?;
        let ncmds: u32 = src.gread_with(offset, le)?;
        let sizeofcmds: u32 = src.gread_with(offset, le)?;
        let flags: u32 = src.gread_with(offset, le)?;
        let reserved = if matches!(magic, MH_MAGIC_64 | MH_CIGAM_64) {
            src.gread_with(offset, le)?
        } else {
            0
        };
        Ok((
            Header {
                magic,
                cputype,
                cpusubtype,
                filetype,
                ncmds,
                sizeofcmds,
                flags,
                reserved,
            },
            *offset,
        ))
    }
}

impl scroll::ctx::TryIntoCtx<Ctx> for Header {
    type Error = scroll::Error;
    fn try_into_ctx(self, dst: &mut [u8], ctx: Ctx) -> Result<usize, Self::Error> {
        let offset = &mut 0;
        dst.gwrite_with(self.magic, offset, ctx.le)?;
        dst.gwrite_with(self.cputype, offset, ctx.le)?;
        dst.gwrite_with(self.cpusubtype, offset, ctx.le)?;
        dst.gwrite_with(self.filetype, offset, ctx.le)?;
        dst.gwrite_with(self.ncmds, offset, ctx.le)?;
        dst.gwrite_with(self.sizeofcmds, offset, ctx.le)?;
        dst.gwrite_with(self.flags, offset, ctx.le)?;
        if ctx.is_big() {
            dst.gwrite_with(self.reserved, offset, ctx.le)?;
        }
        Ok(*offset)
    }
}

impl scroll::ctx::SizeWith<Ctx> for Header {
    fn size_with(ctx: &Ctx) -> usize {
        if ctx.is_big() {
            SIZEOF_MACH_HEADER_64
        } else {
            SIZEOF_MACH_HEADER_32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_64() {
        let h = Header {
            magic: MH_MAGIC_64,
            cputype: 0x0100_000c,
            cpusubtype: 0,
            filetype: MH_EXECUTE,
            ncmds: 3,
            sizeofcmds: 128,
            flags: MH_TWOLEVEL | MH_PIE,
            reserved: 0,
        };
        let ctx = h.ctx().unwrap();
        let mut buf = [0u8; SIZEOF_MACH_HEADER_64];
        buf.pwrite_with(h, 0, ctx).unwrap();
        let (back, size) = Header::try_from_ctx(&buf, scroll::Endian::Little).unwrap();
        assert_eq!(size, SIZEOF_MACH_HEADER_64);
        assert_eq!(back, h);
    }

    #[test]
    fn roundtrip_32_has_no_reserved_field() {
        let h = Header {
            magic: MH_MAGIC,
            cputype: 7,
            cpusubtype: 3,
            filetype: MH_OBJECT,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        };
        assert_eq!(Header::size_with(&h.ctx().unwrap()), SIZEOF_MACH_HEADER_32);
    }
}
