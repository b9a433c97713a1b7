//! A Mach-o fat binary is a multi-architecture binary container.

use core::fmt;

use scroll::{self, Pread};

use crate::error::{self, LinkerError};
use crate::mach::constants::cputype;

pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_CIGAM: u32 = 0xbebafeca;

#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// The Mach-o `FatHeader` always has its data bigendian
pub struct FatHeader {
    /// The magic number, `cafebabe`
    pub magic: u32,
    /// How many fat architecture headers there are
    pub nfat_arch: u32,
}

pub const SIZEOF_FAT_HEADER: usize = 8;

impl fmt::Debug for FatHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "0x{:x} nfat_arch: {}", self.magic, self.nfat_arch)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// The Mach-o `FatArch` always has its data bigendian
pub struct FatArch {
    /// What kind of CPU this binary is
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Where in the fat binary it starts
    pub offset: u32,
    /// How big the binary is
    pub size: u32,
    pub align: u32,
}

pub const SIZEOF_FAT_ARCH: usize = 20;

impl fmt::Debug for FatArch {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("FatArch")
            .field("cputype", &cputype::cpu_type_to_str(self.cputype))
            .field("cpusubtype", &self.cpusubtype)
            .field("offset", &format_args!("{:#x}", &self.offset))
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

impl FatHeader {
    /// Parse a mach-o fat header from `bytes`.
    pub fn parse(bytes: &[u8]) -> error::Result<FatHeader> {
        let mut offset = 0;
        let magic = bytes.gread_with(&mut offset, scroll::BE)?;
        let nfat_arch = bytes.gread_with(&mut offset, scroll::BE)?;
        Ok(FatHeader { magic, nfat_arch })
    }
}

impl FatArch {
    /// Get the slice of bytes this header describes from `bytes`.
    pub fn slice<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let start = self.offset as usize;
        let end = (self.offset + self.size) as usize;
        &bytes[start..end]
    }

    /// Whether this fat header describes a 64-bit binary.
    pub fn is_64(&self) -> bool {
        self.cputype & cputype::CPU_ARCH_ABI64 != 0
    }

    pub fn parse_arches<B: AsRef<[u8]>>(
        bytes: B,
        mut offset: usize,
        count: usize,
    ) -> error::Result<Vec<Self>> {
        let mut archs = Vec::with_capacity(count);
        let bytes = bytes.as_ref();
        let offset = &mut offset;
        for _ in 0..count {
            archs.push(bytes.gread_with::<FatArch>(offset, scroll::BE)?);
        }
        Ok(archs)
    }

    pub fn parse(bytes: &[u8]) -> error::Result<Vec<Self>> {
        let header = FatHeader::parse(bytes)?;
        FatArch::parse_arches(bytes, SIZEOF_FAT_HEADER, header.nfat_arch as usize)
    }

    pub fn find_cputype(arches: &[Self], cputype: u32) -> Option<&Self> {
        arches.iter().find(|arch| arch.cputype == cputype)
    }

    /// Architecture-slice selection per the fat-file orchestration rule:
    /// prefer an exact `(cputype, cpusubtype)` match, fall back to the first
    /// slice with a matching `cputype`, else fail.
    pub fn select<'a>(
        arches: &'a [Self],
        cputype: u32,
        cpusubtype: u32,
    ) -> error::Result<&'a Self> {
        if let Some(exact) = arches
            .iter()
            .find(|a| a.cputype == cputype && a.cpusubtype == cpusubtype)
        {
            return Ok(exact);
        }
        if let Some(any_subtype) = Self::find_cputype(arches, cputype) {
            return Ok(any_subtype);
        }
        Err(LinkerError::Input(format!(
            "missing required architecture {} in fat file",
            cputype::cpu_type_to_str(cputype)
        )))
    }
}

#[cfg(feature = "std")]
/// A Mach-o multi architecture (Fat) binary container.
pub struct MultiArch<'a> {
    data: &'a [u8],
    pub narches: usize,
}

#[cfg(feature = "std")]
impl<'a> MultiArch<'a> {
    /// Lazily construct `Self`.
    pub fn new(bytes: &'a [u8]) -> error::Result<Self> {
        let header = FatHeader::parse(bytes)?;
        Ok(MultiArch {
            data: bytes,
            narches: header.nfat_arch as usize,
        })
    }

    /// Return all the architectures in this binary.
    pub fn arches(&self) -> error::Result<Vec<FatArch>> {
        FatArch::parse_arches(self.data, SIZEOF_FAT_HEADER, self.narches)
    }

    /// Select the slice matching `(cputype, cpusubtype)` and return its raw
    /// bytes, re-slicing the mmap so downstream parsing sees offset 0.
    pub fn slice_for(&self, cputype: u32, cpusubtype: u32) -> error::Result<&'a [u8]> {
        let arches = self.arches()?;
        let arch = FatArch::select(&arches, cputype, cpusubtype)?;
        Ok(arch.slice(self.data))
    }
}

#[cfg(feature = "std")]
impl<'a> fmt::Debug for MultiArch<'a> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("MultiArch")
            .field("arches:", &self.arches().unwrap_or_default())
            .field("data", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arch(cputype: u32, cpusubtype: u32) -> FatArch {
        FatArch {
            cputype,
            cpusubtype,
            offset: 0,
            size: 0,
            align: 0,
        }
    }

    #[test]
    fn select_prefers_exact_subtype_match() {
        let arches = vec![arch(0x0100000c, 0), arch(0x0100000c, 2)];
        let picked = FatArch::select(&arches, 0x0100000c, 2).unwrap();
        assert_eq!(picked.cpusubtype, 2);
    }

    #[test]
    fn select_falls_back_to_cputype_only() {
        let arches = vec![arch(0x0100000c, 5)];
        let picked = FatArch::select(&arches, 0x0100000c, 0).unwrap();
        assert_eq!(picked.cpusubtype, 5);
    }

    #[test]
    fn select_fails_when_architecture_missing() {
        let arches = vec![arch(7, 3)];
        assert!(FatArch::select(&arches, 0x0100000c, 0).is_err());
    }
}
