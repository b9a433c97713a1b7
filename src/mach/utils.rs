use crate::error;
use scroll::{self, Pread};

/// Peek the big-endian magic number at the front of `buffer`, without
/// committing to either endianness for anything that follows — Mach-O magic
/// values are palindromic-by-design across the two byte orders, so a
/// big-endian read is sufficient to distinguish fat vs. thin vs. garbage.
pub fn peek_magic<S: AsRef<[u8]>>(buffer: &S) -> error::Result<u32> {
    Ok(buffer.as_ref().pread_with::<u32>(0, scroll::BE)?)
}
