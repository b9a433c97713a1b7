//! Error taxonomy for the linker core.
//!
//! A single enum carries every fatal condition the pipeline can raise, grouped
//! along the lines the driver needs to report them: usage, input, resolution,
//! layout, fixup, and write failures. Diagnostics decorate the message with an
//! architecture prefix only at the top of `main`; nothing downstream of the
//! core formats its own prefix.

use alloc::string::String;
use core::fmt;
use core::result;

#[derive(Debug)]
pub enum LinkerError {
    /// Bad option combination or unsupported flag under strict parsing.
    Usage(String),
    /// File missing, unreadable, unrecognized format, or wrong architecture.
    Input(String),
    /// Duplicate symbol, undefined symbol under `-undefined error`, commons conflict.
    Resolution(String),
    /// Address exceeds architecture maximum, stack overlaps shared region, etc.
    Layout(String),
    /// Out-of-range displacement, unexpected opcode during rewrite, missing binding.
    Fixup(String),
    /// Output path not writable, or allocation of the output buffer failed.
    Write(String),
    /// A lower-level `scroll` parse failure, surfaced as an `Input` error by
    /// the parsers but kept distinct here so the original cause isn't lost.
    Scroll(scroll::Error),
}

impl fmt::Display for LinkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkerError::Usage(msg) => write!(f, "{}", msg),
            LinkerError::Input(msg) => write!(f, "{}", msg),
            LinkerError::Resolution(msg) => write!(f, "{}", msg),
            LinkerError::Layout(msg) => write!(f, "{}", msg),
            LinkerError::Fixup(msg) => write!(f, "{}", msg),
            LinkerError::Write(msg) => write!(f, "{}", msg),
            LinkerError::Scroll(err) => write!(f, "{}", err),
        }
    }
}

impl From<scroll::Error> for LinkerError {
    fn from(err: scroll::Error) -> Self {
        LinkerError::Scroll(err)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LinkerError {}

#[cfg(feature = "std")]
impl From<std::io::Error> for LinkerError {
    fn from(err: std::io::Error) -> Self {
        LinkerError::Write(err.to_string())
    }
}

pub type Result<T> = result::Result<T, LinkerError>;
