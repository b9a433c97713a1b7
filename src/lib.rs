//! `machld` — a Mach-O static linker.
//!
//! The crate is split the way the component table in the design doc is:
//! [`mach`] and [`archive`] are format readers/definitions shared by every
//! stage; [`atom`] is the universal intermediate representation every parser
//! produces; [`symtab`] resolves and coalesces it; [`input`] drives the
//! parsers and just-in-time archive/dylib resolution; [`sections`] and
//! [`layout`] assign final sections and addresses; [`fixup`] and
//! [`mach::writer`] turn laid-out atoms into bytes. [`linker`] is the driver
//! that sequences all of the above; [`options`] is what feeds it.

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(not(feature = "alloc"))]
mod alloc {
    pub use std::{alloc, borrow, boxed, collections, format, string, vec};
}

pub mod container;
pub mod error;
pub mod options;

pub mod mach;

#[cfg(feature = "std")]
pub mod archive;

#[cfg(feature = "std")]
pub mod atom;
#[cfg(feature = "std")]
pub mod diagnostics;
#[cfg(feature = "std")]
pub mod fixup;
#[cfg(feature = "std")]
pub mod input;
#[cfg(feature = "std")]
pub mod layout;
#[cfg(feature = "std")]
pub mod linker;
#[cfg(feature = "std")]
pub mod mapfile;
#[cfg(feature = "std")]
pub mod pass;
#[cfg(feature = "std")]
pub mod sections;
#[cfg(feature = "std")]
pub mod stabs;
#[cfg(feature = "std")]
pub(crate) mod strtab;
#[cfg(feature = "std")]
pub mod symtab;

#[cfg(feature = "std")]
pub use crate::linker::Linker;
pub use crate::error::{LinkerError, Result};
