//! User-facing diagnostics: the `ld:`/`ld64 warning:`-prefixed product
//! output specified in SPEC_FULL.md §7, kept distinct from the `log` crate's
//! internal tracing channel (§4.8). These always go to stderr regardless of
//! `RUST_LOG`, because they're the linker's actual output, not debug noise.

/// Prints a fatal-diagnostic-shaped message immediately to stderr. The
/// actual process abort happens at the `main` call site once a
/// [`crate::error::LinkerError`] propagates up to it; this function exists
/// for the (rarer) case of a non-propagating informational error message.
pub fn error(msg: &str) {
    eprintln!("ld: {}", msg);
}

/// A non-fatal diagnostic. The pipeline continues.
pub fn warning(msg: &str) {
    eprintln!("ld64 warning: {}", msg);
    #[cfg(feature = "log")]
    log::warn!("{}", msg);
}

/// `[Logging for XBS] ...` trace line format, gated on `LD_TRACE_ARCHIVES` /
/// `LD_TRACE_DYLIBS` per SPEC_FULL.md §4.7.
pub fn trace_line(kind: &str, path: &str) -> String {
    format!("[Logging for XBS] {}: {}", kind, path)
}

/// Strips the Itanium `_Z`/`__Z` mangling marker for display when
/// `demangleSymbols` is enabled. This crate does not vendor a full C++
/// demangler (see SPEC_FULL.md §4.2): it recognizes the marker and falls
/// back to the raw name for anything it can't confidently decode.
pub fn demangle_for_display(name: &[u8]) -> String {
    let s = String::from_utf8_lossy(name);
    if let Some(rest) = s.strip_prefix("__Z").or_else(|| s.strip_prefix("_Z")) {
        format!("{} (mangled)", rest)
    } else {
        s.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangle_strips_marker_but_does_not_fully_decode() {
        assert_eq!(demangle_for_display(b"__Z3fooi"), "3fooi (mangled)");
        assert_eq!(demangle_for_display(b"_foo"), "_foo");
    }
}
