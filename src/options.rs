//! Unified parsing options for binary formats
//!
//! This module provides common parsing options that can be used across
//! different binary formats (ELF, PE, Mach-O, etc.).

/// Binary parsing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Standard parsing mode - fails on malformed data
    Strict,
    /// Permissive parsing mode - attempts to recover from malformed data
    Permissive,
}

impl Default for ParseMode {
    fn default() -> Self {
        ParseMode::Strict
    }
}

impl ParseMode {
    /// Check if this is permissive mode
    pub(crate) fn is_permissive(&self) -> bool {
        matches!(self, ParseMode::Permissive)
    }

    /// Check if this is strict mode
    pub(crate) fn is_strict(&self) -> bool {
        matches!(self, ParseMode::Strict)
    }
}

/// Common parsing options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// The parsing mode to use
    pub parse_mode: ParseMode,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            parse_mode: ParseMode::Strict,
        }
    }
}

impl ParseOptions {
    /// Create new ParseOptions with default settings
    pub fn new() -> Self {
        Default::default()
    }

    /// Create ParseOptions with permissive mode enabled
    pub fn permissive() -> Self {
        ParseOptions {
            parse_mode: ParseMode::Permissive,
        }
    }

    /// Create ParseOptions with strict mode enabled
    pub fn strict() -> Self {
        ParseOptions {
            parse_mode: ParseMode::Strict,
        }
    }

    /// Set the parse mode
    pub fn with_parse_mode(mut self, parse_mode: ParseMode) -> Self {
        self.parse_mode = parse_mode;
        self
    }
}

/// The kind of Mach-O image this link produces (`mach_header.filetype`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    Dylib,
    Bundle,
    DynamicLinker,
    Object,
    Preload,
    KextBundle,
}

impl OutputKind {
    pub fn is_object(self) -> bool {
        matches!(self, OutputKind::Object)
    }

    pub fn filetype(self) -> u32 {
        use crate::mach::header::*;
        match self {
            OutputKind::Executable => MH_EXECUTE,
            OutputKind::Dylib => MH_DYLIB,
            OutputKind::Bundle => MH_BUNDLE,
            OutputKind::DynamicLinker => MH_DYLINKER,
            OutputKind::Object => MH_OBJECT,
            OutputKind::Preload => MH_PRELOAD,
            OutputKind::KextBundle => MH_KEXT_BUNDLE,
        }
    }
}

/// Dylib symbol-lookup namespace mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    TwoLevel,
    Flat,
    /// Two-level binary, flat lookup semantics (`-force_flat_namespace`).
    ForcedFlat,
}

/// `-commons` mode: how a tentative definition reconciles against a dylib's
/// export of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonsMode {
    UseDylibs,
    Override,
    Error,
}

/// `-undefined` mode: how an unresolved reference is handled once every
/// archive/dylib search has been exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefinedMode {
    Error,
    Warning,
    Suppress,
    DynamicLookup,
}

/// `-seg_addr_table`/UUID generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidMode {
    Content,
    Random,
    None,
}

/// `LD_TRACE_ARCHIVES`/`LD_TRACE_DYLIBS`/`LD_TRACE_FILE` environment knobs.
#[derive(Debug, Clone, Default)]
pub struct TraceFlags {
    pub archives: bool,
    pub dylibs: bool,
    pub file: Option<std::path::PathBuf>,
}

impl TraceFlags {
    pub fn from_env() -> Self {
        TraceFlags {
            archives: std::env::var_os("LD_TRACE_ARCHIVES").is_some(),
            dylibs: std::env::var_os("LD_TRACE_DYLIBS").is_some(),
            file: std::env::var_os("LD_TRACE_FILE").map(std::path::PathBuf::from),
        }
    }
}

/// The immutable value every other component consumes. Built in two stages
/// (§4.7): a `clap`-derived `RawArgs` capturing the literal CLI surface, then
/// validated/lowered into this struct.
#[derive(Debug, Clone)]
pub struct Options {
    pub output_kind: OutputKind,
    pub output_path: std::path::PathBuf,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub namespace: Namespace,
    pub undefined_mode: UndefinedMode,
    pub commons_mode: CommonsMode,
    pub weak_reference_mismatches_error: bool,
    pub multiply_defined_allow: bool,
    pub library_search_paths: Vec<std::path::PathBuf>,
    pub framework_search_paths: Vec<std::path::PathBuf>,
    pub syslibroot: Vec<std::path::PathBuf>,
    pub dead_strip: bool,
    pub exported_symbols_list: Option<Vec<Vec<u8>>>,
    pub unexported_symbols_list: Option<Vec<Vec<u8>>>,
    pub init_symbol: Option<Vec<u8>>,
    pub bundle_loader: Option<std::path::PathBuf>,
    pub interposable: bool,
    pub allowable_clients: Vec<String>,
    pub client_name: Option<String>,
    pub sub_umbrella: Vec<String>,
    pub sub_library: Vec<String>,
    pub pagezero_size: u64,
    pub stack_addr: Option<u64>,
    pub stack_size: Option<u64>,
    pub image_base: Option<u64>,
    pub headerpad: u64,
    pub headerpad_max_install_names: bool,
    pub segment_addresses: Vec<(String, u64)>,
    pub section_alignments: Vec<((String, String), u8)>,
    pub keep_private_externs: bool,
    pub keep_relocs: bool,
    pub uuid_mode: UuidMode,
    pub demangle: bool,
    pub ignore_duplicates: bool,
    pub warn_commons: bool,
    pub ignore_other_arch_input_files: bool,
    pub dylib_file_overrides: Vec<(String, std::path::PathBuf)>,
    pub trace: TraceFlags,
    pub parse_mode: ParseMode,
    pub inputs: Vec<std::path::PathBuf>,
    /// `-map <path>`: write a text map file alongside the linked image.
    pub map_path: Option<std::path::PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            output_kind: OutputKind::Executable,
            output_path: std::path::PathBuf::from("a.out"),
            cputype: crate::mach::cputype::CPU_TYPE_X86_64,
            cpusubtype: 0,
            namespace: Namespace::TwoLevel,
            undefined_mode: UndefinedMode::Error,
            commons_mode: CommonsMode::UseDylibs,
            weak_reference_mismatches_error: false,
            multiply_defined_allow: false,
            library_search_paths: Vec::new(),
            framework_search_paths: Vec::new(),
            syslibroot: Vec::new(),
            dead_strip: false,
            exported_symbols_list: None,
            unexported_symbols_list: None,
            init_symbol: None,
            bundle_loader: None,
            interposable: false,
            allowable_clients: Vec::new(),
            client_name: None,
            sub_umbrella: Vec::new(),
            sub_library: Vec::new(),
            pagezero_size: 0x1000,
            stack_addr: None,
            stack_size: None,
            image_base: None,
            headerpad: 0,
            headerpad_max_install_names: false,
            segment_addresses: Vec::new(),
            section_alignments: Vec::new(),
            keep_private_externs: false,
            keep_relocs: false,
            uuid_mode: UuidMode::Content,
            demangle: false,
            ignore_duplicates: false,
            warn_commons: false,
            ignore_other_arch_input_files: false,
            dylib_file_overrides: Vec::new(),
            trace: TraceFlags::default(),
            parse_mode: ParseMode::Strict,
            inputs: Vec::new(),
            map_path: None,
        }
    }
}

/// Helper trait to ease permissive parsing fallbacks.
///
/// When `permissive` is true, errors are downgraded to warnings (if `log` feature is enabled)
/// and a default or provided value is used instead; otherwise the original error is propagated.
pub(crate) trait Permissive<T, E> {
    fn or_permissive_and_default(
        self,
        permissive: bool,
        context: &str,
    ) -> core::result::Result<T, E>;

    #[allow(unused)]
    fn or_permissive_and_value(
        self,
        permissive: bool,
        context: &str,
        value: T,
    ) -> core::result::Result<T, E>;

    #[allow(unused)]
    fn or_permissive_and_then<F>(
        self,
        permissive: bool,
        context: &str,
        f: F,
    ) -> core::result::Result<T, E>
    where
        F: FnOnce() -> T;

    // no lazy-with-ctx variants; use static messages to avoid allocations
}

impl<T: Default, E: core::fmt::Display> Permissive<T, E> for core::result::Result<T, E> {
    #[allow(unused)]
    fn or_permissive_and_default(
        self,
        permissive: bool,
        context: &str,
    ) -> core::result::Result<T, E> {
        self.or_else(|e| {
            if permissive {
                #[cfg(feature = "log")]
                log::warn!("{context}: {e}, continuing with empty/default value");
                Ok(T::default())
            } else {
                Err(e)
            }
        })
    }

    #[allow(unused)]
    fn or_permissive_and_value(
        self,
        permissive: bool,
        context: &str,
        value: T,
    ) -> core::result::Result<T, E> {
        self.or_else(|e| {
            if permissive {
                #[cfg(feature = "log")]
                log::warn!("{context}: {e}, continuing with provided value");
                Ok(value)
            } else {
                Err(e)
            }
        })
    }

    // removed: *_with_ctx helpers (prefer static messages)

    #[allow(unused)]
    fn or_permissive_and_then<F>(
        self,
        permissive: bool,
        context: &str,
        f: F,
    ) -> core::result::Result<T, E>
    where
        F: FnOnce() -> T,
    {
        self.or_else(|e| {
            if permissive {
                #[cfg(feature = "log")]
                log::warn!("{context}: {e}, continuing with computed value");
                Ok(f())
            } else {
                Err(e)
            }
        })
    }

    // removed: *_with_ctx helpers (prefer static messages)

    // removed: *_with_ctx helpers (prefer static messages)
}

/// The literal `argv` surface, matching `ld`'s own flag spelling. Lowered
/// into [`Options`] by [`RawArgs::lower`]; unrecognized flags are accepted
/// (and ignored) here under `ParseMode::Permissive` by virtue of `clap`
/// simply not declaring them, since this crate only models the
/// semantically relevant subset named in SPEC_FULL.md §6.
#[cfg(feature = "clap")]
#[derive(Debug, clap::Parser)]
#[command(name = "machld", about = "A Mach-O static linker")]
pub struct RawArgs {
    /// Input object files, archives, and dylibs.
    pub inputs: Vec<std::path::PathBuf>,

    #[arg(short = 'o', default_value = "a.out")]
    pub output: std::path::PathBuf,

    #[arg(long = "arch", default_value = "x86_64")]
    pub arch: String,

    #[arg(long = "dylib")]
    pub dylib: bool,
    #[arg(long = "bundle")]
    pub bundle: bool,
    #[arg(long = "dynamic-linker", visible_alias = "dylinker")]
    pub dylinker: bool,
    #[arg(short = 'r')]
    pub relocatable: bool,
    #[arg(long = "preload")]
    pub preload: bool,
    #[arg(long = "kext")]
    pub kext: bool,

    #[arg(short = 'L', action = clap::ArgAction::Append)]
    pub library_search_paths: Vec<std::path::PathBuf>,
    #[arg(short = 'F', action = clap::ArgAction::Append)]
    pub framework_search_paths: Vec<std::path::PathBuf>,
    #[arg(long = "syslibroot", action = clap::ArgAction::Append)]
    pub syslibroot: Vec<std::path::PathBuf>,

    #[arg(long = "flat_namespace")]
    pub flat_namespace: bool,
    #[arg(long = "force_flat_namespace")]
    pub force_flat_namespace: bool,

    #[arg(long = "undefined")]
    pub undefined: Option<String>,
    #[arg(long = "commons")]
    pub commons: Option<String>,
    #[arg(long = "multiply_defined_unused")]
    pub multiply_defined_unused: bool,
    #[arg(long = "weak_reference_mismatches")]
    pub weak_reference_mismatches: Option<String>,

    #[arg(long = "dead_strip")]
    pub dead_strip: bool,

    #[arg(long = "init")]
    pub init: Option<String>,
    #[arg(long = "bundle_loader")]
    pub bundle_loader: Option<std::path::PathBuf>,
    #[arg(long = "interposable")]
    pub interposable: bool,
    #[arg(long = "allowable_client", action = clap::ArgAction::Append)]
    pub allowable_client: Vec<String>,
    #[arg(long = "client_name")]
    pub client_name: Option<String>,
    #[arg(long = "sub_umbrella", action = clap::ArgAction::Append)]
    pub sub_umbrella: Vec<String>,
    #[arg(long = "sub_library", action = clap::ArgAction::Append)]
    pub sub_library: Vec<String>,

    #[arg(long = "pagezero_size")]
    pub pagezero_size: Option<String>,
    #[arg(long = "stack_addr")]
    pub stack_addr: Option<String>,
    #[arg(long = "stack_size")]
    pub stack_size: Option<String>,
    #[arg(long = "image_base", visible_alias = "seg1addr")]
    pub image_base: Option<String>,
    #[arg(long = "headerpad")]
    pub headerpad: Option<String>,
    #[arg(long = "headerpad_max_install_names")]
    pub headerpad_max_install_names: bool,
    #[arg(long = "segaddr", num_args = 2, action = clap::ArgAction::Append)]
    pub segaddr: Vec<String>,
    #[arg(long = "sectalign", num_args = 3, action = clap::ArgAction::Append)]
    pub sectalign: Vec<String>,

    #[arg(long = "keep_private_externs")]
    pub keep_private_externs: bool,
    #[arg(long = "keep_relocs")]
    pub keep_relocs: bool,
    #[arg(long = "no_uuid")]
    pub no_uuid: bool,

    #[arg(long = "dylib_file", action = clap::ArgAction::Append)]
    pub dylib_file: Vec<String>,

    #[arg(long = "demangle")]
    pub demangle: bool,
    #[arg(long = "ignore_duplicates")]
    pub ignore_duplicates: bool,
    #[arg(long = "warn_commons")]
    pub warn_commons: bool,
    #[arg(long = "ignore_other_arch_input_files")]
    pub ignore_other_arch_input_files: bool,

    #[arg(long = "strict_options")]
    pub strict_options: bool,

    #[arg(long = "map")]
    pub map: Option<std::path::PathBuf>,
}

#[cfg(feature = "clap")]
impl RawArgs {
    /// Validates and lowers the raw argv surface into the immutable
    /// [`Options`] value the core consumes.
    pub fn lower(self) -> crate::error::Result<Options> {
        use crate::error::LinkerError;

        let mut opts = Options::default();
        opts.parse_mode = if self.strict_options { ParseMode::Strict } else { ParseMode::Permissive };

        opts.output_kind = if self.dylib {
            OutputKind::Dylib
        } else if self.bundle {
            OutputKind::Bundle
        } else if self.dylinker {
            OutputKind::DynamicLinker
        } else if self.relocatable {
            OutputKind::Object
        } else if self.preload {
            OutputKind::Preload
        } else if self.kext {
            OutputKind::KextBundle
        } else {
            OutputKind::Executable
        };
        opts.output_path = self.output;
        opts.inputs = self.inputs;

        let (cputype, cpusubtype) = parse_arch(&self.arch)?;
        opts.cputype = cputype;
        opts.cpusubtype = cpusubtype;

        opts.namespace = if self.force_flat_namespace {
            Namespace::ForcedFlat
        } else if self.flat_namespace {
            Namespace::Flat
        } else {
            Namespace::TwoLevel
        };

        if let Some(mode) = self.undefined.as_deref() {
            opts.undefined_mode = match mode {
                "error" => UndefinedMode::Error,
                "warning" => UndefinedMode::Warning,
                "suppress" => UndefinedMode::Suppress,
                "dynamic_lookup" => UndefinedMode::DynamicLookup,
                other => return Err(LinkerError::Usage(format!("unknown -undefined mode '{other}'"))),
            };
        }
        if let Some(mode) = self.commons.as_deref() {
            opts.commons_mode = match mode {
                "use_dylibs" => CommonsMode::UseDylibs,
                "override" => CommonsMode::Override,
                "error" => CommonsMode::Error,
                other => return Err(LinkerError::Usage(format!("unknown -commons mode '{other}'"))),
            };
        }
        opts.multiply_defined_allow = self.multiply_defined_unused;
        opts.weak_reference_mismatches_error =
            matches!(self.weak_reference_mismatches.as_deref(), Some("error"));

        opts.library_search_paths = self.library_search_paths;
        opts.framework_search_paths = self.framework_search_paths;
        opts.syslibroot = self.syslibroot;
        opts.dead_strip = self.dead_strip;

        opts.init_symbol = self.init.map(|s| s.into_bytes());
        opts.bundle_loader = self.bundle_loader;
        opts.interposable = self.interposable;
        opts.allowable_clients = self.allowable_client;
        opts.client_name = self.client_name;
        opts.sub_umbrella = self.sub_umbrella;
        opts.sub_library = self.sub_library;

        if let Some(s) = self.pagezero_size { opts.pagezero_size = parse_hex_or_dec(&s)?; }
        if let Some(s) = self.stack_addr { opts.stack_addr = Some(parse_hex_or_dec(&s)?); }
        if let Some(s) = self.stack_size { opts.stack_size = Some(parse_hex_or_dec(&s)?); }
        if let Some(s) = self.image_base { opts.image_base = Some(parse_hex_or_dec(&s)?); }
        if let Some(s) = self.headerpad { opts.headerpad = parse_hex_or_dec(&s)?; }
        opts.headerpad_max_install_names = self.headerpad_max_install_names;

        for pair in self.segaddr.chunks(2) {
            if let [seg, addr] = pair {
                opts.segment_addresses.push((seg.clone(), parse_hex_or_dec(addr)?));
            }
        }
        for triple in self.sectalign.chunks(3) {
            if let [seg, sect, align] = triple {
                let p = parse_hex_or_dec(align)?.trailing_zeros() as u8;
                opts.section_alignments.push(((seg.clone(), sect.clone()), p));
            }
        }

        opts.keep_private_externs = self.keep_private_externs;
        opts.keep_relocs = self.keep_relocs;
        opts.uuid_mode = if self.no_uuid { UuidMode::None } else { UuidMode::Content };

        for entry in self.dylib_file {
            if let Some((install_name, path)) = entry.split_once(':') {
                opts.dylib_file_overrides.push((install_name.to_string(), std::path::PathBuf::from(path)));
            } else {
                return Err(LinkerError::Usage(format!(
                    "-dylib_file argument '{entry}' must be install_name:path"
                )));
            }
        }

        opts.demangle = self.demangle;
        opts.ignore_duplicates = self.ignore_duplicates;
        opts.warn_commons = self.warn_commons;
        opts.ignore_other_arch_input_files = self.ignore_other_arch_input_files;
        opts.trace = TraceFlags::from_env();
        opts.map_path = self.map;

        Ok(opts)
    }
}

#[cfg(feature = "clap")]
fn parse_arch(name: &str) -> crate::error::Result<(u32, u32)> {
    use crate::mach::cputype::*;
    let result = match name {
        "x86_64" => (CPU_TYPE_X86_64, 3),
        "arm64" => (CPU_TYPE_ARM64, 0),
        "armv7" => (CPU_TYPE_ARM, 9),
        "i386" => (CPU_TYPE_X86, 3),
        other => {
            return Err(crate::error::LinkerError::Usage(format!("unrecognized architecture '{other}'")));
        }
    };
    Ok(result)
}

#[cfg(feature = "clap")]
fn parse_hex_or_dec(s: &str) -> crate::error::Result<u64> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|_| crate::error::LinkerError::Usage(format!("not a number: '{s}'")))
}

#[cfg(all(test, feature = "clap"))]
mod cli_tests {
    use super::*;

    #[test]
    fn lowers_dylib_file_override() {
        let raw = RawArgs {
            inputs: vec![],
            output: "a.out".into(),
            arch: "x86_64".into(),
            dylib: false,
            bundle: false,
            dylinker: false,
            relocatable: false,
            preload: false,
            kext: false,
            library_search_paths: vec![],
            framework_search_paths: vec![],
            syslibroot: vec![],
            flat_namespace: false,
            force_flat_namespace: false,
            undefined: None,
            commons: None,
            multiply_defined_unused: false,
            weak_reference_mismatches: None,
            dead_strip: false,
            init: None,
            bundle_loader: None,
            interposable: false,
            allowable_client: vec![],
            client_name: None,
            sub_umbrella: vec![],
            sub_library: vec![],
            pagezero_size: None,
            stack_addr: None,
            stack_size: None,
            image_base: None,
            headerpad: None,
            headerpad_max_install_names: false,
            segaddr: vec![],
            sectalign: vec![],
            keep_private_externs: false,
            keep_relocs: false,
            no_uuid: false,
            dylib_file: vec!["/usr/lib/libFoo.dylib:/tmp/libFoo.dylib".to_string()],
            demangle: false,
            ignore_duplicates: false,
            warn_commons: false,
            ignore_other_arch_input_files: false,
            strict_options: false,
            map: None,
        };
        let opts = raw.lower().unwrap();
        assert_eq!(
            opts.dylib_file_overrides,
            vec![("/usr/lib/libFoo.dylib".to_string(), std::path::PathBuf::from("/tmp/libFoo.dylib"))]
        );
    }
}
