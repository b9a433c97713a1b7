//! Thin CLI binary: parses `argv` with `clap`, lowers it into the library's
//! `Options`, initializes logging from `RUST_LOG`, and hands off to
//! [`machld::Linker`]. All linking logic lives in the library; this wires
//! argv/env into it and formats the final diagnostic (see SPEC_FULL.md §4.8).

use clap::Parser;

use machld::options::RawArgs;
use machld::Linker;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(err) = run() {
        eprintln!("{}", format_diagnostic(&err));
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let raw = RawArgs::parse();
    let options = raw.lower()?;
    let arch_prefix = arch_name(options.cputype);
    Linker::new(options).run().map_err(|err| {
        anyhow::anyhow!("{}", err).context(format!("architecture {}", arch_prefix))
    })
}

/// `ld:`-prefixed, with the active architecture named when known — the only
/// place in the crate that decorates a [`machld::LinkerError`] with context;
/// everything below `main` raises bare, undecorated errors.
fn format_diagnostic(err: &anyhow::Error) -> String {
    format!("ld: {}", err)
}

fn arch_name(cputype: u32) -> &'static str {
    use machld::mach::cputype::*;
    match cputype {
        CPU_TYPE_X86_64 => "x86_64",
        CPU_TYPE_X86 => "i386",
        CPU_TYPE_ARM64 => "arm64",
        CPU_TYPE_ARM => "arm",
        _ => "unknown",
    }
}
