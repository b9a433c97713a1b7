//! STABS debug-note synthesis (§4.1/§4.6 "post-processing readers of final
//! state"). A full `ld64` debug map records one `N_SO`/`N_OSO`/`N_FUN` run
//! per source file and function compiled into an object; this crate's
//! Non-goals exclude source analysis, so each input object file contributes
//! a single `N_SO`/`N_OSO` pair naming the object itself, with its
//! modification time recorded the way dsymutil keys against the original
//! `.o` on disk. No per-function `N_FUN`/`N_SLINE` entries are synthesized.

use crate::fixup::SymbolRecord;

/// Stab type for a compilation unit's source-file name.
pub const N_SO: u8 = 0x64;
/// Stab type for the on-disk object file a compilation unit came from.
pub const N_OSO: u8 = 0x66;

/// One input object file, as recorded in the debug map.
#[derive(Debug, Clone)]
pub struct ObjectStab {
    pub path: Vec<u8>,
    pub mtime: u32,
}

/// Builds the `N_SO`/`N_OSO` pair for every object in `objects`, in order.
/// The caller appends these to the local-symbol region of the final symbol
/// table (ahead of the ordinary local symbols, matching `ld64`'s own
/// ordering) and excludes their byte range from [`crate::fixup::compute_uuid`]:
/// the `N_OSO` entry's `n_value` is a modification time, not an address, so
/// a workspace-dependent value shouldn't perturb content-addressed UUIDs.
pub fn build_object_stabs(objects: &[ObjectStab]) -> Vec<SymbolRecord> {
    let mut out = Vec::with_capacity(objects.len() * 2);
    for obj in objects {
        out.push(SymbolRecord { name: obj.path.clone(), n_type: N_SO, n_sect: 0, n_desc: 0, n_value: 0 });
        out.push(SymbolRecord {
            name: obj.path.clone(),
            n_type: N_OSO,
            n_sect: 0,
            n_desc: 1,
            n_value: obj.mtime as u64,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_pair_per_object() {
        let objects = vec![
            ObjectStab { path: b"/tmp/a.o".to_vec(), mtime: 100 },
            ObjectStab { path: b"/tmp/b.o".to_vec(), mtime: 200 },
        ];
        let stabs = build_object_stabs(&objects);
        assert_eq!(stabs.len(), 4);
        assert_eq!(stabs[0].n_type, N_SO);
        assert_eq!(stabs[1].n_type, N_OSO);
        assert_eq!(stabs[1].n_value, 100);
        assert_eq!(stabs[3].n_value, 200);
    }
}
