use std::cmp::Ordering;

use crate::constants::DbFlags;

/// Orders two keys or two duplicate values
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Plain byte-wise ordering, shorter first on a common prefix.
pub fn cmp_lexical(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Byte-wise ordering starting from the last byte.
pub fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// Native-endian unsigned integers of 4 or 8 bytes.
pub fn cmp_int(a: &[u8], b: &[u8]) -> Ordering {
    match (read_native(a), read_native(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        // Mixed or odd widths only reach here through unchecked data.
        _ => a.len().cmp(&b.len()).then_with(|| cmp_lexical(a, b)),
    }
}

fn read_native(v: &[u8]) -> Option<u64> {
    match v.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(v);
            Some(u32::from_ne_bytes(b) as u64)
        }
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(v);
            Some(u64::from_ne_bytes(b))
        }
        _ => None,
    }
}

/// Key comparator implied by a database's flags.
pub(crate) fn key_comparator(flags: DbFlags) -> Comparator {
    if flags.contains(DbFlags::INTEGERKEY) {
        cmp_int
    } else if flags.contains(DbFlags::REVERSEKEY) {
        cmp_reverse
    } else {
        cmp_lexical
    }
}

/// Duplicate comparator implied by a database's flags.
pub(crate) fn dup_comparator(flags: DbFlags) -> Comparator {
    if flags.contains(DbFlags::INTEGERDUP) {
        cmp_int
    } else if flags.contains(DbFlags::REVERSEDUP) {
        cmp_reverse
    } else {
        cmp_lexical
    }
}

/// Integer keys and duplicates must be exactly 4 or 8 bytes wide.
pub(crate) fn valid_int(v: &[u8]) -> bool {
    v.len() == 4 || v.len() == 8
}
