//! Utility functions for the library.
use ahash::AHashMap;
use fixedbitset_stack::on_stack::{get_nblock, FixedBitSet};

pub(crate) type ByteSet = FixedBitSet<{ get_nblock(u8::MAX as usize) }>;

/// Builds a [`ByteSet`] that can hold every byte value.
pub(crate) fn new_byte_set() -> ByteSet {
    ByteSet::with_capacity(u8::MAX as usize + 1)
}

pub(crate) fn get_display_form_from_bitset_on_stack<const NBLOCK: usize>(
    bitset: &FixedBitSet<NBLOCK>,
) -> Vec<usize> {
    bitset.ones().collect()
}

pub(crate) fn get_display_form_from_bitset(bitset: &fixedbitset_stack::FixedBitSet) -> Vec<usize> {
    bitset.ones().collect()
}

pub(crate) fn get_deterministic_display_form_from_hash_map<K, V, U: Ord + Clone, Y>(
    map: &AHashMap<K, V>,
    process: impl FnMut((&K, &V)) -> (U, Y),
) -> Vec<(U, Y)> {
    let mut a: Vec<_> = map.iter().map(process).collect();
    a.sort_by_cached_key(|(k, _)| k.clone());
    a
}

/// Formats a token's text so that whitespace and control characters stay visible in debug output.
pub(crate) fn get_display_form_from_token_string(token: &str) -> String {
    token.escape_debug().to_string()
}

/// Unions `other` into `target` and returns whether `target` gained any element.
pub(crate) fn union_grows(
    target: &mut fixedbitset_stack::FixedBitSet,
    other: &fixedbitset_stack::FixedBitSet,
) -> bool {
    let before = target.count_ones(..);
    target.union_with(other);
    target.count_ones(..) != before
}
