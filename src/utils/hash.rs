//! Instance hashing for consistent-hash load balancers.
//!
//! Values are the first 64-bit half of MurmurHash3 x64_128 over the instance id.
//! Collisions inside one snapshot are resolved deterministically, see
//! [`resolve_conflict`].

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

/// Re-hash attempts with a `"{id}:{retry}"` suffix before linear probing.
pub const MAX_REHASH: u32 = 10;

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// MurmurHash3 x64_128, returning `(h1, h2)`.
pub fn murmur3_x64_128(
    data: &[u8],
    seed: u32,
) -> (u64, u64) {
    let len = data.len();
    let mut h1 = seed as u64;
    let mut h2 = seed as u64;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let mut k1 = read_u64(&block[0..8]);
        let mut k2 = read_u64(&block[8..16]);

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27).wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31).wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    let mut k1 = 0u64;
    let mut k2 = 0u64;
    for (i, byte) in tail.iter().enumerate() {
        if i < 8 {
            k1 ^= (*byte as u64) << (8 * i);
        } else {
            k2 ^= (*byte as u64) << (8 * (i - 8));
        }
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

pub fn murmur3_64(
    data: &[u8],
    seed: u32,
) -> u64 {
    murmur3_x64_128(data, seed).0
}

/// Picks a replacement hash for `id` after its natural hash collided.
///
/// Tries `"{id}:{retry}"` for retry in `1..=MAX_REHASH`, then probes upward from 1
/// for the first free value. The result depends only on `id` and the taken set.
pub fn resolve_conflict(
    id: &str,
    is_taken: impl Fn(u64) -> bool,
) -> u64 {
    for retry in 1..=MAX_REHASH {
        let candidate = murmur3_64(format!("{id}:{retry}").as_bytes(), 0);
        if !is_taken(candidate) {
            return candidate;
        }
    }
    (1..=u64::MAX).find(|candidate| !is_taken(*candidate)).unwrap_or(0)
}
