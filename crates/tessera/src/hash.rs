use crate::types::EntityId;

/// DJB2 hash function used for sticky worker routing.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// 64-bit hash with good avalanche, used to compare entity state between a
/// managing node and its siblings.
///
/// Based on xxHash64 mixing constants.
pub fn hash64(bytes: &[u8]) -> u64 {
    const PRIME1: u64 = 0x9E3779B185EBCA87;
    const PRIME2: u64 = 0xC2B2AE3D27D4EB4F;
    const PRIME3: u64 = 0x165667B19E3779F9;
    const PRIME5: u64 = 0x27D4EB2F165667C5;

    let mut h: u64 = PRIME5.wrapping_add(bytes.len() as u64);

    for &b in bytes {
        h ^= (b as u64).wrapping_mul(PRIME5);
        h = h.rotate_left(11).wrapping_mul(PRIME1);
    }

    h ^= h >> 33;
    h = h.wrapping_mul(PRIME2);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME3);
    h ^= h >> 32;
    h
}

/// Worker index for commands from `sender`, in `[0, workers)`.
///
/// All commands from one sender land on the same worker, which is what keeps
/// per-sender execution order. Returns 0 when `workers` is 0.
pub fn worker_for_sender(sender: &EntityId, workers: usize) -> usize {
    if workers == 0 {
        return 0;
    }
    (djb2_hash(&sender.as_bytes()) as usize) % workers
}
