/// Deterministic CPU-bound busy work: a seeded xorshift-style mix spun for
/// `iters` rounds. Cheap to verify (same seed, same result) and impossible
/// for the optimizer to discard once the outputs are checksummed.
pub fn spin_task(seed: u64, iters: u64) -> u64 {
    let mut acc = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    for _ in 0..iters {
        acc ^= acc << 13;
        acc ^= acc >> 7;
        acc ^= acc << 17;
        acc = acc.wrapping_add(0x2545_F491_4F6C_DD1D);
    }
    acc
}
