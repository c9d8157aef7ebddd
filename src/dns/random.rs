//! RNG collaborator
//!
//! Used by the server registry's probabilistic rehabilitation check and
//! by the dispatcher's retry-timeout jitter. Kept behind a trait so
//! tests can substitute a deterministic sequence without touching the
//! core's selection/jitter logic.

/// Source of randomness the core consumes.
pub trait Random: Send + Sync {
    fn u16(&self) -> u16;
    fn bytes(&self, buf: &mut [u8]);
}

/// `Random` backed by `rand::thread_rng`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl Random for OsRandom {
    fn u16(&self) -> u16 {
        rand::random::<u16>()
    }

    fn bytes(&self, buf: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buf);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_random_fills_buffer() {
        let r = OsRandom;
        let mut buf = [0u8; 16];
        r.bytes(&mut buf);
        // Extremely unlikely to stay all-zero; a smoke test only.
        assert!(buf.iter().any(|b| *b != 0));
    }
}
