use std::sync::atomic::{AtomicU64, Ordering};

/// Lock state words of an object.
///
/// `misc` is the lock word proper. `hash` is only used by the 32-bit word
/// layout, where it carries the hashcode or the bound monitor reference; on
/// the 64-bit layout it stays zero.
#[derive(Default)]
pub struct ObjectHeader {
    misc: AtomicU64,
    hash: AtomicU64,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            misc: AtomicU64::new(0),
            hash: AtomicU64::new(0),
        }
    }

    pub fn read_misc(&self) -> u64 {
        self.misc.load(Ordering::Acquire)
    }

    pub fn write_misc(&self, value: u64) {
        self.misc.store(value, Ordering::Release);
    }

    /// Returns the witnessed value: equal to `expected` on success.
    pub fn compare_and_swap_misc(&self, expected: u64, new: u64) -> u64 {
        match self
            .misc
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(witness) | Err(witness) => witness,
        }
    }

    pub fn read_hash(&self) -> u64 {
        self.hash.load(Ordering::Acquire)
    }

    pub fn write_hash(&self, value: u64) {
        self.hash.store(value, Ordering::Release);
    }

    pub fn compare_and_swap_hash(&self, expected: u64, new: u64) -> u64 {
        match self
            .hash
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(witness) | Err(witness) => witness,
        }
    }
}

impl std::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("misc", &format_args!("{:#x}", self.read_misc()))
            .field("hash", &format_args!("{:#x}", self.read_hash()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_and_swap_reports_witness() {
        let header = ObjectHeader::new();
        assert_eq!(header.compare_and_swap_misc(0, 5), 0);
        assert_eq!(header.read_misc(), 5);
        assert_eq!(header.compare_and_swap_misc(0, 7), 5);
        assert_eq!(header.read_misc(), 5);

        header.write_hash(9);
        assert_eq!(header.compare_and_swap_hash(1, 2), 9);
        assert_eq!(header.compare_and_swap_hash(9, 2), 9);
        assert_eq!(header.read_hash(), 2);
    }
}
