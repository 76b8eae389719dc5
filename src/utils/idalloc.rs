use bitvec::vec::BitVec;

/// Hands out small integer ids, reusing freed ones first.
#[derive(Default)]
pub struct IdAlloc {
    bits: BitVec,
}

impl IdAlloc {
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
        }
    }

    pub fn alloc_one(&mut self) -> u32 {
        if let Some(indice) = self.bits.first_zero() {
            self.bits.set(indice, true);
            return indice as u32;
        }
        let indice = self.bits.len();
        self.bits.push(true);
        indice as u32
    }

    /// Allocates `n` consecutive ids and returns the first.
    pub fn alloc(&mut self, n: u32) -> u32 {
        let mut range_start: u32 = 0;
        let mut len: u32 = 0;
        for i in self.bits.iter_zeros() {
            let i = i as u32;
            if len > 0 && i == range_start + len {
                len += 1;
            } else {
                range_start = i;
                len = 1;
            }
            if len == n {
                self.bits[range_start as usize..(range_start + len) as usize].fill(true);
                return range_start;
            }
        }

        // A free run touching the end can be extended in place.
        let end = self.bits.len() as u32;
        let start = if len > 0 && range_start + len == end {
            range_start
        } else {
            end
        };
        self.bits.resize((start + n) as usize, false);
        self.bits[start as usize..(start + n) as usize].fill(true);
        start
    }

    pub fn free(&mut self, id: u32, n: u32) {
        self.bits[id as usize..(id + n) as usize].fill(false);
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        self.bits.get(id as usize).is_some_and(|bit| *bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_ids_are_reused() {
        let mut ids = IdAlloc::new();
        assert_eq!(ids.alloc_one(), 0);
        assert_eq!(ids.alloc_one(), 1);
        ids.free(0, 1);
        assert!(!ids.is_allocated(0));
        assert_eq!(ids.alloc_one(), 0);
        assert_eq!(ids.alloc_one(), 2);
    }

    #[test]
    fn consecutive_runs() {
        let mut ids = IdAlloc::new();
        assert_eq!(ids.alloc(3), 0);
        ids.free(1, 1);
        assert_eq!(ids.alloc(2), 3);
        assert_eq!(ids.alloc(1), 1);
    }
}
