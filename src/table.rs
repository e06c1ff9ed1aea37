//! Bit-packed slot array stored in pool words.

use crate::pool::{Handle, MemRead, Transaction};

const WORD_BITS: u64 = 64;

fn low_mask(bits: u64) -> u64 {
    if bits == WORD_BITS {
        !0
    } else {
        (1u64 << bits) - 1
    }
}

/// A fixed-length array of `elem_bits`-wide slots packed into the pool
/// allocation at `base`. Slot `i` starts at bit `i * elem_bits` from the low
/// bit of the first word and may span two consecutive words.
///
/// The view itself is plain data derived from the filter's immutable
/// parameters; all state lives in the pool.
#[derive(Clone, Copy)]
pub(crate) struct SlotTable {
    base: u64,
    len: u64,
    elem_bits: u64,
    elem_mask: u64,
}

impl SlotTable {
    pub fn new(base: Handle, qbits: u64, rbits: u64) -> SlotTable {
        let elem_bits = rbits + 3;
        SlotTable {
            base: base.as_u64(),
            len: 1 << qbits,
            elem_bits,
            elem_mask: low_mask(elem_bits),
        }
    }

    /// Size in bytes of the table payload for a `(qbits, rbits)` filter:
    /// `ceil(2^qbits * (rbits + 3) / 8)`.
    pub fn size_in_bytes(qbits: u64, rbits: u64) -> u64 {
        let bits = (1u64 << qbits) * (rbits + 3);
        (bits + 7) / 8
    }

    pub fn handle(&self) -> Handle {
        Handle::from_u64(self.base)
    }

    pub fn elem_mask(&self) -> u64 {
        self.elem_mask
    }

    /// Reads the slot at `index`.
    pub fn get<M: MemRead>(&self, mem: &M, index: u64) -> u64 {
        assert!(index < self.len);
        let bit_offset = index * self.elem_bits;
        let word = bit_offset / WORD_BITS;
        let shift = bit_offset % WORD_BITS;
        let spill = (shift + self.elem_bits).saturating_sub(WORD_BITS);

        let mut elem = (mem.read_u64(self.base + word * 8) >> shift) & self.elem_mask;
        if spill > 0 {
            let next = mem.read_u64(self.base + (word + 1) * 8);
            elem |= (next & low_mask(spill)) << (self.elem_bits - spill);
        }
        elem
    }

    /// Writes the low `elem_bits` of `elem` into the slot at `index`. A
    /// read-modify-write of up to two words, buffered in the transaction.
    pub fn set(&self, tx: &mut Transaction<'_>, index: u64, elem: u64) {
        assert!(index < self.len);
        let elem = elem & self.elem_mask;
        let bit_offset = index * self.elem_bits;
        let word = bit_offset / WORD_BITS;
        let shift = bit_offset % WORD_BITS;
        let spill = (shift + self.elem_bits).saturating_sub(WORD_BITS);

        let offset = self.base + word * 8;
        let mut low = tx.read_u64(offset);
        low &= !(self.elem_mask << shift);
        low |= elem << shift;
        tx.write_u64(offset, low);
        if spill > 0 {
            let offset = self.base + (word + 1) * 8;
            let mut high = tx.read_u64(offset);
            high &= !low_mask(spill);
            high |= elem >> (self.elem_bits - spill);
            tx.write_u64(offset, high);
        }
    }

    /// Zeroes every word of the table payload.
    pub fn clear(&self, tx: &mut Transaction<'_>) {
        let words = (self.len * self.elem_bits + WORD_BITS - 1) / WORD_BITS;
        tx.write_zeros(self.base, words * 8);
    }
}

#[cfg(test)]
mod tests {
    use super::SlotTable;
    use crate::pool::Pool;
    use rand::{Rng, SeedableRng};

    fn test_with_geometry(qbits: u64, rbits: u64) {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = Pool::create(dir.path().join("table.pool"), 1 << 20).unwrap();
        let len = 1u64 << qbits;

        let mut tx = pool.begin();
        let base = tx
            .alloc_zeroed(SlotTable::size_in_bytes(qbits, rbits))
            .unwrap();
        tx.commit().unwrap();
        let table = SlotTable::new(base, qbits, rbits);

        let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(qbits << 8 | rbits);
        let mut shadow = vec![0u64; len as usize];

        for index in 0..len {
            assert_eq!(table.get(&pool, index), 0);
        }

        let mut tx = pool.begin();
        for index in 0..len {
            let elem: u64 = rng.gen::<u64>() & table.elem_mask();
            table.set(&mut tx, index, elem);
            shadow[index as usize] = elem;
        }
        tx.commit().unwrap();

        for index in 0..len {
            assert_eq!(table.get(&pool, index), shadow[index as usize]);
        }

        // Overwrites must not bleed into neighboring slots.
        let mut tx = pool.begin();
        for index in (0..len).step_by(2) {
            table.set(&mut tx, index, 0);
            shadow[index as usize] = 0;
        }
        tx.commit().unwrap();
        for index in 0..len {
            assert_eq!(table.get(&pool, index), shadow[index as usize]);
        }
    }

    #[test]
    fn test_narrow_slots() {
        // 4-bit slots, 16 per word.
        test_with_geometry(6, 1);
    }

    #[test]
    fn test_word_crossing_slots() {
        // 13-bit slots cross a word boundary roughly every fifth slot.
        test_with_geometry(6, 10);
    }

    #[test]
    fn test_word_sized_slots() {
        // 64-bit slots, the widest geometry a slot can have.
        test_with_geometry(4, 61);
    }

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(SlotTable::size_in_bytes(3, 2), 5);
        assert_eq!(SlotTable::size_in_bytes(8, 5), 256);
        assert_eq!(SlotTable::size_in_bytes(16, 48), 417_792);
    }
}
