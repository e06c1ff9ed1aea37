//! Pool-resident probabilistic data structure for approximate membership
//! queries in a set.

use crate::error::{Error, Result};
use crate::pool::{Handle, MemRead, Pool, Transaction};
use crate::table::SlotTable;
use std::f64::consts;
use std::fmt;

const OCCUPIED_MASK: u64 = 0b001;
const CONTINUATION_MASK: u64 = 0b010;
const SHIFTED_MASK: u64 = 0b100;
const METADATA_MASK: u64 = 0b111;
const METADATA_BITS: u64 = 3;

// Per-slot metadata predicates. The three bits classify a slot as empty, a
// cluster start, a run start, or a displaced element; `occupied` is bound to
// the slot index, never to the remainder the slot currently holds.

fn is_occupied(elem: u64) -> bool {
    elem & OCCUPIED_MASK != 0
}

fn set_occupied(elem: u64) -> u64 {
    elem | OCCUPIED_MASK
}

fn clr_occupied(elem: u64) -> u64 {
    elem & !OCCUPIED_MASK
}

fn is_continuation(elem: u64) -> bool {
    elem & CONTINUATION_MASK != 0
}

fn set_continuation(elem: u64) -> u64 {
    elem | CONTINUATION_MASK
}

fn clr_continuation(elem: u64) -> u64 {
    elem & !CONTINUATION_MASK
}

fn is_shifted(elem: u64) -> bool {
    elem & SHIFTED_MASK != 0
}

fn set_shifted(elem: u64) -> u64 {
    elem | SHIFTED_MASK
}

fn clr_shifted(elem: u64) -> u64 {
    elem & !SHIFTED_MASK
}

fn remainder_of(elem: u64) -> u64 {
    elem >> METADATA_BITS
}

fn is_empty_element(elem: u64) -> bool {
    elem & METADATA_MASK == 0
}

fn is_cluster_start(elem: u64) -> bool {
    is_occupied(elem) && !is_continuation(elem) && !is_shifted(elem)
}

fn is_run_start(elem: u64) -> bool {
    !is_continuation(elem) && (is_occupied(elem) || is_shifted(elem))
}

// Filter state object layout: nine little-endian u64 words reachable from the
// state handle. Everything except `entries` and `table` is immutable between
// `init` and `destroy`.
const FIELD_QBITS: u64 = 0;
const FIELD_RBITS: u64 = 8;
const FIELD_ELEM_BITS: u64 = 16;
const FIELD_INDEX_MASK: u64 = 24;
const FIELD_RMASK: u64 = 32;
const FIELD_ELEM_MASK: u64 = 40;
const FIELD_ENTRIES: u64 = 48;
const FIELD_MAX_SIZE: u64 = 56;
const FIELD_TABLE: u64 = 64;
const FILTER_STATE_SIZE: u64 = 72;

/// A pool-resident quotient filter.
///
/// A quotient filter is a compact hash table over 64-bit fingerprints
/// supplied by the caller. The top `qbits` of a fingerprint select a
/// canonical slot and the bottom `rbits` are stored there as a remainder;
/// colliding remainders form sorted runs that may be shifted right of their
/// canonical slot, with three metadata bits per slot recording enough to
/// recover every fingerprint exactly. Lookups have no false negatives, and a
/// false positive occurs exactly when two distinct fingerprints collide in
/// all `qbits + rbits` bits.
///
/// Unlike an in-memory filter, all state lives in a [`Pool`]: this value is
/// only a binding of the immutable parameters plus the pool handle of the
/// state object, and every mutating operation is crash-atomic through the
/// pool's transactional undo log. Bits above `qbits + rbits` of a hash are
/// ignored on insert and lookup; `remove` rejects them (see
/// [`remove`](QuotientFilter::remove)).
///
/// # Examples
///
/// ```
/// use persistent_quotient_filter::pool::Pool;
/// use persistent_quotient_filter::quotient::QuotientFilter;
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
///
/// let filter = QuotientFilter::init(&mut pool, 8, 4).unwrap();
/// assert!(filter.insert(&mut pool, 0x1fe).unwrap());
/// assert!(filter.may_contain(&pool, 0x1fe));
/// assert_eq!(filter.len(&pool), 1);
///
/// filter.clear(&mut pool).unwrap();
/// assert!(!filter.may_contain(&pool, 0x1fe));
/// ```
pub struct QuotientFilter {
    state: Handle,
    qbits: u64,
    rbits: u64,
    index_mask: u64,
    rmask: u64,
    max_size: u64,
    table: SlotTable,
}

impl QuotientFilter {
    /// Creates a filter with `2^qbits` slots holding `rbits`-bit remainders,
    /// allocating its state and zero-filled table in the pool under one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameters`] unless `qbits` and `rbits` are
    /// positive, `qbits + rbits <= 64`, and a slot (`rbits + 3` bits) fits in
    /// one word; [`Error::PoolExhausted`] if the pool cannot hold the table.
    /// The pool is unchanged on error.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    /// use persistent_quotient_filter::quotient::QuotientFilter;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
    ///
    /// let filter = QuotientFilter::init(&mut pool, 8, 4).unwrap();
    /// assert_eq!(filter.capacity(), 256);
    /// assert!(QuotientFilter::init(&mut pool, 0, 4).is_err());
    /// ```
    pub fn init(pool: &mut Pool, qbits: u64, rbits: u64) -> Result<QuotientFilter> {
        let mut tx = pool.begin();
        let filter = Self::init_in(&mut tx, qbits, rbits)?;
        tx.commit()?;
        Ok(filter)
    }

    fn init_in(tx: &mut Transaction<'_>, qbits: u64, rbits: u64) -> Result<QuotientFilter> {
        if qbits == 0 || rbits == 0 || qbits + rbits > 64 || rbits + METADATA_BITS > 64 {
            return Err(Error::InvalidParameters { qbits, rbits });
        }
        let state = tx.alloc(FILTER_STATE_SIZE)?;
        let table_handle = tx.alloc_zeroed(SlotTable::size_in_bytes(qbits, rbits))?;
        let table = SlotTable::new(table_handle, qbits, rbits);

        let base = state.offset();
        let index_mask = (1u64 << qbits) - 1;
        let rmask = (1u64 << rbits) - 1;
        tx.write_u64(base + FIELD_QBITS, qbits);
        tx.write_u64(base + FIELD_RBITS, rbits);
        tx.write_u64(base + FIELD_ELEM_BITS, rbits + METADATA_BITS);
        tx.write_u64(base + FIELD_INDEX_MASK, index_mask);
        tx.write_u64(base + FIELD_RMASK, rmask);
        tx.write_u64(base + FIELD_ELEM_MASK, table.elem_mask());
        tx.write_u64(base + FIELD_ENTRIES, 0);
        tx.write_u64(base + FIELD_MAX_SIZE, 1 << qbits);
        tx.write_u64(base + FIELD_TABLE, table_handle.as_u64());

        Ok(QuotientFilter {
            state,
            qbits,
            rbits,
            index_mask,
            rmask,
            max_size: 1 << qbits,
            table,
        })
    }

    /// Rebinds a filter from the state handle a previous session stored,
    /// typically in a pool root slot. Validates the stored state object.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    /// use persistent_quotient_filter::quotient::QuotientFilter;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let path = dir.path().join("example.pool");
    /// {
    ///     let mut pool = Pool::create(&path, 1 << 20).unwrap();
    ///     let filter = QuotientFilter::init(&mut pool, 8, 4).unwrap();
    ///     filter.insert(&mut pool, 0x42).unwrap();
    ///     let mut tx = pool.begin();
    ///     tx.set_root(0, filter.state_handle());
    ///     tx.commit().unwrap();
    /// }
    /// let pool = Pool::open(&path).unwrap();
    /// let filter = QuotientFilter::open(&pool, pool.root(0)).unwrap();
    /// assert!(filter.may_contain(&pool, 0x42));
    /// ```
    pub fn open(pool: &Pool, state: Handle) -> Result<QuotientFilter> {
        if state.is_null() {
            return Err(Error::Corrupted("null filter handle".to_string()));
        }
        let base = state.offset();
        let qbits = pool.read_u64(base + FIELD_QBITS);
        let rbits = pool.read_u64(base + FIELD_RBITS);
        if qbits == 0 || rbits == 0 || qbits + rbits > 64 || rbits + METADATA_BITS > 64 {
            return Err(Error::Corrupted(format!(
                "implausible filter geometry qbits={}, rbits={}",
                qbits, rbits
            )));
        }
        let table_handle = Handle::from_u64(pool.read_u64(base + FIELD_TABLE));
        if table_handle.is_null() {
            return Err(Error::Corrupted("filter table was destroyed".to_string()));
        }
        let table = SlotTable::new(table_handle, qbits, rbits);
        let index_mask = (1u64 << qbits) - 1;
        let rmask = (1u64 << rbits) - 1;
        let max_size = 1u64 << qbits;
        let plausible = pool.read_u64(base + FIELD_ELEM_BITS) == rbits + METADATA_BITS
            && pool.read_u64(base + FIELD_INDEX_MASK) == index_mask
            && pool.read_u64(base + FIELD_RMASK) == rmask
            && pool.read_u64(base + FIELD_ELEM_MASK) == table.elem_mask()
            && pool.read_u64(base + FIELD_MAX_SIZE) == max_size
            && pool.read_u64(base + FIELD_ENTRIES) <= max_size;
        if !plausible {
            return Err(Error::Corrupted(
                "filter state fields are inconsistent".to_string(),
            ));
        }
        Ok(QuotientFilter {
            state,
            qbits,
            rbits,
            index_mask,
            rmask,
            max_size,
            table,
        })
    }

    /// Returns the handle of the filter's state object, for persisting in a
    /// root slot and rebinding with [`open`](QuotientFilter::open).
    pub fn state_handle(&self) -> Handle {
        self.state
    }

    /// Inserts the fingerprint of `hash` (its low `qbits + rbits` bits).
    /// Returns `Ok(false)`, without mutating anything, if and only if the
    /// filter is full before the call; inserting an already-present
    /// fingerprint is a no-op that reports success.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    /// use persistent_quotient_filter::quotient::QuotientFilter;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
    ///
    /// let filter = QuotientFilter::init(&mut pool, 8, 4).unwrap();
    /// assert!(filter.insert(&mut pool, 0xabc).unwrap());
    /// assert!(filter.insert(&mut pool, 0xabc).unwrap());
    /// assert_eq!(filter.len(&pool), 1);
    /// ```
    pub fn insert(&self, pool: &mut Pool, hash: u64) -> Result<bool> {
        let mut tx = pool.begin();
        let inserted = self.insert_in(&mut tx, hash)?;
        if inserted {
            tx.commit()?;
        }
        Ok(inserted)
    }

    fn insert_in(&self, tx: &mut Transaction<'_>, hash: u64) -> Result<bool> {
        if self.stored_entries(tx) >= self.max_size {
            return Ok(false);
        }

        let fq = self.hash_to_quotient(hash);
        let fr = self.hash_to_remainder(hash);
        let t_fq = self.table.get(tx, fq);
        let mut entry = fr << METADATA_BITS;

        // An empty canonical slot takes the fingerprint directly and starts
        // a new cluster.
        if is_empty_element(t_fq) {
            self.table.set(tx, fq, set_occupied(entry));
            let entries = self.stored_entries(tx);
            self.set_entries(tx, entries + 1);
            return Ok(true);
        }

        // Mark the canonical slot before navigating so the new run is
        // counted by find_run.
        if !is_occupied(t_fq) {
            self.table.set(tx, fq, set_occupied(t_fq));
        }

        let start = self.find_run(tx, fq);
        let mut s = start;

        if is_occupied(t_fq) {
            // The run already existed: find the ascending position for fr,
            // bailing out on an exact duplicate.
            loop {
                let rem = remainder_of(self.table.get(tx, s));
                if rem == fr {
                    return Ok(true);
                }
                if rem > fr {
                    break;
                }
                s = self.incr(s);
                if !is_continuation(self.table.get(tx, s)) {
                    break;
                }
            }

            if s == start {
                // The old run head is demoted to a continuation.
                let old_head = self.table.get(tx, start);
                self.table.set(tx, start, set_continuation(old_head));
            } else {
                entry = set_continuation(entry);
            }
        }

        if s != fq {
            entry = set_shifted(entry);
        }

        self.insert_into(tx, s, entry);
        let entries = self.stored_entries(tx);
        self.set_entries(tx, entries + 1);
        Ok(true)
    }

    // Place `elem` at slot `s`, rippling displaced slots right until an empty
    // slot absorbs the overflow. The occupied bit is bound to the index: a
    // displaced slot leaves its occupied bit behind and inherits none.
    fn insert_into(&self, tx: &mut Transaction<'_>, mut s: u64, elem: u64) {
        let mut curr = elem;
        loop {
            let mut prev = self.table.get(tx, s);
            let empty = is_empty_element(prev);
            if !empty {
                prev = set_shifted(prev);
                if is_occupied(prev) {
                    curr = set_occupied(curr);
                    prev = clr_occupied(prev);
                }
            }
            self.table.set(tx, s, curr);
            curr = prev;
            s = self.incr(s);
            if empty {
                break;
            }
        }
    }

    /// Returns `true` if a fingerprint equal to the low `qbits + rbits` bits
    /// of `hash` may have been inserted. Never returns `false` for an
    /// inserted fingerprint. Read-only; takes no transaction.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    /// use persistent_quotient_filter::quotient::QuotientFilter;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
    ///
    /// let filter = QuotientFilter::init(&mut pool, 8, 4).unwrap();
    /// filter.insert(&mut pool, 0xf0f).unwrap();
    /// assert!(filter.may_contain(&pool, 0xf0f));
    /// assert!(!filter.may_contain(&pool, 0xf0e));
    /// ```
    pub fn may_contain(&self, pool: &Pool, hash: u64) -> bool {
        let fq = self.hash_to_quotient(hash);
        let fr = self.hash_to_remainder(hash);

        // No run for this quotient at all.
        if !is_occupied(self.table.get(pool, fq)) {
            return false;
        }

        // Scan the sorted run for the remainder.
        let mut s = self.find_run(pool, fq);
        loop {
            let rem = remainder_of(self.table.get(pool, s));
            if rem == fr {
                return true;
            }
            if rem > fr {
                return false;
            }
            s = self.incr(s);
            if !is_continuation(self.table.get(pool, s)) {
                return false;
            }
        }
    }

    /// Removes the fingerprint of `hash`. Removing a fingerprint that was
    /// never inserted is a no-op that reports success.
    ///
    /// Returns `Ok(false)`, without mutating anything, if `hash` has bits
    /// set above `qbits + rbits`: such a hash cannot have been stored, and
    /// silently removing its truncation could evict a colliding narrower
    /// fingerprint and create a false negative.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    /// use persistent_quotient_filter::quotient::QuotientFilter;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
    ///
    /// let filter = QuotientFilter::init(&mut pool, 8, 4).unwrap();
    /// filter.insert(&mut pool, 0x123).unwrap();
    /// assert!(filter.remove(&mut pool, 0x123).unwrap());
    /// assert!(!filter.may_contain(&pool, 0x123));
    /// assert!(!filter.remove(&mut pool, 0x1_0000_0123).unwrap());
    /// ```
    pub fn remove(&self, pool: &mut Pool, hash: u64) -> Result<bool> {
        let fingerprint_bits = self.qbits + self.rbits;
        if fingerprint_bits < 64 && hash >> fingerprint_bits != 0 {
            return Ok(false);
        }

        let fq = self.hash_to_quotient(hash);
        let fr = self.hash_to_remainder(hash);
        let t_fq = self.table.get(pool, fq);

        if !is_occupied(t_fq) || self.stored_entries(pool) == 0 {
            return Ok(true);
        }

        // Locate the slot holding fr, or conclude it was never stored.
        let start = self.find_run(pool, fq);
        let mut s = start;
        loop {
            let rem = remainder_of(self.table.get(pool, s));
            if rem == fr {
                break;
            }
            if rem > fr {
                return Ok(true);
            }
            s = self.incr(s);
            if !is_continuation(self.table.get(pool, s)) {
                return Ok(true);
            }
        }

        let kill = if s == fq { t_fq } else { self.table.get(pool, s) };
        let replace_run_start = is_run_start(kill);

        let mut tx = pool.begin();

        // Deleting the last element of a run retires the run.
        if replace_run_start {
            let next = self.table.get(&tx, self.incr(s));
            if !is_continuation(next) {
                self.table.set(&mut tx, fq, clr_occupied(t_fq));
            }
        }

        self.delete_entry(&mut tx, s, fq);

        if replace_run_start {
            // The slot that slid into s heads the run now.
            let next = self.table.get(&tx, s);
            let mut updated = next;
            if is_continuation(updated) {
                updated = clr_continuation(updated);
            }
            if s == fq && is_run_start(updated) {
                updated = clr_shifted(updated);
            }
            if updated != next {
                self.table.set(&mut tx, s, updated);
            }
        }

        let entries = self.stored_entries(&tx);
        self.set_entries(&mut tx, entries - 1);
        tx.commit()?;
        Ok(true)
    }

    // Remove the element at slot `s` and slide the rest of its cluster one
    // slot left. `quot` tracks the canonical index of each run that slides so
    // a run reaching its canonical slot drops its shifted bit.
    fn delete_entry(&self, tx: &mut Transaction<'_>, mut s: u64, mut quot: u64) {
        let orig = s;
        let mut curr = self.table.get(tx, s);
        let mut sp = self.incr(s);

        loop {
            let next = self.table.get(tx, sp);
            let curr_occupied = is_occupied(curr);

            if is_empty_element(next) || is_cluster_start(next) || sp == orig {
                self.table.set(tx, s, 0);
                return;
            }

            let mut updated_next = next;
            if is_run_start(next) {
                loop {
                    quot = self.incr(quot);
                    if is_occupied(self.table.get(tx, quot)) {
                        break;
                    }
                }
                if curr_occupied && quot == s {
                    updated_next = clr_shifted(next);
                }
            }

            self.table.set(
                tx,
                s,
                if curr_occupied {
                    set_occupied(updated_next)
                } else {
                    clr_occupied(updated_next)
                },
            );
            s = sp;
            sp = self.incr(sp);
            curr = next;
        }
    }

    /// Removes every fingerprint, zeroing the table and the entry count in
    /// one transaction. The filter behaves as freshly initialized afterward.
    pub fn clear(&self, pool: &mut Pool) -> Result<()> {
        let mut tx = pool.begin();
        self.set_entries(&mut tx, 0);
        self.table.clear(&mut tx);
        tx.commit()
    }

    /// Frees the filter's table and state object back to the pool in one
    /// transaction, consuming the binding. A crash during `destroy` leaks
    /// nothing: either both regions are released or neither is.
    pub fn destroy(self, pool: &mut Pool) -> Result<()> {
        let mut tx = pool.begin();
        tx.free(self.table.handle());
        tx.write_u64(self.state.offset() + FIELD_TABLE, 0);
        tx.free(self.state);
        tx.commit()
    }

    /// Merges two filters into a freshly initialized third with
    /// `1 + max(qbits)` quotient bits and `max(rbits)` remainder bits, which
    /// is capacity enough for both inputs in full. Runs under a single
    /// transaction: on any error the output filter does not exist. The
    /// inputs are not modified.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    /// use persistent_quotient_filter::quotient::QuotientFilter;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
    ///
    /// let a = QuotientFilter::init(&mut pool, 4, 4).unwrap();
    /// let b = QuotientFilter::init(&mut pool, 4, 4).unwrap();
    /// a.insert(&mut pool, 0x11).unwrap();
    /// b.insert(&mut pool, 0x22).unwrap();
    ///
    /// let merged = QuotientFilter::merge(&mut pool, &a, &b).unwrap();
    /// assert_eq!(merged.quotient_bits(), 5);
    /// assert!(merged.may_contain(&pool, 0x11));
    /// assert!(merged.may_contain(&pool, 0x22));
    /// ```
    pub fn merge(
        pool: &mut Pool,
        a: &QuotientFilter,
        b: &QuotientFilter,
    ) -> Result<QuotientFilter> {
        let qbits = 1 + a.qbits.max(b.qbits);
        let rbits = a.rbits.max(b.rbits);

        let mut tx = pool.begin();
        let out = Self::init_in(&mut tx, qbits, rbits)?;
        for &source in &[a, b] {
            let mut cursor = source.cursor(&tx);
            while !cursor.done() {
                let hash = cursor.next(&tx, source);
                if !out.insert_in(&mut tx, hash)? {
                    return Err(Error::FilterFull);
                }
            }
        }
        tx.commit()?;
        Ok(out)
    }

    /// Starts a cursor over every stored fingerprint. The order is
    /// deterministic for a given filter state but unrelated to insertion
    /// order; each fingerprint is yielded exactly once. The cursor snapshots
    /// the entry count, so the filter must not be mutated while it is live.
    ///
    /// For ordinary iteration prefer [`hashes`](QuotientFilter::hashes); the
    /// cursor form exists so a caller can keep advancing it while mutating a
    /// *different* filter in the same pool, as `merge` does.
    pub fn cursor<M: MemRead>(&self, mem: &M) -> FilterCursor {
        let entries = self.stored_entries(mem);
        let mut cursor = FilterCursor {
            index: 0,
            quotient: 0,
            visited: entries,
            entries,
        };
        if entries == 0 {
            return cursor;
        }

        // Start scanning at a cluster start so run accounting begins from a
        // known state.
        for start in 0..self.max_size {
            if is_cluster_start(self.table.get(mem, start)) {
                cursor.index = start;
                break;
            }
        }
        cursor.visited = 0;
        cursor
    }

    /// Returns an iterator over every stored fingerprint.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    /// use persistent_quotient_filter::quotient::QuotientFilter;
    /// use std::collections::HashSet;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
    ///
    /// let filter = QuotientFilter::init(&mut pool, 8, 4).unwrap();
    /// for hash in &[0x1a2, 0x3b4, 0x5c6] {
    ///     filter.insert(&mut pool, *hash).unwrap();
    /// }
    /// let stored: HashSet<u64> = filter.hashes(&pool).collect();
    /// assert_eq!(stored, [0x1a2, 0x3b4, 0x5c6].iter().cloned().collect());
    /// ```
    pub fn hashes<'a>(&'a self, pool: &'a Pool) -> Hashes<'a> {
        Hashes {
            cursor: self.cursor(pool),
            filter: self,
            pool,
        }
    }

    /// Returns the number of stored fingerprints.
    pub fn len(&self, pool: &Pool) -> u64 {
        self.stored_entries(pool)
    }

    /// Returns `true` if no fingerprints are stored.
    pub fn is_empty(&self, pool: &Pool) -> bool {
        self.len(pool) == 0
    }

    /// Returns the number of slots, `2^qbits`.
    pub fn capacity(&self) -> u64 {
        self.max_size
    }

    /// Returns the quotient width in bits.
    pub fn quotient_bits(&self) -> u64 {
        self.qbits
    }

    /// Returns the remainder width in bits.
    pub fn remainder_bits(&self) -> u64 {
        self.rbits
    }

    /// Returns the estimated false positive probability at the current fill
    /// ratio. This value grows as fingerprints are added.
    pub fn estimated_fpp(&self, pool: &Pool) -> f64 {
        let fill_ratio = self.len(pool) as f64 / self.capacity() as f64;
        1.0 - consts::E.powf(-fill_ratio / 2.0f64.powf(self.rbits as f64))
    }

    /// Returns a value whose `Debug` output lists every slot as
    /// `index|remainder:metadata`, with the metadata bits printed as
    /// `shifted`, `continuation`, `occupied` from high to low.
    pub fn dump<'a>(&'a self, pool: &'a Pool) -> TableDump<'a> {
        TableDump { filter: self, pool }
    }

    fn stored_entries<M: MemRead>(&self, mem: &M) -> u64 {
        mem.read_u64(self.state.offset() + FIELD_ENTRIES)
    }

    fn set_entries(&self, tx: &mut Transaction<'_>, entries: u64) {
        tx.write_u64(self.state.offset() + FIELD_ENTRIES, entries);
    }

    fn hash_to_quotient(&self, hash: u64) -> u64 {
        (hash >> self.rbits) & self.index_mask
    }

    fn hash_to_remainder(&self, hash: u64) -> u64 {
        hash & self.rmask
    }

    fn incr(&self, index: u64) -> u64 {
        (index + 1) & self.index_mask
    }

    fn decr(&self, index: u64) -> u64 {
        index.wrapping_sub(1) & self.index_mask
    }

    // Find the first slot of the run for quotient `fq`, given that the run
    // exists (`occupied` is set on slot `fq`).
    fn find_run<M: MemRead>(&self, mem: &M, fq: u64) -> u64 {
        // Walk left to the start of the cluster.
        let mut b = fq;
        while is_shifted(self.table.get(mem, b)) {
            b = self.decr(b);
        }

        // Each occupied slot between the cluster start and fq owns one run;
        // skip that many whole runs to land on fq's.
        let mut s = b;
        while b != fq {
            loop {
                s = self.incr(s);
                if !is_continuation(self.table.get(mem, s)) {
                    break;
                }
            }
            loop {
                b = self.incr(b);
                if is_occupied(self.table.get(mem, b)) {
                    break;
                }
            }
        }
        s
    }
}

/// Explicit iteration state over a filter, advanced one fingerprint at a
/// time against any [`MemRead`] source. See [`QuotientFilter::cursor`].
pub struct FilterCursor {
    index: u64,
    quotient: u64,
    visited: u64,
    entries: u64,
}

impl FilterCursor {
    /// Returns `true` once every fingerprint has been yielded.
    pub fn done(&self) -> bool {
        self.visited == self.entries
    }

    /// Yields the next fingerprint of `filter`, reading slots through `mem`.
    ///
    /// # Panics
    ///
    /// Panics if the cursor is [`done`](FilterCursor::done): advancing past
    /// the end is a precondition violation, not a recoverable condition.
    pub fn next<M: MemRead>(&mut self, mem: &M, filter: &QuotientFilter) -> u64 {
        assert!(!self.done(), "cursor advanced past the final fingerprint");
        loop {
            let elem = filter.table.get(mem, self.index);

            // Track the canonical quotient of the run the scan is inside.
            if is_cluster_start(elem) {
                self.quotient = self.index;
            } else if is_run_start(elem) {
                let mut quot = self.quotient;
                loop {
                    quot = filter.incr(quot);
                    if is_occupied(filter.table.get(mem, quot)) {
                        break;
                    }
                }
                self.quotient = quot;
            }

            self.index = filter.incr(self.index);

            if !is_empty_element(elem) {
                self.visited += 1;
                return (self.quotient << filter.rbits) | remainder_of(elem);
            }
        }
    }
}

/// Borrowing iterator over a filter's stored fingerprints. Created by
/// [`QuotientFilter::hashes`].
pub struct Hashes<'a> {
    cursor: FilterCursor,
    filter: &'a QuotientFilter,
    pool: &'a Pool,
}

impl<'a> Iterator for Hashes<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.cursor.done() {
            None
        } else {
            Some(self.cursor.next(self.pool, self.filter))
        }
    }
}

/// Slot-by-slot debug rendering of a filter's table. Created by
/// [`QuotientFilter::dump`].
pub struct TableDump<'a> {
    filter: &'a QuotientFilter,
    pool: &'a Pool,
}

impl fmt::Debug for TableDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.filter.capacity() {
            let elem = self.filter.table.get(self.pool, index);
            write!(
                f,
                "{}|{}:{:03b} ",
                index,
                remainder_of(elem),
                elem & METADATA_MASK
            )?;
        }
        Ok(())
    }
}
