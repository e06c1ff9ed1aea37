//! Transactions over the pool: a write-set overlay enacted through an
//! on-disk undo log.
//!
//! A transaction never touches the mapping directly. Writes collect in a
//! word-granular overlay; reads through the transaction consult the overlay
//! first, so a transaction observes its own effects. `commit` coalesces the
//! overlay into byte ranges, persists the pre-image of every range to the
//! undo log, syncs it, and only then applies the overlay and flushes the
//! mapping. The log is truncated once the mutated ranges are durable. A crash
//! anywhere in that sequence leaves either a log whose replay is a no-op (the
//! mapping was never touched) or a complete log that recovery replays to
//! restore the pre-transaction image.

use super::{
    align_up, MemRead, Pool, ALLOC_ALIGN, BLOCK_HEADER_SIZE, OFF_ALLOC_NEXT, OFF_FREE_HEAD,
    OFF_ROOTS, ROOT_SLOTS,
};
use crate::error::{Error, Result};
use crate::pool::Handle;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;

/// An open transaction on a [`Pool`].
///
/// All mutating filter operations run inside exactly one transaction. Writes
/// made through a transaction become visible to pool readers, and durable,
/// only when [`commit`](Transaction::commit) returns; dropping the
/// transaction first aborts it and discards every buffered write.
///
/// # Examples
///
/// ```
/// use persistent_quotient_filter::pool::{MemRead, Pool};
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
///
/// let mut tx = pool.begin();
/// let handle = tx.alloc_zeroed(64).unwrap();
/// tx.write_u64(handle.as_u64(), 42);
/// assert_eq!(tx.read_u64(handle.as_u64()), 42);
/// tx.commit().unwrap();
/// ```
pub struct Transaction<'a> {
    pool: &'a mut Pool,
    // Word-aligned offset -> new word value.
    overlay: BTreeMap<u64, u64>,
    on_commit: Vec<Box<dyn FnOnce()>>,
    on_abort: Vec<Box<dyn FnOnce()>>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(pool: &'a mut Pool) -> Transaction<'a> {
        Transaction {
            pool,
            overlay: BTreeMap::new(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            committed: false,
        }
    }

    /// Buffers a write of the little-endian u64 word at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or out of bounds.
    pub fn write_u64(&mut self, offset: u64, value: u64) {
        debug_assert!(offset % 8 == 0);
        assert!(offset + 8 <= self.pool.capacity);
        self.overlay.insert(offset, value);
    }

    /// Buffers writes zeroing `len` bytes starting at `offset`. `len` must be
    /// a multiple of the word size.
    pub fn write_zeros(&mut self, offset: u64, len: u64) {
        assert!(len % 8 == 0);
        for word in 0..len / 8 {
            self.write_u64(offset + word * 8, 0);
        }
    }

    /// Allocates `size` bytes in the pool and returns a handle to the
    /// payload. The content of a recycled region is unspecified; use
    /// [`alloc_zeroed`](Transaction::alloc_zeroed) when zero-fill matters.
    pub fn alloc(&mut self, size: u64) -> Result<Handle> {
        self.alloc_inner(size).map(|(handle, _)| handle)
    }

    /// Allocates `size` zero-filled bytes in the pool.
    pub fn alloc_zeroed(&mut self, size: u64) -> Result<Handle> {
        let (handle, recycled) = self.alloc_inner(size)?;
        if recycled {
            self.write_zeros(handle.offset(), align_up(size, ALLOC_ALIGN));
        }
        Ok(handle)
    }

    fn alloc_inner(&mut self, size: u64) -> Result<(Handle, bool)> {
        assert!(size > 0);
        let size = align_up(size, ALLOC_ALIGN);

        // First fit from the free list. Links live in the first payload word
        // of each free block.
        let mut prev: Option<u64> = None;
        let mut curr = self.read_u64(OFF_FREE_HEAD);
        while curr != 0 {
            let block_size = self.read_u64(curr - BLOCK_HEADER_SIZE);
            let next = self.read_u64(curr);
            if block_size >= size {
                match prev {
                    None => self.write_u64(OFF_FREE_HEAD, next),
                    Some(prev) => self.write_u64(prev, next),
                }
                trace!("alloc {} bytes: recycled block at {}", size, curr);
                return Ok((Handle(curr), true));
            }
            prev = Some(curr);
            curr = next;
        }

        let cursor = self.read_u64(OFF_ALLOC_NEXT);
        let end = cursor
            .checked_add(BLOCK_HEADER_SIZE + size)
            .ok_or(Error::PoolExhausted { requested: size })?;
        if end > self.pool.capacity {
            return Err(Error::PoolExhausted { requested: size });
        }
        self.write_u64(OFF_ALLOC_NEXT, end);
        self.write_u64(cursor, size);
        self.write_u64(cursor + 8, 0);
        trace!("alloc {} bytes: fresh block at {}", size, cursor);
        Ok((Handle(cursor + BLOCK_HEADER_SIZE), false))
    }

    /// Returns the allocation at `handle` to the pool's free list.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is null.
    pub fn free(&mut self, handle: Handle) {
        assert!(!handle.is_null());
        let head = self.read_u64(OFF_FREE_HEAD);
        self.write_u64(handle.offset(), head);
        self.write_u64(OFF_FREE_HEAD, handle.offset());
        trace!("freed block at {}", handle.offset());
    }

    /// Stores `handle` in root slot `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= ROOT_SLOTS`.
    pub fn set_root(&mut self, slot: usize, handle: Handle) {
        assert!(slot < ROOT_SLOTS);
        self.write_u64(OFF_ROOTS + 8 * slot as u64, handle.offset());
    }

    /// Registers a hook to run after the transaction commits.
    pub fn on_commit<F: FnOnce() + 'static>(&mut self, hook: F) {
        self.on_commit.push(Box::new(hook));
    }

    /// Registers a hook to run if the transaction aborts.
    pub fn on_abort<F: FnOnce() + 'static>(&mut self, hook: F) {
        self.on_abort.push(Box::new(hook));
    }

    /// Commits the transaction: persists undo records for every mutated
    /// range, applies the buffered writes, and flushes them to the pool file.
    ///
    /// On error the transaction is aborted and the pool is unchanged.
    pub fn commit(mut self) -> Result<()> {
        if !self.overlay.is_empty() {
            let ranges = self.coalesced_ranges();
            trace!(
                "committing {} words in {} ranges",
                self.overlay.len(),
                ranges.len()
            );
            self.pool.log.write_records(&ranges, &self.pool.map)?;
            self.enact();
            for &(start, len) in &ranges {
                self.pool.map.flush_range(start as usize, len as usize)?;
            }
            self.pool.log.reset()?;
        }
        self.committed = true;
        for hook in mem::take(&mut self.on_commit) {
            hook();
        }
        Ok(())
    }

    fn enact(&mut self) {
        for (&offset, &word) in &self.overlay {
            let offset = offset as usize;
            LittleEndian::write_u64(&mut self.pool.map[offset..offset + 8], word);
        }
    }

    // Coalesces the overlay into maximal contiguous (offset, len) byte
    // ranges, in ascending offset order.
    fn coalesced_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for &offset in self.overlay.keys() {
            match ranges.last_mut() {
                Some((start, len)) if *start + *len == offset => *len += 8,
                _ => ranges.push((offset, 8)),
            }
        }
        ranges
    }

    /// Simulates a crash: persists the undo log and, if `enact` is set, the
    /// buffered writes, but never truncates the log. The next `Pool::open`
    /// must roll the effects back.
    #[cfg(test)]
    pub(crate) fn crash(mut self, enact: bool) {
        let ranges = self.coalesced_ranges();
        self.pool.log.write_records(&ranges, &self.pool.map).unwrap();
        if enact {
            self.enact();
            self.pool.map.flush().unwrap();
        }
        // Suppress the abort hooks; as far as the caller knows, the process
        // died here.
        self.committed = true;
    }
}

impl MemRead for Transaction<'_> {
    fn read_u64(&self, offset: u64) -> u64 {
        match self.overlay.get(&offset) {
            Some(&word) => word,
            None => self.pool.read_u64(offset),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if !self.overlay.is_empty() {
                debug!(
                    "transaction aborted, {} buffered words discarded",
                    self.overlay.len()
                );
            }
            for hook in mem::take(&mut self.on_abort) {
                hook();
            }
        }
    }
}

const LOG_MAGIC: u64 = u64::from_le_bytes(*b"QFULOG\x00\x01");

// Undo-log record: offset u64 | len u64 | pre-image bytes | crc32 over all of
// the preceding fields. Records are only ever replayed when the whole log was
// synced before the mapping was touched, so replaying a torn suffix-free
// prefix is always safe.
pub(crate) struct UndoLog {
    file: File,
}

impl UndoLog {
    pub(super) fn open(path: &Path) -> Result<UndoLog> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(UndoLog { file })
    }

    pub(super) fn write_records(&mut self, ranges: &[(u64, u64)], map: &[u8]) -> Result<()> {
        let payload: u64 = ranges.iter().map(|&(_, len)| len + 20).sum();
        let mut buf = Vec::with_capacity(8 + payload as usize);
        buf.write_u64::<LittleEndian>(LOG_MAGIC)?;
        for &(offset, len) in ranges {
            let data = &map[offset as usize..(offset + len) as usize];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&offset.to_le_bytes());
            hasher.update(&len.to_le_bytes());
            hasher.update(data);
            buf.write_u64::<LittleEndian>(offset)?;
            buf.write_u64::<LittleEndian>(len)?;
            buf.extend_from_slice(data);
            buf.write_u32::<LittleEndian>(hasher.finalize())?;
        }
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub(super) fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    // Replays every intact undo record into `map` and truncates the log.
    // Returns the number of ranges restored.
    pub(super) fn recover(&mut self, map: &mut [u8]) -> Result<usize> {
        let mut buf = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() < 8 || LittleEndian::read_u64(&buf) != LOG_MAGIC {
            warn!("discarding unrecognized undo log ({} bytes)", buf.len());
            self.reset()?;
            return Ok(0);
        }

        let mut pos = 8;
        let mut applied = 0;
        while buf.len() - pos >= 20 {
            let offset = LittleEndian::read_u64(&buf[pos..]);
            let len = LittleEndian::read_u64(&buf[pos + 8..]);
            let data_start = pos + 16;
            let record_end = match (len as usize)
                .checked_add(data_start)
                .and_then(|end| end.checked_add(4))
            {
                Some(end) if end <= buf.len() => end,
                _ => break,
            };
            let data = &buf[data_start..record_end - 4];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&offset.to_le_bytes());
            hasher.update(&len.to_le_bytes());
            hasher.update(data);
            if hasher.finalize() != LittleEndian::read_u32(&buf[record_end - 4..]) {
                warn!("undo log record at byte {} failed its checksum", pos);
                break;
            }
            let end = offset as usize + data.len();
            if end > map.len() {
                warn!("undo log record at byte {} is out of bounds", pos);
                break;
            }
            map[offset as usize..end].copy_from_slice(data);
            applied += 1;
            pos = record_end;
        }
        self.reset()?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{MemRead, Pool};
    use std::cell::Cell;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::rc::Rc;

    fn new_pool(dir: &tempfile::TempDir) -> Pool {
        Pool::create(dir.path().join("tx.pool"), 1 << 16).unwrap()
    }

    #[test]
    fn test_commit_visible_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        let handle;
        {
            let mut pool = new_pool(&dir);
            path = pool.path().to_path_buf();
            let mut tx = pool.begin();
            handle = tx.alloc(16).unwrap();
            tx.write_u64(handle.as_u64(), 0x5eed);
            tx.commit().unwrap();
        }
        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.read_u64(handle.as_u64()), 0x5eed);
    }

    #[test]
    fn test_abort_discards_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = new_pool(&dir);

        let mut tx = pool.begin();
        let handle = tx.alloc(16).unwrap();
        tx.write_u64(handle.as_u64(), 7);
        tx.commit().unwrap();

        let mut tx = pool.begin();
        tx.write_u64(handle.as_u64(), 8);
        assert_eq!(tx.read_u64(handle.as_u64()), 8);
        drop(tx);
        assert_eq!(pool.read_u64(handle.as_u64()), 7);
    }

    #[test]
    fn test_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = new_pool(&dir);
        let committed = Rc::new(Cell::new(false));
        let aborted = Rc::new(Cell::new(false));

        let mut tx = pool.begin();
        let seen = Rc::clone(&committed);
        tx.on_commit(move || seen.set(true));
        let seen = Rc::clone(&aborted);
        tx.on_abort(move || seen.set(true));
        tx.commit().unwrap();
        assert!(committed.get());
        assert!(!aborted.get());

        let aborted = Rc::new(Cell::new(false));
        let mut tx = pool.begin();
        let seen = Rc::clone(&aborted);
        tx.on_abort(move || seen.set(true));
        drop(tx);
        assert!(aborted.get());
    }

    #[test]
    fn test_recovery_rolls_back_enacted_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        let handle;
        {
            let mut pool = new_pool(&dir);
            path = pool.path().to_path_buf();
            let mut tx = pool.begin();
            handle = tx.alloc(16).unwrap();
            tx.write_u64(handle.as_u64(), 1);
            tx.commit().unwrap();

            let mut tx = pool.begin();
            tx.write_u64(handle.as_u64(), 2);
            tx.crash(true);
            assert_eq!(pool.read_u64(handle.as_u64()), 2);
        }
        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.read_u64(handle.as_u64()), 1);
    }

    #[test]
    fn test_recovery_tolerates_unenacted_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        let handle;
        {
            let mut pool = new_pool(&dir);
            path = pool.path().to_path_buf();
            let mut tx = pool.begin();
            handle = tx.alloc(16).unwrap();
            tx.write_u64(handle.as_u64(), 1);
            tx.commit().unwrap();

            let mut tx = pool.begin();
            tx.write_u64(handle.as_u64(), 2);
            tx.crash(false);
        }
        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.read_u64(handle.as_u64()), 1);
    }

    #[test]
    fn test_recovery_ignores_torn_log() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        let log_path;
        let handle;
        {
            let mut pool = new_pool(&dir);
            path = pool.path().to_path_buf();
            log_path = super::super::log_path(&path);
            let mut tx = pool.begin();
            handle = tx.alloc(16).unwrap();
            tx.write_u64(handle.as_u64(), 3);
            tx.commit().unwrap();
        }
        // A log torn mid-record, as if the process died before the sync
        // completed. The pool itself was never touched, so recovery must
        // leave it as committed.
        let mut log = OpenOptions::new().write(true).open(&log_path).unwrap();
        log.write_all(&super::LOG_MAGIC.to_le_bytes()).unwrap();
        log.write_all(&[0xff; 13]).unwrap();
        drop(log);

        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.read_u64(handle.as_u64()), 3);
    }
}
