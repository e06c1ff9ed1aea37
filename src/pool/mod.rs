//! Memory-mapped persistent pool with transactional byte-range undo logging.
//!
//! A [`Pool`] is a single file mapped into the address space. Objects inside
//! it are addressed by [`Handle`]s (byte offsets), which stay valid across
//! transactions and process restarts; the mapped address does not, so every
//! reopen rebinds handles against the fresh mapping. All mutations go through
//! a [`Transaction`], which buffers writes and persists undo records for every
//! mutated range before the mapping is touched. A crash at any point is rolled
//! back to the exact pre-transaction state by the recovery pass in
//! [`Pool::open`].

mod tx;

pub use self::tx::Transaction;

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use memmap2::MmapMut;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

const POOL_MAGIC: u64 = u64::from_le_bytes(*b"QFPOOL\x00\x01");
const POOL_VERSION: u64 = 1;

// Pool header field offsets, all little-endian u64 words.
const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_CAPACITY: u64 = 16;
const OFF_ALLOC_NEXT: u64 = 24;
const OFF_FREE_HEAD: u64 = 32;
const OFF_ROOTS: u64 = 40;

/// Number of root-handle slots in the pool header.
pub const ROOT_SLOTS: usize = 16;

// The header occupies the first page; allocations start after it.
const DATA_START: u64 = 4096;

// Allocation granularity. Each block is a 16-byte header (payload size in the
// first word) followed by the payload.
pub(crate) const ALLOC_ALIGN: u64 = 16;
pub(crate) const BLOCK_HEADER_SIZE: u64 = 16;

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// A stable reference to an allocation inside a [`Pool`].
///
/// Handles are byte offsets, so they survive closing and reopening the pool.
/// They do not survive `free`; rebinding a stale handle is caught only as far
/// as [`crate::quotient::QuotientFilter::open`] validation goes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handle(u64);

impl Handle {
    /// The null handle. Never returned by a successful allocation.
    pub const NULL: Handle = Handle(0);

    /// Returns `true` if this is the null handle.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reconstructs a handle from its stored representation.
    pub fn from_u64(offset: u64) -> Handle {
        Handle(offset)
    }

    /// Returns the stored representation of this handle.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn offset(self) -> u64 {
        self.0
    }
}

/// Read access to pool words, implemented by both [`Pool`] and
/// [`Transaction`].
///
/// Reads through a transaction observe that transaction's buffered writes;
/// reads through the pool observe only committed state. Code that only reads
/// (lookups, iteration, run navigation) is generic over this trait so it can
/// run inside or outside a transaction.
pub trait MemRead {
    /// Reads the little-endian u64 word at `offset`. `offset` must be
    /// word-aligned and in bounds.
    fn read_u64(&self, offset: u64) -> u64;
}

/// A persistent memory pool backed by a memory-mapped file.
pub struct Pool {
    map: MmapMut,
    log: tx::UndoLog,
    capacity: u64,
    path: PathBuf,
}

impl Pool {
    /// Creates a new pool file of (at least) `capacity` bytes at `path`,
    /// along with its undo-log sidecar file. Fails if `path` already exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use persistent_quotient_filter::pool::Pool;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let pool = Pool::create(dir.path().join("example.pool"), 1 << 20).unwrap();
    /// assert!(pool.capacity() >= 1 << 20);
    /// ```
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Pool> {
        let path = path.as_ref().to_path_buf();
        let capacity = align_up(capacity.max(2 * DATA_START), DATA_START);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(capacity)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        let mut header = [0u8; 48];
        LittleEndian::write_u64(&mut header[OFF_MAGIC as usize..], POOL_MAGIC);
        LittleEndian::write_u64(&mut header[OFF_VERSION as usize..], POOL_VERSION);
        LittleEndian::write_u64(&mut header[OFF_CAPACITY as usize..], capacity);
        LittleEndian::write_u64(&mut header[OFF_ALLOC_NEXT as usize..], DATA_START);
        LittleEndian::write_u64(&mut header[OFF_FREE_HEAD as usize..], 0);
        map[..header.len()].copy_from_slice(&header);
        map.flush()?;

        // A leftover log from an earlier pool at this path must not replay
        // into the fresh one.
        let mut log = tx::UndoLog::open(&log_path(&path))?;
        log.reset()?;
        debug!("created pool at {:?}, capacity {} bytes", path, capacity);
        Ok(Pool {
            map,
            log,
            capacity,
            path,
        })
    }

    /// Opens an existing pool, rolling back any transaction that was
    /// interrupted by a crash.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Pool> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        if len < DATA_START || LittleEndian::read_u64(&map[OFF_MAGIC as usize..]) != POOL_MAGIC {
            return Err(Error::Corrupted(format!("{:?} is not a pool file", path)));
        }
        let version = LittleEndian::read_u64(&map[OFF_VERSION as usize..]);
        if version != POOL_VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported pool format version {}",
                version
            )));
        }
        let capacity = LittleEndian::read_u64(&map[OFF_CAPACITY as usize..]);
        if capacity != len {
            return Err(Error::Corrupted(format!(
                "pool header records {} bytes but the file holds {}",
                capacity, len
            )));
        }

        let mut log = tx::UndoLog::open(&log_path(&path))?;
        let rolled_back = log.recover(&mut map)?;
        if rolled_back > 0 {
            map.flush()?;
            debug!(
                "recovered pool at {:?}: rolled back {} byte ranges",
                path, rolled_back
            );
        }
        Ok(Pool {
            map,
            log,
            capacity,
            path,
        })
    }

    /// Starts a transaction. Writes buffer inside the transaction and reach
    /// the pool only on [`Transaction::commit`]; dropping the transaction
    /// without committing aborts it.
    pub fn begin(&mut self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Returns the handle stored in root slot `slot`, or [`Handle::NULL`] if
    /// the slot is empty. Root slots are the recovery anchors a caller uses
    /// to find its objects again after reopening the pool.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= ROOT_SLOTS`.
    pub fn root(&self, slot: usize) -> Handle {
        assert!(slot < ROOT_SLOTS);
        Handle(self.read_u64(OFF_ROOTS + 8 * slot as u64))
    }

    /// Returns the pool capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the path of the pool file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MemRead for Pool {
    fn read_u64(&self, offset: u64) -> u64 {
        debug_assert!(offset % 8 == 0);
        assert!(offset + 8 <= self.capacity);
        LittleEndian::read_u64(&self.map[offset as usize..])
    }
}

fn log_path(pool_path: &Path) -> PathBuf {
    let mut os: OsString = pool_path.as_os_str().to_os_string();
    os.push(".log");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::{Handle, MemRead, Pool, DATA_START, OFF_ALLOC_NEXT};
    use crate::error::Error;
    use std::fs;
    use std::path::PathBuf;

    fn pool_file(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("test.pool")
    }

    #[test]
    fn test_create_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = pool_file(&dir);
        {
            let pool = Pool::create(&path, 1 << 16).unwrap();
            assert_eq!(pool.capacity(), 1 << 16);
            assert!(pool.root(0).is_null());
        }
        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.capacity(), 1 << 16);
        assert_eq!(pool.read_u64(OFF_ALLOC_NEXT), DATA_START);
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = pool_file(&dir);
        Pool::create(&path, 1 << 16).unwrap();
        assert!(matches!(Pool::create(&path, 1 << 16), Err(Error::Io(_))));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = pool_file(&dir);
        fs::write(&path, vec![0xab; 8192]).unwrap();
        assert!(matches!(Pool::open(&path), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_alloc_free_recycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = Pool::create(pool_file(&dir), 1 << 16).unwrap();

        let mut tx = pool.begin();
        let a = tx.alloc(100).unwrap();
        let b = tx.alloc(100).unwrap();
        assert_ne!(a, b);
        tx.free(a);
        tx.commit().unwrap();

        let mut tx = pool.begin();
        let c = tx.alloc(80).unwrap();
        tx.commit().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_alloc_zeroed_recycled_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = Pool::create(pool_file(&dir), 1 << 16).unwrap();

        let mut tx = pool.begin();
        let a = tx.alloc(64).unwrap();
        for word in 0..8 {
            tx.write_u64(a.offset() + word * 8, 0xdead_beef_dead_beef);
        }
        tx.free(a);
        tx.commit().unwrap();

        let mut tx = pool.begin();
        let b = tx.alloc_zeroed(64).unwrap();
        tx.commit().unwrap();
        assert_eq!(b, a);
        for word in 0..8 {
            assert_eq!(pool.read_u64(b.offset() + word * 8), 0);
        }
    }

    #[test]
    fn test_alloc_exhaustion_aborts_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = Pool::create(pool_file(&dir), 1 << 16).unwrap();

        let mut tx = pool.begin();
        let err = tx.alloc(1 << 20).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        drop(tx);
        assert_eq!(pool.read_u64(OFF_ALLOC_NEXT), DATA_START);
    }

    #[test]
    fn test_roots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = pool_file(&dir);
        let handle;
        {
            let mut pool = Pool::create(&path, 1 << 16).unwrap();
            let mut tx = pool.begin();
            handle = tx.alloc(32).unwrap();
            tx.set_root(3, handle);
            tx.commit().unwrap();
        }
        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.root(3), handle);
        assert_eq!(pool.root(0), Handle::NULL);
    }
}
