//! Read-only access to BoltDB files.
//!
//! Only what is needed to pull bucket metadata out of a 2.0.x KV snapshot is
//! supported: open the newest valid meta page, walk B+tree pages and read
//! leaf key/value pairs. Every offset read from the file is bounds-checked
//! so a corrupt file yields an error instead of a panic.

use crate::utils::{BackupError, Result};
use memmap2::Mmap;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

const MAGIC: u32 = 0xED0C_DAED;
const VERSION: u32 = 2;

const PAGE_HEADER_SIZE: usize = 16;
const ELEMENT_SIZE: usize = 16;
const BUCKET_HEADER_SIZE: usize = 16;
/// Bytes of the meta struct covered by its checksum.
const META_CHECKSUM_OFFSET: usize = 56;
const META_SIZE: usize = 64;
const DEFAULT_PAGE_SIZE: usize = 4096;

const BRANCH_PAGE_FLAG: u16 = 0x01;
const LEAF_PAGE_FLAG: u16 = 0x02;
const META_PAGE_FLAG: u16 = 0x04;
const BUCKET_LEAF_FLAG: u32 = 0x01;

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_TREE_DEPTH: usize = 64;

fn corrupt(msg: impl Into<String>) -> BackupError {
    BackupError::KvStore(msg.into())
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    buf.get(off..off + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or_else(|| corrupt(format!("read past end of page at offset {}", off)))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    buf.get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| corrupt(format!("read past end of page at offset {}", off)))
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    buf.get(off..off + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| corrupt(format!("read past end of page at offset {}", off)))
}

fn slice_at(buf: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    start
        .checked_add(len)
        .and_then(|end| buf.get(start..end))
        .ok_or_else(|| corrupt(format!("element at offset {} overruns its page", start)))
}

/// 64-bit FNV-1a, the checksum bolt stores in meta pages.
pub(crate) fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    page_size: usize,
    root: u64,
    txid: u64,
}

impl Meta {
    /// Parse and validate the meta page starting at `page`.
    fn parse(page: &[u8]) -> Result<Self> {
        let flags = read_u16(page, 8)?;
        if flags & META_PAGE_FLAG == 0 {
            return Err(corrupt(format!("invalid meta page flags {:#x}", flags)));
        }

        let meta = slice_at(page, PAGE_HEADER_SIZE, META_SIZE)?;
        if read_u32(meta, 0)? != MAGIC {
            return Err(corrupt("invalid database magic"));
        }
        let version = read_u32(meta, 4)?;
        if version != VERSION {
            return Err(corrupt(format!("unsupported database version {}", version)));
        }
        if read_u64(meta, META_CHECKSUM_OFFSET)? != fnv1a64(&meta[..META_CHECKSUM_OFFSET]) {
            return Err(corrupt("meta page checksum mismatch"));
        }

        Ok(Meta {
            page_size: read_u32(meta, 8)? as usize,
            root: read_u64(meta, 16)?,
            txid: read_u64(meta, 48)?,
        })
    }
}

/// Where a bucket's B+tree starts.
#[derive(Debug, Clone, Copy)]
enum BucketRoot<'a> {
    Page(u64),
    /// Small buckets are stored inline, right after their header in the parent's value.
    Inline(&'a [u8]),
}

/// One key/value pair from a leaf page.
#[derive(Debug, Clone, Copy)]
pub struct LeafEntry<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub is_bucket: bool,
}

/// An open, read-only, memory-mapped BoltDB file.
///
/// Holds a shared advisory lock on the file until dropped.
pub struct BoltDb {
    mmap: Mmap,
    meta: Meta,
    _lock: Flock<File>,
}

impl BoltDb {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BackupError::file(path, e))?;
        let lock = lock_shared(file, path)?;

        let len = lock
            .metadata()
            .map_err(|e| BackupError::file(path, e))?
            .len();
        if len < (PAGE_HEADER_SIZE + META_SIZE) as u64 {
            return Err(corrupt(format!(
                "file size too small to be a bolt database: {:?} is {} bytes",
                path, len
            )));
        }

        // SAFETY: the file is opened read-only and held under a shared lock
        // for the lifetime of the map.
        let mmap = unsafe { Mmap::map(&*lock) }.map_err(|e| {
            if e.raw_os_error() == Some(Errno::EINVAL as i32) {
                BackupError::KvStore(format!(
                    "unable to open boltdb: mmap of {:?} may not support the MAP_SHARED option",
                    path
                ))
            } else {
                BackupError::KvStore(format!("unable to open boltdb: {}", e))
            }
        })?;

        let meta = select_meta(&mmap)?;
        debug!(
            "Opened bolt database {:?} (page size {}, txid {})",
            path, meta.page_size, meta.txid
        );

        Ok(Self {
            mmap,
            meta,
            _lock: lock,
        })
    }

    /// Look up a top-level bucket by name.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        self.root_bucket().bucket(name)
    }

    fn root_bucket(&self) -> Bucket<'_> {
        Bucket {
            db: self,
            root: BucketRoot::Page(self.meta.root),
        }
    }

    /// The bytes of page `id`, including any overflow pages.
    fn page(&self, id: u64) -> Result<&[u8]> {
        let page_size = self.meta.page_size;
        let start = usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_mul(page_size))
            .ok_or_else(|| corrupt(format!("page id {} out of range", id)))?;
        let header = slice_at(&self.mmap, start, PAGE_HEADER_SIZE)?;
        let overflow = read_u32(header, 12)? as usize;
        let len = overflow
            .checked_add(1)
            .and_then(|n| n.checked_mul(page_size))
            .ok_or_else(|| corrupt(format!("page {} overflow out of range", id)))?;
        slice_at(&self.mmap, start, len)
            .map_err(|_| corrupt(format!("page {} extends past end of file", id)))
    }
}

fn lock_shared(mut file: File, path: &Path) -> Result<Flock<File>> {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match Flock::lock(file, FlockArg::LockSharedNonblock) {
            Ok(lock) => return Ok(lock),
            Err((returned, errno)) if errno == Errno::EWOULDBLOCK => {
                if Instant::now() >= deadline {
                    return Err(BackupError::KvStore(format!(
                        "unable to open boltdb: timed out waiting for lock on {:?}",
                        path
                    )));
                }
                file = returned;
                std::thread::sleep(LOCK_POLL_INTERVAL);
            }
            Err((_, errno)) => {
                return Err(BackupError::KvStore(format!(
                    "unable to open boltdb: failed to lock {:?}: {}",
                    path, errno
                )));
            }
        }
    }
}

fn select_meta(data: &[u8]) -> Result<Meta> {
    let meta0 = Meta::parse(data);
    let page_size = match &meta0 {
        Ok(m) => m.page_size,
        Err(_) => DEFAULT_PAGE_SIZE,
    };
    let meta1 = data
        .get(page_size..)
        .ok_or_else(|| corrupt("file too small to hold the second meta page"))
        .and_then(Meta::parse);

    let meta = match (meta0, meta1) {
        (Ok(a), Ok(b)) => {
            if b.txid > a.txid {
                b
            } else {
                a
            }
        }
        (Ok(a), Err(_)) => a,
        (Err(_), Ok(b)) => b,
        (Err(e), Err(_)) => return Err(e),
    };

    if meta.page_size < PAGE_HEADER_SIZE + META_SIZE {
        return Err(corrupt(format!("invalid page size {}", meta.page_size)));
    }
    Ok(meta)
}

/// A bucket inside an open database.
#[derive(Clone, Copy)]
pub struct Bucket<'a> {
    db: &'a BoltDb,
    root: BucketRoot<'a>,
}

impl<'a> Bucket<'a> {
    /// All leaf entries in key order, including nested bucket headers.
    pub fn entries(&self) -> Result<Vec<LeafEntry<'a>>> {
        let mut out = Vec::new();
        match self.root {
            BucketRoot::Page(id) => self.collect_page(id, 0, &mut out)?,
            BucketRoot::Inline(page) => collect_leaf(page, &mut out)?,
        }
        Ok(out)
    }

    /// Visit every plain key/value pair, skipping nested buckets.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&'a [u8], &'a [u8]) -> Result<()>,
    {
        for entry in self.entries()? {
            if !entry.is_bucket {
                f(entry.key, entry.value)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| !e.is_bucket && e.key == key)
            .map(|e| e.value))
    }

    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'a>>> {
        let Some(entry) = self
            .entries()?
            .into_iter()
            .find(|e| e.is_bucket && e.key == name)
        else {
            return Ok(None);
        };

        let root = read_u64(entry.value, 0)?;
        let root = if root == 0 {
            BucketRoot::Inline(slice_at(
                entry.value,
                BUCKET_HEADER_SIZE,
                entry.value.len().saturating_sub(BUCKET_HEADER_SIZE),
            )?)
        } else {
            BucketRoot::Page(root)
        };

        Ok(Some(Bucket { db: self.db, root }))
    }

    fn collect_page(&self, id: u64, depth: usize, out: &mut Vec<LeafEntry<'a>>) -> Result<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(corrupt(format!("tree deeper than {} levels at page {}", MAX_TREE_DEPTH, id)));
        }

        let page = self.db.page(id)?;
        let flags = read_u16(page, 8)?;
        if flags & LEAF_PAGE_FLAG != 0 {
            return collect_leaf(page, out);
        }
        if flags & BRANCH_PAGE_FLAG == 0 {
            return Err(corrupt(format!("page {} has unexpected flags {:#x}", id, flags)));
        }

        let count = read_u16(page, 10)? as usize;
        for i in 0..count {
            let elem = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
            let child = read_u64(page, elem + 8)?;
            self.collect_page(child, depth + 1, out)?;
        }
        Ok(())
    }
}

fn collect_leaf<'a>(page: &'a [u8], out: &mut Vec<LeafEntry<'a>>) -> Result<()> {
    let flags = read_u16(page, 8)?;
    if flags & LEAF_PAGE_FLAG == 0 {
        return Err(corrupt(format!("expected leaf page, found flags {:#x}", flags)));
    }

    let count = read_u16(page, 10)? as usize;
    for i in 0..count {
        let elem = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
        let elem_flags = read_u32(page, elem)?;
        let pos = read_u32(page, elem + 4)? as usize;
        let ksize = read_u32(page, elem + 8)? as usize;
        let vsize = read_u32(page, elem + 12)? as usize;

        let key_start = elem + pos;
        let key = slice_at(page, key_start, ksize)?;
        let value = slice_at(page, key_start + ksize, vsize)?;
        out.push(LeafEntry {
            key,
            value,
            is_bucket: elem_flags & BUCKET_LEAF_FLAG != 0,
        });
    }
    Ok(())
}
