//! Zero-copy objects: payload content shared between bundles by reference.
//!
//! A `Zco` is a sequence of segments, each a range of a reference-counted
//! extent. Extents hold their bytes in memory or in a spill file, and carry a
//! lease on ZCO space that is returned when the last segment referring to
//! them is dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use memmap2::Mmap;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    Heap,
    File,
}

// ── Space accounting ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Occupancy {
    heap: u64,
    file: u64,
}

#[derive(Debug)]
struct SpaceInner {
    heap_limit: u64,
    file_limit: u64,
    occupancy: Mutex<Occupancy>,
    freed: Notify,
}

/// ZCO space: heap and file occupancy against their ceilings.
#[derive(Debug, Clone)]
pub struct ZcoSpace {
    inner: Arc<SpaceInner>,
}

impl ZcoSpace {
    pub fn new(heap_limit: u64, file_limit: u64) -> Self {
        Self {
            inner: Arc::new(SpaceInner {
                heap_limit,
                file_limit,
                occupancy: Mutex::new(Occupancy::default()),
                freed: Notify::new(),
            }),
        }
    }

    fn limit(&self, residence: Residence) -> u64 {
        match residence {
            Residence::Heap => self.inner.heap_limit,
            Residence::File => self.inner.file_limit,
        }
    }

    pub fn occupancy(&self, residence: Residence) -> u64 {
        match self.inner.occupancy.lock() {
            Ok(o) => match residence {
                Residence::Heap => o.heap,
                Residence::File => o.file,
            },
            Err(_) => 0,
        }
    }

    /// Reserve `len` bytes now, or refuse.
    pub fn try_reserve(&self, residence: Residence, len: u64) -> Option<Lease> {
        let limit = self.limit(residence);
        let mut o = self.inner.occupancy.lock().ok()?;
        let used = match residence {
            Residence::Heap => &mut o.heap,
            Residence::File => &mut o.file,
        };
        if used.saturating_add(len) > limit {
            return None;
        }
        *used += len;
        Some(Lease { space: self.inner.clone(), residence, len })
    }

    /// Reserve `len` bytes, waiting for space to be released. Refuses only
    /// a request that could never fit.
    pub async fn reserve(&self, residence: Residence, len: u64) -> Option<Lease> {
        if len > self.limit(residence) {
            return None;
        }
        loop {
            let freed = self.inner.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if let Some(lease) = self.try_reserve(residence, len) {
                return Some(lease);
            }
            freed.await;
        }
    }
}

/// Space held on behalf of an extent.
#[derive(Debug)]
pub struct Lease {
    space: Arc<SpaceInner>,
    residence: Residence,
    len: u64,
}

impl Lease {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Ok(mut o) = self.space.occupancy.lock() {
            match self.residence {
                Residence::Heap => o.heap = o.heap.saturating_sub(self.len),
                Residence::File => o.file = o.file.saturating_sub(self.len),
            }
        }
        self.space.freed.notify_waiters();
    }
}

// ── Spill files ──────────────────────────────────────────────────────────────

/// A file holding acquired bytes that did not fit the heap threshold.
/// Removed when the last extent referring to it is gone.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    len: u64,
}

impl SpillFile {
    pub fn create(dir: &Path, name: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        File::create(&path)?;
        Ok(Self { path, len: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes, returning the offset they were written at.
    pub fn append(&mut self, data: &[u8]) -> std::io::Result<u64> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(data)?;
        let at = self.len;
        self.len += data.len() as u64;
        Ok(at)
    }

    fn read(&self, offset: u64, len: u64) -> std::io::Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let file = File::open(&self.path)?;
        // Safety: the file is only appended to before any extent refers to
        // it, and never truncated while mapped.
        let map = unsafe { Mmap::map(&file)? };
        let start = offset as usize;
        let end = start + len as usize;
        let range = map.get(start..end).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "spill file shorter than extent")
        })?;
        Ok(Bytes::copy_from_slice(range))
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ── Content ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Source {
    Heap(Bytes),
    File { file: Arc<SpillFile>, offset: u64 },
}

#[derive(Debug)]
struct Extent {
    source: Source,
    _lease: Option<Lease>,
}

#[derive(Debug, Clone)]
struct Segment {
    extent: Arc<Extent>,
    start: u64,
    len: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Zco {
    segments: Vec<Segment>,
    length: u64,
}

impl Zco {
    /// Content held in memory, charged to `lease` if one is given.
    pub fn from_heap(bytes: Bytes, lease: Option<Lease>) -> Self {
        let mut zco = Zco::default();
        zco.push_heap(bytes, lease);
        zco
    }

    pub fn push_heap(&mut self, bytes: Bytes, lease: Option<Lease>) {
        let len = bytes.len() as u64;
        self.push(Extent { source: Source::Heap(bytes), _lease: lease }, len);
    }

    pub fn push_file(&mut self, file: Arc<SpillFile>, offset: u64, len: u64, lease: Option<Lease>) {
        self.push(Extent { source: Source::File { file, offset }, _lease: lease }, len);
    }

    fn push(&mut self, extent: Extent, len: u64) {
        if len == 0 {
            return;
        }
        self.segments.push(Segment { extent: Arc::new(extent), start: 0, len });
        self.length += len;
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// A new handle to `len` bytes starting at `offset`, sharing storage.
    pub fn clone_range(&self, offset: u64, len: u64) -> Option<Zco> {
        if offset.checked_add(len)? > self.length {
            return None;
        }
        let mut out = Zco::default();
        let mut skip = offset;
        let mut want = len;
        for seg in &self.segments {
            if want == 0 {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let take = (seg.len - skip).min(want);
            out.segments.push(Segment {
                extent: seg.extent.clone(),
                start: seg.start + skip,
                len: take,
            });
            out.length += take;
            want -= take;
            skip = 0;
        }
        Some(out)
    }

    /// Append another object's content, sharing storage.
    pub fn append(&mut self, other: &Zco) {
        self.segments.extend(other.segments.iter().cloned());
        self.length += other.length;
    }

    /// Materialize the content.
    pub fn read(&self) -> std::io::Result<Bytes> {
        if let [seg] = self.segments.as_slice() {
            if let Source::Heap(bytes) = &seg.extent.source {
                return Ok(bytes.slice(seg.start as usize..(seg.start + seg.len) as usize));
            }
        }
        let mut out = BytesMut::with_capacity(self.length as usize);
        for seg in &self.segments {
            match &seg.extent.source {
                Source::Heap(bytes) => {
                    out.extend_from_slice(&bytes[seg.start as usize..(seg.start + seg.len) as usize])
                }
                Source::File { file, offset } => {
                    out.extend_from_slice(&file.read(offset + seg.start, seg.len)?)
                }
            }
        }
        Ok(out.freeze())
    }
}
