//! The persistent object store.
//!
//! An [`ObjPool`] is a fixed-size heap of objects backed by a regular file.
//! The whole heap is kept in memory while the pool is open; every committed
//! mutation is written back to the file before the commit returns, so the
//! file always holds the state as of the last committed transaction. The
//! file system core above never touches the file itself, only this module's
//! interface:
//!
//!   + allocation and deallocation of raw chunks with a usable-size round-up,
//!   + typed persistent ids ([`Obj<T>`]) that survive pool reopen,
//!   + direct ("persist") writes for freshly allocated or unobservable bytes,
//!   + transactions with byte-range snapshotting and staged callbacks
//!     (see [`tx`]).
//!
//! Every chunk is prefixed by a small header carrying its usable size, an
//! allocated/free tag and a caller-chosen type number. Headers are written
//! through to the file the moment they change, under the allocator lock, so
//! the header chain in the file can always be walked; a chunk allocated by a
//! transaction that never commits is reported allocated by that walk until
//! it is reused, which trades a bounded leak for never corrupting the chain.

use std::alloc::{self, Layout};
use std::fs;
use std::marker::PhantomData;
use std::mem;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{self, AtomicU64};

use parking_lot::Mutex;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};

pub mod tx;

pub use tx::{Stage, Tx};

const POOL_MAGIC: u64 = 0x706d_6673_706f_6f6c; // "pmfspool"
const POOL_VERSION: u64 = 1;

/// In-memory alignment of the heap; keeps every chunk payload and the
/// embedded generation words naturally aligned.
const HEAP_ALIGN: usize = 4096;

/// First byte of the chunk area; everything below is the pool header page.
const DATA_START: u64 = 4096;

/// Chunk payload alignment.
const CHUNK_ALIGN: u64 = 16;

const TAG_ALLOCATED: u64 = 0xa11c;
const TAG_FREE: u64 = 0xf4ee;

/// Smallest payload worth splitting a free chunk for.
const MIN_SPLIT: u64 = 64;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct PoolHeader {
    magic: u64,
    version: u64,
    heap_len: u64,
    /// High-water mark of the bump allocator. Monotone; space below it is
    /// managed through the chunk headers.
    used_top: u64,
    root: u64,
    root_size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct ChunkHeader {
    /// Usable payload size, a multiple of `CHUNK_ALIGN`.
    size: u64,
    tag: u64,
    type_num: u64,
    _pad: u64,
}

const CHUNK_HDR: u64 = mem::size_of::<ChunkHeader>() as u64;
const_assert!(mem::size_of::<ChunkHeader>() % 16 == 0);
const_assert!(mem::size_of::<PoolHeader>() as u64 <= DATA_START);

/// Typed persistent id: the offset of a `T` inside the pool. Offset 0 is
/// reserved for "null".
// `fn() -> T` keeps `Obj` Send/Sync regardless of `T`; an id is just a
// number until it is resolved against a pool.
pub struct Obj<T> {
    off: u64,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls: derives would put a `T: Clone`/`T: Copy` bound on them.
impl<T> Clone for Obj<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Obj<T> {}

impl<T> PartialEq for Obj<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for Obj<T> {}

impl<T> Obj<T> {
    pub const NULL: Obj<T> = Obj {
        off: 0,
        _marker: PhantomData,
    };

    pub fn from_off(off: u64) -> Self {
        Obj {
            off,
            _marker: PhantomData,
        }
    }

    pub fn off(self) -> u64 {
        self.off
    }

    pub fn is_null(self) -> bool {
        self.off == 0
    }

    /// Offset of the field at byte offset `field` inside the pointed-to `T`.
    pub fn field_off(self, field: usize) -> u64 {
        debug_assert!(!self.is_null());
        debug_assert!(field < mem::size_of::<T>());
        self.off + field as u64
    }
}

impl<T> std::fmt::Debug for Obj<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Obj({:#x})", self.off)
    }
}

/// One live object reported by [`ObjPool::objects`].
#[derive(Debug, Clone, Copy)]
pub struct ObjInfo {
    pub off: u64,
    pub size: u64,
    pub type_num: u64,
}

pub struct ObjPool {
    file: fs::File,
    base: *mut u8,
    heap_len: usize,
    /// Serialises allocation, deallocation and the header write-through.
    alloc_lock: Mutex<()>,
    /// Number of free chunks below the high-water mark; lets allocation
    /// skip the first-fit scan entirely while nothing has been freed.
    free_chunks: AtomicU64,
}

// SAFETY: the heap is plain memory; all concurrent access to it is
// coordinated by the callers' locking discipline (file system level locks
// plus `alloc_lock` for the allocator metadata).
unsafe impl Send for ObjPool {}
unsafe impl Sync for ObjPool {}

impl Drop for ObjPool {
    fn drop(&mut self) {
        // No flush: everything committed has already been written through.
        // SAFETY: `base` was allocated in `alloc_heap` with this layout.
        unsafe {
            alloc::dealloc(
                self.base,
                Layout::from_size_align(self.heap_len, HEAP_ALIGN).unwrap(),
            );
        }
    }
}

fn alloc_heap(len: usize) -> Result<*mut u8> {
    let layout = Layout::from_size_align(len, HEAP_ALIGN).map_err(|_| Error::NoMem)?;
    // SAFETY: `len` is non-zero (checked by the callers against the minimum
    // pool size).
    let base = unsafe { alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return Err(Error::NoMem);
    }
    Ok(base)
}

impl ObjPool {
    /// Creates a new pool file of `poolsize` bytes with the given permission
    /// bits and formats an empty heap in it.
    pub fn create(path: &Path, poolsize: u64, mode: u32) -> Result<Self> {
        if poolsize < DATA_START + CHUNK_HDR + CHUNK_ALIGN {
            return Err(Error::Invalid);
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)?;
        file.set_len(poolsize)?;

        let pool = Self {
            file,
            base: alloc_heap(poolsize as usize)?,
            heap_len: poolsize as usize,
            alloc_lock: Mutex::new(()),
            free_chunks: AtomicU64::new(0),
        };
        let header = PoolHeader {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            heap_len: poolsize,
            used_top: DATA_START,
            root: 0,
            root_size: 0,
        };
        // SAFETY: aligned, in bounds, and nobody else sees the pool yet.
        unsafe { *(pool.base as *mut PoolHeader) = header };
        pool.persist(0, mem::size_of::<PoolHeader>());
        Ok(pool)
    }

    /// Opens an existing pool file and loads the whole heap into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < DATA_START as usize {
            return Err(Error::NoDevice);
        }
        let pool = Self {
            base: alloc_heap(len)?,
            file,
            heap_len: len,
            alloc_lock: Mutex::new(()),
            free_chunks: AtomicU64::new(0),
        };
        {
            // SAFETY: freshly allocated, exclusively owned.
            let heap = unsafe { std::slice::from_raw_parts_mut(pool.base, len) };
            pool.file.read_exact_at(heap, 0)?;
        }
        let header = pool.header();
        if header.magic != POOL_MAGIC
            || header.version != POOL_VERSION
            || header.heap_len != len as u64
        {
            return Err(Error::NoDevice);
        }

        // Count the holes the previous session left, so allocation knows
        // whether a first-fit scan can find anything.
        let mut free = 0;
        let mut off = DATA_START;
        while off < pool.header().used_top {
            // SAFETY: every chunk below used_top has a valid header.
            let hdr = unsafe { *(pool.ptr(off) as *const ChunkHeader) };
            if hdr.tag == TAG_FREE {
                free += 1;
            }
            off += CHUNK_HDR + hdr.size;
        }
        pool.free_chunks.store(free, atomic::Ordering::Relaxed);
        Ok(pool)
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: aligned; scalar fields are mutated only under `alloc_lock`.
        unsafe { &*(self.base as *const PoolHeader) }
    }

    fn header_mut(&self) -> *mut PoolHeader {
        self.base as *mut PoolHeader
    }

    /// Raw pointer to `off`. The offset must have come from this pool.
    pub(crate) fn ptr(&self, off: u64) -> *mut u8 {
        debug_assert!(off < self.heap_len as u64);
        // SAFETY: in bounds per the assertion.
        unsafe { self.base.add(off as usize) }
    }

    /// Typed raw pointer to the object.
    pub fn get_raw<T>(&self, obj: Obj<T>) -> *mut T {
        debug_assert!(!obj.is_null());
        debug_assert!(obj.off() + mem::size_of::<T>() as u64 <= self.heap_len as u64);
        self.ptr(obj.off()) as *mut T
    }

    /// Shared reference to the object.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no concurrent mutable access to the object,
    /// normally by holding the lock the file system associates with it.
    pub unsafe fn get<T>(&self, obj: Obj<T>) -> &T {
        &*self.get_raw(obj)
    }

    /// Exclusive reference to the object.
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access to the object for the
    /// lifetime of the returned reference.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, obj: Obj<T>) -> &mut T {
        &mut *self.get_raw(obj)
    }

    /// The u64 at `off` viewed as an atomic. `off` must be 8-aligned.
    pub fn atomic_u64(&self, off: u64) -> &AtomicU64 {
        debug_assert_eq!(off % 8, 0);
        // SAFETY: AtomicU64 has the same layout as u64 and the pointer is
        // properly aligned; atomics make the racy access well defined.
        unsafe { &*(self.ptr(off) as *const AtomicU64) }
    }

    /// Writes the in-memory range through to the backing file.
    pub fn persist(&self, off: u64, len: usize) {
        debug_assert!(off as usize + len <= self.heap_len);
        // SAFETY: the range is in bounds; concurrent writers to it are
        // excluded by the callers' locks.
        let src = unsafe { std::slice::from_raw_parts(self.ptr(off), len) };
        self.file
            .write_all_at(src, off)
            .expect("pool write-through failed");
    }

    /// Copies `src` into the heap at `off` and writes it through.
    pub fn memcpy_persist(&self, off: u64, src: &[u8]) {
        // SAFETY: in bounds; exclusivity provided by the caller's locks.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr(off), src.len()) };
        self.persist(off, src.len());
    }

    /// Fills `len` bytes at `off` with `val` and writes them through.
    pub fn memset_persist(&self, off: u64, val: u8, len: usize) {
        // SAFETY: in bounds; exclusivity provided by the caller's locks.
        unsafe { ptr::write_bytes(self.ptr(off), val, len) };
        self.persist(off, len);
    }

    /// Reads `len` bytes at `off` into `dst`.
    pub fn read_bytes(&self, off: u64, dst: &mut [u8]) {
        // SAFETY: in bounds; the caller's locks exclude concurrent writers.
        unsafe { ptr::copy_nonoverlapping(self.ptr(off), dst.as_mut_ptr(), dst.len()) };
    }

    fn chunk_header(&self, payload: u64) -> *mut ChunkHeader {
        self.ptr(payload - CHUNK_HDR) as *mut ChunkHeader
    }

    /// Usable size of the chunk holding `payload`, which may exceed what was
    /// requested at allocation.
    pub fn usable_size(&self, payload: u64) -> usize {
        // SAFETY: chunk headers are immutable except for the tag, which is
        // only flipped under `alloc_lock`.
        unsafe { (*self.chunk_header(payload)).size as usize }
    }

    fn write_chunk_header(&self, hdr_off: u64, hdr: ChunkHeader) {
        self.memcpy_persist(hdr_off, hdr.as_bytes());
    }

    /// Allocates `size` usable bytes tagged with `type_num`. Returns the
    /// payload offset. First fit over freed chunks, bump allocation above
    /// them.
    pub(crate) fn alloc_raw(&self, size: usize, type_num: u64) -> Result<u64> {
        let need = (size as u64).max(CHUNK_ALIGN).next_multiple_of(CHUNK_ALIGN);
        let _guard = self.alloc_lock.lock();

        // SAFETY: header fields are only mutated under `alloc_lock`.
        let header = unsafe { &mut *self.header_mut() };

        if self.free_chunks.load(atomic::Ordering::Relaxed) > 0 {
            let mut off = DATA_START;
            while off < header.used_top {
                // SAFETY: every chunk below used_top has a valid header.
                let hdr = unsafe { *(self.ptr(off) as *const ChunkHeader) };
                debug_assert!(hdr.tag == TAG_ALLOCATED || hdr.tag == TAG_FREE);
                if hdr.tag == TAG_FREE && hdr.size >= need {
                    let mut taken = hdr.size;
                    if hdr.size >= need + CHUNK_HDR + MIN_SPLIT {
                        // Split the tail off as a new free chunk.
                        taken = need;
                        self.write_chunk_header(
                            off + CHUNK_HDR + need,
                            ChunkHeader {
                                size: hdr.size - need - CHUNK_HDR,
                                tag: TAG_FREE,
                                type_num: 0,
                                _pad: 0,
                            },
                        );
                        self.free_chunks.fetch_add(1, atomic::Ordering::Relaxed);
                    }
                    self.write_chunk_header(
                        off,
                        ChunkHeader {
                            size: taken,
                            tag: TAG_ALLOCATED,
                            type_num,
                            _pad: 0,
                        },
                    );
                    self.free_chunks.fetch_sub(1, atomic::Ordering::Relaxed);
                    return Ok(off + CHUNK_HDR);
                }
                off += CHUNK_HDR + hdr.size;
            }
        }

        let chunk = header.used_top;
        if chunk + CHUNK_HDR + need > header.heap_len {
            return Err(Error::NoMem);
        }
        header.used_top = chunk + CHUNK_HDR + need;
        self.write_chunk_header(
            chunk,
            ChunkHeader {
                size: need,
                tag: TAG_ALLOCATED,
                type_num,
                _pad: 0,
            },
        );
        self.persist(0, mem::size_of::<PoolHeader>());
        Ok(chunk + CHUNK_HDR)
    }

    /// Returns the chunk holding `payload` to the allocator.
    pub(crate) fn free_raw(&self, payload: u64) {
        let _guard = self.alloc_lock.lock();
        let hdr_off = payload - CHUNK_HDR;
        // SAFETY: valid chunk header, mutated under `alloc_lock`.
        let hdr = unsafe { &mut *self.chunk_header(payload) };
        assert_eq!(hdr.tag, TAG_ALLOCATED, "double free at {:#x}", payload);
        hdr.tag = TAG_FREE;
        hdr.type_num = 0;
        self.persist(hdr_off, mem::size_of::<ChunkHeader>());
        self.free_chunks.fetch_add(1, atomic::Ordering::Relaxed);
    }

    /// The pool's root object, allocating it zeroed on first use.
    pub fn root<T>(&self, type_num: u64) -> Result<Obj<T>> {
        {
            let _guard = self.alloc_lock.lock();
            if self.header().root != 0 {
                return Ok(Obj::from_off(self.header().root));
            }
        }
        let payload = self.alloc_raw(mem::size_of::<T>(), type_num)?;
        self.memset_persist(payload, 0, mem::size_of::<T>());
        let _guard = self.alloc_lock.lock();
        // SAFETY: under `alloc_lock`.
        let header = unsafe { &mut *self.header_mut() };
        header.root = payload;
        header.root_size = mem::size_of::<T>() as u64;
        self.persist(0, mem::size_of::<PoolHeader>());
        Ok(Obj::from_off(payload))
    }

    /// Size recorded for the root object, 0 if none was allocated.
    pub fn root_size(&self) -> u64 {
        self.header().root_size
    }

    /// Walks the chunk headers and returns every live (allocated) object.
    pub fn objects(&self) -> Vec<ObjInfo> {
        let _guard = self.alloc_lock.lock();
        let mut out = Vec::new();
        let mut off = DATA_START;
        while off < self.header().used_top {
            // SAFETY: valid header chain below used_top.
            let hdr = unsafe { *(self.ptr(off) as *const ChunkHeader) };
            if hdr.tag == TAG_ALLOCATED {
                out.push(ObjInfo {
                    off: off + CHUNK_HDR,
                    size: hdr.size,
                    type_num: hdr.type_num,
                });
            }
            off += CHUNK_HDR + hdr.size;
        }
        out
    }

    /// Runs `body` inside a transaction. `Ok` commits, `Err` rolls every
    /// snapshotted range and every allocation back and re-raises the error.
    pub fn tx<R>(&self, body: impl FnOnce(&Tx<'_>) -> Result<R>) -> Result<R> {
        let tx = Tx::begin(self);
        match body(&tx) {
            Ok(r) => {
                tx.commit();
                Ok(r)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}
