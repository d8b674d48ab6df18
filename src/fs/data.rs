//! File data: the block engine behind read, write and seek.
//!
//! A regular file's bytes live in a chain of block arrays, each holding up
//! to `MAX_NUM_BLOCKS` blocks of heterogeneous sizes picked by the length
//! of the write that first touched them. Every handle keeps a position
//! cache, the last `(block array, block, offset within block)` it stood
//! at, so sequential access never rescans the chain. Two optional
//! accelerators sit on top:
//!
//!   + an offset index mapping each block's starting file offset to its
//!     location, for O(log n) jumps ("greatest entry ≤ target"),
//!   + a list skip that hops over completely full arrays in O(1).
//!
//! The write path walks the cache to the handle's offset, zero-filling any
//! gap it crosses, then copies. Whether overwritten bytes are snapshotted
//! for rollback is a configuration choice (`track_data`), as is replacing
//! a fully overwritten block's storage instead of snapshotting it
//! (`replace_blocks`). The read path is the same walk, never mutating
//! media and stopping at the used edge. The handle's offset only advances
//! once a write's transaction commits; an abort restores the cache
//! verbatim.

use std::collections::BTreeMap;
use std::mem;

use scopeguard::defer;

use crate::error::{fail, Error, Result};
use crate::fs::file::File;
use crate::fs::layout::{Block, BlockArray, Inode, TYPE_BLOCK_ARRAY, TYPE_DATA};
use crate::fs::FilePool;
use crate::obj::{Obj, Tx};
use crate::param::MAX_NUM_BLOCKS;

/// Seek origins accepted by [`FilePool::lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Position cache: where in the block chain the handle last stood.
/// `global_off - block_off` is the current block's starting file offset.
#[derive(Clone, Copy)]
pub(crate) struct Pos {
    pub arr: Obj<BlockArray>,
    pub block_id: usize,
    pub block_off: u64,
    pub global_off: u64,
}

impl Pos {
    pub(crate) const UNSET: Pos = Pos {
        arr: Obj::NULL,
        block_id: 0,
        block_off: 0,
        global_off: 0,
    };
}

/// Offset-index payload: which array and slot a block lives in.
#[derive(Clone, Copy)]
pub(crate) struct BlockLoc {
    arr: Obj<BlockArray>,
    block_id: usize,
}

/// Volatile per-handle state, guarded by the handle lock.
pub(crate) struct FileState {
    pub offset: u64,
    pub pos: Pos,
    pub index: Option<BTreeMap<u64, BlockLoc>>,
}

impl FileState {
    pub(crate) fn new() -> Self {
        Self {
            offset: 0,
            pos: Pos::UNSET,
            index: None,
        }
    }
}

fn block_pool_off(pos: &Pos) -> u64 {
    pos.arr.field_off(mem::offset_of!(BlockArray, blocks))
        + (pos.block_id * mem::size_of::<Block>()) as u64
}

/// Raw pointer to the cached block. All block access in this module runs
/// with the inode locked (shared for reads, exclusive for writes), which is
/// what makes these derefs sound.
fn block_ptr(pool: &FilePool, pos: &Pos) -> *mut Block {
    pool.obj().ptr(block_pool_off(pos)) as *mut Block
}

fn insert_block_to_index(state: &mut FileState, arr: Obj<BlockArray>, block_id: usize, off: u64) {
    if let Some(index) = state.index.as_mut() {
        index.insert(off, BlockLoc { arr, block_id });
    }
}

/// Builds the offset index by walking the whole chain. Run lazily on the
/// first read or write after open.
fn rebuild_index(pool: &FilePool, state: &mut FileState, inode: Obj<Inode>) {
    let mut index = BTreeMap::new();
    // SAFETY: inode locked by the caller.
    let mut arr = unsafe { pool.obj().get(inode) }.data.blocks();
    let mut off = 0u64;
    while !arr.is_null() {
        // SAFETY: as above.
        let node = unsafe { pool.obj().get(arr) };
        for (id, block) in node.blocks[..node.blocks_allocated as usize].iter().enumerate() {
            index.insert(off, BlockLoc { arr, block_id: id });
            off += block.allocated;
        }
        arr = node.next;
    }
    state.index = Some(index);
}

/// Points the cache at the start of the file, allocating the first block
/// array when a transaction is at hand.
fn reset_cache(
    pool: &FilePool,
    tx: Option<&Tx<'_>>,
    state: &mut FileState,
    inode: Obj<Inode>,
) -> Result<()> {
    // SAFETY: inode locked by the caller.
    let mut arr = unsafe { pool.obj().get(inode) }.data.blocks();
    if arr.is_null() {
        if let Some(tx) = tx {
            let fresh: Obj<BlockArray> = tx.zalloc(TYPE_BLOCK_ARRAY)?;
            tx.add_field(inode, mem::offset_of!(Inode, data), mem::size_of::<u64>());
            // SAFETY: inode write-locked on every allocating path.
            unsafe { (*pool.obj().get_raw(inode)).data.set_blocks(fresh) };
            arr = fresh;
        }
    }
    state.pos = Pos {
        arr,
        block_id: 0,
        block_off: 0,
        global_off: 0,
    };
    Ok(())
}

/// Gives the cached block its storage, sized by the write length that got
/// here first.
fn allocate_block(
    pool: &FilePool,
    tx: &Tx<'_>,
    state: &mut FileState,
    count: usize,
) -> Result<()> {
    let size = pool.cfg().block_size_for(count);

    tx.add_range(block_pool_off(&state.pos), mem::size_of::<Block>());
    let (data, usable) = tx.alloc_data(size, TYPE_DATA)?;
    // SAFETY: inode write-locked; snapshotted above.
    unsafe {
        let block = block_ptr(pool, &state.pos);
        (*block).used = 0;
        (*block).data = data;
        (*block).allocated = usable as u64;
    }

    let arr = state.pos.arr;
    tx.add_field(arr, mem::offset_of!(BlockArray, bytes_allocated), mem::size_of::<u64>());
    tx.add_field(arr, mem::offset_of!(BlockArray, blocks_allocated), mem::size_of::<u32>());
    // SAFETY: as above.
    unsafe {
        (*pool.obj().get_raw(arr)).bytes_allocated += usable as u64;
        (*pool.obj().get_raw(arr)).blocks_allocated += 1;
    }

    insert_block_to_index(state, arr, state.pos.block_id, state.pos.global_off);
    Ok(())
}

/// Accounts `len` more bytes of user data in the cached block.
fn extend_block_meta_data(
    pool: &FilePool,
    tx: &Tx<'_>,
    state: &FileState,
    inode: Obj<Inode>,
    len: u64,
) {
    tx.add_range(
        block_pool_off(&state.pos) + mem::offset_of!(Block, used) as u64,
        mem::size_of::<u64>(),
    );
    let arr = state.pos.arr;
    tx.add_field(arr, mem::offset_of!(BlockArray, bytes_used), mem::size_of::<u64>());
    tx.add_field(inode, mem::offset_of!(Inode, size), mem::size_of::<u64>());
    // SAFETY: inode write-locked; all three ranges snapshotted.
    unsafe {
        (*block_ptr(pool, &state.pos)).used += len;
        (*pool.obj().get_raw(arr)).bytes_used += len;
        (*pool.obj().get_raw(inode)).size += len;
    }
}

/// Zeroes `len` bytes past the cached block's used edge and accounts them.
/// The zeroes go straight to media; there is no user-visible data at that
/// address, so no pre-image is kept.
fn zero_extend_block(
    pool: &FilePool,
    tx: &Tx<'_>,
    state: &FileState,
    inode: Obj<Inode>,
    len: u64,
) {
    // SAFETY: inode write-locked.
    let (data, used) = unsafe {
        let block = block_ptr(pool, &state.pos);
        ((*block).data, (*block).used)
    };
    pool.obj().memset_persist(data + used, 0, len as usize);
    extend_block_meta_data(pool, tx, state, inode, len);
}

/// Moves the cache to the next array in the chain, growing the chain when a
/// transaction is at hand. Returns false at the end of the chain otherwise.
fn next_block_array(
    pool: &FilePool,
    tx: Option<&Tx<'_>>,
    state: &mut FileState,
) -> Result<bool> {
    let arr = state.pos.arr;
    // SAFETY: inode locked by the caller.
    let mut next = unsafe { pool.obj().get(arr) }.next;
    if next.is_null() {
        let Some(tx) = tx else { return Ok(false) };
        let fresh: Obj<BlockArray> = tx.zalloc(TYPE_BLOCK_ARRAY)?;
        tx.add_field(arr, mem::offset_of!(BlockArray, next), mem::size_of::<u64>());
        // SAFETY: inode write-locked; snapshotted above.
        unsafe { (*pool.obj().get_raw(arr)).next = fresh };
        next = fresh;
    }

    state.pos.arr = next;
    state.pos.block_id = 0;
    state.pos.block_off = 0;
    Ok(true)
}

/// Moves the position cache forward within the cached block, zero-extending
/// the unused tail on the allocating path. Returns how many bytes it moved.
fn move_within_block(
    pool: &FilePool,
    tx: Option<&Tx<'_>>,
    state: &mut FileState,
    inode: Obj<Inode>,
    offset_left: u64,
) -> Result<u64> {
    // SAFETY: inode locked by the caller; re-read after any mutation.
    let read_block = |pool: &FilePool, pos: &Pos| unsafe { *block_ptr(pool, pos) };

    let mut block = read_block(pool, &state.pos);
    if block.allocated == 0 {
        let Some(tx) = tx else { return Ok(0) };
        allocate_block(pool, tx, state, offset_left as usize)?;
        block = read_block(pool, &state.pos);
    }

    // Does the anticipated position land inside this block?
    if state.pos.block_off + offset_left < block.allocated {
        // Between the used edge and the end of the block?
        if state.pos.block_off + offset_left > block.used {
            let Some(tx) = tx else { return Ok(0) };
            zero_extend_block(
                pool,
                tx,
                state,
                inode,
                state.pos.block_off + offset_left - block.used,
            );
            block = read_block(pool, &state.pos);
            assert!(block.used <= block.allocated);
        }
        state.pos.block_off += offset_left;
        state.pos.global_off += offset_left;
        debug_assert_eq!(state.pos.global_off, state.offset);
        return Ok(offset_left);
    }

    // The target lies in a later block.
    if block.used == block.allocated {
        // Nothing left to zero; step off the end of this block.
        let skipped = block.used - state.pos.block_off;
        state.pos.global_off += skipped;
        return Ok(skipped);
    }

    let Some(tx) = tx else { return Ok(0) };

    // Zero the remaining tail so the next block starts on a clean edge.
    let len = block.allocated - block.used;
    zero_extend_block(pool, tx, state, inode, len);
    state.pos.block_off += len;
    state.pos.global_off += len;
    debug_assert_eq!(read_block(pool, &state.pos).used, block.allocated);
    Ok(len)
}

/// Copies the front of `src` into the cached block. Returns the bytes
/// written.
fn write_within_block(
    pool: &FilePool,
    tx: &Tx<'_>,
    state: &mut FileState,
    inode: Obj<Inode>,
    src: &[u8],
) -> Result<usize> {
    // SAFETY: inode write-locked.
    let read_block = |pool: &FilePool, pos: &Pos| unsafe { *block_ptr(pool, pos) };

    let mut block = read_block(pool, &state.pos);
    if block.allocated == 0 {
        allocate_block(pool, tx, state, src.len())?;
        block = read_block(pool, &state.pos);
    }

    let len = ((block.allocated - state.pos.block_off) as usize).min(src.len());

    // Only bytes below the used edge carry data worth restoring on abort;
    // whether they are restored at all is the track_data policy.
    if pool.cfg().track_data && state.pos.block_off < block.used {
        let slen = len.min((block.used - state.pos.block_off) as usize);
        if pool.cfg().replace_blocks && slen as u64 == block.allocated {
            tx.add_range(block_pool_off(&state.pos), mem::size_of::<Block>());
            tx.free_at(block.data);
            let (data, _usable) = tx.alloc_data(slen, TYPE_DATA)?;
            // SAFETY: write-locked; block snapshotted above.
            unsafe { (*block_ptr(pool, &state.pos)).data = data };
            block.data = data;
        } else {
            tx.add_range(block.data + state.pos.block_off, slen);
        }
    }

    pool.obj()
        .memcpy_persist(block.data + state.pos.block_off, &src[..len]);

    if state.pos.block_off + len as u64 > block.used {
        let new_used = state.pos.block_off + len as u64 - block.used;
        extend_block_meta_data(pool, tx, state, inode, new_used);
    }
    debug_assert!({
        let b = read_block(pool, &state.pos);
        b.used <= b.allocated
    });

    state.pos.block_off += len as u64;
    state.pos.global_off += len as u64;
    Ok(len)
}

/// Copies from the cached block into the front of `dst`. Returns the bytes
/// read; 0 at the used edge.
fn read_from_block(pool: &FilePool, state: &mut FileState, dst: &mut [u8]) -> usize {
    // SAFETY: inode read-locked.
    let block = unsafe { *block_ptr(pool, &state.pos) };
    if block.allocated == 0 {
        return 0;
    }

    let len = (block.used.saturating_sub(state.pos.block_off) as usize).min(dst.len());
    pool.obj()
        .read_bytes(block.data + state.pos.block_off, &mut dst[..len]);

    state.pos.block_off += len as u64;
    state.pos.global_off += len as u64;
    len
}

/// Skips whole arrays in O(1) where the accounting proves them fully used.
/// Only legal from the start of an array. Returns the bytes skipped.
fn skip_array_entry(
    pool: &FilePool,
    tx: Option<&Tx<'_>>,
    state: &mut FileState,
    offset_left: u64,
) -> Result<u64> {
    if state.pos.block_id > 0 || state.pos.block_off > 0 {
        return Ok(0);
    }

    let mut skipped = 0;
    let mut left = offset_left;
    loop {
        // SAFETY: inode locked by the caller.
        let cur = unsafe { pool.obj().get(state.pos.arr) };
        let full = cur.bytes_allocated == cur.bytes_used
            && cur.blocks_allocated == MAX_NUM_BLOCKS as u32;
        if !(left > 0 && left >= cur.bytes_used && full) {
            break;
        }
        let step = cur.bytes_used;
        if !next_block_array(pool, tx, state)? {
            break;
        }
        skipped += step;
        left -= step;
        state.pos.global_off += step;
    }
    Ok(skipped)
}

/// Reconciles the cache with the handle offset for a read. Returns false
/// when the offset cannot be reached without mutating media.
fn sync_off(pool: &FilePool, state: &mut FileState, inode: Obj<Inode>) -> Result<bool> {
    if pool.cfg().tree_walk {
        let block_start = state.pos.global_off - state.pos.block_off;
        let off = state.offset;
        // SAFETY: inode read-locked.
        let allocated = unsafe { (*block_ptr(pool, &state.pos)).allocated };
        if off < block_start || off >= block_start + allocated {
            let Some((&start, loc)) = state
                .index
                .as_ref()
                .and_then(|index| index.range(..=off).next_back())
            else {
                return Ok(false);
            };
            let loc = *loc;
            state.pos = Pos {
                arr: loc.arr,
                block_id: loc.block_id,
                block_off: 0,
                global_off: start,
            };
        }
    }

    if state.offset < state.pos.global_off {
        if state.offset >= state.pos.global_off - state.pos.block_off {
            state.pos.global_off -= state.pos.block_off;
            state.pos.block_off = 0;
        } else {
            reset_cache(pool, None, state, inode)?;
            if state.pos.arr.is_null() {
                return Ok(false);
            }
        }
    }

    let offset_left = state.offset - state.pos.global_off;
    if offset_left > 0 && pool.cfg().list_walk {
        skip_array_entry(pool, None, state, offset_left)?;
    }
    Ok(true)
}

/// The in-transaction body of a write: position the cache at the handle
/// offset, extending and zero-filling as needed, then spill `buf` across
/// blocks.
fn write_locked(
    pool: &FilePool,
    tx: &Tx<'_>,
    state: &mut FileState,
    inode: Obj<Inode>,
    buf: &[u8],
) -> Result<()> {
    if state.pos.arr.is_null() {
        reset_cache(pool, Some(tx), state, inode)?;
    }

    if pool.cfg().tree_walk && state.offset != state.pos.global_off {
        let block_start = state.pos.global_off - state.pos.block_off;
        let off = state.offset;
        // SAFETY: inode write-locked.
        let allocated = unsafe { (*block_ptr(pool, &state.pos)).allocated };
        if off < block_start || off >= block_start + allocated {
            if let Some((&start, loc)) = state
                .index
                .as_ref()
                .and_then(|index| index.range(..=off).next_back())
            {
                let loc = *loc;
                state.pos = Pos {
                    arr: loc.arr,
                    block_id: loc.block_id,
                    block_off: 0,
                    global_off: start,
                };
            }
        }
    }

    if state.offset < state.pos.global_off {
        if state.offset >= state.pos.global_off - state.pos.block_off {
            state.pos.global_off -= state.pos.block_off;
            state.pos.block_off = 0;
        } else {
            reset_cache(pool, Some(tx), state, inode)?;
        }
    }

    let mut offset_left = state.offset - state.pos.global_off;

    // Walk to the target, possibly extending and zeroing unused space.
    if pool.cfg().list_walk {
        offset_left -= skip_array_entry(pool, Some(tx), state, offset_left)?;
    }
    while offset_left > 0 {
        let moved = move_within_block(pool, Some(tx), state, inode, offset_left)?;
        assert!(moved <= offset_left);
        offset_left -= moved;

        if offset_left > 0 {
            state.pos.block_id += 1;
            state.pos.block_off = 0;
            if state.pos.block_id == MAX_NUM_BLOCKS {
                next_block_array(pool, Some(tx), state)?;
                if pool.cfg().list_walk {
                    offset_left -= skip_array_entry(pool, Some(tx), state, offset_left)?;
                }
            }
        }
    }

    // The cache now matches the handle offset; write from there.
    let mut written_total = 0;
    while written_total < buf.len() {
        let written = write_within_block(pool, tx, state, inode, &buf[written_total..])?;
        written_total += written;

        if written_total < buf.len() {
            state.pos.block_id += 1;
            state.pos.block_off = 0;
            if state.pos.block_id == MAX_NUM_BLOCKS {
                next_block_array(pool, Some(tx), state)?;
            }
        }
    }
    Ok(())
}

/// The locked body of a read; never mutates media. Returns the bytes read.
fn read_locked(pool: &FilePool, state: &mut FileState, inode: Obj<Inode>, buf: &mut [u8]) -> usize {
    if state.pos.arr.is_null() {
        reset_cache(pool, None, state, inode).expect("no allocation on the read path");
        if state.pos.arr.is_null() {
            return 0;
        }
    }

    if state.offset != state.pos.global_off
        && !sync_off(pool, state, inode).expect("no allocation on the read path")
    {
        return 0;
    }

    // SAFETY: inode read-locked.
    let read_block = |pool: &FilePool, pos: &Pos| unsafe { *block_ptr(pool, pos) };

    let mut offset_left = state.offset - state.pos.global_off;
    while offset_left > 0 {
        let moved = move_within_block(pool, None, state, inode, offset_left)
            .expect("no allocation on the read path");
        if moved == 0 {
            let block = read_block(pool, &state.pos);
            let block_boundary = block.allocated > 0
                && block.used == block.allocated
                && block.used == state.pos.block_off;
            if !block_boundary {
                return 0;
            }
        }
        assert!(moved <= offset_left);
        offset_left -= moved;

        if offset_left > 0 {
            let block = read_block(pool, &state.pos);
            if block.used != block.allocated {
                // Sparse edge short of the target: EOF.
                return 0;
            }
            state.pos.block_id += 1;
            state.pos.block_off = 0;
            if state.pos.block_id == MAX_NUM_BLOCKS {
                if !next_block_array(pool, None, state).expect("no allocation on the read path") {
                    return 0;
                }
                if pool.cfg().list_walk {
                    offset_left -= skip_array_entry(pool, None, state, offset_left)
                        .expect("no allocation on the read path");
                }
            }
        }
    }

    // The cache matches the handle offset; read from there.
    let mut bytes_read = 0;
    while bytes_read < buf.len() {
        let read = read_from_block(pool, state, &mut buf[bytes_read..]);
        if read == 0 {
            let block = read_block(pool, &state.pos);
            let block_boundary = block.allocated > 0
                && block.used == block.allocated
                && block.used == state.pos.block_off;
            if !block_boundary {
                break;
            }
        }
        bytes_read += read;

        if bytes_read < buf.len() {
            let block = read_block(pool, &state.pos);
            if block.used != block.allocated {
                break;
            }
            state.pos.block_id += 1;
            state.pos.block_off = 0;
            if state.pos.block_id == MAX_NUM_BLOCKS
                && !next_block_array(pool, None, state).expect("no allocation on the read path")
            {
                break;
            }
        }
    }
    bytes_read
}

impl FilePool {
    /// Writes the whole of `buf` at the handle's offset. The write and the
    /// offset advance happen atomically: an aborted transaction leaves the
    /// file, the offset and the position cache exactly as they were.
    pub fn write(&self, file: &File, buf: &[u8]) -> Result<usize> {
        log::debug!("write {} bytes at handle {:#x}", buf.len(), file.inode().off());

        // SAFETY: shared inode metadata; racy fields are not touched here.
        if !unsafe { self.obj().get(file.inode()) }.is_regular_file() {
            return fail(Error::Invalid);
        }
        if !file.writable() {
            return fail(Error::BadFile);
        }
        if buf.len() > i64::MAX as usize {
            return fail(Error::TooBig);
        }

        let rt = self.inode_get(file.inode());
        file.lock().lock();
        defer! { file.lock().unlock() }

        // SAFETY: handle lock held.
        let state = unsafe { &mut *file.state() };
        if self.cfg().tree_walk && state.index.is_none() {
            rebuild_index(self, state, file.inode());
        }

        let saved_pos = state.pos;
        let res = self.obj().tx(|tx| {
            rt.lock.tx_wlock(tx);
            write_locked(self, tx, state, file.inode(), buf)?;
            rt.lock.tx_unlock_on_commit(tx);
            Ok(())
        });
        match res {
            Ok(()) => {
                state.offset += buf.len() as u64;
                Ok(buf.len())
            }
            Err(err) => {
                state.pos = saved_pos;
                fail(err)
            }
        }
    }

    /// Reads up to `buf.len()` bytes at the handle's offset. Short counts
    /// happen only at end of file; 0 means end of file.
    pub fn read(&self, file: &File, buf: &mut [u8]) -> Result<usize> {
        log::debug!("read {} bytes at handle {:#x}", buf.len(), file.inode().off());

        // SAFETY: shared inode metadata.
        if !unsafe { self.obj().get(file.inode()) }.is_regular_file() {
            return fail(Error::Invalid);
        }
        if !file.readable() {
            return fail(Error::BadFile);
        }
        if buf.len() > i64::MAX as usize {
            return fail(Error::TooBig);
        }

        let rt = self.inode_get(file.inode());
        file.lock().lock();
        defer! { file.lock().unlock() }
        rt.lock.rlock();
        defer! { rt.lock.runlock() }

        // SAFETY: handle lock held.
        let state = unsafe { &mut *file.state() };
        if self.cfg().tree_walk && state.index.is_none() {
            rebuild_index(self, state, file.inode());
        }

        let bytes_read = read_locked(self, state, file.inode(), buf);
        state.offset += bytes_read as u64;
        debug_assert!(bytes_read <= buf.len());
        Ok(bytes_read)
    }

    /// Repositions the handle. No blocks are allocated; writing past the
    /// end later zero-fills the gap.
    pub fn lseek(&self, file: &File, offset: i64, whence: Whence) -> Result<u64> {
        log::debug!("lseek {:+} {:?} handle {:#x}", offset, whence, file.inode().off());

        // SAFETY: shared inode metadata.
        if !unsafe { self.obj().get(file.inode()) }.is_regular_file() {
            return fail(Error::Invalid);
        }

        let rt = self.inode_get(file.inode());
        file.lock().lock();
        defer! { file.lock().unlock() }

        // SAFETY: handle lock held.
        let state = unsafe { &mut *file.state() };
        let target = match whence {
            Whence::Set => offset,
            Whence::Cur => state.offset as i64 + offset,
            Whence::End => {
                rt.lock.rlock();
                // SAFETY: read lock held.
                let size = unsafe { self.obj().get(file.inode()) }.size;
                rt.lock.runlock();
                size as i64 + offset
            }
        };

        if target < 0 {
            return fail(Error::Invalid);
        }
        state.offset = target as u64;
        Ok(target as u64)
    }
}
