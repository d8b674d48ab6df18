//! The persistent-memory file system core. Five layers, leaves first:
//!
//!   + Object pool: allocation, transactions, write-through (the `obj`
//!     module, consumed here).
//!   + Runtime overlay: per-session state revived generation by
//!     generation (`rt`).
//!   + Inodes: allocation, reference counting, freeing, the opened-inodes
//!     set (`inode`).
//!   + Directories: one flat root of chained dentry pages (`dir`).
//!   + File data: block chains, the position cache, read/write/seek
//!     (`data`).
//!
//! This module owns the superblock and the pool lifecycle. Opening a pool
//! bumps the generation id by 2, invalidating every piece of last
//! session's runtime state at once, and then sweeps the opened-inodes set:
//! files that were open when the previous session died, and have no name
//! left, are freed before anyone sees the pool.
//!
//! Dropping a [`FilePool`] without calling [`FilePool::close`] behaves
//! like a crash: nothing is written beyond what transactions already
//! committed. Tests lean on this.

use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::obj::{Obj, ObjPool};

pub(crate) mod data;
pub(crate) mod dir;
pub(crate) mod file;
pub(crate) mod inode;
pub(crate) mod layout;
pub(crate) mod path;
pub(crate) mod rt;

pub use data::Whence;
pub use dir::DirEntryInfo;
pub use file::File;

use layout::{Inode as DInode, InodeArray, Super, SUPER_VERSION, TYPE_SUPER};
use layout::{TYPE_BLOCK_ARRAY, TYPE_DATA, TYPE_DIR, TYPE_INODE, TYPE_INODE_ARRAY};
use rt::{InodeRt, SuperRt};

/// Counts of live on-media objects, by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub inodes: usize,
    pub dirs: usize,
    pub block_arrays: usize,
    pub inode_arrays: usize,
    pub blocks: usize,
}

/// An open file system pool.
pub struct FilePool {
    obj: ObjPool,
    run_id: u64,
    superblock: Obj<Super>,
    cfg: Config,
}

impl FilePool {
    /// Creates a file system in a new pool file at `path`.
    pub fn mkfs(path: impl AsRef<Path>, poolsize: u64, mode: u32) -> Result<Self> {
        Self::mkfs_with(path, poolsize, mode, Config::from_env())
    }

    /// [`mkfs`](Self::mkfs) with an explicit configuration.
    pub fn mkfs_with(
        path: impl AsRef<Path>,
        poolsize: u64,
        mode: u32,
        cfg: Config,
    ) -> Result<Self> {
        crate::init();
        let path = path.as_ref();
        log::debug!("mkfs {:?} poolsize {} mode {:#o}", path, poolsize, mode);

        if poolsize < crate::param::MIN_POOL_SIZE {
            log::warn!("pool size {} below the minimum", poolsize);
            return Err(Error::Invalid);
        }
        let obj = ObjPool::create(path, poolsize, mode)?;
        let superblock = obj.root::<Super>(TYPE_SUPER)?;
        let mut pool = Self {
            obj,
            run_id: 0,
            superblock,
            cfg,
        };
        pool.initialize_super()?;
        Ok(pool)
    }

    /// Opens an existing file system pool, running crash recovery over
    /// inodes the previous session left open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Config::from_env())
    }

    /// [`open`](Self::open) with an explicit configuration.
    pub fn open_with(path: impl AsRef<Path>, cfg: Config) -> Result<Self> {
        crate::init();
        let path = path.as_ref();
        log::debug!("open {:?}", path);

        let obj = ObjPool::open(path)?;
        if obj.root_size() != std::mem::size_of::<Super>() as u64 {
            log::error!("pool in {:?} is not initialized", path);
            return Err(Error::NoDevice);
        }
        let superblock = obj.root::<Super>(TYPE_SUPER)?;
        let mut pool = Self {
            obj,
            run_id: 0,
            superblock,
            cfg,
        };
        pool.initialize_super()?;
        pool.cleanup_inode_arrays();
        Ok(pool)
    }

    /// Closes the pool: drops the root reference and tears the superblock
    /// runtime down. Open handles must have been closed already.
    pub fn close(self) {
        log::debug!("closing pool");

        // SAFETY: immutable after open.
        let root = unsafe { self.obj.get(self.superblock) }.root_inode;
        self.inode_unref_tx(root);

        let super_rt = self.super_rt() as *const SuperRt as *mut SuperRt;
        // SAFETY: the pool is being consumed; nobody can reach the
        // superblock runtime any more.
        drop(unsafe { Box::from_raw(super_rt) });
    }

    /// Bumps (or initialises) the generation and takes the session's root
    /// reference; creates the root directory on a fresh pool.
    fn initialize_super(&mut self) -> Result<()> {
        let sp = self.superblock;
        // SAFETY: the pool is not shared until open returns.
        let initialized = unsafe { self.obj.get(sp) }.initialized != 0;
        self.run_id = if initialized {
            unsafe { self.obj.get(sp) }.run_id + 2
        } else {
            2
        };

        let run_id = self.run_id;
        let res = self.obj.tx(|tx| {
            tx.add(sp);
            if initialized {
                // SAFETY: as above; snapshotted.
                unsafe { (*self.obj.get_raw(sp)).run_id = run_id };
                let root = unsafe { self.obj.get(sp) }.root_inode;
                let rt = self.inode_ref(root);
                rt.path.lock().get_or_insert_with(|| "/".to_string());
            } else {
                // SAFETY: as above; snapshotted.
                unsafe {
                    let s = self.obj.get_raw(sp);
                    (*s).version = SUPER_VERSION;
                    (*s).run_id = run_id;
                }
                let root = self.new_dir(tx, Obj::NULL, b"/")?;
                unsafe {
                    let s = self.obj.get_raw(sp);
                    (*s).root_inode = root;
                    (*s).initialized = 1;
                }
            }
            Ok(())
        });
        if res.is_err() {
            log::error!("cannot initialize super block");
        }
        res
    }

    /// Crash recovery: frees every registered inode with no links left,
    /// empties the slots, and shrinks the chain back to its head.
    fn cleanup_inode_arrays(&self) {
        // SAFETY: single-threaded; the pool is not shared yet.
        let head = unsafe { self.obj.get(self.superblock) }.opened_inodes;

        self.obj
            .tx(|tx| {
                let mut last = head;
                let mut single = head;
                while !single.is_null() {
                    last = single;
                    // Both used and unused arrays change: used ones here,
                    // unused ones when the chain is shrunk below.
                    tx.add(single);
                    // SAFETY: as above.
                    if unsafe { self.obj.get(single) }.used > 0 {
                        self.cleanup_inode_array_single(tx, single);
                    }
                    single = unsafe { self.obj.get(single) }.next;
                }

                if !last.is_null() {
                    loop {
                        // SAFETY: as above.
                        let prev = unsafe { self.obj.get(last) }.prev;
                        if prev.is_null() {
                            break;
                        }
                        tx.free(last);
                        last = prev;
                    }
                    // SAFETY: snapshotted in the walk above.
                    unsafe { (*self.obj.get_raw(last)).next = Obj::NULL };
                }
                Ok(())
            })
            .expect("cannot clean up the opened-inodes chain");
    }

    /// Recovers one array: frees its nameless inodes and empties it.
    fn cleanup_inode_array_single(&self, tx: &crate::obj::Tx<'_>, single: Obj<InodeArray>) {
        log::debug!("recovering opened-inodes array {:#x}", single.off());

        let node = self.obj.get_raw(single);
        for idx in 0..crate::param::INODES_PER_ARRAY {
            // SAFETY: single-threaded recovery; snapshotted by the caller.
            if unsafe { (*node).used } == 0 {
                break;
            }
            let inode = unsafe { (*node).inodes[idx] };
            if inode.is_null() {
                continue;
            }

            log::info!("closing inode left over by the previous session");

            // SAFETY: as above.
            if unsafe { self.obj.get(inode) }.nlink == 0 {
                // The slot holds a stale generation; no point reviving
                // runtime state for an inode that is going away.
                self.obj
                    .atomic_u64(inode.field_off(layout::VPTR_DATA_OFF))
                    .store(0, std::sync::atomic::Ordering::Relaxed);
                self.inode_free(tx, inode);
            }

            unsafe {
                (*node).inodes[idx] = Obj::NULL;
                (*node).used -= 1;
            }
        }
        assert_eq!(unsafe { (*node).used }, 0);
    }

    /// Entries of the root directory.
    pub fn list_root(&self) -> Vec<DirEntryInfo> {
        // SAFETY: immutable after open.
        let parent = unsafe { self.obj.get(self.superblock) }.root_inode;
        let parent_rt = self.inode_ref(parent);

        parent_rt.lock.wlock();
        let entries = self.list(parent);
        parent_rt.lock.wunlock();

        self.inode_unref_tx(parent);
        entries
    }

    /// Counts live objects per kind by walking the allocator.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for info in self.obj.objects() {
            match info.type_num {
                TYPE_SUPER => {}
                TYPE_INODE => stats.inodes += 1,
                TYPE_DIR => stats.dirs += 1,
                TYPE_BLOCK_ARRAY => stats.block_arrays += 1,
                TYPE_INODE_ARRAY => stats.inode_arrays += 1,
                TYPE_DATA => stats.blocks += 1,
                other => panic!("unknown object type {}", other),
            }
        }
        log::info!(
            "inodes {} dirs {} block_arrays {} inode_arrays {} blocks {}",
            stats.inodes,
            stats.dirs,
            stats.block_arrays,
            stats.inode_arrays,
            stats.blocks
        );
        stats
    }

    pub(crate) fn obj(&self) -> &ObjPool {
        &self.obj
    }

    pub(crate) fn run_id(&self) -> u64 {
        self.run_id
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub(crate) fn superblock(&self) -> Obj<Super> {
        self.superblock
    }

    pub(crate) fn inode_get(&self, inode: Obj<DInode>) -> &InodeRt {
        rt::inode_get(&self.obj, self.run_id, &self.cfg, inode)
    }

    pub(crate) fn inode_ref(&self, inode: Obj<DInode>) -> &InodeRt {
        rt::inode_ref(&self.obj, self.run_id, &self.cfg, inode)
    }

    /// Takes a reference and records the path the inode was reached by.
    pub(crate) fn inode_ref_path(
        &self,
        inode: Obj<DInode>,
        parent: Obj<DInode>,
        name: &[u8],
    ) -> &InodeRt {
        let rt = self.inode_ref(inode);
        self.set_path_debug(parent, inode, name);
        rt
    }

    pub(crate) fn super_rt(&self) -> &SuperRt {
        rt::super_get(&self.obj, self.run_id, &self.cfg, self.superblock)
    }

    pub(crate) fn dir_get(&self, dir: Obj<layout::Dir>) -> &rt::DirRt {
        rt::dir_get(&self.obj, self.run_id, dir)
    }
}
