//! Directory entry sequence addressing: map a [`DirPos`] to a concrete
//! sector + byte offset, for both the FAT12/16 fixed-size root area and an
//! ordinary cluster-chain directory (spec §3 "DirPos", §4.4.4/§4.4.5).
//!
//! Keeps only the abstract position; fetching a live entry materializes
//! the sector containing it and returns a borrowed view whose lifetime
//! does not outlive the sector handle (spec §9's "pointer-based directory
//! traversal -> explicit position values" design note).

use io_at::{ReadAt, WriteAt};

use crate::block_io::{BlockIo, SectorType};
use crate::dirent::DirPos;
use crate::error::{Error, LfnError, Result};
use crate::fat::FatTable;

/// Concrete on-disk location of one 32-byte directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirLoc {
    pub sector: u64,
    pub offset: usize,
}

/// Resolve `pos` to a concrete location without growing the directory.
/// Returns `Ok(None)` when `pos` is past the directory's current capacity
/// (fixed root exhausted, or the cluster chain ends before reaching
/// `entry_index`) -- a legitimate "nothing here yet" outcome for scans,
/// and the signal an insert path uses to decide it must grow.
pub fn locate<D: ReadAt + WriteAt>(table: &FatTable, io: &mut BlockIo<D>, pos: DirPos) -> Result<Option<DirLoc>> {
    let bps = table.bytes_per_sector() as u64;
    let entries_per_sector = bps / 32;

    if pos.parent_cluster == 0 && table.has_fixed_root() {
        let sector = table.root_dir_sector() + pos.entry_index as u64 / entries_per_sector;
        if sector >= table.root_dir_sector() + table.root_dir_sectors() as u64 {
            return Ok(None);
        }
        let offset = (pos.entry_index as u64 % entries_per_sector) as usize * 32;
        return Ok(Some(DirLoc { sector, offset }));
    }

    let entries_per_cluster = table.bytes_per_cluster() as u64 / 32;
    let cluster_step = pos.entry_index as u64 / entries_per_cluster;
    let within = pos.entry_index as u64 % entries_per_cluster;
    let cluster_step: u32 = cluster_step.try_into().map_err(|_| Error::Lfn(LfnError::DiskFull))?;

    let cluster_id = table.walk_chain(io, pos.parent_cluster, cluster_step)?;
    if cluster_id == 0 || table.variant().is_eoc(cluster_id) {
        return Ok(None);
    }
    let sector = table.cluster_to_sector(cluster_id) + (within * 32) / bps;
    let offset = ((within * 32) % bps) as usize;
    Ok(Some(DirLoc { sector, offset }))
}

/// Read the 32 bytes at `pos`. `Ok(None)` if `pos` is past the directory's
/// current capacity.
pub fn read_entry<D: ReadAt + WriteAt>(table: &FatTable, io: &mut BlockIo<D>, pos: DirPos) -> Result<Option<[u8; 32]>> {
    let Some(loc) = locate(table, io, pos)? else {
        return Ok(None);
    };
    let h = io.acquire(loc.sector, SectorType::Directory)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.bytes()[loc.offset..loc.offset + 32]);
    Ok(Some(out))
}

/// Write 32 bytes at `pos`. Errors if `pos` is past the directory's
/// current capacity -- callers that need to grow the directory (spec
/// §4.4.5) must do so explicitly first via [`grow`].
pub fn write_entry<D: ReadAt + WriteAt>(table: &FatTable, io: &mut BlockIo<D>, pos: DirPos, raw: &[u8; 32]) -> Result<()> {
    let Some(loc) = locate(table, io, pos)? else {
        return Err(Error::Lfn(LfnError::DiskFull));
    };
    let mut h = io.acquire(loc.sector, SectorType::Directory)?;
    h.bytes_mut()[loc.offset..loc.offset + 32].copy_from_slice(raw);
    h.mark_dirty();
    h.release()
}

/// Append one more cluster to a chain directory, zero-filling it (spec
/// §4.4.5 / SPEC_FULL.md's "flush -> alloc_cluster -> write zeroed
/// sector(s) -> mark sector buffer valid" supplement). Returns `DiskFull`
/// for a fixed-size FAT12/16 root, which cannot grow.
pub fn grow<D: ReadAt + WriteAt>(table: &FatTable, io: &mut BlockIo<D>, parent_cluster: u32) -> Result<()> {
    if parent_cluster == 0 && table.has_fixed_root() {
        return Err(Error::Lfn(LfnError::DiskFull));
    }
    let (last, _count) = table.find_last_cluster(io, parent_cluster)?;
    let new_cluster = table.alloc_cluster(io, last)?;
    if new_cluster == 0 {
        return Err(Error::Lfn(LfnError::DiskFull));
    }
    let sector_start = table.cluster_to_sector(new_cluster);
    for i in 0..table.sectors_per_cluster() as u64 {
        let mut h = io.acquire_uninit(sector_start + i, SectorType::Directory);
        h.bytes_mut().fill(0);
        h.mark_dirty();
        h.release()?;
    }
    Ok(())
}

/// Iterate `DirPos` values from `start` until the directory's current
/// capacity is exhausted, in increasing `entry_index` order. Does not
/// grow the directory -- used for scans (lookup, CheckDisk's walk), not
/// insert.
pub struct EntryIter {
    pos: DirPos,
}

impl EntryIter {
    pub fn from(start: DirPos) -> EntryIter {
        EntryIter { pos: start }
    }

    pub fn next<D: ReadAt + WriteAt>(&mut self, table: &FatTable, io: &mut BlockIo<D>) -> Result<Option<(DirPos, [u8; 32])>> {
        match read_entry(table, io, self.pos)? {
            Some(raw) => {
                let pos = self.pos;
                self.pos = self.pos.advance();
                Ok(Some((pos, raw)))
            }
            None => Ok(None),
        }
    }
}
