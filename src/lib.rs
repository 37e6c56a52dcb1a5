//! `fatvol-core`: the FAT12/16/32 + MBR/GPT core of an embedded file system
//! (spec §1-§2).
//!
//! Publishes BlockIO (§4.1), the partitioner (§4.2), FATCore (§4.3), LFN
//! (§4.4), and CheckDisk (§4.5) as cooperating modules, and assembles them
//! here into a [`Volume`]: the root aggregate a caller mounts against a
//! located partition and drives directory lookup/insert and CheckDisk
//! through.
//!
//! Everything outside these five modules -- the physical NAND/NOR/SD
//! driver, the sector cache beneath [`BlockIo`], the journaling layer, the
//! OS locking primitives, and the user-facing POSIX-style file API -- is
//! an external collaborator per spec §1/§6, not part of this crate.

mod macros;

pub mod block_io;
pub mod checkdisk;
pub mod directory;
pub mod dirent;
pub mod error;
pub mod fat;
pub mod lfn;
pub mod partition;

use io_at::{ReadAt, WriteAt};

pub use block_io::{BlockIo, SectorHandle, SectorType};
pub use checkdisk::{CheckDiskCallback, CheckDiskConfig, CheckDiskOutcome, CheckDiskSession, Finding, FindingKind, RepairAction};
pub use dirent::{DirPos, ShortEntry};
pub use error::{Error, Result};
pub use fat::{Bpb, FatTable, FatVariant};
pub use lfn::{CharsetConv, Latin1BestFit, LookupMatch, ShortNameResult};
pub use partition::{PartitionRegion, Scheme};

/// Mount state of a [`Volume`] (spec §3's data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    ReadOnly,
    ReadWrite,
}

/// The root aggregate (spec §3): a partition descriptor, mount state, FAT
/// variant, and the cached BPB-derived geometry every other operation is
/// expressed in terms of. Owns the volume's sole [`BlockIo`] instance --
/// spec §3's "a volume exclusively owns its sector buffer(s)".
pub struct Volume<D: ReadAt + WriteAt> {
    io: BlockIo<D>,
    region: PartitionRegion,
    table: FatTable,
    state: MountState,
}

impl<D: ReadAt + WriteAt> Volume<D> {
    /// Mount the FAT volume occupying `region` of `device`. Reads and
    /// validates the BPB at the partition's first sector (spec §4.3);
    /// callers obtain `region` from [`partition::mbr::Mbr::first_partition`]
    /// or [`partition::gpt::Gpt`] (spec §2's control flow: "Partitioner
    /// identifies the data region. FATCore is mounted against that
    /// region.").
    pub fn mount(device: D, region: PartitionRegion, read_write: bool) -> Result<Volume<D>> {
        let mut io = BlockIo::new(device, 512);
        let bpb = {
            let h = io.acquire(region.start_sector, SectorType::Management)?;
            Bpb::from_sector(h.bytes())?
        };
        // The probe read above assumed the common 512-byte sector; redo it
        // with the BPB's actual size if that assumption was wrong.
        let bytes_per_sector = bpb.bytes_per_sector() as usize;
        if bytes_per_sector != 512 {
            io.invalidate_sector(region.start_sector);
            let device = io.into_device();
            io = BlockIo::new(device, bytes_per_sector);
        }
        let table = FatTable::from_bpb(&bpb, region.start_sector);
        log::info!(
            "mounted {:?} volume: {} clusters, {} bytes/cluster",
            table.variant(),
            table.num_clusters(),
            table.bytes_per_cluster()
        );
        Ok(Volume {
            io,
            region,
            table,
            state: if read_write { MountState::ReadWrite } else { MountState::ReadOnly },
        })
    }

    pub fn mount_state(&self) -> MountState {
        self.state
    }

    pub fn partition_region(&self) -> PartitionRegion {
        self.region
    }

    pub fn variant(&self) -> FatVariant {
        self.table.variant()
    }

    pub fn table(&self) -> &FatTable {
        &self.table
    }

    pub fn block_io(&mut self) -> &mut BlockIo<D> {
        &mut self.io
    }

    /// Cluster id addressing the root directory: the BPB's `root_cluster`
    /// on FAT32, or the sentinel `0` [`directory`] and [`lfn`] use to mean
    /// "the fixed-size FAT12/16 root area" (spec §3 "DirPos").
    pub fn root_cluster(&self) -> u32 {
        if self.table.has_fixed_root() {
            0
        } else {
            self.table.root_cluster()
        }
    }

    fn require_read_write(&self) -> Result<()> {
        if self.state != MountState::ReadWrite {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "volume mounted read-only")));
        }
        Ok(())
    }

    /// Look up `name` within `parent_cluster` (spec §4.4.4). Pass
    /// [`Volume::root_cluster`] to search the root.
    pub fn lookup(&mut self, parent_cluster: u32, name: &str, required_attr_mask: u8) -> Result<Option<LookupMatch>> {
        lfn::lookup(&self.table, &mut self.io, parent_cluster, name, required_attr_mask)
    }

    /// Insert a new directory entry named `name` under `parent_cluster`
    /// (spec §4.4.5). `charset` folds non-ASCII long-name characters to a
    /// short-name byte per spec §6's `CharsetConv` contract; pass
    /// [`lfn::default_charset`] absent a caller-supplied converter.
    pub fn insert(
        &mut self,
        parent_cluster: u32,
        name: &str,
        short_template: ShortEntry,
        existing_names: &[[u8; 11]],
        charset: &dyn lfn::CharsetConv,
    ) -> Result<(DirPos, ShortEntry)> {
        self.require_read_write()?;
        lfn::insert(&self.table, &mut self.io, parent_cluster, name, short_template, existing_names, charset)
    }

    /// Every 11-byte short name currently present directly under
    /// `parent_cluster`, for [`Volume::insert`]'s collision search (spec
    /// §4.4.2 item 4).
    pub fn existing_short_names(&mut self, parent_cluster: u32) -> Result<Vec<[u8; 11]>> {
        let mut names = Vec::new();
        let mut iter = directory::EntryIter::from(DirPos::root(parent_cluster));
        while let Some((_, raw)) = iter.next(&self.table, &mut self.io)? {
            let view = dirent::RawDirEntry(&raw);
            if view.is_end() {
                break;
            }
            if view.is_deleted() {
                continue;
            }
            if let dirent::DirEntryView::Short(s) = view.decode() {
                names.push(*s.name83());
            }
        }
        Ok(names)
    }

    /// Run one bounded-work CheckDisk slice against this volume (spec
    /// §4.5.1); re-invoke after `Stopped(Retry)` per the caller contract.
    pub fn check_disk_once(&mut self, session: &mut CheckDiskSession, callback: &mut dyn CheckDiskCallback) -> Result<CheckDiskOutcome> {
        self.require_read_write()?;
        session.run_once(&self.table, &mut self.io, callback)
    }

    /// Unmount, returning the underlying device. Every write already went
    /// through [`BlockIo::acquire`]/flush-on-release, so there is nothing
    /// left to sync here.
    pub fn unmount(self) -> D {
        self.io.into_device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemDevice {
        data: Vec<u8>,
    }

    impl MemDevice {
        fn new(sectors: usize, bytes_per_sector: usize) -> Self {
            MemDevice { data: vec![0u8; sectors * bytes_per_sector] }
        }
    }

    impl ReadAt for MemDevice {
        fn read_at(&self, buf: &mut [u8], offs: u64) -> io_at::Result<()> {
            let offs = offs as usize;
            buf.copy_from_slice(&self.data[offs..offs + buf.len()]);
            Ok(())
        }
    }

    impl WriteAt for MemDevice {
        fn write_at(&mut self, buf: &[u8], offs: u64) -> io_at::Result<()> {
            let offs = offs as usize;
            self.data[offs..offs + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn format_fat16(dev: &mut MemDevice, total_sectors: u32, sectors_per_cluster: u8) {
        let fat_size: u16 = 32;
        let root_entries: u16 = 512;
        let mut s = vec![0u8; 512];
        s[0] = 0xEB;
        s[1] = 0x3C;
        s[2] = 0x90;
        s[3..11].copy_from_slice(b"MSDOS5.0");
        s[11..13].copy_from_slice(&512u16.to_le_bytes());
        s[13] = sectors_per_cluster;
        s[14..16].copy_from_slice(&1u16.to_le_bytes());
        s[16] = 2;
        s[17..19].copy_from_slice(&root_entries.to_le_bytes());
        s[19..21].copy_from_slice(&(total_sectors as u16).to_le_bytes());
        s[21] = 0xF8;
        s[22..24].copy_from_slice(&fat_size.to_le_bytes());
        s[510] = 0x55;
        s[511] = 0xAA;
        dev.data[0..512].copy_from_slice(&s);
    }

    #[test]
    fn mount_reads_bpb_and_exposes_geometry() {
        init_logging();
        let mut dev = MemDevice::new(4096, 512);
        format_fat16(&mut dev, 4096, 4);
        let region = PartitionRegion { start_sector: 0, sector_count: 4096 };
        let vol = Volume::mount(dev, region, false).unwrap();
        assert_eq!(vol.variant(), FatVariant::Fat16);
        assert_eq!(vol.root_cluster(), 0);
        assert_eq!(vol.mount_state(), MountState::ReadOnly);
    }

    #[test]
    fn insert_then_lookup_round_trips_a_name() {
        let mut dev = MemDevice::new(4096, 512);
        format_fat16(&mut dev, 4096, 4);
        let region = PartitionRegion { start_sector: 0, sector_count: 4096 };
        let mut vol = Volume::mount(dev, region, true).unwrap();

        let root = vol.root_cluster();
        let existing = vol.existing_short_names(root).unwrap();
        let short = ShortEntry {
            name83: [0; 11],
            attr: dirent::attr::ARCHIVE,
            create_time: 0,
            create_date: 0,
            write_time: 0,
            write_date: 0,
            first_cluster: 0,
            file_size: 0,
        };
        vol.insert(root, "hello.txt", short, &existing, lfn::default_charset()).unwrap();

        let found = vol.lookup(root, "hello.txt", 0).unwrap().expect("entry should be found");
        assert_eq!(&found.short.name83, b"HELLO   TXT");
    }

    #[test]
    fn read_only_volume_rejects_insert() {
        let mut dev = MemDevice::new(4096, 512);
        format_fat16(&mut dev, 4096, 4);
        let region = PartitionRegion { start_sector: 0, sector_count: 4096 };
        let mut vol = Volume::mount(dev, region, false).unwrap();
        let short = ShortEntry {
            name83: [0; 11],
            attr: dirent::attr::ARCHIVE,
            create_time: 0,
            create_date: 0,
            write_time: 0,
            write_date: 0,
            first_cluster: 0,
            file_size: 0,
        };
        let root = vol.root_cluster();
        assert!(vol.insert(root, "a.txt", short, &[], lfn::default_charset()).is_err());
    }
}
