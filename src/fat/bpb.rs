//! BIOS Parameter Block parsing and FAT12/16/32 variant detection (spec §4.3,
//! data model in §3).
//!
//! Field-accessor style continues directly from the teacher's `BootSector`
//! impl block in `jmesmon-exfat-rs` (one named accessor per on-disk field,
//! doc comment giving the offset), generalized from exFAT's single boot
//! sector to the classic FAT12/16/32 BPB plus its FAT32-only extension.

use fmt_extra::AsciiStr;
use index_fixed::index_fixed;

use crate::error::{BpbError, Error, Result};
use crate::macros::read_num_bytes;

/// Which of the three on-disk FAT table widths this volume uses. Picked
/// from `cluster_count` using the thresholds Microsoft's `fatgen103`
/// describes and the pack's FAT crates reproduce (see
/// `examples/other_examples/1db70399_MorizzG-fat-fs__fat-bits-src-bpb.rs.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

/// True when `jump` (a sector's first three bytes) decodes as an x86 jump
/// instruction -- `0xEB xx 0x90` or `0xE9 xx xx` -- the shape every real
/// BPB's `jump_boot` field takes (spec §4.2.1). Free function rather than a
/// `Bpb` method because `partition::mbr`'s BPB-look-alike guard needs this
/// check on sector 0 of the *device* before it knows whether that sector is
/// a BPB at all, so there is no parsed `Bpb` yet to call `jump_boot` on.
pub fn is_x86_jump(jump: &[u8; 3]) -> bool {
    (jump[0] == 0xEB && jump[2] == 0x90) || jump[0] == 0xE9
}

impl FatVariant {
    /// The end-of-chain marker for this variant (spec §4.3).
    pub fn eoc_marker(self) -> u32 {
        match self {
            FatVariant::Fat12 => 0x0FFF,
            FatVariant::Fat16 => 0xFFFF,
            FatVariant::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// True when `raw` (already masked to this variant's entry width) is an
    /// end-of-chain marker. FAT allows any value from "last" up through
    /// all-ones to mean EOC, not just the canonical marker.
    pub fn is_eoc(self, raw: u32) -> bool {
        match self {
            FatVariant::Fat12 => raw >= 0x0FF8,
            FatVariant::Fat16 => raw >= 0xFFF8,
            FatVariant::Fat32 => (raw & 0x0FFF_FFFF) >= 0x0FFF_FFF8,
        }
    }

    fn from_cluster_count(cluster_count: u32) -> FatVariant {
        if cluster_count < 4085 {
            FatVariant::Fat12
        } else if cluster_count < 65525 {
            FatVariant::Fat16
        } else {
            FatVariant::Fat32
        }
    }
}

/// The decoded BPB plus its FAT32 extension, if present.
///
/// Holds the raw first sector rather than copying every field out
/// individually, the same tradeoff the teacher's `BootSector` makes ("we
/// store the entire thing as it's very likely that we'll need to
/// write-back the entire sector if anything changes").
#[derive(Clone)]
pub struct Bpb {
    raw: Vec<u8>,
}

impl Bpb {
    /// Parse and validate a freshly read sector 0 of the FAT volume (the
    /// partition's first sector, not the device's).
    pub fn from_sector(raw: &[u8]) -> Result<Bpb> {
        let bpb = Bpb { raw: raw.to_vec() };
        bpb.validate()?;
        Ok(bpb)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// offset 0, size 3 -- x86 jump instruction. FATCore itself never
    /// interprets this field once a BPB is already known to be one; see
    /// [`is_x86_jump`], which the partitioner's BPB-look-alike guard calls
    /// directly on a raw sector, before any BPB has been parsed (spec
    /// §4.2.1).
    pub fn jump_boot(&self) -> &[u8; 3] {
        index_fixed!(&self.raw; 0, ..3)
    }

    /// offset 3, size 8 -- OEM name, usually an ASCII tag of the formatter.
    pub fn oem_name(&self) -> &[u8; 8] {
        index_fixed!(&self.raw; 3, ..11)
    }

    /// offset 11, size 2
    pub fn bytes_per_sector(&self) -> u16 {
        read_num_bytes!(u16, 2, &self.raw[11..13])
    }

    /// offset 13, size 1. Valid values are powers of two, 1..=128.
    pub fn sectors_per_cluster(&self) -> u8 {
        self.raw[13]
    }

    /// offset 14, size 2
    pub fn reserved_sector_count(&self) -> u16 {
        read_num_bytes!(u16, 2, &self.raw[14..16])
    }

    /// offset 16, size 1
    pub fn num_fats(&self) -> u8 {
        self.raw[16]
    }

    /// offset 17, size 2 -- zero on FAT32 (root is a cluster chain there).
    pub fn root_entry_count(&self) -> u16 {
        read_num_bytes!(u16, 2, &self.raw[17..19])
    }

    /// offset 19, size 2 -- zero when the volume needs `total_sectors_32`.
    pub fn total_sectors_16(&self) -> u16 {
        read_num_bytes!(u16, 2, &self.raw[19..21])
    }

    /// offset 21, size 1
    pub fn media(&self) -> u8 {
        self.raw[21]
    }

    /// offset 22, size 2 -- zero on FAT32 (see `fat_size_32`).
    pub fn fat_size_16(&self) -> u16 {
        read_num_bytes!(u16, 2, &self.raw[22..24])
    }

    /// offset 28, size 4
    pub fn hidden_sectors(&self) -> u32 {
        read_num_bytes!(u32, 4, &self.raw[28..32])
    }

    /// offset 32, size 4
    pub fn total_sectors_32(&self) -> u32 {
        read_num_bytes!(u32, 4, &self.raw[32..36])
    }

    /// offset 36, size 4 -- FAT32 only.
    pub fn fat_size_32(&self) -> u32 {
        read_num_bytes!(u32, 4, &self.raw[36..40])
    }

    /// offset 44, size 4 -- FAT32 only. Cluster id of the root directory's
    /// first cluster (spec §3 "first-cluster-index = 2" applies here too).
    pub fn root_cluster(&self) -> u32 {
        read_num_bytes!(u32, 4, &self.raw[44..48])
    }

    /// FAT12/16/32 volume label field (offset 43 on FAT12/16, offset 71 on
    /// FAT32's extended layout). No caller in this crate reads it yet --
    /// kept alongside the rest of the BPB's named field accessors the way
    /// the teacher's `BootSector` impl covers every field of its own boot
    /// sector, not only the ones a caller currently needs.
    pub fn volume_label(&self) -> &[u8; 11] {
        if self.is_fat32_layout() {
            index_fixed!(&self.raw; 71, ..82)
        } else {
            index_fixed!(&self.raw; 43, ..54)
        }
    }

    /// `true` once enough of the extended BPB fields (`fat_size_16 == 0`)
    /// are present that FAT32-layout offsets (root cluster etc.) apply.
    /// This is purely a layout discriminant, independent of the `FatVariant`
    /// computed from cluster count -- a 16 MiB volume can have
    /// `fat_size_16 == 0` and still resolve to FAT16 by the classic
    /// cluster-count rule if mis-formatted; FATCore reports both so
    /// CheckDisk can flag the mismatch.
    fn is_fat32_layout(&self) -> bool {
        self.fat_size_16() == 0
    }

    fn fat_size(&self) -> u32 {
        if self.is_fat32_layout() {
            self.fat_size_32()
        } else {
            self.fat_size_16() as u32
        }
    }

    fn total_sectors(&self) -> u32 {
        if self.total_sectors_16() != 0 {
            self.total_sectors_16() as u32
        } else {
            self.total_sectors_32()
        }
    }

    /// Sectors occupied by the fixed-size FAT12/16 root directory area (0
    /// for FAT32, where the root is an ordinary cluster chain).
    pub fn root_dir_sectors(&self) -> u32 {
        let bytes = self.root_entry_count() as u32 * 32;
        bytes.div_ceil(self.bytes_per_sector() as u32)
    }

    fn first_data_sector(&self) -> u32 {
        self.reserved_sector_count() as u32
            + self.num_fats() as u32 * self.fat_size()
            + self.root_dir_sectors()
    }

    fn data_sector_count(&self) -> u32 {
        self.total_sectors() - self.first_data_sector()
    }

    /// Number of clusters in the data region -- the value the FAT12/16/32
    /// distinction is made from (spec §4.3).
    pub fn cluster_count(&self) -> u32 {
        self.data_sector_count() / self.sectors_per_cluster().max(1) as u32
    }

    pub fn variant(&self) -> FatVariant {
        FatVariant::from_cluster_count(self.cluster_count())
    }

    fn validate(&self) -> Result<()> {
        if self.raw.len() < 90 {
            return Err(Error::Bpb(BpbError::UnrecognizedFatType));
        }
        let sig = &self.raw[510..512];
        if sig != [0x55, 0xAA] {
            return Err(Error::Bpb(BpbError::BadBootSignature([sig[0], sig[1]])));
        }
        if !self.bytes_per_sector().is_power_of_two() || self.bytes_per_sector() < 512 {
            return Err(Error::Bpb(BpbError::BytesPerSectorNotPowerOfTwo(self.bytes_per_sector())));
        }
        if !self.sectors_per_cluster().is_power_of_two() {
            return Err(Error::Bpb(BpbError::SectorsPerClusterNotPowerOfTwo(self.sectors_per_cluster())));
        }
        if self.num_fats() == 0 {
            return Err(Error::Bpb(BpbError::ZeroFats));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Bpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bpb")
            .field("oem_name", &AsciiStr(*self.oem_name()))
            .field("bytes_per_sector", &self.bytes_per_sector())
            .field("sectors_per_cluster", &self.sectors_per_cluster())
            .field("num_fats", &self.num_fats())
            .field("variant", &self.variant())
            .field("cluster_count", &self.cluster_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat16_sector(total_sectors: u16, sectors_per_cluster: u8, fat_size: u16, root_entries: u16) -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0] = 0xEB;
        s[1] = 0x3C;
        s[2] = 0x90;
        s[3..11].copy_from_slice(b"MSDOS5.0");
        s[11..13].copy_from_slice(&512u16.to_le_bytes());
        s[13] = sectors_per_cluster;
        s[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        s[16] = 2; // num_fats
        s[17..19].copy_from_slice(&root_entries.to_le_bytes());
        s[19..21].copy_from_slice(&total_sectors.to_le_bytes());
        s[21] = 0xF8;
        s[22..24].copy_from_slice(&fat_size.to_le_bytes());
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn parses_fat16_geometry() {
        let raw = fat16_sector(65536, 4, 256, 512);
        let bpb = Bpb::from_sector(&raw).unwrap();
        assert_eq!(bpb.bytes_per_sector(), 512);
        assert_eq!(bpb.root_dir_sectors(), 32);
        assert_eq!(bpb.variant(), FatVariant::Fat16);
    }

    #[test]
    fn rejects_missing_boot_signature() {
        let mut raw = fat16_sector(65536, 4, 256, 512);
        raw[510] = 0;
        assert!(matches!(Bpb::from_sector(&raw), Err(Error::Bpb(BpbError::BadBootSignature(_)))));
    }

    #[test]
    fn small_volume_resolves_fat12() {
        let raw = fat16_sector(4000, 1, 12, 224);
        let bpb = Bpb::from_sector(&raw).unwrap();
        assert_eq!(bpb.variant(), FatVariant::Fat12);
    }
}
