//! GPT read/write: primary/backup header, CRC validation, entry table
//! (spec §4.2.3–§4.2.4).

use io_at::{ReadAt, WriteAt};

use crate::block_io::{BlockIo, SectorType};
use crate::error::{Error, GptError, PartitionParamError, Result};
use crate::macros::{read_num_bytes, write_num_bytes};
use crate::partition::mbr::{Mbr, MbrEntry, PROTECTIVE_MBR_TYPE};

pub const SIGNATURE: u64 = 0x5452_4150_2049_4645; // "EFI PART", little endian u64
pub const REVISION: u32 = 0x0001_0000;
pub const MIN_HEADER_SIZE: u32 = 92;
pub const DEFAULT_ENTRY_SIZE: u32 = 128;

/// A 128-bit GUID, stored byte-for-byte as it appears on disk (mixed-endian
/// per the UEFI spec, but this crate never interprets the fields -- it only
/// round-trips the bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Guid(pub [u8; 16]);

/// A decoded GPT header (spec §3 "GPT Header").
#[derive(Debug, Clone)]
pub struct GptHeader {
    pub my_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub partition_entry_lba: u64,
    pub num_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub header_crc32: u32,
    pub partition_entry_array_crc32: u32,
    pub header_size: u32,
}

/// A decoded GPT partition entry (spec §3 "GPT Entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptEntry {
    pub partition_type_guid: Guid,
    pub unique_partition_guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name_utf16le: [u8; 72],
}

impl GptEntry {
    pub const UNUSED: GptEntry = GptEntry {
        partition_type_guid: Guid([0; 16]),
        unique_partition_guid: Guid([0; 16]),
        first_lba: 0,
        last_lba: 0,
        attributes: 0,
        name_utf16le: [0; 72],
    };

    pub fn is_unused(&self) -> bool {
        self.partition_type_guid.0 == [0; 16]
    }

    fn decode(raw: &[u8]) -> GptEntry {
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&raw[0..16]);
        let mut unique_guid = [0u8; 16];
        unique_guid.copy_from_slice(&raw[16..32]);
        let mut name = [0u8; 72];
        name.copy_from_slice(&raw[56..128]);
        GptEntry {
            partition_type_guid: Guid(type_guid),
            unique_partition_guid: Guid(unique_guid),
            first_lba: read_num_bytes!(u64, 8, &raw[32..40]),
            last_lba: read_num_bytes!(u64, 8, &raw[40..48]),
            attributes: read_num_bytes!(u64, 8, &raw[48..56]),
            name_utf16le: name,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(&self.partition_type_guid.0);
        out[16..32].copy_from_slice(&self.unique_partition_guid.0);
        write_num_bytes!(u64, 8, self.first_lba, &mut out[32..40]);
        write_num_bytes!(u64, 8, self.last_lba, &mut out[40..48]);
        write_num_bytes!(u64, 8, self.attributes, &mut out[48..56]);
        out[56..128].copy_from_slice(&self.name_utf16le);
    }
}

fn decode_header(raw: &[u8], my_sector: u64) -> Result<GptHeader> {
    let signature = read_num_bytes!(u64, 8, &raw[0..8]);
    if signature != SIGNATURE {
        return Err(Error::Gpt(GptError::BadSignature));
    }
    let revision = read_num_bytes!(u32, 4, &raw[8..12]);
    if revision != REVISION {
        return Err(Error::Gpt(GptError::BadRevision(revision)));
    }
    let header_size = read_num_bytes!(u32, 4, &raw[12..16]);
    if header_size < MIN_HEADER_SIZE || (header_size as usize) > raw.len() {
        return Err(Error::Gpt(GptError::BadHeaderSize(header_size)));
    }
    let header_crc32 = read_num_bytes!(u32, 4, &raw[16..20]);
    let my_lba = read_num_bytes!(u64, 8, &raw[24..32]);
    if my_lba != my_sector {
        return Err(Error::Gpt(GptError::MyLbaMismatch {
            expected: my_sector,
            found: my_lba,
        }));
    }
    let backup_lba = read_num_bytes!(u64, 8, &raw[32..40]);
    let first_usable_lba = read_num_bytes!(u64, 8, &raw[40..48]);
    let last_usable_lba = read_num_bytes!(u64, 8, &raw[48..56]);
    let mut disk_guid = [0u8; 16];
    disk_guid.copy_from_slice(&raw[56..72]);
    let partition_entry_lba = read_num_bytes!(u64, 8, &raw[72..80]);
    let num_partition_entries = read_num_bytes!(u32, 4, &raw[80..84]);
    let size_of_partition_entry = read_num_bytes!(u32, 4, &raw[84..88]);
    let partition_entry_array_crc32 = read_num_bytes!(u32, 4, &raw[88..92]);

    Ok(GptHeader {
        my_lba,
        backup_lba,
        first_usable_lba,
        last_usable_lba,
        disk_guid: Guid(disk_guid),
        partition_entry_lba,
        num_partition_entries,
        size_of_partition_entry,
        header_crc32,
        partition_entry_array_crc32,
        header_size,
    })
}

fn encode_header(h: &GptHeader, out: &mut [u8]) {
    out[0..8].copy_from_slice(&SIGNATURE.to_le_bytes());
    write_num_bytes!(u32, 4, REVISION, &mut out[8..12]);
    write_num_bytes!(u32, 4, h.header_size, &mut out[12..16]);
    write_num_bytes!(u32, 4, h.header_crc32, &mut out[16..20]);
    out[20..24].copy_from_slice(&[0, 0, 0, 0]); // reserved
    write_num_bytes!(u64, 8, h.my_lba, &mut out[24..32]);
    write_num_bytes!(u64, 8, h.backup_lba, &mut out[32..40]);
    write_num_bytes!(u64, 8, h.first_usable_lba, &mut out[40..48]);
    write_num_bytes!(u64, 8, h.last_usable_lba, &mut out[48..56]);
    out[56..72].copy_from_slice(&h.disk_guid.0);
    write_num_bytes!(u64, 8, h.partition_entry_lba, &mut out[72..80]);
    write_num_bytes!(u32, 4, h.num_partition_entries, &mut out[80..84]);
    write_num_bytes!(u32, 4, h.size_of_partition_entry, &mut out[84..88]);
    write_num_bytes!(u32, 4, h.partition_entry_array_crc32, &mut out[88..92]);
}

/// CRC32 of the header with the CRC field zeroed, over exactly
/// `header_size` bytes (spec §4.2.3).
fn header_crc32(raw_header: &[u8], header_size: u32) -> u32 {
    let mut scratch = raw_header[..header_size as usize].to_vec();
    scratch[16..20].fill(0);
    crc32fast::hash(&scratch)
}

fn entry_array_crc32(entries_raw: &[u8], count: u32, entry_size: u32) -> u32 {
    let n = (count as usize) * (entry_size as usize);
    crc32fast::hash(&entries_raw[..n])
}

/// A fully validated GPT: the header that verified (primary preferred,
/// spec §4.2.3) plus its decoded entry table.
#[derive(Debug, Clone)]
pub struct Gpt {
    pub header: GptHeader,
    pub entries: Vec<GptEntry>,
    pub used_backup: bool,
}

struct CandidateRead {
    raw_header: Vec<u8>,
    header: Result<GptHeader>,
}

fn read_candidate<D: ReadAt + WriteAt>(
    io: &mut BlockIo<D>,
    lba: u64,
) -> Result<CandidateRead> {
    let h = io.acquire(lba, SectorType::Management)?;
    let raw_header = h.bytes().to_vec();
    let header = decode_header(&raw_header, lba);
    Ok(CandidateRead { raw_header, header })
}

fn verify_candidate<D: ReadAt + WriteAt>(
    io: &mut BlockIo<D>,
    candidate: &CandidateRead,
    backup_lba: u64,
    is_primary: bool,
) -> Result<GptHeader> {
    let header = match &candidate.header {
        Ok(h) => h.clone(),
        Err(e) => return Err(clone_gpt_error(e)),
    };

    if is_primary {
        if header.backup_lba != backup_lba {
            return Err(Error::Gpt(GptError::MyLbaMismatch {
                expected: backup_lba,
                found: header.backup_lba,
            }));
        }
        if header.first_usable_lba <= header.partition_entry_lba {
            return Err(Error::Gpt(GptError::UsableRangeInverted));
        }
    } else {
        if header.first_usable_lba >= header.partition_entry_lba {
            return Err(Error::Gpt(GptError::UsableRangeInverted));
        }
    }

    let entry_size = header.size_of_partition_entry;
    if entry_size == 0 || (entry_size as usize) > io.bytes_per_sector() {
        return Err(Error::Gpt(GptError::BadEntrySize(entry_size)));
    }
    let max_entries = (io.bytes_per_sector() as u32 / entry_size).saturating_mul(4096);
    if header.num_partition_entries > max_entries {
        return Err(Error::Gpt(GptError::EntryCountTooLarge(header.num_partition_entries)));
    }

    let computed_header_crc = header_crc32(&candidate.raw_header, header.header_size);
    if computed_header_crc != header.header_crc32 {
        return Err(Error::Gpt(GptError::HeaderCrcMismatch {
            expected: header.header_crc32,
            computed: computed_header_crc,
        }));
    }

    let entries_raw = read_entry_array_raw(io, header.partition_entry_lba, header.num_partition_entries, entry_size)?;
    let computed_entries_crc = entry_array_crc32(&entries_raw, header.num_partition_entries, entry_size);
    if computed_entries_crc != header.partition_entry_array_crc32 {
        return Err(Error::Gpt(GptError::EntryArrayCrcMismatch {
            expected: header.partition_entry_array_crc32,
            computed: computed_entries_crc,
        }));
    }

    Ok(header)
}

fn clone_gpt_error(e: &Error) -> Error {
    match e {
        Error::Gpt(g) => Error::Gpt(match g {
            GptError::NoProtectiveMbr => GptError::NoProtectiveMbr,
            GptError::BadSignature => GptError::BadSignature,
            GptError::BadRevision(r) => GptError::BadRevision(*r),
            GptError::BadHeaderSize(s) => GptError::BadHeaderSize(*s),
            GptError::MyLbaMismatch { expected, found } => GptError::MyLbaMismatch {
                expected: *expected,
                found: *found,
            },
            GptError::HeaderCrcMismatch { expected, computed } => GptError::HeaderCrcMismatch {
                expected: *expected,
                computed: *computed,
            },
            GptError::EntryArrayCrcMismatch { expected, computed } => GptError::EntryArrayCrcMismatch {
                expected: *expected,
                computed: *computed,
            },
            GptError::EntryCountTooLarge(n) => GptError::EntryCountTooLarge(*n),
            GptError::BadEntrySize(n) => GptError::BadEntrySize(*n),
            GptError::UsableRangeInverted => GptError::UsableRangeInverted,
            GptError::PrimaryAndBackupInvalid => GptError::PrimaryAndBackupInvalid,
        }),
        _ => Error::Gpt(GptError::PrimaryAndBackupInvalid),
    }
}

fn read_entry_array_raw<D: ReadAt + WriteAt>(
    io: &mut BlockIo<D>,
    entry_array_lba: u64,
    count: u32,
    entry_size: u32,
) -> Result<Vec<u8>> {
    let total_bytes = count as u64 * entry_size as u64;
    let bps = io.bytes_per_sector() as u64;
    let sectors = total_bytes.div_ceil(bps);
    let mut raw = Vec::with_capacity((sectors * bps) as usize);
    for i in 0..sectors {
        let h = io.acquire(entry_array_lba + i, SectorType::Management)?;
        raw.extend_from_slice(h.bytes());
    }
    Ok(raw)
}

/// Read and validate the GPT: primary preferred, falling back to backup
/// (spec §4.2.3). `device_last_lba` is the last addressable sector of the
/// device (where the backup header lives).
pub fn read<D: ReadAt + WriteAt>(io: &mut BlockIo<D>, device_last_lba: u64) -> Result<Gpt> {
    let mbr = Mbr::read(io)?;
    if !mbr.is_protective() {
        return Err(Error::Gpt(GptError::NoProtectiveMbr));
    }

    let primary = read_candidate(io, 1)?;
    if let Ok(header) = verify_candidate(io, &primary, device_last_lba, true) {
        let entries = decode_entries(io, &header)?;
        return Ok(Gpt {
            header,
            entries,
            used_backup: false,
        });
    }
    log::warn!("primary GPT header at LBA 1 failed validation, trying backup");

    let backup = read_candidate(io, device_last_lba)?;
    if let Ok(header) = verify_candidate(io, &backup, 1, false) {
        let entries = decode_entries(io, &header)?;
        return Ok(Gpt {
            header,
            entries,
            used_backup: true,
        });
    }
    log::error!("both primary and backup GPT headers failed validation");
    Err(Error::Gpt(GptError::PrimaryAndBackupInvalid))
}

fn decode_entries<D: ReadAt + WriteAt>(io: &mut BlockIo<D>, header: &GptHeader) -> Result<Vec<GptEntry>> {
    let raw = read_entry_array_raw(io, header.partition_entry_lba, header.num_partition_entries, header.size_of_partition_entry)?;
    let entry_size = header.size_of_partition_entry as usize;
    Ok((0..header.num_partition_entries as usize)
        .map(|i| GptEntry::decode(&raw[i * entry_size..(i + 1) * entry_size]))
        .collect())
}

/// One partition creation request; `start_sector == 0` or `num_sectors ==
/// 0` mean "auto" per spec §4.2.4.
#[derive(Debug, Clone, Copy)]
pub struct PartitionSpec {
    pub start_sector: u64,
    pub num_sectors: u64,
    pub partition_type_guid: Guid,
    pub unique_partition_guid: Guid,
}

/// Resolve a list of [`PartitionSpec`]s against real start/size values,
/// applying the "auto", "hole", and "claim the rest" rules from spec
/// §4.2.4.
///
/// `start_sector == 0` means "auto": first-usable for the first non-hole
/// entry, or the sector following the previous partition otherwise.
/// `num_sectors == 0` on the *last* entry means "claim all remaining
/// space". `num_sectors == 0` on any other entry is a deliberate hole
/// (spec §8 scenario S4 is titled "GPT creation with holes" and supplies
/// exactly this shape): the slot is left unused and does not advance the
/// layout cursor. See DESIGN.md for why this reading was chosen over
/// treating a non-last zero size as an error.
fn resolve_layout(
    specs: &[PartitionSpec],
    first_usable_lba: u64,
    last_usable_lba: u64,
) -> Result<Vec<Option<(u64, u64)>>> {
    let mut out = Vec::with_capacity(specs.len());
    let mut cursor = first_usable_lba;
    let last_index = specs.len().saturating_sub(1);
    for (i, spec) in specs.iter().enumerate() {
        let is_last = i == last_index;
        if spec.num_sectors == 0 && !is_last {
            out.push(None);
            continue;
        }
        let start = if spec.start_sector == 0 { cursor } else { spec.start_sector };
        let len = if spec.num_sectors == 0 {
            (last_usable_lba + 1).saturating_sub(start)
        } else {
            spec.num_sectors
        };
        if start < cursor {
            return Err(Error::PartitionParam(PartitionParamError::Overlap { a_end: cursor, b_start: start }));
        }
        let end = start.checked_add(len).ok_or(Error::PartitionParam(PartitionParamError::Overflow {
            start,
            len,
            device_sectors: last_usable_lba + 1,
        }))?;
        if len > 0 && end - 1 > last_usable_lba {
            return Err(Error::PartitionParam(PartitionParamError::Overflow {
                start,
                len,
                device_sectors: last_usable_lba + 1,
            }));
        }
        out.push(Some((start, len)));
        cursor = end;
    }
    Ok(out)
}

/// Create a fresh GPT: protective MBR, primary header + entry array at
/// LBA 1/2, backup entry array + header at the end of the device (spec
/// §4.2.4).
pub fn create<D: ReadAt + WriteAt>(
    io: &mut BlockIo<D>,
    device_total_sectors: u64,
    disk_guid: Guid,
    specs: &[PartitionSpec],
) -> Result<()> {
    let entry_size = DEFAULT_ENTRY_SIZE;
    let bps = io.bytes_per_sector() as u64;
    let entries_per_sector = bps / entry_size as u64;
    let max_entries_default = 128u32;
    let entry_array_sectors = (max_entries_default as u64).div_ceil(entries_per_sector);

    let last_lba = device_total_sectors - 1;
    let primary_entry_array_lba = 2u64;
    let first_usable_lba = primary_entry_array_lba + entry_array_sectors;
    let backup_header_lba = last_lba;
    let backup_entry_array_lba = backup_header_lba - entry_array_sectors;
    let last_usable_lba = backup_entry_array_lba - 1;

    if specs.len() as u32 > max_entries_default {
        return Err(Error::PartitionParam(PartitionParamError::TooManyPartitions {
            requested: specs.len(),
            max: max_entries_default as usize,
        }));
    }

    let layout = resolve_layout(specs, first_usable_lba, last_usable_lba)?;

    let mut entries_raw = vec![0u8; max_entries_default as usize * entry_size as usize];
    for (i, (spec, slot)) in specs.iter().zip(layout.iter()).enumerate() {
        let Some((start, len)) = *slot else {
            continue;
        };
        if len == 0 {
            continue;
        }
        let entry = GptEntry {
            partition_type_guid: spec.partition_type_guid,
            unique_partition_guid: spec.unique_partition_guid,
            first_lba: start,
            last_lba: start + len - 1,
            attributes: 0,
            name_utf16le: [0; 72],
        };
        entry.encode(&mut entries_raw[i * entry_size as usize..(i + 1) * entry_size as usize]);
    }

    // Protective MBR: one slot, type 0xEE, start 1, size min(total-1, u32::MAX).
    let mut mbr_entries = [MbrEntry::EMPTY; 4];
    mbr_entries[0] = MbrEntry {
        active: false,
        chs_start: (0, 0, 2),
        partition_type: PROTECTIVE_MBR_TYPE,
        chs_end: (0xFFFF, 0xFF, 0xFF),
        start_lba: 1,
        num_sectors: (device_total_sectors - 1).min(u32::MAX as u64) as u32,
    };
    Mbr::write(io, &mbr_entries)?;

    write_entry_array(io, primary_entry_array_lba, &entries_raw)?;
    write_entry_array(io, backup_entry_array_lba, &entries_raw)?;

    let entries_crc = crc32fast::hash(&entries_raw);

    let mut primary = GptHeader {
        my_lba: 1,
        backup_lba: backup_header_lba,
        first_usable_lba,
        last_usable_lba,
        disk_guid,
        partition_entry_lba: primary_entry_array_lba,
        num_partition_entries: max_entries_default,
        size_of_partition_entry: entry_size,
        header_crc32: 0,
        partition_entry_array_crc32: entries_crc,
        header_size: MIN_HEADER_SIZE,
    };
    write_header(io, &mut primary)?;

    let mut backup = GptHeader {
        my_lba: backup_header_lba,
        backup_lba: 1,
        partition_entry_lba: backup_entry_array_lba,
        ..primary.clone()
    };
    backup.header_crc32 = 0;
    write_header(io, &mut backup)?;

    Ok(())
}

fn write_entry_array<D: ReadAt + WriteAt>(io: &mut BlockIo<D>, lba: u64, raw: &[u8]) -> Result<()> {
    let bps = io.bytes_per_sector();
    for (i, chunk) in raw.chunks(bps).enumerate() {
        let mut h = io.acquire_uninit(lba + i as u64, SectorType::Management);
        h.bytes_mut()[..chunk.len()].copy_from_slice(chunk);
        h.mark_dirty();
        h.release()?;
    }
    Ok(())
}

fn write_header<D: ReadAt + WriteAt>(io: &mut BlockIo<D>, header: &mut GptHeader) -> Result<()> {
    let bps = io.bytes_per_sector();
    let mut raw = vec![0u8; bps];
    encode_header(header, &mut raw[..header.header_size as usize]);
    header.header_crc32 = header_crc32(&raw, header.header_size);
    encode_header(header, &mut raw[..header.header_size as usize]);

    let mut h = io.acquire_uninit(header.my_lba, SectorType::Management);
    h.bytes_mut().copy_from_slice(&raw);
    h.mark_dirty();
    h.release()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::BlockIo;

    struct MemDevice {
        data: Vec<u8>,
    }

    impl MemDevice {
        fn new(sectors: u64, bps: usize) -> Self {
            MemDevice {
                data: vec![0u8; sectors as usize * bps],
            }
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

    #[test]
    fn create_then_read_roundtrips_and_crc_validates() {
        const TOTAL: u64 = 1_048_576;
        let dev = MemDevice::new(TOTAL, 512);
        let mut io = BlockIo::new(dev, 512);

        let specs = [
            PartitionSpec {
                start_sector: 0,
                num_sectors: 0,
                partition_type_guid: Guid([1; 16]),
                unique_partition_guid: Guid([2; 16]),
            },
            PartitionSpec {
                start_sector: 0,
                num_sectors: 100_000,
                partition_type_guid: Guid([3; 16]),
                unique_partition_guid: Guid([4; 16]),
            },
            PartitionSpec {
                start_sector: 0,
                num_sectors: 0,
                partition_type_guid: Guid([5; 16]),
                unique_partition_guid: Guid([6; 16]),
            },
        ];

        create(&mut io, TOTAL, Guid([9; 16]), &specs).unwrap();
        let gpt = read(&mut io, TOTAL - 1).unwrap();
        assert!(!gpt.used_backup);
        assert_eq!(gpt.header.backup_lba, TOTAL - 1);

        // Slot 0 was a hole (num_sectors == 0, not last): unused, zeroed.
        assert!(gpt.entries[0].is_unused());
        // Slot 1: the requested 100_000-sector partition at first-usable.
        assert!(!gpt.entries[1].is_unused());
        assert_eq!(gpt.entries[1].first_lba, gpt.header.first_usable_lba);
        assert_eq!(gpt.entries[1].last_lba - gpt.entries[1].first_lba + 1, 100_000);
        // Slot 2: last entry, num_sectors == 0 -> claims the remainder.
        assert!(!gpt.entries[2].is_unused());
        assert_eq!(gpt.entries[2].first_lba, gpt.entries[1].last_lba + 1);
        assert_eq!(gpt.entries[2].last_lba, gpt.header.last_usable_lba);
        // The other 125 slots are untouched.
        assert!(gpt.entries[3..].iter().all(|e| e.is_unused()));
    }

    #[test]
    fn resolve_layout_treats_non_last_zero_as_hole() {
        let specs = [
            PartitionSpec {
                start_sector: 0,
                num_sectors: 0,
                partition_type_guid: Guid::default(),
                unique_partition_guid: Guid::default(),
            },
            PartitionSpec {
                start_sector: 0,
                num_sectors: 10,
                partition_type_guid: Guid::default(),
                unique_partition_guid: Guid::default(),
            },
        ];
        let layout = resolve_layout(&specs, 34, 1000).unwrap();
        assert_eq!(layout[0], None);
        assert_eq!(layout[1], Some((34, 10)));
    }
}
