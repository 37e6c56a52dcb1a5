//! Crate-wide error taxonomy (spec §7).
//!
//! One enum per layer, `Debug`-derived the way the teacher's
//! `BootSectorInitError`/`BootSectorInitIoError` are, aggregated into a
//! single `Error` with `Display`/`std::error::Error` impls (the teacher
//! never needed these since it has no caller-facing release; this crate
//! does, so it follows the pack's `MosesError`/`BlockError` convention
//! instead of staying `Debug`-only).

use std::fmt;

/// Malformed MBR sector.
#[derive(Debug)]
pub enum MbrError {
    NotPartitioned,
    LooksLikeBpb,
}

/// Malformed GPT header or entry table.
#[derive(Debug)]
pub enum GptError {
    NoProtectiveMbr,
    BadSignature,
    BadRevision(u32),
    BadHeaderSize(u32),
    MyLbaMismatch { expected: u64, found: u64 },
    HeaderCrcMismatch { expected: u32, computed: u32 },
    EntryArrayCrcMismatch { expected: u32, computed: u32 },
    EntryCountTooLarge(u32),
    BadEntrySize(u32),
    UsableRangeInverted,
    PrimaryAndBackupInvalid,
}

/// Invalid parameters passed to a partition-creation call.
#[derive(Debug)]
pub enum PartitionParamError {
    Overlap { a_end: u64, b_start: u64 },
    Overflow { start: u64, len: u64, device_sectors: u64 },
    TooManyPartitions { requested: usize, max: usize },
}

/// Malformed BPB / unsupported FAT variant.
#[derive(Debug)]
pub enum BpbError {
    BadBootSignature([u8; 2]),
    BytesPerSectorNotPowerOfTwo(u16),
    SectorsPerClusterNotPowerOfTwo(u8),
    ZeroFats,
    UnrecognizedFatType,
}

/// A FAT-table-level failure.
#[derive(Debug)]
pub enum FatError {
    ClusterOutOfRange(u32),
    VolumeFull,
}

/// A long-file-name encode/decode failure.
#[derive(Debug)]
pub enum LfnError {
    InvalidChar(char),
    AllDots,
    TooLong(usize),
    NoFreeShortName,
    DiskFull,
    EntryNotFound,
}

/// Reasons `CheckDisk` stopped a bounded-work slice without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDiskStop {
    /// A repairable problem was found and handled; caller should re-invoke.
    Retry,
    /// Recursion depth cap reached; not an error, a bounded-work signal.
    MaxRecurse,
    /// The error callback requested `Abort`.
    Abort,
    /// The external abort flag was observed set.
    UserAbort,
}

/// Crate-wide error.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    ReadFailure(std::io::Error),
    WriteFailure(std::io::Error),
    Mbr(MbrError),
    Gpt(GptError),
    PartitionParam(PartitionParamError),
    Bpb(BpbError),
    Fat(FatError),
    Lfn(LfnError),
    CheckDisk(CheckDiskStop),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "underlying device I/O error: {e}"),
            Error::ReadFailure(e) => write!(f, "sector read failed: {e}"),
            Error::WriteFailure(e) => write!(f, "sector write failed: {e}"),
            Error::Mbr(MbrError::NotPartitioned) => write!(f, "sector 0 is not a valid MBR"),
            Error::Mbr(MbrError::LooksLikeBpb) => {
                write!(f, "sector 0 looks like a BPB, not a partition table")
            }
            Error::Gpt(e) => write!(f, "invalid GPT structure: {e:?}"),
            Error::PartitionParam(e) => write!(f, "invalid partition parameters: {e:?}"),
            Error::Bpb(e) => write!(f, "invalid BPB: {e:?}"),
            Error::Fat(FatError::ClusterOutOfRange(c)) => {
                write!(f, "cluster {c} is out of range for this volume")
            }
            Error::Fat(FatError::VolumeFull) => write!(f, "no free clusters remain"),
            Error::Lfn(e) => write!(f, "invalid long file name: {e:?}"),
            Error::CheckDisk(stop) => write!(f, "check disk stopped: {stop:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::ReadFailure(e) => Some(e),
            Error::WriteFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<MbrError> for Error {
    fn from(e: MbrError) -> Self {
        Error::Mbr(e)
    }
}
impl From<GptError> for Error {
    fn from(e: GptError) -> Self {
        Error::Gpt(e)
    }
}
impl From<PartitionParamError> for Error {
    fn from(e: PartitionParamError) -> Self {
        Error::PartitionParam(e)
    }
}
impl From<BpbError> for Error {
    fn from(e: BpbError) -> Self {
        Error::Bpb(e)
    }
}
impl From<FatError> for Error {
    fn from(e: FatError) -> Self {
        Error::Fat(e)
    }
}
impl From<LfnError> for Error {
    fn from(e: LfnError) -> Self {
        Error::Lfn(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
