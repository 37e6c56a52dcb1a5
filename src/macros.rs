//! Little-endian field accessors over fixed-size on-disk buffers.
//!
//! The teacher crate's `read_num_bytes!` macro, generalized with a sibling
//! `write_num_bytes!` since this crate (unlike the read-only teacher) needs
//! to emit BPB/FAT/MBR/GPT/directory-entry fields back to disk.

macro_rules! read_num_bytes {
    ($ty:ty, $size:expr, $src:expr) => {{
        assert!($size == ::core::mem::size_of::<$ty>());
        assert!($size <= $src.len());
        let mut data: $ty = 0;
        unsafe {
            ::core::ptr::copy_nonoverlapping($src.as_ptr(), &mut data as *mut $ty as *mut u8, $size);
        }
        data.to_le()
    }};
}

macro_rules! write_num_bytes {
    ($ty:ty, $size:expr, $n:expr, $dst:expr) => {{
        assert!($size == ::core::mem::size_of::<$ty>());
        assert!($size <= $dst.len());
        let data = <$ty>::to_le($n);
        unsafe {
            ::core::ptr::copy_nonoverlapping(&data as *const $ty as *const u8, $dst.as_mut_ptr(), $size);
        }
    }};
}

pub(crate) use read_num_bytes;
pub(crate) use write_num_bytes;
