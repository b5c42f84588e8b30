use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::debug;
use once_cell::sync::Lazy;

use crate::error::StorageResult;

/// The default directory for segment files, resolved once per process from
/// the `SEGMENT_DIRECTORY` environment variable.
static SEGMENT_DIRECTORY: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("SEGMENT_DIRECTORY")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
});

pub fn default_directory() -> &'static Path {
    &SEGMENT_DIRECTORY
}

/// One backing file per 16-bit segment id, named by the segment id. Page `i`
/// of a segment occupies bytes `[i * page_size, (i + 1) * page_size)`.
pub struct SegmentFile {
    file: File,
    offset: u64,
    page_size: usize,
}

impl SegmentFile {
    /// Open (or create) the file backing `page_id`'s segment and position it
    /// at the page. The file is extended (zero-filled) if the page lies past
    /// the current end.
    pub fn open(dir: &Path, page_id: u64, page_size: usize) -> StorageResult<Self> {
        let segment_id = (page_id >> 48) as u16;
        let page_no = page_id & ((1u64 << 48) - 1);
        let path = dir.join(format!("{}", segment_id));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let offset = page_no * page_size as u64;
        let len = file.metadata()?.len();
        if len < offset + page_size as u64 {
            file.set_len(offset + page_size as u64)?;
        }

        Ok(Self {
            file,
            offset,
            page_size,
        })
    }

    pub fn read_page(&mut self, buf: &mut [u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.seek(SeekFrom::Start(self.offset))?;
        // read_exact loops internally until the full page is transferred
        std::io::Read::read_exact(&mut self.file, buf)?;
        Ok(())
    }

    pub fn write_page(&mut self, buf: &[u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.write_all(buf)?;
        debug!("wrote page at offset {:#x}", self.offset);
        Ok(())
    }
}

/// Fixed-size keys and values, serialized little-endian into page bytes.
///
/// The tree stores keys and values in place inside pages, so both must have
/// a size known up front and an order-preserving in-memory representation.
pub trait Datum: Copy + Ord + std::fmt::Debug {
    const SIZE: usize;

    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! impl_datum {
    (for $($t:ty),+) => {
        $(
            impl Datum for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn write_to(&self, buf: &mut [u8]) {
                    buf[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8]) -> Self {
                    Self::from_le_bytes(buf[..Self::SIZE].try_into().unwrap())
                }
            }
        )*
    }
}

impl_datum!(for u8, u16, u32, u64, i8, i16, i32, i64);
