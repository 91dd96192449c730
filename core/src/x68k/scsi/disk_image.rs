//! Backing stores for SCSI disk images

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
#[cfg(feature = "mmap")]
use memmap2::MmapMut;

/// Byte-addressed backing store of a block device.
///
/// Every access may fail; callers turn failures into SCSI sense data.
pub trait DiskImage: Send {
    fn byte_len(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn image_path(&self) -> Option<&Path>;

    /// Pushes outstanding writes to the host.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn check_bounds(len: u64, offset: u64, count: usize) -> Result<()> {
    let end = offset.checked_add(count as u64);
    match end {
        Some(end) if end <= len => Ok(()),
        _ => bail!(
            "Access at {:#X} + {} beyond end of image ({} bytes)",
            offset,
            count,
            len
        ),
    }
}

/// Disk image backed by a file on the host
pub struct FileDiskImage {
    /// Disk contents
    #[cfg(feature = "mmap")]
    disk: MmapMut,

    #[cfg(not(feature = "mmap"))]
    file: std::fs::File,

    len: u64,

    /// Path where the image resides
    path: PathBuf,
}

impl FileDiskImage {
    /// Opens an image for reading and writing.
    ///
    /// With the 'mmap' feature, the file is locked and memory mapped so
    /// writes go back to disk at the discretion of the operating system.
    pub fn open(filename: &Path) -> Result<Self> {
        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }

        #[cfg(feature = "mmap")]
        {
            let disk = Self::mmap_file(filename)?;
            Ok(Self {
                len: disk.len() as u64,
                disk,
                path: filename.to_path_buf(),
            })
        }

        #[cfg(not(feature = "mmap"))]
        {
            use std::fs::OpenOptions;

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(filename)
                .with_context(|| format!("Failed to open {}", filename.display()))?;
            let len = file
                .metadata()
                .with_context(|| format!("Failed to stat {}", filename.display()))?
                .len();
            Ok(Self {
                file,
                len,
                path: filename.to_path_buf(),
            })
        }
    }

    #[cfg(feature = "mmap")]
    fn mmap_file(filename: &Path) -> Result<MmapMut> {
        use fs2::FileExt;
        use std::fs::OpenOptions;

        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(filename)
            .with_context(|| format!("Failed to open {}", filename.display()))?;
        let file_size = usize::try_from(f.metadata()?.len())?;
        f.try_lock_exclusive()
            .with_context(|| format!("Failed to lock {}", filename.display()))?;
        let mmapped = unsafe {
            use memmap2::MmapOptions;

            MmapOptions::new()
                .len(file_size)
                .map_mut(&f)
                .with_context(|| format!("Failed to mmap file {}", filename.display()))?
        };
        Ok(mmapped)
    }
}

impl DiskImage for FileDiskImage {
    fn byte_len(&self) -> u64 {
        self.len
    }

    #[cfg(feature = "mmap")]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.len, offset, buf.len())?;
        let start = usize::try_from(offset)?;
        buf.copy_from_slice(&self.disk[start..(start + buf.len())]);
        Ok(())
    }

    #[cfg(not(feature = "mmap"))]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::io::{Read, Seek, SeekFrom};

        check_bounds(self.len, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(buf)
            .with_context(|| format!("Read error at {:#X} in {}", offset, self.path.display()))
    }

    #[cfg(feature = "mmap")]
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(self.len, offset, data.len())?;
        let start = usize::try_from(offset)?;
        self.disk[start..(start + data.len())].copy_from_slice(data);
        Ok(())
    }

    #[cfg(not(feature = "mmap"))]
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        check_bounds(self.len, offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(data)
            .with_context(|| format!("Write error at {:#X} in {}", offset, self.path.display()))
    }

    fn image_path(&self) -> Option<&Path> {
        Some(self.path.as_ref())
    }

    #[cfg(feature = "mmap")]
    fn flush(&mut self) -> Result<()> {
        Ok(self.disk.flush()?)
    }

    #[cfg(not(feature = "mmap"))]
    fn flush(&mut self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }
}

/// Disk image held in host memory
#[derive(Debug, Clone, Default)]
pub struct MemoryDiskImage {
    data: Vec<u8>,
}

impl MemoryDiskImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl DiskImage for MemoryDiskImage {
    fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.byte_len(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..(start + buf.len())]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_bounds(self.byte_len(), offset, data.len())?;
        let start = offset as usize;
        self.data[start..(start + data.len())].copy_from_slice(data);
        Ok(())
    }

    fn image_path(&self) -> Option<&Path> {
        None
    }
}
