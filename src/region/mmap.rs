use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use memmap2::MmapMut;
use crate::region::Region;

/// Region backed by a shared, memory-mapped file.
///
/// Every process that maps the same file sees the same bytes, generally at a
/// different base address. Writes reach the file through the page cache;
/// [`Region::flush`] forces them out.
pub struct MmapRegion {
    mmap: MmapMut,
    path: PathBuf,
}

impl Region for MmapRegion {
    fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

impl MmapRegion {
    /// Path of the backing file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

pub struct MmapRegionBuilder {
    size: Option<usize>,
    truncate: bool,
    path: PathBuf,
}

impl MmapRegionBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            size: None,
            truncate: false,
            path: path.into(),
        }
    }

    /// Set the region size in bytes.
    ///
    /// Required when creating the file. When attaching to an existing file
    /// without truncation the size must match the file length.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Discard existing file contents (default: false)
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn build(self) -> Result<MmapRegion, io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(self.truncate)
            .open(&self.path)?;

        let current = file.metadata()?.len() as usize;
        let size = match self.size {
            Some(size) if current == 0 || self.truncate => {
                file.set_len(size as u64)?;
                size
            }
            Some(size) if size != current => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "region file {} is {} bytes, expected {}",
                        self.path.display(),
                        current,
                        size
                    ),
                ));
            }
            Some(size) => size,
            None if current > 0 => current,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "size is required to create a region file",
                ));
            }
        };

        debug_assert!(size > 0);

        // SAFETY: the mapping is only touched through &self/&mut self. Other
        // processes mapping the same file must follow the single-writer
        // discipline documented on Pond.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(MmapRegion {
            mmap,
            path: self.path,
        })
    }
}
