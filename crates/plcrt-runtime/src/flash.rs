//! Flash partition abstraction for module storage.
//!
//! The loader's execute-in-place path and the flash programming
//! commands go through [`FlashRegion`]. Real hardware partitions are an
//! external collaborator; the crate ships an in-memory region for tests
//! and a file-backed region for the CLI.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::RuntimeError;

/// One erasable, programmable storage partition.
///
/// Methods take `&self` so regions can be shared behind an `Arc`; the
/// loader keeps an execute-in-place module's region alive for the whole
/// binding.
pub trait FlashRegion: Send + Sync {
    /// Partition size in bytes.
    fn size(&self) -> usize;
    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), RuntimeError>;
    /// Erase the whole partition to `0xFF`.
    fn erase(&self) -> Result<(), RuntimeError>;
    /// Program bytes starting at `offset`. The range must be erased.
    fn program(&self, offset: usize, bytes: &[u8]) -> Result<(), RuntimeError>;
}

fn check_range(size: usize, offset: usize, len: usize) -> Result<(), RuntimeError> {
    if offset.checked_add(len).is_none_or(|end| end > size) {
        return Err(RuntimeError::Flash(
            format!("range {offset}+{len} exceeds partition size {size}").into(),
        ));
    }
    Ok(())
}

/// In-memory flash region.
#[derive(Debug)]
pub struct MemFlash {
    cells: Mutex<Vec<u8>>,
}

impl MemFlash {
    /// A blank (erased) region of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            cells: Mutex::new(vec![0xFF; size]),
        }
    }

    /// Build a region pre-programmed with `image` at offset 0.
    #[must_use]
    pub fn with_image(size: usize, image: &[u8]) -> Self {
        let region = Self::new(size);
        {
            let mut cells = region.cells.lock().expect("mem flash poisoned");
            let len = image.len().min(size);
            cells[..len].copy_from_slice(&image[..len]);
        }
        region
    }
}

impl FlashRegion for MemFlash {
    fn size(&self) -> usize {
        self.cells.lock().expect("mem flash poisoned").len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), RuntimeError> {
        let cells = self.cells.lock().expect("mem flash poisoned");
        check_range(cells.len(), offset, buf.len())?;
        buf.copy_from_slice(&cells[offset..offset + buf.len()]);
        Ok(())
    }

    fn erase(&self) -> Result<(), RuntimeError> {
        self.cells.lock().expect("mem flash poisoned").fill(0xFF);
        Ok(())
    }

    fn program(&self, offset: usize, bytes: &[u8]) -> Result<(), RuntimeError> {
        let mut cells = self.cells.lock().expect("mem flash poisoned");
        check_range(cells.len(), offset, bytes.len())?;
        cells[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// File-backed flash region used by the CLI flash commands.
pub struct FileFlash {
    file: Mutex<File>,
    size: usize,
}

impl FileFlash {
    /// Open or create a partition file of exactly `size` bytes.
    pub fn open(path: &Path, size: usize) -> Result<Self, RuntimeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| RuntimeError::storage(&err))?;
        file.set_len(size as u64)
            .map_err(|err| RuntimeError::storage(&err))?;
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl FlashRegion for FileFlash {
    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), RuntimeError> {
        check_range(self.size, offset, buf.len())?;
        let mut file = self.file.lock().expect("flash file poisoned");
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|err| RuntimeError::storage(&err))?;
        file.read_exact(buf).map_err(|err| RuntimeError::storage(&err))
    }

    fn erase(&self) -> Result<(), RuntimeError> {
        let mut file = self.file.lock().expect("flash file poisoned");
        file.seek(SeekFrom::Start(0))
            .map_err(|err| RuntimeError::storage(&err))?;
        let blank = vec![0xFF; self.size];
        file.write_all(&blank)
            .map_err(|err| RuntimeError::storage(&err))
    }

    fn program(&self, offset: usize, bytes: &[u8]) -> Result<(), RuntimeError> {
        check_range(self.size, offset, bytes.len())?;
        let mut file = self.file.lock().expect("flash file poisoned");
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|err| RuntimeError::storage(&err))?;
        file.write_all(bytes)
            .map_err(|err| RuntimeError::storage(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_then_read_roundtrips() {
        let flash = MemFlash::new(64);
        flash.program(8, b"payload").unwrap();
        let mut buf = [0u8; 7];
        flash.read(8, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn erase_restores_blank_state() {
        let flash = MemFlash::with_image(16, b"UDLMxxxx");
        flash.erase().unwrap();
        let mut buf = [0u8; 4];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let flash = MemFlash::new(8);
        assert!(matches!(
            flash.program(6, b"toolong"),
            Err(RuntimeError::Flash(_))
        ));
        let mut buf = [0u8; 16];
        assert!(flash.read(0, &mut buf).is_err());
    }
}
