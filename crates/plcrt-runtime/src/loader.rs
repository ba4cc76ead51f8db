//! Module loading: staged files and flash execute-in-place.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;

use crate::error::RuntimeError;
use crate::flash::FlashRegion;
use crate::image::{ImageError, ImageHeader, HEADER_SIZE};
use crate::module::{LinkSource, LoadMode, LoadedModule, ModuleLinker};
use crate::resolver::SymbolResolver;

/// File read granularity while staging.
const READ_BLOCK_SIZE: usize = 1024;

/// Flash programming granularity.
const FLASH_CHUNK_SIZE: usize = 128;

/// Where a module image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// A sealed image file, copied through the staging buffer.
    Staged(PathBuf),
    /// The flash partition, executed in place without a payload copy.
    Flash,
}

/// Binds module images from staged files or the flash partition.
///
/// The loader validates and binds; it does not track the bound module.
/// Lifecycle state (Empty/Stopped/Started) lives in the scheduler,
/// which owns the module slot.
pub struct ModuleLoader {
    staging_capacity: usize,
    linker: Arc<dyn ModuleLinker>,
    resolver: SymbolResolver,
    flash: Arc<dyn FlashRegion>,
}

impl ModuleLoader {
    /// Build a loader over the given linker, resolver and partition.
    #[must_use]
    pub fn new(
        staging_capacity: usize,
        linker: Arc<dyn ModuleLinker>,
        resolver: SymbolResolver,
        flash: Arc<dyn FlashRegion>,
    ) -> Self {
        Self {
            staging_capacity,
            linker,
            resolver,
            flash,
        }
    }

    /// Validate and bind a module image. On any failure nothing is
    /// bound and the error is returned; the caller keeps whatever was
    /// bound before.
    pub fn load(&self, source: &LoadSource) -> Result<Arc<LoadedModule>, RuntimeError> {
        let module = match source {
            LoadSource::Staged(path) => self.load_staged(path)?,
            LoadSource::Flash => self.load_flash()?,
        };
        tracing::info!(
            module = %module.name(),
            mode = ?module.mode(),
            period = ?module.cycle_period(),
            "module bound"
        );
        Ok(Arc::new(module))
    }

    fn load_staged(&self, path: &Path) -> Result<LoadedModule, RuntimeError> {
        let staging = self.stage_file(path)?;
        ImageHeader::verify(&staging)?;
        let payload = ImageHeader::payload(&staging)?;
        let image = self
            .linker
            .bind(LinkSource::Copied(payload.to_vec()), &self.resolver)?;
        LoadedModule::bind(image, LoadMode::CopyAll)
    }

    fn load_flash(&self) -> Result<LoadedModule, RuntimeError> {
        if self.flash.size() < HEADER_SIZE {
            return Err(RuntimeError::IntegrityFailure(ImageError::Truncated));
        }
        // Only the header is read; the payload stays in flash and its
        // checksum is the flash programming path's responsibility.
        let mut header = [0u8; HEADER_SIZE];
        self.flash.read(0, &mut header)?;
        ImageHeader::parse(&header)?;
        let image = self
            .linker
            .bind(LinkSource::InPlace(self.flash.clone()), &self.resolver)?;
        LoadedModule::bind(image, LoadMode::ExecuteInPlace)
    }

    /// Read a sealed image file into a fresh staging buffer, enforcing
    /// the configured capacity.
    fn stage_file(&self, path: &Path) -> Result<Vec<u8>, RuntimeError> {
        let mut file = File::open(path).map_err(|err| RuntimeError::storage(&err))?;
        let size = file
            .metadata()
            .map_err(|err| RuntimeError::storage(&err))?
            .len();
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        if size > self.staging_capacity {
            return Err(RuntimeError::ImageTooLarge {
                size,
                capacity: self.staging_capacity,
            });
        }

        let mut staging = Vec::with_capacity(size);
        let mut block = [0u8; READ_BLOCK_SIZE];
        loop {
            let read = file
                .read(&mut block)
                .map_err(|err| RuntimeError::storage(&err))?;
            if read == 0 {
                break;
            }
            if staging.len() + read > self.staging_capacity {
                return Err(RuntimeError::ImageTooLarge {
                    size: staging.len() + read,
                    capacity: self.staging_capacity,
                });
            }
            staging.extend_from_slice(&block[..read]);
        }
        Ok(staging)
    }

    /// Stream a sealed image file into the flash partition.
    pub fn flash_module(&self, path: &Path) -> Result<(), RuntimeError> {
        flash_module(self.flash.as_ref(), path)
    }

    /// Erase the flash partition.
    pub fn erase_flash(&self) -> Result<(), RuntimeError> {
        erase_flash(self.flash.as_ref())
    }
}

/// Stream a sealed image file into a flash partition.
///
/// The header is programmed first, then the payload in 128-byte chunks
/// while the CRC is accumulated; a final mismatch against the header
/// checksum fails the whole operation (the partition is left erased
/// apart from the partial write).
pub fn flash_module(flash: &dyn FlashRegion, path: &Path) -> Result<(), RuntimeError> {
    let mut file = File::open(path).map_err(|err| RuntimeError::storage(&err))?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)
        .map_err(|_| RuntimeError::IntegrityFailure(ImageError::Truncated))?;
    let parsed = ImageHeader::parse(&header)?;

    let size = file
        .metadata()
        .map_err(|err| RuntimeError::storage(&err))?
        .len();
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    if size > flash.size() {
        return Err(RuntimeError::ImageTooLarge {
            size,
            capacity: flash.size(),
        });
    }

    flash.erase()?;
    flash.program(0, &header)?;

    let mut offset = HEADER_SIZE;
    let mut hasher = Hasher::new();
    let mut chunk = [0u8; FLASH_CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut chunk)
            .map_err(|err| RuntimeError::storage(&err))?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
        flash.program(offset, &chunk[..read])?;
        offset += read;
    }

    let actual = hasher.finalize();
    if actual != parsed.checksum {
        return Err(RuntimeError::IntegrityFailure(
            ImageError::ChecksumMismatch {
                expected: parsed.checksum,
                actual,
            },
        ));
    }
    tracing::info!(bytes = offset, "module programmed to flash");
    Ok(())
}

/// Erase a flash partition.
pub fn erase_flash(flash: &dyn FlashRegion) -> Result<(), RuntimeError> {
    flash.erase()?;
    tracing::info!("flash partition erased");
    Ok(())
}
