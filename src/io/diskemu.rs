use crate::io::device::{SectorDevice, SectorId, SECTOR_SIZE};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

pub struct FileDiskEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of
    /// a sector.
    fd: File,
    /// The total number of sectors available in the backing store.
    sector_count: usize,
}

/// Emulates sector-granularity disk storage in userspace using a file as the
/// backing store. This is only meant to be used for storage-layer development
/// and testing.
impl FileDiskEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl SectorDevice for FileDiskEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nsectors: usize) -> std::io::Result<Self> {
        // Return an error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        Ok(FileDiskEmulator {
            fd: file,
            sector_count: nsectors,
        })
    }

    fn read_sector(&mut self, sector: SectorId, buf: &mut [u8]) -> std::io::Result<()> {
        if sector as usize > (self.sector_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "sector out of range",
            ));
        }

        if buf.len() < SECTOR_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read sector",
            ));
        }
        self.fd
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        self.fd.read_exact(&mut buf[0..SECTOR_SIZE])?;
        Ok(())
    }

    /// This method truncates writes that exceed the sector size.
    fn write_sector(&mut self, sector: SectorId, buf: &[u8]) -> std::io::Result<()> {
        if sector as usize > (self.sector_count - 1) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "sector out of range",
            ));
        }
        self.fd
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;

        let max = if SECTOR_SIZE < buf.len() {
            SECTOR_SIZE
        } else {
            buf.len()
        };
        self.fd.write_all(&buf[0..max])?;
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileDiskEmulatorBuilder {
    fd: File,
    sector_count: usize,
    clear_medium: bool,
}

impl From<File> for FileDiskEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileDiskEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded
            // down to the nearest sector.
            sector_count: 0,
            clear_medium: true,
        }
    }
}

impl FileDiskEmulatorBuilder {
    /// Sets the number of sectors the emulated device exposes.
    pub fn with_sector_count(mut self, nsectors: usize) -> Self {
        self.sector_count = nsectors;
        self
    }

    /// Controls whether the backing file is zeroed out during build. Pass
    /// false to reopen an already-initialized disk image.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally,
    /// ownership of the file is transferred to the emulator meaning this
    /// builder can only be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileDiskEmulator> {
        debug_assert!(self.sector_count > 0);
        if self.clear_medium {
            self.zero_sectors()?;
        }
        Ok(FileDiskEmulator {
            fd: self.fd,
            sector_count: self.sector_count,
        })
    }

    fn zero_sectors(&mut self) -> std::io::Result<()> {
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" sectors, buffering each write to prevent
        // excessive syscalls.
        for _ in 0..self.sector_count {
            bfd.write_all(vec![0x00; SECTOR_SIZE].as_slice())?;
        }
        Ok(())
    }
}
