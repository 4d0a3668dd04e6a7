use std::io::Write;

use crate::alloc::Bitmap;
use crate::dir::{Directory, FileKind, DIR_ENTRIES, DIR_FILE_SIZE};
use crate::header::FileHeader;
use crate::io::{SectorDevice, SectorId, SECTOR_SIZE};

use log::{debug, info};
use thiserror::Error;

/// Known locations.
const FREE_MAP_SECTOR: SectorId = 0;
const ROOT_DIR_SECTOR: SectorId = 1;

/// The free map persists in its single reserved sector, which caps the
/// device capacity this layout can manage.
pub const MAX_DEVICE_SECTORS: usize = SECTOR_SIZE * 8;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("found no file at path")]
    DoesNotExist,
    #[error("name already bound: {0}")]
    AlreadyExists(String),
    #[error("path component is not a directory: {0}")]
    NotDirectory(String),
    #[error("not enough free sectors on the device")]
    NoSpace,
    #[error("directory has no free slot")]
    DirectoryFull,
    #[error("invalid file system sector layout")]
    InvalidBlock(#[from] std::io::Error),
}

/// The mounted storage layer: a sector device, its free map, and the root
/// directory kept resident for the lifetime of the mount.
///
/// # Layout
/// =====================================================================
/// | Free map | Root directory header | Index blocks and data sectors |
/// =====================================================================
///
/// Every operation runs on the single calling thread and assumes external
/// serialization; two concurrent mutations of the same directory or the free
/// map will lose updates.
pub struct FileSystem<D: SectorDevice> {
    dev: D,
    free_map: Bitmap,
    root_hdr: FileHeader,
    root: Directory,
}

impl<D: SectorDevice> FileSystem<D> {
    /// Initializes the layout onto owned sector storage: a fresh free map
    /// with the two reserved sectors marked, and an empty root directory
    /// backed by a newly allocated file.
    pub fn format(mut dev: D, num_sectors: usize) -> Result<Self, FsError> {
        if num_sectors > MAX_DEVICE_SECTORS {
            return Err(FsError::InvalidArgument(format!(
                "device capacity {} exceeds the {} sector maximum",
                num_sectors, MAX_DEVICE_SECTORS
            )));
        }
        let mut free_map = Bitmap::new(num_sectors);
        free_map.set(FREE_MAP_SECTOR);
        free_map.set(ROOT_DIR_SECTOR);

        let mut root_hdr = FileHeader::new();
        root_hdr.allocate(&mut dev, &mut free_map, DIR_FILE_SIZE)?;
        root_hdr.write_back(&mut dev, ROOT_DIR_SECTOR)?;

        let root = Directory::new(DIR_ENTRIES);
        root.write_back(&mut dev, &root_hdr)?;

        dev.write_sector(FREE_MAP_SECTOR, &free_map.serialize())?;
        dev.sync_disk()?;
        info!("formatted device with {} sectors", num_sectors);

        Ok(Self {
            dev,
            free_map,
            root_hdr,
            root,
        })
    }

    /// Reads the free map and the root directory back from an already
    /// formatted device.
    pub fn mount(mut dev: D, num_sectors: usize) -> Result<Self, FsError> {
        if num_sectors > MAX_DEVICE_SECTORS {
            return Err(FsError::InvalidArgument(format!(
                "device capacity {} exceeds the {} sector maximum",
                num_sectors, MAX_DEVICE_SECTORS
            )));
        }
        let mut buf = [0; SECTOR_SIZE];
        dev.read_sector(FREE_MAP_SECTOR, &mut buf)?;
        let free_map = Bitmap::parse(&buf, num_sectors);

        let root_hdr = FileHeader::fetch_from(&mut dev, ROOT_DIR_SECTOR)?;
        let mut root = Directory::new(DIR_ENTRIES);
        root.fetch_from(&mut dev, &root_hdr)?;

        Ok(Self {
            dev,
            free_map,
            root_hdr,
            root,
        })
    }

    /// Creates a file of exactly `size` bytes at `path` and returns the
    /// sector its header was written to. Files never grow, so the whole
    /// extent is reserved here.
    pub fn create(&mut self, path: &str, size: u32) -> Result<SectorId, FsError> {
        self.create_entry(path, size, FileKind::File)
    }

    /// Creates an empty subdirectory at `path`, backed by a file sized for
    /// one entry table.
    pub fn create_dir(&mut self, path: &str) -> Result<SectorId, FsError> {
        let sector = self.create_entry(path, DIR_FILE_SIZE, FileKind::Directory)?;
        let hdr = FileHeader::fetch_from(&mut self.dev, sector)?;
        Directory::new(DIR_ENTRIES).write_back(&mut self.dev, &hdr)?;
        Ok(sector)
    }

    fn create_entry(&mut self, path: &str, size: u32, kind: FileKind) -> Result<SectorId, FsError> {
        let hdr_sector = self.free_map.find_and_set().ok_or(FsError::NoSpace)?;
        let mut hdr = FileHeader::new();
        if let Err(e) = hdr.allocate(&mut self.dev, &mut self.free_map, size) {
            self.free_map.clear(hdr_sector);
            return Err(e);
        }
        if let Err(e) = self.root.add(&mut self.dev, path, hdr_sector, kind) {
            // A rejected create must leave the free map exactly as it was.
            hdr.deallocate(&mut self.dev, &mut self.free_map)?;
            self.free_map.clear(hdr_sector);
            return Err(e);
        }
        hdr.write_back(&mut self.dev, hdr_sector)?;
        self.flush()?;
        debug!("created {} ({} bytes) with header at sector {}", path, size, hdr_sector);
        Ok(hdr_sector)
    }

    /// Removes the entry at `path`, releasing its data sectors, index
    /// blocks, and header sector back to the free map.
    ///
    /// Removing a non-empty directory strands its children: their sectors
    /// stay allocated but no path reaches them anymore. Callers wanting
    /// recursive removal must walk the tree bottom-up first.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let sector = self.root.find(&mut self.dev, path)?;
        let hdr = FileHeader::fetch_from(&mut self.dev, sector)?;
        self.root.remove(&mut self.dev, path)?;
        hdr.deallocate(&mut self.dev, &mut self.free_map)?;
        self.free_map.clear(sector);
        self.flush()?;
        debug!("removed {} (header was at sector {})", path, sector);
        Ok(())
    }

    /// Sector of the header bound at `path`.
    pub fn find(&mut self, path: &str) -> Result<SectorId, FsError> {
        self.root.find(&mut self.dev, path)
    }

    /// Fetches the header bound at `path`.
    pub fn open(&mut self, path: &str) -> Result<FileHeader, FsError> {
        let sector = self.root.find(&mut self.dev, path)?;
        FileHeader::fetch_from(&mut self.dev, sector)
    }

    pub fn read_at(&mut self, path: &str, buf: &mut [u8], offset: u32) -> Result<usize, FsError> {
        let hdr = self.open(path)?;
        hdr.read_at(&mut self.dev, buf, offset)
    }

    pub fn write_at(&mut self, path: &str, buf: &[u8], offset: u32) -> Result<usize, FsError> {
        let hdr = self.open(path)?;
        hdr.write_at(&mut self.dev, buf, offset)
    }

    /// Sectors still free for allocation.
    pub fn free_sectors(&self) -> u32 {
        self.free_map.num_clear()
    }

    /// One `[slot] name kind` line per root entry.
    pub fn list<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.root.list(w)
    }

    /// The full naming tree, every subdirectory visited transitively.
    pub fn tree<W: Write>(&mut self, w: &mut W) -> Result<(), FsError> {
        self.root.recur_list(&mut self.dev, w, 0)
    }

    /// Debugging aid: every root entry's header metadata and contents.
    pub fn dump<W: Write>(&mut self, w: &mut W) -> Result<(), FsError> {
        self.root.dump(&mut self.dev, w)
    }

    /// Commits the resident root table and the free map. Called after every
    /// mutation so recoverable failures never leave half-written state
    /// behind on the next mount.
    fn flush(&mut self) -> Result<(), FsError> {
        self.root.write_back(&mut self.dev, &self.root_hdr)?;
        self.dev.write_sector(FREE_MAP_SECTOR, &self.free_map.serialize())?;
        self.dev.sync_disk()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileDiskEmulatorBuilder;

    fn fresh_fs(nsectors: usize) -> FileSystem<crate::io::FileDiskEmulator> {
        let backing = tempfile::tempfile().unwrap();
        let dev = FileDiskEmulatorBuilder::from(backing)
            .with_sector_count(nsectors)
            .build()
            .expect("could not initialize disk emulator");
        FileSystem::format(dev, nsectors).unwrap()
    }

    #[test]
    fn create_open_and_read_back() {
        let mut fs = fresh_fs(64);

        fs.create("/notes", 600).unwrap();
        let payload = b"sector storage without tears";
        fs.write_at("/notes", payload, 0).unwrap();

        let mut buf = vec![0; payload.len()];
        assert_eq!(fs.read_at("/notes", &mut buf, 0).unwrap(), payload.len());
        assert_eq!(&buf, payload);

        let hdr = fs.open("/notes").unwrap();
        assert_eq!(hdr.len(), 600);
    }

    #[test]
    fn create_in_missing_parent_fails_cleanly() {
        let mut fs = fresh_fs(64);
        let before = fs.free_sectors();

        assert!(matches!(
            fs.create("/nowhere/file", 100),
            Err(FsError::DoesNotExist)
        ));
        assert_eq!(fs.free_sectors(), before);
    }

    #[test]
    fn duplicate_create_rolls_back_its_reservations() {
        let mut fs = fresh_fs(64);

        fs.create("/twice", 100).unwrap();
        let before = fs.free_sectors();
        assert!(matches!(
            fs.create("/twice", 100),
            Err(FsError::AlreadyExists(_))
        ));
        assert_eq!(fs.free_sectors(), before);
    }

    #[test]
    fn remove_restores_every_reserved_sector() {
        let mut fs = fresh_fs(64);
        let before = fs.free_sectors();

        fs.create("/bulk", 5 * SECTOR_SIZE as u32).unwrap();
        // Five data sectors, one index block, one header sector.
        assert_eq!(fs.free_sectors(), before - 7);

        fs.remove("/bulk").unwrap();
        assert_eq!(fs.free_sectors(), before);
    }

    #[test]
    fn nested_directories_resolve_and_list() {
        let mut fs = fresh_fs(128);

        let sub_sector = fs.create_dir("/sub").unwrap();
        let leaf_sector = fs.create("/sub/leaf", 64).unwrap();
        fs.create_dir("/sub/deeper").unwrap();
        fs.create("/sub/deeper/bottom", 32).unwrap();

        assert_eq!(fs.find("/sub").unwrap(), sub_sector);
        assert_eq!(fs.find("/sub/leaf").unwrap(), leaf_sector);
        assert!(fs.find("/sub/deeper/bottom").is_ok());
        assert!(matches!(fs.find("/sub/nope"), Err(FsError::DoesNotExist)));

        let mut out = Vec::new();
        fs.tree(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(
            out,
            "[0] sub d\n    [0] leaf f\n    [1] deeper d\n        [0] bottom f\n"
        );
    }

    #[test]
    fn writes_inside_subdirectories_round_trip() {
        let mut fs = fresh_fs(128);

        fs.create_dir("/docs").unwrap();
        fs.create("/docs/report", 1024).unwrap();
        fs.write_at("/docs/report", b"quarterly numbers", 512).unwrap();

        let mut buf = vec![0; 17];
        fs.read_at("/docs/report", &mut buf, 512).unwrap();
        assert_eq!(&buf, b"quarterly numbers");
    }

    #[test]
    fn dump_escapes_unprintable_bytes() {
        let mut fs = fresh_fs(64);
        fs.create("/blob", 4).unwrap();
        fs.write_at("/blob", &[b'o', b'k', 0x00, 0x7f], 0).unwrap();

        let mut out = Vec::new();
        fs.dump(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Name: blob, Sector:"));
        assert!(out.contains("ok\\00\\7f"));
    }
}
