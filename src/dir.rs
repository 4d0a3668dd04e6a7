use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::mem::size_of;

use crate::fs::FsError;
use crate::header::FileHeader;
use crate::io::{SectorDevice, SectorId};

use zerocopy::{AsBytes, FromBytes};

/// Name capacity of a directory entry. Names are stored zero-padded, so
/// every entry is the same fixed size.
pub const NAME_MAX: usize = 30;

/// Slots per directory table, fixed when the directory is created. Once all
/// slots are used, no more entries can be bound under that directory.
pub const DIR_ENTRIES: usize = 16;

pub const ENTRY_SIZE: usize = size_of::<DirEntry>();

/// Byte size of a directory's backing file: the whole table, at offset 0.
pub const DIR_FILE_SIZE: u32 = (DIR_ENTRIES * ENTRY_SIZE) as u32;

const FILE_TAG: u8 = b'f';
const DIRECTORY_TAG: u8 = b'd';

/// What a directory entry points at: a plain file or a nested directory
/// (whose backing file holds another entry table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::File => FILE_TAG,
            FileKind::Directory => DIRECTORY_TAG,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            DIRECTORY_TAG => FileKind::Directory,
            _ => FileKind::File,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileKind::File => "f",
            FileKind::Directory => "d",
        })
    }
}

/// One fixed-size slot of a directory table, binding a name to the sector
/// holding that entity's file header.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct DirEntry {
    in_use: u8,
    kind: u8,
    name: [u8; NAME_MAX],
    sector: SectorId,
}

impl DirEntry {
    fn vacant() -> Self {
        Self {
            in_use: 0,
            kind: 0,
            name: [0; NAME_MAX],
            sector: 0,
        }
    }

    fn occupy(&mut self, name: &str, sector: SectorId, kind: FileKind) {
        self.in_use = 1;
        self.kind = kind.tag();
        self.name = [0; NAME_MAX];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        self.sector = sector;
    }

    fn release(&mut self) {
        self.in_use = 0;
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use != 0
    }

    fn name_bytes(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        &self.name[..end]
    }

    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name_bytes())
    }

    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_tag(self.kind)
    }
}

/// A fixed-capacity table of name -> header-sector bindings.
///
/// A directory is not a distinct on-disk type: its table persists as the
/// byte content of an ordinary file, referenced from the parent's entry with
/// the directory tag. Instances are constructed empty and either populated
/// from a backing file with [`fetch_from`] or filled by [`add`] and then
/// committed with [`write_back`]. Apart from the resident root, a directory
/// object only lives for the duration of one operation.
///
/// [`fetch_from`]: Directory::fetch_from
/// [`add`]: Directory::add
/// [`write_back`]: Directory::write_back
pub struct Directory {
    table: Vec<DirEntry>,
}

fn strip_root(path: &str) -> Result<&str, FsError> {
    path.strip_prefix('/').ok_or_else(|| {
        FsError::InvalidArgument(format!("path must start with \"/\": {}", path))
    })
}

fn check_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::InvalidArgument(format!(
            "name must be 1..={} bytes: \"{}\"",
            NAME_MAX, name
        )));
    }
    Ok(())
}

/// Fetches the directory stored in the file whose header lives at `sector`.
fn load_subdir<D: SectorDevice>(
    dev: &mut D,
    sector: SectorId,
) -> Result<(FileHeader, Directory), FsError> {
    let hdr = FileHeader::fetch_from(dev, sector)?;
    let mut sub = Directory::new(DIR_ENTRIES);
    sub.fetch_from(dev, &hdr)?;
    Ok((hdr, sub))
}

impl Directory {
    /// An empty directory with `size` slots. When formatting a disk an empty
    /// table is all that is needed; otherwise call [`fetch_from`] to load the
    /// table from its backing file.
    ///
    /// [`fetch_from`]: Directory::fetch_from
    pub fn new(size: usize) -> Self {
        Self {
            table: vec![DirEntry::vacant(); size],
        }
    }

    /// Read the table from the directory's backing file.
    pub fn fetch_from<D: SectorDevice>(
        &mut self,
        dev: &mut D,
        hdr: &FileHeader,
    ) -> Result<(), FsError> {
        let mut buf = vec![0; self.table.len() * ENTRY_SIZE];
        hdr.read_at(dev, &mut buf, 0)?;
        for (slot, raw) in self.table.iter_mut().zip(buf.chunks_exact(ENTRY_SIZE)) {
            *slot = FromBytes::read_from(raw).expect("entry layout");
        }
        Ok(())
    }

    /// Write the table back into the directory's backing file.
    pub fn write_back<D: SectorDevice>(
        &self,
        dev: &mut D,
        hdr: &FileHeader,
    ) -> Result<(), FsError> {
        hdr.write_at(dev, self.table.as_slice().as_bytes(), 0)?;
        Ok(())
    }

    /// Table slot of the in-use entry named `name`, if any. Names are single
    /// path segments here, never full paths.
    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|e| e.is_in_use() && e.name_bytes() == name.as_bytes())
    }

    /// Resolve an absolute path to the sector holding the named entity's
    /// file header.
    ///
    /// Each separator-delimited segment is looked up one directory level
    /// down; intermediate segments must be directories, and each level loads
    /// its table into a transient directory released as resolution returns.
    pub fn find<D: SectorDevice>(&self, dev: &mut D, path: &str) -> Result<SectorId, FsError> {
        self.find_entry(dev, strip_root(path)?).map(|e| e.sector)
    }

    fn find_entry<D: SectorDevice>(&self, dev: &mut D, rel: &str) -> Result<DirEntry, FsError> {
        match rel.split_once('/') {
            None => {
                let i = self.find_index(rel).ok_or(FsError::DoesNotExist)?;
                Ok(self.table[i])
            }
            Some((segment, rest)) => {
                let i = self.find_index(segment).ok_or(FsError::DoesNotExist)?;
                let entry = self.table[i];
                if entry.kind() != FileKind::Directory {
                    return Err(FsError::NotDirectory(segment.to_string()));
                }
                let (_, sub) = load_subdir(dev, entry.sector)?;
                sub.find_entry(dev, rest)
            }
        }
    }

    /// Bind `path` to `new_sector`. The leaf lands in the first free slot of
    /// its parent directory.
    ///
    /// A nested add (path with intermediate segments) persists the parent's
    /// table before returning. A top-level add only mutates this in-memory
    /// table; committing it is the caller's responsibility.
    pub fn add<D: SectorDevice>(
        &mut self,
        dev: &mut D,
        path: &str,
        new_sector: SectorId,
        kind: FileKind,
    ) -> Result<(), FsError> {
        match self.find(dev, path) {
            Ok(_) => return Err(FsError::AlreadyExists(path.to_string())),
            Err(FsError::DoesNotExist) => (),
            Err(e) => return Err(e),
        }
        let rel = strip_root(path)?;
        let (prefix, leaf) = match rel.rsplit_once('/') {
            Some(split) => split,
            None => ("", rel),
        };
        check_name(leaf)?;

        if prefix.is_empty() {
            self.insert(leaf, new_sector, kind)
        } else {
            let parent = self.find_entry(dev, prefix)?;
            if parent.kind() != FileKind::Directory {
                return Err(FsError::NotDirectory(prefix.to_string()));
            }
            let (hdr, mut sub) = load_subdir(dev, parent.sector)?;
            sub.insert(leaf, new_sector, kind)?;
            sub.write_back(dev, &hdr)
        }
    }

    fn insert(&mut self, name: &str, sector: SectorId, kind: FileKind) -> Result<(), FsError> {
        match self.table.iter_mut().find(|e| !e.is_in_use()) {
            Some(slot) => {
                slot.occupy(name, sector, kind);
                Ok(())
            }
            None => Err(FsError::DirectoryFull),
        }
    }

    /// Unbind the entry at `path` by clearing its slot. The entity's own
    /// header and data sectors are untouched; reclaiming those belongs to
    /// whichever layer owns the header's lifecycle.
    ///
    /// Mirrors [`add`]: nested removals persist the parent table, top-level
    /// removals leave persistence to the caller.
    ///
    /// [`add`]: Directory::add
    pub fn remove<D: SectorDevice>(&mut self, dev: &mut D, path: &str) -> Result<(), FsError> {
        let rel = strip_root(path)?;
        let (prefix, leaf) = match rel.rsplit_once('/') {
            Some(split) => split,
            None => ("", rel),
        };

        if prefix.is_empty() {
            let i = self.find_index(leaf).ok_or(FsError::DoesNotExist)?;
            self.table[i].release();
            Ok(())
        } else {
            let parent = self.find_entry(dev, prefix)?;
            if parent.kind() != FileKind::Directory {
                return Err(FsError::NotDirectory(prefix.to_string()));
            }
            let (hdr, mut sub) = load_subdir(dev, parent.sector)?;
            let i = sub.find_index(leaf).ok_or(FsError::DoesNotExist)?;
            sub.table[i].release();
            sub.write_back(dev, &hdr)
        }
    }

    /// Every in-use entry, in slot order.
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.table.iter().filter(|e| e.is_in_use())
    }

    /// List this directory's entries, one `[slot] name kind` line each.
    pub fn list<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        for (i, entry) in self.table.iter().enumerate() {
            if entry.is_in_use() {
                writeln!(w, "[{}] {} {}", i, entry.name(), entry.kind())?;
            }
        }
        Ok(())
    }

    /// List the whole naming tree below this directory, indenting each
    /// level by `depth`.
    pub fn recur_list<D: SectorDevice, W: Write>(
        &self,
        dev: &mut D,
        w: &mut W,
        depth: usize,
    ) -> Result<(), FsError> {
        for (i, entry) in self.table.iter().enumerate() {
            if !entry.is_in_use() {
                continue;
            }
            writeln!(
                w,
                "{:indent$}[{}] {} {}",
                "",
                i,
                entry.name(),
                entry.kind(),
                indent = depth * 4
            )?;
            if entry.kind() == FileKind::Directory {
                let (_, sub) = load_subdir(dev, entry.sector)?;
                sub.recur_list(dev, w, depth + 1)?;
            }
        }
        Ok(())
    }

    /// Debugging aid: every in-use entry with its header metadata and file
    /// contents.
    pub fn dump<D: SectorDevice, W: Write>(&self, dev: &mut D, w: &mut W) -> Result<(), FsError> {
        writeln!(w, "Directory contents:")?;
        for entry in self.entries() {
            writeln!(w, "Name: {}, Sector: {}", entry.name(), entry.sector)?;
            let hdr = FileHeader::fetch_from(dev, entry.sector)?;
            hdr.dump(dev, w)?;
        }
        Ok(())
    }
}
