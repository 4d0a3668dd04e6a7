use std::io::Write;

use crate::alloc::Bitmap;
use crate::fs::FsError;
use crate::io::{SectorDevice, SectorId, SECTOR_SIZE};

use log::debug;
use zerocopy::{AsBytes, FromBytes};

/// Data-sector numbers held by one index block. An index block is a sector
/// whose entire content is an array of u32 sector numbers.
pub const SECTORS_PER_LIST: usize = SECTOR_SIZE / 4;

/// Index blocks a header can reference. Three u32 scalars plus this array
/// fill the header's sector exactly.
pub const MAX_INDEX_BLOCKS: usize = (SECTOR_SIZE - 12) / 4;

/// Largest file the two-level index can address.
pub const MAX_FILE_SIZE: u32 = (MAX_INDEX_BLOCKS * SECTORS_PER_LIST * SECTOR_SIZE) as u32;

const UNSET: u32 = u32::MAX;

/// Per-file metadata record, the inode analog. Describes the file's length
/// and the index blocks that in turn name its data sectors.
///
/// A header is populated in one of two ways: for a new file by [`allocate`]
/// (which reserves every data and index sector out of the free map), or for
/// an existing file by [`fetch_from`] (one sector read). Until [`deallocate`]
/// releases them, the header exclusively owns every sector it references.
///
/// This structure __must fill exactly one sector.__
///
/// [`allocate`]: FileHeader::allocate
/// [`fetch_from`]: FileHeader::fetch_from
/// [`deallocate`]: FileHeader::deallocate
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct FileHeader {
    /// Logical file length in bytes.
    num_bytes: u32,
    /// Data sectors backing the file, `ceil(num_bytes / SECTOR_SIZE)`.
    num_sectors: u32,
    /// Index blocks in use, `ceil(num_sectors / SECTORS_PER_LIST)`.
    num_lists: u32,
    /// Sector numbers of the index blocks. Entries at `num_lists` and beyond
    /// are unset.
    index_sectors: [u32; MAX_INDEX_BLOCKS],
}

fn div_round_up(value: u32, unit: u32) -> u32 {
    (value + unit - 1) / unit
}

fn read_index_block<D: SectorDevice>(
    dev: &mut D,
    sector: SectorId,
) -> Result<[u32; SECTORS_PER_LIST], FsError> {
    let mut buf = [0; SECTOR_SIZE];
    dev.read_sector(sector, &mut buf)?;
    Ok(FromBytes::read_from(&buf[..]).expect("index block fills one sector"))
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            num_bytes: UNSET,
            num_sectors: UNSET,
            num_lists: UNSET,
            index_sectors: [UNSET; MAX_INDEX_BLOCKS],
        }
    }

    /// Initialize a fresh header for a newly created file, reserving its
    /// index blocks and data sectors out of the map of free sectors.
    ///
    /// The capacity check counts the index blocks alongside the data sectors,
    /// so once it passes every reservation below is guaranteed to succeed; a
    /// free map that still runs dry mid-loop has diverged from its own
    /// `num_clear` accounting and the allocation panics rather than leave a
    /// half-built file behind. On [`FsError::NoSpace`] nothing was reserved.
    pub fn allocate<D: SectorDevice>(
        &mut self,
        dev: &mut D,
        free_map: &mut Bitmap,
        file_size: u32,
    ) -> Result<(), FsError> {
        if file_size > MAX_FILE_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "file size {} exceeds the {} byte maximum",
                file_size, MAX_FILE_SIZE
            )));
        }
        self.num_bytes = file_size;
        self.num_sectors = div_round_up(file_size, SECTOR_SIZE as u32);
        self.num_lists = div_round_up(self.num_sectors, SECTORS_PER_LIST as u32);
        if free_map.num_clear() < self.num_sectors + self.num_lists {
            return Err(FsError::NoSpace);
        }

        let mut remaining = self.num_sectors as usize;
        for i in 0..self.num_lists as usize {
            let index_sector = free_map
                .find_and_set()
                .expect("free map exhausted after capacity check");
            self.index_sectors[i] = index_sector;

            // The last list may be short; unused slots stay zero on disk.
            let count = remaining.min(SECTORS_PER_LIST);
            let mut list = [0u32; SECTORS_PER_LIST];
            for slot in &mut list[..count] {
                *slot = free_map
                    .find_and_set()
                    .expect("free map exhausted after capacity check");
            }
            dev.write_sector(index_sector, list.as_bytes())?;
            remaining -= count;
        }
        debug!(
            "allocated {} data sectors over {} index blocks for a {} byte file",
            self.num_sectors, self.num_lists, file_size
        );
        Ok(())
    }

    /// Release every sector this header owns back to the free map, index
    /// blocks included, restoring the map to its pre-allocate population.
    ///
    /// # Panics
    ///
    /// Panics if any owned sector is already clear in the map. A double free
    /// means the map and the header disagree about ownership; continuing
    /// would hand the sector to two files.
    pub fn deallocate<D: SectorDevice>(
        &self,
        dev: &mut D,
        free_map: &mut Bitmap,
    ) -> Result<(), FsError> {
        let mut remaining = self.num_sectors as usize;
        for i in 0..self.num_lists as usize {
            let index_sector = self.index_sectors[i];
            let list = read_index_block(dev, index_sector)?;
            let count = remaining.min(SECTORS_PER_LIST);
            for &sector in &list[..count] {
                assert!(free_map.test(sector), "data sector {} freed twice", sector);
                free_map.clear(sector);
            }
            assert!(
                free_map.test(index_sector),
                "index sector {} freed twice",
                index_sector
            );
            free_map.clear(index_sector);
            remaining -= count;
        }
        debug!(
            "released {} data sectors and {} index blocks",
            self.num_sectors, self.num_lists
        );
        Ok(())
    }

    /// Fetch the header record from the given sector.
    pub fn fetch_from<D: SectorDevice>(dev: &mut D, sector: SectorId) -> Result<Self, FsError> {
        let mut buf = [0; SECTOR_SIZE];
        dev.read_sector(sector, &mut buf)?;
        Ok(FromBytes::read_from(&buf[..]).expect("header fills one sector"))
    }

    /// Write the whole header record to the given sector.
    pub fn write_back<D: SectorDevice>(&self, dev: &mut D, sector: SectorId) -> Result<(), FsError> {
        dev.write_sector(sector, self.as_bytes())?;
        Ok(())
    }

    /// Translate a byte offset within the file to the sector storing it.
    /// Callers must keep `offset` below the file length; out-of-range
    /// offsets are their contract violation, not a recoverable error here.
    pub fn byte_to_sector<D: SectorDevice>(
        &self,
        dev: &mut D,
        offset: u32,
    ) -> Result<SectorId, FsError> {
        debug_assert!(
            offset < self.num_bytes,
            "offset {} beyond file length {}",
            offset,
            self.num_bytes
        );
        let sector_idx = offset as usize / SECTOR_SIZE;
        let list_idx = sector_idx / SECTORS_PER_LIST;
        let idx_in_list = sector_idx % SECTORS_PER_LIST;
        let list = read_index_block(dev, self.index_sectors[list_idx])?;
        Ok(list[idx_in_list])
    }

    /// The number of bytes in the file.
    pub fn len(&self) -> u32 {
        self.num_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.num_bytes == 0
    }

    /// Read up to `buf.len()` bytes starting at `offset`, clamped to the
    /// file length. Returns the number of bytes read.
    pub fn read_at<D: SectorDevice>(
        &self,
        dev: &mut D,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<usize, FsError> {
        if offset >= self.num_bytes {
            return Ok(0);
        }
        let end = (offset as u64 + buf.len() as u64).min(self.num_bytes as u64) as usize;
        let mut pos = offset as usize;
        let mut done = 0;
        let mut sector_buf = [0; SECTOR_SIZE];
        while pos < end {
            let sector = self.byte_to_sector(dev, pos as u32)?;
            dev.read_sector(sector, &mut sector_buf)?;
            let start = pos % SECTOR_SIZE;
            let n = (SECTOR_SIZE - start).min(end - pos);
            buf[done..done + n].copy_from_slice(&sector_buf[start..start + n]);
            pos += n;
            done += n;
        }
        Ok(done)
    }

    /// Write `buf` into the file starting at `offset`, clamped to the file
    /// length (files never grow past their allocated size). Returns the
    /// number of bytes written.
    pub fn write_at<D: SectorDevice>(
        &self,
        dev: &mut D,
        buf: &[u8],
        offset: u32,
    ) -> Result<usize, FsError> {
        if offset >= self.num_bytes {
            return Ok(0);
        }
        let end = (offset as u64 + buf.len() as u64).min(self.num_bytes as u64) as usize;
        let mut pos = offset as usize;
        let mut done = 0;
        let mut sector_buf = [0; SECTOR_SIZE];
        while pos < end {
            let sector = self.byte_to_sector(dev, pos as u32)?;
            let start = pos % SECTOR_SIZE;
            let n = (SECTOR_SIZE - start).min(end - pos);
            if n < SECTOR_SIZE {
                // Partial sector, preserve the bytes around the written span.
                dev.read_sector(sector, &mut sector_buf)?;
            }
            sector_buf[start..start + n].copy_from_slice(&buf[done..done + n]);
            dev.write_sector(sector, &sector_buf)?;
            pos += n;
            done += n;
        }
        Ok(done)
    }

    /// Debugging aid: the header's metadata, its index-block sectors, and
    /// the reconstructed file contents with non-printable bytes escaped.
    pub fn dump<D: SectorDevice, W: Write>(&self, dev: &mut D, w: &mut W) -> Result<(), FsError> {
        writeln!(
            w,
            "File header: {} bytes, {} data sectors, {} index blocks",
            self.num_bytes, self.num_sectors, self.num_lists
        )?;
        write!(w, "Index block sectors:")?;
        for i in 0..self.num_lists as usize {
            write!(w, " {}", self.index_sectors[i])?;
        }
        writeln!(w)?;

        let mut printed = 0;
        let mut remaining = self.num_sectors as usize;
        let mut data = [0; SECTOR_SIZE];
        for i in 0..self.num_lists as usize {
            let list = read_index_block(dev, self.index_sectors[i])?;
            let count = remaining.min(SECTORS_PER_LIST);
            writeln!(w, "Contents of index block {} (sector {}):", i, self.index_sectors[i])?;
            for &sector in &list[..count] {
                dev.read_sector(sector, &mut data)?;
                for &byte in data.iter() {
                    if printed >= self.num_bytes {
                        break;
                    }
                    if (0x20..=0x7e).contains(&byte) {
                        write!(w, "{}", byte as char)?;
                    } else {
                        write!(w, "\\{:02x}", byte)?;
                    }
                    printed += 1;
                }
                writeln!(w)?;
            }
            remaining -= count;
        }
        Ok(())
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileDiskEmulator, FileDiskEmulatorBuilder};
    use std::mem::size_of;

    fn test_device(nsectors: usize) -> FileDiskEmulator {
        let backing = tempfile::tempfile().unwrap();
        FileDiskEmulatorBuilder::from(backing)
            .with_sector_count(nsectors)
            .build()
            .expect("could not initialize disk emulator")
    }

    #[test]
    fn header_fills_exactly_one_sector() {
        assert_eq!(size_of::<FileHeader>(), SECTOR_SIZE);
    }

    #[test]
    fn allocate_write_back_fetch_round_trips() {
        let mut dev = test_device(16);
        let mut map = Bitmap::new(16);
        let hdr_sector = map.find_and_set().unwrap();

        let mut hdr = FileHeader::new();
        hdr.allocate(&mut dev, &mut map, 1000).unwrap();
        hdr.write_back(&mut dev, hdr_sector).unwrap();

        let fetched = FileHeader::fetch_from(&mut dev, hdr_sector).unwrap();
        assert_eq!(fetched.len(), 1000);
        for offset in (0..1000).step_by(101) {
            assert_eq!(
                hdr.byte_to_sector(&mut dev, offset).unwrap(),
                fetched.byte_to_sector(&mut dev, offset).unwrap()
            );
        }
    }

    #[test]
    fn no_sector_is_handed_out_twice() {
        let mut dev = test_device(32);
        let mut map = Bitmap::new(32);

        let mut first = FileHeader::new();
        first.allocate(&mut dev, &mut map, 3 * SECTOR_SIZE as u32).unwrap();
        let mut second = FileHeader::new();
        second.allocate(&mut dev, &mut map, 2 * SECTOR_SIZE as u32).unwrap();

        let mut seen = std::collections::HashSet::new();
        for hdr in [&first, &second].iter() {
            for i in 0..hdr.num_lists as usize {
                assert!(seen.insert(hdr.index_sectors[i]));
            }
            for offset in (0..hdr.len()).step_by(SECTOR_SIZE) {
                assert!(seen.insert(hdr.byte_to_sector(&mut dev, offset).unwrap()));
            }
        }
    }

    #[test]
    fn deallocate_restores_free_sector_count() {
        let mut dev = test_device(16);
        let mut map = Bitmap::new(16);
        let before = map.num_clear();

        let mut hdr = FileHeader::new();
        hdr.allocate(&mut dev, &mut map, 4 * SECTOR_SIZE as u32).unwrap();
        // Four data sectors plus the index block.
        assert_eq!(map.num_clear(), before - 5);

        hdr.deallocate(&mut dev, &mut map).unwrap();
        assert_eq!(map.num_clear(), before);
    }

    #[test]
    fn allocate_without_space_reserves_nothing() {
        let mut dev = test_device(4);
        let mut map = Bitmap::new(4);

        let mut hdr = FileHeader::new();
        assert!(matches!(
            hdr.allocate(&mut dev, &mut map, 8 * SECTOR_SIZE as u32),
            Err(FsError::NoSpace)
        ));
        assert_eq!(map.num_clear(), 4);
    }

    #[test]
    fn capacity_check_counts_index_blocks() {
        let mut dev = test_device(2);
        let mut map = Bitmap::new(2);

        // Two data sectors fit, but the index block does not.
        let mut hdr = FileHeader::new();
        assert!(matches!(
            hdr.allocate(&mut dev, &mut map, 2 * SECTOR_SIZE as u32),
            Err(FsError::NoSpace)
        ));
        assert_eq!(map.num_clear(), 2);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let mut dev = test_device(4);
        let mut map = Bitmap::new(4);

        let mut hdr = FileHeader::new();
        assert!(matches!(
            hdr.allocate(&mut dev, &mut map, MAX_FILE_SIZE + 1),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn multi_list_file_translates_across_lists() {
        // 137 data sectors span two index blocks.
        let size = 137 * SECTOR_SIZE as u32;
        let mut dev = test_device(160);
        let mut map = Bitmap::new(160);
        let before = map.num_clear();

        let mut hdr = FileHeader::new();
        hdr.allocate(&mut dev, &mut map, size).unwrap();
        assert_eq!(hdr.num_lists, 2);
        assert_eq!(map.num_clear(), before - 137 - 2);

        // Offsets on both sides of the list boundary translate to live,
        // distinct sectors.
        let last_in_first = hdr
            .byte_to_sector(&mut dev, (SECTORS_PER_LIST * SECTOR_SIZE - 1) as u32)
            .unwrap();
        let first_in_second = hdr
            .byte_to_sector(&mut dev, (SECTORS_PER_LIST * SECTOR_SIZE) as u32)
            .unwrap();
        assert_ne!(last_in_first, first_in_second);
        assert!(map.test(last_in_first));
        assert!(map.test(first_in_second));

        hdr.deallocate(&mut dev, &mut map).unwrap();
        assert_eq!(map.num_clear(), before);
    }

    #[test]
    fn read_and_write_span_sector_boundaries() {
        let mut dev = test_device(16);
        let mut map = Bitmap::new(16);

        let mut hdr = FileHeader::new();
        hdr.allocate(&mut dev, &mut map, 1200).unwrap();

        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        // Starts mid-sector and crosses into the second data sector.
        assert_eq!(hdr.write_at(&mut dev, &payload, 400).unwrap(), 200);

        let mut readback = vec![0; 200];
        assert_eq!(hdr.read_at(&mut dev, &mut readback, 400).unwrap(), 200);
        assert_eq!(readback, payload);

        // Writes and reads clamp at the file length.
        assert_eq!(hdr.write_at(&mut dev, &payload, 1100).unwrap(), 100);
        assert_eq!(hdr.read_at(&mut dev, &mut readback, 1100).unwrap(), 100);
        assert_eq!(hdr.read_at(&mut dev, &mut readback, 1200).unwrap(), 0);
        assert_eq!(readback[..100], payload[..100]);
    }

    #[test]
    fn zero_length_file_allocates_nothing() {
        let mut dev = test_device(8);
        let mut map = Bitmap::new(8);

        let mut hdr = FileHeader::new();
        hdr.allocate(&mut dev, &mut map, 0).unwrap();
        assert_eq!(hdr.len(), 0);
        assert!(hdr.is_empty());
        assert_eq!(map.num_clear(), 8);

        let mut buf = [0; 16];
        assert_eq!(hdr.read_at(&mut dev, &mut buf, 0).unwrap(), 0);
        hdr.deallocate(&mut dev, &mut map).unwrap();
        assert_eq!(map.num_clear(), 8);
    }
}
