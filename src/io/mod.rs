mod device;
mod diskemu;

pub use device::{SectorDevice, SectorId, SECTOR_SIZE};
pub use diskemu::{FileDiskEmulator, FileDiskEmulatorBuilder};
