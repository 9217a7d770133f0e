// packages/simlink/src/channel/region.rs
//! Memory-mapped shared region
//!
//! The simulation engine creates the backing file, sizes it and initialises
//! the header; the agent opens it once the header reports ready.

use crate::channel::layout::{
    RegionHeader, RegionLayout, HEADER_SIZE, LAYOUT_VERSION, REGION_MAGIC,
};
use crate::channel::records::{ActionRecord, ObservationRecord};
use crate::utils::errors::{ProtocolViolation, Result, SimlinkError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// A mapped region shared by the two peers
pub struct SharedRegion {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    layout: RegionLayout,
    /// The creator removes the file on drop
    owner: bool,
}

impl SharedRegion {
    /// Create and initialise a region for `capacity` entities
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(SimlinkError::LayoutMismatch(format!(
                "invalid capacity {}",
                capacity
            )));
        }
        let layout = RegionLayout::new(capacity);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SimlinkError::ChannelIo(format!("Failed to create {:?}: {}", path, e)))?;

        file.set_len(layout.region_size() as u64).map_err(|e| {
            SimlinkError::ChannelIo(format!("Failed to size region: {}", e))
        })?;

        let mmap = unsafe {
            MmapOptions::new().map_mut(&file).map_err(|e| {
                SimlinkError::ChannelIo(format!("Failed to map region: {}", e))
            })?
        };

        let region = Self {
            path,
            _file: file,
            mmap,
            layout,
            owner: true,
        };

        let header = region.header();
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.capacity.store(capacity as u32, Ordering::Relaxed);
        header.magic.store(REGION_MAGIC, Ordering::Relaxed);
        header.ready.store(1, Ordering::Release);

        debug!(
            "Created shared region {:?} ({} bytes, capacity {})",
            region.path,
            layout.region_size(),
            capacity
        );

        Ok(region)
    }

    /// Open a region created by the peer
    ///
    /// Returns `Ok(None)` while the file is missing or its header is not yet
    /// initialised, so callers can poll.
    pub fn try_open<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SimlinkError::ChannelIo(format!(
                    "Failed to open {:?}: {}",
                    path, e
                )))
            }
        };

        let file_len = file
            .metadata()
            .map_err(|e| SimlinkError::ChannelIo(format!("Failed to stat region: {}", e)))?
            .len() as usize;
        if file_len < HEADER_SIZE {
            return Ok(None);
        }

        let mmap = unsafe {
            MmapOptions::new().map_mut(&file).map_err(|e| {
                SimlinkError::ChannelIo(format!("Failed to map region: {}", e))
            })?
        };

        // SAFETY: the map is page aligned and at least HEADER_SIZE long.
        let header = unsafe { &*(mmap.as_ptr() as *const RegionHeader) };
        if header.ready.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }

        let magic = header.magic.load(Ordering::Relaxed);
        if magic != REGION_MAGIC {
            return Err(SimlinkError::LayoutMismatch(format!(
                "bad magic {:#018x}",
                magic
            )));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(SimlinkError::LayoutMismatch(format!(
                "layout version {} (expected {})",
                version, LAYOUT_VERSION
            )));
        }

        let layout = RegionLayout::new(header.capacity.load(Ordering::Relaxed) as usize);
        if file_len < layout.region_size() {
            return Err(SimlinkError::LayoutMismatch(format!(
                "region is {} bytes, layout needs {}",
                file_len,
                layout.region_size()
            )));
        }

        debug!(
            "Opened shared region {:?} (capacity {})",
            path, layout.capacity
        );

        Ok(Some(Self {
            path,
            _file: file,
            mmap,
            layout,
            owner: false,
        }))
    }

    pub fn header(&self) -> &RegionHeader {
        // SAFETY: the map is page aligned, at least HEADER_SIZE long, and the
        // header is only ever accessed through atomics.
        unsafe { &*(self.mmap.as_ptr() as *const RegionHeader) }
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy `len` observation records out of the observation area
    pub fn read_observations(&self, len: usize) -> Result<Vec<ObservationRecord>> {
        let offset = self.layout.observation_offset();
        self.read_records(offset, len)
    }

    /// Copy `len` action records out of the action area
    pub fn read_actions(&self, len: usize) -> Result<Vec<ActionRecord>> {
        let offset = self.layout.action_offset();
        self.read_records(offset, len)
    }

    pub fn write_observations(&mut self, records: &[ObservationRecord]) -> Result<()> {
        let offset = self.layout.observation_offset();
        self.write_records(offset, records)
    }

    pub fn write_actions(&mut self, records: &[ActionRecord]) -> Result<()> {
        let offset = self.layout.action_offset();
        self.write_records(offset, records)
    }

    fn read_records<T: bytemuck::Pod>(&self, offset: usize, len: usize) -> Result<Vec<T>> {
        self.check_capacity(len)?;
        let end = offset + len * size_of::<T>();
        let records: &[T] = bytemuck::try_cast_slice(&self.mmap[offset..end])
            .map_err(|e| SimlinkError::LayoutMismatch(format!("record area: {}", e)))?;
        Ok(records.to_vec())
    }

    fn write_records<T: bytemuck::Pod>(&mut self, offset: usize, records: &[T]) -> Result<()> {
        self.check_capacity(records.len())?;
        let bytes: &[u8] = bytemuck::cast_slice(records);
        self.mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn check_capacity(&self, len: usize) -> Result<()> {
        if len > self.layout.capacity {
            return Err(ProtocolViolation::CapacityExceeded {
                len,
                capacity: self.layout.capacity,
            }
            .into());
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove region {:?}: {}", self.path, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::records::ControlParams;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.shm");

        let created = SharedRegion::create(&path, 8).unwrap();
        assert_eq!(created.capacity(), 8);

        let opened = SharedRegion::try_open(&path).unwrap().unwrap();
        assert_eq!(opened.capacity(), 8);
        assert_eq!(opened.header().capacity.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_open_missing_is_pending() {
        let dir = TempDir::new().unwrap();
        let result = SharedRegion::try_open(dir.path().join("absent.shm")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_open_uninitialised_is_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zeros.shm");
        let file = File::create(&path).unwrap();
        file.set_len(4096).unwrap();

        assert!(SharedRegion::try_open(&path).unwrap().is_none());
    }

    #[test]
    fn test_records_visible_across_mappings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.shm");

        let mut engine = SharedRegion::create(&path, 4).unwrap();
        let agent = SharedRegion::try_open(&path).unwrap().unwrap();

        let records = vec![
            ObservationRecord::new(1, ControlParams::new(12, 14)).with_metrics(-3.0, -100.0, 1.0),
            ObservationRecord::new(2, ControlParams::new(9, 10)),
        ];
        engine.write_observations(&records).unwrap();

        assert_eq!(agent.read_observations(2).unwrap(), records);
    }

    #[test]
    fn test_capacity_enforced() {
        let dir = TempDir::new().unwrap();
        let mut region = SharedRegion::create(dir.path().join("r.shm"), 1).unwrap();

        let records = vec![ActionRecord::default(); 2];
        let err = region.write_actions(&records).unwrap_err();
        assert_eq!(
            err.as_violation(),
            Some(&ProtocolViolation::CapacityExceeded { len: 2, capacity: 1 })
        );
    }

    #[test]
    fn test_owner_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.shm");
        {
            let _region = SharedRegion::create(&path, 2).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
