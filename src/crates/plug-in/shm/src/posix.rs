use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use tracing::debug;

use crate::{BulkChannel, Result, ShmError};

static NEXT_SEGMENT_ID: AtomicI32 = AtomicI32::new(0);

/// Name of segment `id` owned by process `pid`
pub fn segment_name(pid: u32, id: i32) -> String {
    format!("/plug-in-shm-{}-{}", pid, id)
}

/// A mapped POSIX shared memory segment.
///
/// The creating side unlinks the segment name when dropped; attached
/// mappings only unmap.
pub struct PosixShm {
    name: String,
    id: i32,
    size: usize,
    owner: bool,
    map: Mutex<MmapMut>,
}

impl PosixShm {
    /// Create a fresh segment of `size` bytes owned by this process
    pub fn create(size: usize) -> Result<Self> {
        let id = NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed);
        let name = segment_name(std::process::id(), id);

        let fd = shm_open(
            name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmError::Open {
            name: name.clone(),
            source: e.into(),
        })?;

        let file = File::from(fd);
        let map = file
            .set_len(size as u64)
            .and_then(|()| map_file(&file))
            .map_err(|source| {
                let _ = shm_unlink(name.as_str());
                ShmError::Map {
                    name: name.clone(),
                    source,
                }
            })?;

        debug!("created shared memory segment {} ({} bytes)", name, size);

        Ok(Self {
            name,
            id,
            size,
            owner: true,
            map: Mutex::new(map),
        })
    }

    /// Map a segment created by process `owner_pid`
    pub fn attach(owner_pid: u32, id: i32, size: usize) -> Result<Self> {
        let name = segment_name(owner_pid, id);

        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            ShmError::Open {
                name: name.clone(),
                source: e.into(),
            }
        })?;

        let file = File::from(fd);
        let map = map_file(&file).map_err(|source| ShmError::Map {
            name: name.clone(),
            source,
        })?;

        if map.len() < size {
            return Err(ShmError::TooLarge {
                len: size,
                capacity: map.len(),
            });
        }

        Ok(Self {
            name,
            id,
            size,
            owner: false,
            map: Mutex::new(map),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.size {
            return Err(ShmError::TooLarge {
                len,
                capacity: self.size,
            });
        }
        Ok(())
    }
}

fn map_file(file: &File) -> std::io::Result<MmapMut> {
    // SAFETY: the segment is only written by the two processes taking part
    // in the tile exchange, which alternate strictly on message boundaries.
    unsafe { MmapMut::map_mut(file) }
}

impl BulkChannel for PosixShm {
    fn segment_id(&self) -> i32 {
        self.id
    }

    fn capacity(&self) -> usize {
        self.size
    }

    fn send(&self, data: &[u8]) -> Result<Option<Bytes>> {
        self.check_len(data.len())?;
        self.map.lock()[..data.len()].copy_from_slice(data);
        Ok(None)
    }

    fn receive(&self, _inline: Option<Bytes>, len: usize) -> Result<Bytes> {
        self.check_len(len)?;
        Ok(Bytes::copy_from_slice(&self.map.lock()[..len]))
    }
}

impl fmt::Debug for PosixShm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixShm")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for PosixShm {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                debug!("failed to unlink {}: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attached_mapping_sees_owner_writes() {
        let owner = PosixShm::create(4096).unwrap();
        let peer = PosixShm::attach(std::process::id(), owner.segment_id(), 4096).unwrap();

        assert_eq!(owner.send(&[7u8; 100]).unwrap(), None);
        assert_eq!(&peer.receive(None, 100).unwrap()[..], &[7u8; 100][..]);

        peer.send(b"pixels").unwrap();
        assert_eq!(&owner.receive(None, 6).unwrap()[..], b"pixels");
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let owner = PosixShm::create(64).unwrap();
        let id = owner.segment_id();
        drop(owner);
        assert!(PosixShm::attach(std::process::id(), id, 64).is_err());
    }

    #[test]
    fn test_oversized_store_rejected() {
        let owner = PosixShm::create(16).unwrap();
        assert!(matches!(
            owner.send(&[0u8; 17]),
            Err(ShmError::TooLarge {
                len: 17,
                capacity: 16
            })
        ));
    }

    #[test]
    fn test_segment_ids_are_unique() {
        let a = PosixShm::create(16).unwrap();
        let b = PosixShm::create(16).unwrap();
        assert_ne!(a.segment_id(), b.segment_id());
        assert_ne!(a.name(), b.name());
    }
}
