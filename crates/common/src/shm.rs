//! Named shared-memory buffers
//!
//! Tensor payloads move between the dispatch front-end and engine processes
//! through named segments on a tmpfs mount (`/dev/shm` by default), mapped
//! with `memmap2`. Only segment names travel over the sockets.
//!
//! Every segment has exactly one owner at a time. The owner's
//! [`NamedBuffer`] either unlinks the segment explicitly, hands ownership to
//! the peer with [`NamedBuffer::release`], or unlinks it when dropped, so an
//! early return never leaks a segment. Attached (borrowed) buffers can never
//! unlink. A second unlink of the same segment, necessarily from another
//! handle or process, surfaces as a [`EngineLinkError::Resource`] error.

use crate::config::ShmConfig;
use crate::error::{EngineLinkError, Result};
use crate::metrics::METRICS;
use memmap2::{MmapMut, MmapOptions};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{trace, warn};
use uuid::Uuid;

/// Hook invoked on segment creation and removal
pub trait BufferObserver: Send + Sync {
    fn on_create(&self, _name: &str, _len: usize) {}

    fn on_unlink(&self, _name: &str) {}
}

/// Whether a handle is responsible for unlinking its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Must unlink, release or drop the segment
    Owned,
    /// Read/write view of a segment someone else owns
    Borrowed,
}

/// Creates, attaches and removes named segments under one root directory
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    root: PathBuf,
    prefix: String,
    observer: Option<Arc<dyn BufferObserver>>,
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("root", &self.inner.root)
            .field("prefix", &self.inner.prefix)
            .finish()
    }
}

impl BufferManager {
    /// Create a manager for the configured shared-memory root
    pub fn new(config: &ShmConfig) -> Result<Self> {
        let meta = std::fs::metadata(&config.root).map_err(|e| {
            EngineLinkError::config(format!(
                "Shared memory root {} unavailable: {}",
                config.root.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(EngineLinkError::config(format!(
                "Shared memory root {} is not a directory",
                config.root.display()
            )));
        }

        Ok(Self {
            inner: Arc::new(ManagerInner {
                root: config.root.clone(),
                prefix: config.prefix.clone(),
                observer: None,
            }),
        })
    }

    /// Attach an observer notified on every create and unlink
    pub fn with_observer(self, observer: Arc<dyn BufferObserver>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                root: self.inner.root.clone(),
                prefix: self.inner.prefix.clone(),
                observer: Some(observer),
            }),
        }
    }

    /// Allocate a new owned segment of `size` bytes under a fresh unique name
    pub fn create(&self, size: usize) -> Result<NamedBuffer> {
        let name = format!("{}-{}", self.inner.prefix, Uuid::new_v4().simple());
        let path = self.inner.root.join(&name);

        // create_new guarantees we never reuse a live segment
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                EngineLinkError::resource(format!("Failed to create segment {}: {}", name, e))
            })?;

        let map = match reserve(&file, size).and_then(|_| map_file(&file, size)) {
            Ok(map) => map,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(EngineLinkError::resource(format!(
                    "Failed to allocate {} bytes for segment {}: {}",
                    size, name, e
                )));
            }
        };

        METRICS.shm.buffers_created.inc();
        METRICS.shm.bytes_allocated.inc_by(size as u64);
        if let Some(observer) = &self.inner.observer {
            observer.on_create(&name, size);
        }
        trace!("Created segment {} ({} bytes)", name, size);

        Ok(NamedBuffer {
            manager: self.clone(),
            name,
            len: size,
            map,
            ownership: Ownership::Owned,
            armed: true,
        })
    }

    /// Allocate a segment and fill it with `data`
    pub fn create_from(&self, data: &[u8]) -> Result<NamedBuffer> {
        let mut buffer = self.create(data.len())?;
        buffer.as_mut_slice().copy_from_slice(data);
        Ok(buffer)
    }

    /// Open an existing segment without taking ownership
    pub fn attach(&self, name: &str) -> Result<NamedBuffer> {
        self.open(name, Ownership::Borrowed)
    }

    /// Open an existing segment whose ownership the peer handed over
    pub fn adopt(&self, name: &str) -> Result<NamedBuffer> {
        self.open(name, Ownership::Owned)
    }

    /// Remove a segment by name
    pub fn unlink(&self, name: &str) -> Result<()> {
        let path = self.segment_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                METRICS.shm.buffers_unlinked.inc();
                if let Some(observer) = &self.inner.observer {
                    observer.on_unlink(name);
                }
                trace!("Unlinked segment {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                METRICS.shm.unlink_errors.inc();
                Err(EngineLinkError::resource(format!(
                    "Segment {} already unlinked",
                    name
                )))
            }
            Err(e) => {
                METRICS.shm.unlink_errors.inc();
                Err(EngineLinkError::resource(format!(
                    "Failed to unlink segment {}: {}",
                    name, e
                )))
            }
        }
    }

    /// Whether a segment currently exists
    pub fn exists(&self, name: &str) -> bool {
        self.segment_path(name)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    fn open(&self, name: &str, ownership: Ownership) -> Result<NamedBuffer> {
        let path = self.segment_path(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => EngineLinkError::BufferNotFound(name.to_string()),
                _ => EngineLinkError::resource(format!("Failed to open segment {}: {}", name, e)),
            })?;

        let len = file
            .metadata()
            .map_err(|e| EngineLinkError::resource(format!("Failed to stat segment {}: {}", name, e)))?
            .len() as usize;

        let map = map_file(&file, len).map_err(|e| {
            EngineLinkError::resource(format!("Failed to map segment {}: {}", name, e))
        })?;

        Ok(NamedBuffer {
            manager: self.clone(),
            name: name.to_string(),
            len,
            map,
            ownership,
            armed: ownership == Ownership::Owned,
        })
    }

    /// Resolve a segment name received from a peer, refusing foreign names
    fn segment_path(&self, name: &str) -> Result<PathBuf> {
        let own_prefix = name
            .strip_prefix(self.inner.prefix.as_str())
            .map(|rest| rest.starts_with('-') && rest.len() > 1)
            .unwrap_or(false);
        if !own_prefix || name.contains('/') {
            return Err(EngineLinkError::BufferNotFound(format!(
                "{} is not a segment of this deployment",
                name
            )));
        }
        Ok(self.inner.root.join(name))
    }
}

#[cfg(target_os = "linux")]
fn reserve(file: &File, size: usize) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if size == 0 {
        return Ok(());
    }
    // Reserving the pages up front turns tmpfs exhaustion into an error here
    // instead of a SIGBUS on first write.
    nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, size as nix::libc::off_t)
        .map_err(std::io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn reserve(file: &File, size: usize) -> std::io::Result<()> {
    file.set_len(size as u64)
}

fn map_file(file: &File, len: usize) -> std::io::Result<Option<MmapMut>> {
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: segments are private to one deployment (0600, prefixed names)
    // and are only written by their creator before the name is published.
    let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(Some(map))
}

/// Handle to one mapped shared-memory segment
pub struct NamedBuffer {
    manager: BufferManager,
    name: String,
    len: usize,
    map: Option<MmapMut>,
    ownership: Ownership,
    /// Owned and not yet unlinked or released
    armed: bool,
}

impl NamedBuffer {
    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the segment holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Zero-copy view of the segment contents
    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..],
            None => &[],
        }
    }

    /// Writable view of the segment contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.map {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    /// Detach the local mapping without removing the segment.
    ///
    /// For an owned buffer this hands the unlink duty to whoever adopts the
    /// returned name.
    pub fn release(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.name)
    }

    /// Remove the segment. Only the current owner may do this, once.
    pub fn unlink(mut self) -> Result<()> {
        if self.ownership == Ownership::Borrowed {
            return Err(EngineLinkError::resource(format!(
                "Segment {} is attached, not owned",
                self.name
            )));
        }
        self.armed = false;
        self.map.take();
        self.manager.unlink(&self.name)
    }
}

impl fmt::Debug for NamedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedBuffer")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl Drop for NamedBuffer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.map.take();
        if let Err(e) = self.manager.unlink(&self.name) {
            warn!("Dropping owned segment: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        created: Mutex<Vec<String>>,
        unlinked: Mutex<Vec<String>>,
    }

    impl BufferObserver for Recorder {
        fn on_create(&self, name: &str, _len: usize) {
            self.created.lock().push(name.to_string());
        }

        fn on_unlink(&self, name: &str) {
            self.unlinked.lock().push(name.to_string());
        }
    }

    fn manager(dir: &tempfile::TempDir) -> BufferManager {
        BufferManager::new(&ShmConfig {
            root: dir.path().to_path_buf(),
            prefix: "eltest".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_create_attach_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let shm = manager(&dir);

        let owner = shm.create_from(&[1, 2, 3, 4]).unwrap();
        assert!(owner.name().starts_with("eltest-"));

        let mut view = shm.attach(owner.name()).unwrap();
        assert_eq!(view.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(view.ownership(), Ownership::Borrowed);

        // writes through one mapping are visible through the other
        view.as_mut_slice()[0] = 9;
        assert_eq!(owner.as_slice()[0], 9);
        drop(view);

        let name = owner.name().to_string();
        owner.unlink().unwrap();
        assert!(!shm.exists(&name));
    }

    #[test]
    fn test_attach_after_unlink_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let shm = manager(&dir);

        let owner = shm.create(16).unwrap();
        let name = owner.name().to_string();
        owner.unlink().unwrap();

        assert!(matches!(
            shm.attach(&name),
            Err(EngineLinkError::BufferNotFound(_))
        ));
    }

    #[test]
    fn test_double_unlink_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let shm = manager(&dir);

        let owner = shm.create(8).unwrap();
        let name = owner.release();
        let adopted = shm.adopt(&name).unwrap();

        shm.unlink(&name).unwrap();
        assert!(matches!(adopted.unlink(), Err(EngineLinkError::Resource(_))));
    }

    #[test]
    fn test_borrowed_buffer_cannot_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let shm = manager(&dir);

        let owner = shm.create(8).unwrap();
        let view = shm.attach(owner.name()).unwrap();
        assert!(view.unlink().is_err());
        assert!(shm.exists(owner.name()));
    }

    #[test]
    fn test_drop_unlinks_owned_but_not_released() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let shm = manager(&dir).with_observer(recorder.clone());

        let dropped = shm.create(32).unwrap();
        let dropped_name = dropped.name().to_string();
        drop(dropped);
        assert!(!shm.exists(&dropped_name));

        let released = shm.create(32).unwrap();
        let released_name = released.release();
        assert!(shm.exists(&released_name));

        let adopted = shm.adopt(&released_name).unwrap();
        drop(adopted);
        assert!(!shm.exists(&released_name));

        assert_eq!(recorder.created.lock().len(), 2);
        assert_eq!(
            *recorder.unlinked.lock(),
            vec![dropped_name, released_name]
        );
    }

    #[test]
    fn test_empty_segment() {
        let dir = tempfile::tempdir().unwrap();
        let shm = manager(&dir);

        let owner = shm.create(0).unwrap();
        assert!(owner.is_empty());
        let view = shm.attach(owner.name()).unwrap();
        assert_eq!(view.as_slice(), &[] as &[u8]);
        drop(view);
        owner.unlink().unwrap();
    }

    #[test]
    fn test_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let shm = manager(&dir);

        let buffers: Vec<_> = (0..64).map(|_| shm.create(1).unwrap()).collect();
        let mut names: Vec<_> = buffers.iter().map(|b| b.name().to_string()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 64);
    }

    #[test]
    fn test_foreign_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let shm = manager(&dir);

        assert!(shm.attach("../etc/passwd").is_err());
        assert!(shm.attach("other-1234").is_err());
        assert!(shm.attach("eltest-").is_err());
        assert!(shm.unlink("eltest-../x").is_err());
    }
}
