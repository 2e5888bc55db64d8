//! I/O handles and their native-object ownership.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use sluice_common::{FileFlags, IoError, IoResult};

use crate::dispatcher::DispatcherInner;

/// How aggressively the kernel may cache data for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Caching {
    /// No caching: reads and writes bypass the host cache and write through.
    None,
    /// Only data is cached; writes reach storage before completing.
    DataOnly,
    /// Only metadata is cached; data transfers bypass the host cache.
    MetadataOnly,
    /// Everything is cached (the platform default).
    #[default]
    All,
    /// Cache as lazily as possible; the file is expected to be short-lived.
    Temporary,
}

/// The OS object a handle exclusively owns. Moves are value-preserving;
/// closing the owning handle releases the object.
pub(crate) enum NativeHandle {
    /// A POSIX file descriptor used for positional scatter/gather I/O.
    #[cfg(unix)]
    Fd(std::os::fd::OwnedFd),
    /// A buffered file whose positional I/O is emulated with a seek under
    /// the handle lock.
    File(File),
    /// Released.
    Closed,
}

impl NativeHandle {
    /// Stable registry key for the weak handle table. Zero means "no OS
    /// object".
    fn key(&self) -> u64 {
        match self {
            #[cfg(unix)]
            Self::Fd(fd) => {
                use std::os::fd::AsRawFd;
                fd.as_raw_fd() as u64 + 1
            }
            Self::File(file) => {
                #[cfg(unix)]
                {
                    use std::os::fd::AsRawFd;
                    file.as_raw_fd() as u64 + 1
                }
                #[cfg(not(unix))]
                {
                    static NEXT: AtomicU64 = AtomicU64::new(1 << 32);
                    let _ = file;
                    NEXT.fetch_add(1, Ordering::Relaxed)
                }
            }
            Self::Closed => 0,
        }
    }
}

/// Construction parameters for [`IoHandle`].
pub(crate) struct HandleSpec {
    pub flags: FileFlags,
    pub caching: Caching,
    pub delete_on_close: bool,
    pub is_directory: bool,
}

/// The ownership unit for scatter/gather byte I/O.
///
/// A handle owns exactly one native OS object, tracks its write-byte
/// counters, and holds a non-owning reference back to the dispatcher that
/// created it. Handles register themselves with the dispatcher on creation
/// and deregister on close or drop.
pub struct IoHandle {
    dispatcher: Weak<DispatcherInner>,
    path: PathBuf,
    flags: FileFlags,
    caching: Caching,
    native: Mutex<NativeHandle>,
    key: u64,
    registered: AtomicBool,
    auto_flush: bool,
    delete_on_close: bool,
    is_directory: bool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    bytes_written_at_last_fsync: AtomicU64,
    ever_fsynced: AtomicBool,
}

impl IoHandle {
    pub(crate) fn new(
        dispatcher: &Arc<DispatcherInner>,
        path: PathBuf,
        native: NativeHandle,
        spec: HandleSpec,
    ) -> Arc<Self> {
        let key = native.key();
        Arc::new(Self {
            dispatcher: Arc::downgrade(dispatcher),
            path,
            flags: spec.flags,
            caching: spec.caching,
            native: Mutex::new(native),
            key,
            registered: AtomicBool::new(false),
            auto_flush: spec.flags.wants_auto_flush(),
            delete_on_close: spec.delete_on_close,
            is_directory: spec.is_directory,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_written_at_last_fsync: AtomicU64::new(0),
            ever_fsynced: AtomicBool::new(false),
        })
    }

    /// The path this handle was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The effective flags the handle was opened with.
    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    /// The caching hint the handle was opened with.
    pub fn caching(&self) -> Caching {
        self.caching
    }

    /// True if a close of this handle must flush dirty bytes first.
    pub fn auto_flush(&self) -> bool {
        self.auto_flush
    }

    /// True if this handle refers to a directory.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// True while the native object has not been released.
    pub fn is_open(&self) -> bool {
        !matches!(*self.native.lock(), NativeHandle::Closed)
    }

    /// Bytes read through this handle since it was opened.
    pub fn bytes_read_total(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// Bytes written through this handle since it was opened.
    pub fn bytes_written_total(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Bytes that had been written when the handle was last fsynced.
    pub fn bytes_written_at_last_fsync(&self) -> u64 {
        self.bytes_written_at_last_fsync.load(Ordering::Acquire)
    }

    /// True once a kernel flush has been issued for this handle.
    pub fn has_ever_been_fsynced(&self) -> bool {
        self.ever_fsynced.load(Ordering::Acquire)
    }

    /// Bytes written since the last fsync.
    pub fn dirty_bytes(&self) -> u64 {
        self.bytes_written_total()
            .saturating_sub(self.bytes_written_at_last_fsync())
    }

    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::AcqRel);
    }

    /// Records a kernel flush that covered the first `upto` written bytes.
    pub(crate) fn mark_synced(&self, upto: u64) {
        self.bytes_written_at_last_fsync
            .fetch_max(upto, Ordering::AcqRel);
        self.ever_fsynced.store(true, Ordering::Release);
    }

    /// Issues a kernel flush for the native object.
    pub(crate) fn flush_native(&self) -> IoResult<()> {
        let native = self.native.lock();
        match &*native {
            #[cfg(unix)]
            NativeHandle::Fd(fd) => {
                use std::os::fd::AsRawFd;
                let ret = unsafe { libc::fsync(fd.as_raw_fd()) };
                if ret < 0 {
                    return Err(IoError::from_io_with_path(
                        io::Error::last_os_error(),
                        &self.path,
                    ));
                }
                Ok(())
            }
            NativeHandle::File(file) => file
                .sync_all()
                .map_err(|e| IoError::from_io_with_path(e, &self.path)),
            NativeHandle::Closed => Err(IoError::invalid_argument("handle is closed")),
        }
    }

    /// Releases the native object, deregisters the handle, and removes the
    /// file if it was opened delete-on-close.
    pub(crate) fn close_native(&self) -> IoResult<()> {
        let native = std::mem::replace(&mut *self.native.lock(), NativeHandle::Closed);
        self.deregister();
        match native {
            #[cfg(unix)]
            NativeHandle::Fd(fd) => {
                use std::os::fd::IntoRawFd;
                let raw = fd.into_raw_fd();
                let ret = unsafe { libc::close(raw) };
                if ret < 0 {
                    return Err(IoError::from_io_with_path(
                        io::Error::last_os_error(),
                        &self.path,
                    ));
                }
            }
            NativeHandle::File(file) => drop(file),
            NativeHandle::Closed => {
                return Err(IoError::invalid_argument("handle already closed"))
            }
        }
        if self.delete_on_close {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    trace!(path = %self.path.display(), error = %err, "delete-on-close failed");
                }
            }
        }
        Ok(())
    }

    /// Runs `f` with the raw descriptor. Errors if the handle is closed.
    #[cfg(unix)]
    pub(crate) fn with_raw_fd<R>(
        &self,
        f: impl FnOnce(std::os::fd::RawFd) -> IoResult<R>,
    ) -> IoResult<R> {
        use std::os::fd::AsRawFd;
        let native = self.native.lock();
        match &*native {
            NativeHandle::Fd(fd) => f(fd.as_raw_fd()),
            NativeHandle::File(file) => f(file.as_raw_fd()),
            NativeHandle::Closed => Err(IoError::invalid_argument("handle is closed")),
        }
    }

    /// Runs `f` with exclusive access to the buffered file. The lock is held
    /// for the duration, serialising seek-based positional I/O.
    pub(crate) fn with_file<R>(&self, f: impl FnOnce(&mut File) -> io::Result<R>) -> IoResult<R> {
        let mut native = self.native.lock();
        match &mut *native {
            NativeHandle::File(file) => {
                f(file).map_err(|e| IoError::from_io_with_path(e, &self.path))
            }
            #[cfg(unix)]
            NativeHandle::Fd(_) => Err(IoError::invalid_argument(
                "handle does not use buffered file I/O",
            )),
            NativeHandle::Closed => Err(IoError::invalid_argument("handle is closed")),
        }
    }

    /// Duplicates the native object into an independent `File`.
    ///
    /// The duplicate shares the open file description but has its own
    /// lifetime; closing this handle does not invalidate it. Sections use
    /// this to hold their own kernel reference to the backing storage.
    pub fn duplicate_native(&self) -> IoResult<File> {
        let native = self.native.lock();
        match &*native {
            #[cfg(unix)]
            NativeHandle::Fd(fd) => {
                let cloned = fd
                    .try_clone()
                    .map_err(|e| IoError::from_io_with_path(e, &self.path))?;
                Ok(File::from(cloned))
            }
            NativeHandle::File(file) => file
                .try_clone()
                .map_err(|e| IoError::from_io_with_path(e, &self.path)),
            NativeHandle::Closed => Err(IoError::invalid_argument("handle is closed")),
        }
    }

    /// Current length of the underlying file.
    pub fn length(&self) -> IoResult<u64> {
        let native = self.native.lock();
        match &*native {
            #[cfg(unix)]
            NativeHandle::Fd(fd) => {
                use std::os::fd::AsRawFd;
                let mut stat: libc::stat = unsafe { std::mem::zeroed() };
                let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) };
                if ret < 0 {
                    return Err(IoError::from_io_with_path(
                        io::Error::last_os_error(),
                        &self.path,
                    ));
                }
                Ok(stat.st_size as u64)
            }
            NativeHandle::File(file) => file
                .metadata()
                .map(|m| m.len())
                .map_err(|e| IoError::from_io_with_path(e, &self.path)),
            NativeHandle::Closed => Err(IoError::invalid_argument("handle is closed")),
        }
    }

    pub(crate) fn registry_key(&self) -> u64 {
        self.key
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    fn deregister(&self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            if let Some(dispatcher) = self.dispatcher.upgrade() {
                dispatcher.deregister_handle(self.key);
            }
        }
    }
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        let open = !matches!(*self.native.get_mut(), NativeHandle::Closed);
        if open {
            if self.auto_flush && self.dirty_bytes() > 0 {
                if let Err(err) = self.flush_native() {
                    warn!(path = %self.path.display(), error = %err, "auto-flush on drop failed");
                }
            }
            if let Err(err) = self.close_native() {
                warn!(path = %self.path.display(), error = %err, "close on drop failed");
            }
        } else {
            self.deregister();
        }
    }
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("caching", &self.caching)
            .field("open", &self.is_open())
            .field("bytes_written", &self.bytes_written_total())
            .finish()
    }
}
