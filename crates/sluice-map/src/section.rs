//! Memory sections: kernel-object views over backing storage or anonymous
//! memory.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use sluice_common::{IoError, IoResult, SectionFlags};
use sluice_io::IoHandle;

/// A source of mapped memory.
///
/// A section owns its own reference to the backing storage (a duplicated
/// descriptor), so it stays usable after the backing handle closes, and
/// views mapped from it stay valid after the section itself is dropped.
/// The backing handle reference is borrowed, never owning.
pub struct Section {
    file: Option<File>,
    backing: Option<Weak<IoHandle>>,
    length: AtomicU64,
    flags: SectionFlags,
}

impl Section {
    /// Creates a section over `backing`.
    ///
    /// `maximum_size` of zero means the backing file's current length.
    pub fn from_handle(
        backing: &Arc<IoHandle>,
        maximum_size: u64,
        flags: SectionFlags,
    ) -> IoResult<Arc<Self>> {
        let file = backing.duplicate_native()?;
        let length = if maximum_size == 0 {
            file.metadata().map(|meta| meta.len())?
        } else {
            maximum_size
        };
        Ok(Arc::new(Self {
            file: Some(file),
            backing: Some(Arc::downgrade(backing)),
            length: AtomicU64::new(length),
            flags,
        }))
    }

    /// Creates a section backed by the system page file (anonymous memory).
    pub fn pagefile(maximum_size: u64, flags: SectionFlags) -> IoResult<Arc<Self>> {
        if maximum_size == 0 {
            return Err(IoError::invalid_argument(
                "anonymous sections need an explicit maximum size",
            ));
        }
        Ok(Arc::new(Self {
            file: None,
            backing: None,
            length: AtomicU64::new(maximum_size),
            flags,
        }))
    }

    /// The section's flag set.
    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    /// The current maximum permitted extent of the section.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// The borrowed backing handle, if it is still alive.
    pub fn backing(&self) -> Option<Arc<IoHandle>> {
        self.backing.as_ref().and_then(Weak::upgrade)
    }

    /// True if the section is backed by anonymous page-file memory.
    pub fn is_anonymous(&self) -> bool {
        self.file.is_none()
    }

    /// Resizes the maximum permitted extent. Extents only ever grow;
    /// shrinking is a no-op, as is any resize against POSIX kernels.
    /// Returns the extent after the call.
    pub fn truncate(&self, new_size: u64) -> IoResult<u64> {
        let previous = self.length.fetch_max(new_size, Ordering::AcqRel);
        Ok(previous.max(new_size))
    }

    pub(crate) fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("length", &self.length())
            .field("flags", &self.flags)
            .field("anonymous", &self.is_anonymous())
            .field("backing_alive", &self.backing().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagefile_needs_a_size() {
        assert!(Section::pagefile(0, SectionFlags::READ_WRITE).is_err());
        let section = Section::pagefile(1 << 20, SectionFlags::READ_WRITE).unwrap();
        assert!(section.is_anonymous());
        assert_eq!(section.length(), 1 << 20);
        assert!(section.backing().is_none());
    }

    #[test]
    fn truncate_is_extend_only() {
        let section = Section::pagefile(4096, SectionFlags::READ_WRITE).unwrap();
        assert_eq!(section.truncate(8192).unwrap(), 8192);
        assert_eq!(section.length(), 8192);
        // Shrinking is a no-op.
        assert_eq!(section.truncate(4096).unwrap(), 8192);
        assert_eq!(section.length(), 8192);
    }
}
