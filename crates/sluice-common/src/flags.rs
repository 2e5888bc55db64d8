//! Bitwise file and memory-section flags.

use bitflags::bitflags;

bitflags! {
    /// Bitwise file and directory open flags.
    ///
    /// Every dispatcher holds a force/mask pair applied over these; see
    /// [`FileFlags::effective`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileFlags: u32 {
        /// Read access.
        const READ = 1;
        /// Write access.
        const WRITE = 2;
        /// Append only.
        const APPEND = 4;
        /// Truncate an existing file to zero length.
        const TRUNCATE = 8;
        /// Open, creating if the path does not exist.
        const CREATE = 16;
        /// Create and open only if the path does not already exist.
        const CREATE_ONLY_IF_NOT_EXIST = 32;
        /// Flush on close if any dirty bytes remain unsynced.
        const AUTO_FLUSH = 64;
        /// The file will be accessed sequentially; hint the kernel.
        const WILL_BE_SEQUENTIALLY_ACCESSED = 128;
        /// Bypass the host page cache (`O_DIRECT` / `FILE_FLAG_NO_BUFFERING`).
        const OS_DIRECT = 256;
        /// Write-through to storage (`O_SYNC` / `FILE_FLAG_WRITE_THROUGH`).
        const OS_SYNC = 512;
        /// Remove the file when its handle closes. Used by the temporary
        /// file variants.
        const DELETE_ON_CLOSE = 1024;

        /// Read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl FileFlags {
    /// Computes the effective flags given a dispatcher's force/mask pair:
    /// `(self & !mask) | force`.
    #[must_use]
    pub fn effective(self, force: FileFlags, mask: FileFlags) -> FileFlags {
        (self & !mask) | force
    }

    /// Flags for opening an existing file read-only.
    #[must_use]
    pub fn for_read() -> Self {
        Self::READ
    }

    /// Flags for creating a file with read and write access.
    #[must_use]
    pub fn for_create() -> Self {
        Self::READ_WRITE | Self::CREATE
    }

    /// Returns true if both `AUTO_FLUSH` and `WRITE` are set, i.e. a close
    /// of this handle must flush dirty bytes first.
    #[must_use]
    pub fn wants_auto_flush(self) -> bool {
        self.contains(Self::AUTO_FLUSH | Self::WRITE)
    }
}

bitflags! {
    /// The behaviour of a memory section and of views mapped from it.
    ///
    /// The permissions of any mapped view are a subset of its section's
    /// flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        /// Memory views can be read.
        const READ = 1;
        /// Memory views can be written.
        const WRITE = 2;
        /// Memory views are copy-on-write.
        const COW = 4;
        /// Memory views can execute code.
        const EXECUTE = 8;
        /// Do not commit backing store for the memory immediately.
        const NO_COMMIT = 256;
        /// Prefault, as if by reading every page, any view on creation.
        const PREFAULT = 512;
        /// The backing storage is an executable program binary.
        const EXECUTABLE_IMAGE = 1024;

        /// Read and write views.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl SectionFlags {
    /// The permission bits (read/write/cow/execute) of this flag set.
    #[must_use]
    pub fn permissions(self) -> SectionFlags {
        self & (Self::READ | Self::WRITE | Self::COW | Self::EXECUTE)
    }

    /// Returns true if `view` requests no permission this set lacks.
    #[must_use]
    pub fn permits(self, view: SectionFlags) -> bool {
        self.permissions().contains(view.permissions())
    }
}
