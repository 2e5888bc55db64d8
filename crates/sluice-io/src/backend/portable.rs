//! Portable backend: buffered `std::fs` files with positional vectored I/O
//! emulated by a seek under the per-handle lock.
//!
//! This is the backend used on platforms without positional scatter/gather
//! syscalls, and it carries the Windows `CreateFile` token mapping. Closing
//! a file here does not chain a directory sync: outside Linux, a file's
//! directory entry reaches storage with the file itself once it has been
//! fsynced.

use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use sluice_common::utils::random_string;
use sluice_common::{FileFlags, IoError, IoResult};

use crate::backend::{caching_for, clip_buffers, Backend, Step};
use crate::dispatcher::DispatcherInner;
use crate::handle::{Caching, HandleSpec, IoHandle, NativeHandle};
use crate::op::OpId;
use crate::request::{NameSource, PathArgs, ReadSink};

#[cfg(windows)]
mod win {
    pub const FILE_SHARE_READ: u32 = 0x0000_0001;
    pub const FILE_SHARE_WRITE: u32 = 0x0000_0002;
    pub const FILE_SHARE_DELETE: u32 = 0x0000_0004;
    pub const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x0200_0000;
    pub const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;
    pub const FILE_FLAG_SEQUENTIAL_SCAN: u32 = 0x0800_0000;
    pub const FILE_FLAG_NO_BUFFERING: u32 = 0x2000_0000;
    pub const FILE_FLAG_WRITE_THROUGH: u32 = 0x8000_0000;
}

pub(crate) struct PortableBackend;

impl PortableBackend {
    fn open_options(flags: FileFlags) -> fs::OpenOptions {
        let mut opts = fs::OpenOptions::new();
        opts.read(flags.contains(FileFlags::READ) || !flags.contains(FileFlags::WRITE));
        opts.write(flags.contains(FileFlags::WRITE));
        opts.append(flags.contains(FileFlags::APPEND));
        opts.truncate(flags.contains(FileFlags::TRUNCATE));
        if flags.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
            opts.create_new(true);
        } else if flags.contains(FileFlags::CREATE) {
            opts.create(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o660);
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            // Everything opened here is shared for read, write, and delete.
            opts.share_mode(win::FILE_SHARE_READ | win::FILE_SHARE_WRITE | win::FILE_SHARE_DELETE);
            let mut custom = 0u32;
            if flags.contains(FileFlags::WILL_BE_SEQUENTIALLY_ACCESSED) {
                custom |= win::FILE_FLAG_SEQUENTIAL_SCAN;
            }
            if flags.contains(FileFlags::OS_DIRECT) {
                custom |= win::FILE_FLAG_NO_BUFFERING;
            }
            if flags.contains(FileFlags::OS_SYNC) {
                custom |= win::FILE_FLAG_WRITE_THROUGH;
            }
            if flags.contains(FileFlags::DELETE_ON_CLOSE) {
                custom |= win::FILE_FLAG_DELETE_ON_CLOSE;
            }
            if custom != 0 {
                opts.custom_flags(custom);
            }
        }
        opts
    }

    // The OS removes the file itself where delete-on-close is a native open
    // flag; elsewhere the handle unlinks at close.
    fn unlink_at_close(flags: FileFlags) -> bool {
        #[cfg(windows)]
        {
            let _ = flags;
            false
        }
        #[cfg(not(windows))]
        {
            flags.contains(FileFlags::DELETE_ON_CLOSE)
        }
    }

    fn open_regular(
        &self,
        d: &Arc<DispatcherInner>,
        path: PathBuf,
        flags: FileFlags,
        caching: Caching,
    ) -> IoResult<Arc<IoHandle>> {
        let file = Self::open_options(flags)
            .open(&path)
            .map_err(|e| IoError::from_io_with_path(e, &path))?;
        let handle = IoHandle::new(
            d,
            path,
            NativeHandle::File(file),
            HandleSpec {
                flags,
                caching,
                delete_on_close: Self::unlink_at_close(flags),
                is_directory: false,
            },
        );
        d.register_handle(&handle);
        Ok(handle)
    }
}

impl Backend for PortableBackend {
    fn defers_data_ops(&self) -> bool {
        false
    }

    fn dir(&self, d: &Arc<DispatcherInner>, _id: OpId, args: PathArgs) -> IoResult<Step> {
        let PathArgs { path, mut flags } = args;
        if flags.contains(FileFlags::CREATE) {
            let mut builder = fs::DirBuilder::new();
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o770);
            }
            match builder.create(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if flags.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
                        return Err(IoError::already_exists(path));
                    }
                }
                Err(err) => return Err(IoError::from_io_with_path(err, path)),
            }
            flags.remove(FileFlags::CREATE | FileFlags::CREATE_ONLY_IF_NOT_EXIST);
        }
        let meta = fs::metadata(&path).map_err(|e| IoError::from_io_with_path(e, &path))?;
        if !meta.is_dir() {
            return Err(IoError::not_a_directory(path));
        }
        if flags.contains(FileFlags::READ) {
            let mut opts = fs::OpenOptions::new();
            opts.read(true);
            #[cfg(windows)]
            {
                use std::os::windows::fs::OpenOptionsExt;
                opts.custom_flags(win::FILE_FLAG_BACKUP_SEMANTICS);
            }
            let file = opts
                .open(&path)
                .map_err(|e| IoError::from_io_with_path(e, &path))?;
            let handle = IoHandle::new(
                d,
                path,
                NativeHandle::File(file),
                HandleSpec {
                    flags,
                    caching: Caching::All,
                    delete_on_close: false,
                    is_directory: true,
                },
            );
            d.register_handle(&handle);
            handle.add_bytes_written(1);
            Ok(Step::Done(Some(handle)))
        } else {
            Ok(Step::Done(None))
        }
    }

    fn rmdir(&self, _d: &Arc<DispatcherInner>, _id: OpId, args: PathArgs) -> IoResult<Step> {
        fs::remove_dir(&args.path).map_err(|e| IoError::from_io_with_path(e, args.path))?;
        Ok(Step::Done(None))
    }

    fn file(&self, d: &Arc<DispatcherInner>, _id: OpId, args: PathArgs) -> IoResult<Step> {
        let caching = caching_for(args.flags);
        let handle = self.open_regular(d, args.path, args.flags, caching)?;
        Ok(Step::Done(Some(handle)))
    }

    fn rmfile(&self, _d: &Arc<DispatcherInner>, _id: OpId, args: PathArgs) -> IoResult<Step> {
        fs::remove_file(&args.path).map_err(|e| IoError::from_io_with_path(e, args.path))?;
        Ok(Step::Done(None))
    }

    fn sync(
        &self,
        _d: &Arc<DispatcherInner>,
        _id: OpId,
        input: Option<Arc<IoHandle>>,
    ) -> IoResult<Step> {
        let handle =
            input.ok_or_else(|| IoError::invalid_argument("sync needs an inbound handle"))?;
        let written = handle.bytes_written_total();
        if written > handle.bytes_written_at_last_fsync() {
            handle.flush_native()?;
            handle.mark_synced(written);
        }
        Ok(Step::Done(Some(handle)))
    }

    fn close(
        &self,
        _d: &Arc<DispatcherInner>,
        _id: OpId,
        input: Option<Arc<IoHandle>>,
    ) -> IoResult<Step> {
        let handle =
            input.ok_or_else(|| IoError::invalid_argument("close needs an inbound handle"))?;
        if handle.auto_flush() && handle.dirty_bytes() > 0 {
            let written = handle.bytes_written_total();
            handle.flush_native()?;
            handle.mark_synced(written);
        }
        handle.close_native()?;
        Ok(Step::Done(Some(handle)))
    }

    fn read(
        &self,
        _d: &Arc<DispatcherInner>,
        _id: OpId,
        input: Option<Arc<IoHandle>>,
        offset: u64,
        sink: ReadSink,
        _deadline: Option<Duration>,
    ) -> IoResult<Step> {
        let handle =
            input.ok_or_else(|| IoError::invalid_argument("read needs an inbound handle"))?;
        let transferred = sink.with_buffers(|buffers| -> IoResult<u64> {
            let transferred = handle.with_file(|file| seek_read(file, buffers, offset))?;
            clip_buffers(buffers, transferred);
            Ok(transferred as u64)
        })?;
        handle.add_bytes_read(transferred);
        Ok(Step::Done(Some(handle)))
    }

    fn write(
        &self,
        _d: &Arc<DispatcherInner>,
        _id: OpId,
        input: Option<Arc<IoHandle>>,
        offset: u64,
        buffers: Vec<Bytes>,
        _deadline: Option<Duration>,
    ) -> IoResult<Step> {
        let handle =
            input.ok_or_else(|| IoError::invalid_argument("write needs an inbound handle"))?;
        let transferred = handle.with_file(|file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut transferred = 0u64;
            for buffer in &buffers {
                file.write_all(buffer)?;
                transferred += buffer.len() as u64;
            }
            Ok(transferred)
        })?;
        handle.add_bytes_written(transferred);
        Ok(Step::Done(Some(handle)))
    }

    fn random_file(
        &self,
        d: &Arc<DispatcherInner>,
        id: OpId,
        dir: PathBuf,
        flags: FileFlags,
        names: Option<NameSource>,
    ) -> IoResult<Step> {
        let flags = flags | FileFlags::CREATE_ONLY_IF_NOT_EXIST;
        loop {
            let name = match &names {
                Some(source) => source(),
                None => random_string(32),
            };
            match self.open_regular(d, dir.join(name), flags, Caching::Temporary) {
                Ok(handle) => return Ok(Step::Done(Some(handle))),
                Err(err) if err.is_already_exists() => {
                    trace!(id = id.as_u64(), "random name collided, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn temp_inode(
        &self,
        d: &Arc<DispatcherInner>,
        _id: OpId,
        dir: PathBuf,
        flags: FileFlags,
    ) -> IoResult<Step> {
        let flags = flags | FileFlags::READ_WRITE | FileFlags::CREATE_ONLY_IF_NOT_EXIST;
        #[cfg(windows)]
        let flags = flags | FileFlags::DELETE_ON_CLOSE;
        loop {
            let path = dir.join(random_string(32));
            match self.open_regular(d, path.clone(), flags, Caching::Temporary) {
                Ok(handle) => {
                    // Unbind the inode from the namespace immediately; the
                    // descriptor keeps it alive.
                    #[cfg(not(windows))]
                    fs::remove_file(&path).map_err(|e| IoError::from_io_with_path(e, path))?;
                    return Ok(Step::Done(Some(handle)));
                }
                Err(err) if err.is_already_exists() => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Sequentially fills the buffers from `offset`, stopping at EOF. Returns
/// the bytes transferred; retries interrupted reads.
fn seek_read(file: &mut fs::File, buffers: &mut [BytesMut], offset: u64) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut transferred = 0usize;
    'buffers: for buffer in buffers.iter_mut() {
        let mut filled = 0usize;
        while filled < buffer.len() {
            match file.read(&mut buffer[filled..]) {
                Ok(0) => break 'buffers, // EOF
                Ok(n) => {
                    filled += n;
                    transferred += n;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
    Ok(transferred)
}
