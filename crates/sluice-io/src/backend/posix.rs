//! POSIX backend: positional scatter/gather I/O via `preadv`/`pwritev`,
//! `O_TMPFILE` anonymous inodes, and the directory-sync-on-close
//! subroutine.
//!
//! All primitives complete on the worker that runs them.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use sluice_common::utils::random_string;
use sluice_common::{FileFlags, IoError, IoResult};

use crate::backend::{caching_for, clip_buffers, Backend, Step};
use crate::dispatcher::{DispatcherInner, Payload};
use crate::handle::{Caching, HandleSpec, IoHandle, NativeHandle};
use crate::op::{OpId, OpKind};
use crate::request::{NameSource, PathArgs, ReadSink};

/// Scatter/gather chunk limit per syscall; the POSIX floor for `IOV_MAX` is
/// far lower than what Linux accepts, so transfers loop in chunks.
const IOV_CHUNK: usize = 1024;

pub(crate) struct PosixBackend;

impl PosixBackend {
    fn open_options(flags: FileFlags) -> fs::OpenOptions {
        let mut opts = fs::OpenOptions::new();
        // O_RDONLY is the access mode when nothing was requested.
        opts.read(flags.contains(FileFlags::READ) || !flags.contains(FileFlags::WRITE));
        opts.write(flags.contains(FileFlags::WRITE));
        opts.append(flags.contains(FileFlags::APPEND));
        opts.truncate(flags.contains(FileFlags::TRUNCATE));
        if flags.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
            opts.create_new(true);
        } else if flags.contains(FileFlags::CREATE) {
            opts.create(true);
        }
        opts.mode(0o660);
        let mut custom = 0;
        #[cfg(target_os = "linux")]
        if flags.contains(FileFlags::OS_DIRECT) {
            custom |= libc::O_DIRECT;
        }
        if flags.contains(FileFlags::OS_SYNC) {
            custom |= libc::O_SYNC;
        }
        opts.custom_flags(custom);
        opts
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
        if flags.contains(FileFlags::WILL_BE_SEQUENTIALLY_ACCESSED) {
            advise_sequential(file.as_raw_fd());
        }
        let fd: OwnedFd = file.into();
        let handle = IoHandle::new(
            d,
            path,
            NativeHandle::Fd(fd),
            HandleSpec {
                flags,
                caching,
                delete_on_close: flags.contains(FileFlags::DELETE_ON_CLOSE),
                is_directory: false,
            },
        );
        d.register_handle(&handle);
        Ok(handle)
    }
}

impl Backend for PosixBackend {
    fn defers_data_ops(&self) -> bool {
        false
    }

    fn dir(&self, d: &Arc<DispatcherInner>, _id: OpId, args: PathArgs) -> IoResult<Step> {
        let PathArgs { path, mut flags } = args;
        if flags.contains(FileFlags::CREATE) {
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o770);
            match builder.create(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    // A concurrent creator won the race; only exclusive
                    // creation treats that as a failure.
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
            let file = fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_DIRECTORY)
                .open(&path)
                .map_err(|e| IoError::from_io_with_path(e, &path))?;
            let fd: OwnedFd = file.into();
            let handle = IoHandle::new(
                d,
                path,
                NativeHandle::Fd(fd),
                HandleSpec {
                    flags,
                    caching: Caching::All,
                    delete_on_close: false,
                    is_directory: true,
                },
            );
            d.register_handle(&handle);
            // A directory handle opened for reading is marked dirty so a
            // chained sync reaches the kernel and flushes its entries.
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
        d: &Arc<DispatcherInner>,
        id: OpId,
        input: Option<Arc<IoHandle>>,
    ) -> IoResult<Step> {
        let handle =
            input.ok_or_else(|| IoError::invalid_argument("close needs an inbound handle"))?;
        if handle.auto_flush() && handle.dirty_bytes() > 0 {
            let written = handle.bytes_written_total();
            handle.flush_native()?;
            handle.mark_synced(written);
        }
        // Anonymous inodes and delete-on-close files have no directory
        // entry left to make durable.
        let needs_dir_sync = handle.has_ever_been_fsynced()
            && !handle.is_directory()
            && handle.caching() != Caching::Temporary;
        let parent = handle.path().parent().map(Path::to_path_buf);
        handle.close_native()?;
        if needs_dir_sync {
            if let Some(parent) = parent {
                // The file's directory entry must reach storage too: chain
                // an open→sync→close of the containing directory onto this
                // close.
                let dir_open = DispatcherInner::chain_after(
                    d,
                    id,
                    OpKind::Dir,
                    Payload::Path(PathArgs {
                        path: parent,
                        flags: FileFlags::READ,
                    }),
                );
                let dir_sync =
                    DispatcherInner::chain_after(d, dir_open.id(), OpKind::Sync, Payload::HandleOnly);
                let _dir_close =
                    DispatcherInner::chain_after(d, dir_sync.id(), OpKind::Close, Payload::HandleOnly);
            }
        }
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
        let transferred = handle.with_raw_fd(|fd| {
            sink.with_buffers(|buffers| preadv_all(fd, buffers, offset))
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
        let transferred = handle.with_raw_fd(|fd| pwritev_all(fd, &buffers, offset))?;
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
        id: OpId,
        dir: PathBuf,
        flags: FileFlags,
    ) -> IoResult<Step> {
        #[cfg(target_os = "linux")]
        {
            match fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_TMPFILE)
                .mode(0o600)
                .open(&dir)
            {
                Ok(file) => {
                    let fd: OwnedFd = file.into();
                    let handle = IoHandle::new(
                        d,
                        dir,
                        NativeHandle::Fd(fd),
                        HandleSpec {
                            flags: flags | FileFlags::READ_WRITE,
                            caching: Caching::Temporary,
                            delete_on_close: false,
                            is_directory: false,
                        },
                    );
                    d.register_handle(&handle);
                    return Ok(Step::Done(Some(handle)));
                }
                Err(err) => {
                    let unsupported = matches!(
                        err.raw_os_error(),
                        Some(libc::EOPNOTSUPP) | Some(libc::EINVAL) | Some(libc::EISDIR)
                    );
                    if !unsupported {
                        return Err(IoError::from_io_with_path(err, dir));
                    }
                    trace!(id = id.as_u64(), "O_TMPFILE unsupported, falling back");
                }
            }
        }
        // Fallback: exclusive-create a random name, then unlink it while
        // keeping the descriptor open.
        let flags = flags | FileFlags::READ_WRITE | FileFlags::CREATE_ONLY_IF_NOT_EXIST;
        loop {
            let path = dir.join(random_string(32));
            match self.open_regular(d, path.clone(), flags, Caching::Temporary) {
                Ok(handle) => {
                    fs::remove_file(&path).map_err(|e| IoError::from_io_with_path(e, path))?;
                    return Ok(Step::Done(Some(handle)));
                }
                Err(err) if err.is_already_exists() => {
                    trace!(id = id.as_u64(), "random name collided, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn advise_sequential(fd: RawFd) {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = fd;
}

/// Reads into the buffers until they are full or EOF, retrying interrupted
/// calls. Buffers are clipped to the bytes actually transferred.
fn preadv_all(fd: RawFd, buffers: &mut [BytesMut], mut offset: u64) -> IoResult<u64> {
    let total: usize = buffers.iter().map(BytesMut::len).sum();
    let mut transferred = 0usize;
    while transferred < total {
        let iov = iovecs_mut(buffers, transferred);
        if iov.is_empty() {
            break;
        }
        let n = unsafe {
            libc::preadv(
                fd,
                iov.as_ptr(),
                iov.len() as libc::c_int,
                offset as libc::off_t,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if n == 0 {
            break; // EOF
        }
        transferred += n as usize;
        offset += n as u64;
    }
    clip_buffers(buffers, transferred);
    Ok(transferred as u64)
}

/// Writes all gather buffers, retrying interrupted and short transfers.
fn pwritev_all(fd: RawFd, buffers: &[Bytes], mut offset: u64) -> IoResult<u64> {
    let total: usize = buffers.iter().map(Bytes::len).sum();
    let mut transferred = 0usize;
    while transferred < total {
        let iov = iovecs(buffers, transferred);
        if iov.is_empty() {
            break;
        }
        let n = unsafe {
            libc::pwritev(
                fd,
                iov.as_ptr(),
                iov.len() as libc::c_int,
                offset as libc::off_t,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "pwritev wrote zero bytes").into());
        }
        transferred += n as usize;
        offset += n as u64;
    }
    Ok(transferred as u64)
}

fn iovecs_mut(buffers: &mut [BytesMut], mut skip: usize) -> Vec<libc::iovec> {
    let mut iov = Vec::with_capacity(buffers.len().min(IOV_CHUNK));
    for buffer in buffers.iter_mut() {
        if skip >= buffer.len() {
            skip -= buffer.len();
            continue;
        }
        let slice = &mut buffer[skip..];
        iov.push(libc::iovec {
            iov_base: slice.as_mut_ptr().cast(),
            iov_len: slice.len(),
        });
        skip = 0;
        if iov.len() == IOV_CHUNK {
            break;
        }
    }
    iov
}

fn iovecs(buffers: &[Bytes], mut skip: usize) -> Vec<libc::iovec> {
    let mut iov = Vec::with_capacity(buffers.len().min(IOV_CHUNK));
    for buffer in buffers.iter() {
        if skip >= buffer.len() {
            skip -= buffer.len();
            continue;
        }
        let slice = &buffer[skip..];
        iov.push(libc::iovec {
            iov_base: slice.as_ptr() as *mut libc::c_void,
            iov_len: slice.len(),
        });
        skip = 0;
        if iov.len() == IOV_CHUNK {
            break;
        }
    }
    iov
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iovec_skip_spans_buffers() {
        let buffers = vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")];
        let iov = iovecs(&buffers, 6);
        assert_eq!(iov.len(), 1);
        assert_eq!(iov[0].iov_len, 2);

        let iov = iovecs(&buffers, 4);
        assert_eq!(iov.len(), 1);
        assert_eq!(iov[0].iov_len, 4);

        let iov = iovecs(&buffers, 0);
        assert_eq!(iov.len(), 2);
    }

    #[test]
    fn iovec_skip_past_everything_is_empty() {
        let buffers = vec![Bytes::from_static(b"abcd")];
        assert!(iovecs(&buffers, 4).is_empty());
    }
}
