//! Platform backends implementing the operation primitive set.
//!
//! A primitive takes `(id, inbound handle, request)` and returns either
//! [`Step::Done`] with the resulting handle, or [`Step::Pending`] when the
//! completion will be reported later from outside the worker. Only backends
//! that advertise [`Backend::defers_data_ops`] may return `Pending` from
//! their data primitives.

pub(crate) mod portable;
#[cfg(unix)]
pub(crate) mod posix;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use sluice_common::{FileFlags, IoResult};

use crate::dispatcher::DispatcherInner;
use crate::handle::{Caching, IoHandle};
use crate::op::OpId;
use crate::request::{NameSource, PathArgs, ReadSink};

/// The result of running a primitive.
pub(crate) enum Step {
    /// The op completed on this worker, producing this handle (or none).
    Done(Option<Arc<IoHandle>>),
    /// Completion will arrive later via the completion dispatcher.
    Pending,
}

/// The operation primitive set every platform backend provides.
pub(crate) trait Backend: Send + Sync + 'static {
    /// True if this backend's read/write primitives complete out of line.
    fn defers_data_ops(&self) -> bool;

    fn dir(&self, d: &Arc<DispatcherInner>, id: OpId, args: PathArgs) -> IoResult<Step>;
    fn rmdir(&self, d: &Arc<DispatcherInner>, id: OpId, args: PathArgs) -> IoResult<Step>;
    fn file(&self, d: &Arc<DispatcherInner>, id: OpId, args: PathArgs) -> IoResult<Step>;
    fn rmfile(&self, d: &Arc<DispatcherInner>, id: OpId, args: PathArgs) -> IoResult<Step>;
    fn sync(&self, d: &Arc<DispatcherInner>, id: OpId, input: Option<Arc<IoHandle>>)
        -> IoResult<Step>;
    fn close(
        &self,
        d: &Arc<DispatcherInner>,
        id: OpId,
        input: Option<Arc<IoHandle>>,
    ) -> IoResult<Step>;
    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        d: &Arc<DispatcherInner>,
        id: OpId,
        input: Option<Arc<IoHandle>>,
        offset: u64,
        sink: ReadSink,
        deadline: Option<Duration>,
    ) -> IoResult<Step>;
    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        d: &Arc<DispatcherInner>,
        id: OpId,
        input: Option<Arc<IoHandle>>,
        offset: u64,
        buffers: Vec<Bytes>,
        deadline: Option<Duration>,
    ) -> IoResult<Step>;
    fn random_file(
        &self,
        d: &Arc<DispatcherInner>,
        id: OpId,
        dir: PathBuf,
        flags: FileFlags,
        names: Option<NameSource>,
    ) -> IoResult<Step>;
    fn temp_inode(
        &self,
        d: &Arc<DispatcherInner>,
        id: OpId,
        dir: PathBuf,
        flags: FileFlags,
    ) -> IoResult<Step>;
}

/// The backend for this platform.
pub(crate) fn platform_backend() -> Box<dyn Backend> {
    #[cfg(unix)]
    {
        Box::new(posix::PosixBackend)
    }
    #[cfg(not(unix))]
    {
        Box::new(portable::PortableBackend)
    }
}

/// Maps open flags to the handle's caching hint, following the
/// direct/write-through split.
pub(crate) fn caching_for(flags: FileFlags) -> Caching {
    let direct = flags.contains(FileFlags::OS_DIRECT);
    let write_through = flags.contains(FileFlags::OS_SYNC);
    match (direct, write_through) {
        (true, true) => Caching::None,
        (true, false) => Caching::MetadataOnly,
        (false, true) => Caching::DataOnly,
        (false, false) => {
            if flags.contains(FileFlags::DELETE_ON_CLOSE) {
                Caching::Temporary
            } else {
                Caching::All
            }
        }
    }
}

/// Truncates scatter buffers so that exactly the first `filled` bytes across
/// them remain; buffers past the transfer end up empty.
pub(crate) fn clip_buffers(buffers: &mut [BytesMut], mut filled: usize) {
    for buffer in buffers {
        let keep = filled.min(buffer.len());
        buffer.truncate(keep);
        filled -= keep;
    }
}
