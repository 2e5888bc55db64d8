//! Request bundles submitted to the dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use sluice_common::{FileFlags, IoResult};

use crate::handle::IoHandle;
use crate::op::{OpId, OpRef};

/// A path-based request for `dir`, `rmdir`, `file`, and `rmfile`.
#[derive(Debug, Clone)]
pub struct PathRequest {
    /// An optional precondition for this operation.
    pub precondition: OpRef,
    /// The filing-system path to operate on.
    pub path: PathBuf,
    /// Flags for this operation. The dispatcher's force/mask pair is applied
    /// on top.
    pub flags: FileFlags,
}

impl PathRequest {
    /// A request with no precondition.
    pub fn new(path: impl Into<PathBuf>, flags: FileFlags) -> Self {
        Self {
            precondition: OpRef::none(),
            path: path.into(),
            flags,
        }
    }

    /// A request chained onto `precondition`.
    pub fn after(precondition: OpRef, path: impl Into<PathBuf>, flags: FileFlags) -> Self {
        Self {
            precondition,
            path: path.into(),
            flags,
        }
    }
}

/// Internal path payload after the precondition has been split off.
#[derive(Debug, Clone)]
pub(crate) struct PathArgs {
    pub path: PathBuf,
    pub flags: FileFlags,
}

/// The scatter buffers a read fills.
///
/// The caller keeps a clone of the sink and takes the filled buffers once
/// the operation resolves; each buffer is truncated to the bytes actually
/// transferred into it.
#[derive(Clone)]
pub struct ReadSink {
    inner: Arc<Mutex<Vec<BytesMut>>>,
}

impl ReadSink {
    /// A sink over the given buffers. Each buffer's current length is the
    /// number of bytes requested at its position.
    pub fn new(buffers: Vec<BytesMut>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffers)),
        }
    }

    /// A sink of zeroed buffers with the given lengths.
    pub fn with_lengths(lengths: &[usize]) -> Self {
        Self::new(lengths.iter().map(|&len| BytesMut::zeroed(len)).collect())
    }

    /// Takes the buffers out of the sink.
    pub fn take(&self) -> Vec<BytesMut> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Total requested length across all buffers.
    pub fn total_len(&self) -> usize {
        self.inner.lock().iter().map(BytesMut::len).sum()
    }

    pub(crate) fn with_buffers<R>(&self, f: impl FnOnce(&mut Vec<BytesMut>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl std::fmt::Debug for ReadSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSink")
            .field("buffers", &self.inner.lock().len())
            .finish()
    }
}

/// A scatter-read request: fill `sink` from the inbound handle starting at
/// `offset`.
#[derive(Debug)]
pub struct ReadRequest {
    /// The operation producing the handle to read from.
    pub precondition: OpRef,
    /// Byte offset the scatter read starts at.
    pub offset: u64,
    /// Destination buffers.
    pub sink: ReadSink,
    /// Accepted for interface symmetry; backends without interruptible I/O
    /// ignore it.
    pub deadline: Option<Duration>,
}

impl ReadRequest {
    /// A read of `sink` at `offset`, chained onto `precondition`.
    pub fn new(precondition: OpRef, offset: u64, sink: ReadSink) -> Self {
        Self {
            precondition,
            offset,
            sink,
            deadline: None,
        }
    }
}

/// A gather-write request: write `buffers` to the inbound handle starting at
/// `offset`.
#[derive(Debug)]
pub struct WriteRequest {
    /// The operation producing the handle to write to.
    pub precondition: OpRef,
    /// Byte offset the gather write starts at.
    pub offset: u64,
    /// Source buffers, written back to back.
    pub buffers: Vec<Bytes>,
    /// Accepted for interface symmetry; backends without interruptible I/O
    /// ignore it.
    pub deadline: Option<Duration>,
}

impl WriteRequest {
    /// A write of `buffers` at `offset`, chained onto `precondition`.
    pub fn new(precondition: OpRef, offset: u64, buffers: Vec<Bytes>) -> Self {
        Self {
            precondition,
            offset,
            buffers,
            deadline: None,
        }
    }

    /// Convenience constructor for a single gather buffer.
    pub fn single(precondition: OpRef, offset: u64, data: impl Into<Bytes>) -> Self {
        Self::new(precondition, offset, vec![data.into()])
    }

    /// Total length across all gather buffers.
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }
}

/// What a user completion callback tells the dispatcher.
pub enum UserStep {
    /// The operation is complete, with the given resulting handle.
    Complete(Option<Arc<IoHandle>>),
    /// Completion will be reported later via
    /// [`Dispatcher::complete_deferred`](crate::Dispatcher::complete_deferred).
    Deferred,
}

/// A user completion callback, invoked on a worker with the operation's id
/// and the precondition's resulting handle.
pub type UserCallback = Arc<dyn Fn(OpId, Option<Arc<IoHandle>>) -> IoResult<UserStep> + Send + Sync>;

/// One user continuation paired with an operation in
/// [`Dispatcher::completion`](crate::Dispatcher::completion).
pub struct CompletionRequest {
    /// True if the callback may return [`UserStep::Deferred`].
    pub deferred: bool,
    /// The continuation to run when the paired operation completes.
    pub callback: UserCallback,
}

impl CompletionRequest {
    /// A synchronously-completing continuation.
    pub fn new(callback: UserCallback) -> Self {
        Self {
            deferred: false,
            callback,
        }
    }

    /// A continuation that may defer its completion.
    pub fn deferred(callback: UserCallback) -> Self {
        Self {
            deferred: true,
            callback,
        }
    }
}

/// A source of candidate names for `random_file`, injectable for tests.
pub type NameSource = Arc<dyn Fn() -> String + Send + Sync>;

/// A request for a randomly named exclusive-create file under a directory.
#[derive(Clone)]
pub struct TempRequest {
    /// An optional precondition for this operation.
    pub precondition: OpRef,
    /// Directory the file is created in.
    pub dir: PathBuf,
    /// Flags for the new file; exclusive creation is always added.
    pub flags: FileFlags,
    /// Overrides the random-name generator. `None` uses 32 random
    /// alphanumeric characters.
    pub names: Option<NameSource>,
}

impl TempRequest {
    /// A write-mode request with no precondition and random names.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            precondition: OpRef::none(),
            dir: dir.into(),
            flags: FileFlags::READ_WRITE,
            names: None,
        }
    }

    /// Replaces the file flags.
    #[must_use]
    pub fn flags(mut self, flags: FileFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Injects a deterministic name source.
    #[must_use]
    pub fn names(mut self, names: NameSource) -> Self {
        self.names = Some(names);
        self
    }
}

impl std::fmt::Debug for TempRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempRequest")
            .field("dir", &self.dir)
            .field("flags", &self.flags)
            .field("injected_names", &self.names.is_some())
            .finish()
    }
}
