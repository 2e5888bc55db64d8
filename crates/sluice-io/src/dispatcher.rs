//! The dispatcher: operation registry, id allocation, dependency chaining,
//! and completion dispatch.
//!
//! A caller submits a batch of requests, each carrying a precondition (a
//! prior operation reference). The dispatcher allocates an id and either
//! chains the work onto the precondition's completion list (if that op is
//! still in flight) or enqueues it on the worker pool immediately. When the
//! primitive runs it either completes synchronously, in which case the
//! completion dispatcher is invoked inline, or reports that completion is
//! deferred and will be delivered later from outside the worker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use sluice_common::utils;
use sluice_common::{invariant_failure, FileFlags, IoError, IoResult};
use sluice_pool::WorkerPool;

use crate::backend::{platform_backend, Backend, Step};
use crate::handle::IoHandle;
use crate::op::{CompletionCell, OpId, OpKind, OpOutcome, OpRef};
use crate::request::{
    CompletionRequest, NameSource, PathArgs, PathRequest, ReadRequest, ReadSink, TempRequest,
    UserCallback, UserStep, WriteRequest,
};

/// The operation-specific payload bound into a pending thunk.
pub(crate) enum Payload {
    /// `dir` / `rmdir` / `file` / `rmfile`.
    Path(PathArgs),
    /// `sync` / `close`: the inbound handle is the whole input.
    HandleOnly,
    /// Scatter read at an offset.
    Read {
        offset: u64,
        sink: ReadSink,
        deadline: Option<Duration>,
    },
    /// Gather write at an offset.
    Write {
        offset: u64,
        buffers: Vec<Bytes>,
        deadline: Option<Duration>,
    },
    /// User continuation.
    User { callback: UserCallback },
    /// Randomly named exclusive-create file.
    RandomFile {
        dir: PathBuf,
        flags: FileFlags,
        names: Option<NameSource>,
    },
    /// Anonymous inode bound only to open descriptors.
    TempInode { dir: PathBuf, flags: FileFlags },
}

/// A not-yet-run operation thunk: the kind tag plus its payload. The parent
/// handle is bound in when the thunk is dispatched.
pub(crate) struct PendingTask {
    pub kind: OpKind,
    pub payload: Payload,
}

struct Operation {
    kind: OpKind,
    cell: Arc<CompletionCell>,
    /// True if the primitive may report completion later from outside the
    /// worker that started it.
    deferred: bool,
    /// Ops chained onto this one, dispatched in insertion order at
    /// completion.
    children: Vec<(OpId, PendingTask)>,
}

struct OpTable {
    next_id: u64,
    ops: HashMap<u64, Operation>,
    shutting_down: bool,
}

struct ChainItem {
    precondition: OpRef,
    kind: OpKind,
    payload: Payload,
    deferred: bool,
}

pub(crate) struct DispatcherStats {
    completed: [AtomicU64; OpKind::COUNT],
}

impl DispatcherStats {
    fn new() -> Self {
        Self {
            completed: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn record(&self, kind: OpKind) {
        self.completed[kind.as_index()].fetch_add(1, Ordering::AcqRel);
    }

    fn get(&self, kind: OpKind) -> u64 {
        self.completed[kind.as_index()].load(Ordering::Acquire)
    }
}

pub(crate) struct DispatcherInner {
    pool: Arc<WorkerPool>,
    flags_force: FileFlags,
    flags_mask: FileFlags,
    pub(crate) backend: Box<dyn Backend>,
    ops: Mutex<OpTable>,
    idle: Condvar,
    fds: Mutex<HashMap<u64, std::sync::Weak<IoHandle>>>,
    stats: DispatcherStats,
}

impl DispatcherInner {
    /// The effective flags for every op: `(flags & !mask) | force`.
    pub(crate) fn effective_flags(&self, flags: FileFlags) -> FileFlags {
        flags.effective(self.flags_force, self.flags_mask)
    }

    pub(crate) fn register_handle(&self, handle: &Arc<IoHandle>) {
        let key = handle.registry_key();
        if key == 0 {
            return;
        }
        self.fds.lock().insert(key, Arc::downgrade(handle));
        handle.mark_registered();
    }

    pub(crate) fn deregister_handle(&self, key: u64) {
        self.fds.lock().remove(&key);
    }

    fn chain_batch(this: &Arc<Self>, items: Vec<ChainItem>) -> Vec<OpRef> {
        let mut table = this.ops.lock();
        items
            .into_iter()
            .map(|item| Self::chain_op_locked(this, &mut table, item))
            .collect()
    }

    /// Chains an op emitted by a backend primitive onto `precondition`,
    /// which is expected to still be in the registry.
    pub(crate) fn chain_after(
        this: &Arc<Self>,
        precondition: OpId,
        kind: OpKind,
        payload: Payload,
    ) -> OpRef {
        let mut table = this.ops.lock();
        Self::chain_op_locked(
            this,
            &mut table,
            ChainItem {
                precondition: OpRef::carrier(precondition),
                kind,
                payload,
                deferred: false,
            },
        )
    }

    /// Registers one operation under `ops_lock` and either links it onto its
    /// precondition's completion list or enqueues it immediately.
    fn chain_op_locked(this: &Arc<Self>, table: &mut OpTable, item: ChainItem) -> OpRef {
        // Allocate the next id, skipping the zero sentinel.
        table.next_id = table.next_id.wrapping_add(1);
        if table.next_id == 0 {
            table.next_id = 1;
        }
        let id = OpId::new(table.next_id);

        if table.shutting_down {
            return OpRef::new(id, CompletionCell::ready(Err(IoError::CancelledAtShutdown)));
        }

        let cell = CompletionCell::new();
        let task = PendingTask {
            kind: item.kind,
            payload: item.payload,
        };
        let precondition = item.precondition;

        // If the precondition is still in flight, append to its completion
        // list; otherwise the op is enqueued right away with whatever handle
        // the precondition resolved to.
        let mut queued = Some(task);
        if !precondition.id().is_none() {
            if let Some(dep) = table.ops.get_mut(&precondition.id().as_u64()) {
                if let Some(task) = queued.take() {
                    dep.children.push((id, task));
                    trace!(id = id.as_u64(), dep = precondition.id().as_u64(), "op chained");
                }
            }
        }
        table.ops.insert(
            id.as_u64(),
            Operation {
                kind: item.kind,
                cell: Arc::clone(&cell),
                deferred: item.deferred,
                children: Vec::new(),
            },
        );
        if let Some(task) = queued {
            let input = if precondition.id().is_none() {
                None
            } else {
                precondition.peek_handle()
            };
            trace!(id = id.as_u64(), kind = ?item.kind, "op enqueued");
            let runner = Arc::clone(this);
            this.pool.execute(move || runner.run_task(id, input, task));
        }
        OpRef::new(id, cell)
    }

    /// Runs one primitive on a worker and routes its result into the
    /// completion dispatcher.
    fn run_task(self: Arc<Self>, id: OpId, input: Option<Arc<IoHandle>>, task: PendingTask) {
        trace!(id = id.as_u64(), kind = ?task.kind, "running op");
        match Self::execute_primitive(&self, id, input, task) {
            Ok(Step::Done(handle)) => Self::complete_async_op(&self, id, Ok(handle)),
            Ok(Step::Pending) => self.check_deferred(id),
            Err(err) => {
                debug!(id = id.as_u64(), error = %err, "op failed");
                Self::complete_async_op(&self, id, Err(err));
            }
        }
    }

    fn execute_primitive(
        this: &Arc<Self>,
        id: OpId,
        input: Option<Arc<IoHandle>>,
        task: PendingTask,
    ) -> IoResult<Step> {
        match task.payload {
            Payload::Path(mut args) => {
                args.flags = this.effective_flags(args.flags);
                match task.kind {
                    OpKind::Dir => this.backend.dir(this, id, args),
                    OpKind::Rmdir => this.backend.rmdir(this, id, args),
                    OpKind::File => this.backend.file(this, id, args),
                    OpKind::Rmfile => this.backend.rmfile(this, id, args),
                    _ => Err(IoError::invalid_argument("path payload on a non-path op")),
                }
            }
            Payload::HandleOnly => match task.kind {
                OpKind::Sync => this.backend.sync(this, id, input),
                OpKind::Close => this.backend.close(this, id, input),
                _ => Err(IoError::invalid_argument("handle payload on a non-handle op")),
            },
            Payload::Read {
                offset,
                sink,
                deadline,
            } => this.backend.read(this, id, input, offset, sink, deadline),
            Payload::Write {
                offset,
                buffers,
                deadline,
            } => this.backend.write(this, id, input, offset, buffers, deadline),
            Payload::User { callback } => match callback(id, input)? {
                UserStep::Complete(handle) => Ok(Step::Done(handle)),
                UserStep::Deferred => Ok(Step::Pending),
            },
            Payload::RandomFile { dir, flags, names } => {
                this.backend
                    .random_file(this, id, dir, this.effective_flags(flags), names)
            }
            Payload::TempInode { dir, flags } => {
                this.backend
                    .temp_inode(this, id, dir, this.effective_flags(flags))
            }
        }
    }

    /// Only primitives of ops set up for deferred completion may return
    /// [`Step::Pending`].
    fn check_deferred(&self, id: OpId) {
        let table = self.ops.lock();
        if let Some(op) = table.ops.get(&id.as_u64()) {
            if !op.deferred {
                invariant_failure("primitive deferred completion on an op without a deferred record");
            }
        }
    }

    /// The completion dispatcher: moves the op's chained children onto the
    /// pool, fulfils its completion cell, and erases it from the registry.
    pub(crate) fn complete_async_op(this: &Arc<Self>, id: OpId, outcome: OpOutcome) {
        let mut table = this.ops.lock();
        if !Self::complete_locked(this, &mut table, id, outcome) {
            if table.shutting_down {
                trace!(id = id.as_u64(), "late completion discarded at shutdown");
                return;
            }
            invariant_failure("operation missing from the registry at completion");
        }
    }

    fn complete_locked(
        this: &Arc<Self>,
        table: &mut OpTable,
        id: OpId,
        outcome: OpOutcome,
    ) -> bool {
        let Some(op) = table.ops.remove(&id.as_u64()) else {
            return false;
        };
        let input = match &outcome {
            Ok(handle) => handle.clone(),
            Err(_) => None,
        };
        for (child_id, task) in op.children {
            if !table.ops.contains_key(&child_id.as_u64()) {
                if table.shutting_down {
                    continue;
                }
                invariant_failure("chained child missing from the registry");
            }
            trace!(parent = id.as_u64(), child = child_id.as_u64(), "dispatching chained op");
            let runner = Arc::clone(this);
            let handle = input.clone();
            this.pool
                .execute(move || runner.run_task(child_id, handle, task));
        }
        this.stats.record(op.kind);
        if !op.cell.fulfill(outcome) {
            trace!(id = id.as_u64(), "completion cell already fulfilled");
        }
        trace!(id = id.as_u64(), "op completed");
        if table.ops.is_empty() {
            this.idle.notify_all();
        }
        true
    }

    fn wait_idle(&self) {
        let mut table = self.ops.lock();
        while !table.ops.is_empty() {
            self.idle.wait(&mut table);
        }
    }

    /// Cancels everything still in the registry. Ops already running on
    /// workers complete into the void; ops never dispatched resolve to
    /// [`IoError::CancelledAtShutdown`].
    fn shutdown(&self) {
        let mut table = self.ops.lock();
        if table.shutting_down {
            return;
        }
        table.shutting_down = true;
        let cancelled: Vec<Operation> = table.ops.drain().map(|(_, op)| op).collect();
        if !cancelled.is_empty() {
            debug!(cancelled = cancelled.len(), "dispatcher shutting down with pending ops");
        }
        for op in &cancelled {
            op.cell.fulfill(Err(IoError::CancelledAtShutdown));
        }
        self.idle.notify_all();
    }
}

/// Builds a [`Dispatcher`] with a force/mask flag pair applied to every
/// submitted operation.
pub struct DispatcherBuilder {
    pool: Arc<WorkerPool>,
    flags_force: FileFlags,
    flags_mask: FileFlags,
    portable_io: bool,
}

impl DispatcherBuilder {
    /// Starts a builder over the given worker pool.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            flags_force: FileFlags::empty(),
            flags_mask: FileFlags::empty(),
            portable_io: false,
        }
    }

    /// Flags OR-ed into every operation's request flags.
    #[must_use]
    pub fn flags_force(mut self, flags: FileFlags) -> Self {
        self.flags_force = flags;
        self
    }

    /// Flags stripped from every operation's request flags before the force
    /// set is applied.
    #[must_use]
    pub fn flags_mask(mut self, flags: FileFlags) -> Self {
        self.flags_mask = flags;
        self
    }

    /// Uses the portable seek-locked backend even where a positional one is
    /// available.
    #[must_use]
    pub fn with_portable_io(mut self) -> Self {
        self.portable_io = true;
        self
    }

    /// Builds the dispatcher.
    pub fn build(self) -> Dispatcher {
        let backend: Box<dyn Backend> = if self.portable_io {
            Box::new(crate::backend::portable::PortableBackend)
        } else {
            platform_backend()
        };
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                pool: self.pool,
                flags_force: self.flags_force,
                flags_mask: self.flags_mask,
                backend,
                ops: Mutex::new(OpTable {
                    next_id: 0,
                    ops: HashMap::new(),
                    shutting_down: false,
                }),
                idle: Condvar::new(),
                fds: Mutex::new(HashMap::new()),
                stats: DispatcherStats::new(),
            }),
        }
    }
}

/// Dispatches file-system and byte-level operations onto a worker pool,
/// chaining them via dataflow preconditions.
///
/// Every batch method returns one [`OpRef`] per input request, in order.
/// Dropping the dispatcher cancels operations that have not started; their
/// outcomes resolve to [`IoError::CancelledAtShutdown`].
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// A dispatcher over `pool` with no forced or masked flags.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        DispatcherBuilder::new(pool).build()
    }

    /// Starts a [`DispatcherBuilder`].
    pub fn builder(pool: Arc<WorkerPool>) -> DispatcherBuilder {
        DispatcherBuilder::new(pool)
    }

    fn path_ops(&self, kind: OpKind, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        let items = reqs
            .into_iter()
            .map(|req| ChainItem {
                precondition: req.precondition,
                kind,
                payload: Payload::Path(PathArgs {
                    path: req.path,
                    flags: req.flags,
                }),
                deferred: false,
            })
            .collect();
        DispatcherInner::chain_batch(&self.inner, items)
    }

    /// Schedules directory creations/opens.
    pub fn dir(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        self.path_ops(OpKind::Dir, reqs)
    }

    /// Schedules directory removals.
    pub fn rmdir(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        self.path_ops(OpKind::Rmdir, reqs)
    }

    /// Schedules file creations/opens.
    pub fn file(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        self.path_ops(OpKind::File, reqs)
    }

    /// Schedules file removals.
    pub fn rmfile(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        self.path_ops(OpKind::Rmfile, reqs)
    }

    /// Schedules kernel flushes of the handles produced by `ops`.
    pub fn sync(&self, ops: Vec<OpRef>) -> Vec<OpRef> {
        let items = ops
            .into_iter()
            .map(|op| ChainItem {
                precondition: op,
                kind: OpKind::Sync,
                payload: Payload::HandleOnly,
                deferred: false,
            })
            .collect();
        DispatcherInner::chain_batch(&self.inner, items)
    }

    /// Schedules closes of the handles produced by `ops`.
    ///
    /// On POSIX, closing a file that was ever fsynced additionally chains an
    /// open→sync→close of its containing directory onto the close, so that
    /// directory entry updates reach storage.
    pub fn close(&self, ops: Vec<OpRef>) -> Vec<OpRef> {
        let items = ops
            .into_iter()
            .map(|op| ChainItem {
                precondition: op,
                kind: OpKind::Close,
                payload: Payload::HandleOnly,
                deferred: false,
            })
            .collect();
        DispatcherInner::chain_batch(&self.inner, items)
    }

    /// Schedules scatter reads.
    pub fn read(&self, reqs: Vec<ReadRequest>) -> Vec<OpRef> {
        let deferred = self.inner.backend.defers_data_ops();
        let items = reqs
            .into_iter()
            .map(|req| ChainItem {
                precondition: req.precondition,
                kind: OpKind::Read,
                payload: Payload::Read {
                    offset: req.offset,
                    sink: req.sink,
                    deadline: req.deadline,
                },
                deferred,
            })
            .collect();
        DispatcherInner::chain_batch(&self.inner, items)
    }

    /// Schedules gather writes.
    pub fn write(&self, reqs: Vec<WriteRequest>) -> Vec<OpRef> {
        let deferred = self.inner.backend.defers_data_ops();
        let items = reqs
            .into_iter()
            .map(|req| ChainItem {
                precondition: req.precondition,
                kind: OpKind::Write,
                payload: Payload::Write {
                    offset: req.offset,
                    buffers: req.buffers,
                    deadline: req.deadline,
                },
                deferred,
            })
            .collect();
        DispatcherInner::chain_batch(&self.inner, items)
    }

    /// Schedules user continuations, one per op in `ops`.
    pub fn completion(&self, ops: &[OpRef], callbacks: Vec<CompletionRequest>) -> Vec<OpRef> {
        debug_assert_eq!(ops.len(), callbacks.len());
        let items = ops
            .iter()
            .cloned()
            .zip(callbacks)
            .map(|(op, req)| ChainItem {
                precondition: op,
                kind: OpKind::UserCompletion,
                payload: Payload::User {
                    callback: req.callback,
                },
                deferred: req.deferred,
            })
            .collect();
        DispatcherInner::chain_batch(&self.inner, items)
    }

    /// Completes a deferred user operation from outside the worker that
    /// started it.
    pub fn complete_deferred(&self, op: &OpRef, outcome: OpOutcome) -> IoResult<()> {
        let mut table = self.inner.ops.lock();
        match table.ops.get(&op.id().as_u64()).map(|rec| rec.deferred) {
            None => Err(IoError::invalid_argument(
                "operation is unknown or already complete",
            )),
            Some(false) => Err(IoError::invalid_argument("operation was not deferred")),
            Some(true) => {
                DispatcherInner::complete_locked(&self.inner, &mut table, op.id(), outcome);
                Ok(())
            }
        }
    }

    /// Schedules randomly named exclusive-create files. A name collision is
    /// retried with a fresh name; no error surfaces for it.
    pub fn random_file(&self, reqs: Vec<TempRequest>) -> Vec<OpRef> {
        let items = reqs
            .into_iter()
            .map(|req| ChainItem {
                precondition: req.precondition,
                kind: OpKind::File,
                payload: Payload::RandomFile {
                    dir: req.dir,
                    flags: req.flags,
                    names: req.names,
                },
                deferred: false,
            })
            .collect();
        DispatcherInner::chain_batch(&self.inner, items)
    }

    /// Schedules creation of a file under the probed temporary directory.
    ///
    /// With a name, the file is opened at that path with delete-on-close
    /// semantics; without one, this is `random_file` in the temporary
    /// directory.
    pub fn temp_file(&self, name: Option<&str>, flags: FileFlags) -> OpRef {
        let dir = utils::temporary_files_directory();
        let mut ops = match name {
            Some(name) => self.file(vec![PathRequest::new(
                dir.join(name),
                flags | FileFlags::DELETE_ON_CLOSE,
            )]),
            None => self.random_file(vec![TempRequest::new(dir).flags(flags)]),
        };
        ops.pop().expect("one op per request")
    }

    /// Schedules creation of an anonymous inode on the file system holding
    /// `dir`. The inode has no path and ceases to exist when its last handle
    /// closes.
    pub fn temp_inode(&self, dir: impl Into<PathBuf>) -> OpRef {
        let mut ops = DispatcherInner::chain_batch(
            &self.inner,
            vec![ChainItem {
                precondition: OpRef::none(),
                kind: OpKind::File,
                payload: Payload::TempInode {
                    dir: dir.into(),
                    flags: FileFlags::READ_WRITE,
                },
                deferred: false,
            }],
        );
        ops.pop().expect("one op per request")
    }

    /// The effective flags the dispatcher would use for `flags`.
    pub fn effective_flags(&self, flags: FileFlags) -> FileFlags {
        self.inner.effective_flags(flags)
    }

    /// Number of operations currently in the registry.
    pub fn wait_queue_depth(&self) -> usize {
        self.inner.ops.lock().ops.len()
    }

    /// Number of live handles registered with this dispatcher.
    pub fn open_handle_count(&self) -> usize {
        self.inner
            .fds
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of completion dispatches that have run for `kind`.
    pub fn completed_ops(&self, kind: OpKind) -> u64 {
        self.inner.stats.get(kind)
    }

    /// Blocks until the operation registry is empty.
    pub fn wait_idle(&self) {
        self.inner.wait_idle();
    }

    /// Cancels all pending operations. Called automatically on drop.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_depth", &self.wait_queue_depth())
            .field("open_handles", &self.open_handle_count())
            .field("flags_force", &self.inner.flags_force)
            .field("flags_mask", &self.inner.flags_mask)
            .finish()
    }
}
