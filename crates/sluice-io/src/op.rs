//! Operation identities, references, and completion cells.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use sluice_common::{IoError, IoResult};

use crate::handle::IoHandle;

/// The outcome of one dispatcher operation: the resulting handle, `None` for
/// operations that produce no handle (`rmdir`, `rmfile`, path-only `dir`),
/// or the error.
pub type OpOutcome = IoResult<Option<Arc<IoHandle>>>;

/// A unique operation identifier.
///
/// Ids increase monotonically and are never reused within a dispatcher's
/// lifetime. Zero is the sentinel meaning "no precondition".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct OpId(u64);

impl OpId {
    /// The "no precondition" sentinel.
    pub const NONE: Self = Self(0);

    #[inline]
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is the "no precondition" sentinel.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "OpId(NONE)")
        } else {
            write!(f, "OpId({})", self.0)
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind tag carried by every operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)] // Variant names mirror the dispatcher surface.
pub enum OpKind {
    Unknown,
    UserCompletion,
    Dir,
    Rmdir,
    File,
    Rmfile,
    Sync,
    Close,
    Read,
    Write,
}

impl OpKind {
    /// Number of distinct kinds, for per-kind counters.
    pub const COUNT: usize = 10;

    #[inline]
    pub(crate) const fn as_index(self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::UserCompletion => 1,
            Self::Dir => 2,
            Self::Rmdir => 3,
            Self::File => 4,
            Self::Rmfile => 5,
            Self::Sync => 6,
            Self::Close => 7,
            Self::Read => 8,
            Self::Write => 9,
        }
    }
}

/// Shared state between every reference to one operation.
///
/// The cell is fulfilled exactly once; later fulfilment attempts are
/// discarded. Many threads may wait on or peek at the value.
pub(crate) struct CompletionCell {
    slot: Mutex<Option<OpOutcome>>,
    ready: Condvar,
}

impl CompletionCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    /// A cell that is already resolved.
    pub(crate) fn ready(outcome: OpOutcome) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Some(outcome)),
            ready: Condvar::new(),
        })
    }

    /// Fulfils the cell. Returns false (and discards `outcome`) if it was
    /// already fulfilled.
    pub(crate) fn fulfill(&self, outcome: OpOutcome) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    /// Blocks until the cell is fulfilled and returns a copy of the outcome.
    pub(crate) fn wait(&self) -> OpOutcome {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.ready.wait(&mut slot);
        }
    }

    /// Returns a copy of the outcome if the cell is already fulfilled.
    pub(crate) fn peek(&self) -> Option<OpOutcome> {
        self.slot.lock().clone()
    }
}

/// A reference to an asynchronous operation.
///
/// The reference is cheap to clone; all clones share the operation's
/// completion state. Dropping every reference does not cancel the operation.
#[derive(Clone)]
pub struct OpRef {
    id: OpId,
    cell: Arc<CompletionCell>,
}

impl OpRef {
    pub(crate) fn new(id: OpId, cell: Arc<CompletionCell>) -> Self {
        Self { id, cell }
    }

    /// A reference with no operation behind it, usable as the "no
    /// precondition" input of a request.
    #[must_use]
    pub fn none() -> Self {
        Self {
            id: OpId::NONE,
            cell: CompletionCell::ready(Ok(None)),
        }
    }

    /// An id-only reference used internally as a precondition carrier.
    pub(crate) fn carrier(id: OpId) -> Self {
        Self {
            id,
            cell: CompletionCell::new(),
        }
    }

    /// This operation's id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Blocks until the operation completes and returns its outcome.
    pub fn wait(&self) -> OpOutcome {
        self.cell.wait()
    }

    /// Blocks until the operation completes; errors if it resolved without
    /// producing a handle.
    pub fn wait_handle(&self) -> IoResult<Arc<IoHandle>> {
        self.cell.wait()?.ok_or_else(|| {
            IoError::invalid_argument("operation resolved without producing a handle")
        })
    }

    /// Returns the outcome if the operation has already completed.
    pub fn try_outcome(&self) -> Option<OpOutcome> {
        self.cell.peek()
    }

    /// The already-resolved handle, if there is one.
    pub(crate) fn peek_handle(&self) -> Option<Arc<IoHandle>> {
        match self.cell.peek() {
            Some(Ok(handle)) => handle,
            _ => None,
        }
    }
}

impl fmt::Debug for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRef")
            .field("id", &self.id)
            .field("resolved", &self.cell.peek().is_some())
            .finish()
    }
}
