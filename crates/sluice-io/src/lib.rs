//! # sluice-io
//!
//! The sluice dispatcher core: an operation registry with dataflow
//! dependency chaining, executed on a worker pool using the host's most
//! efficient available file I/O facilities.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Dispatcher                   │
//! │   registry · id allocation · chaining ·      │
//! │   completion dispatch · deferred completions │
//! └──────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌───────────────────┐   ┌─────────────────────┐
//! │   PosixBackend    │   │   PortableBackend   │
//! │ preadv / pwritev  │   │ seek-locked std::fs │
//! │ Unix only         │   │ all platforms       │
//! └───────────────────┘   └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice_common::FileFlags;
//! use sluice_io::{Dispatcher, PathRequest, WriteRequest};
//! use sluice_pool::WorkerPool;
//!
//! fn example() -> sluice_common::IoResult<()> {
//!     let pool = Arc::new(WorkerPool::new(4));
//!     let dispatcher = Dispatcher::new(pool);
//!
//!     let file = dispatcher
//!         .file(vec![PathRequest::new("/tmp/data.bin", FileFlags::for_create())])
//!         .remove(0);
//!     let write = dispatcher
//!         .write(vec![WriteRequest::single(file, 0, &b"hello"[..])])
//!         .remove(0);
//!     let close = dispatcher.close(vec![write]).remove(0);
//!     close.wait()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backend;
mod dispatcher;
mod handle;
mod op;
mod request;

pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use handle::{Caching, IoHandle};
pub use op::{OpId, OpKind, OpOutcome, OpRef};
pub use request::{
    CompletionRequest, NameSource, PathRequest, ReadRequest, ReadSink, TempRequest, UserCallback,
    UserStep, WriteRequest,
};
