//! End-to-end dispatcher scenarios.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tempfile::tempdir;

use sluice_common::{FileFlags, IoError};
use sluice_io::{
    CompletionRequest, Dispatcher, NameSource, OpKind, OpRef, PathRequest, ReadRequest, ReadSink,
    TempRequest, UserStep, WriteRequest,
};
use sluice_pool::WorkerPool;

fn dispatcher(workers: usize) -> Dispatcher {
    Dispatcher::new(Arc::new(WorkerPool::new(workers)))
}

/// A user completion that never completes on its own, keeping its op in
/// flight until `complete_deferred` or shutdown resolves it.
fn gate_op(dispatcher: &Dispatcher) -> OpRef {
    dispatcher
        .completion(
            &[OpRef::none()],
            vec![CompletionRequest::deferred(Arc::new(|_, _| {
                Ok(UserStep::Deferred)
            }))],
        )
        .remove(0)
}

#[test]
fn linear_pipeline() -> Result<()> {
    let tmp = tempdir()?;
    let root = tmp.path().join("t");
    let dispatcher = dispatcher(4);

    let dir = dispatcher
        .dir(vec![PathRequest::new(&root, FileFlags::CREATE)])
        .remove(0);
    let file = dispatcher
        .file(vec![PathRequest::after(
            dir,
            root.join("a"),
            FileFlags::for_create(),
        )])
        .remove(0);
    let write = dispatcher
        .write(vec![WriteRequest::single(file, 0, &b"hello"[..])])
        .remove(0);
    let sync = dispatcher.sync(vec![write]).remove(0);
    let close = dispatcher.close(vec![sync]).remove(0);
    close.wait()?;
    dispatcher.wait_idle();

    assert_eq!(fs::read(root.join("a"))?, b"hello");

    let rm = dispatcher
        .rmfile(vec![PathRequest::new(root.join("a"), FileFlags::empty())])
        .remove(0);
    rm.wait()?;
    let reopen = dispatcher
        .file(vec![PathRequest::new(root.join("a"), FileFlags::READ)])
        .remove(0);
    assert!(matches!(reopen.wait(), Err(IoError::NotFound { .. })));

    let rmdir = dispatcher
        .rmdir(vec![PathRequest::new(&root, FileFlags::empty())])
        .remove(0);
    rmdir.wait()?;
    assert!(!root.exists());
    Ok(())
}

#[test]
fn fan_out_sibling_writes() -> Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("fan.bin");
    let dispatcher = dispatcher(4);

    let file = dispatcher
        .file(vec![PathRequest::new(&path, FileFlags::for_create())])
        .remove(0);
    let writes: Vec<OpRef> = dispatcher.write(
        (0..10u64)
            .map(|n| WriteRequest::single(file.clone(), n * 1000, vec![n as u8; 1000]))
            .collect(),
    );
    for write in &writes {
        write.wait()?;
    }
    let handle = file.wait_handle()?;
    assert_eq!(handle.bytes_written_total(), 10_000);
    assert_eq!(handle.length()?, 10_000);

    // Spot-check two non-overlapping regions.
    let sink = ReadSink::with_lengths(&[1000]);
    dispatcher
        .read(vec![ReadRequest::new(file.clone(), 7000, sink.clone())])
        .remove(0)
        .wait()?;
    assert!(sink.take()[0].iter().all(|&b| b == 7));
    Ok(())
}

#[test]
fn write_then_read_round_trip() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("rt.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    let write = dispatcher
        .write(vec![WriteRequest::new(
            file.clone(),
            100,
            vec![bytes::Bytes::from_static(b"0123"), bytes::Bytes::from_static(b"456789")],
        )])
        .remove(0);
    write.wait()?;

    let sink = ReadSink::with_lengths(&[4, 6]);
    let read = dispatcher
        .read(vec![ReadRequest::new(file, 100, sink.clone())])
        .remove(0);
    read.wait()?;
    let buffers = sink.take();
    assert_eq!(&buffers[0][..], b"0123");
    assert_eq!(&buffers[1][..], b"456789");
    Ok(())
}

#[test]
fn short_read_clips_buffers() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("short.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::single(file.clone(), 0, &b"abcdef"[..])])
        .remove(0)
        .wait()?;

    let sink = ReadSink::with_lengths(&[4, 4]);
    dispatcher
        .read(vec![ReadRequest::new(file, 0, sink.clone())])
        .remove(0)
        .wait()?;
    let buffers = sink.take();
    assert_eq!(&buffers[0][..], b"abcd");
    assert_eq!(&buffers[1][..], b"ef");
    Ok(())
}

#[test]
fn random_file_retries_colliding_names() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);

    let names = Arc::new(Mutex::new(
        vec!["dup".to_string(), "dup".to_string(), "fresh".to_string()].into_iter(),
    ));
    let source: NameSource = Arc::new(move || {
        names
            .lock()
            .next()
            .expect("test name sequence exhausted")
    });

    let first = dispatcher
        .random_file(vec![TempRequest::new(tmp.path()).names(Arc::clone(&source))])
        .remove(0);
    let first_handle = first.wait_handle()?;
    assert!(first_handle.path().ends_with("dup"));

    // The second request draws "dup" again, observes the collision
    // internally, and retries with the next name; no error surfaces.
    let second = dispatcher
        .random_file(vec![TempRequest::new(tmp.path()).names(source)])
        .remove(0);
    let second_handle = second.wait_handle()?;
    assert!(second_handle.path().ends_with("fresh"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn close_spawns_directory_sync_chain() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);

    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("durable.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    let write = dispatcher
        .write(vec![WriteRequest::single(file, 0, &b"data"[..])])
        .remove(0);
    let sync = dispatcher.sync(vec![write]).remove(0);
    let close = dispatcher.close(vec![sync]).remove(0);
    close.wait()?;
    dispatcher.wait_idle();

    // The close of a fsynced file fused a dir-open → dir-sync → dir-close
    // chain onto itself.
    assert_eq!(dispatcher.completed_ops(OpKind::File), 1);
    assert_eq!(dispatcher.completed_ops(OpKind::Write), 1);
    assert_eq!(dispatcher.completed_ops(OpKind::Dir), 1);
    assert_eq!(dispatcher.completed_ops(OpKind::Sync), 2);
    assert_eq!(dispatcher.completed_ops(OpKind::Close), 2);
    assert_eq!(dispatcher.wait_queue_depth(), 0);
    Ok(())
}

#[test]
fn unsynced_close_spawns_no_chain() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("plain.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    let close = dispatcher.close(vec![file]).remove(0);
    close.wait()?;
    dispatcher.wait_idle();
    assert_eq!(dispatcher.completed_ops(OpKind::Dir), 0);
    assert_eq!(dispatcher.completed_ops(OpKind::Sync), 0);
    assert_eq!(dispatcher.completed_ops(OpKind::Close), 1);
    Ok(())
}

#[test]
fn shutdown_cancels_pending_ops() {
    let dispatcher = dispatcher(2);
    let gate = gate_op(&dispatcher);
    let read = dispatcher
        .read(vec![ReadRequest::new(
            gate.clone(),
            0,
            ReadSink::with_lengths(&[16]),
        )])
        .remove(0);

    // Let the gate primitive report "deferred" before tearing down.
    std::thread::sleep(Duration::from_millis(50));
    drop(dispatcher);

    assert!(matches!(gate.wait(), Err(IoError::CancelledAtShutdown)));
    assert!(matches!(read.wait(), Err(IoError::CancelledAtShutdown)));
}

#[test]
fn complete_deferred_resolves_user_op() -> Result<()> {
    let dispatcher = dispatcher(2);
    let gate = gate_op(&dispatcher);
    assert!(gate.try_outcome().is_none());
    dispatcher.complete_deferred(&gate, Ok(None))?;
    assert!(matches!(gate.wait(), Ok(None)));

    // A second completion attempt no longer finds the op.
    assert!(dispatcher.complete_deferred(&gate, Ok(None)).is_err());
    Ok(())
}

#[test]
fn complete_deferred_rejects_synchronous_ops() {
    let dispatcher = dispatcher(1);
    let gate = gate_op(&dispatcher);
    let sibling = dispatcher
        .completion(
            &[gate.clone()],
            vec![CompletionRequest::new(Arc::new(|_, _| {
                Ok(UserStep::Complete(None))
            }))],
        )
        .remove(0);
    // The chained sibling has not run and is not deferred.
    assert!(dispatcher.complete_deferred(&sibling, Ok(None)).is_err());
    dispatcher.complete_deferred(&gate, Ok(None)).unwrap();
    sibling.wait().unwrap();
}

#[test]
fn sibling_children_fire_in_insertion_order() -> Result<()> {
    // One worker makes execution order equal dispatch order.
    let dispatcher = dispatcher(1);
    let gate = gate_op(&dispatcher);

    let order = Arc::new(Mutex::new(Vec::new()));
    let siblings: Vec<OpRef> = (0..8)
        .map(|n| {
            let order = Arc::clone(&order);
            dispatcher
                .completion(
                    &[gate.clone()],
                    vec![CompletionRequest::new(Arc::new(move |_, _| {
                        order.lock().push(n);
                        Ok(UserStep::Complete(None))
                    }))],
                )
                .remove(0)
        })
        .collect();

    dispatcher.complete_deferred(&gate, Ok(None))?;
    for sibling in &siblings {
        sibling.wait()?;
    }
    assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn op_ids_are_monotonic_and_unique() -> Result<()> {
    let dispatcher = dispatcher(2);
    let mut ids = Vec::new();
    for _ in 0..5 {
        let batch = dispatcher.completion(
            &[OpRef::none(), OpRef::none()],
            vec![
                CompletionRequest::new(Arc::new(|_, _| Ok(UserStep::Complete(None)))),
                CompletionRequest::new(Arc::new(|_, _| Ok(UserStep::Complete(None)))),
            ],
        );
        for op in &batch {
            ids.push(op.id().as_u64());
            op.wait()?;
        }
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[test]
fn chained_op_observes_failed_precondition() {
    let tmp = tempdir().unwrap();
    let dispatcher = dispatcher(2);
    let missing = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("does-not-exist"),
            FileFlags::READ,
        )])
        .remove(0);
    // The write fires after the open fails and sees no inbound handle.
    let write = dispatcher
        .write(vec![WriteRequest::single(missing.clone(), 0, &b"x"[..])])
        .remove(0);
    assert!(missing.wait().is_err());
    assert!(matches!(write.wait(), Err(IoError::InvalidArgument { .. })));
}

#[test]
fn sync_without_writes_is_a_noop() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("clean.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    let handle = file.wait_handle()?;
    dispatcher.sync(vec![file.clone()]).remove(0).wait()?;
    assert_eq!(handle.bytes_written_at_last_fsync(), 0);
    assert!(!handle.has_ever_been_fsynced());
    Ok(())
}

#[test]
fn write_counters_stay_ordered() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("ctr.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    let handle = file.wait_handle()?;

    dispatcher
        .write(vec![WriteRequest::single(file.clone(), 0, &b"12345"[..])])
        .remove(0)
        .wait()?;
    assert_eq!(handle.bytes_written_total(), 5);
    assert!(handle.bytes_written_at_last_fsync() <= handle.bytes_written_total());

    dispatcher.sync(vec![file.clone()]).remove(0).wait()?;
    assert_eq!(handle.bytes_written_at_last_fsync(), 5);
    assert!(handle.has_ever_been_fsynced());
    Ok(())
}

#[test]
fn handles_register_and_deregister() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let a = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("a.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    let b = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("b.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    a.wait()?;
    b.wait()?;
    assert_eq!(dispatcher.open_handle_count(), 2);

    dispatcher.close(vec![a]).remove(0).wait()?;
    dispatcher.wait_idle();
    assert_eq!(dispatcher.open_handle_count(), 1);
    dispatcher.close(vec![b]).remove(0).wait()?;
    dispatcher.wait_idle();
    assert_eq!(dispatcher.open_handle_count(), 0);
    Ok(())
}

#[test]
fn named_temp_file_is_removed_on_close() -> Result<()> {
    let dispatcher = dispatcher(2);
    let name = format!("sluice-scenario-{}", std::process::id());
    let file = dispatcher.temp_file(Some(&name), FileFlags::for_create());
    let handle = file.wait_handle()?;
    let path = handle.path().to_path_buf();
    assert!(path.exists());
    dispatcher.close(vec![file]).remove(0).wait()?;
    dispatcher.wait_idle();
    assert!(!path.exists());
    Ok(())
}

#[test]
fn temp_inode_is_anonymous() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let inode = dispatcher.temp_inode(tmp.path());
    inode.wait_handle()?;

    // The inode is bound only to its descriptor, never to a name.
    assert_eq!(fs::read_dir(tmp.path())?.count(), 0);

    dispatcher
        .write(vec![WriteRequest::single(inode.clone(), 0, &b"tmp"[..])])
        .remove(0)
        .wait()?;
    let sink = ReadSink::with_lengths(&[3]);
    dispatcher
        .read(vec![ReadRequest::new(inode, 0, sink.clone())])
        .remove(0)
        .wait()?;
    assert_eq!(&sink.take()[0][..], b"tmp");
    Ok(())
}

#[test]
fn force_and_mask_shape_effective_flags() {
    let pool = Arc::new(WorkerPool::new(1));
    let dispatcher = Dispatcher::builder(pool)
        .flags_force(FileFlags::OS_SYNC)
        .flags_mask(FileFlags::TRUNCATE)
        .build();
    assert_eq!(
        dispatcher.effective_flags(FileFlags::READ | FileFlags::TRUNCATE),
        FileFlags::READ | FileFlags::OS_SYNC
    );
}

#[test]
fn portable_backend_round_trips() -> Result<()> {
    let tmp = tempdir()?;
    let pool = Arc::new(WorkerPool::new(2));
    let dispatcher = Dispatcher::builder(pool).with_portable_io().build();

    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("portable.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::new(
            file.clone(),
            10,
            vec![bytes::Bytes::from_static(b"abc"), bytes::Bytes::from_static(b"def")],
        )])
        .remove(0)
        .wait()?;
    let sink = ReadSink::with_lengths(&[6]);
    dispatcher
        .read(vec![ReadRequest::new(file.clone(), 10, sink.clone())])
        .remove(0)
        .wait()?;
    assert_eq!(&sink.take()[0][..], b"abcdef");
    dispatcher.close(vec![file]).remove(0).wait()?;
    Ok(())
}

#[test]
fn auto_flush_close_flushes_dirty_bytes() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher(2);
    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("auto.bin"),
            FileFlags::for_create() | FileFlags::AUTO_FLUSH,
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::single(file.clone(), 0, &b"dirty"[..])])
        .remove(0)
        .wait()?;
    let handle = file.wait_handle()?;
    assert_eq!(handle.dirty_bytes(), 5);
    dispatcher.close(vec![file]).remove(0).wait()?;
    dispatcher.wait_idle();
    assert_eq!(handle.dirty_bytes(), 0);
    assert!(handle.has_ever_been_fsynced());
    assert!(!handle.is_open());
    Ok(())
}
