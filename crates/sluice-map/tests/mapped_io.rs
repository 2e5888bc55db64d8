//! Mapped-view scenarios over dispatcher-produced file handles.

use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;

use sluice_common::{FileFlags, SectionFlags};
use sluice_io::{Dispatcher, PathRequest, ReadRequest, ReadSink, WriteRequest};
use sluice_map::{MapHandle, Region, Section};
use sluice_pool::WorkerPool;

const FILE_LEN: usize = 64 * 1024;

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Arc::new(WorkerPool::new(2)))
}

#[test]
fn mapped_write_is_visible_to_file_reads() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher();

    // Backing file of 64 KiB.
    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("backing.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::single(
            file.clone(),
            0,
            vec![0u8; FILE_LEN],
        )])
        .remove(0)
        .wait()?;

    let handle = file.wait_handle()?;
    let section = Section::from_handle(&handle, 0, SectionFlags::READ_WRITE)?;
    assert_eq!(section.length(), FILE_LEN as u64);

    let map = MapHandle::map(&section, 0, 0, SectionFlags::READ_WRITE)?;
    assert_eq!(map.len(), FILE_LEN);
    map.write(1000, &[&[0xAA]], None)?;
    map.flush()?;
    drop(map);

    // The byte written through the view is observable through the file.
    let sink = ReadSink::with_lengths(&[1]);
    dispatcher
        .read(vec![ReadRequest::new(file, 1000, sink.clone())])
        .remove(0)
        .wait()?;
    assert_eq!(sink.take()[0][0], 0xAA);
    Ok(())
}

#[test]
fn file_writes_are_visible_through_the_view() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher();

    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("shared.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::single(
            file.clone(),
            0,
            vec![0u8; FILE_LEN],
        )])
        .remove(0)
        .wait()?;

    let handle = file.wait_handle()?;
    let section = Section::from_handle(&handle, 0, SectionFlags::READ_WRITE)?;
    let map = MapHandle::map(&section, 0, 0, SectionFlags::READ)?;

    dispatcher
        .write(vec![WriteRequest::single(file, 512, &b"through the fd"[..])])
        .remove(0)
        .wait()?;
    assert_eq!(map.read(512, &[14], None)?[0], b"through the fd");
    Ok(())
}

#[test]
fn section_survives_its_backing_handle() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher();

    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("outlive.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::single(
            file.clone(),
            0,
            vec![0x5Au8; FILE_LEN],
        )])
        .remove(0)
        .wait()?;

    let handle = file.wait_handle()?;
    let section = Section::from_handle(&handle, 0, SectionFlags::READ_WRITE)?;

    // Close the backing handle; the section's duplicated descriptor keeps
    // the storage reachable.
    dispatcher.close(vec![file]).remove(0).wait()?;
    dispatcher.wait_idle();
    assert!(section.backing().is_none() || !section.backing().unwrap().is_open());

    let map = MapHandle::map(&section, 0, 0, SectionFlags::READ)?;
    assert!(map.read(0, &[16], None)?[0].iter().all(|&b| b == 0x5A));
    Ok(())
}

#[test]
fn closing_a_view_leaves_the_section_mappable() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher();

    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("remap.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::single(
            file.clone(),
            0,
            vec![0u8; FILE_LEN],
        )])
        .remove(0)
        .wait()?;

    let handle = file.wait_handle()?;
    let section = Section::from_handle(&handle, 0, SectionFlags::READ_WRITE)?;

    let first = MapHandle::map(&section, 0, 0, SectionFlags::READ_WRITE)?;
    first.write(0, &[b"first view"], None)?;
    drop(first);

    let second = MapHandle::map(&section, 0, 0, SectionFlags::READ)?;
    assert_eq!(second.read(0, &[10], None)?[0], b"first view");
    Ok(())
}

#[test]
fn zeroing_through_a_view_reaches_the_file() -> Result<()> {
    let tmp = tempdir()?;
    let dispatcher = dispatcher();

    let file = dispatcher
        .file(vec![PathRequest::new(
            tmp.path().join("punch.bin"),
            FileFlags::for_create(),
        )])
        .remove(0);
    dispatcher
        .write(vec![WriteRequest::single(
            file.clone(),
            0,
            vec![0xEEu8; FILE_LEN],
        )])
        .remove(0)
        .wait()?;

    let handle = file.wait_handle()?;
    let section = Section::from_handle(&handle, 0, SectionFlags::READ_WRITE)?;
    let map = MapHandle::map(&section, 0, 0, SectionFlags::READ_WRITE)?;
    map.zero(Region::new(0, 4096))?;
    map.flush()?;
    drop(map);

    let sink = ReadSink::with_lengths(&[4096, 1]);
    dispatcher
        .read(vec![ReadRequest::new(file, 0, sink.clone())])
        .remove(0)
        .wait()?;
    let buffers = sink.take();
    assert!(buffers[0].iter().all(|&b| b == 0));
    assert_eq!(buffers[1][0], 0xEE);
    Ok(())
}
