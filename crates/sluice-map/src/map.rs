//! Memory-mapped views over sections.

use std::sync::{Arc, Weak};
use std::time::Duration;

use memmap2::{MmapOptions, MmapRaw};
use tracing::trace;

use sluice_common::utils;
use sluice_common::{IoError, IoResult, SectionFlags};

use crate::region::Region;
use crate::section::Section;

/// A memory-mapped view of a section.
///
/// The view holds its own kernel reference to the mapping: dropping the
/// section keeps the view valid, and dropping the view (which unmaps it)
/// never closes the section.
pub struct MapHandle {
    raw: MmapRaw,
    section: Weak<Section>,
    offset: u64,
    flags: SectionFlags,
    anonymous: bool,
    cow: bool,
}

impl MapHandle {
    /// Maps a view of `section`.
    ///
    /// `length` of zero means the section's current length. Both `offset`
    /// and an explicit `length` must be multiples of the platform
    /// allocation granularity (see
    /// [`utils::allocation_granularity`]); otherwise the
    /// operation fails with an alignment error. `flags` must be a subset of
    /// the section's flags.
    pub fn map(
        section: &Arc<Section>,
        length: usize,
        offset: u64,
        flags: SectionFlags,
    ) -> IoResult<Self> {
        if !section.flags().permits(flags) {
            return Err(IoError::invalid_argument(
                "view permissions exceed the section's flags",
            ));
        }
        Region::check_map_aligned(offset, length as u64)?;
        let section_len = section.length();
        let length = if length == 0 {
            usize::try_from(section_len.saturating_sub(offset))
                .map_err(|_| IoError::invalid_argument("section too large to map"))?
        } else {
            length
        };
        if length == 0 {
            return Err(IoError::invalid_argument("cannot map an empty view"));
        }

        let cow = flags.contains(SectionFlags::COW);
        let mut opts = MmapOptions::new();
        opts.offset(offset).len(length);
        #[cfg(target_os = "linux")]
        if flags.contains(SectionFlags::PREFAULT) || section.flags().contains(SectionFlags::PREFAULT)
        {
            opts.populate();
        }
        let raw: MmapRaw = match section.file() {
            None => opts.map_anon()?.into(),
            // A copy-on-write view writes to private pages, leaving the
            // backing storage untouched.
            Some(file) if cow => unsafe { opts.map_copy(file)? }.into(),
            Some(file) if !flags.contains(SectionFlags::WRITE) => opts.map_raw_read_only(file)?,
            Some(file) => opts.map_raw(file)?,
        };

        let map = Self {
            raw,
            section: Arc::downgrade(section),
            offset,
            flags,
            anonymous: section.is_anonymous(),
            cow,
        };
        let no_commit =
            flags.contains(SectionFlags::NO_COMMIT) || section.flags().contains(SectionFlags::NO_COMMIT);
        #[cfg(unix)]
        {
            let prot = if no_commit {
                libc::PROT_NONE
            } else {
                prot_for(flags)
            };
            map.protect(Region::new(0, map.len()), prot)?;
        }
        #[cfg(not(unix))]
        {
            let _ = no_commit;
        }
        trace!(offset, length, ?flags, "mapped view");
        Ok(map)
    }

    /// The address where the view starts.
    pub fn address(&self) -> *const u8 {
        self.raw.as_mut_ptr()
    }

    /// The length of the view in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// True if the view has no bytes (never constructed by [`MapHandle::map`]).
    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    /// The offset of the view into its section.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The permissions this view was mapped with.
    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    /// The section this view was mapped from, if it is still alive.
    pub fn section(&self) -> Option<Arc<Section>> {
        self.section.upgrade()
    }

    /// Commits backing for the region at the given permissions, clamped by
    /// the view's own flags. Returns the region actually committed,
    /// page-aligned outward.
    pub fn commit(&self, region: Region, flags: SectionFlags) -> IoResult<Region> {
        let region = region
            .clamp(self.len())
            .align_outward(utils::page_size())
            .clamp(self.len());
        if region.is_empty() {
            return Ok(region);
        }
        #[cfg(unix)]
        {
            let allowed = flags.permissions() & self.flags.permissions();
            self.protect(region, prot_for(allowed))?;
        }
        #[cfg(not(unix))]
        {
            let _ = flags;
        }
        Ok(region)
    }

    /// Decommits the region: its pages become unbacked and inaccessible.
    /// Only whole pages inside the region are affected; reads from the
    /// region afterwards are unspecified. Returns the region actually
    /// decommitted.
    pub fn decommit(&self, region: Region) -> IoResult<Region> {
        let region = region.clamp(self.len()).align_inward(utils::page_size());
        if region.is_empty() {
            return Ok(region);
        }
        #[cfg(unix)]
        {
            self.advise(region, libc::MADV_DONTNEED);
            self.protect(region, libc::PROT_NONE)?;
        }
        Ok(region)
    }

    /// Zeroes the region. Whole pages are released back to the system where
    /// the OS supports it; partial pages are zero-filled. Safe on any
    /// region subset of the view.
    pub fn zero(&self, region: Region) -> IoResult<()> {
        if !self.writable() {
            return Err(IoError::invalid_argument("view is not writable"));
        }
        let region = region.clamp(self.len());
        if region.is_empty() {
            return Ok(());
        }
        let full = region.align_inward(utils::page_size());
        if full.is_empty() {
            // No whole page inside the region; zero-fill the lot.
            self.fill_zero(region);
            return Ok(());
        }
        // Partial head and tail pages are zero-filled in place.
        self.fill_zero(Region::new(region.offset, full.offset - region.offset));
        self.fill_zero(Region::new(full.end(), region.end() - full.end()));
        #[cfg(target_os = "linux")]
        {
            // Whole pages can be handed back: anonymous memory refaults as
            // zero pages, file-backed shared memory gets its extents
            // punched out.
            let advice = if self.anonymous && !self.cow {
                Some(libc::MADV_DONTNEED)
            } else if !self.anonymous && !self.cow {
                Some(libc::MADV_REMOVE)
            } else {
                None
            };
            if let Some(advice) = advice {
                if self.try_advise(full, advice) {
                    return Ok(());
                }
            }
        }
        self.fill_zero(full);
        Ok(())
    }

    /// Hints that the regions will be accessed soon. Returns the regions
    /// actually prefetched; platforms without the facility return none.
    pub fn prefetch(&self, regions: &[Region]) -> IoResult<Vec<Region>> {
        #[cfg(unix)]
        {
            let mut out = Vec::with_capacity(regions.len());
            for &region in regions {
                let region = region
                    .clamp(self.len())
                    .align_outward(utils::page_size())
                    .clamp(self.len());
                if region.is_empty() {
                    continue;
                }
                self.advise(region, libc::MADV_WILLNEED);
                out.push(region);
            }
            Ok(out)
        }
        #[cfg(not(unix))]
        {
            let _ = regions;
            Ok(Vec::new())
        }
    }

    /// Clears the dirty state of whole pages in the region: modifications
    /// not yet written out are lost, and the pages' contents afterwards are
    /// unpredictable. Returns the region affected.
    pub fn do_not_store(&self, region: Region) -> IoResult<Region> {
        let region = region.clamp(self.len()).align_inward(utils::page_size());
        if region.is_empty() {
            return Ok(region);
        }
        #[cfg(target_os = "linux")]
        {
            if self.anonymous || self.cow {
                if !self.try_advise(region, libc::MADV_FREE) {
                    self.advise(region, libc::MADV_DONTNEED);
                }
            } else {
                self.advise(region, libc::MADV_DONTNEED);
            }
        }
        Ok(region)
    }

    /// Reads from the view without copying.
    ///
    /// Each requested length produces a buffer pointing directly into the
    /// mapped memory, clamped to the view's remaining length at its
    /// position. The `deadline` is accepted for interface symmetry and
    /// ignored: reads over mapped memory never block on the dispatcher.
    pub fn read(
        &self,
        offset: usize,
        lengths: &[usize],
        _deadline: Option<Duration>,
    ) -> IoResult<Vec<&[u8]>> {
        if !self.flags.contains(SectionFlags::READ) {
            return Err(IoError::invalid_argument("view is not readable"));
        }
        let mut out = Vec::with_capacity(lengths.len());
        let mut cursor = offset.min(self.len());
        for &length in lengths {
            let avail = length.min(self.len() - cursor);
            // The range [cursor, cursor + avail) lies inside the mapping and
            // the returned borrow keeps the view alive.
            let slice =
                unsafe { std::slice::from_raw_parts(self.raw.as_mut_ptr().add(cursor), avail) };
            out.push(slice);
            cursor += avail;
        }
        Ok(out)
    }

    /// Writes the buffers into the view back to back, starting at `offset`.
    ///
    /// Returns buffers pointing at where the data now lives inside the
    /// mapped memory; each input's length is clamped to the view's
    /// remaining length at its position. The `deadline` is accepted for
    /// interface symmetry and ignored.
    ///
    /// Concurrent writers must target disjoint regions of the view; the
    /// view performs no locking of its memory.
    pub fn write(
        &self,
        offset: usize,
        buffers: &[&[u8]],
        _deadline: Option<Duration>,
    ) -> IoResult<Vec<&[u8]>> {
        if !self.writable() {
            return Err(IoError::invalid_argument("view is not writable"));
        }
        let mut out = Vec::with_capacity(buffers.len());
        let base = self.raw.as_mut_ptr();
        let mut cursor = offset.min(self.len());
        for buffer in buffers {
            let avail = buffer.len().min(self.len() - cursor);
            // The destination range lies inside the mapping, and the source
            // is a caller-held slice that cannot alias it mutably.
            unsafe {
                std::ptr::copy_nonoverlapping(buffer.as_ptr(), base.add(cursor), avail);
            }
            let written = unsafe { std::slice::from_raw_parts(base.add(cursor), avail) };
            out.push(written);
            cursor += avail;
        }
        Ok(out)
    }

    /// Flushes modified pages of the view to the backing storage.
    pub fn flush(&self) -> IoResult<()> {
        self.raw.flush()?;
        Ok(())
    }

    fn writable(&self) -> bool {
        self.flags.intersects(SectionFlags::WRITE | SectionFlags::COW)
    }

    fn fill_zero(&self, region: Region) {
        if region.is_empty() {
            return;
        }
        unsafe {
            std::ptr::write_bytes(self.raw.as_mut_ptr().add(region.offset), 0, region.len);
        }
    }

    #[cfg(unix)]
    fn protect(&self, region: Region, prot: libc::c_int) -> IoResult<()> {
        let ret = unsafe {
            libc::mprotect(
                self.raw.as_mut_ptr().add(region.offset).cast(),
                region.len,
                prot,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(unix)]
    fn advise(&self, region: Region, advice: libc::c_int) {
        self.try_advise(region, advice);
    }

    #[cfg(unix)]
    fn try_advise(&self, region: Region, advice: libc::c_int) -> bool {
        let ret = unsafe {
            libc::madvise(
                self.raw.as_mut_ptr().add(region.offset).cast(),
                region.len,
                advice,
            )
        };
        if ret != 0 {
            trace!(
                advice,
                offset = region.offset,
                len = region.len,
                "madvise declined"
            );
        }
        ret == 0
    }
}

#[cfg(unix)]
fn prot_for(flags: SectionFlags) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if flags.contains(SectionFlags::READ) {
        prot |= libc::PROT_READ;
    }
    if flags.intersects(SectionFlags::WRITE | SectionFlags::COW) {
        prot |= libc::PROT_WRITE;
    }
    if flags.contains(SectionFlags::EXECUTE) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

impl std::fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapHandle")
            .field("address", &self.address())
            .field("len", &self.len())
            .field("offset", &self.offset)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granularity() -> usize {
        utils::allocation_granularity()
    }

    fn anon_map(pages: usize) -> (Arc<Section>, MapHandle) {
        let len = (pages * granularity()) as u64;
        let section = Section::pagefile(len, SectionFlags::READ_WRITE).unwrap();
        let map = MapHandle::map(&section, len as usize, 0, SectionFlags::READ_WRITE).unwrap();
        (section, map)
    }

    #[test]
    fn anonymous_write_read_round_trip() {
        let (_section, map) = anon_map(1);
        let written = map.write(100, &[b"hello", b" world"], None).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], b"hello");

        let read = map.read(100, &[11], None).unwrap();
        assert_eq!(read[0], b"hello world");
        // The returned buffer points into the view itself.
        assert_eq!(read[0].as_ptr(), unsafe { map.address().add(100) });
    }

    #[test]
    fn read_clamps_to_view_length() {
        let (_section, map) = anon_map(1);
        let end = map.len() - 4;
        let read = map.read(end, &[16, 16], None).unwrap();
        assert_eq!(read[0].len(), 4);
        assert_eq!(read[1].len(), 0);
    }

    #[test]
    fn write_clamps_to_view_length() {
        let (_section, map) = anon_map(1);
        let end = map.len() - 2;
        let written = map.write(end, &[b"abcd"], None).unwrap();
        assert_eq!(written[0], b"ab");
    }

    #[test]
    fn zero_handles_partial_and_whole_pages() {
        let (_section, map) = anon_map(3);
        let ones = vec![0xFFu8; map.len()];
        map.write(0, &[ones.as_slice()], None).unwrap();

        let region = Region::new(100, 2 * granularity());
        map.zero(region).unwrap();

        let read = map.read(0, &[map.len()], None).unwrap();
        let data = read[0];
        assert!(data[..100].iter().all(|&b| b == 0xFF));
        assert!(data[100..region.end()].iter().all(|&b| b == 0));
        assert!(data[region.end()..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn commit_after_reserve() {
        let len = granularity() as u64;
        let section = Section::pagefile(
            len,
            SectionFlags::READ_WRITE | SectionFlags::NO_COMMIT,
        )
        .unwrap();
        let map = MapHandle::map(
            &section,
            len as usize,
            0,
            SectionFlags::READ_WRITE | SectionFlags::NO_COMMIT,
        )
        .unwrap();

        let committed = map
            .commit(Region::new(0, map.len()), SectionFlags::READ_WRITE)
            .unwrap();
        assert_eq!(committed, Region::new(0, map.len()));

        map.write(0, &[b"after commit"], None).unwrap();
        assert_eq!(map.read(0, &[12], None).unwrap()[0], b"after commit");
    }

    #[test]
    fn decommit_reports_whole_pages() {
        let (_section, map) = anon_map(2);
        let region = map.decommit(Region::new(1, granularity())).unwrap();
        // Only the whole pages inside the request are decommitted.
        assert_eq!(region.len, 0);

        let region = map
            .decommit(Region::new(granularity(), granularity()))
            .unwrap();
        assert_eq!(region, Region::new(granularity(), granularity()));
    }

    #[test]
    fn misaligned_map_is_rejected() {
        let len = granularity() as u64;
        let section = Section::pagefile(4 * len, SectionFlags::READ_WRITE).unwrap();
        assert!(matches!(
            MapHandle::map(&section, granularity(), 1, SectionFlags::READ),
            Err(IoError::Alignment { .. })
        ));
        assert!(matches!(
            MapHandle::map(&section, granularity() + 1, 0, SectionFlags::READ),
            Err(IoError::Alignment { .. })
        ));
    }

    #[test]
    fn view_permissions_are_a_subset_of_the_sections() {
        let len = granularity() as u64;
        let section = Section::pagefile(len, SectionFlags::READ).unwrap();
        assert!(MapHandle::map(&section, len as usize, 0, SectionFlags::READ_WRITE).is_err());
        let map = MapHandle::map(&section, len as usize, 0, SectionFlags::READ).unwrap();
        assert!(map.write(0, &[b"x"], None).is_err());
    }

    #[test]
    fn prefetch_and_do_not_store_are_best_effort() {
        let (_section, map) = anon_map(2);
        map.write(0, &[b"payload"], None).unwrap();
        let prefetched = map
            .prefetch(&[Region::new(0, 64), Region::new(map.len(), 64)])
            .unwrap();
        if cfg!(unix) {
            assert_eq!(prefetched.len(), 1);
        } else {
            assert!(prefetched.is_empty());
        }
        // Afterwards the region's contents are unpredictable; only the call
        // itself must succeed.
        map.do_not_store(Region::new(0, map.len())).unwrap();
    }

    #[test]
    fn dropping_the_section_keeps_the_view_valid() {
        let (section, map) = anon_map(1);
        map.write(0, &[b"still here"], None).unwrap();
        drop(section);
        assert!(map.section().is_none());
        assert_eq!(map.read(0, &[10], None).unwrap()[0], b"still here");
    }
}
