//! Simulated frame subsystem for tests.
//!
//! [`SimAddressSpace`] keeps a frame table with reference counts, a page
//! table and real backing bytes for every frame, so payload contents follow
//! frames when they are remapped. Touching an unmapped page panics.

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString as _},
    vec,
    vec::Vec,
};
use core::fmt;

use crate::{
    PAGE_SIZE, WORD_SIZE,
    address::{PhysAddr, VirtAddr},
    error::{OutOfFrames, OutOfFramesSnafu},
    frame::{AddressSpace, MapFlags},
    log::{LogLevel, LogSink},
};

/// Physical address of frame 0.
pub const PHYS_BASE: usize = 0x8000_0000;

/// Handle to a simulated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimFrame(usize);

impl SimFrame {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

struct FrameSlot {
    data: Box<[u8]>,
    /// Pages mapping this frame, oldest first.
    mappings: Vec<VirtAddr>,
    allocated: bool,
}

pub struct SimAddressSpace {
    frames: Vec<FrameSlot>,
    free: Vec<usize>,
    pages: BTreeMap<VirtAddr, (usize, MapFlags)>,
    failing_maps: usize,
    fail_after: Option<usize>,
}

impl fmt::Debug for SimAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimAddressSpace")
            .field("frames", &self.frames.len())
            .field("free", &self.free.len())
            .field("mapped", &self.pages.len())
            .finish()
    }
}

impl SimAddressSpace {
    /// Creates a space with `frame_count` free frames and nothing mapped.
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        let frames = (0..frame_count)
            .map(|_| FrameSlot {
                data: vec![0; PAGE_SIZE].into_boxed_slice(),
                mappings: Vec::new(),
                allocated: false,
            })
            .collect();
        Self {
            frames,
            free: (0..frame_count).rev().collect(),
            pages: BTreeMap::new(),
            failing_maps: 0,
            fail_after: None,
        }
    }

    /// Makes the next `count` calls to `map_frame` fail.
    pub fn fail_next_maps(&mut self, count: usize) {
        self.failing_maps = count;
    }

    /// Lets `successes` calls to `map_frame` through, then fails one.
    pub fn fail_map_after(&mut self, successes: usize) {
        self.fail_after = Some(successes);
    }

    fn map_should_fail(&mut self) -> bool {
        if self.failing_maps > 0 {
            self.failing_maps -= 1;
            return true;
        }
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                true
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                false
            }
            None => false,
        }
    }

    #[must_use]
    pub fn free_frame_count(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn mapped_page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.pages.contains_key(&va.page_align_down())
    }

    #[must_use]
    pub fn flags_at(&self, va: VirtAddr) -> Option<MapFlags> {
        self.pages.get(&va.page_align_down()).map(|&(_, flags)| flags)
    }

    #[must_use]
    pub fn frame_refs(&self, frame: SimFrame) -> usize {
        self.frames[frame.0].mappings.len()
    }

    /// Reads `len` bytes starting at `va`.
    ///
    /// # Panics
    ///
    /// Panics if any byte lies in an unmapped page.
    #[must_use]
    pub fn read_bytes(&self, va: VirtAddr, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let (frame, offset) = self.translate(va + i);
                self.frames[frame].data[offset]
            })
            .collect()
    }

    /// Writes `bytes` starting at `va`.
    ///
    /// # Panics
    ///
    /// Panics if any byte lies in an unmapped page.
    pub fn write_bytes(&mut self, va: VirtAddr, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let (frame, offset) = self.translate(va + i);
            self.frames[frame].data[offset] = *byte;
        }
    }

    fn translate(&self, va: VirtAddr) -> (usize, usize) {
        let Some(&(frame, _)) = self.pages.get(&va.page_align_down()) else {
            panic!("simulated fault: access to unmapped address {va}");
        };
        (frame, va.page_offset())
    }

    fn release_reference(&mut self, frame: usize, va: VirtAddr) {
        let slot = &mut self.frames[frame];
        slot.mappings.retain(|mapped| *mapped != va);
        if slot.mappings.is_empty() {
            slot.allocated = false;
            self.free.push(frame);
        }
    }
}

impl AddressSpace for SimAddressSpace {
    type Frame = SimFrame;

    fn allocate_frame(&mut self) -> Result<SimFrame, OutOfFrames> {
        let Some(index) = self.free.pop() else {
            return OutOfFramesSnafu.fail();
        };
        let slot = &mut self.frames[index];
        assert!(!slot.allocated && slot.mappings.is_empty());
        slot.allocated = true;
        Ok(SimFrame(index))
    }

    fn free_frame(&mut self, frame: SimFrame) {
        let slot = &mut self.frames[frame.0];
        assert!(slot.allocated, "freeing a free frame {frame:?}");
        assert!(slot.mappings.is_empty(), "freeing a mapped frame {frame:?}");
        slot.allocated = false;
        self.free.push(frame.0);
    }

    fn map_frame(&mut self, frame: SimFrame, va: VirtAddr, flags: MapFlags) -> Result<(), OutOfFrames> {
        assert!(va.is_page_aligned(), "mapping unaligned page {va}");
        assert!(self.frames[frame.0].allocated, "mapping a free frame {frame:?}");
        if self.map_should_fail() {
            return OutOfFramesSnafu.fail();
        }

        if let Some((old, _)) = self.pages.remove(&va) {
            self.release_reference(old, va);
        }
        self.pages.insert(va, (frame.0, flags));
        self.frames[frame.0].mappings.push(va);
        Ok(())
    }

    fn unmap_frame(&mut self, va: VirtAddr) {
        let va = va.page_align_down();
        if let Some((frame, _)) = self.pages.remove(&va) {
            self.release_reference(frame, va);
        }
    }

    fn frame_at(&self, va: VirtAddr) -> Option<SimFrame> {
        self.pages
            .get(&va.page_align_down())
            .map(|&(frame, _)| SimFrame(frame))
    }

    fn frame_phys_addr(&self, frame: SimFrame) -> PhysAddr {
        PhysAddr::new(PHYS_BASE + frame.0 * PAGE_SIZE)
    }

    fn frame_by_phys_addr(&self, pa: PhysAddr) -> Option<SimFrame> {
        let index = pa.value().checked_sub(PHYS_BASE)? / PAGE_SIZE;
        (index < self.frames.len() && self.frames[index].allocated).then_some(SimFrame(index))
    }

    fn frame_owner_page(&self, frame: SimFrame) -> Option<VirtAddr> {
        self.frames[frame.0].mappings.last().copied()
    }

    unsafe fn read_word(&self, va: VirtAddr) -> usize {
        assert!(va.value().is_multiple_of(WORD_SIZE), "unaligned word read at {va}");
        let (frame, offset) = self.translate(va);
        let bytes = &self.frames[frame].data[offset..offset + WORD_SIZE];
        let mut word = [0; WORD_SIZE];
        word.copy_from_slice(bytes);
        usize::from_ne_bytes(word)
    }

    unsafe fn write_word(&mut self, va: VirtAddr, value: usize) {
        assert!(va.value().is_multiple_of(WORD_SIZE), "unaligned word write at {va}");
        let (frame, offset) = self.translate(va);
        self.frames[frame].data[offset..offset + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
    }

    unsafe fn copy_bytes(&mut self, src: VirtAddr, dst: VirtAddr, len: usize) {
        let bytes = self.read_bytes(src, len);
        self.write_bytes(dst, &bytes);
    }
}

/// Log sink remembering every record.
pub struct CaptureSink {
    records: spin::Mutex<Vec<(LogLevel, String)>>,
}

impl Default for CaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSink {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: spin::Mutex::new(Vec::new()),
        }
    }

    /// Installs this sink as the global one. Later installs are ignored.
    pub fn install(&'static self) {
        crate::log::set_sink(self);
    }

    /// Returns `true` if a record at `level` contains `needle`.
    #[must_use]
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }
}

impl LogSink for CaptureSink {
    fn write(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        self.records.lock().push((level, message.to_string()));
    }
}
