//! Triple-buffered shared video region
//!
//! The gateway creates and owns the region; the emulator maps it by name
//! and writes frames. No locks: the writer never mutates the slot named by
//! `write_index`, and release/acquire ordering on the index makes the
//! current slot stable for the duration of one encode step.

use std::fs::File;
use std::sync::atomic::Ordering;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;

use super::layout::{
    self, VideoShmHeader, FRAME_SLOTS, IPC_VERSION, MAX_FRAME_SIZE, VIDEO_MAGIC,
};
use crate::error::{AppError, Result};

/// One stable view of the current frame slot
#[derive(Debug)]
pub struct FrameView<'a> {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// 0 = RGBA, 1 = BGRA
    pub format: u32,
    pub frame_count: u64,
    pub data: &'a [u8],
}

/// Owned mapping of the shared video region
pub struct VideoSharedMemory {
    name: String,
    mmap: MmapMut,
    _file: File,
}

// The mapping is shared with a foreign writer by design; all cross-process
// coordination goes through the atomic header fields.
unsafe impl Send for VideoSharedMemory {}
unsafe impl Sync for VideoSharedMemory {}

impl VideoSharedMemory {
    /// Create (or recreate, unlinking any stale name) the shared region and
    /// stamp the header. Startup-fatal on failure.
    pub fn create(name: &str, width: u32, height: u32) -> Result<Self> {
        // Remove any stale region from a previous run
        let _ = shm_unlink(name);

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|e| AppError::SharedMemory(format!("shm_open '{}' failed: {}", name, e)))?;

        let size = layout::video_region_size();
        nix::unistd::ftruncate(&fd, size as i64)
            .map_err(|e| AppError::SharedMemory(format!("ftruncate '{}' failed: {}", name, e)))?;

        let file = File::from(fd);
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| AppError::SharedMemory(format!("mmap '{}' failed: {}", name, e)))?;

        let shm = Self {
            name: name.to_string(),
            mmap,
            _file: file,
        };

        let header = shm.header();
        header.write_index.store(0, Ordering::Relaxed);
        header.read_index.store(0, Ordering::Relaxed);
        header.frame_count.store(0, Ordering::Relaxed);
        header.timestamp_us.store(0, Ordering::Relaxed);
        unsafe {
            let h = shm.header_ptr();
            (*h).magic = VIDEO_MAGIC;
            (*h).version = IPC_VERSION;
            (*h).width = width;
            (*h).height = height;
            (*h).stride = width * 4;
            (*h).format = layout::PIXEL_FORMAT_RGBA;
        }

        tracing::info!("Created video shared memory '{}' ({}x{})", name, width, height);
        Ok(shm)
    }

    fn header_ptr(&self) -> *mut VideoShmHeader {
        self.mmap.as_ptr() as *mut VideoShmHeader
    }

    fn header(&self) -> &VideoShmHeader {
        unsafe { &*self.header_ptr() }
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < FRAME_SLOTS);
        unsafe {
            (self.mmap.as_ptr() as *mut u8).add(layout::video_frames_offset() + index * MAX_FRAME_SIZE)
        }
    }

    /// Validate magic and version; protocol violation aborts startup
    pub fn validate(&self) -> Result<()> {
        let header = self.header();
        if header.magic != VIDEO_MAGIC {
            return Err(AppError::SharedMemory(format!(
                "bad video magic {:#010x}",
                header.magic
            )));
        }
        if header.version != IPC_VERSION {
            return Err(AppError::SharedMemory(format!(
                "unsupported video protocol version {}",
                header.version
            )));
        }
        Ok(())
    }

    /// Region name for the control-socket hello
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total frames published so far (the reader's edge trigger)
    pub fn frame_count(&self) -> u64 {
        self.header().frame_count.load(Ordering::Acquire)
    }

    /// Geometry 0x0 means the writer has not published yet
    pub fn is_published(&self) -> bool {
        let header = self.header();
        header.width != 0 && header.height != 0
    }

    /// Current published geometry
    pub fn geometry(&self) -> (u32, u32) {
        let header = self.header();
        (header.width, header.height)
    }

    /// Snapshot the slot currently named by `write_index`.
    ///
    /// Returns `None` while geometry is unpublished. The returned view is
    /// stable for one encode step by the triple-buffer construction.
    pub fn read_current(&self) -> Option<FrameView<'_>> {
        let header = self.header();
        let width = header.width;
        let height = header.height;
        if width == 0 || height == 0 {
            return None;
        }

        let index = header.write_index.load(Ordering::Acquire);
        let stride = header.stride;
        let frame_count = header.frame_count.load(Ordering::Acquire);
        header.read_index.store(index, Ordering::Relaxed);

        let len = (stride as usize * height as usize).min(MAX_FRAME_SIZE);
        let data = unsafe {
            std::slice::from_raw_parts(self.slot_ptr(index as usize % FRAME_SLOTS), len)
        };

        Some(FrameView {
            index,
            width,
            height,
            stride,
            format: header.format,
            frame_count,
            data,
        })
    }

    /// Writer side of the protocol: fill the next slot, then publish it.
    ///
    /// The emulator performs the same sequence from its own mapping; the
    /// gateway uses this for synthetic writers in tests.
    pub fn write_frame(&self, pixels: &[u8], width: u32, height: u32, stride: u32, format: u32) {
        let len = (stride as usize * height as usize).min(MAX_FRAME_SIZE).min(pixels.len());
        let header = self.header();

        let current = header.write_index.load(Ordering::Relaxed);
        let next = (current + 1) % FRAME_SLOTS as u32;

        unsafe {
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), self.slot_ptr(next as usize), len);
            let h = self.header_ptr();
            (*h).width = width;
            (*h).height = height;
            (*h).stride = stride;
            (*h).format = format;
        }

        header.write_index.store(next, Ordering::Release);
        header.frame_count.fetch_add(1, Ordering::Release);
        let now_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        header.timestamp_us.store(now_us, Ordering::Relaxed);
    }
}

impl Drop for VideoSharedMemory {
    fn drop(&mut self) {
        if let Err(e) = shm_unlink(self.name.as_str()) {
            tracing::debug!("shm_unlink '{}' failed: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::layout::PIXEL_FORMAT_BGRA;
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        format!("/macemu-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn create_validates_and_reports_unpublished() {
        let name = unique_name("create");
        let shm = VideoSharedMemory::create(&name, 0, 0).unwrap();
        shm.validate().unwrap();
        assert!(!shm.is_published());
        assert!(shm.read_current().is_none());
        assert_eq!(shm.frame_count(), 0);
    }

    #[test]
    fn written_frame_is_visible_to_reader() {
        let name = unique_name("roundtrip");
        let shm = VideoSharedMemory::create(&name, 0, 0).unwrap();

        let width = 8u32;
        let height = 4u32;
        let stride = width * 4;
        let pixels = vec![0xABu8; (stride * height) as usize];
        shm.write_frame(&pixels, width, height, stride, PIXEL_FORMAT_BGRA);

        assert!(shm.is_published());
        assert_eq!(shm.frame_count(), 1);

        let view = shm.read_current().unwrap();
        assert_eq!(view.width, width);
        assert_eq!(view.height, height);
        assert_eq!(view.stride, stride);
        assert_eq!(view.format, PIXEL_FORMAT_BGRA);
        assert_eq!(view.frame_count, 1);
        assert!(view.data.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn reader_never_observes_a_torn_slot() {
        // Writer flips 0 -> 1 -> 2 -> 0 much faster than the reader samples.
        // Every published frame is filled with a single byte value, so a
        // read overlapping an in-progress write would show mixed bytes.
        let name = unique_name("race");
        let shm = Arc::new(VideoSharedMemory::create(&name, 0, 0).unwrap());

        let width = 64u32;
        let height = 48u32;
        let stride = width * 4;
        let frame_len = (stride * height) as usize;

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer = {
            let shm = shm.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                for n in 0u64..120 {
                    let fill = (n % 251) as u8;
                    let pixels = vec![fill; frame_len];
                    shm.write_frame(&pixels, width, height, stride, 0);
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut last_count = 0u64;
        let mut frames_seen = 0;
        while !done.load(Ordering::Acquire) {
            let count = shm.frame_count();
            if count == last_count {
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            assert!(count > last_count, "frame_count must be monotonic");
            last_count = count;

            let view = shm.read_current().unwrap();
            let first = view.data[0];
            assert!(
                view.data.iter().all(|&b| b == first),
                "torn frame observed at count {}",
                view.frame_count
            );
            frames_seen += 1;
        }

        writer.join().unwrap();
        assert!(frames_seen >= 20, "reader sampled only {} frames", frames_seen);
    }
}
