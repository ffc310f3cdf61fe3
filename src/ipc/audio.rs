//! Shared audio ring
//!
//! Defined for completeness of the IPC surface: the emulator deposits raw
//! samples here and the header arithmetic below is the contract. The
//! streaming path does not encode audio yet; see DESIGN.md.

use std::fs::File;
use std::sync::atomic::Ordering;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;

use super::layout::{self, AudioShmHeader, AUDIO_MAGIC, AUDIO_RING_SIZE, IPC_VERSION};
use crate::error::{AppError, Result};

/// Owned mapping of the shared audio ring
pub struct AudioSharedMemory {
    name: String,
    mmap: MmapMut,
    _file: File,
}

unsafe impl Send for AudioSharedMemory {}
unsafe impl Sync for AudioSharedMemory {}

impl AudioSharedMemory {
    /// Create the ring, unlinking any stale region first
    pub fn create(name: &str, sample_rate: u32, channels: u32, format: u32) -> Result<Self> {
        let _ = shm_unlink(name);

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|e| AppError::SharedMemory(format!("shm_open '{}' failed: {}", name, e)))?;

        let size = layout::audio_region_size();
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

        unsafe {
            let h = shm.header_ptr();
            (*h).magic = AUDIO_MAGIC;
            (*h).version = IPC_VERSION;
            (*h).sample_rate = sample_rate;
            (*h).channels = channels;
            (*h).format = format;
            (*h).capacity = AUDIO_RING_SIZE as u32;
        }

        tracing::info!(
            "Created audio shared memory '{}' ({} Hz, {} ch)",
            name,
            sample_rate,
            channels
        );
        Ok(shm)
    }

    fn header_ptr(&self) -> *mut AudioShmHeader {
        self.mmap.as_ptr() as *mut AudioShmHeader
    }

    fn header(&self) -> &AudioShmHeader {
        unsafe { &*self.header_ptr() }
    }

    fn ring_ptr(&self) -> *mut u8 {
        unsafe { (self.mmap.as_ptr() as *mut u8).add(layout::audio_ring_offset()) }
    }

    /// Validate magic and version
    pub fn validate(&self) -> Result<()> {
        let header = self.header();
        if header.magic != AUDIO_MAGIC {
            return Err(AppError::SharedMemory(format!(
                "bad audio magic {:#010x}",
                header.magic
            )));
        }
        if header.version != IPC_VERSION {
            return Err(AppError::SharedMemory(format!(
                "unsupported audio protocol version {}",
                header.version
            )));
        }
        Ok(())
    }

    /// Region name for the control-socket hello
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes available to read: `(write_pos - read_pos) mod capacity`
    pub fn available(&self) -> u32 {
        let header = self.header();
        let write = header.write_pos.load(Ordering::Acquire);
        let read = header.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read) % header.capacity
    }

    /// Bytes free to write; one byte is reserved to disambiguate full/empty
    pub fn free(&self) -> u32 {
        let header = self.header();
        header.capacity - self.available() - 1
    }

    /// Writer side: deposit bytes, truncating to free space
    pub fn write(&self, data: &[u8]) -> usize {
        let header = self.header();
        let capacity = header.capacity as usize;
        let len = data.len().min(self.free() as usize);
        let mut pos = header.write_pos.load(Ordering::Relaxed) as usize;

        for &byte in &data[..len] {
            unsafe { *self.ring_ptr().add(pos) = byte };
            pos = (pos + 1) % capacity;
        }

        header.write_pos.store(pos as u32, Ordering::Release);
        header.sample_count.fetch_add(len as u64, Ordering::Relaxed);
        len
    }

    /// Reader side: drain up to `buf.len()` bytes
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let header = self.header();
        let capacity = header.capacity as usize;
        let len = buf.len().min(self.available() as usize);
        let mut pos = header.read_pos.load(Ordering::Relaxed) as usize;

        for slot in &mut buf[..len] {
            *slot = unsafe { *self.ring_ptr().add(pos) };
            pos = (pos + 1) % capacity;
        }

        header.read_pos.store(pos as u32, Ordering::Release);
        len
    }
}

impl Drop for AudioSharedMemory {
    fn drop(&mut self) {
        if let Err(e) = shm_unlink(self.name.as_str()) {
            tracing::debug!("shm_unlink '{}' failed: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::layout::AUDIO_FORMAT_S16LE;

    fn unique_name(tag: &str) -> String {
        format!("/macemu-audio-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn empty_ring_has_zero_available() {
        let shm =
            AudioSharedMemory::create(&unique_name("empty"), 44100, 2, AUDIO_FORMAT_S16LE).unwrap();
        shm.validate().unwrap();
        assert_eq!(shm.available(), 0);
        assert_eq!(shm.free(), AUDIO_RING_SIZE as u32 - 1);
    }

    #[test]
    fn full_ring_keeps_one_byte_reserved() {
        let shm =
            AudioSharedMemory::create(&unique_name("full"), 44100, 2, AUDIO_FORMAT_S16LE).unwrap();
        let data = vec![0x5A; AUDIO_RING_SIZE + 128];
        let written = shm.write(&data);
        assert_eq!(written, AUDIO_RING_SIZE - 1);
        assert_eq!(shm.available(), AUDIO_RING_SIZE as u32 - 1);
        assert_eq!(shm.free(), 0);
    }

    #[test]
    fn read_drains_what_was_written_across_the_wrap() {
        let shm =
            AudioSharedMemory::create(&unique_name("wrap"), 48000, 1, AUDIO_FORMAT_S16LE).unwrap();

        // Push the positions near the end of the ring, drain, then write
        // across the boundary.
        let filler = vec![0u8; AUDIO_RING_SIZE - 16];
        assert_eq!(shm.write(&filler), filler.len());
        let mut sink = vec![0u8; filler.len()];
        assert_eq!(shm.read(&mut sink), filler.len());
        assert_eq!(shm.available(), 0);

        let payload: Vec<u8> = (0..64u8).collect();
        assert_eq!(shm.write(&payload), payload.len());
        let mut out = vec![0u8; payload.len()];
        assert_eq!(shm.read(&mut out), payload.len());
        assert_eq!(out, payload);
    }
}
