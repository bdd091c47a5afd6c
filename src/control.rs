//! Shared control block: cross-process progress/blacklist telemetry.
//!
//! A named shared-memory region known to the supervisor, its workers,
//! and any third-party observer. The region holds a fixed header plus a
//! ring buffer of fixed-size message slots.
//!
//! # Layout
//!
//! ```text
//! offset 0                 ControlHeader (repr(C))
//! offset ring_buffer_offset   ring_buffer_size bytes of 32-byte slots
//! ```
//!
//! # Invariants
//! - `version_cookie` equals [`CONTROL_BLOCK_COOKIE`] for this build.
//! - `ring_buffer_size` is a power of two and a multiple of the slot
//!   size; `ring_buffer_offset >= size_of::<ControlHeader>()`.
//! - `ring_write_count` and `ring_read_count` increase monotonically;
//!   the slot for message `n` is `n % slot_count`. Pending messages are
//!   `[read, write)`.
//!
//! # Concurrency
//!
//! All ring writers (supervisor thread, worker threads, worker crash
//! handlers) serialize through the named semaphore. Counter updates are
//! relaxed atomics; the `progress_started`/`progress_complete` flags are
//! release-stored and must be acquire-loaded by observers.
//!
//! Attach-time validation rejects a mismatched cookie, a non-power-of-two
//! ring size, or a ring offset inside the header. Any failure disables
//! telemetry; the caller continues without it.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::errors::ControlBlockError;

/// Version cookie pinned into every region this build produces.
pub const CONTROL_BLOCK_COOKIE: u32 = 0x5250_4c59;

/// Fixed size of one ring-buffer message slot.
pub const CONTROL_MESSAGE_SIZE: usize = 32;

/// Offset of the ring buffer in regions this build creates. Leaves slack
/// after the header so the header can grow without moving the ring.
const DEFAULT_RING_OFFSET: u32 = 64;

/// Shared header at offset zero of the region.
#[repr(C)]
pub struct ControlHeader {
    pub version_cookie: u32,
    pub banned_modules: AtomicU32,
    pub clean_process_deaths: AtomicU32,
    pub dirty_process_deaths: AtomicU32,
    pub progress_started: AtomicU32,
    pub progress_complete: AtomicU32,
    pub ring_buffer_offset: u32,
    pub ring_buffer_size: u32,
    pub ring_write_count: AtomicU32,
    pub ring_read_count: AtomicU32,
}

/// An attached (or freshly created) control block.
///
/// Owns the mapping and the semaphore handle; the creator additionally
/// unlinks both names on drop.
pub struct ControlBlock {
    base: *mut u8,
    len: usize,
    sem: *mut libc::sem_t,
    unlink: Option<(CString, CString)>,
}

// SAFETY: all mutation of the mapping goes through atomics or is
// serialized by the semaphore; the raw pointers themselves are stable
// for the life of the value.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

fn shm_cstring(name: &str) -> CString {
    let normalized = if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    };
    // Shared-memory names cannot contain interior NULs; a caller-provided
    // name that does is replaced with a name that will simply fail to open.
    CString::new(normalized).unwrap_or_default()
}

fn platform_err(call: &'static str) -> ControlBlockError {
    ControlBlockError::Platform {
        call,
        errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
    }
}

impl ControlBlock {
    /// Creates and initializes a named region plus its semaphore.
    ///
    /// `ring_size` must be a power of two and a multiple of the slot
    /// size. Stale objects under the same names are unlinked first.
    pub fn create(
        shm_name: &str,
        sem_name: &str,
        ring_size: u32,
    ) -> Result<Self, ControlBlockError> {
        if !ring_size.is_power_of_two() || (ring_size as usize) < CONTROL_MESSAGE_SIZE {
            return Err(ControlBlockError::BadRingSize { size: ring_size });
        }
        let shm = shm_cstring(shm_name);
        let sem = shm_cstring(sem_name);
        let len = DEFAULT_RING_OFFSET as usize + ring_size as usize;

        // SAFETY: C-string pointers are valid; fds are closed on every
        // path; the mapping is validated before use.
        unsafe {
            libc::shm_unlink(shm.as_ptr());
            libc::sem_unlink(sem.as_ptr());

            let fd = libc::shm_open(
                shm.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            );
            if fd < 0 {
                return Err(platform_err("shm_open"));
            }
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                let err = platform_err("ftruncate");
                libc::close(fd);
                libc::shm_unlink(shm.as_ptr());
                return Err(err);
            }
            let base = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if base == libc::MAP_FAILED {
                let err = platform_err("mmap");
                libc::shm_unlink(shm.as_ptr());
                return Err(err);
            }

            let header = &mut *(base as *mut ControlHeader);
            header.version_cookie = CONTROL_BLOCK_COOKIE;
            header.ring_buffer_offset = DEFAULT_RING_OFFSET;
            header.ring_buffer_size = ring_size;

            let sem_handle = libc::sem_open(
                sem.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            );
            if sem_handle == libc::SEM_FAILED {
                let err = platform_err("sem_open");
                libc::munmap(base, len);
                libc::shm_unlink(shm.as_ptr());
                return Err(err);
            }

            Ok(Self {
                base: base.cast(),
                len,
                sem: sem_handle,
                unlink: Some((shm, sem)),
            })
        }
    }

    /// Attaches to an existing named region, validating its layout.
    pub fn attach(shm_name: &str, sem_name: &str) -> Result<Self, ControlBlockError> {
        let shm = shm_cstring(shm_name);
        let sem = shm_cstring(sem_name);

        // SAFETY: as in `create`; the mapping is validated before any
        // field other than the header prefix is trusted.
        unsafe {
            let fd = libc::shm_open(shm.as_ptr(), libc::O_RDWR, 0 as libc::c_uint);
            if fd < 0 {
                return Err(platform_err("shm_open"));
            }
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = platform_err("fstat");
                libc::close(fd);
                return Err(err);
            }
            let len = stat.st_size as usize;
            if len < size_of::<ControlHeader>() {
                libc::close(fd);
                return Err(ControlBlockError::RegionTooSmall {
                    len,
                    need: size_of::<ControlHeader>(),
                });
            }
            let base = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if base == libc::MAP_FAILED {
                return Err(platform_err("mmap"));
            }

            let header = &*(base as *const ControlHeader);
            let validation = Self::validate_header(header, len);
            if let Err(err) = validation {
                libc::munmap(base, len);
                return Err(err);
            }

            let sem_handle = libc::sem_open(sem.as_ptr(), 0);
            if sem_handle == libc::SEM_FAILED {
                let err = platform_err("sem_open");
                libc::munmap(base, len);
                return Err(err);
            }

            Ok(Self {
                base: base.cast(),
                len,
                sem: sem_handle,
                unlink: None,
            })
        }
    }

    fn validate_header(header: &ControlHeader, len: usize) -> Result<(), ControlBlockError> {
        if header.version_cookie != CONTROL_BLOCK_COOKIE {
            return Err(ControlBlockError::BadCookie {
                found: header.version_cookie,
                expected: CONTROL_BLOCK_COOKIE,
            });
        }
        let size = header.ring_buffer_size;
        if size == 0 || !size.is_power_of_two() || size as usize % CONTROL_MESSAGE_SIZE != 0 {
            return Err(ControlBlockError::BadRingSize { size });
        }
        let offset = header.ring_buffer_offset;
        if (offset as usize) < size_of::<ControlHeader>() {
            return Err(ControlBlockError::BadRingOffset {
                offset,
                header: size_of::<ControlHeader>() as u32,
            });
        }
        let need = offset as usize + size as usize;
        if len < need {
            return Err(ControlBlockError::RegionTooSmall { len, need });
        }
        Ok(())
    }

    fn header(&self) -> &ControlHeader {
        // SAFETY: the mapping outlives self and was validated (or
        // initialized) to hold a ControlHeader at offset zero.
        unsafe { &*(self.base as *const ControlHeader) }
    }

    pub fn bump_banned_modules(&self) {
        self.header()
            .banned_modules
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_clean_process_deaths(&self) {
        self.header()
            .clean_process_deaths
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_dirty_process_deaths(&self) {
        self.header()
            .dirty_process_deaths
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_progress_started(&self) {
        self.header().progress_started.store(1, Ordering::Release);
    }

    pub fn set_progress_complete(&self) {
        self.header().progress_complete.store(1, Ordering::Release);
    }

    pub fn banned_modules(&self) -> u32 {
        self.header().banned_modules.load(Ordering::Relaxed)
    }

    pub fn clean_process_deaths(&self) -> u32 {
        self.header().clean_process_deaths.load(Ordering::Relaxed)
    }

    pub fn dirty_process_deaths(&self) -> u32 {
        self.header().dirty_process_deaths.load(Ordering::Relaxed)
    }

    pub fn progress_started(&self) -> bool {
        self.header().progress_started.load(Ordering::Acquire) != 0
    }

    pub fn progress_complete(&self) -> bool {
        self.header().progress_complete.load(Ordering::Acquire) != 0
    }

    fn lock(&self) -> bool {
        // SAFETY: sem is a valid semaphore handle for the life of self.
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return true;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return false;
            }
        }
    }

    fn unlock(&self) {
        // SAFETY: sem is valid; posting a semaphore we hold cannot fail
        // except for EOVERFLOW, which cannot occur for a binary use.
        unsafe {
            libc::sem_post(self.sem);
        }
    }

    fn slot_count(&self) -> u32 {
        self.header().ring_buffer_size / CONTROL_MESSAGE_SIZE as u32
    }

    fn slot_ptr(&self, message_index: u32) -> *mut u8 {
        let header = self.header();
        let slot = message_index % self.slot_count();
        // In-bounds by validate_header: offset + size <= len.
        // SAFETY: see above.
        unsafe {
            self.base
                .add(header.ring_buffer_offset as usize)
                .add(slot as usize * CONTROL_MESSAGE_SIZE)
        }
    }

    /// Enqueues one message under the shared semaphore. The message is
    /// truncated or zero-padded to the slot size. Returns false when the
    /// ring is full or the semaphore could not be taken.
    pub fn write_message(&self, message: &[u8]) -> bool {
        if !self.lock() {
            return false;
        }
        let header = self.header();
        let write = header.ring_write_count.load(Ordering::Relaxed);
        let read = header.ring_read_count.load(Ordering::Acquire);
        let ok = write.wrapping_sub(read) < self.slot_count();
        if ok {
            let slot = self.slot_ptr(write);
            let copy = message.len().min(CONTROL_MESSAGE_SIZE);
            // SAFETY: slot points at CONTROL_MESSAGE_SIZE writable bytes
            // and the semaphore excludes concurrent slot writers.
            unsafe {
                std::ptr::write_bytes(slot, 0, CONTROL_MESSAGE_SIZE);
                std::ptr::copy_nonoverlapping(message.as_ptr(), slot, copy);
            }
            header
                .ring_write_count
                .store(write.wrapping_add(1), Ordering::Release);
        }
        self.unlock();
        ok
    }

    /// Dequeues one message into `out` (observer side). Returns false
    /// when the ring is empty.
    pub fn read_message(&self, out: &mut [u8; CONTROL_MESSAGE_SIZE]) -> bool {
        if !self.lock() {
            return false;
        }
        let header = self.header();
        let write = header.ring_write_count.load(Ordering::Acquire);
        let read = header.ring_read_count.load(Ordering::Relaxed);
        let ok = read != write;
        if ok {
            let slot = self.slot_ptr(read);
            // SAFETY: slot points at a fully written slot; the semaphore
            // excludes concurrent ring access.
            unsafe {
                std::ptr::copy_nonoverlapping(slot, out.as_mut_ptr(), CONTROL_MESSAGE_SIZE);
            }
            header
                .ring_read_count
                .store(read.wrapping_add(1), Ordering::Release);
        }
        self.unlock();
        ok
    }
}

impl Drop for ControlBlock {
    fn drop(&mut self) {
        // SAFETY: base/len describe our mapping and sem our handle; both
        // are dropped exactly once here.
        unsafe {
            libc::sem_close(self.sem);
            libc::munmap(self.base.cast(), self.len);
            if let Some((shm, sem)) = &self.unlink {
                libc::shm_unlink(shm.as_ptr());
                libc::sem_unlink(sem.as_ptr());
            }
        }
    }
}
