// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Linux interfaces for driving a memory-mapped device from user mode: UIO
//! interrupt nodes, `/dev/mem` mappings, and page pinning.

#![cfg(target_os = "linux")]
// UNSAFETY: Manual memory management with mmap, volatile register access,
// mlock and poll.
#![expect(unsafe_code)]

use anyhow::Context;
use fs_err::os::unix::fs::OpenOptionsExt as _;
use libc::c_void;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::ops::Range;
use std::os::unix::prelude::*;
use std::path::Path;
use zerocopy::IntoBytes;

const PAGE_SIZE: usize = 4096;

fn syscall_result<T: PartialOrd + Default>(result: T) -> std::io::Result<T> {
    if result >= T::default() {
        Ok(result)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// A UIO interrupt node, such as `/dev/uio0`.
pub struct UioDevice {
    file: File,
}

/// The reason [`UioDevice::wait`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Wakeup {
    Interrupt,
    Stopped,
}

impl UioDevice {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?
            .into_parts()
            .0;
        Ok(Self { file })
    }

    /// Unmasks the interrupt. UIO masks it again each time it fires.
    pub fn enable_interrupt(&self) -> std::io::Result<()> {
        (&self.file).write_all(&1u32.to_ne_bytes())
    }

    /// Reads the total number of interrupts seen so far. Blocks until the
    /// count changes.
    pub fn read_event_count(&self) -> std::io::Result<u32> {
        let mut count = 0u32;
        (&self.file).read_exact(count.as_mut_bytes())?;
        Ok(count)
    }

    /// Waits until the interrupt fires or `stop` is signaled.
    pub fn wait(&self, stop: &StopEvent) -> std::io::Result<Wakeup> {
        let mut fds = [
            libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: stop.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            // SAFETY: `fds` is a valid array of pollfd structures and both file
            // descriptors are open for the duration of the call.
            let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            match syscall_result(r) {
                Ok(_) => break,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                Err(err) => return Err(err),
            }
        }
        if fds[1].revents != 0 {
            Ok(Wakeup::Stopped)
        } else if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            Err(std::io::ErrorKind::BrokenPipe.into())
        } else {
            Ok(Wakeup::Interrupt)
        }
    }
}

/// An eventfd used to stop a thread blocked in [`UioDevice::wait`].
pub struct StopEvent {
    file: File,
}

impl StopEvent {
    pub fn new() -> std::io::Result<Self> {
        // SAFETY: calling C APIs as documented, with no special requirements,
        // and validating the return value before passing it to from_raw_fd.
        let fd = unsafe {
            let fd = syscall_result(libc::eventfd(0, libc::EFD_CLOEXEC))?;
            OwnedFd::from_raw_fd(fd)
        };
        Ok(Self {
            file: File::from(fd),
        })
    }

    pub fn signal(&self) -> std::io::Result<()> {
        (&self.file).write_all(&1u64.to_ne_bytes())
    }
}

/// A reserved range of address space with physical memory mapped into parts
/// of it.
#[derive(Debug)]
pub struct PhysWindow {
    addr: *mut c_void,
    len: usize,
    mapped: Vec<Range<usize>>,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for PhysWindow {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for PhysWindow {}

impl PhysWindow {
    /// Reserves `len` bytes of inaccessible address space.
    pub fn reserve(len: usize) -> std::io::Result<Self> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(std::io::ErrorKind::InvalidInput.into());
        }
        // SAFETY: No file descriptor or address is being passed.
        // The result is being validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            addr,
            len,
            mapped: Vec::new(),
        })
    }

    /// Maps `len` bytes of physical memory at `phys` to `offset` in the window,
    /// through `/dev/mem`. If `uncached`, the mapping bypasses the CPU cache.
    pub fn map_phys(
        &mut self,
        offset: usize,
        len: usize,
        phys: u64,
        uncached: bool,
    ) -> anyhow::Result<()> {
        if offset % PAGE_SIZE != 0
            || len % PAGE_SIZE != 0
            || offset.checked_add(len).is_none_or(|end| end > self.len)
        {
            anyhow::bail!("range {offset:#x}+{len:#x} is outside the window");
        }
        let file_offset = i64::try_from(phys).context("physical address out of range")?;
        let mut options = fs_err::OpenOptions::new();
        options.read(true).write(true);
        if uncached {
            options.custom_flags(libc::O_SYNC);
        }
        let mem = options.open("/dev/mem")?;

        // SAFETY: the target range was validated to lie within the window
        // reserved by this object, so MAP_FIXED only replaces our own
        // reservation. The file descriptor is valid.
        let addr = unsafe {
            let target = self.addr.byte_add(offset);
            let addr = libc::mmap(
                target,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                mem.as_raw_fd(),
                file_offset,
            );
            if addr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("failed to map physical address {phys:#x}"));
            }
            addr
        };
        if addr != self.addr.wrapping_byte_add(offset) {
            anyhow::bail!("physical address {phys:#x} mapped outside the window");
        }
        self.mapped.push(offset..offset + len);
        Ok(())
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn check(&self, offset: usize, len: usize) {
        let end = offset.saturating_add(len);
        assert!(
            self.mapped
                .iter()
                .any(|r| r.start <= offset && end <= r.end),
            "access to unmapped range {offset:#x}+{len:#x}"
        );
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert_eq!(offset % 4, 0);
        self.check(offset, 4);
        // SAFETY: We have validated that the offset is inside a mapped range.
        unsafe { std::ptr::read_volatile(self.addr.byte_add(offset).cast()) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        assert_eq!(offset % 8, 0);
        self.check(offset, 8);
        // SAFETY: We have validated that the offset is inside a mapped range.
        unsafe { std::ptr::read_volatile(self.addr.byte_add(offset).cast()) }
    }

    pub fn write_u32(&self, offset: usize, data: u32) {
        assert_eq!(offset % 4, 0);
        self.check(offset, 4);
        // SAFETY: We have validated that the offset is inside a mapped range.
        unsafe {
            std::ptr::write_volatile(self.addr.byte_add(offset).cast(), data);
        }
    }

    pub fn write_u64(&self, offset: usize, data: u64) {
        assert_eq!(offset % 8, 0);
        self.check(offset, 8);
        // SAFETY: We have validated that the offset is inside a mapped range.
        unsafe {
            std::ptr::write_volatile(self.addr.byte_add(offset).cast(), data);
        }
    }

    /// Copies bytes out of the window, one volatile byte access at a time.
    pub fn read_bytes(&self, offset: usize, data: &mut [u8]) {
        self.check(offset, data.len());
        for (i, b) in data.iter_mut().enumerate() {
            // SAFETY: We have validated that the range is inside a mapped range.
            *b = unsafe { std::ptr::read_volatile(self.addr.byte_add(offset + i).cast()) };
        }
    }

    /// Copies bytes into the window, one volatile byte access at a time.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        for (i, &b) in data.iter().enumerate() {
            // SAFETY: We have validated that the range is inside a mapped range.
            unsafe { std::ptr::write_volatile(self.addr.byte_add(offset + i).cast(), b) };
        }
    }
}

impl Drop for PhysWindow {
    fn drop(&mut self) {
        // SAFETY: The address and length are a valid mmap result.
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

/// A page of the current process locked into RAM.
///
/// Locks do not nest: unlocking the page releases every lock on it.
pub struct LockedPage {
    addr: usize,
}

impl LockedPage {
    /// Locks the page containing `va`.
    pub fn lock(va: u64) -> std::io::Result<Self> {
        let addr = usize::try_from(va).map_err(|_| std::io::ErrorKind::InvalidInput)?;
        let addr = addr & !(PAGE_SIZE - 1);
        // SAFETY: mlock does not access the memory; it fails with ENOMEM if
        // the range is not mapped.
        syscall_result(unsafe { libc::mlock(addr as *const c_void, PAGE_SIZE) })?;
        Ok(Self { addr })
    }

    pub fn va(&self) -> u64 {
        self.addr as u64
    }
}

impl Drop for LockedPage {
    fn drop(&mut self) {
        // SAFETY: The page was locked by this object.
        unsafe {
            libc::munlock(self.addr as *const c_void, PAGE_SIZE);
        }
    }
}

/// Looks up the physical frame number backing `va` in `/proc/self/pagemap`.
///
/// The page must be resident. Reading frame numbers requires `CAP_SYS_ADMIN`.
pub fn virt_to_pfn(va: u64) -> anyhow::Result<u64> {
    let mut pagemap = fs_err::File::open("/proc/self/pagemap")?;
    pagemap
        .seek(SeekFrom::Start(8 * (va / PAGE_SIZE as u64)))
        .context("failed to seek")?;
    let mut entry = 0u64;
    pagemap
        .read_exact(entry.as_mut_bytes())
        .context("failed to read from pagemap")?;
    if entry & (1 << 63) == 0 {
        anyhow::bail!("page not present in RAM");
    }
    let pfn = entry & 0x3f_ffff_ffff_ffff;
    if pfn == 0 {
        anyhow::bail!("page frame number hidden, CAP_SYS_ADMIN required");
    }
    Ok(pfn)
}

#[cfg(test)]
mod tests {
    use super::PhysWindow;
    use super::StopEvent;
    use super::UioDevice;
    use test_with_tracing::test;

    #[test]
    fn reserve_requires_page_multiple() {
        let window = PhysWindow::reserve(0x3000).unwrap();
        assert_eq!(window.len(), 0x3000);
        PhysWindow::reserve(0x1001).unwrap_err();
        PhysWindow::reserve(0).unwrap_err();
    }

    #[test]
    #[should_panic(expected = "unmapped")]
    fn reserved_range_is_not_accessible() {
        let window = PhysWindow::reserve(0x1000).unwrap();
        window.read_u32(0);
    }

    #[test]
    fn map_outside_window_fails() {
        let mut window = PhysWindow::reserve(0x1000).unwrap();
        window.map_phys(0x1000, 0x1000, 0, true).unwrap_err();
        window.map_phys(0, 0x800, 0, true).unwrap_err();
    }

    #[test]
    fn open_errors_name_the_path() {
        let err = UioDevice::open("/dev/does-not-exist-uio".as_ref())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("/dev/does-not-exist-uio"));
    }

    #[test]
    fn stop_event_signals() {
        let stop = StopEvent::new().unwrap();
        stop.signal().unwrap();
        stop.signal().unwrap();
    }
}
