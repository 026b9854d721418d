// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A device backing for Linux user mode, built on a UIO node for the
//! interrupt, `/dev/mem` for the device window, and `mlock` plus
//! `/proc/self/pagemap` for pinning.
//!
//! There is no IOMMU in the path: the DMA address of a pinned page is its
//! physical address. User mode cannot maintain the CPU caches, so the sync
//! operations are memory fences only and this backing requires pinned pages
//! to be cache coherent with the device.

use crate::DeviceBacking;
use crate::IrqRegistration;
use crate::PAGE_SHIFT;
use crate::completion::CompletionSignal;
use crate::mapping::AddressSpace;
use crate::mapping::CachePolicy;
use crate::pin::DmaAddr;
use crate::pin::DmaDirection;
use crate::pin::DmaOps;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::fence;
use std::thread::JoinHandle;
use uio_sys::LockedPage;
use uio_sys::PhysWindow;
use uio_sys::StopEvent;
use uio_sys::UioDevice;
use uio_sys::Wakeup;

/// A device whose interrupt is delivered through a UIO node.
pub struct UioBacking {
    id: String,
    uio_path: PathBuf,
    dma: LinuxDma,
}

impl UioBacking {
    pub fn new(id: &str, uio_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_owned(),
            uio_path: uio_path.into(),
            dma: LinuxDma,
        }
    }
}

impl DeviceBacking for UioBacking {
    type Dma = LinuxDma;

    fn id(&self) -> &str {
        &self.id
    }

    fn request_irq(
        &self,
        line: u32,
        name: &str,
        signal: CompletionSignal,
    ) -> anyhow::Result<IrqRegistration> {
        let uio = UioDevice::open(&self.uio_path)?;
        let stop = Arc::new(StopEvent::new().context("failed to create stop event")?);
        let thread = std::thread::Builder::new()
            .name(format!("{name}-irq"))
            .spawn({
                let stop = stop.clone();
                let id = self.id.clone();
                move || InterruptThread { id, line, uio }.run(&stop, &signal)
            })
            .context("failed to spawn interrupt thread")?;
        Ok(IrqRegistration::new(
            line,
            InterruptGuard {
                stop,
                thread: Some(thread),
            },
        ))
    }

    fn dma(&self) -> &LinuxDma {
        &self.dma
    }
}

struct InterruptThread {
    id: String,
    line: u32,
    uio: UioDevice,
}

impl InterruptThread {
    fn run(self, stop: &StopEvent, signal: &CompletionSignal) {
        loop {
            if let Err(err) = self.uio.enable_interrupt() {
                tracing::error!(
                    id = %self.id,
                    irq = self.line,
                    error = &err as &dyn std::error::Error,
                    "failed to enable interrupt"
                );
                break;
            }
            match self.uio.wait(stop) {
                Ok(Wakeup::Stopped) => break,
                Ok(Wakeup::Interrupt) => {}
                Err(err) => {
                    tracing::error!(
                        id = %self.id,
                        irq = self.line,
                        error = &err as &dyn std::error::Error,
                        "interrupt wait failed"
                    );
                    break;
                }
            }
            match self.uio.read_event_count() {
                Ok(count) => {
                    tracing::trace!(irq = self.line, count, "interrupt");
                    signal.signal();
                }
                Err(err) => {
                    tracing::error!(
                        id = %self.id,
                        irq = self.line,
                        error = &err as &dyn std::error::Error,
                        "failed to read interrupt count"
                    );
                    break;
                }
            }
        }
    }
}

struct InterruptGuard {
    stop: Arc<StopEvent>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Err(err) = self.stop.signal() {
            // The thread cannot be woken, so leave it behind rather than
            // blocking forever.
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to stop interrupt thread"
            );
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("interrupt thread panicked");
            }
        }
    }
}

/// DMA operations for physically addressed, cache-coherent devices.
pub struct LinuxDma;

/// A user page locked into RAM.
pub struct LinuxPage {
    _lock: LockedPage,
    pfn: u64,
}

impl DmaOps for LinuxDma {
    type Page = LinuxPage;

    fn pin_user_page(&self, va: u64) -> anyhow::Result<LinuxPage> {
        let lock = LockedPage::lock(va).context("failed to lock page")?;
        let pfn = uio_sys::virt_to_pfn(va)?;
        Ok(LinuxPage { _lock: lock, pfn })
    }

    fn map_page(&self, page: &LinuxPage, _len: usize, _dir: DmaDirection) -> anyhow::Result<DmaAddr> {
        Ok(DmaAddr::new(page.pfn << PAGE_SHIFT))
    }

    fn sync_for_device(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {
        fence(SeqCst);
    }

    fn sync_for_cpu(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {
        fence(SeqCst);
    }

    fn unmap_page(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {
        fence(SeqCst);
    }
}

/// The current process's address space, with device memory reached through
/// `/dev/mem`.
pub struct DevMem;

impl AddressSpace for DevMem {
    type Window = PhysWindow;

    fn reserve(&self, len: usize) -> std::io::Result<PhysWindow> {
        PhysWindow::reserve(len)
    }

    fn remap_pfn_range(
        &self,
        window: &mut PhysWindow,
        offset: usize,
        pfn: u64,
        len: usize,
        cache: CachePolicy,
    ) -> std::io::Result<()> {
        window
            .map_phys(offset, len, pfn << PAGE_SHIFT, cache == CachePolicy::NonCached)
            .map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::DevMem;
    use super::InterruptGuard;
    use super::UioBacking;
    use crate::DeviceBacking;
    use crate::completion::CompletionSignal;
    use crate::mapping::AddressSpace;
    use std::sync::Arc;
    use test_with_tracing::test;
    use uio_sys::StopEvent;

    #[test]
    fn missing_uio_node() {
        let backing = UioBacking::new("fpga0", "/dev/does-not-exist-uio");
        backing
            .request_irq(61, "axi_fpga", CompletionSignal::new())
            .unwrap_err();
    }

    #[test]
    fn reserve_window() {
        let window = DevMem.reserve(0x2000).unwrap();
        assert_eq!(window.len(), 0x2000);
    }

    #[test]
    fn guard_survives_panicked_thread() {
        let stop = Arc::new(StopEvent::new().unwrap());
        let thread: std::thread::JoinHandle<()> =
            std::thread::spawn(|| panic!("interrupt thread failure"));
        while !thread.is_finished() {
            std::thread::yield_now();
        }
        drop(InterruptGuard {
            stop,
            thread: Some(thread),
        });
    }
}
