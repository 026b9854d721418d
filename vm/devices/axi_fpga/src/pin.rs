// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinning user pages for DMA, and handing them between the CPU and the
//! device.
//!
//! Each transfer follows the same protocol: pin the page, hand it to the
//! device with [`PinManager::sync_for_device`] before the device touches it,
//! and reclaim it with [`PinManager::sync_for_cpu`] before the CPU touches it
//! again. Between those two calls the CPU must not read or write the page.
//! That rule is the caller's responsibility; nothing here can enforce it.

use crate::DeviceError;
use crate::InvalidArgument;
use crate::PAGE_SIZE64;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// A bus address of a pinned page, as seen by the device.
///
/// This is never dereferenced by the CPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaAddr(u64);

impl DmaAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The direction of a DMA transfer, fixed when a page is pinned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads memory the CPU wrote.
    ToDevice,
    /// The device writes memory the CPU will read.
    FromDevice,
}

impl DmaDirection {
    /// Decodes the payload encoding: non-zero is to-device.
    pub fn from_raw(raw: u32) -> Self {
        if raw != 0 {
            DmaDirection::ToDevice
        } else {
            DmaDirection::FromDevice
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            DmaDirection::ToDevice => 1,
            DmaDirection::FromDevice => 0,
        }
    }
}

/// Which side currently owns a pinned page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Owner {
    Cpu,
    Device,
}

/// Platform page pinning and cache maintenance.
pub trait DmaOps: Send + Sync {
    /// A pinned page. Dropping it unpins the page.
    type Page: Send;

    /// Pins the resident page at user address `va`.
    fn pin_user_page(&self, va: u64) -> anyhow::Result<Self::Page>;

    /// Makes the first `len` bytes of `page` visible to the device for
    /// transfers in direction `dir`, returning the bus address.
    fn map_page(&self, page: &Self::Page, len: usize, dir: DmaDirection)
    -> anyhow::Result<DmaAddr>;

    /// Transfers cache ownership of a mapped range to the device.
    fn sync_for_device(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Transfers cache ownership of a mapped range back to the CPU.
    fn sync_for_cpu(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Tears down a mapping made by [`DmaOps::map_page`].
    fn unmap_page(&self, addr: DmaAddr, len: usize, dir: DmaDirection);
}

struct PinnedEntry<P> {
    // Held for its drop, which unpins the page.
    _page: P,
    va: u64,
    len: u64,
    direction: DmaDirection,
    owner: Owner,
}

/// The pinned-page table of one session, keyed by DMA address.
pub struct PinManager<D: DmaOps> {
    table: Mutex<HashMap<DmaAddr, PinnedEntry<D::Page>>>,
}

impl<D: DmaOps> PinManager<D> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Pins the page containing `va` for a transfer of `len` bytes in
    /// direction `dir`.
    ///
    /// `len` must fit in a page. The returned DMA address is that of the page
    /// start, and is the handle for the other operations.
    pub fn pin_page(
        &self,
        dma: &D,
        va: u64,
        len: u64,
        dir: DmaDirection,
    ) -> Result<DmaAddr, DeviceError> {
        if len == 0 || len > PAGE_SIZE64 {
            return Err(InvalidArgument::PinLength(len).into());
        }
        let page_va = va & !(PAGE_SIZE64 - 1);

        // Held across the pin: platform pins do not nest, so a page must be
        // found in the table before it is pinned a second time.
        let mut table = self.table.lock();
        if let Some((&addr, _)) = table.iter().find(|(_, entry)| entry.va == page_va) {
            return Err(InvalidArgument::AlreadyPinned(addr).into());
        }
        let page = dma
            .pin_user_page(page_va)
            .map_err(|source| InvalidArgument::UnresolvedAddress { va, source })?;
        let addr = dma
            .map_page(&page, len as usize, dir)
            .map_err(|source| DeviceError::DmaMap { va, source })?;
        if table.contains_key(&addr) {
            // Another user address maps the same physical page.
            dma.unmap_page(addr, len as usize, dir);
            return Err(InvalidArgument::AlreadyPinned(addr).into());
        }
        table.insert(
            addr,
            PinnedEntry {
                _page: page,
                va: page_va,
                len,
                direction: dir,
                owner: Owner::Cpu,
            },
        );
        tracing::debug!(va, dma_addr = addr.get(), len, direction = ?dir, "pinned page");
        Ok(addr)
    }

    /// Hands a pinned page to the device.
    pub fn sync_for_device(
        &self,
        dma: &D,
        addr: DmaAddr,
        len: u64,
        dir: DmaDirection,
    ) -> Result<(), DeviceError> {
        self.sync(addr, len, dir, Owner::Device, |len| {
            dma.sync_for_device(addr, len, dir)
        })
    }

    /// Reclaims a pinned page for the CPU.
    pub fn sync_for_cpu(
        &self,
        dma: &D,
        addr: DmaAddr,
        len: u64,
        dir: DmaDirection,
    ) -> Result<(), DeviceError> {
        self.sync(addr, len, dir, Owner::Cpu, |len| {
            dma.sync_for_cpu(addr, len, dir)
        })
    }

    fn sync(
        &self,
        addr: DmaAddr,
        len: u64,
        dir: DmaDirection,
        owner: Owner,
        op: impl FnOnce(usize),
    ) -> Result<(), DeviceError> {
        let mut table = self.table.lock();
        let entry = table
            .get_mut(&addr)
            .ok_or(InvalidArgument::UnknownHandle(addr))?;
        if len == 0 || len > entry.len {
            return Err(InvalidArgument::SyncLength {
                requested: len,
                pinned: entry.len,
            }
            .into());
        }
        if dir != entry.direction {
            return Err(InvalidArgument::DirectionMismatch {
                requested: dir,
                pinned: entry.direction,
            }
            .into());
        }
        op(len as usize);
        entry.owner = owner;
        tracing::trace!(dma_addr = addr.get(), len, direction = ?dir, ?owner, "synced page");
        Ok(())
    }

    /// Unmaps and unpins a page.
    pub fn release_page(&self, dma: &D, addr: DmaAddr) -> Result<(), DeviceError> {
        let entry = self
            .table
            .lock()
            .remove(&addr)
            .ok_or(InvalidArgument::UnknownHandle(addr))?;
        Self::unpin(dma, addr, entry);
        Ok(())
    }

    /// Unmaps and unpins every page, returning how many there were.
    pub fn release_all(&self, dma: &D) -> usize {
        let entries = std::mem::take(&mut *self.table.lock());
        let count = entries.len();
        for (addr, entry) in entries {
            Self::unpin(dma, addr, entry);
        }
        count
    }

    fn unpin(dma: &D, addr: DmaAddr, entry: PinnedEntry<D::Page>) {
        dma.unmap_page(addr, entry.len as usize, entry.direction);
        tracing::debug!(
            va = entry.va,
            dma_addr = addr.get(),
            owner = ?entry.owner,
            "unpinned page"
        );
        drop(entry);
    }

    /// The number of pinned pages.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns the current owner of a pinned page.
    pub fn owner(&self, addr: DmaAddr) -> Option<Owner> {
        self.table.lock().get(&addr).map(|entry| entry.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::DmaAddr;
    use super::DmaDirection;
    use super::Owner;
    use super::PinManager;
    use crate::DeviceError;
    use crate::ErrorKind;
    use crate::InvalidArgument;
    use crate::PAGE_SIZE;
    use crate::PAGE_SIZE64;
    use crate::emulated::DmaEvent;
    use crate::emulated::EmulatedDma;
    use crate::emulated::EmulatedMemory;
    use std::sync::Arc;
    use test_with_tracing::test;

    fn setup(pages: usize) -> (Arc<EmulatedMemory>, EmulatedDma, u64) {
        let memory = Arc::new(EmulatedMemory::new());
        let va = memory.map_user_pages(pages);
        let dma = EmulatedDma::new(memory.clone());
        (memory, dma, va)
    }

    #[test]
    fn to_device_round_trip() {
        let (memory, dma, va) = setup(1);
        let pins = PinManager::<EmulatedDma>::new();
        let addr = pins
            .pin_page(&dma, va, PAGE_SIZE64, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(memory.pin_count(va), 1);
        assert_eq!(pins.owner(addr), Some(Owner::Cpu));

        memory.cpu_write(va, b"hello device");
        // Still only in the CPU cache.
        assert_ne!(memory.device_read(addr, 12), b"hello device");

        pins.sync_for_device(&dma, addr, PAGE_SIZE64, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(pins.owner(addr), Some(Owner::Device));
        assert_eq!(memory.device_read(addr, 12), b"hello device");

        pins.sync_for_cpu(&dma, addr, PAGE_SIZE64, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(memory.cpu_read(va, 12), b"hello device");
        assert_eq!(pins.owner(addr), Some(Owner::Cpu));
        // Still pinned until released.
        assert_eq!(pins.len(), 1);
        assert_eq!(memory.pin_count(va), 1);

        pins.release_page(&dma, addr).unwrap();
        assert_eq!(pins.len(), 0);
        assert_eq!(memory.pin_count(va), 0);
    }

    #[test]
    fn from_device_sees_device_data() {
        let (memory, dma, va) = setup(1);
        let pins = PinManager::<EmulatedDma>::new();
        let addr = pins
            .pin_page(&dma, va, 64, DmaDirection::FromDevice)
            .unwrap();

        // Pull the page into the CPU cache before the transfer.
        assert_eq!(memory.cpu_read(va, 4), [0u8; 4]);
        pins.sync_for_device(&dma, addr, 64, DmaDirection::FromDevice)
            .unwrap();
        memory.device_write(addr, b"data");
        pins.sync_for_cpu(&dma, addr, 64, DmaDirection::FromDevice)
            .unwrap();
        assert_eq!(memory.cpu_read(va, 4), b"data");

        assert_eq!(
            memory.dma_log(),
            [
                DmaEvent::Map {
                    addr,
                    len: 64,
                    direction: DmaDirection::FromDevice
                },
                DmaEvent::SyncForDevice {
                    addr,
                    len: 64,
                    direction: DmaDirection::FromDevice
                },
                DmaEvent::SyncForCpu {
                    addr,
                    len: 64,
                    direction: DmaDirection::FromDevice
                },
            ]
        );
    }

    #[test]
    fn stale_cache_without_reclaim() {
        let (memory, dma, va) = setup(1);
        let pins = PinManager::<EmulatedDma>::new();
        let addr = pins
            .pin_page(&dma, va, 64, DmaDirection::FromDevice)
            .unwrap();
        pins.sync_for_device(&dma, addr, 64, DmaDirection::FromDevice)
            .unwrap();
        // Reading the page while the device owns it pulls a stale line into
        // the cache, which only the reclaim discards.
        assert_eq!(memory.cpu_read(va, 4), [0u8; 4]);
        memory.device_write(addr, b"data");
        assert_eq!(memory.cpu_read(va, 4), [0u8; 4]);
        pins.sync_for_cpu(&dma, addr, 64, DmaDirection::FromDevice)
            .unwrap();
        assert_eq!(memory.cpu_read(va, 4), b"data");
    }

    #[test]
    fn pin_preconditions() {
        let (memory, dma, va) = setup(1);
        let pins = PinManager::<EmulatedDma>::new();

        for len in [0, PAGE_SIZE64 + 1] {
            let err = pins
                .pin_page(&dma, va, len, DmaDirection::ToDevice)
                .unwrap_err();
            assert!(matches!(
                err,
                DeviceError::InvalidArgument(InvalidArgument::PinLength(_))
            ));
        }

        let unmapped = va + 16 * PAGE_SIZE as u64;
        let err = pins
            .pin_page(&dma, unmapped, 8, DmaDirection::ToDevice)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidArgument(InvalidArgument::UnresolvedAddress { .. })
        ));

        assert_eq!(pins.len(), 0);
        assert_eq!(memory.pin_count(va), 0);
    }

    #[test]
    fn unaligned_address_pins_containing_page() {
        let (memory, dma, va) = setup(2);
        let pins = PinManager::<EmulatedDma>::new();
        let page = va + PAGE_SIZE64;
        let addr = pins
            .pin_page(&dma, page + 0x123, 64, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(addr.get() % PAGE_SIZE64, 0);
        assert_eq!(memory.pin_count(page), 1);
        assert_eq!(memory.pin_count(va), 0);

        memory.cpu_write(page, b"start");
        pins.sync_for_device(&dma, addr, 64, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(memory.device_read(addr, 5), b"start");

        // Any address within the page names the same pin.
        let err = pins
            .pin_page(&dma, page + 0x800, 64, DmaDirection::ToDevice)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidArgument(InvalidArgument::AlreadyPinned(a)) if a == addr
        ));
    }

    #[test]
    fn duplicate_pin_is_rejected_before_pinning() {
        let (memory, dma, va) = setup(1);
        let pins = PinManager::<EmulatedDma>::new();
        let addr = pins
            .pin_page(&dma, va, 16, DmaDirection::ToDevice)
            .unwrap();
        let err = pins
            .pin_page(&dma, va, 16, DmaDirection::FromDevice)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidArgument(InvalidArgument::AlreadyPinned(a)) if a == addr
        ));
        assert_eq!(memory.pin_count(va), 1);
        assert_eq!(pins.len(), 1);
        // The page was never pinned or mapped a second time, so nothing was
        // torn down underneath the first pin.
        assert_eq!(memory.max_pin_count(va), 1);
        assert_eq!(
            memory.dma_log(),
            [DmaEvent::Map {
                addr,
                len: 16,
                direction: DmaDirection::ToDevice
            }]
        );
    }

    #[test]
    fn map_failure_unpins() {
        let (memory, dma, va) = setup(1);
        let pins = PinManager::<EmulatedDma>::new();
        dma.fail_next_map();
        let err = pins
            .pin_page(&dma, va, 16, DmaDirection::ToDevice)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(memory.pin_count(va), 0);
        assert_eq!(pins.len(), 0);
    }

    #[test]
    fn sync_preconditions() {
        let (_memory, dma, va) = setup(1);
        let pins = PinManager::<EmulatedDma>::new();
        let addr = pins
            .pin_page(&dma, va, 256, DmaDirection::ToDevice)
            .unwrap();

        let err = pins
            .sync_for_device(&dma, DmaAddr::new(0x1234_0000), 16, DmaDirection::ToDevice)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidArgument(InvalidArgument::UnknownHandle(_))
        ));

        for len in [0, 257] {
            let err = pins
                .sync_for_device(&dma, addr, len, DmaDirection::ToDevice)
                .unwrap_err();
            assert!(matches!(
                err,
                DeviceError::InvalidArgument(InvalidArgument::SyncLength { .. })
            ));
        }

        let err = pins
            .sync_for_cpu(&dma, addr, 16, DmaDirection::FromDevice)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidArgument(InvalidArgument::DirectionMismatch { .. })
        ));
        assert_eq!(pins.owner(addr), Some(Owner::Cpu));

        // A partial sync is fine.
        pins.sync_for_device(&dma, addr, 16, DmaDirection::ToDevice)
            .unwrap();
    }

    #[test]
    fn release_all_unpins_everything() {
        let (memory, dma, va) = setup(3);
        let pins = PinManager::<EmulatedDma>::new();
        for i in 0..3 {
            pins.pin_page(
                &dma,
                va + i * PAGE_SIZE64,
                PAGE_SIZE64,
                DmaDirection::FromDevice,
            )
            .unwrap();
        }
        assert_eq!(pins.len(), 3);
        assert_eq!(pins.release_all(&dma), 3);
        assert_eq!(pins.len(), 0);
        for i in 0..3 {
            assert_eq!(memory.pin_count(va + i * PAGE_SIZE64), 0);
        }
        assert_eq!(pins.release_all(&dma), 0);

        let err = pins.release_page(&dma, DmaAddr::new(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
