// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device and its single open session.

use crate::DeviceBacking;
use crate::DeviceError;
use crate::IrqRegistration;
use crate::completion::CancelToken;
use crate::completion::CompletionSignal;
use crate::mapping::AddressSpace;
use crate::mapping::DeviceWindow;
use crate::mapping::MappingProvider;
use crate::pin::DmaAddr;
use crate::pin::DmaDirection;
use crate::pin::PinManager;
use crate::protocol::BufferAddr;
use crate::protocol::ControlCommand;
use crate::protocol::PollEvents;
use crate::resources::Attribute;
use crate::resources::PhysicalResources;
use crate::resources::ResourceError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::AcqRel;
use std::sync::atomic::Ordering::Release;

/// A device instance: its physical resources, its platform backing, and the
/// completion signal shared with the interrupt path.
///
/// At most one [`Session`] is open at a time.
pub struct Device<B: DeviceBacking> {
    resources: PhysicalResources,
    backing: B,
    mapping: MappingProvider,
    signal: CompletionSignal,
    open: AtomicBool,
}

impl<B: DeviceBacking> Device<B> {
    /// Brings up a device over `backing`.
    pub fn new(resources: PhysicalResources, backing: B) -> Result<Arc<Self>, ResourceError> {
        let mapping = MappingProvider::new(&resources)?;
        tracing::info!(
            id = backing.id(),
            name = %resources.name,
            control_base = resources.control_base,
            control_len = resources.control_len,
            buffer_base = resources.buffer_base,
            buffer_len = resources.buffer_len(),
            irq = resources.irq,
            "device ready"
        );
        Ok(Arc::new(Self {
            resources,
            backing,
            mapping,
            signal: CompletionSignal::new(),
            open: AtomicBool::new(false),
        }))
    }

    pub fn resources(&self) -> &PhysicalResources {
        &self.resources
    }

    /// Renders a read-only attribute.
    pub fn attribute(&self, attr: Attribute) -> String {
        attr.show(&self.resources)
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Returns whether a session is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Acquire)
    }

    /// Opens the device, acquiring its interrupt line.
    ///
    /// Fails with [`DeviceError::Busy`] if a session is already open. If the
    /// interrupt cannot be acquired, the device stays closed.
    pub fn open(self: &Arc<Self>) -> Result<Session<B>, DeviceError> {
        if self
            .open
            .compare_exchange(false, true, AcqRel, Acquire)
            .is_err()
        {
            return Err(DeviceError::Busy);
        }

        // Clear any event left over from the previous session before the
        // line can fire again.
        self.signal.reset();
        let irq = self.resources.irq;
        let registration = match self.backing.request_irq(
            irq,
            &self.resources.name,
            self.signal.clone(),
        ) {
            Ok(registration) => registration,
            Err(source) => {
                self.open.store(false, Release);
                return Err(DeviceError::Interrupt { irq, source });
            }
        };

        tracing::info!(id = self.backing.id(), irq, "device opened");
        Ok(Session {
            device: self.clone(),
            irq: Mutex::new(Some(registration)),
            pins: PinManager::new(),
            cancel: self.signal.cancel_token(),
            open: AtomicBool::new(true),
        })
    }
}

/// An open handle to a [`Device`].
///
/// Dropping the session releases it.
pub struct Session<B: DeviceBacking> {
    device: Arc<Device<B>>,
    irq: Mutex<Option<IrqRegistration>>,
    pins: PinManager<B::Dma>,
    cancel: CancelToken,
    open: AtomicBool,
}

impl<B: DeviceBacking> Session<B> {
    fn check_open(&self) -> Result<(), DeviceError> {
        if self.open.load(Acquire) {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    pub fn device(&self) -> &Arc<Device<B>> {
        &self.device
    }

    /// Blocks until the device signals a completion.
    ///
    /// Always returns zero bytes; the data arrives through the mapped buffer.
    /// Completions that arrive before the read collapse into one. Returns
    /// [`DeviceError::Interrupted`] if the wait is cancelled through
    /// [`Self::cancel_handle`] or the session is released.
    pub fn read(&self) -> Result<usize, DeviceError> {
        self.check_open()?;
        self.device.signal.wait_for_event(&self.cancel)?;
        Ok(0)
    }

    /// Reports whether a completion is pending, without consuming it.
    pub fn poll(&self) -> Result<PollEvents, DeviceError> {
        self.check_open()?;
        Ok(if self.device.signal.poll_ready() {
            PollEvents::readable()
        } else {
            PollEvents::new()
        })
    }

    /// Waits until a completion is pending, without consuming it.
    pub async fn readable(&self) -> Result<(), DeviceError> {
        self.check_open()?;
        self.device.signal.ready().await;
        Ok(())
    }

    /// Returns a handle that aborts a blocked [`Self::read`].
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Dispatches a raw control command.
    ///
    /// For [`ControlCommand::GetPage`], the DMA address is written back to
    /// `payload.phys_addr`.
    pub fn control(&self, code: u32, payload: &mut BufferAddr) -> Result<(), DeviceError> {
        self.check_open()?;
        let command = ControlCommand::from_code(code).ok_or(DeviceError::NotSupported(code))?;
        let handle = DmaAddr::new(payload.phys_addr);
        match command {
            ControlCommand::GetPage => {
                let addr = self.pin_page(payload.virt_addr, payload.size, payload.direction())?;
                payload.phys_addr = addr.get();
            }
            ControlCommand::GivePage => {
                self.sync_for_device(handle, payload.size, payload.direction())?
            }
            ControlCommand::TakePage => {
                self.sync_for_cpu(handle, payload.size, payload.direction())?
            }
            ControlCommand::ReleasePage => self.release_page(handle)?,
        }
        Ok(())
    }

    /// Pins the user page containing `va` for a transfer of `len` bytes.
    pub fn pin_page(&self, va: u64, len: u64, dir: DmaDirection) -> Result<DmaAddr, DeviceError> {
        self.check_open()?;
        self.pins.pin_page(self.device.backing.dma(), va, len, dir)
    }

    /// Hands a pinned page to the device. The CPU must not touch the page
    /// until it is reclaimed with [`Self::sync_for_cpu`].
    pub fn sync_for_device(
        &self,
        addr: DmaAddr,
        len: u64,
        dir: DmaDirection,
    ) -> Result<(), DeviceError> {
        self.check_open()?;
        self.pins
            .sync_for_device(self.device.backing.dma(), addr, len, dir)
    }

    /// Reclaims a pinned page for the CPU.
    pub fn sync_for_cpu(
        &self,
        addr: DmaAddr,
        len: u64,
        dir: DmaDirection,
    ) -> Result<(), DeviceError> {
        self.check_open()?;
        self.pins.sync_for_cpu(self.device.backing.dma(), addr, len, dir)
    }

    /// Unpins a page.
    pub fn release_page(&self, addr: DmaAddr) -> Result<(), DeviceError> {
        self.check_open()?;
        self.pins.release_page(self.device.backing.dma(), addr)
    }

    /// The number of pages currently pinned by this session.
    pub fn pinned_pages(&self) -> usize {
        self.pins.len()
    }

    /// Maps the control registers and the streaming buffer into `space`.
    ///
    /// `length` must be exactly the control length plus the buffer length,
    /// and `offset` must be zero.
    pub fn mmap<A: AddressSpace>(
        &self,
        space: &A,
        length: usize,
        offset: u64,
    ) -> Result<DeviceWindow<A::Window>, DeviceError> {
        self.check_open()?;
        self.device.mapping.create_mapping(space, length, offset)
    }

    /// Releases the session: wakes every blocked reader, unpins every page,
    /// and frees the interrupt line. Calling this again does nothing.
    pub fn release(&self) {
        if !self.open.swap(false, AcqRel) {
            return;
        }
        self.cancel.close();
        let leaked = self.pins.release_all(self.device.backing.dma());
        if leaked > 0 {
            tracing::warn!(
                id = self.device.backing.id(),
                pages = leaked,
                "released session with pages still pinned"
            );
        }
        drop(self.irq.lock().take());
        self.device.open.store(false, Release);
        tracing::info!(id = self.device.backing.id(), "device released");
    }
}

impl<B: DeviceBacking> Drop for Session<B> {
    fn drop(&mut self) {
        self.release();
    }
}
