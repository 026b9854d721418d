// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to an FPGA-attached AXI peripheral.
//!
//! A device exposes a small control register window, a large physically
//! contiguous streaming buffer, and a single interrupt line. A consumer opens
//! the device exclusively, maps both regions as one fixed-layout window, pins
//! its own pages for zero-copy DMA, and blocks on (or polls for) completion
//! events raised by the interrupt.
//!
//! The services this needs from the surrounding platform (interrupt
//! registration, page pinning and cache maintenance, installing mappings) are
//! expressed as traits so that the same session logic runs over the Linux
//! backing in [`linux`] and the in-memory backing in [`emulated`].

#![forbid(unsafe_code)]

pub mod completion;
pub mod emulated;
mod error;
#[cfg(all(target_os = "linux", feature = "uio"))]
pub mod linux;
pub mod mapping;
pub mod pin;
pub mod protocol;
pub mod resources;
mod session;

pub use error::DeviceError;
pub use error::ErrorKind;
pub use error::InvalidArgument;
pub use session::Device;
pub use session::Session;

use completion::CompletionSignal;
use pin::DmaOps;

/// The page size used for the buffer layout and for pinned pages.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;
pub const PAGE_SHIFT: u32 = 12;

/// The platform services backing a device instance.
pub trait DeviceBacking: 'static + Send + Sync {
    /// The DMA operations used to pin and synchronize user pages.
    type Dma: DmaOps;

    /// An identifier for the device, used in logs.
    fn id(&self) -> &str;

    /// Attaches `signal` to interrupt `line`.
    ///
    /// The backing calls [`CompletionSignal::signal`] from its interrupt path
    /// each time the line fires. The line is released when the returned
    /// registration is dropped.
    fn request_irq(
        &self,
        line: u32,
        name: &str,
        signal: CompletionSignal,
    ) -> anyhow::Result<IrqRegistration>;

    /// Returns the DMA operations for this device.
    fn dma(&self) -> &Self::Dma;
}

/// An interrupt line held on behalf of a session. Dropping it frees the line.
#[must_use]
pub struct IrqRegistration {
    line: u32,
    _inner: Box<dyn Send + Sync>,
}

impl IrqRegistration {
    /// Wraps a backing-specific object whose drop releases interrupt `line`.
    pub fn new(line: u32, inner: impl 'static + Send + Sync) -> Self {
        Self {
            line,
            _inner: Box::new(inner),
        }
    }

    /// The interrupt line number.
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl std::fmt::Debug for IrqRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqRegistration")
            .field("line", &self.line)
            .finish()
    }
}
