// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping the control registers and the streaming buffer as one window.
//!
//! The window layout is fixed:
//!
//! ```text
//! [0, control_len)                         control registers
//! [control_len, control_len + buffer_len)  streaming buffer
//! ```
//!
//! Both regions are mapped non-cached. Callers must request exactly the whole
//! window at offset zero; partial views are not supported.

use crate::DeviceError;
use crate::InvalidArgument;
use crate::PAGE_SHIFT;
use crate::resources::PhysicalResources;
use crate::resources::ResourceError;
use std::ops::Range;

/// The caching attribute of a mapped region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CachePolicy {
    Cached,
    /// Accesses go straight to the device, in program order.
    NonCached,
}

/// An address space that device memory can be mapped into.
pub trait AddressSpace {
    /// A reserved range of the address space.
    type Window;

    /// Reserves `len` bytes of inaccessible address space.
    fn reserve(&self, len: usize) -> std::io::Result<Self::Window>;

    /// Maps `len` bytes of physical memory starting at page frame `pfn` at
    /// `offset` within `window`.
    fn remap_pfn_range(
        &self,
        window: &mut Self::Window,
        offset: usize,
        pfn: u64,
        len: usize,
        cache: CachePolicy,
    ) -> std::io::Result<()>;
}

/// Builds the combined device window from a device's physical resources.
#[derive(Debug, Clone)]
pub struct MappingProvider {
    control_base: u64,
    control_len: usize,
    buffer_base: u64,
    buffer_len: usize,
}

impl MappingProvider {
    pub fn new(resources: &PhysicalResources) -> Result<Self, ResourceError> {
        resources.validate()?;
        let control_len = usize::try_from(resources.control_len)
            .map_err(|_| ResourceError::WindowTooLarge(resources.window_len()))?;
        let buffer_len = usize::try_from(resources.buffer_len())
            .map_err(|_| ResourceError::WindowTooLarge(resources.window_len()))?;
        Ok(Self {
            control_base: resources.control_base,
            control_len,
            buffer_base: resources.buffer_base,
            buffer_len,
        })
    }

    /// The only mapping length accepted by [`Self::create_mapping`].
    pub fn window_len(&self) -> usize {
        self.control_len + self.buffer_len
    }

    /// Maps the device window into `space`.
    ///
    /// `length` must equal [`Self::window_len`] and `offset` must be zero. If
    /// either region fails to map, the partially built window is dropped.
    pub fn create_mapping<A: AddressSpace>(
        &self,
        space: &A,
        length: usize,
        offset: u64,
    ) -> Result<DeviceWindow<A::Window>, DeviceError> {
        if offset != 0 {
            return Err(InvalidArgument::MappingOffset(offset).into());
        }
        if length != self.window_len() {
            return Err(InvalidArgument::MappingLength {
                requested: length,
                expected: self.window_len(),
            }
            .into());
        }

        let mut window = space.reserve(length).map_err(DeviceError::Mapping)?;
        space
            .remap_pfn_range(
                &mut window,
                0,
                self.control_base >> PAGE_SHIFT,
                self.control_len,
                CachePolicy::NonCached,
            )
            .map_err(DeviceError::Mapping)?;
        space
            .remap_pfn_range(
                &mut window,
                self.control_len,
                self.buffer_base >> PAGE_SHIFT,
                self.buffer_len,
                CachePolicy::NonCached,
            )
            .map_err(DeviceError::Mapping)?;

        tracing::info!(
            control_base = self.control_base,
            control_len = self.control_len,
            buffer_base = self.buffer_base,
            buffer_len = self.buffer_len,
            "mapped device window"
        );
        Ok(DeviceWindow {
            inner: window,
            control_len: self.control_len,
            buffer_len: self.buffer_len,
        })
    }
}

/// A mapped device window.
///
/// The window stays valid after the session that created it is released.
#[derive(Debug)]
pub struct DeviceWindow<W> {
    inner: W,
    control_len: usize,
    buffer_len: usize,
}

impl<W> DeviceWindow<W> {
    /// The byte range of the control registers.
    pub fn control_range(&self) -> Range<usize> {
        0..self.control_len
    }

    /// The byte range of the streaming buffer.
    pub fn buffer_range(&self) -> Range<usize> {
        self.control_len..self.control_len + self.buffer_len
    }

    pub fn len(&self) -> usize {
        self.control_len + self.buffer_len
    }

    pub fn get(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::CachePolicy;
    use super::MappingProvider;
    use crate::DeviceError;
    use crate::ErrorKind;
    use crate::InvalidArgument;
    use crate::emulated::EmulatedAddressSpace;
    use crate::resources::PhysicalResources;
    use test_with_tracing::test;

    fn provider() -> MappingProvider {
        MappingProvider::new(&PhysicalResources {
            name: "axi_fpga".into(),
            control_base: 0x4000_0000,
            control_len: 0x10000,
            buffer_base: 0x1f00_0000,
            buffer_order: 2,
            irq: 61,
        })
        .unwrap()
    }

    #[test]
    fn exact_window() {
        let provider = provider();
        let space = EmulatedAddressSpace::new();
        assert_eq!(provider.window_len(), 0x14000);

        let window = provider.create_mapping(&space, 0x14000, 0).unwrap();
        assert_eq!(window.len(), 0x14000);
        assert_eq!(window.control_range(), 0..0x10000);
        assert_eq!(window.buffer_range(), 0x10000..0x14000);

        let inner = window.get();
        assert_eq!(
            inner.resolve(0),
            Some((0x4000_0000, CachePolicy::NonCached))
        );
        assert_eq!(
            inner.resolve(0xfffc),
            Some((0x4000_fffc, CachePolicy::NonCached))
        );
        assert_eq!(
            inner.resolve(0x10000),
            Some((0x1f00_0000, CachePolicy::NonCached))
        );
        assert_eq!(
            inner.resolve(0x13fff),
            Some((0x1f00_3fff, CachePolicy::NonCached))
        );
        assert_eq!(inner.resolve(0x14000), None);
    }

    #[test]
    fn rejects_wrong_size_or_offset() {
        let provider = provider();
        let space = EmulatedAddressSpace::new();
        for (length, offset) in [(0x13fff, 0), (0x14001, 0), (0x14000, 1), (0, 0)] {
            let err = provider.create_mapping(&space, length, offset).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{length:#x} {offset}");
        }
        let err = provider.create_mapping(&space, 0x1000, 0x1000).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidArgument(InvalidArgument::MappingOffset(0x1000))
        ));
        assert_eq!(space.reservations(), 0);
    }

    #[test]
    fn remap_failure_is_io_error() {
        let provider = provider();
        for fail_at in [0, 1] {
            let space = EmulatedAddressSpace::new();
            space.fail_remap_at(fail_at);
            let err = provider.create_mapping(&space, 0x14000, 0).unwrap_err();
            assert!(matches!(err, DeviceError::Mapping(_)));
            assert_eq!(err.kind(), ErrorKind::IoError);
        }
    }

    #[test]
    fn rejects_invalid_resources() {
        let res = PhysicalResources {
            name: "axi_fpga".into(),
            control_base: 0x4000_0000,
            control_len: 0x10,
            buffer_base: 0x1f00_0000,
            buffer_order: 2,
            irq: 61,
        };
        MappingProvider::new(&res).unwrap_err();
    }
}
