// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The physical resources of a device instance, and the read-only attributes
//! derived from them.

use crate::PAGE_SIZE64;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The largest supported buffer order (log2 of the page count).
pub const MAX_BUFFER_ORDER: u32 = 31;

/// The physical resources assigned to a device at bring-up.
///
/// These are fixed for the lifetime of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalResources {
    /// A human-readable device name, used when requesting the interrupt.
    pub name: String,
    /// Physical address of the control register window.
    pub control_base: u64,
    /// Length of the control register window in bytes.
    pub control_len: u64,
    /// Physical address of the streaming buffer.
    pub buffer_base: u64,
    /// log2 of the number of pages in the streaming buffer.
    pub buffer_order: u32,
    /// The interrupt line.
    pub irq: u32,
}

/// A resource description that cannot back a device.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("control window base {0:#x} is not page aligned")]
    UnalignedControlBase(u64),
    #[error("control window length {0:#x} is not a non-zero page multiple")]
    ControlLength(u64),
    #[error("buffer base {0:#x} is not page aligned")]
    UnalignedBufferBase(u64),
    #[error("buffer order {0} exceeds the maximum of {MAX_BUFFER_ORDER}")]
    BufferOrder(u32),
    #[error("device window length {0:#x} does not fit in the address space")]
    WindowTooLarge(u64),
}

impl PhysicalResources {
    /// The number of pages in the streaming buffer.
    pub fn buffer_pages(&self) -> u64 {
        1 << self.buffer_order
    }

    /// The length of the streaming buffer in bytes.
    pub fn buffer_len(&self) -> u64 {
        self.buffer_pages() * PAGE_SIZE64
    }

    /// The length of the combined control + buffer window in bytes.
    pub fn window_len(&self) -> u64 {
        self.control_len + self.buffer_len()
    }

    /// Checks that the resources describe a mappable device.
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.control_base % PAGE_SIZE64 != 0 {
            return Err(ResourceError::UnalignedControlBase(self.control_base));
        }
        if self.control_len == 0 || self.control_len % PAGE_SIZE64 != 0 {
            return Err(ResourceError::ControlLength(self.control_len));
        }
        if self.buffer_base % PAGE_SIZE64 != 0 {
            return Err(ResourceError::UnalignedBufferBase(self.buffer_base));
        }
        if self.buffer_order > MAX_BUFFER_ORDER {
            return Err(ResourceError::BufferOrder(self.buffer_order));
        }
        let window_len = self
            .control_len
            .checked_add(self.buffer_len())
            .ok_or(ResourceError::WindowTooLarge(u64::MAX))?;
        if usize::try_from(window_len).is_err() {
            return Err(ResourceError::WindowTooLarge(window_len));
        }
        Ok(())
    }
}

/// A read-only device attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Physical address of the streaming buffer.
    PhysAddr,
    /// Length of the streaming buffer in bytes.
    BufferLength,
    /// Length of the control window in bytes.
    ControlLength,
}

impl Attribute {
    pub const ALL: [Attribute; 3] = [
        Attribute::PhysAddr,
        Attribute::BufferLength,
        Attribute::ControlLength,
    ];

    /// The attribute's file name.
    pub fn name(self) -> &'static str {
        match self {
            Attribute::PhysAddr => "phys_addr",
            Attribute::BufferLength => "buffer_length",
            Attribute::ControlLength => "control_length",
        }
    }

    /// Looks up an attribute by file name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.name() == name)
    }

    pub fn value(self, resources: &PhysicalResources) -> u64 {
        match self {
            Attribute::PhysAddr => resources.buffer_base,
            Attribute::BufferLength => resources.buffer_len(),
            Attribute::ControlLength => resources.control_len,
        }
    }

    /// Renders the attribute as its file contents: decimal, newline terminated.
    pub fn show(self, resources: &PhysicalResources) -> String {
        format!("{}\n", self.value(resources))
    }
}

#[cfg(test)]
mod tests {
    use super::Attribute;
    use super::PhysicalResources;
    use super::ResourceError;
    use test_with_tracing::test;

    fn resources() -> PhysicalResources {
        PhysicalResources {
            name: "axi_fpga".into(),
            control_base: 0x4000_0000,
            control_len: 0x10000,
            buffer_base: 0x1f00_0000,
            buffer_order: 2,
            irq: 61,
        }
    }

    #[test]
    fn lengths() {
        let res = resources();
        assert_eq!(res.buffer_pages(), 4);
        assert_eq!(res.buffer_len(), 0x4000);
        assert_eq!(res.window_len(), 0x14000);
        res.validate().unwrap();
    }

    #[test]
    fn attributes() {
        let res = resources();
        assert_eq!(Attribute::PhysAddr.show(&res), format!("{}\n", 0x1f00_0000u64));
        assert_eq!(Attribute::BufferLength.show(&res), "16384\n");
        assert_eq!(Attribute::ControlLength.show(&res), "65536\n");
        assert_eq!(
            Attribute::from_name("buffer_length"),
            Some(Attribute::BufferLength)
        );
        assert_eq!(Attribute::from_name("irq"), None);
    }

    #[test]
    fn rejects_bad_layout() {
        let mut res = resources();
        res.control_base += 0x10;
        assert!(matches!(
            res.validate(),
            Err(ResourceError::UnalignedControlBase(_))
        ));

        let mut res = resources();
        res.control_len = 0x1001;
        assert!(matches!(res.validate(), Err(ResourceError::ControlLength(_))));

        let mut res = resources();
        res.control_len = 0;
        assert!(matches!(res.validate(), Err(ResourceError::ControlLength(0))));

        let mut res = resources();
        res.buffer_base = 0x800;
        assert!(matches!(
            res.validate(),
            Err(ResourceError::UnalignedBufferBase(0x800))
        ));

        let mut res = resources();
        res.buffer_order = 40;
        assert!(matches!(res.validate(), Err(ResourceError::BufferOrder(40))));
    }

    #[test]
    fn deserialize() {
        let res: PhysicalResources = serde_json::from_str(
            r#"{
                "name": "axi_fpga",
                "control_base": 1073741824,
                "control_len": 65536,
                "buffer_base": 520093696,
                "buffer_order": 2,
                "irq": 61
            }"#,
        )
        .unwrap();
        assert_eq!(res, resources());
    }
}
