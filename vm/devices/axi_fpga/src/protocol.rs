// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control command codes and payloads.
//!
//! The codes use the Linux `_IOC` encoding so that a character device front
//! end can pass ioctl requests through unchanged.

use crate::pin::DmaDirection;
use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The payload of every control command.
///
/// For [`ControlCommand::GetPage`], `virt_addr`, `size` and `direction` are
/// inputs and `phys_addr` receives the DMA address. For the other commands,
/// `phys_addr` identifies a page pinned earlier.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct BufferAddr {
    pub virt_addr: u64,
    pub phys_addr: u64,
    pub size: u64,
    /// Non-zero for a transfer to the device, zero for one from the device.
    pub direction: u32,
    pub reserved: u32,
}

const_assert_eq!(size_of::<BufferAddr>(), 32);

impl BufferAddr {
    pub fn direction(&self) -> DmaDirection {
        DmaDirection::from_raw(self.direction)
    }
}

const IOCTL_TYPE: u8 = b'a';

pub const AXI_FPGA_GET_PAGE: u32 =
    nix::request_code_readwrite!(IOCTL_TYPE, 0x30, size_of::<BufferAddr>()) as u32;
pub const AXI_FPGA_GIVE_PAGE: u32 =
    nix::request_code_write!(IOCTL_TYPE, 0x31, size_of::<BufferAddr>()) as u32;
pub const AXI_FPGA_TAKE_PAGE: u32 =
    nix::request_code_write!(IOCTL_TYPE, 0x32, size_of::<BufferAddr>()) as u32;
pub const AXI_FPGA_RELEASE_PAGE: u32 =
    nix::request_code_write!(IOCTL_TYPE, 0x33, size_of::<BufferAddr>()) as u32;

/// A page-transfer control command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Pin a user page and establish its DMA address.
    GetPage,
    /// Hand a pinned page to the device.
    GivePage,
    /// Reclaim a pinned page for the CPU.
    TakePage,
    /// Unpin a page.
    ReleasePage,
}

impl ControlCommand {
    pub fn code(self) -> u32 {
        match self {
            ControlCommand::GetPage => AXI_FPGA_GET_PAGE,
            ControlCommand::GivePage => AXI_FPGA_GIVE_PAGE,
            ControlCommand::TakePage => AXI_FPGA_TAKE_PAGE,
            ControlCommand::ReleasePage => AXI_FPGA_RELEASE_PAGE,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let command = match code {
            AXI_FPGA_GET_PAGE => ControlCommand::GetPage,
            AXI_FPGA_GIVE_PAGE => ControlCommand::GivePage,
            AXI_FPGA_TAKE_PAGE => ControlCommand::TakePage,
            AXI_FPGA_RELEASE_PAGE => ControlCommand::ReleasePage,
            _ => return None,
        };
        Some(command)
    }
}

/// Readiness reported by a session poll, laid out as the `poll(2)` event bits.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct PollEvents {
    pub input: bool,
    pub priority: bool,
    pub output: bool,
    pub error: bool,
    pub hangup: bool,
    pub invalid: bool,
    pub read_normal: bool,
    #[bits(9)]
    _reserved: u16,
}

impl PollEvents {
    /// The events reported when a completion is pending.
    pub fn readable() -> Self {
        Self::new().with_input(true).with_read_normal(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn command_codes() {
        // _IOWR('a', 0x30, 32 bytes) and _IOW('a', 0x31..0x33, 32 bytes) with
        // the generic Linux encoding.
        if cfg!(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        )) {
            assert_eq!(AXI_FPGA_GET_PAGE, 0xc020_6130);
            assert_eq!(AXI_FPGA_GIVE_PAGE, 0x4020_6131);
            assert_eq!(AXI_FPGA_TAKE_PAGE, 0x4020_6132);
            assert_eq!(AXI_FPGA_RELEASE_PAGE, 0x4020_6133);
        }
        for command in [
            ControlCommand::GetPage,
            ControlCommand::GivePage,
            ControlCommand::TakePage,
            ControlCommand::ReleasePage,
        ] {
            assert_eq!(ControlCommand::from_code(command.code()), Some(command));
        }
        assert_eq!(ControlCommand::from_code(0x1234), None);
    }

    #[test]
    fn payload_layout() {
        let payload = BufferAddr {
            virt_addr: 0x1000,
            phys_addr: 0x2000,
            size: 0x100,
            direction: 1,
            reserved: 0,
        };
        let bytes = payload.as_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[24..28], &1u32.to_ne_bytes());
        assert_eq!(BufferAddr::read_from_bytes(bytes).unwrap(), payload);
        assert_eq!(payload.direction(), DmaDirection::ToDevice);
    }

    #[test]
    fn poll_bits() {
        let events = PollEvents::readable();
        assert_eq!(events.into_bits() as i16, libc::POLLIN | libc::POLLRDNORM);
        assert_eq!(PollEvents::new().into_bits(), 0);
    }
}
