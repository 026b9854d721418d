// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::pin::DmaAddr;
use crate::pin::DmaDirection;
use thiserror::Error;

/// An error returned by a device session operation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device is already open")]
    Busy,
    #[error("device is not open")]
    NotOpen,
    #[error("invalid argument")]
    InvalidArgument(#[from] InvalidArgument),
    #[error("failed to request interrupt {irq}")]
    Interrupt {
        irq: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to map page at user address {va:#x} for dma")]
    DmaMap {
        va: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to install device mapping")]
    Mapping(#[source] std::io::Error),
    #[error("unsupported control command {0:#x}")]
    NotSupported(u32),
    #[error("wait interrupted")]
    Interrupted,
}

/// The reason a request argument was rejected.
#[derive(Debug, Error)]
pub enum InvalidArgument {
    #[error("mapping offset {0:#x} is not zero")]
    MappingOffset(u64),
    #[error("mapping length {requested:#x} does not match device window length {expected:#x}")]
    MappingLength { requested: usize, expected: usize },
    #[error("user address {va:#x} does not resolve to a resident page")]
    UnresolvedAddress {
        va: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("transfer length {0:#x} is not within a single page")]
    PinLength(u64),
    #[error("page at {0} is already pinned")]
    AlreadyPinned(DmaAddr),
    #[error("no page is pinned at {0}")]
    UnknownHandle(DmaAddr),
    #[error("transfer length {requested:#x} exceeds pinned length {pinned:#x}")]
    SyncLength { requested: u64, pinned: u64 },
    #[error("direction {requested:?} does not match pinned direction {pinned:?}")]
    DirectionMismatch {
        requested: DmaDirection,
        pinned: DmaDirection,
    },
}

/// The error categories surfaced to a consumer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Busy,
    NotOpen,
    InvalidArgument,
    IoError,
    NotSupported,
    Interrupted,
}

impl DeviceError {
    /// Returns the error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Busy => ErrorKind::Busy,
            DeviceError::NotOpen => ErrorKind::NotOpen,
            DeviceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DeviceError::Interrupt { .. }
            | DeviceError::DmaMap { .. }
            | DeviceError::Mapping(_) => ErrorKind::IoError,
            DeviceError::NotSupported(_) => ErrorKind::NotSupported,
            DeviceError::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// Returns the errno a character device would report for this error.
    pub fn errno(&self) -> i32 {
        match self.kind() {
            ErrorKind::Busy => libc::EBUSY,
            ErrorKind::NotOpen | ErrorKind::IoError => libc::EIO,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::NotSupported => libc::ENOTTY,
            ErrorKind::Interrupted => libc::EINTR,
        }
    }
}

impl From<DeviceError> for std::io::Error {
    fn from(err: DeviceError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Busy => std::io::ErrorKind::ResourceBusy,
            ErrorKind::InvalidArgument => std::io::ErrorKind::InvalidInput,
            ErrorKind::NotSupported => std::io::ErrorKind::Unsupported,
            ErrorKind::Interrupted => std::io::ErrorKind::Interrupted,
            ErrorKind::NotOpen | ErrorKind::IoError => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
