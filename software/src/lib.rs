use failure_derive::Fail;

mod transport;
mod descriptors;
mod protocol;
mod parts;
mod image;
mod device;
pub mod scope;
pub mod bulk;
pub mod cli;

pub use transport::{ControlTransport, UsbTransport, BulkTransport, BulkPipe};
pub use descriptors::{DeviceDescriptor, DFUInterface, DFUMode};
pub use protocol::{DFUState, DFUStatus, StatusResponse, DeviceInfo};
pub use parts::{Part, lookup_part, revision_string};
pub use image::{DFUImage, DFUSuffix, StellarisPrefix, PREFIX_LENGTH, SUFFIX_LENGTH,
                wrap, unwrap, prefix_valid, suffix_valid, dfu_crc};
pub use device::{DFUDevice, DeviceSummary, Progress, Operation, NoProgress};

/// USB vendor ID allocated to Stellaris devices.
pub const STELLARIS_VID: u16 = 0x1CBE;

/// Product ID of the Stellaris USB DFU boot loader.
pub const DFU_BOOTLOADER_PID: u16 = 0x00FF;

#[derive(Fail, Debug)]
pub enum DFUError {
    #[fail(display="USB error: {}", _0)]
    USBError(#[cause] rusb::Error),

    #[fail(display="Invalid device handle")]
    Handle,

    #[fail(display="Memory allocation failed")]
    Memory,

    #[fail(display="No DFU device found")]
    NotFound,

    #[fail(display="An unknown error has occurred")]
    Unknown,

    #[fail(display="Operation not supported by the target device")]
    Unsupported,

    #[fail(display="Image is not in DFU format")]
    InvalidFormat,

    #[fail(display="Invalid flash address")]
    InvalidAddress,

    #[fail(display="Invalid size")]
    InvalidSize,

    #[fail(display="Device disconnected")]
    Disconnected,

    #[fail(display="USB transfer timed out")]
    Timeout,

    #[fail(display="Control endpoint stalled")]
    Stall,

    #[fail(display="Device reported a download failure")]
    DownloadFail,

    #[fail(display="Device is not idle after download, cannot verify")]
    CantVerify,

    #[fail(display="Flash readback verification failed")]
    VerifyFail,

    #[fail(display="Not enough data transferred: expected {}, got {}", expected, read)]
    NotEnoughData { expected: usize, read: usize },
}

impl DFUError {
    /// Numeric error code as reported by the Stellaris DFU library.
    pub fn code(&self) -> i32 {
        match self {
            DFUError::Handle => -1,
            DFUError::Memory => -2,
            DFUError::NotFound => -3,
            DFUError::Unknown | DFUError::USBError(_) | DFUError::NotEnoughData { .. } => -4,
            DFUError::Unsupported => -5,
            DFUError::InvalidFormat => -6,
            DFUError::InvalidAddress => -7,
            DFUError::InvalidSize => -8,
            DFUError::Disconnected => -9,
            DFUError::Timeout => -10,
            DFUError::Stall => -11,
            DFUError::DownloadFail => -12,
            DFUError::CantVerify => -13,
            DFUError::VerifyFail => -14,
        }
    }

    /// Map a DFU GETSTATUS status code onto an error, or None for OK.
    pub fn from_status(status: DFUStatus) -> Option<DFUError> {
        match status {
            DFUStatus::Ok => None,
            DFUStatus::ErrTarget | DFUStatus::ErrFile => Some(DFUError::Unsupported),
            DFUStatus::ErrNotDone | DFUStatus::ErrWrite | DFUStatus::ErrErase |
            DFUStatus::ErrCheckErased | DFUStatus::ErrProg | DFUStatus::ErrVerify
                => Some(DFUError::DownloadFail),
            DFUStatus::ErrAddress => Some(DFUError::InvalidAddress),
            DFUStatus::ErrFirmware | DFUStatus::ErrVendor | DFUStatus::ErrUsbr |
            DFUStatus::ErrPor | DFUStatus::ErrUnknown => Some(DFUError::Unknown),
            DFUStatus::ErrStalledPkt => Some(DFUError::Stall),
        }
    }
}

impl From<rusb::Error> for DFUError {
    fn from(error: rusb::Error) -> Self {
        match error {
            rusb::Error::Pipe => DFUError::Stall,
            rusb::Error::Timeout => DFUError::Timeout,
            rusb::Error::NoDevice => DFUError::Disconnected,
            e => DFUError::USBError(e),
        }
    }
}

/// Find the DFUError inside a failure::Error chain, if there is one.
pub fn dfu_error(error: &failure::Error) -> Option<&DFUError> {
    error.iter_chain().find_map(|cause| cause.downcast_ref::<DFUError>())
}

pub type Result<T> = std::result::Result<T, failure::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use failure::ResultExt;

    #[test]
    fn status_codes_map_to_errors() {
        assert!(DFUError::from_status(DFUStatus::Ok).is_none());
        assert_eq!(DFUError::from_status(DFUStatus::ErrFile).unwrap().code(), -5);
        assert_eq!(DFUError::from_status(DFUStatus::ErrVerify).unwrap().code(), -12);
        assert_eq!(DFUError::from_status(DFUStatus::ErrAddress).unwrap().code(), -7);
        assert_eq!(DFUError::from_status(DFUStatus::ErrPor).unwrap().code(), -4);
        assert_eq!(DFUError::from_status(DFUStatus::ErrStalledPkt).unwrap().code(), -11);
    }

    #[test]
    fn usb_errors_are_translated() {
        assert_eq!(DFUError::from(rusb::Error::Pipe).code(), -11);
        assert_eq!(DFUError::from(rusb::Error::Timeout).code(), -10);
        assert_eq!(DFUError::from(rusb::Error::NoDevice).code(), -9);
        assert_eq!(DFUError::from(rusb::Error::Io).code(), -4);
    }

    #[test]
    fn dfu_error_found_through_context() {
        let r: std::result::Result<(), DFUError> = Err(DFUError::VerifyFail);
        let e: failure::Error = r.context("Verifying block").unwrap_err().into();
        assert_eq!(dfu_error(&e).map(|e| e.code()), Some(-14));
    }
}
