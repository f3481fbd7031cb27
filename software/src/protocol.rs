use std::convert::TryFrom;
use std::time::Duration;
use num_enum::TryFromPrimitive;
use crate::parts;

/// USB DFU 1.0 class requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DFURequest {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DFUState {
    AppIdle = 0,
    AppDetach = 1,
    Idle = 2,
    DnloadSync = 3,
    DnBusy = 4,
    DnloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    Error = 10,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DFUStatus {
    Ok = 0,
    ErrTarget = 1,
    ErrFile = 2,
    ErrWrite = 3,
    ErrErase = 4,
    ErrCheckErased = 5,
    ErrProg = 6,
    ErrVerify = 7,
    ErrAddress = 8,
    ErrNotDone = 9,
    ErrFirmware = 10,
    ErrVendor = 11,
    ErrUsbr = 12,
    ErrPor = 13,
    ErrUnknown = 14,
    ErrStalledPkt = 15,
}

pub const REQUEST_TYPE_OUT: u8 = 0x21;
pub const REQUEST_TYPE_IN: u8 = 0xA1;

/// Reply to DFU_GETSTATUS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: DFUStatus,
    pub poll_timeout_ms: u32,
    pub state: DFUState,
    pub string_index: u8,
}

impl StatusResponse {
    pub const LENGTH: usize = 6;

    /// Parse a GETSTATUS reply. Unknown status codes are reported as
    /// ErrUnknown and unknown states as Error.
    pub fn from_bytes(data: &[u8; Self::LENGTH]) -> Self {
        StatusResponse {
            status: DFUStatus::try_from(data[0]).unwrap_or(DFUStatus::ErrUnknown),
            poll_timeout_ms: data[1] as u32 | (data[2] as u32) << 8 | (data[3] as u32) << 16,
            state: DFUState::try_from(data[4]).unwrap_or(DFUState::Error),
            string_index: data[5],
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms as u64)
    }
}

pub const STELLARIS_QUERY_REQUEST: u8 = 0x42;
pub const STELLARIS_QUERY_VALUE: u16 = 0x23;
pub const STELLARIS_MARKER: u16 = 0x4C4D;
pub const STELLARIS_VERSION: u16 = 0x0001;

/// Commands of the Stellaris DFU extension, sent as the first bytes of a DNLOAD.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StellarisCommand {
    Prog = 1,
    Read = 2,
    Check = 3,
    Erase = 4,
    Info = 5,
    Bin = 6,
    Reset = 7,
}

pub type CommandHeader = [u8; 8];

/// Flash addresses in commands are expressed in 1 KB blocks.
pub const BLOCK_SIZE: u32 = 1024;

fn address_command(cmd: StellarisCommand, address: u32, length: u32) -> CommandHeader {
    let block = ((address / BLOCK_SIZE) as u16).to_le_bytes();
    let len = length.to_le_bytes();
    [cmd as u8, 0, block[0], block[1], len[0], len[1], len[2], len[3]]
}

/// Program `length` bytes at `address` with the data that follows.
pub fn prog(address: u32, length: u32) -> CommandHeader {
    address_command(StellarisCommand::Prog, address, length)
}

/// Set up the next UPLOAD to read `length` bytes from `address`.
pub fn read(address: u32, length: u32) -> CommandHeader {
    address_command(StellarisCommand::Read, address, length)
}

/// Check `length` bytes from `address` are erased.
pub fn check(address: u32, length: u32) -> CommandHeader {
    address_command(StellarisCommand::Check, address, length)
}

pub fn erase(start_block: u16, num_blocks: u16) -> CommandHeader {
    let start = start_block.to_le_bytes();
    let num = num_blocks.to_le_bytes();
    [StellarisCommand::Erase as u8, 0, start[0], start[1], num[0], num[1], 0, 0]
}

pub fn info() -> CommandHeader {
    [StellarisCommand::Info as u8, 0, 0, 0, 0, 0, 0, 0]
}

/// Select whether UPLOADs return raw flash (true) or a DFU-prefixed image.
pub fn bin(raw: bool) -> CommandHeader {
    [StellarisCommand::Bin as u8, raw as u8, 0, 0, 0, 0, 0, 0]
}

pub fn reset() -> CommandHeader {
    [StellarisCommand::Reset as u8, 0, 0, 0, 0, 0, 0, 0]
}

/// Reply to the INFO command.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub flash_block_size: u16,
    pub num_flash_blocks: u16,
    pub part_info: u32,
    pub class_info: u32,
    pub flash_top: u32,
    pub app_start_addr: u32,
}

impl DeviceInfo {
    pub const LENGTH: usize = 20;

    pub fn from_bytes(data: &[u8; Self::LENGTH]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i+1], data[i+2], data[i+3]]);
        DeviceInfo {
            flash_block_size: u16::from_le_bytes([data[0], data[1]]),
            num_flash_blocks: u16::from_le_bytes([data[2], data[3]]),
            part_info: u32_at(4),
            class_info: u32_at(8),
            flash_top: u32_at(12),
            app_start_addr: u32_at(16),
        }
    }

    /// Major and minor silicon revision.
    pub fn revision(&self) -> (u8, u8) {
        ((self.class_info >> 8) as u8, self.class_info as u8)
    }

    pub fn part_number(&self) -> Option<parts::Part> {
        parts::lookup_part((self.part_info >> 16) as u8)
    }

    pub fn first_block(&self) -> u16 {
        (self.app_start_addr / BLOCK_SIZE) as u16
    }

    pub fn last_block(&self) -> u16 {
        (self.flash_top / BLOCK_SIZE) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_poll_timeout_uses_all_three_bytes() {
        let s = StatusResponse::from_bytes(&[0, 0x10, 0x02, 0x01, 4, 0]);
        assert_eq!(s.status, DFUStatus::Ok);
        assert_eq!(s.state, DFUState::DnBusy);
        assert_eq!(s.poll_timeout_ms, 0x01_02_10);
        assert_eq!(s.poll_timeout(), Duration::from_millis(0x01_02_10));
    }

    #[test]
    fn status_response_unknown_values() {
        let s = StatusResponse::from_bytes(&[0x40, 0, 0, 0, 0x20, 3]);
        assert_eq!(s.status, DFUStatus::ErrUnknown);
        assert_eq!(s.state, DFUState::Error);
        assert_eq!(s.string_index, 3);
    }

    #[test]
    fn command_headers() {
        assert_eq!(prog(0x2000, 0x1234), [1, 0, 8, 0, 0x34, 0x12, 0, 0]);
        assert_eq!(read(0x0001_0000, 0x100), [2, 0, 0x40, 0, 0, 1, 0, 0]);
        assert_eq!(check(0x800, 4), [3, 0, 2, 0, 4, 0, 0, 0]);
        assert_eq!(erase(8, 0x102), [4, 0, 8, 0, 2, 1, 0, 0]);
        assert_eq!(info(), [5, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bin(true), [6, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bin(false), [6, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(reset(), [7, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn device_info_fields() {
        let mut d = [0u8; 20];
        d[0..2].copy_from_slice(&1024u16.to_le_bytes());
        d[2..4].copy_from_slice(&256u16.to_le_bytes());
        d[4..8].copy_from_slice(&0x1066_0000u32.to_le_bytes());
        d[8..12].copy_from_slice(&0x0003_0102u32.to_le_bytes());
        d[12..16].copy_from_slice(&0x0004_0000u32.to_le_bytes());
        d[16..20].copy_from_slice(&0x0000_1800u32.to_le_bytes());
        let info = DeviceInfo::from_bytes(&d);
        assert_eq!(info.flash_block_size, 1024);
        assert_eq!(info.num_flash_blocks, 256);
        assert_eq!(info.revision(), (1, 2));
        assert_eq!(info.part_number().map(|p| p.number), Some(0x9090));
        assert_eq!(info.first_block(), 6);
        assert_eq!(info.last_block(), 256);
    }
}
