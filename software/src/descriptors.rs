use crate::{ControlTransport, DFUError, Result};

pub const DFU_CLASS: u8 = 0xFE;
pub const DFU_SUBCLASS: u8 = 0x01;

const REQUEST_TYPE_GET_DESCRIPTOR: u8 = 0x80;
const GET_DESCRIPTOR: u8 = 6;

#[derive(Copy, Clone, Debug)]
#[repr(u8)]
enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    DFUFunctional = 0x21,
}

/// Whether a DFU interface belongs to a running application or the boot loader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DFUMode {
    Runtime,
    DFU,
}

impl std::fmt::Display for DFUMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DFUMode::Runtime => write!(f, "Runtime"),
            DFUMode::DFU => write!(f, "DFU"),
        }
    }
}

/// The fields of a standard device descriptor we care about.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH || data[1] != DescriptorType::Device as u8 {
            Err(DFUError::NotEnoughData { expected: Self::LENGTH, read: data.len() })?;
        }
        Ok(Self {
            vendor_id: u16::from_le_bytes([data[8], data[9]]),
            product_id: u16::from_le_bytes([data[10], data[11]]),
            device_version: u16::from_le_bytes([data[12], data[13]]),
            manufacturer_index: data[14],
            product_index: data[15],
            serial_index: data[16],
        })
    }
}

/// A DFU interface and the contents of its functional descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DFUInterface {
    pub number: u8,
    pub alternate: u8,
    pub protocol: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub detach_timeout: u16,
    pub transfer_size: u16,
    pub dfu_version: u16,
}

impl DFUInterface {
    pub const WILL_DETACH: u8       = 0x08;
    pub const MANIFEST_TOLERANT: u8 = 0x04;
    pub const CAN_UPLOAD: u8        = 0x02;
    pub const CAN_DOWNLOAD: u8      = 0x01;

    const PROTOCOL_RUNTIME: u8 = 0x01;

    pub fn mode(&self) -> DFUMode {
        if self.protocol == Self::PROTOCOL_RUNTIME {
            DFUMode::Runtime
        } else {
            DFUMode::DFU
        }
    }

    pub fn can_download(&self) -> bool {
        self.attributes & Self::CAN_DOWNLOAD != 0
    }

    pub fn can_upload(&self) -> bool {
        self.attributes & Self::CAN_UPLOAD != 0
    }

    pub fn manifest_tolerant(&self) -> bool {
        self.attributes & Self::MANIFEST_TOLERANT != 0
    }

    pub fn will_detach(&self) -> bool {
        self.attributes & Self::WILL_DETACH != 0
    }

    /// Walk a full configuration descriptor looking for a DFU interface.
    ///
    /// Returns None if the configuration has no DFU interface, or the
    /// interface is missing its functional descriptor.
    pub fn find(config: &[u8]) -> Option<Self> {
        let mut found: Option<Self> = None;
        let mut offset = 0;
        while offset + 2 <= config.len() {
            let length = config[offset] as usize;
            if length < 2 || offset + length > config.len() {
                break;
            }
            let desc = &config[offset..offset + length];
            match desc[1] {
                t if t == DescriptorType::Interface as u8 && length >= 9 => {
                    if found.is_some() {
                        // Any later interface ends the search; the first DFU
                        // interface had no functional descriptor.
                        return None;
                    }
                    if desc[5] == DFU_CLASS && desc[6] == DFU_SUBCLASS {
                        found = Some(Self {
                            number: desc[2],
                            alternate: desc[3],
                            protocol: desc[7],
                            string_index: desc[8],
                            attributes: 0,
                            detach_timeout: 0,
                            transfer_size: 0,
                            dfu_version: 0,
                        });
                    }
                }
                t if t == DescriptorType::DFUFunctional as u8 && length >= 7 => {
                    if let Some(mut iface) = found {
                        iface.attributes = desc[2];
                        iface.detach_timeout = u16::from_le_bytes([desc[3], desc[4]]);
                        iface.transfer_size = u16::from_le_bytes([desc[5], desc[6]]);
                        if length >= 9 {
                            iface.dfu_version = u16::from_le_bytes([desc[7], desc[8]]);
                        }
                        return Some(iface);
                    }
                }
                _ => (),
            }
            offset += length;
        }
        None
    }
}

/// Decode a string descriptor's UTF-16LE body.
pub fn decode_string(desc: &[u8]) -> Option<String> {
    if desc.len() < 2 || desc[1] != DescriptorType::String as u8 {
        return None;
    }
    // A string needs at least one UTF-16 unit after the two byte header.
    if desc[0] < 4 {
        return None;
    }
    let length = (desc[0] as usize).min(desc.len());
    let units: Vec<u16> = desc.get(2..length)?
                              .chunks_exact(2)
                              .map(|c| u16::from_le_bytes([c[0], c[1]]))
                              .collect();
    Some(String::from_utf16_lossy(&units))
}

fn get_descriptor<T: ControlTransport>(transport: &T, kind: DescriptorType, index: u8,
                                       language: u16, buf: &mut [u8]) -> Result<usize>
{
    let value = ((kind as u16) << 8) | index as u16;
    transport.control_in(REQUEST_TYPE_GET_DESCRIPTOR, GET_DESCRIPTOR, value, language, buf)
}

pub fn read_device_descriptor<T: ControlTransport>(transport: &T) -> Result<DeviceDescriptor> {
    let mut buf = [0u8; DeviceDescriptor::LENGTH];
    let n = get_descriptor(transport, DescriptorType::Device, 0, 0, &mut buf)?;
    DeviceDescriptor::parse(&buf[..n])
}

/// Read the complete first configuration descriptor, including all
/// interface, endpoint and class-specific descriptors.
pub fn read_config_descriptor<T: ControlTransport>(transport: &T) -> Result<Vec<u8>> {
    let mut header = [0u8; 9];
    let n = get_descriptor(transport, DescriptorType::Configuration, 0, 0, &mut header)?;
    if n < 4 {
        Err(DFUError::NotEnoughData { expected: 9, read: n })?;
    }
    let total = u16::from_le_bytes([header[2], header[3]]) as usize;
    let mut config = vec![0u8; total];
    let n = get_descriptor(transport, DescriptorType::Configuration, 0, 0, &mut config)?;
    config.truncate(n);
    Ok(config)
}

/// Read a string descriptor in the device's first language.
///
/// Index 0 means the device has no such string.
pub fn read_string<T: ControlTransport>(transport: &T, index: u8) -> Result<Option<String>> {
    if index == 0 {
        return Ok(None);
    }
    let mut buf = [0u8; 255];
    let n = get_descriptor(transport, DescriptorType::String, 0, 0, &mut buf)?;
    if n < 4 {
        return Ok(None);
    }
    let language = u16::from_le_bytes([buf[2], buf[3]]);
    let n = get_descriptor(transport, DescriptorType::String, index, language, &mut buf)?;
    Ok(decode_string(&buf[..n]))
}
