use crate::{DFUError, Result};
use crate::protocol::BLOCK_SIZE;

pub const PREFIX_LENGTH: usize = 8;
pub const SUFFIX_LENGTH: usize = 16;

const DFU_VERSION: u16 = 0x0100;
const SIGNATURE: [u8; 3] = *b"UFD";

/// The CRC used by DFU file suffixes: reflected CRC-32 without the final inversion.
pub fn dfu_crc(data: &[u8]) -> u32 {
    !crc32fast::hash(data)
}

/// The 8-byte header Stellaris boot loaders expect in front of a payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StellarisPrefix {
    pub address: u32,
    pub length: u32,
}

impl StellarisPrefix {
    pub fn to_bytes(&self) -> [u8; PREFIX_LENGTH] {
        let block = ((self.address / BLOCK_SIZE) as u16).to_le_bytes();
        let len = self.length.to_le_bytes();
        [0x01, 0x00, block[0], block[1], len[0], len[1], len[2], len[3]]
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PREFIX_LENGTH || data[0] != 0x01 || data[1] != 0x00 {
            return None;
        }
        Some(Self {
            address: u16::from_le_bytes([data[2], data[3]]) as u32 * BLOCK_SIZE,
            length: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// The DFU file suffix, stored in the last bytes of a DFU image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DFUSuffix {
    pub device: u16,
    pub product: u16,
    pub vendor: u16,
    pub dfu_version: u16,
    pub length: u8,
    pub crc: u32,
}

impl DFUSuffix {
    pub fn new(vendor: u16, product: u16, device: u16) -> Self {
        Self { device, product, vendor, dfu_version: DFU_VERSION,
               length: SUFFIX_LENGTH as u8, crc: 0 }
    }

    /// Read the suffix fields from the end of `data`, without validating them.
    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < SUFFIX_LENGTH {
            return None;
        }
        let end = data.len();
        let u16_at = |i: usize| u16::from_le_bytes([data[end - i], data[end - i + 1]]);
        Some(Self {
            device: u16_at(16),
            product: u16_at(14),
            vendor: u16_at(12),
            dfu_version: u16_at(10),
            length: data[end - 5],
            crc: u32::from_le_bytes([data[end-4], data[end-3], data[end-2], data[end-1]]),
        })
    }

    /// The first twelve suffix bytes; the CRC is appended separately
    /// since it covers everything before it.
    fn header_bytes(&self) -> [u8; SUFFIX_LENGTH - 4] {
        let d = self.device.to_le_bytes();
        let p = self.product.to_le_bytes();
        let v = self.vendor.to_le_bytes();
        let f = self.dfu_version.to_le_bytes();
        [d[0], d[1], p[0], p[1], v[0], v[1], f[0], f[1],
         SIGNATURE[0], SIGNATURE[1], SIGNATURE[2], self.length]
    }

    /// Append this suffix to `image`, computing the CRC over the whole file.
    pub fn append_to(&self, image: &mut Vec<u8>) {
        image.extend_from_slice(&self.header_bytes());
        let crc = dfu_crc(image);
        image.extend_from_slice(&crc.to_le_bytes());
    }
}

/// A DFU image whose suffix has been validated.
#[derive(Clone, Debug)]
pub struct DFUImage<'a> {
    data: &'a [u8],
    suffix: DFUSuffix,
    stellaris: bool,
}

impl<'a> DFUImage<'a> {
    /// Validate the DFU suffix on `data` and check for a Stellaris prefix.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let suffix = match DFUSuffix::read(data) {
            Some(suffix) => suffix,
            None => Err(DFUError::InvalidFormat)?,
        };
        let suffix_len = suffix.length as usize;
        if data.len() < suffix_len || suffix_len < SUFFIX_LENGTH {
            tracing::trace!("Suffix length {} invalid for {} byte image", suffix_len, data.len());
            Err(DFUError::InvalidFormat)?;
        }
        if dfu_crc(&data[..data.len() - 4]) != suffix.crc {
            tracing::trace!("Image CRC mismatch");
            Err(DFUError::InvalidFormat)?;
        }
        if data[data.len() - 8..data.len() - 5] != SIGNATURE {
            tracing::trace!("Image has no DFU signature");
            Err(DFUError::InvalidFormat)?;
        }
        let stellaris = data.len() >= suffix_len + PREFIX_LENGTH &&
            StellarisPrefix::parse(data).map_or(false, |prefix| {
                prefix.length as usize == data.len() - (suffix_len + PREFIX_LENGTH)
            });
        Ok(Self { data, suffix, stellaris })
    }

    pub fn suffix(&self) -> &DFUSuffix {
        &self.suffix
    }

    /// Whether the image carries a Stellaris prefix.
    pub fn is_stellaris(&self) -> bool {
        self.stellaris
    }

    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.suffix.vendor == vid && self.suffix.product == pid
    }

    /// The image with its DFU suffix removed.
    pub fn without_suffix(&self) -> &'a [u8] {
        &self.data[..self.data.len() - self.suffix.length as usize]
    }

    /// The bytes destined for flash, with prefix and suffix removed.
    pub fn payload(&self) -> &'a [u8] {
        let body = self.without_suffix();
        if self.stellaris { &body[PREFIX_LENGTH..] } else { body }
    }

    pub fn start_address(&self) -> Option<u32> {
        if self.stellaris {
            StellarisPrefix::parse(self.data).map(|p| p.address)
        } else {
            None
        }
    }
}

/// Wrap a binary in a Stellaris prefix and DFU suffix.
pub fn wrap(binary: &[u8], address: u32, vendor: u16, product: u16, device: u16) -> Vec<u8> {
    let prefix = StellarisPrefix { address, length: binary.len() as u32 };
    let mut image = Vec::with_capacity(binary.len() + PREFIX_LENGTH + SUFFIX_LENGTH);
    image.extend_from_slice(&prefix.to_bytes());
    image.extend_from_slice(binary);
    DFUSuffix::new(vendor, product, device).append_to(&mut image);
    image
}

/// Check for a Stellaris prefix whose length covers the rest of the file,
/// either with or without a suffix following the payload.
pub fn prefix_valid(data: &[u8]) -> bool {
    match StellarisPrefix::parse(data) {
        Some(prefix) => {
            let len = prefix.length as usize;
            len == data.len() - PREFIX_LENGTH ||
                (data.len() >= PREFIX_LENGTH + SUFFIX_LENGTH &&
                 len == data.len() - (PREFIX_LENGTH + SUFFIX_LENGTH))
        },
        None => false,
    }
}

/// Check for a well-formed DFU suffix with a matching CRC.
pub fn suffix_valid(data: &[u8]) -> bool {
    match DFUSuffix::read(data) {
        Some(suffix) => {
            suffix.length as usize >= SUFFIX_LENGTH &&
            data.len() >= suffix.length as usize &&
            data[data.len() - 8..data.len() - 5] == SIGNATURE &&
            dfu_crc(&data[..data.len() - 4]) == suffix.crc
        },
        None => false,
    }
}

/// Extract the binary payload from a Stellaris-wrapped image.
pub fn unwrap(data: &[u8]) -> Option<&[u8]> {
    if !prefix_valid(data) {
        return None;
    }
    let prefix = StellarisPrefix::parse(data)?;
    Some(&data[PREFIX_LENGTH..PREFIX_LENGTH + prefix.length as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{STELLARIS_VID, DFU_BOOTLOADER_PID, dfu_error};

    fn binary() -> Vec<u8> {
        (0..200u32).map(|x| (x * 7) as u8).collect()
    }

    #[test]
    fn crc_matches_reference_value() {
        // CRC-32 of "123456789" is 0xCBF43926; DFU leaves off the final inversion.
        assert_eq!(dfu_crc(b"123456789"), !0xCBF4_3926);
    }

    #[test]
    fn wrapped_image_layout() {
        let image = wrap(&binary(), 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        assert_eq!(image.len(), 200 + 24);
        assert_eq!(&image[..8], &[1, 0, 6, 0, 200, 0, 0, 0]);
        let n = image.len();
        assert_eq!(&image[n-16..n-4],
                   &[0, 0, 0xFF, 0, 0xBE, 0x1C, 0x00, 0x01, b'U', b'F', b'D', 16]);
        // Running the CRC over the stored CRC leaves a zero residue.
        assert_eq!(dfu_crc(&image), 0);
    }

    #[test]
    fn parse_wrapped_image() {
        let bin = binary();
        let image = wrap(&bin, 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0x0200);
        let dfu = DFUImage::parse(&image).unwrap();
        assert!(dfu.is_stellaris());
        assert!(dfu.matches(STELLARIS_VID, DFU_BOOTLOADER_PID));
        assert!(!dfu.matches(STELLARIS_VID, 0x0003));
        assert_eq!(dfu.suffix().device, 0x0200);
        assert_eq!(dfu.start_address(), Some(0x1800));
        assert_eq!(dfu.payload(), &bin[..]);
        assert_eq!(dfu.without_suffix().len(), bin.len() + PREFIX_LENGTH);
    }

    #[test]
    fn suffix_only_image_is_not_stellaris() {
        let mut image = binary();
        DFUSuffix::new(STELLARIS_VID, DFU_BOOTLOADER_PID, 0).append_to(&mut image);
        let dfu = DFUImage::parse(&image).unwrap();
        assert!(!dfu.is_stellaris());
        assert_eq!(dfu.start_address(), None);
        assert_eq!(dfu.payload(), &binary()[..]);
    }

    #[test]
    fn corrupted_image_is_invalid_format() {
        let mut image = wrap(&binary(), 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        image[20] ^= 0xFF;
        let e = DFUImage::parse(&image).unwrap_err();
        assert_eq!(dfu_error(&e).map(|e| e.code()), Some(-6));
        assert!(!suffix_valid(&image));
        assert!(prefix_valid(&image));
    }

    #[test]
    fn short_or_unsigned_data_is_invalid() {
        assert!(DFUImage::parse(&[0u8; 10]).is_err());
        assert!(DFUImage::parse(&binary()).is_err());
        assert!(!suffix_valid(&binary()));
    }

    #[test]
    fn prefix_needs_zero_second_byte() {
        let bin = binary();
        let wrapped = wrap(&bin, 0x1800, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        let mut image = wrapped[..wrapped.len() - SUFFIX_LENGTH].to_vec();
        image[1] = 0x01;
        DFUSuffix::new(STELLARIS_VID, DFU_BOOTLOADER_PID, 0).append_to(&mut image);
        let dfu = DFUImage::parse(&image).unwrap();
        assert!(!dfu.is_stellaris());
        assert_eq!(dfu.start_address(), None);
        assert_eq!(dfu.payload().len(), PREFIX_LENGTH + bin.len());
        assert!(!prefix_valid(&image));
    }

    #[test]
    fn unwrap_recovers_binary() {
        let bin = binary();
        let image = wrap(&bin, 0x4000, STELLARIS_VID, DFU_BOOTLOADER_PID, 0);
        assert_eq!(unwrap(&image), Some(&bin[..]));
        // A prefix without a suffix is also accepted.
        let bare = &image[..image.len() - SUFFIX_LENGTH];
        assert_eq!(unwrap(bare), Some(&bin[..]));
        assert_eq!(unwrap(&bin), None);
    }
}
