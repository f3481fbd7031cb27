use std::thread;
use failure::ResultExt;
use crate::{ControlTransport, UsbTransport, DFUError, Result};
use crate::descriptors::{self, DeviceDescriptor, DFUInterface, DFUMode};
use crate::protocol::{self, DFURequest, DFUState, StatusResponse, DeviceInfo,
                      REQUEST_TYPE_IN, REQUEST_TYPE_OUT, BLOCK_SIZE};
use crate::image::{DFUImage, DFUSuffix, PREFIX_LENGTH, SUFFIX_LENGTH};
use crate::parts;

/// The kinds of long-running transfer reported through `Progress`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Download,
    Upload,
    Verify,
}

/// Receives progress notifications during block transfers.
///
/// `start` gives the total number of USB transfers the operation will
/// make, `advance` the number completed so far.
pub trait Progress {
    fn start(&mut self, _operation: Operation, _transfers: usize) {}
    fn advance(&mut self, _transfers: usize) {}
    fn finish(&mut self, _success: bool) {}
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl Progress for NoProgress {}

/// Everything we know about an opened device, for display.
#[derive(Clone, Debug)]
pub struct DeviceSummary {
    pub vid: u16,
    pub pid: u16,
    pub device_version: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub interface_name: Option<String>,
    pub interface: DFUInterface,
    pub stellaris: Option<DeviceInfo>,
}

impl DeviceSummary {
    pub fn mode(&self) -> DFUMode {
        self.interface.mode()
    }

    /// Part name and revision string, when the device reported them.
    pub fn target(&self) -> Option<(String, String)> {
        let info = self.stellaris?;
        let name = match info.part_number() {
            Some(part) => part.name.to_string(),
            None => "Unknown".to_string(),
        };
        let (major, minor) = info.revision();
        Some((name, parts::revision_string(major, minor)))
    }
}

/// A USB DFU device, optionally speaking the Stellaris DFU extensions.
pub struct DFUDevice<T: ControlTransport> {
    transport: T,
    descriptor: DeviceDescriptor,
    interface: DFUInterface,
    block: u16,
    stellaris: Option<DeviceInfo>,
}

impl DFUDevice<UsbTransport> {
    /// Open every connected device that exposes a DFU interface.
    pub fn enumerate(context: &rusb::Context) -> Result<Vec<Self>> {
        let mut devices = Vec::new();
        for transport in UsbTransport::dfu_devices(context)? {
            let (bus, address) = transport.bus_address();
            match Self::from_transport(transport) {
                Ok(device) => devices.push(device),
                Err(e) => tracing::debug!("Ignoring device {:03}.{:03}: {}", bus, address, e),
            }
        }
        Ok(devices)
    }

    /// Open the `index`th DFU device found on the bus.
    pub fn open(context: &rusb::Context, index: usize) -> Result<Self> {
        match Self::enumerate(context)?.into_iter().nth(index) {
            Some(device) => Ok(device),
            None => Err(DFUError::NotFound)?,
        }
    }
}

impl<T: ControlTransport> DFUDevice<T> {
    /// Identify the DFU interface on `transport` and, if the device is in DFU
    /// mode, bring it to IDLE and read its Stellaris parameters.
    pub fn from_transport(mut transport: T) -> Result<Self> {
        let descriptor = descriptors::read_device_descriptor(&transport)
                            .context("Error reading device descriptor")?;
        let config = descriptors::read_config_descriptor(&transport)
                            .context("Error reading configuration descriptor")?;
        let interface = match DFUInterface::find(&config) {
            Some(interface) => interface,
            None => Err(DFUError::NotFound).context("Device has no DFU interface")?,
        };
        transport.claim_interface(interface.number)?;
        tracing::trace!("DFU interface {} on {:04X}:{:04X}, mode {}, transfer size {}",
                        interface.number, descriptor.vendor_id, descriptor.product_id,
                        interface.mode(), interface.transfer_size);

        let mut device = DFUDevice { transport, descriptor, interface, block: 0, stellaris: None };
        if interface.mode() == DFUMode::DFU {
            if let Err(e) = device.make_idle() {
                tracing::debug!("Could not make device idle: {}", e);
            }
            if device.query_stellaris() {
                let info = match device.read_info() {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::debug!("Error reading device info: {}", e);
                        DeviceInfo::default()
                    },
                };
                device.stellaris = Some(info);
            }
        }
        Ok(device)
    }

    pub fn interface(&self) -> &DFUInterface {
        &self.interface
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn mode(&self) -> DFUMode {
        self.interface.mode()
    }

    /// Stellaris parameters read when the device was opened, if supported.
    pub fn stellaris_info(&self) -> Option<&DeviceInfo> {
        self.stellaris.as_ref()
    }

    /// Gather identification strings and parameters for display.
    /// Strings the device fails to return are left as None.
    pub fn summary(&self) -> DeviceSummary {
        let string = |index: u8| descriptors::read_string(&self.transport, index)
                                    .unwrap_or_else(|e| {
                                        tracing::debug!("Error reading string {}: {}", index, e);
                                        None
                                    });
        DeviceSummary {
            vid: self.descriptor.vendor_id,
            pid: self.descriptor.product_id,
            device_version: self.descriptor.device_version,
            manufacturer: string(self.descriptor.manufacturer_index),
            product: string(self.descriptor.product_index),
            serial: string(self.descriptor.serial_index),
            interface_name: string(self.interface.string_index),
            interface: self.interface,
            stellaris: self.stellaris,
        }
    }

    /// Re-read the flash parameters from the device.
    pub fn params(&mut self) -> Result<DeviceInfo> {
        if self.stellaris.is_none() {
            Err(DFUError::Unsupported)?;
        }
        let info = self.read_info()?;
        self.stellaris = Some(info);
        Ok(info)
    }

    fn stellaris(&self) -> Result<DeviceInfo> {
        match self.stellaris {
            Some(info) => Ok(info),
            None => {
                tracing::trace!("Device does not support Stellaris protocol");
                Err(DFUError::Unsupported)?
            },
        }
    }

    /// The transfer size to use for DNLOAD and UPLOAD. Devices which
    /// do not report one get the Stellaris boot loader's 1 KB.
    fn transfer_size(&self) -> usize {
        match self.interface.transfer_size {
            0 => BLOCK_SIZE as usize,
            n => n as usize,
        }
    }

    fn index(&self) -> u16 {
        self.interface.number as u16
    }

    fn next_block(&mut self) -> u16 {
        let block = self.block;
        self.block = self.block.wrapping_add(1);
        block
    }

    fn request_out(&self, request: DFURequest, value: u16, data: &[u8]) -> Result<usize> {
        self.transport.control_out(REQUEST_TYPE_OUT, request as u8, value, self.index(), data)
    }

    fn query_stellaris(&self) -> bool {
        let mut buf = [0u8; 4];
        let n = match self.transport.control_in(REQUEST_TYPE_IN, protocol::STELLARIS_QUERY_REQUEST,
                                                protocol::STELLARIS_QUERY_VALUE, self.index(),
                                                &mut buf)
        {
            Ok(n) => n,
            Err(e) => {
                tracing::trace!("Stellaris protocol query failed: {}", e);
                return false;
            },
        };
        let marker = u16::from_le_bytes([buf[0], buf[1]]);
        let version = u16::from_le_bytes([buf[2], buf[3]]);
        n == buf.len() && marker == protocol::STELLARIS_MARKER &&
            version == protocol::STELLARIS_VERSION
    }

    fn read_info(&mut self) -> Result<DeviceInfo> {
        self.download_transfer(&protocol::info(), true)?;
        let mut buf = [0u8; DeviceInfo::LENGTH];
        self.upload_transfer(&mut buf)?;
        Ok(DeviceInfo::from_bytes(&buf))
    }

    /// Issue DFU_GETSTATUS.
    pub fn status(&self) -> Result<StatusResponse> {
        let mut buf = [0u8; StatusResponse::LENGTH];
        let n = self.transport.control_in(REQUEST_TYPE_IN, DFURequest::GetStatus as u8, 0,
                                          self.index(), &mut buf)?;
        if n != buf.len() {
            tracing::trace!("GETSTATUS returned {} bytes, expected {}", n, buf.len());
            Err(DFUError::Unknown)?;
        }
        Ok(StatusResponse::from_bytes(&buf))
    }

    fn abort(&self) -> Result<()> {
        self.request_out(DFURequest::Abort, 0, &[])?;
        Ok(())
    }

    fn clear_status(&self) -> Result<()> {
        self.request_out(DFURequest::ClrStatus, 0, &[])?;
        Ok(())
    }

    /// Bring the device back to the IDLE state from wherever it is.
    pub fn make_idle(&self) -> Result<()> {
        let status = self.status()?;
        tracing::trace!("Making idle from state {:?}", status.state);
        match status.state {
            DFUState::Idle => Ok(()),
            DFUState::Error => self.clear_status(),
            DFUState::Manifest | DFUState::ManifestSync => {
                if !self.interface.manifest_tolerant() {
                    Err(DFUError::Unsupported)?;
                }
                thread::sleep(status.poll_timeout());
                self.abort()
            },
            DFUState::DnBusy => {
                thread::sleep(status.poll_timeout());
                self.abort()
            },
            DFUState::DnloadSync | DFUState::DnloadIdle | DFUState::UploadIdle => self.abort(),
            DFUState::ManifestWaitReset | DFUState::AppIdle | DFUState::AppDetach =>
                Err(DFUError::Unsupported)?,
        }
    }

    /// Send one DNLOAD. If `check` is set, poll GETSTATUS until the device
    /// leaves DNLOAD-SYNC/DNBUSY and return the resulting status as an error.
    pub fn download_transfer(&mut self, data: &[u8], check: bool) -> Result<()> {
        if data.len() > self.transfer_size() {
            Err(DFUError::InvalidSize)?;
        }
        let block = self.next_block();
        let n = self.request_out(DFURequest::Dnload, block, data)?;
        if n != data.len() {
            tracing::trace!("DNLOAD sent {} bytes, expected {}", n, data.len());
            Err(DFUError::Unknown)?;
        }
        if !check {
            return Ok(());
        }
        loop {
            let status = self.status()?;
            match status.state {
                DFUState::DnloadSync | DFUState::DnBusy => thread::sleep(status.poll_timeout()),
                state => {
                    tracing::trace!("Download status {:?} state {:?}", status.status, state);
                    return match DFUError::from_status(status.status) {
                        Some(e) => Err(e)?,
                        None => Ok(()),
                    };
                },
            }
        }
    }

    /// Download `data` in transfer-sized chunks followed by the zero-length
    /// DNLOAD which ends the transfer.
    pub fn download_block(&mut self, data: &[u8], progress: &mut dyn Progress) -> Result<()> {
        let size = self.transfer_size();
        progress.start(Operation::Download, (data.len() + size - 1) / size + 1);
        let mut result = Ok(());
        let mut transfers = 0;
        for chunk in data.chunks(size) {
            result = self.download_transfer(chunk, true);
            if result.is_err() {
                break;
            }
            transfers += 1;
            progress.advance(transfers);
        }
        if result.is_ok() {
            result = self.download_transfer(&[], true);
            transfers += 1;
            progress.advance(transfers);
        }
        progress.finish(result.is_ok());
        result
    }

    /// Read one UPLOAD transfer, which must fill `buf` exactly.
    pub fn upload_transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() > self.transfer_size() {
            Err(DFUError::InvalidSize)?;
        }
        let block = self.next_block();
        let n = self.transport.control_in(REQUEST_TYPE_IN, DFURequest::Upload as u8, block,
                                          self.index(), buf)?;
        if n != buf.len() {
            Err(DFUError::NotEnoughData { expected: buf.len(), read: n })
                .context("Short UPLOAD")?;
        }
        Ok(())
    }

    fn upload_block(&mut self, buf: &mut [u8], operation: Operation,
                    progress: &mut dyn Progress) -> Result<()>
    {
        let size = self.transfer_size();
        progress.start(operation, (buf.len() + size - 1) / size + 1);
        let mut result = Ok(());
        for (i, chunk) in buf.chunks_mut(size).enumerate() {
            result = self.upload_transfer(chunk);
            if result.is_err() {
                break;
            }
            progress.advance(i + 1);
        }
        progress.finish(result.is_ok());
        result
    }

    /// Upload `expected.len()` bytes and compare them against `expected`.
    pub fn verify_block(&mut self, expected: &[u8], progress: &mut dyn Progress) -> Result<()> {
        let mut readback = vec![0u8; expected.len()];
        self.upload_block(&mut readback, Operation::Verify, progress)?;
        match readback.iter().zip(expected).position(|(a, b)| a != b) {
            Some(offset) => {
                tracing::debug!("Verify failed at offset {}: read {:02X}, expected {:02X}",
                                offset, readback[offset], expected[offset]);
                Err(DFUError::VerifyFail)?
            },
            None => Ok(()),
        }
    }

    fn check_idle_for_verify(&self) -> Result<()> {
        let status = self.status()?;
        if status.state != DFUState::Idle {
            tracing::trace!("Can't verify download, device is {:?}", status.state);
            Err(DFUError::CantVerify)?;
        }
        Ok(())
    }

    /// Check `data` is a DFU image and whether its IDs match this device.
    ///
    /// Returns InvalidFormat for images without a valid suffix; the caller
    /// decides what to do about mismatched IDs.
    pub fn check_image<'a>(&self, data: &'a [u8]) -> Result<(DFUImage<'a>, bool)> {
        let image = DFUImage::parse(data)?;
        let matches = image.matches(self.descriptor.vendor_id, self.descriptor.product_id);
        Ok((image, matches))
    }

    /// Download a complete DFU image. The prefix, if any, is sent to the
    /// device along with the payload; only the suffix is stripped.
    pub fn download(&mut self, data: &[u8], verify: bool, ignore_ids: bool,
                    progress: &mut dyn Progress) -> Result<()>
    {
        if !self.interface.can_download() {
            Err(DFUError::Unsupported).context("Device does not support download")?;
        }
        self.make_idle()?;
        let (image, matches) = self.check_image(data)?;
        if !matches && !ignore_ids {
            Err(DFUError::Unsupported).context("Image IDs do not match device")?;
        }
        let body = image.without_suffix();
        self.download_block(body, progress)?;
        if verify {
            self.check_idle_for_verify()?;
            self.verify_block(body, progress)?;
        }
        Ok(())
    }

    /// Program a raw binary at `address`.
    pub fn download_bin(&mut self, data: &[u8], address: u32, verify: bool,
                        progress: &mut dyn Progress) -> Result<()>
    {
        let info = self.stellaris()?;
        let top = info.last_block() as u64 * BLOCK_SIZE as u64;
        if address as u64 + data.len() as u64 > top {
            tracing::trace!("Image is located outside writeable area of flash");
            Err(DFUError::InvalidAddress)?;
        }
        self.make_idle()?;
        self.download_transfer(&protocol::prog(address, data.len() as u32), true)
            .context("Error sending PROG command")?;
        self.download_block(data, progress)?;
        if verify {
            self.check_idle_for_verify()?;
            self.download_transfer(&protocol::bin(true), true)?;
            let result = self.download_transfer(&protocol::read(address, data.len() as u32), true)
                             .and_then(|_| self.verify_block(data, progress));
            if let Err(e) = self.download_transfer(&protocol::bin(false), true) {
                tracing::debug!("Error restoring DFU upload format: {}", e);
            }
            result?;
        }
        Ok(())
    }

    /// Erase `length` bytes of flash from `address`, or the whole writable
    /// region if `address` is zero. Optionally check the region is blank.
    pub fn erase(&mut self, address: u32, length: u32, verify: bool) -> Result<()> {
        let info = self.stellaris()?;
        let (address, length) = if address == 0 {
            let first = info.first_block() as u32;
            let last = info.last_block() as u32;
            (first * BLOCK_SIZE, last.saturating_sub(first) * BLOCK_SIZE)
        } else {
            if address % BLOCK_SIZE != 0 {
                Err(DFUError::InvalidAddress)?;
            }
            if length == 0 || length % BLOCK_SIZE != 0 {
                Err(DFUError::InvalidSize)?;
            }
            (address, length)
        };
        tracing::debug!("Erasing {} blocks from {:08X}", length / BLOCK_SIZE, address);
        self.make_idle()?;
        self.download_transfer(&protocol::erase((address / BLOCK_SIZE) as u16,
                                                (length / BLOCK_SIZE) as u16), true)?;
        if verify {
            self.download_transfer(&protocol::check(address, length), true)?;
        }
        Ok(())
    }

    /// Ask the device whether a region is erased. An address of zero checks
    /// the whole writable region.
    pub fn blank_check(&mut self, address: u32, length: u32) -> Result<()> {
        let info = self.stellaris()?;
        let (address, length) = if address == 0 {
            let first = info.first_block() as u32;
            let last = info.last_block() as u32;
            (first * BLOCK_SIZE, last.saturating_sub(first) * BLOCK_SIZE)
        } else {
            if address % BLOCK_SIZE != 0 {
                Err(DFUError::InvalidAddress)?;
            }
            if length == 0 || length % 4 != 0 {
                Err(DFUError::InvalidSize)?;
            }
            (address, length)
        };
        self.make_idle()?;
        self.download_transfer(&protocol::check(address, length), true)
    }

    /// Read `length` bytes back from the device starting at `address`.
    ///
    /// With `raw` the flash contents are returned as-is. Otherwise `length`
    /// includes the 8-byte prefix the device prepends and the 16-byte suffix
    /// added here, so the result is a complete DFU image.
    pub fn upload(&mut self, address: u32, length: u32, raw: bool,
                  progress: &mut dyn Progress) -> Result<Vec<u8>>
    {
        self.stellaris()?;
        if address % BLOCK_SIZE != 0 {
            Err(DFUError::InvalidAddress)?;
        }
        let wrapping = (PREFIX_LENGTH + SUFFIX_LENGTH) as u32;
        if !raw && length <= wrapping {
            Err(DFUError::InvalidSize)?;
        }
        self.make_idle()?;
        let flash_length = if raw { length } else { length - wrapping };
        self.download_transfer(&protocol::read(address, flash_length), true)?;
        self.download_transfer(&protocol::bin(raw), true)?;

        let upload_length = (if raw { length } else { length - SUFFIX_LENGTH as u32 }) as usize;
        let mut data = vec![0u8; upload_length];
        let result = self.upload_block(&mut data, Operation::Upload, progress);
        if let Err(e) = self.download_transfer(&protocol::bin(false), true) {
            tracing::debug!("Error restoring DFU upload format: {}", e);
        }
        result?;

        if !raw {
            DFUSuffix::new(self.descriptor.vendor_id, self.descriptor.product_id,
                           self.descriptor.device_version).append_to(&mut data);
        }
        Ok(data)
    }

    /// Ask a runtime-mode device to detach into DFU mode. The device
    /// disconnects, so any result is ignored and the handle is consumed.
    pub fn mode_switch(self) {
        if let Err(e) = self.request_out(DFURequest::Detach, 0, &[]) {
            tracing::debug!("DETACH returned {}", e);
        }
    }

    /// Close the device, first resetting it into the application if asked
    /// and the device supports the Stellaris RESET command.
    pub fn close(mut self, reset: bool) -> Result<()> {
        if reset {
            self.stellaris()?;
            self.make_idle()?;
            self.download_transfer(&protocol::reset(), true)?;
        }
        Ok(())
    }
}
