use std::time::Duration;
use failure::ResultExt;
use rusb::UsbContext;
use crate::{DFUError, Result};

/// Control transfer access to a USB device.
///
/// DFU and the Stellaris extension protocol run entirely over endpoint 0,
/// so this is all the device layer needs.
pub trait ControlTransport {
    fn control_in(&self, request_type: u8, request: u8, value: u16, index: u16,
                  buf: &mut [u8]) -> Result<usize>;
    fn control_out(&self, request_type: u8, request: u8, value: u16, index: u16,
                   data: &[u8]) -> Result<usize>;

    /// Claim an interface before issuing class requests to it.
    fn claim_interface(&mut self, _interface: u8) -> Result<()> {
        Ok(())
    }
}

/// A pair of bulk endpoints on an opened device.
pub trait BulkTransport {
    /// Send `data` on the OUT endpoint, returning the number of bytes written.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Read one transfer from the IN endpoint into `buf`.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// A libusb device handle used as a control transport.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    bus: u8,
    address: u8,
}

impl UsbTransport {
    const TIMEOUT: Duration = Duration::from_millis(8000);

    pub fn open(device: &rusb::Device<rusb::Context>) -> Result<Self> {
        let handle = device.open().context("Error opening device")?;
        Ok(Self { handle, bus: device.bus_number(), address: device.address() })
    }

    /// Open every device exposing a DFU interface, in bus order.
    pub fn dfu_devices(context: &rusb::Context) -> Result<Vec<Self>> {
        let mut transports = Vec::new();
        for device in context.devices().context("Error getting devices")?.iter() {
            if !Self::has_dfu_interface(&device) {
                continue;
            }
            match Self::open(&device) {
                Ok(transport) => transports.push(transport),
                Err(e) => tracing::trace!("Skipping {:03}.{:03}: {}",
                                          device.bus_number(), device.address(), e),
            }
        }
        Ok(transports)
    }

    fn has_dfu_interface(device: &rusb::Device<rusb::Context>) -> bool {
        let config = match device.config_descriptor(0) {
            Ok(config) => config,
            Err(_) => return false,
        };
        let found = config.interfaces().any(|interface| interface.descriptors().any(|desc| {
            desc.class_code() == crate::descriptors::DFU_CLASS &&
            desc.sub_class_code() == crate::descriptors::DFU_SUBCLASS
        }));
        found
    }

    /// Open the first device with the given VID and PID.
    pub fn find(context: &rusb::Context, vid: u16, pid: u16) -> Result<Self> {
        for device in context.devices().context("Error getting devices")?.iter() {
            let dd = device.device_descriptor().context("Error reading descriptor")?;
            if dd.vendor_id() == vid && dd.product_id() == pid {
                return Self::open(&device);
            }
        }
        Err(DFUError::NotFound)?
    }

    pub fn bus_address(&self) -> (u8, u8) {
        (self.bus, self.address)
    }

    pub fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        match self.handle.write_bulk(endpoint, data, timeout) {
            Ok(n) => Ok(n),
            Err(e) => Err(DFUError::from(e)).context("Error writing bulk data")?,
        }
    }

    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.handle.read_bulk(endpoint, buf, timeout) {
            Ok(n) => Ok(n),
            Err(e) => Err(DFUError::from(e)).context("Error reading bulk data")?,
        }
    }
}

impl ControlTransport for UsbTransport {
    fn control_in(&self, request_type: u8, request: u8, value: u16, index: u16,
                  buf: &mut [u8]) -> Result<usize>
    {
        match self.handle.read_control(request_type, request, value, index, buf, Self::TIMEOUT) {
            Ok(n) => Ok(n),
            Err(e) => Err(DFUError::from(e))
                        .context(format!("Error reading request {:02X} {:04X}", request, value))?,
        }
    }

    fn control_out(&self, request_type: u8, request: u8, value: u16, index: u16,
                   data: &[u8]) -> Result<usize>
    {
        match self.handle.write_control(request_type, request, value, index, data, Self::TIMEOUT) {
            Ok(n) => Ok(n),
            Err(e) => Err(DFUError::from(e))
                        .context(format!("Error sending request {:02X} {:04X}", request, value))?,
        }
    }

    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        self.handle.claim_interface(interface).context("Error claiming interface")?;
        Ok(())
    }
}

/// A device interface with one bulk OUT and one bulk IN endpoint.
pub struct BulkPipe {
    transport: UsbTransport,
    interface: u8,
    out_endpoint: u8,
    in_endpoint: u8,
}

impl BulkPipe {
    const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Open the first device matching `vid` and `pid` and claim `interface`.
    pub fn open(context: &rusb::Context, vid: u16, pid: u16, interface: u8,
                out_endpoint: u8, in_endpoint: u8) -> Result<Self>
    {
        let mut transport = UsbTransport::find(context, vid, pid)?;
        transport.claim_interface(interface)?;
        let (bus, address) = transport.bus_address();
        tracing::debug!("Opened {:04x}:{:04x} at {:03}.{:03}, endpoints {:02x}/{:02x}",
                        vid, pid, bus, address, out_endpoint, in_endpoint);
        Ok(Self { transport, interface, out_endpoint, in_endpoint })
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }
}

impl BulkTransport for BulkPipe {
    fn write(&self, data: &[u8]) -> Result<usize> {
        self.transport.write_bulk(self.out_endpoint, data, Self::WRITE_TIMEOUT)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.transport.read_bulk(self.in_endpoint, buf, timeout)
    }
}
