//! Client for the Stellaris USB oscilloscope.
//!
//! Every packet in either direction starts with a 12 byte header, optionally
//! followed by a payload sent as a separate bulk transfer. Commands go out on
//! the bulk OUT endpoint; responses, notifications and waveform data arrive
//! on the bulk IN endpoint.

use std::convert::TryFrom;
use std::sync::{Arc, Mutex, mpsc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use failure::ResultExt;
use failure_derive::Fail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::{BulkTransport, DFUError, Result, dfu_error};

pub const SCOPE_VID: u16 = 0x1CBE;
pub const SCOPE_PID: u16 = 0x0004;
pub const SCOPE_INTERFACE: u8 = 0;
pub const SCOPE_OUT_ENDPOINT: u8 = 0x01;
pub const SCOPE_IN_ENDPOINT: u8 = 0x81;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LENGTH: usize = 12;
pub const SETTINGS_LENGTH: usize = 24;
pub const DATA_START_LENGTH: usize = 18;
pub const ELEMENT_LENGTH: usize = 6;
pub const DUAL_ELEMENT_LENGTH: usize = 8;

const CONNECT_RETRY: Duration = Duration::from_millis(2000);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const PAYLOAD_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Fail, Debug)]
pub enum ScopeError {
    #[fail(display="Not communicating with the oscilloscope")]
    NotCommunicating,

    #[fail(display="Bad packet header (version {}, length {})", version, length)]
    BadHeader { version: u8, length: u8 },

    #[fail(display="Short packet: expected {} bytes, got {}", expected, read)]
    ShortPacket { expected: usize, read: usize },

    #[fail(display="Unexpected packet type 0x{:02x}", _0)]
    UnexpectedPacket(u8),

    #[fail(display="Capture data arrived out of sequence")]
    Sequence,
}

/// Packets sent from the host to the oscilloscope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HostPacket {
    HostHello = 0x00,
    HostGoodbye = 0x01,
    SetTriggerType = 0x02,
    SetTimebase = 0x03,
    Capture = 0x04,
    Stop = 0x05,
    Start = 0x06,
    SetTriggerLevel = 0x07,
    SetTriggerPos = 0x08,
    Retransmit = 0x09,
    SetChannel2 = 0x0A,
    Ping = 0x0B,
    DataControl = 0x0C,
    Find = 0x0D,
    SetPosition = 0x0E,
    SetScale = 0x0F,
}

/// Packets sent from the oscilloscope to the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DevicePacket {
    HelloResponse = 0x80,
    TimebaseUpdated = 0x81,
    TriggerType = 0x82,
    TriggerLevel = 0x83,
    TriggerPos = 0x84,
    Channel2 = 0x85,
    DataStart = 0x86,
    Data = 0x87,
    DataEnd = 0x88,
    PingResponse = 0x89,
    Started = 0x8A,
    Stopped = 0x8B,
    Position = 0x8C,
    Scale = 0x8D,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Channel {
    One = 0,
    Two = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TriggerType {
    Level = 0,
    Rising = 1,
    Falling = 2,
    Always = 3,
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub param: u8,
    pub value: u32,
    pub data_length: u32,
}

impl PacketHeader {
    pub fn command(kind: HostPacket, param: u8, value: u32) -> Self {
        Self { packet_type: kind.into(), param, value, data_length: 0 }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let v = self.value.to_le_bytes();
        let l = self.data_length.to_le_bytes();
        [PROTOCOL_VERSION, HEADER_LENGTH as u8, self.packet_type, self.param,
         v[0], v[1], v[2], v[3], l[0], l[1], l[2], l[3]]
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != HEADER_LENGTH {
            Err(ScopeError::ShortPacket { expected: HEADER_LENGTH, read: data.len() })?;
        }
        if data[0] != PROTOCOL_VERSION || data[1] as usize != HEADER_LENGTH {
            Err(ScopeError::BadHeader { version: data[0], length: data[1] })?;
        }
        Ok(Self {
            packet_type: data[2],
            param: data[3],
            value: le_u32(data, 4),
            data_length: le_u32(data, 8),
        })
    }

    pub fn device_packet(&self) -> Option<DevicePacket> {
        DevicePacket::try_from(self.packet_type).ok()
    }
}

/// Oscilloscope state, sent in reply to HOST_HELLO.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeSettings {
    pub trigger_level_mv: u32,
    pub timebase_us: u32,
    pub trigger_pos: i32,
    pub ch1_offset_mv: i16,
    pub ch2_offset_mv: i16,
    pub ch1_scale_mv: u16,
    pub ch2_scale_mv: u16,
    pub channel2_enabled: bool,
    pub trigger_type: u8,
    pub started: bool,
    pub trigger_channel: u8,
}

impl ScopeSettings {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != SETTINGS_LENGTH {
            return None;
        }
        Some(Self {
            trigger_level_mv: le_u32(data, 0),
            timebase_us: le_u32(data, 4),
            trigger_pos: le_u32(data, 8) as i32,
            ch1_offset_mv: le_u16(data, 12) as i16,
            ch2_offset_mv: le_u16(data, 14) as i16,
            ch1_scale_mv: le_u16(data, 16),
            ch2_scale_mv: le_u16(data, 18),
            channel2_enabled: data[20] != 0,
            trigger_type: data[21],
            started: data[22] != 0,
            trigger_channel: data[23],
        })
    }

    pub fn trigger(&self) -> Option<TriggerType> {
        TriggerType::try_from(self.trigger_type).ok()
    }

    pub fn trigger_channel(&self) -> Option<Channel> {
        Channel::try_from(self.trigger_channel).ok()
    }
}

/// Payload of DATA_START, describing the capture that follows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataStart {
    /// Microseconds between consecutive samples on one channel.
    pub sample_offset_us: u32,
    /// Microseconds between the first and second sample of a dual element.
    pub sample_period_us: u32,
    pub trigger_index: u32,
    pub total_elements: u32,
    pub dual_channel: bool,
    /// In dual captures, whether the first sample of each element is channel 2.
    pub ch2_sample_first: bool,
}

impl DataStart {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != DATA_START_LENGTH {
            return None;
        }
        Some(Self {
            sample_offset_us: le_u32(data, 0),
            sample_period_us: le_u32(data, 4),
            trigger_index: le_u32(data, 8),
            total_elements: le_u32(data, 12),
            dual_channel: data[16] != 0,
            ch2_sample_first: data[17] != 0,
        })
    }

    pub fn element_length(&self) -> usize {
        if self.dual_channel { DUAL_ELEMENT_LENGTH } else { ELEMENT_LENGTH }
    }

    /// Bytes of element data the capture should carry.
    pub fn data_length(&self) -> usize {
        self.total_elements as usize * self.element_length()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataElement {
    pub time_us: u32,
    pub sample_mv: i16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DualDataElement {
    pub time_us: u32,
    pub sample1_mv: i16,
    pub sample2_mv: i16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Samples {
    Single(Vec<DataElement>),
    Dual(Vec<DualDataElement>),
}

/// One complete waveform dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capture {
    pub start: DataStart,
    pub samples: Samples,
}

impl Capture {
    /// Decode the element data collected between DATA_START and DATA_END.
    /// A trailing partial element is dropped.
    pub fn from_bytes(start: DataStart, data: &[u8]) -> Self {
        let samples = if start.dual_channel {
            Samples::Dual(data.chunks_exact(DUAL_ELEMENT_LENGTH).map(|d| DualDataElement {
                time_us: le_u32(d, 0),
                sample1_mv: le_u16(d, 4) as i16,
                sample2_mv: le_u16(d, 6) as i16,
            }).collect())
        } else {
            Samples::Single(data.chunks_exact(ELEMENT_LENGTH).map(|d| DataElement {
                time_us: le_u32(d, 0),
                sample_mv: le_u16(d, 4) as i16,
            }).collect())
        };
        Self { start, samples }
    }

    pub fn len(&self) -> usize {
        match &self.samples {
            Samples::Single(s) => s.len(),
            Samples::Dual(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every element announced in DATA_START arrived.
    pub fn is_complete(&self) -> bool {
        self.len() == self.start.total_elements as usize
    }

    /// (time, millivolts) pairs for one channel. A single channel capture
    /// is reported as channel 1.
    pub fn channel(&self, channel: Channel) -> Vec<(u32, i16)> {
        match &self.samples {
            Samples::Single(s) if channel == Channel::One =>
                s.iter().map(|e| (e.time_us, e.sample_mv)).collect(),
            Samples::Single(_) => Vec::new(),
            Samples::Dual(s) => {
                let first = (channel == Channel::Two) == self.start.ch2_sample_first;
                let period = self.start.sample_period_us;
                s.iter().map(|e| if first {
                    (e.time_us, e.sample1_mv)
                } else {
                    (e.time_us.wrapping_add(period), e.sample2_mv)
                }).collect()
            },
        }
    }
}

struct PendingCapture {
    start: DataStart,
    next: u8,
    data: Vec<u8>,
}

/// Reassembles DATA_START / DATA / DATA_END sequences into captures.
///
/// DATA packets carry a counter starting at 1. A packet out of sequence, or
/// one that would overflow the announced element count, discards the whole
/// dataset.
#[derive(Default)]
pub struct DataAssembler {
    pending: Option<PendingCapture>,
}

impl DataAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    pub fn start(&mut self, payload: &[u8]) {
        let start = match DataStart::parse(payload) {
            Some(start) => start,
            None => {
                tracing::warn!("Ignoring DATA_START with {} byte payload", payload.len());
                return;
            },
        };
        if self.pending.is_some() {
            tracing::debug!("Discarding incomplete capture");
        }
        tracing::trace!("Capture of {} elements starting", start.total_elements);
        let data = Vec::with_capacity(start.data_length());
        self.pending = Some(PendingCapture { start, next: 1, data });
    }

    pub fn data(&mut self, counter: u8, payload: &[u8]) {
        let accepted = match &mut self.pending {
            Some(p) if p.next == counter && p.data.len() + payload.len() <= p.start.data_length() => {
                p.data.extend_from_slice(payload);
                p.next = p.next.wrapping_add(1);
                true
            },
            Some(p) => {
                tracing::warn!("Dropping capture: DATA packet {} (expected {}), {} bytes",
                               counter, p.next, payload.len());
                false
            },
            None => return,
        };
        if !accepted {
            self.pending = None;
        }
    }

    pub fn end(&mut self) -> Option<Capture> {
        let pending = self.pending.take()?;
        let capture = Capture::from_bytes(pending.start, &pending.data);
        if !capture.is_complete() {
            tracing::debug!("Capture ended with {} of {} elements",
                            capture.len(), pending.start.total_elements);
        }
        Some(capture)
    }
}

/// Notifications raised by the background reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeEvent {
    DeviceAvailable,
    Connected(ScopeSettings),
    PingResponse { echo1: u8, echo2: u32 },
    Data(Capture),
    Started,
    Stopped,
    TimebaseChanged(u32),
    TriggerTypeChanged { channel: Channel, trigger: TriggerType },
    TriggerLevelChanged(u32),
    TriggerPosChanged(i32),
    Channel2(bool),
    ScaleChanged { channel: Channel, scale_mv: u32 },
    PositionChanged { channel: Channel, position_mv: i32 },
    Disconnected,
}

struct Link<B> {
    transport: B,
    communicating: AtomicBool,
}

/// Command interface to a connected oscilloscope.
///
/// Clones share the same device; commands other than hello and ping fail
/// with `NotCommunicating` until the device has answered HOST_HELLO.
pub struct ScopeClient<B> {
    link: Arc<Link<B>>,
}

impl<B> Clone for ScopeClient<B> {
    fn clone(&self) -> Self {
        Self { link: Arc::clone(&self.link) }
    }
}

impl<B: BulkTransport> ScopeClient<B> {
    const MAX_PAYLOAD: u32 = 0x10000;

    pub fn new(transport: B) -> Self {
        Self { link: Arc::new(Link { transport, communicating: AtomicBool::new(false) }) }
    }

    pub fn is_communicating(&self) -> bool {
        self.link.communicating.load(Ordering::SeqCst)
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let n = self.link.transport.write(data).context("Error sending scope packet")?;
        if n != data.len() {
            Err(ScopeError::ShortPacket { expected: data.len(), read: n })?;
        }
        Ok(())
    }

    fn send(&self, kind: HostPacket, param: u8, value: u32) -> Result<()> {
        tracing::debug!("Sending {:?} param {} value 0x{:08x}", kind, param, value);
        self.write_all(&PacketHeader::command(kind, param, value).to_bytes())
    }

    fn command(&self, kind: HostPacket, param: u8, value: u32) -> Result<()> {
        if !self.is_communicating() {
            Err(ScopeError::NotCommunicating)?;
        }
        self.send(kind, param, value)
    }

    pub fn hello(&self) -> Result<()> {
        self.send(HostPacket::HostHello, 0, 0)
    }

    /// Tell the device we are going away. Does nothing unless communicating.
    pub fn goodbye(&self) -> Result<()> {
        if self.link.communicating.swap(false, Ordering::SeqCst) {
            self.send(HostPacket::HostGoodbye, 0, 0)?;
        }
        Ok(())
    }

    pub fn start_stop(&self, start: bool) -> Result<()> {
        self.command(if start { HostPacket::Start } else { HostPacket::Stop }, 0, 0)
    }

    pub fn capture(&self) -> Result<()> {
        self.command(HostPacket::Capture, 0, 0)
    }

    pub fn enable_channel2(&self, enable: bool) -> Result<()> {
        self.command(HostPacket::SetChannel2, enable as u8, 0)
    }

    pub fn set_timebase(&self, us_per_div: u32) -> Result<()> {
        self.command(HostPacket::SetTimebase, 0, us_per_div)
    }

    pub fn set_trigger_level(&self, level_mv: u32) -> Result<()> {
        self.command(HostPacket::SetTriggerLevel, 0, level_mv)
    }

    /// Horizontal trigger position in pixels from the centre, -60 to 60.
    pub fn set_trigger_pos(&self, pos: i32) -> Result<()> {
        self.command(HostPacket::SetTriggerPos, 0, pos as u32)
    }

    pub fn set_trigger(&self, channel: Channel, trigger: TriggerType) -> Result<()> {
        self.command(HostPacket::SetTriggerType, channel.into(), u8::from(trigger) as u32)
    }

    pub fn set_position(&self, channel: Channel, position_mv: i32) -> Result<()> {
        self.command(HostPacket::SetPosition, channel.into(), position_mv as u32)
    }

    pub fn set_scale(&self, channel: Channel, scale_mv_per_div: u32) -> Result<()> {
        self.command(HostPacket::SetScale, channel.into(), scale_mv_per_div)
    }

    /// Turn automatic transmission of captured data on or off.
    pub fn automatic_data(&self, enable: bool) -> Result<()> {
        self.command(HostPacket::DataControl, enable as u8, 0)
    }

    /// Ask for the last capture to be sent again.
    pub fn request_data(&self) -> Result<()> {
        self.command(HostPacket::Retransmit, 0, 0)
    }

    /// Centre a channel's waveform on the display.
    pub fn find(&self, channel: Channel) -> Result<()> {
        self.command(HostPacket::Find, channel.into(), 0)
    }

    pub fn ping(&self, echo1: u8, echo2: u32) -> Result<()> {
        self.send(HostPacket::Ping, echo1, echo2)
    }

    /// Read one packet and its payload.
    pub fn read_packet(&self, timeout: Duration) -> Result<(PacketHeader, Vec<u8>)> {
        let mut buf = [0u8; HEADER_LENGTH];
        let n = self.link.transport.read(&mut buf, timeout)?;
        let header = PacketHeader::parse(&buf[..n])?;
        if header.data_length > Self::MAX_PAYLOAD {
            Err(ScopeError::BadHeader { version: buf[0], length: buf[1] })
                .context(format!("Payload length {} too large", header.data_length))?;
        }
        let mut payload = vec![0u8; header.data_length as usize];
        let mut filled = 0;
        while filled < payload.len() {
            let n = self.link.transport.read(&mut payload[filled..], PAYLOAD_TIMEOUT)
                                       .context("Error reading packet payload")?;
            if n == 0 {
                Err(ScopeError::ShortPacket { expected: payload.len(), read: filled })?;
            }
            filled += n;
        }
        tracing::trace!("Received packet 0x{:02x} param {} value 0x{:08x}, {} bytes",
                        header.packet_type, header.param, header.value, payload.len());
        Ok((header, payload))
    }

    /// Say hello and wait for the device's settings.
    pub fn connect(&self, timeout: Duration) -> Result<ScopeSettings> {
        self.hello()?;
        let (header, payload) = self.read_packet(timeout)?;
        match (header.device_packet(), ScopeSettings::parse(&payload)) {
            (Some(DevicePacket::HelloResponse), Some(settings)) => {
                self.link.communicating.store(true, Ordering::SeqCst);
                Ok(settings)
            },
            _ => Err(ScopeError::UnexpectedPacket(header.packet_type))?,
        }
    }

    /// Wait for the next complete capture, skipping any other packets.
    pub fn read_capture(&self, timeout: Duration) -> Result<Capture> {
        let mut assembler = DataAssembler::new();
        let mut started = false;
        loop {
            let (header, payload) = self.read_packet(timeout)?;
            match header.device_packet() {
                Some(DevicePacket::DataStart) => {
                    assembler.start(&payload);
                    started = assembler.in_progress();
                },
                Some(DevicePacket::Data) if started => assembler.data(header.param, &payload),
                Some(DevicePacket::DataEnd) if started => {
                    return match assembler.end() {
                        Some(capture) => Ok(capture),
                        None => Err(ScopeError::Sequence.into()),
                    };
                },
                _ => tracing::trace!("Skipping packet 0x{:02x} while waiting for data",
                                     header.packet_type),
            }
        }
    }

    /// Turn a received packet into a notification, feeding capture data
    /// through `assembler`.
    pub fn handle_packet(&self, header: &PacketHeader, payload: &[u8],
                         assembler: &mut DataAssembler) -> Option<ScopeEvent>
    {
        let kind = match header.device_packet() {
            Some(kind) => kind,
            None => {
                tracing::debug!("Ignoring unknown packet type 0x{:02x}", header.packet_type);
                return None;
            },
        };
        let channel = Channel::try_from(header.param).ok();
        match kind {
            DevicePacket::HelloResponse => match ScopeSettings::parse(payload) {
                Some(settings) => {
                    self.link.communicating.store(true, Ordering::SeqCst);
                    Some(ScopeEvent::Connected(settings))
                },
                None => {
                    tracing::warn!("HELLO_RESPONSE with {} byte payload", payload.len());
                    None
                },
            },
            DevicePacket::PingResponse =>
                Some(ScopeEvent::PingResponse { echo1: header.param, echo2: header.value }),
            DevicePacket::DataStart => {
                assembler.start(payload);
                None
            },
            DevicePacket::Data => {
                assembler.data(header.param, payload);
                None
            },
            DevicePacket::DataEnd => assembler.end().map(ScopeEvent::Data),
            DevicePacket::Started => Some(ScopeEvent::Started),
            DevicePacket::Stopped => Some(ScopeEvent::Stopped),
            DevicePacket::TimebaseUpdated => Some(ScopeEvent::TimebaseChanged(header.value)),
            DevicePacket::TriggerLevel => Some(ScopeEvent::TriggerLevelChanged(header.value)),
            DevicePacket::TriggerPos => Some(ScopeEvent::TriggerPosChanged(header.value as i32)),
            DevicePacket::Channel2 => Some(ScopeEvent::Channel2(header.param != 0)),
            DevicePacket::TriggerType => {
                let trigger = u8::try_from(header.value).ok()
                                .and_then(|t| TriggerType::try_from(t).ok());
                match (channel, trigger) {
                    (Some(channel), Some(trigger)) =>
                        Some(ScopeEvent::TriggerTypeChanged { channel, trigger }),
                    _ => None,
                }
            },
            DevicePacket::Scale => channel.map(|channel|
                ScopeEvent::ScaleChanged { channel, scale_mv: header.value }),
            DevicePacket::Position => channel.map(|channel|
                ScopeEvent::PositionChanged { channel, position_mv: header.value as i32 }),
        }
    }
}

fn is_timeout(error: &failure::Error) -> bool {
    matches!(dfu_error(error), Some(DFUError::Timeout))
}

fn is_protocol_error(error: &failure::Error) -> bool {
    error.iter_chain().any(|cause| cause.downcast_ref::<ScopeError>().is_some())
}

fn publish<B>(shared: &Mutex<Option<ScopeClient<B>>>, client: Option<ScopeClient<B>>) {
    if let Ok(mut slot) = shared.lock() {
        *slot = client;
    }
}

fn reader_thread<B, F>(mut open: F, events: mpsc::Sender<ScopeEvent>,
                       shared: Arc<Mutex<Option<ScopeClient<B>>>>, stop: mpsc::Receiver<()>)
    where B: BulkTransport, F: FnMut() -> Result<B>
{
    loop {
        let client = loop {
            match open() {
                Ok(transport) => break ScopeClient::new(transport),
                Err(e) => tracing::trace!("Oscilloscope not available: {}", e),
            }
            match stop.recv_timeout(CONNECT_RETRY) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                _ => return,
            }
        };

        tracing::info!("Oscilloscope found");
        publish(&shared, Some(client.clone()));
        if events.send(ScopeEvent::DeviceAvailable).is_err() {
            return;
        }
        if let Err(e) = client.hello() {
            tracing::warn!("Error sending hello: {}", e);
        }

        let mut assembler = DataAssembler::new();
        loop {
            match stop.try_recv() {
                Err(mpsc::TryRecvError::Empty) => (),
                _ => {
                    let _ = client.goodbye();
                    publish(&shared, None);
                    return;
                },
            }
            match client.read_packet(POLL_TIMEOUT) {
                Ok((header, payload)) => {
                    if let Some(event) = client.handle_packet(&header, &payload, &mut assembler) {
                        if events.send(event).is_err() {
                            publish(&shared, None);
                            return;
                        }
                    }
                },
                Err(ref e) if is_timeout(e) => (),
                Err(ref e) if is_protocol_error(e) => tracing::warn!("Protocol error: {}", e),
                Err(e) => {
                    tracing::info!("Oscilloscope disconnected: {}", e);
                    break;
                },
            }
        }

        client.link.communicating.store(false, Ordering::SeqCst);
        publish(&shared, None);
        if events.send(ScopeEvent::Disconnected).is_err() {
            return;
        }
    }
}

/// Background connection to an oscilloscope.
///
/// A reader thread keeps trying to open the device every two seconds, says
/// hello once it appears, and forwards everything the device sends as
/// `ScopeEvent`s. After a disconnection it goes back to waiting for the
/// device.
pub struct ScopeMonitor<B> {
    client: Arc<Mutex<Option<ScopeClient<B>>>>,
    stop: mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<B: BulkTransport + Send + Sync + 'static> ScopeMonitor<B> {
    pub fn spawn<F>(open: F, events: mpsc::Sender<ScopeEvent>) -> Result<Self>
        where F: FnMut() -> Result<B> + Send + 'static
    {
        let client = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&client);
        let (stop, stop_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("scope-reader".to_string())
            .spawn(move || reader_thread(open, events, shared, stop_rx))
            .context("Error starting scope reader thread")?;
        Ok(Self { client, stop, thread: Some(thread) })
    }
}

impl<B> ScopeMonitor<B> {
    /// The connected device, if there is one.
    pub fn client(&self) -> Option<ScopeClient<B>> {
        match self.client.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }

    /// Stop the reader thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Scope reader thread panicked");
            }
        }
    }
}

impl<B> Drop for ScopeMonitor<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open the oscilloscope's bulk interface.
pub fn open_scope(context: &rusb::Context) -> Result<crate::BulkPipe> {
    crate::BulkPipe::open(context, SCOPE_VID, SCOPE_PID, SCOPE_INTERFACE,
                          SCOPE_OUT_ENDPOINT, SCOPE_IN_ENDPOINT)
}

/// Start monitoring for an oscilloscope on USB.
pub fn monitor_usb(events: mpsc::Sender<ScopeEvent>) -> Result<ScopeMonitor<crate::BulkPipe>> {
    let context = rusb::Context::new().context("Error creating libusb context")?;
    ScopeMonitor::spawn(move || open_scope(&context), events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    type Writes = Arc<Mutex<Vec<Vec<u8>>>>;

    /// Replays scripted IN transfers and records OUT transfers. Once the
    /// script runs out every read times out.
    struct MockBulk {
        reads: Mutex<VecDeque<std::result::Result<Vec<u8>, DFUError>>>,
        writes: Writes,
    }

    impl MockBulk {
        fn new(packets: Vec<Vec<u8>>) -> Self {
            Self {
                reads: Mutex::new(packets.into_iter().map(Ok).collect()),
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn then_fail(self, error: DFUError) -> Self {
            self.reads.lock().unwrap().push_back(Err(error));
            self
        }
    }

    impl BulkTransport for MockBulk {
        fn write(&self, data: &[u8]) -> Result<usize> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn read(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let next = self.reads.lock().unwrap().pop_front();
            match next {
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                },
                Some(Err(e)) => Err(e)?,
                None => {
                    thread::sleep(Duration::from_millis(2));
                    Err(DFUError::Timeout)?
                },
            }
        }
    }

    fn packet(kind: DevicePacket, param: u8, value: u32, payload: &[u8]) -> Vec<Vec<u8>> {
        let header = PacketHeader {
            packet_type: kind.into(), param, value, data_length: payload.len() as u32,
        };
        let mut transfers = vec![header.to_bytes().to_vec()];
        if !payload.is_empty() {
            transfers.push(payload.to_vec());
        }
        transfers
    }

    fn settings_bytes() -> Vec<u8> {
        vec![0xE8, 0x03, 0, 0,          // trigger level 1000 mV
             0xF4, 0x01, 0, 0,          // 500 us/div
             0xF6, 0xFF, 0xFF, 0xFF,    // trigger pos -10
             0x9C, 0xFF,                // ch1 offset -100 mV
             0x64, 0x00,                // ch2 offset 100 mV
             0xF4, 0x01,                // ch1 500 mV/div
             0xE8, 0x03,                // ch2 1000 mV/div
             1, 1, 1, 0]
    }

    fn data_start(total: u32, dual: bool, ch2_first: bool) -> Vec<u8> {
        let mut d = Vec::new();
        d.extend_from_slice(&10u32.to_le_bytes());
        d.extend_from_slice(&4u32.to_le_bytes());
        d.extend_from_slice(&1u32.to_le_bytes());
        d.extend_from_slice(&total.to_le_bytes());
        d.push(dual as u8);
        d.push(ch2_first as u8);
        d
    }

    fn single(time: u32, mv: i16) -> Vec<u8> {
        let mut d = time.to_le_bytes().to_vec();
        d.extend_from_slice(&mv.to_le_bytes());
        d
    }

    fn dual(time: u32, s1: i16, s2: i16) -> Vec<u8> {
        let mut d = single(time, s1);
        d.extend_from_slice(&s2.to_le_bytes());
        d
    }

    fn connected(mock: MockBulk) -> (ScopeClient<MockBulk>, Writes) {
        let writes = Arc::clone(&mock.writes);
        let client = ScopeClient::new(mock);
        let header = PacketHeader {
            packet_type: DevicePacket::HelloResponse.into(), param: 0, value: 0,
            data_length: SETTINGS_LENGTH as u32,
        };
        let event = client.handle_packet(&header, &settings_bytes(), &mut DataAssembler::new());
        assert!(matches!(event, Some(ScopeEvent::Connected(_))));
        (client, writes)
    }

    #[test]
    fn header_layout() {
        let header = PacketHeader::command(HostPacket::SetTimebase, 0, 500);
        assert_eq!(header.to_bytes(), [1, 12, 0x03, 0, 0xF4, 0x01, 0, 0, 0, 0, 0, 0]);

        let parsed = PacketHeader::parse(&[1, 12, 0x87, 3, 20, 0, 0, 0, 120, 0, 0, 0]).unwrap();
        assert_eq!(parsed.device_packet(), Some(DevicePacket::Data));
        assert_eq!(parsed.param, 3);
        assert_eq!(parsed.value, 20);
        assert_eq!(parsed.data_length, 120);
    }

    #[test]
    fn bad_headers_rejected() {
        assert!(PacketHeader::parse(&[2, 12, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(PacketHeader::parse(&[1, 16, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(PacketHeader::parse(&[1, 12, 0x80]).is_err());
        let unknown = PacketHeader::parse(&[1, 12, 0x42, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(unknown.device_packet(), None);
    }

    #[test]
    fn settings_fields() {
        let settings = ScopeSettings::parse(&settings_bytes()).unwrap();
        assert_eq!(settings.trigger_level_mv, 1000);
        assert_eq!(settings.timebase_us, 500);
        assert_eq!(settings.trigger_pos, -10);
        assert_eq!(settings.ch1_offset_mv, -100);
        assert_eq!(settings.ch2_offset_mv, 100);
        assert_eq!(settings.ch1_scale_mv, 500);
        assert_eq!(settings.ch2_scale_mv, 1000);
        assert!(settings.channel2_enabled);
        assert!(settings.started);
        assert_eq!(settings.trigger(), Some(TriggerType::Rising));
        assert_eq!(settings.trigger_channel(), Some(Channel::One));
        assert!(ScopeSettings::parse(&settings_bytes()[..22]).is_none());
    }

    #[test]
    fn commands_need_hello_response() {
        let mock = MockBulk::new(vec![]);
        let writes = Arc::clone(&mock.writes);
        let client = ScopeClient::new(mock);
        let e = client.start_stop(true).unwrap_err();
        assert!(matches!(e.downcast_ref::<ScopeError>(), Some(ScopeError::NotCommunicating)));
        // Goodbye is silently skipped, hello and ping always go out.
        client.goodbye().unwrap();
        client.hello().unwrap();
        client.ping(7, 0xDEAD_BEEF).unwrap();
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][2], 0x00);
        assert_eq!(writes[1], vec![1, 12, 0x0B, 7, 0xEF, 0xBE, 0xAD, 0xDE, 0, 0, 0, 0]);
    }

    #[test]
    fn command_encoding() {
        let (client, writes) = connected(MockBulk::new(vec![]));
        client.set_trigger(Channel::Two, TriggerType::Falling).unwrap();
        client.set_position(Channel::One, -100).unwrap();
        client.set_trigger_pos(-60).unwrap();
        client.set_scale(Channel::Two, 200).unwrap();
        client.enable_channel2(true).unwrap();
        client.find(Channel::Two).unwrap();
        client.start_stop(false).unwrap();
        client.goodbye().unwrap();
        assert!(!client.is_communicating());
        let writes = writes.lock().unwrap();
        assert_eq!(&writes[0][2..8], &[0x02, 1, 2, 0, 0, 0]);
        assert_eq!(&writes[1][2..8], &[0x0E, 0, 0x9C, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&writes[2][2..8], &[0x08, 0, 0xC4, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&writes[3][2..8], &[0x0F, 1, 200, 0, 0, 0]);
        assert_eq!(&writes[4][2..4], &[0x0A, 1]);
        assert_eq!(&writes[5][2..4], &[0x0D, 1]);
        assert_eq!(writes[6][2], 0x05);
        assert_eq!(writes[7][2], 0x01);
    }

    #[test]
    fn assembler_builds_single_channel_capture() {
        let mut assembler = DataAssembler::new();
        assert!(assembler.end().is_none());
        assembler.start(&data_start(3, false, false));
        let mut first = single(0, 100);
        first.extend(single(10, -200));
        assembler.data(1, &first);
        assembler.data(2, &single(20, 300));
        let capture = assembler.end().unwrap();
        assert!(capture.is_complete());
        assert_eq!(capture.start.trigger_index, 1);
        assert_eq!(capture.channel(Channel::One), vec![(0, 100), (10, -200), (20, 300)]);
        assert!(capture.channel(Channel::Two).is_empty());
        assert!(!assembler.in_progress());
    }

    #[test]
    fn assembler_drops_out_of_sequence_data() {
        let mut assembler = DataAssembler::new();
        assembler.start(&data_start(2, false, false));
        assembler.data(1, &single(0, 1));
        assembler.data(3, &single(10, 2));
        assert!(!assembler.in_progress());
        assert!(assembler.end().is_none());
    }

    #[test]
    fn assembler_drops_overflowing_data() {
        let mut assembler = DataAssembler::new();
        assembler.start(&data_start(1, false, false));
        let mut two = single(0, 1);
        two.extend(single(10, 2));
        assembler.data(1, &two);
        assert!(assembler.end().is_none());
    }

    #[test]
    fn new_start_replaces_unfinished_capture() {
        let mut assembler = DataAssembler::new();
        assembler.start(&data_start(2, false, false));
        assembler.data(1, &single(0, 1));
        assembler.start(&data_start(1, false, false));
        assembler.data(1, &single(0, 9));
        assert_eq!(assembler.end().unwrap().channel(Channel::One), vec![(0, 9)]);
    }

    #[test]
    fn dual_capture_channel_order() {
        let mut data = dual(0, 100, 200);
        data.extend(dual(10, 110, 210));
        let start = DataStart::parse(&data_start(2, true, true)).unwrap();
        let capture = Capture::from_bytes(start, &data);
        // Channel 2 samples come first and are not offset.
        assert_eq!(capture.channel(Channel::Two), vec![(0, 100), (10, 110)]);
        assert_eq!(capture.channel(Channel::One), vec![(4, 200), (14, 210)]);

        let start = DataStart::parse(&data_start(2, true, false)).unwrap();
        let capture = Capture::from_bytes(start, &data);
        assert_eq!(capture.channel(Channel::One), vec![(0, 100), (10, 110)]);
    }

    #[test]
    fn notifications_from_packets() {
        let (client, _) = connected(MockBulk::new(vec![]));
        let mut assembler = DataAssembler::new();
        let mut event = |kind: DevicePacket, param: u8, value: u32| {
            let header = PacketHeader { packet_type: kind.into(), param, value, data_length: 0 };
            client.handle_packet(&header, &[], &mut assembler)
        };
        assert_eq!(event(DevicePacket::TimebaseUpdated, 0, 100),
                   Some(ScopeEvent::TimebaseChanged(100)));
        assert_eq!(event(DevicePacket::TriggerType, 1, 2),
                   Some(ScopeEvent::TriggerTypeChanged {
                       channel: Channel::Two, trigger: TriggerType::Falling }));
        assert_eq!(event(DevicePacket::TriggerType, 1, 9), None);
        assert_eq!(event(DevicePacket::TriggerPos, 0, (-5i32) as u32),
                   Some(ScopeEvent::TriggerPosChanged(-5)));
        assert_eq!(event(DevicePacket::Channel2, 0, 0), Some(ScopeEvent::Channel2(false)));
        assert_eq!(event(DevicePacket::Position, 0, (-250i32) as u32),
                   Some(ScopeEvent::PositionChanged { channel: Channel::One, position_mv: -250 }));
        assert_eq!(event(DevicePacket::Scale, 1, 100),
                   Some(ScopeEvent::ScaleChanged { channel: Channel::Two, scale_mv: 100 }));
        assert_eq!(event(DevicePacket::PingResponse, 3, 4),
                   Some(ScopeEvent::PingResponse { echo1: 3, echo2: 4 }));
        assert_eq!(event(DevicePacket::Started, 0, 0), Some(ScopeEvent::Started));
        assert_eq!(event(DevicePacket::DataEnd, 0, 0), None);
    }

    #[test]
    fn synchronous_connect_and_capture() {
        let mut script = packet(DevicePacket::HelloResponse, 0, 0, &settings_bytes());
        script.extend(packet(DevicePacket::Started, 0, 0, &[]));
        script.extend(packet(DevicePacket::DataStart, 0, 1, &data_start(1, false, false)));
        script.extend(packet(DevicePacket::Data, 1, 1, &single(0, 42)));
        script.extend(packet(DevicePacket::DataEnd, 2, 0, &[]));
        let client = ScopeClient::new(MockBulk::new(script));
        let settings = client.connect(Duration::from_millis(10)).unwrap();
        assert_eq!(settings.timebase_us, 500);
        assert!(client.is_communicating());
        let capture = client.read_capture(Duration::from_millis(10)).unwrap();
        assert_eq!(capture.channel(Channel::One), vec![(0, 42)]);
    }

    #[test]
    fn synchronous_capture_sequence_error() {
        let mut script = packet(DevicePacket::DataStart, 0, 2, &data_start(2, false, false));
        script.extend(packet(DevicePacket::Data, 2, 1, &single(0, 42)));
        script.extend(packet(DevicePacket::Data, 3, 1, &single(10, 43)));
        script.extend(packet(DevicePacket::DataEnd, 4, 0, &[]));
        let client = ScopeClient::new(MockBulk::new(script));
        let e = client.read_capture(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(e.downcast_ref::<ScopeError>(), Some(ScopeError::Sequence)));
    }

    #[test]
    fn connect_rejects_other_packets() {
        let client = ScopeClient::new(MockBulk::new(packet(DevicePacket::Stopped, 0, 0, &[])));
        assert!(client.connect(Duration::from_millis(10)).is_err());
        assert!(!client.is_communicating());
    }

    #[test]
    fn monitor_reports_session() {
        let mut script = packet(DevicePacket::HelloResponse, 0, 0, &settings_bytes());
        script.extend(packet(DevicePacket::Started, 0, 0, &[]));
        script.extend(packet(DevicePacket::DataStart, 0, 1, &data_start(1, false, false)));
        script.extend(packet(DevicePacket::Data, 1, 1, &single(5, -7)));
        script.extend(packet(DevicePacket::DataEnd, 2, 0, &[]));
        let mock = MockBulk::new(script).then_fail(DFUError::Disconnected);
        let writes = Arc::clone(&mock.writes);

        let mut device = Some(mock);
        let opener = move || -> Result<MockBulk> {
            match device.take() {
                Some(mock) => Ok(mock),
                None => Err(DFUError::NotFound)?,
            }
        };
        let (tx, rx) = mpsc::channel();
        let monitor = ScopeMonitor::spawn(opener, tx).unwrap();
        let timeout = Duration::from_secs(5);

        assert_eq!(rx.recv_timeout(timeout).unwrap(), ScopeEvent::DeviceAvailable);
        match rx.recv_timeout(timeout).unwrap() {
            ScopeEvent::Connected(settings) => assert_eq!(settings.trigger_level_mv, 1000),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rx.recv_timeout(timeout).unwrap(), ScopeEvent::Started);
        match rx.recv_timeout(timeout).unwrap() {
            ScopeEvent::Data(capture) => assert_eq!(capture.channel(Channel::One), vec![(5, -7)]),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rx.recv_timeout(timeout).unwrap(), ScopeEvent::Disconnected);
        assert!(monitor.client().is_none());

        // The reader said hello as soon as the device opened.
        assert_eq!(writes.lock().unwrap()[0][2], 0x00);
        monitor.stop();
    }

    #[test]
    fn monitor_stops_while_waiting_for_device() {
        let opener = || -> Result<MockBulk> { Err(DFUError::NotFound)? };
        let (tx, rx) = mpsc::channel();
        let monitor = ScopeMonitor::spawn(opener, tx).unwrap();
        assert!(monitor.client().is_none());
        monitor.stop();
        assert!(rx.try_recv().is_err());
    }
}
