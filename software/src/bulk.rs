//! Host side of the Stellaris generic bulk device example.
//!
//! The device returns every string it receives with the case of each ASCII
//! letter inverted. In echo mode the roles swap and the host reflects every
//! packet the device sends.

use std::time::{Duration, Instant};
use failure::ResultExt;
use crate::{BulkTransport, BulkPipe, Result};

pub const BULK_VID: u16 = 0x1CBE;
pub const BULK_PID: u16 = 0x0003;
pub const BULK_INTERFACE: u8 = 0;
pub const BULK_OUT_ENDPOINT: u8 = 0x01;
pub const BULK_IN_ENDPOINT: u8 = 0x81;

/// Largest string sent in one transfer.
pub const MAX_ENTRY_LEN: usize = 255;
pub const ECHO_PACKET_SIZE: usize = 64;

const REPLY_TIMEOUT: Duration = Duration::from_millis(5000);
const ECHO_TIMEOUT: Duration = Duration::from_secs(3600);
const REPORT_INTERVAL: Duration = Duration::from_millis(1000);

pub fn open_bulk(context: &rusb::Context) -> Result<BulkPipe> {
    BulkPipe::open(context, BULK_VID, BULK_PID, BULK_INTERFACE,
                   BULK_OUT_ENDPOINT, BULK_IN_ENDPOINT)
}

/// What the device does to every string it is sent.
pub fn invert_case(data: &[u8]) -> Vec<u8> {
    data.iter().map(|&c| match c {
        b'a'..=b'z' => c.to_ascii_uppercase(),
        b'A'..=b'Z' => c.to_ascii_lowercase(),
        _ => c,
    }).collect()
}

/// A line typed at the interactive prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Exit,
    Empty,
    Text(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let text = line.trim_end_matches(|c| c == '\n' || c == '\r');
        if text.is_empty() {
            Input::Empty
        } else if text == "EXIT" {
            Input::Exit
        } else {
            let mut end = text.len().min(MAX_ENTRY_LEN);
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            Input::Text(text[..end].to_string())
        }
    }
}

/// Result of sending one string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    pub written: usize,
    pub reply: Vec<u8>,
}

/// Send `text` and read back the device's reply, which is expected to be
/// the same length.
pub fn exchange<B: BulkTransport>(pipe: &B, text: &[u8]) -> Result<Exchange> {
    let written = pipe.write(text).context("Error writing to bulk OUT pipe")?;
    tracing::debug!("Wrote {} bytes to the device, expected {}", written, text.len());
    let mut reply = vec![0u8; written];
    let read = pipe.read(&mut reply, REPLY_TIMEOUT).context("Error reading from bulk IN pipe")?;
    reply.truncate(read);
    tracing::debug!("Read {} bytes from the device, expected {}", read, written);
    Ok(Exchange { written, reply })
}

/// One throughput report from echo mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub kbps: u64,
    pub packets: u64,
}

/// Byte and packet counters, reported roughly once a second. The byte
/// count restarts after every report, the packet count never does.
#[derive(Clone, Debug)]
pub struct Throughput {
    started: Option<Instant>,
    bytes: u64,
    packets: u64,
}

impl Throughput {
    pub fn new() -> Self {
        Self { started: None, bytes: 0, packets: 0 }
    }

    pub fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.packets += 1;
    }

    /// The first call only starts the clock.
    pub fn poll(&mut self, now: Instant) -> Option<Report> {
        let started = match self.started {
            Some(started) => started,
            None => {
                self.started = Some(now);
                return None;
            },
        };
        let elapsed = now.saturating_duration_since(started);
        if elapsed <= REPORT_INTERVAL {
            return None;
        }
        let ms = elapsed.as_millis() as u64;
        let report = Report { kbps: self.bytes * 8 / ms, packets: self.packets };
        self.bytes = 0;
        self.started = Some(now);
        Some(report)
    }
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one packet and write it straight back. Returns the packet size.
pub fn echo_packet<B: BulkTransport>(pipe: &B, buf: &mut [u8; ECHO_PACKET_SIZE]) -> Result<usize> {
    let n = pipe.read(buf, ECHO_TIMEOUT).context("Error reading from bulk IN pipe")?;
    pipe.write(&buf[..n]).context("Error writing to bulk OUT pipe")?;
    Ok(n)
}

/// Reflect packets until a transfer fails, calling `report` about once a
/// second. Only returns on error.
pub fn echo<B, F>(pipe: &B, mut report: F) -> failure::Error
    where B: BulkTransport, F: FnMut(Report)
{
    let mut buf = [0u8; ECHO_PACKET_SIZE];
    let mut throughput = Throughput::new();
    loop {
        match echo_packet(pipe, &mut buf) {
            Ok(n) => {
                throughput.record(n);
                if let Some(r) = throughput.poll(Instant::now()) {
                    report(r);
                }
            },
            Err(e) => return e,
        }
    }
}
