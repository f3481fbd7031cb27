// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! PCM WAV playback from a file held in memory.
//!
//! The player owns two half buffers. `play_continue` copies the next block of
//! samples into whichever halves are empty and queues them on the `Sound`
//! driver; the application hands halves back with `buffer_released` as the
//! driver releases them.

use core::fmt::Write;
use core::ops::DerefMut;
use stable_deref_trait::StableDeref;

use crate::hal::dma::DmaChannel;
use crate::hal::i2s::I2sTx;
use crate::sound::{Codec, Sound};

const RIFF_CHUNK_ID_RIFF: &[u8; 4] = b"RIFF";
const RIFF_TAG_WAVE: &[u8; 4] = b"WAVE";
const RIFF_CHUNK_ID_FMT: &[u8; 4] = b"fmt ";
const RIFF_CHUNK_ID_DATA: &[u8; 4] = b"data";

pub const RIFF_FORMAT_PCM: u16 = 0x0001;

/// Size of each half buffer, and the number of bytes credited as played
/// each time one is released.
pub const HALF_BUFFER_SIZE: usize = 2048;

/// Most samples read into a half buffer at once.
const MAX_SAMPLES_PER_READ: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaveError {
    /// Missing RIFF or WAVE tags.
    InvalidRiff,
    /// Missing or oversized `fmt ` chunk, or no `data` chunk where expected.
    InvalidChunk,
    /// More than two channels, or a format that describes no samples.
    InvalidFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WaveHeader {
    pub format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub avg_byte_rate: u32,
    pub bits_per_sample: u16,
    pub data_size: u32,
}

fn read_u16(file: &[u8], offset: usize) -> Option<u16> {
    let bytes = file.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(file: &[u8], offset: usize) -> Option<u32> {
    let bytes = file.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn tag(file: &[u8], offset: usize) -> Option<&[u8]> {
    file.get(offset..offset + 4)
}

impl WaveHeader {
    /// Parse the RIFF header at the start of `file`. Returns the header and
    /// the offset of the first sample.
    ///
    /// The `fmt ` chunk must be at most 16 bytes and immediately followed by
    /// the `data` chunk. A data size running past the end of `file` is
    /// clamped to what is present.
    pub fn parse(file: &[u8]) -> Result<(Self, usize), WaveError> {
        if tag(file, 0) != Some(&RIFF_CHUNK_ID_RIFF[..]) || tag(file, 8) != Some(&RIFF_TAG_WAVE[..]) {
            return Err(WaveError::InvalidRiff);
        }
        if tag(file, 12) != Some(&RIFF_CHUNK_ID_FMT[..]) {
            return Err(WaveError::InvalidChunk);
        }
        let chunk_size = read_u32(file, 16).ok_or(WaveError::InvalidChunk)?;
        if chunk_size > 16 {
            return Err(WaveError::InvalidChunk);
        }

        let field16 = |offset| read_u16(file, offset).ok_or(WaveError::InvalidChunk);
        let field32 = |offset| read_u32(file, offset).ok_or(WaveError::InvalidChunk);
        let mut header = WaveHeader {
            format: field16(20)?,
            channels: field16(22)?,
            sample_rate: field32(24)?,
            avg_byte_rate: field32(28)?,
            bits_per_sample: field16(34)?,
            data_size: 0,
        };
        if header.channels == 0 || header.channels > 2 || header.bytes_per_sample() == 0
            || header.avg_byte_rate == 0
        {
            return Err(WaveError::InvalidFormat);
        }

        let data = 20 + (chunk_size as usize / 4) * 4;
        if tag(file, data) != Some(&RIFF_CHUNK_ID_DATA[..]) {
            return Err(WaveError::InvalidChunk);
        }
        let data_size = field32(data + 4)?;
        let samples = data + 8;
        header.data_size = data_size.min(file.len().saturating_sub(samples) as u32);
        Ok((header, samples))
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize * self.channels as usize) >> 3
    }

    /// Largest block read into one half buffer.
    pub fn max_buffer_size(&self) -> usize {
        let bps = self.bytes_per_sample();
        if HALF_BUFFER_SIZE / bps > MAX_SAMPLES_PER_READ {
            MAX_SAMPLES_PER_READ * bps
        } else {
            HALF_BUFFER_SIZE
        }
    }

    /// Whole seconds of audio in the file.
    pub fn duration_seconds(&self) -> u32 {
        self.data_size / self.avg_byte_rate
    }
}

/// Turn unsigned 8-bit samples into the signed samples the I2S unit expects.
fn convert_8bit(samples: &mut [u8]) {
    for s in samples.iter_mut() {
        *s = s.wrapping_sub(128);
    }
}

/// Time string as `m:ss/m:ss`.
pub type TimeString = heapless::String<40>;

pub struct WavePlayer<'a, B> {
    /// Halves waiting to be filled, bottom then top.
    empty: [Option<B>; 2],
    addresses: [usize; 2],
    header: Option<WaveHeader>,
    data: &'a [u8],
    max_buffer: usize,
    /// Bytes per second used for elapsed time, in half buffer credits.
    byte_rate: u32,
    bytes_played: u32,
    playing: bool,
}

impl<'a, B> WavePlayer<'a, B>
    where B: StableDeref + DerefMut<Target = [u8]> + 'static
{
    /// Both halves should hold at least `HALF_BUFFER_SIZE` bytes.
    pub fn new(bottom: B, top: B) -> Self {
        let addresses = [bottom.as_ptr() as usize, top.as_ptr() as usize];
        WavePlayer {
            empty: [Some(bottom), Some(top)],
            addresses,
            header: None,
            data: &[],
            max_buffer: HALF_BUFFER_SIZE,
            byte_rate: 1,
            bytes_played: 0,
            playing: false,
        }
    }

    /// Parse `file` and set up `sound` for its format, ready for
    /// `play_start`.
    pub fn open<I, D, C>(&mut self, sound: &mut Sound<I, D, C, B>, file: &'a [u8])
        -> Result<WaveHeader, WaveError>
        where I: I2sTx, D: DmaChannel, C: Codec
    {
        let (header, offset) = WaveHeader::parse(file)?;
        self.header = Some(header);
        self.data = &file[offset..offset + header.data_size as usize];
        self.max_buffer = header.max_buffer_size();
        self.bytes_played = 0;
        self.playing = false;
        // Mono 8-bit halves only carry half a buffer of samples each.
        self.byte_rate = if header.channels == 1 && header.bits_per_sample == 8 {
            header.avg_byte_rate.saturating_mul(2)
        } else {
            header.avg_byte_rate
        };
        #[cfg(feature = "defmt")]
        defmt::info!("wav: {} Hz, {} bit, {} channels, {} bytes",
                     header.sample_rate, header.bits_per_sample, header.channels, header.data_size);
        sound.set_format(header.sample_rate, header.bits_per_sample, header.channels);
        Ok(header)
    }

    pub fn header(&self) -> Option<&WaveHeader> {
        self.header.as_ref()
    }

    pub fn play_start(&mut self) {
        self.playing = self.header.is_some();
    }

    /// Fill and queue any empty halves. Returns true once the last block of
    /// the file has been queued; the caller should then keep feeding
    /// `buffer_released` until `is_drained`.
    pub fn play_continue<I, D, C>(&mut self, sound: &mut Sound<I, D, C, B>) -> bool
        where I: I2sTx, D: DmaChannel, C: Codec
    {
        if !self.playing {
            return true;
        }
        for half in 0..2 {
            if let Some(mut buffer) = self.empty[half].take() {
                let count = self.fill(&mut buffer);
                if count == 0 {
                    self.empty[half] = Some(buffer);
                    continue;
                }
                // A refused half is refilled from the same block next time.
                match sound.buffer_play(buffer, count) {
                    Ok(()) => self.data = &self.data[count..],
                    Err(buffer) => self.empty[half] = Some(buffer),
                }
            }
        }
        if self.data.is_empty() {
            self.playing = false;
            return true;
        }
        false
    }

    /// Take back a half the `Sound` driver has finished with. A buffer that
    /// is not one of this player's halves is handed back untouched.
    pub fn buffer_released(&mut self, buffer: B) -> Result<(), B> {
        let address = buffer.as_ptr() as usize;
        let half = match self.addresses.iter().position(|&a| a == address) {
            Some(half) if self.empty[half].is_none() => half,
            _ => {
                #[cfg(feature = "defmt")]
                defmt::warn!("wav: ignoring foreign buffer at {=usize:x}", address);
                return Err(buffer);
            }
        };
        self.empty[half] = Some(buffer);
        self.bytes_played = self.bytes_played.saturating_add(HALF_BUFFER_SIZE as u32);
        Ok(())
    }

    /// Stop queueing new blocks. Halves already queued still play out.
    pub fn stop(&mut self) {
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Whether both halves are back with the player.
    pub fn is_drained(&self) -> bool {
        self.empty.iter().all(Option::is_some)
    }

    /// Elapsed and total play time, as `m:ss/m:ss`.
    pub fn time_string(&self) -> TimeString {
        let total = self.header.map(|h| h.duration_seconds()).unwrap_or(0);
        let elapsed = self.bytes_played.checked_div(self.byte_rate).unwrap_or(0).min(total);
        let mut s = TimeString::new();
        let _ = write!(s, "{}:{:02}/{}:{:02}", elapsed / 60, elapsed % 60, total / 60, total % 60);
        s
    }

    /// Copy the next block into `buffer` without consuming it.
    fn fill(&self, buffer: &mut [u8]) -> usize {
        let n = self.data.len().min(self.max_buffer).min(buffer.len());
        buffer[..n].copy_from_slice(&self.data[..n]);
        if self.header.map(|h| h.bits_per_sample) == Some(8) {
            convert_8bit(&mut buffer[..n]);
        }
        n
    }
}
