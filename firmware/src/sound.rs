// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Ping-pong audio output through the I2S transmitter.
//!
//! Two uDMA descriptors feed the transmit FIFO in turn. `buffer_play` hands
//! a buffer to whichever descriptor is next; once the controller has
//! finished with it, `interrupt` returns it to the caller so it can be
//! refilled and queued again.

use core::ops::Deref;
use stable_deref_trait::StableDeref;

use crate::hal::dma::{DataSize, DmaChannel, DmaControl, Slot};
use crate::hal::i2s::{I2sFormat, I2sTx, MclkConfig};

/// Audio codec sitting on the far end of the I2S bus.
pub trait Codec {
    type Error;

    fn init(&mut self) -> Result<(), Self::Error>;

    /// Output volume as a percentage, 0 to 100.
    fn set_volume(&mut self, percent: u8) -> Result<(), Self::Error>;
}

/// FIFO level at which the transmitter asks for more data.
const TX_FIFO_LIMIT: u8 = 4;

pub const DEFAULT_VOLUME: u8 = 100;

/// PCM format of the samples being played.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Format {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl Format {
    pub fn i2s(&self) -> I2sFormat {
        I2sFormat::for_samples(self.bits_per_sample, self.channels)
    }

    /// Control word and element count to move `len` bytes into the FIFO.
    /// Each element is one FIFO entry, so stereo pairs travel together.
    pub fn dma(&self, len: usize) -> (DmaControl, usize) {
        let (size, count) = match (self.channels, self.bits_per_sample) {
            (1, 8) => (DataSize::Bits8, len),
            (1, _) | (_, 8) => (DataSize::Bits16, len >> 1),
            _ => (DataSize::Bits32, len >> 2),
        };
        (DmaControl::memory_to_fifo(size), count)
    }
}

impl Default for Format {
    fn default() -> Self {
        Format { sample_rate: 48000, bits_per_sample: 16, channels: 2 }
    }
}

/// Buffers handed back from the DMA controller.
pub type Released<B> = heapless::Vec<B, 2>;

pub struct Sound<I, D, C, B> {
    i2s: I,
    dma: D,
    codec: C,
    slots: [Option<B>; 2],
    next: Slot,
    pending: bool,
    format: Format,
    volume: u8,
}

impl<I, D, C, B> Sound<I, D, C, B>
    where I: I2sTx, D: DmaChannel, C: Codec,
          B: StableDeref + Deref<Target = [u8]> + 'static
{
    pub fn new(i2s: I, dma: D, codec: C) -> Self {
        Sound {
            i2s, dma, codec,
            slots: [None, None],
            next: Slot::Primary,
            pending: false,
            format: Format::default(),
            volume: DEFAULT_VOLUME,
        }
    }

    /// Bring up the codec and the transmitter, leaving output idle in the
    /// current format.
    pub fn init(&mut self) -> Result<(), C::Error> {
        self.codec.init()?;
        self.codec.set_volume(self.volume)?;
        self.i2s.set_fifo_limit(TX_FIFO_LIMIT);
        self.i2s.clear_interrupts();
        self.dma.set_priority(false);
        let format = self.format;
        self.apply_format(format);
        Ok(())
    }

    pub fn set_format(&mut self, sample_rate: u32, bits_per_sample: u16, channels: u16) {
        self.apply_format(Format { sample_rate, bits_per_sample, channels });
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    /// Queue the first `len` bytes of `buffer` on the next ping-pong slot.
    ///
    /// If that slot still holds a buffer the controller has not released,
    /// `buffer` is returned unplayed.
    pub fn buffer_play(&mut self, buffer: B, len: usize) -> Result<(), B> {
        let slot = self.next;
        if self.slots[slot.index()].is_some() {
            return Err(buffer);
        }
        let len = len.min(buffer.len());
        let (control, count) = self.format.dma(len);
        let source = buffer.as_ptr();
        self.slots[slot.index()] = Some(buffer);

        self.dma.set_priority(true);
        self.dma.start(slot, control, source, count);
        self.pending = true;
        self.next = slot.other();
        self.i2s.enable();
        Ok(())
    }

    /// Service the I2S interrupt, returning any buffers the controller has
    /// finished with.
    pub fn interrupt(&mut self) -> Released<B> {
        self.i2s.clear_interrupts();
        let mut released = Released::new();
        if !self.pending {
            return released;
        }
        for &slot in &[Slot::Primary, Slot::Alternate] {
            if self.slots[slot.index()].is_some() && self.dma.is_stopped(slot) {
                if let Some(buffer) = self.slots[slot.index()].take() {
                    #[cfg(feature = "defmt")]
                    defmt::trace!("sound: released {}", slot);
                    let _ = released.push(buffer);
                }
            }
        }
        if self.slots.iter().all(Option::is_none) {
            self.pending = false;
        }
        released
    }

    /// Whether any queued buffer has yet to be released.
    pub fn is_busy(&self) -> bool {
        self.pending
    }

    /// Stop output and return any buffers still queued.
    pub fn disable(&mut self) -> Released<B> {
        self.i2s.disable();
        self.dma.disable();
        self.pending = false;
        self.next = Slot::Primary;
        let mut released = Released::new();
        for slot in self.slots.iter_mut() {
            if let Some(buffer) = slot.take() {
                let _ = released.push(buffer);
            }
        }
        released
    }

    pub fn volume_set(&mut self, percent: u8) -> Result<(), C::Error> {
        self.volume = percent.min(100);
        self.codec.set_volume(self.volume)
    }

    pub fn volume_get(&self) -> u8 {
        self.volume
    }

    pub fn volume_up(&mut self, step: u8) -> Result<(), C::Error> {
        self.volume_set(self.volume.saturating_add(step))
    }

    pub fn volume_down(&mut self, step: u8) -> Result<(), C::Error> {
        self.volume_set(self.volume.saturating_sub(step))
    }

    fn apply_format(&mut self, format: Format) {
        self.format = format;
        self.i2s.configure(format.i2s(), MclkConfig::for_rate(format.sample_rate));
    }
}
