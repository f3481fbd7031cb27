// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

/// How samples are packed into the transmit FIFO.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2sMode {
    /// One 8 bit mono sample per FIFO entry.
    Mono,
    /// Two 8 bit samples per FIFO entry.
    Compact8,
    /// Two 16 bit samples per FIFO entry.
    Compact16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleSize {
    Bits8,
    Bits16,
}

/// Transmit configuration. The framing is always standard I2S with the
/// controller as clock master, 32 bit wire words, and zeros sent when the
/// FIFO runs empty.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2sFormat {
    pub mode: I2sMode,
    pub sample_size: SampleSize,
}

impl I2sFormat {
    pub fn for_samples(bits_per_sample: u16, channels: u16) -> Self {
        match (channels, bits_per_sample) {
            (1, 8) => I2sFormat { mode: I2sMode::Mono, sample_size: SampleSize::Bits8 },
            (_, 8) => I2sFormat { mode: I2sMode::Compact8, sample_size: SampleSize::Bits8 },
            _ => I2sFormat { mode: I2sMode::Compact16, sample_size: SampleSize::Bits16 },
        }
    }
}

/// Master clock divider from the 8 MHz reference, as integer and
/// fractional parts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MclkConfig {
    pub integer: u8,
    pub fraction: u8,
}

impl MclkConfig {
    const TX_ENABLE: u32 = 1 << 12;
    const RX_SHIFT: u32 = 16;

    /// Rates other than 48 kHz, 44.1 kHz and 22 kHz fall back to 11 kHz.
    pub fn for_rate(sample_rate: u32) -> Self {
        let (integer, fraction) = match sample_rate {
            48000 => (32, 8),
            44100 => (35, 7),
            22222 | 22050 => (70, 13),
            _ => (141, 11),
        };
        MclkConfig { integer, fraction }
    }

    /// Value for the system control MCLK configuration register, with the
    /// same divider enabled for transmit and receive.
    pub fn register_value(self) -> u32 {
        let tx = Self::TX_ENABLE | ((self.integer as u32) << 4) | (self.fraction as u32 & 0xF);
        tx | (tx << Self::RX_SHIFT)
    }
}

/// The I2S transmitter.
pub trait I2sTx {
    fn configure(&mut self, format: I2sFormat, mclk: MclkConfig);

    /// FIFO level at which a transmit request is raised.
    fn set_fifo_limit(&mut self, limit: u8);

    fn enable(&mut self);
    fn disable(&mut self);

    /// Clear any pending transmit request and error interrupts.
    fn clear_interrupts(&mut self);
}
