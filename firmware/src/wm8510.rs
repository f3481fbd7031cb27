// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Driver for the Wolfson WM8510 mono audio codec, controlled over I2C.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use num_enum::IntoPrimitive;

use crate::sound::Codec;

/// 7-bit I2C address with the CSB pin tied low.
pub const I2C_ADDRESS: u8 = 0x1A;

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Register {
    Reset = 0x00,
    Power1 = 0x01,
    Power2 = 0x02,
    Power3 = 0x03,
    AudioInterface = 0x04,
    Companding = 0x05,
    ClockControl = 0x06,
    AdditionalControl = 0x07,
    Gpio = 0x08,
    DacControl = 0x0A,
    DacVolume = 0x0B,
    AdcControl = 0x0E,
    AdcVolume = 0x0F,
    InputControl = 0x2C,
    InputPgaGain = 0x2D,
    AdcBoost = 0x2F,
    OutputControl = 0x31,
    SpeakerMixer = 0x32,
    SpeakerVolume = 0x36,
    MonoMixer = 0x38,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    I2c(E),
}

/// DAC volume register value for the most negative attenuation we use.
const DAC_VOLUME_MIN: u16 = 0x9B;
const DAC_VOLUME_MAX: u16 = 0xFF;
/// DAC volume register value which mutes the DAC.
const DAC_MUTE: u16 = 0x001;

/// Power up the reference and output stages.
const POWER_UP: [(Register, u16); 6] = [
    (Register::Reset, 0x000),
    // 16 bit I2S
    (Register::AudioInterface, 0x070),
    // CSB/GPIO is an input
    (Register::Gpio, 0x003),
    // Slave mode, MCLK is the system clock
    (Register::ClockControl, 0x000),
    // Thermal shutdown and speaker boost
    (Register::OutputControl, 0x006),
    // VMID 5k, bias and buffer enabled
    (Register::Power1, 0x10D),
];

/// Time for VMID to settle before the outputs come up.
const VMID_SETTLE_MS: u32 = 500;

/// Bring up the DAC and output path, speaker still muted.
const ENABLE: [(Register, u16); 5] = [
    (Register::InputControl, 0x000),
    (Register::Power3, 0x001),
    (Register::Power3, 0x00D),
    (Register::Power3, 0x0ED),
    (Register::SpeakerVolume, 0x079),
];

/// Route the DAC to the speaker and mono outputs and unmute.
const UNMUTE: [(Register, u16); 5] = [
    (Register::SpeakerMixer, 0x001),
    (Register::MonoMixer, 0x041),
    // 128x oversampling
    (Register::DacControl, 0x004),
    (Register::SpeakerVolume, 0x039),
    (Register::MonoMixer, 0x001),
];

/// WM8510 codec attached to an I2C bus.
pub struct Wm8510<I2C, D> {
    i2c: I2C,
    delay: D,
    enabled: bool,
    volume: u8,
}

impl<I2C: I2c, D: DelayNs> Wm8510<I2C, D> {
    pub fn new(i2c: I2C, delay: D) -> Self {
        Wm8510 { i2c, delay, enabled: false, volume: 100 }
    }

    /// Reset the codec and bring up the DAC to speaker path at full volume.
    pub fn init(&mut self) -> Result<(), Error<I2C::Error>> {
        self.enabled = false;
        self.write_all(&POWER_UP)?;
        self.delay.delay_ms(VMID_SETTLE_MS);
        self.write_all(&ENABLE)?;
        self.enabled = true;
        self.set_volume(100)?;
        self.write_all(&UNMUTE)
    }

    /// Set the DAC volume as a percentage, 0 mutes.
    ///
    /// The codec is only written once `init` has enabled it; before that the
    /// level is just remembered.
    pub fn set_volume(&mut self, percent: u8) -> Result<(), Error<I2C::Error>> {
        let percent = percent.min(100);
        self.volume = percent;
        if self.enabled {
            self.write_register(Register::DacVolume, dac_volume(percent))?;
        }
        Ok(())
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Write a 9-bit value to a register. Bit 8 of the data travels in the
    /// low bit of the first byte, after the 7-bit register address.
    pub fn write_register(&mut self, register: Register, data: u16) -> Result<(), Error<I2C::Error>> {
        let reg: u8 = register.into();
        let frame = [(reg << 1) | ((data >> 8) & 1) as u8, data as u8];
        self.i2c.write(I2C_ADDRESS, &frame).map_err(Error::I2c)
    }

    /// Return the bus and delay.
    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    fn write_all(&mut self, writes: &[(Register, u16)]) -> Result<(), Error<I2C::Error>> {
        for &(register, data) in writes {
            self.write_register(register, data)?;
        }
        Ok(())
    }
}

impl<I2C: I2c, D: DelayNs> Codec for Wm8510<I2C, D> {
    type Error = Error<I2C::Error>;

    fn init(&mut self) -> Result<(), Self::Error> {
        Wm8510::init(self)
    }

    fn set_volume(&mut self, percent: u8) -> Result<(), Self::Error> {
        Wm8510::set_volume(self, percent)
    }
}

/// Map 0 to 100 percent onto the DAC's 0.5dB attenuation steps.
fn dac_volume(percent: u8) -> u16 {
    if percent == 0 {
        DAC_MUTE
    } else {
        percent as u16 * (DAC_VOLUME_MAX - DAC_VOLUME_MIN) / 100 + DAC_VOLUME_MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    fn write(register: u8, data: u16) -> Transaction {
        Transaction::write(I2C_ADDRESS, vec![(register << 1) | (data >> 8) as u8, data as u8])
    }

    #[test]
    fn volume_mapping() {
        assert_eq!(dac_volume(0), 0x001);
        assert_eq!(dac_volume(1), 0x9C);
        assert_eq!(dac_volume(50), 0xCD);
        assert_eq!(dac_volume(100), 0xFF);
    }

    #[test]
    fn register_framing() {
        let mut i2c = Mock::new(&[
            Transaction::write(I2C_ADDRESS, vec![0x03, 0x0D]),
            Transaction::write(I2C_ADDRESS, vec![0x16, 0x9B]),
        ]);
        let mut codec = Wm8510::new(&mut i2c, NoopDelay);
        codec.write_register(Register::Power1, 0x10D).unwrap();
        codec.write_register(Register::DacVolume, 0x09B).unwrap();
        i2c.done();
    }

    #[test]
    fn init_sequence() {
        let mut i2c = Mock::new(&[
            write(0x00, 0x000),
            write(0x04, 0x070),
            write(0x08, 0x003),
            write(0x06, 0x000),
            write(0x31, 0x006),
            write(0x01, 0x10D),
            write(0x2C, 0x000),
            write(0x03, 0x001),
            write(0x03, 0x00D),
            write(0x03, 0x0ED),
            write(0x36, 0x079),
            write(0x0B, 0x0FF),
            write(0x32, 0x001),
            write(0x38, 0x041),
            write(0x0A, 0x004),
            write(0x36, 0x039),
            write(0x38, 0x001),
        ]);
        let mut codec = Wm8510::new(&mut i2c, NoopDelay);
        codec.init().unwrap();
        assert!(codec.is_enabled());
        assert_eq!(codec.volume(), 100);
        i2c.done();
    }

    #[test]
    fn volume_only_written_when_enabled() {
        let mut i2c = Mock::new(&[write(0x0B, 0x001)]);
        let mut codec = Wm8510::new(&mut i2c, NoopDelay);
        codec.set_volume(40).unwrap();
        assert_eq!(codec.volume(), 40);
        codec.enabled = true;
        codec.set_volume(0).unwrap();
        assert_eq!(codec.volume(), 0);
        i2c.done();
    }
}
