// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Simple songs played as triangle waves.
//!
//! Each note fills a buffer with one period of a triangle wave and queues it
//! over and over until the note's duration has elapsed. Two buffers keep the
//! ping-pong transfer fed.

use core::ops::DerefMut;
use stable_deref_trait::StableDeref;

use crate::hal::dma::DmaChannel;
use crate::hal::i2s::I2sTx;
use crate::sound::{Codec, Sound};

pub const TONE_SAMPLE_RATE: u32 = 48000;
pub const TONE_BITS: u16 = 16;
pub const TONE_CHANNELS: u16 = 2;

/// Most samples one tone buffer holds.
pub const TONE_SAMPLES: usize = 512;
/// Bytes in a full tone buffer, one 16-bit stereo pair per sample.
pub const TONE_BUFFER_BYTES: usize = TONE_SAMPLES * 4;

/// `(duration_ms, frequency_hz)`. A frequency of 0 is a rest and is skipped.
pub type Note = (u16, u16);

struct Triangle {
    sample: i32,
    step: i32,
    rising: bool,
}

impl Triangle {
    fn new(frequency: u16) -> Self {
        let step = (65536 * 2 * frequency as u64 / TONE_SAMPLE_RATE as u64) as i32;
        Triangle { sample: 0, step, rising: true }
    }

    /// Next sample, copied to both channels.
    fn next(&mut self) -> u32 {
        if self.rising {
            self.sample += self.step;
            if self.sample >= 32767 {
                self.rising = false;
                self.sample = 32768 - self.step;
            }
        } else {
            self.sample -= self.step;
            if self.sample <= -32768 {
                self.rising = true;
                self.sample = self.step - 32768;
            }
        }
        let s = self.sample as u32;
        (s & 0xFFFF) | (s << 16)
    }
}

/// Samples in one period of `frequency`, capped to a full tone buffer.
fn period_samples(frequency: u16) -> usize {
    if frequency == 0 {
        return 0;
    }
    ((TONE_SAMPLE_RATE / frequency as u32) as usize).clamp(1, TONE_SAMPLES)
}

/// Write one period of a triangle wave at `frequency` into `buf` as 16-bit
/// stereo samples. Returns the number of bytes written.
pub fn fill_tone(buf: &mut [u8], frequency: u16) -> usize {
    let samples = period_samples(frequency).min(buf.len() / 4);
    let mut wave = Triangle::new(frequency);
    for chunk in buf[..samples * 4].chunks_exact_mut(4) {
        chunk.copy_from_slice(&wave.next().to_le_bytes());
    }
    samples * 4
}

/// Plays a song through a `Sound`, feeding released buffers back in.
pub struct TonePlayer<'a, B> {
    spare: heapless::Vec<B, 2>,
    /// Addresses of the buffers already holding the current note.
    generated: heapless::Vec<usize, 2>,
    song: &'a [Note],
    next: usize,
    frequency: u16,
    size: usize,
    remaining: u32,
    playing: bool,
}

impl<'a, B> TonePlayer<'a, B>
    where B: StableDeref + DerefMut<Target = [u8]> + 'static
{
    /// Both buffers should hold at least `TONE_BUFFER_BYTES`.
    pub fn new(buffers: [B; 2]) -> Self {
        let [a, b] = buffers;
        let mut spare = heapless::Vec::new();
        let _ = spare.push(a);
        let _ = spare.push(b);
        TonePlayer {
            spare,
            generated: heapless::Vec::new(),
            song: &[],
            next: 0,
            frequency: 0,
            size: 0,
            remaining: 0,
            playing: false,
        }
    }

    /// Start playing `song`, replacing anything already playing.
    pub fn play<I, D, C>(&mut self, sound: &mut Sound<I, D, C, B>, song: &'a [Note])
        where I: I2sTx, D: DmaChannel, C: Codec
    {
        self.stop(sound);
        sound.set_format(TONE_SAMPLE_RATE, TONE_BITS, TONE_CHANNELS);
        self.song = song;
        self.next = 0;
        self.playing = true;
        while let Some(buffer) = self.spare.pop() {
            if let Some(buffer) = self.queue(sound, buffer) {
                let _ = self.spare.push(buffer);
                break;
            }
        }
        self.check_finished(sound);
    }

    /// Hand back a buffer `Sound::interrupt` released.
    pub fn buffer_released<I, D, C>(&mut self, sound: &mut Sound<I, D, C, B>, buffer: B)
        where I: I2sTx, D: DmaChannel, C: Codec
    {
        let buffer = if self.playing { self.queue(sound, buffer) } else { Some(buffer) };
        if let Some(buffer) = buffer {
            let _ = self.spare.push(buffer);
        }
        self.check_finished(sound);
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Stop output, reclaiming any queued buffers.
    pub fn stop<I, D, C>(&mut self, sound: &mut Sound<I, D, C, B>)
        where I: I2sTx, D: DmaChannel, C: Codec
    {
        for buffer in sound.disable() {
            let _ = self.spare.push(buffer);
        }
        self.playing = false;
        self.remaining = 0;
        self.generated.clear();
    }

    /// Queue `buffer` with the current note, moving on to the next note when
    /// this one is done. Gives the buffer back when there is nothing left.
    fn queue<I, D, C>(&mut self, sound: &mut Sound<I, D, C, B>, mut buffer: B) -> Option<B>
        where I: I2sTx, D: DmaChannel, C: Codec
    {
        if self.remaining == 0 && !self.advance() {
            return Some(buffer);
        }
        let address = buffer.as_ptr() as usize;
        if !self.generated.contains(&address) {
            fill_tone(&mut buffer, self.frequency);
            let _ = self.generated.push(address);
        }
        match sound.buffer_play(buffer, self.size) {
            Ok(()) => {
                self.remaining -= 1;
                None
            },
            Err(buffer) => Some(buffer),
        }
    }

    /// Load the next playable note. Returns false at the end of the song.
    fn advance(&mut self) -> bool {
        while let Some(&(duration, frequency)) = self.song.get(self.next) {
            self.next += 1;
            let periods = duration as u32 * frequency as u32 / 1000;
            if frequency == 0 || periods == 0 {
                continue;
            }
            #[cfg(feature = "defmt")]
            defmt::debug!("tone: {} Hz for {} ms", frequency, duration);
            self.frequency = frequency;
            self.size = period_samples(frequency) * 4;
            self.remaining = periods;
            self.generated.clear();
            return true;
        }
        false
    }

    /// Once the song is over and both buffers are home, stop the transmitter.
    fn check_finished<I, D, C>(&mut self, sound: &mut Sound<I, D, C, B>)
        where I: I2sTx, D: DmaChannel, C: Codec
    {
        if self.playing && self.remaining == 0 && self.spare.is_full() {
            self.playing = false;
            for buffer in sound.disable() {
                let _ = self.spare.push(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::dma::Slot;
    use crate::sound::fakes::*;

    fn word(buf: &[u8], index: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[index * 4..index * 4 + 4]);
        u32::from_le_bytes(b)
    }

    fn stereo(s: i32) -> u32 {
        let s = s as u32;
        (s & 0xFFFF) | (s << 16)
    }

    #[test]
    fn triangle_period() {
        let mut buf = [0u8; TONE_BUFFER_BYTES];
        assert_eq!(fill_tone(&mut buf, 1000), 48 * 4);
        // 1 kHz steps by 2730 per sample and turns over on the 13th.
        assert_eq!(word(&buf, 0), stereo(2730));
        assert_eq!(word(&buf, 11), stereo(2730 * 12));
        assert_eq!(word(&buf, 12), stereo(32768 - 2730));
        assert_eq!(word(&buf, 13), stereo(32768 - 2 * 2730));
        assert_eq!(word(&buf, 30), stereo(32768 - 19 * 2730));
    }

    #[test]
    fn low_tones_capped() {
        let mut buf = [0u8; TONE_BUFFER_BYTES];
        assert_eq!(fill_tone(&mut buf, 50), TONE_BUFFER_BYTES);
        let mut small = [0u8; 40];
        assert_eq!(fill_tone(&mut small, 50), 40);
        assert_eq!(fill_tone(&mut buf, 0), 0);
    }

    /// Release whatever the fake controller holds, feeding it back in.
    fn run(sound: &mut FakeSound, player: &mut TonePlayer<Buffer>) -> usize {
        let mut rounds = 0;
        while player.is_playing() {
            sound.dma_mut().finish(Slot::Primary);
            sound.dma_mut().finish(Slot::Alternate);
            for buffer in sound.interrupt() {
                player.buffer_released(sound, buffer);
            }
            rounds += 1;
            assert!(rounds < 1000);
        }
        rounds
    }

    #[test]
    fn whole_song_plays() {
        let mut sound = sound();
        let mut player = TonePlayer::new([buffer(TONE_BUFFER_BYTES), buffer(TONE_BUFFER_BYTES)]);
        // 10 periods of 1 kHz, a rest, then 3 periods of 500 Hz.
        let song = [(10, 1000), (100, 0), (6, 500)];
        player.play(&mut sound, &song);
        assert!(player.is_playing());
        run(&mut sound, &mut player);

        let transfers = &sound.dma_ref().transfers;
        assert_eq!(transfers.len(), 13);
        assert!(transfers[..10].iter().all(|t| t.3 == 48));
        assert!(transfers[10..].iter().all(|t| t.3 == 96));
        assert!(!sound.is_busy());
        assert!(!sound.i2s_ref().enabled);
    }

    #[test]
    fn empty_song_finishes_immediately() {
        let mut sound = sound();
        let mut player = TonePlayer::new([buffer(TONE_BUFFER_BYTES), buffer(TONE_BUFFER_BYTES)]);
        player.play(&mut sound, &[(0, 440), (500, 0)]);
        assert!(!player.is_playing());
        assert!(sound.dma_ref().transfers.is_empty());
    }

    #[test]
    fn stop_reclaims_buffers() {
        let mut sound = sound();
        let mut player = TonePlayer::new([buffer(TONE_BUFFER_BYTES), buffer(TONE_BUFFER_BYTES)]);
        let song = [(1000, 440)];
        player.play(&mut sound, &song);
        assert_eq!(sound.dma_ref().transfers.len(), 2);
        player.stop(&mut sound);
        assert!(!player.is_playing());
        assert!(!sound.is_busy());

        // Both buffers are back, so a new song can start straight away.
        player.play(&mut sound, &song);
        assert_eq!(sound.dma_ref().transfers.len(), 4);
    }
}
