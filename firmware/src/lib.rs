// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Drivers for the audio and button hardware on Stellaris LM3S
//! development boards.
//!
//! Peripheral access goes through the traits in `hal`, which a board
//! support crate implements for the real register blocks.

#![cfg_attr(not(test), no_std)]

pub mod hal;
pub mod buttons;
pub mod sound;
pub mod tone;
pub mod wav;
pub mod wm8510;

pub use sound::{Codec, Format, Released, Sound};
pub use tone::{Note, TonePlayer};
pub use wav::{WaveError, WaveHeader, WavePlayer};
pub use wm8510::Wm8510;
pub use buttons::{ButtonEvent, Buttons};
