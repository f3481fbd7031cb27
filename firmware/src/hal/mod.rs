// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Peripheral seams the drivers are written against.
//!
//! A board support crate implements these over the LM3S register blocks;
//! the drivers only ever see the traits.

pub mod dma;
pub mod i2s;
pub mod gpio;
