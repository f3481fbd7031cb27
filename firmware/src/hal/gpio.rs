// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

/// A GPIO port with push buttons on its low pins, pulled up so a pressed
/// button reads as 0.
pub trait ButtonPort {
    /// Current levels of the button pins.
    fn read(&self) -> u8;
}

impl<'a, P: ButtonPort> ButtonPort for &'a P {
    fn read(&self) -> u8 {
        (**self).read()
    }
}
