// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Debounced push buttons with auto-repeat.
//!
//! `Buttons::poll` should be called at a steady rate, typically every 10ms.
//! A level change has to be stable for four polls before it is reported.

use crate::hal::gpio::ButtonPort;

pub const UP_BUTTON: u8 = 0x01;
pub const DOWN_BUTTON: u8 = 0x02;
pub const LEFT_BUTTON: u8 = 0x04;
pub const RIGHT_BUTTON: u8 = 0x08;
pub const SELECT_BUTTON: u8 = 0x10;
pub const ALL_BUTTONS: u8 = UP_BUTTON | DOWN_BUTTON | LEFT_BUTTON | RIGHT_BUTTON | SELECT_BUTTON;

const NUM_BUTTONS: usize = 5;

/// Polls a button must be held before it first repeats.
pub const DEFAULT_INITIAL_TICKS: u8 = 50;
/// Polls between subsequent repeats.
pub const DEFAULT_REPEAT_TICKS: u8 = 5;

/// Result of one poll. All fields are bitmasks of the `*_BUTTON` values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ButtonEvent {
    /// Debounced levels, 0 for pressed.
    pub state: u8,
    /// Buttons whose debounced level changed on this poll.
    pub delta: u8,
    /// Held buttons due an auto-repeat on this poll.
    pub repeat: u8,
}

impl ButtonEvent {
    pub fn is_down(&self, button: u8) -> bool {
        self.state & button == 0
    }

    pub fn pressed(&self, button: u8) -> bool {
        self.delta & button != 0 && self.is_down(button)
    }

    pub fn released(&self, button: u8) -> bool {
        self.delta & button != 0 && !self.is_down(button)
    }

    /// Newly pressed or repeating.
    pub fn activated(&self, button: u8) -> bool {
        self.pressed(button) || self.repeat & button != 0
    }
}

#[derive(Copy, Clone)]
struct RepeatInfo {
    button: u8,
    count: u8,
    initial: u8,
    repeat: u8,
}

impl RepeatInfo {
    const fn new(button: u8) -> Self {
        RepeatInfo { button, count: 0, initial: DEFAULT_INITIAL_TICKS, repeat: DEFAULT_REPEAT_TICKS }
    }
}

pub struct Buttons<P> {
    port: P,
    /// Two-bit vertical counter, one bit of each per button.
    clock_a: u8,
    clock_b: u8,
    state: u8,
    info: [RepeatInfo; NUM_BUTTONS],
}

impl<P: ButtonPort> Buttons<P> {
    /// Takes the current pin levels as the starting debounced state.
    pub fn new(port: P) -> Self {
        let state = port.read() & ALL_BUTTONS;
        Buttons {
            port,
            clock_a: 0,
            clock_b: 0,
            state,
            info: [
                RepeatInfo::new(UP_BUTTON),
                RepeatInfo::new(DOWN_BUTTON),
                RepeatInfo::new(LEFT_BUTTON),
                RepeatInfo::new(RIGHT_BUTTON),
                RepeatInfo::new(SELECT_BUTTON),
            ],
        }
    }

    pub fn poll(&mut self) -> ButtonEvent {
        let data = self.port.read() & ALL_BUTTONS;
        let mut delta = data ^ self.state;

        // Count up to four consecutive polls for each changed bit, resetting
        // any bit that matches the debounced state again.
        self.clock_a ^= self.clock_b;
        self.clock_b = !self.clock_b;
        self.clock_a &= delta;
        self.clock_b &= delta;
        let counting = self.clock_a | self.clock_b;
        self.state &= counting;
        self.state |= !counting & data;
        delta ^= counting;

        let mut repeat = 0;
        for info in self.info.iter_mut() {
            if self.state & info.button != 0 {
                continue;
            }
            if delta & info.button != 0 {
                info.count = info.initial;
            }
            if info.count == 0 && info.repeat != 0 {
                repeat |= info.button;
                info.count = info.repeat;
            }
            info.count = info.count.wrapping_sub(1);
        }

        ButtonEvent { state: self.state, delta, repeat }
    }

    /// Set the repeat timing, in polls, for every button in `buttons`.
    /// A `repeat` of 0 disables auto-repeat.
    pub fn set_auto_repeat(&mut self, buttons: u8, initial: u8, repeat: u8) {
        for info in self.info.iter_mut().filter(|info| buttons & info.button != 0) {
            info.initial = initial;
            info.repeat = repeat;
            info.count = initial;
        }
    }

    /// Debounced levels as of the last poll.
    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn release(self) -> P {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakePort(Cell<u8>);

    impl ButtonPort for FakePort {
        fn read(&self) -> u8 {
            self.0.get()
        }
    }

    fn buttons() -> Buttons<FakePort> {
        Buttons::new(FakePort(Cell::new(0xFF)))
    }

    /// Poll `n` times, returning the poll numbers (from 1) at which `check`
    /// held.
    fn polls_where<F: Fn(&ButtonEvent) -> bool>(b: &mut Buttons<FakePort>, n: usize, check: F)
        -> Vec<usize>
    {
        (1..=n).filter(|_| check(&b.poll())).collect()
    }

    #[test]
    fn starts_from_pin_levels() {
        let b = Buttons::new(FakePort(Cell::new(!SELECT_BUTTON)));
        assert_eq!(b.state(), ALL_BUTTONS & !SELECT_BUTTON);
    }

    #[test]
    fn press_needs_four_stable_polls() {
        let mut b = buttons();
        b.port.0.set(!LEFT_BUTTON);
        for _ in 0..3 {
            let e = b.poll();
            assert_eq!(e.delta, 0);
            assert_eq!(e.state, ALL_BUTTONS);
        }
        let e = b.poll();
        assert!(e.pressed(LEFT_BUTTON));
        assert_eq!(e.state, ALL_BUTTONS & !LEFT_BUTTON);
        assert_eq!(b.poll().delta, 0);

        b.port.0.set(0xFF);
        assert_eq!(polls_where(&mut b, 6, |e| e.released(LEFT_BUTTON)), vec![4]);
    }

    #[test]
    fn bounce_resets_count() {
        let mut b = buttons();
        b.port.0.set(!UP_BUTTON);
        b.poll();
        b.poll();
        b.port.0.set(0xFF);
        b.poll();
        b.port.0.set(!UP_BUTTON);
        assert_eq!(polls_where(&mut b, 6, |e| e.pressed(UP_BUTTON)), vec![4]);
    }

    #[test]
    fn default_repeat_timing() {
        let mut b = buttons();
        b.port.0.set(!DOWN_BUTTON);
        let repeats = polls_where(&mut b, 70, |e| e.repeat & DOWN_BUTTON != 0);
        assert_eq!(repeats, vec![54, 59, 64, 69]);
    }

    #[test]
    fn repeat_configurable() {
        let mut b = buttons();
        b.set_auto_repeat(RIGHT_BUTTON, 10, 2);
        b.set_auto_repeat(SELECT_BUTTON, 10, 0);
        b.port.0.set(!(RIGHT_BUTTON | SELECT_BUTTON));
        let mut right = Vec::new();
        for n in 1..=20 {
            let e = b.poll();
            assert_eq!(e.repeat & SELECT_BUTTON, 0);
            if e.repeat & RIGHT_BUTTON != 0 {
                right.push(n);
            }
        }
        assert_eq!(right, vec![14, 16, 18, 20]);
    }

    #[test]
    fn event_helpers() {
        let e = ButtonEvent { state: !UP_BUTTON & ALL_BUTTONS, delta: UP_BUTTON | DOWN_BUTTON,
                              repeat: LEFT_BUTTON };
        assert!(e.pressed(UP_BUTTON));
        assert!(e.released(DOWN_BUTTON));
        assert!(e.activated(LEFT_BUTTON));
        assert!(!e.activated(DOWN_BUTTON));
        assert!(e.is_down(UP_BUTTON));
    }
}
