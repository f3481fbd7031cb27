// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

/// Size of each element moved by the uDMA controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum DataSize {
    Bits8 = 0,
    Bits16 = 1,
    Bits32 = 2,
}

/// One half of a ping-pong channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Slot {
    Primary = 0,
    Alternate = 1,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::Primary => Slot::Alternate,
            Slot::Alternate => Slot::Primary,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// uDMA channel control word.
///
/// Layout: DSTINC[31:30], DSTSIZE[29:28], SRCINC[27:26], SRCSIZE[25:24],
/// ARBSIZE[17:14]. Transfer mode and count are programmed separately.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaControl(u32);

impl DmaControl {
    const DST_INC_NONE: u32 = 3 << 30;
    const ARB_4: u32 = 2 << 14;

    /// Incrementing memory source feeding a fixed peripheral FIFO,
    /// rearbitrating every four elements.
    pub fn memory_to_fifo(size: DataSize) -> Self {
        let s = size as u32;
        DmaControl(Self::DST_INC_NONE | (s << 28) | (s << 26) | (s << 24) | Self::ARB_4)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn size(self) -> DataSize {
        match (self.0 >> 24) & 0b11 {
            0 => DataSize::Bits8,
            1 => DataSize::Bits16,
            _ => DataSize::Bits32,
        }
    }
}

/// A uDMA channel run in ping-pong mode into a peripheral FIFO.
pub trait DmaChannel {
    /// Program `slot` to move `count` elements from `source`, then enable
    /// the channel. The memory at `source` must stay valid until
    /// `is_stopped(slot)` reports true.
    fn start(&mut self, slot: Slot, control: DmaControl, source: *const u8, count: usize);

    /// Whether the transfer mode of `slot` has gone back to stop.
    fn is_stopped(&self, slot: Slot) -> bool;

    /// Set or clear the burst and high priority attributes.
    fn set_priority(&mut self, high: bool);

    fn disable(&mut self);
}
