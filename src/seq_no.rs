use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Add;
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A 31 bit packet sequence number with wrap-around semantics.
///
/// Sequence numbers are compared by their distance rather than by their raw value: two numbers
///  less than half the sequence space apart are ordered by raw value, otherwise the comparison
///  is reversed because one of them has wrapped around.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SeqNo(u32);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNo {
    pub const MAX_RAW: u32 = 0x7FFF_FFFF;
    const THRESHOLD: i64 = 0x4000_0000;
    const SPACE: i64 = Self::MAX_RAW as i64 + 1;

    pub const ZERO: SeqNo = SeqNo(0);

    /// NB: Only the lower 31 bits are used
    pub fn from_raw(value: u32) -> SeqNo {
        SeqNo(value & Self::MAX_RAW)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// the signed number of steps from `self` to `other`
    pub fn offset_to(&self, other: SeqNo) -> i32 {
        let diff = other.0 as i64 - self.0 as i64;
        let diff = if diff.abs() < Self::THRESHOLD {
            diff
        }
        else if diff > 0 {
            diff - Self::SPACE
        }
        else {
            diff + Self::SPACE
        };
        diff as i32
    }

    pub fn cmp_seq(&self, other: SeqNo) -> Ordering {
        0.cmp(&self.offset_to(other))
    }
}

impl Add<u32> for SeqNo {
    type Output = SeqNo;

    fn add(self, rhs: u32) -> SeqNo {
        SeqNo(self.0.wrapping_add(rhs) & Self::MAX_RAW)
    }
}


/// Position of a packet inside its message
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketBoundary {
    Subsequent = 0,
    Last = 1,
    First = 2,
    Solo = 3,
}

impl PacketBoundary {
    pub fn starts_message(&self) -> bool {
        matches!(self, PacketBoundary::First | PacketBoundary::Solo)
    }

    pub fn ends_message(&self) -> bool {
        matches!(self, PacketBoundary::Last | PacketBoundary::Solo)
    }

    pub fn for_position(index: usize, num_packets: usize) -> PacketBoundary {
        match (index == 0, index + 1 == num_packets) {
            (true, true) => PacketBoundary::Solo,
            (true, false) => PacketBoundary::First,
            (false, true) => PacketBoundary::Last,
            (false, false) => PacketBoundary::Subsequent,
        }
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    struct MsgNoFlags: u32 {
        const MASK_BOUNDARY  = 0xC000_0000;
        const IN_ORDER       = 0x2000_0000;
        const MASK_KEY       = 0x1800_0000;
        const REXMIT         = 0x0400_0000;
        const MASK_SEQ       = 0x03FF_FFFF;
        /// message sequence of a peer that does not use the rexmit flag
        const MASK_SEQ_WIDE  = 0x07FF_FFFF;
    }
}

/// The message number field of a data packet: message sequence number plus boundary, ordering,
///  key and retransmission flags.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct MsgNo(u32);

impl Debug for MsgNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg {} {:?}{}{}",
            self.seq(true),
            self.boundary(),
            if self.in_order() { " in-order" } else { "" },
            if self.is_rexmit() { " rexmit" } else { "" },
        )
    }
}

impl MsgNo {
    pub const MAX_SEQ: u32 = MsgNoFlags::MASK_SEQ.bits();

    pub fn from_raw(raw: u32) -> MsgNo {
        MsgNo(raw)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn new(seq: u32, boundary: PacketBoundary, in_order: bool) -> MsgNo {
        assert!(seq <= Self::MAX_SEQ);

        let mut raw = seq | ((u8::from(boundary) as u32) << 30);
        if in_order {
            raw |= MsgNoFlags::IN_ORDER.bits();
        }
        MsgNo(raw)
    }

    /// the message sequence number that follows `seq`: sequence numbers start at 1 and skip 0
    ///  on wrap-around
    pub fn next_seq(seq: u32) -> u32 {
        if seq >= Self::MAX_SEQ {
            1
        }
        else {
            seq + 1
        }
    }

    pub fn boundary(&self) -> PacketBoundary {
        PacketBoundary::try_from((self.0 >> 30) as u8)
            .expect("two bits always map to a boundary")
    }

    pub fn in_order(&self) -> bool {
        self.flags().contains(MsgNoFlags::IN_ORDER)
    }

    pub fn is_rexmit(&self) -> bool {
        self.flags().contains(MsgNoFlags::REXMIT)
    }

    pub fn with_rexmit(&self) -> MsgNo {
        MsgNo(self.0 | MsgNoFlags::REXMIT.bits())
    }

    /// encryption key flags, carried through without interpretation
    pub fn key_flags(&self) -> u32 {
        (self.0 & MsgNoFlags::MASK_KEY.bits()) >> 27
    }

    /// The message sequence number. A peer that does not use the rexmit flag has one more bit
    ///  for it.
    pub fn seq(&self, using_rexmit_flag: bool) -> u32 {
        if using_rexmit_flag {
            self.0 & MsgNoFlags::MASK_SEQ.bits()
        }
        else {
            self.0 & MsgNoFlags::MASK_SEQ_WIDE.bits()
        }
    }

    fn flags(&self) -> MsgNoFlags {
        MsgNoFlags::from_bits_retain(self.0)
    }
}
