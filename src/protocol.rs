// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! XMODEM-1k protocol constants

/// Size of a short data block
pub const BLOCK_128: usize = 128;

/// Size of a long data block, also the largest chunk a frame can carry
pub const BLOCK_1024: usize = 1024;

/// Start byte, sequence number, its complement
pub const FRAME_PREFIX_LEN: usize = 3;

/// CRC high byte, CRC low byte
pub const FRAME_SUFFIX_LEN: usize = 2;

/// Generator polynomial used for every frame checksum
pub const CRC_POLYNOMIAL: u16 = 0x1021;

/// Single-byte control characters exchanged on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    /// Start of header - begins a frame carrying a 128-byte block
    Soh = 0x01,
    /// Start of text - begins a frame carrying a 1024-byte block
    Stx = 0x02,
    /// End of transmission - sender has no more frames
    Eot = 0x04,
    /// Acknowledge - receiver accepted the last frame
    Ack = 0x06,
    /// Negative acknowledge - receiver rejected the last frame
    Nak = 0x15,
    /// Cancel - receiver aborts the transfer
    Can = 0x18,
    /// Ready ('C') - receiver waits for the first frame in CRC mode
    Ready = 0x43,
}

impl Control {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Control::Soh),
            0x02 => Some(Control::Stx),
            0x04 => Some(Control::Eot),
            0x06 => Some(Control::Ack),
            0x15 => Some(Control::Nak),
            0x18 => Some(Control::Can),
            0x43 => Some(Control::Ready),
            _ => None,
        }
    }

    /// Padded block length announced by a start byte
    pub fn block_len(self) -> Option<usize> {
        match self {
            Control::Soh => Some(BLOCK_128),
            Control::Stx => Some(BLOCK_1024),
            _ => None,
        }
    }
}

/// Next sequence number after `seq`. Wraps from 255 to 0, not back to 1.
pub const fn next_seq(seq: u8) -> u8 {
    seq.wrapping_add(1)
}
