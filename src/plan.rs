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

//! Splitting a payload into an ordered list of frames

use crate::frame::{Frame, FrameError};
use crate::protocol::{BLOCK_1024, next_seq};

/// Header flag: receiver skips the read-back check after each write
pub const FLAG_NO_VERIFY: u32 = 1 << 0;

/// Placement metadata sent as the first frame to a flashing receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashHeader {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

impl FlashHeader {
    pub const LEN: usize = 12;

    pub fn new(offset: u32, size: u32, verify: bool) -> Self {
        let flags = if verify { 0 } else { FLAG_NO_VERIFY };
        FlashHeader { offset, size, flags }
    }

    pub fn skip_verify(&self) -> bool {
        self.flags & FLAG_NO_VERIFY != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.offset.to_be_bytes());
        out[4..8].copy_from_slice(&self.size.to_be_bytes());
        out[8..12].copy_from_slice(&self.flags.to_be_bytes());
        out
    }

    /// Decode the header from the start of a received block
    pub fn from_block(block: &[u8]) -> Option<Self> {
        let field = |at: usize| -> Option<u32> {
            Some(u32::from_be_bytes(block.get(at..at + 4)?.try_into().ok()?))
        };
        Some(FlashHeader {
            offset: field(0)?,
            size: field(4)?,
            flags: field(8)?,
        })
    }
}

/// Every frame of one transfer, in the only order the receiver accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    frames: Vec<Frame>,
}

impl TransferPlan {
    pub fn new(payload: &[u8], header: Option<&FlashHeader>) -> Result<Self, FrameError> {
        let mut frames = Vec::with_capacity(payload.len().div_ceil(BLOCK_1024) + 1);
        let mut seq: u8 = 1;

        if let Some(header) = header {
            frames.push(Frame::build(&header.to_bytes(), seq)?);
            seq = next_seq(seq);
        }

        for chunk in payload.chunks(BLOCK_1024) {
            frames.push(Frame::build(chunk, seq)?);
            seq = next_seq(seq);
        }

        Ok(TransferPlan { frames })
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
