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

use std::marker::PhantomData;
use std::time::Duration;
use log::{debug, info, warn};
use thiserror::Error;
use crate::frame::FrameError;
use crate::plan::{FlashHeader, TransferPlan};
use crate::protocol::Control;
use crate::serial::{SerialPort, is_timeout};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("didn't receive the 'C' ready marker (got {received:02X?}), is the device waiting for firmware?")]
    NoReadyMarker { received: Vec<u8> },

    #[error("unexpected reply to chunk {index}: {} ({stray} stray bytes)", describe_reply(.reply))]
    UnexpectedReply { index: usize, reply: Option<u8>, stray: usize },

    #[error("no ACK for end of transmission: {}", describe_reply(.reply))]
    NoFinalAck { reply: Option<u8> },

    #[error("chunk {index} rejected, gave up after {retries} retries")]
    RetriesExhausted { index: usize, retries: u32 },

    #[error(transparent)]
    InvalidChunkSize(#[from] FrameError),

    #[error("I/O error (in state: {state}): {source}")]
    ChannelFault {
        state: &'static str,
        index: Option<usize>,
        #[source]
        source: std::io::Error,
    },
}

impl SenderError {
    /// Frame that was in flight when the session failed
    pub fn index(&self) -> Option<usize> {
        match self {
            SenderError::UnexpectedReply { index, .. }
            | SenderError::RetriesExhausted { index, .. } => Some(*index),
            SenderError::ChannelFault { index, .. } => *index,
            _ => None,
        }
    }
}

fn describe_reply(reply: &Option<u8>) -> String {
    match reply.map(|b| (b, Control::from_byte(b))) {
        None => "no reply".to_string(),
        Some((b, Some(c))) => format!("{:?} (0x{:02X})", c, b),
        Some((b, None)) => format!("0x{:02X}", b),
    }
}

// ============================================================================
// Configuration & Report
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait for the ready marker when nothing is buffered yet
    pub ready_timeout: Duration,
    /// Wait for the reply to each frame and to EOT
    pub ack_timeout: Duration,
    /// Pause after opening the channel before looking for the ready marker
    pub settle_delay: Duration,
    /// NAK-triggered resends per frame. 0 keeps the strict policy.
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ready_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(2),
            settle_delay: Duration::ZERO,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub frames: usize,
    pub retransmissions: usize,
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitingReady;
pub struct Sending;
pub struct AwaitingFinalAck;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    plan: TransferPlan,
    config: SessionConfig,
    index: usize,
    attempts: u32,
    retransmissions: usize,
}

// ============================================================================
// Trait
// ============================================================================

pub enum Transition {
    Next(Box<dyn SenderState>),
    Completed(TransferReport),
}

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Transition, SenderError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S: Send + 'static> SenderFsm<S> {
    fn transition<T: Send + 'static>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            plan: self.plan,
            config: self.config,
            index: self.index,
            attempts: self.attempts,
            retransmissions: self.retransmissions,
        })
    }

    fn fault(&self, e: std::io::Error, index: Option<usize>) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state = type_name.split("::").last().unwrap_or(type_name);
        SenderError::ChannelFault { state, index, source: e }
    }

    /// One reply byte, `None` when nothing arrived in time
    fn read_reply(&mut self, index: Option<usize>) -> Result<Option<u8>, SenderError> {
        let mut buf = [0u8; 1];
        match self.serial.read_timeout(&mut buf, self.config.ack_timeout) {
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(self.fault(e, index)),
        }
    }

    /// Frames are done when the plan is exhausted
    fn after_frame(self) -> Transition {
        if self.index < self.plan.len() {
            Transition::Next(self.transition::<Sending>())
        } else {
            Transition::Next(self.transition::<AwaitingFinalAck>())
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<AwaitingReady> {
    fn step(self: Box<Self>) -> Result<Transition, SenderError> {
        let mut fsm = *self;

        if !fsm.config.settle_delay.is_zero() {
            std::thread::sleep(fsm.config.settle_delay);
        }

        // Boot output may precede the marker, only the last byte counts
        let mut received = fsm.serial.drain_pending().map_err(|e| fsm.fault(e, None))?;
        if received.is_empty() {
            let mut buf = [0u8; 1];
            match fsm.serial.read_timeout(&mut buf, fsm.config.ready_timeout) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(fsm.fault(e, None)),
            }
        }

        if received.last() != Some(&Control::Ready.byte()) {
            return Err(SenderError::NoReadyMarker { received });
        }
        debug!("Received: 'C' after {} other bytes", received.len() - 1);

        Ok(fsm.after_frame())
    }
}

impl SenderState for SenderFsm<Sending> {
    fn step(self: Box<Self>) -> Result<Transition, SenderError> {
        let mut fsm = *self;
        let index = fsm.index;
        let total = fsm.plan.len();

        let frame = &fsm.plan.frames()[index];
        if let Err(e) = fsm.serial.write_all(frame.as_bytes()) {
            return Err(fsm.fault(e, Some(index)));
        }
        debug!(
            "Sent: chunk {} ({:#04x}, seq {}/{}, {} byte block, {} bytes, crc {:#06x})",
            index,
            frame.start(),
            frame.seq(),
            frame.seq_complement(),
            frame.block().len(),
            frame.len(),
            frame.crc()
        );

        let reply = fsm.read_reply(Some(index))?;
        let stray = fsm.serial.drain_pending().map_err(|e| fsm.fault(e, Some(index)))?.len();

        match reply.and_then(Control::from_byte) {
            Some(Control::Ack) if stray == 0 => {
                fsm.index += 1;
                fsm.attempts = 0;
                info!(
                    "Sent chunk {} / {} (~ {:.2}%)",
                    fsm.index,
                    total,
                    fsm.index as f64 * 100.0 / total as f64
                );
                Ok(fsm.after_frame())
            }
            Some(Control::Nak) if stray == 0 && fsm.config.max_retries > 0 => {
                if fsm.attempts >= fsm.config.max_retries {
                    return Err(SenderError::RetriesExhausted {
                        index,
                        retries: fsm.config.max_retries,
                    });
                }
                fsm.attempts += 1;
                fsm.retransmissions += 1;
                warn!(
                    "Chunk {} rejected with NAK, retry {} / {}",
                    index, fsm.attempts, fsm.config.max_retries
                );
                Ok(Transition::Next(Box::new(fsm)))
            }
            _ => Err(SenderError::UnexpectedReply { index, reply, stray }),
        }
    }
}

impl SenderState for SenderFsm<AwaitingFinalAck> {
    fn step(self: Box<Self>) -> Result<Transition, SenderError> {
        let mut fsm = *self;

        if let Err(e) = fsm.serial.write_all(&[Control::Eot.byte()]) {
            return Err(fsm.fault(e, None));
        }
        debug!("Sent: EOT");

        match fsm.read_reply(None)? {
            Some(b) if b == Control::Ack.byte() => {
                debug!("Received: ACK");
                Ok(Transition::Completed(TransferReport {
                    frames: fsm.plan.len(),
                    retransmissions: fsm.retransmissions,
                }))
            }
            reply => Err(SenderError::NoFinalAck { reply }),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<AwaitingReady> {
    pub fn new(serial: Box<dyn SerialPort>, plan: TransferPlan, config: SessionConfig) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<AwaitingReady>,
            serial,
            plan,
            config,
            index: 0,
            attempts: 0,
            retransmissions: 0,
        })
    }

    /// Plan `payload`, behind an optional flash header, and start a session for it
    pub fn for_payload(
        serial: Box<dyn SerialPort>,
        payload: &[u8],
        header: Option<&FlashHeader>,
        config: SessionConfig,
    ) -> Result<Box<dyn SenderState>, SenderError> {
        let plan = TransferPlan::new(payload, header)?;
        if plan.is_empty() {
            warn!("Empty image: only the handshake and EOT will be sent");
        } else {
            debug!("Planned {} chunks for {} bytes", plan.len(), payload.len());
        }
        Ok(Self::new(serial, plan, config))
    }
}

/// Drive a session to its terminal state. The channel is dropped on every exit path.
pub fn run_session(mut state: Box<dyn SenderState>) -> Result<TransferReport, SenderError> {
    loop {
        match state.step()? {
            Transition::Next(next) => state = next,
            Transition::Completed(report) => return Ok(report),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
