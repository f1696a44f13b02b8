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

//! Device side of the transfer, writing into a file that stands in for flash

use std::marker::PhantomData;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{Duration, Instant};
use log::{debug, info};
use thiserror::Error;
use crate::crc::crc16;
use crate::plan::FlashHeader;
use crate::protocol::*;
use crate::serial::{SerialPort, is_timeout};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("no transfer started within {0:?}")]
    NoTransfer(Duration),

    #[error("unexpected start byte 0x{byte:02X} before frame {frame}")]
    UnexpectedStartByte { frame: usize, byte: u8 },

    #[error("timed out inside frame {frame}")]
    FrameTimeout { frame: usize },

    #[error("bad sequence in frame {frame}: got {seq}/{complement}, expected {expected}")]
    BadSequence { frame: usize, seq: u8, complement: u8, expected: u8 },

    #[error("checksum mismatch in frame {frame}: received {received:#06x}, computed {computed:#06x}")]
    BadChecksum { frame: usize, received: u16, computed: u16 },

    #[error("read-back mismatch at offset {offset:#x}")]
    VerifyMismatch { offset: u64 },

    #[error("I/O error (in state: {state}): {source}")]
    Io {
        state: &'static str,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Storage
// ============================================================================

/// Seekable image target. A plain `File` stands in for the flash.
pub trait FlashStorage: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> FlashStorage for T {}

// ============================================================================
// Configuration & Report
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Decode the first frame as a flash header
    pub expect_header: bool,
    /// Gap between two ready markers while nothing arrives
    pub ping_interval: Duration,
    /// Give up if no frame starts within this time
    pub handshake_timeout: Duration,
    /// Wait for the next frame, and for each byte inside one
    pub frame_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            expect_header: false,
            ping_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(60),
            frame_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    pub frames: usize,
    pub bytes_written: u64,
    pub header: Option<FlashHeader>,
}

// ============================================================================
// States
// ============================================================================

pub struct Ping;
pub struct WaitFrame;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    output: Box<dyn FlashStorage>,
    config: ReceiverConfig,
    started: Instant,
    header: Option<FlashHeader>,
    expected_seq: u8,
    frames: usize,
    position: u64,
    remaining: Option<u64>,
    bytes_written: u64,
}

// ============================================================================
// Trait
// ============================================================================

pub enum Transition {
    Next(Box<dyn ReceiverState>),
    Completed(ReceiveReport),
}

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Transition, ReceiverError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S: Send + 'static> ReceiverFsm<S> {
    fn transition<T: Send + 'static>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            output: self.output,
            config: self.config,
            started: self.started,
            header: self.header,
            expected_seq: self.expected_seq,
            frames: self.frames,
            position: self.position,
            remaining: self.remaining,
            bytes_written: self.bytes_written,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Io { state, source: e }
    }

    fn send(&mut self, c: Control) -> Result<(), ReceiverError> {
        self.serial.write_all(&[c.byte()]).map_err(|e| self.io_error(e))?;
        debug!("Sent: {:?}", c);
        Ok(())
    }

    /// Cancel the transfer, then report why
    fn reject(mut self, err: ReceiverError) -> Result<Transition, ReceiverError> {
        self.send(Control::Can)?;
        Err(err)
    }

    fn finish(mut self) -> Result<Transition, ReceiverError> {
        debug!("Received: EOT");
        self.send(Control::Ack)?;
        self.output.flush().map_err(|e| self.io_error(e))?;
        Ok(Transition::Completed(ReceiveReport {
            frames: self.frames,
            bytes_written: self.bytes_written,
            header: self.header,
        }))
    }

    /// Read the rest of a frame whose start byte was `start` and store it
    fn accept_frame(mut self, start: Control) -> Result<Transition, ReceiverError> {
        let frame = self.frames;
        let Some(block_len) = start.block_len() else {
            return self.reject(ReceiverError::UnexpectedStartByte { frame, byte: start.byte() });
        };

        // seq, complement, block, crc
        let body_len = 2 + block_len + FRAME_SUFFIX_LEN;
        let mut body = [0u8; 2 + BLOCK_1024 + FRAME_SUFFIX_LEN];
        match self.serial.read_exact_timeout(&mut body[..body_len], self.config.frame_timeout) {
            Ok(()) => {}
            Err(e) if is_timeout(&e) => {
                return self.reject(ReceiverError::FrameTimeout { frame });
            }
            Err(e) => return Err(self.io_error(e)),
        }

        let (seq, complement) = (body[0], body[1]);
        if complement != 0xFF - seq || seq != self.expected_seq {
            let err = ReceiverError::BadSequence {
                frame,
                seq,
                complement,
                expected: self.expected_seq,
            };
            return self.reject(err);
        }

        let block = &body[2..2 + block_len];
        let received = u16::from_be_bytes([body[2 + block_len], body[3 + block_len]]);
        let computed = crc16(block);
        if received != computed {
            return self.reject(ReceiverError::BadChecksum { frame, received, computed });
        }
        debug!("Received: frame {} (seq {}, {} byte block)", frame, seq, block_len);

        if frame == 0 && self.config.expect_header {
            // from_block only fails on blocks shorter than 12 bytes
            if let Some(header) = FlashHeader::from_block(block) {
                info!(
                    "Flash header: offset {:#x}, size {} bytes, verify {}",
                    header.offset,
                    header.size,
                    if header.skip_verify() { "off" } else { "on" }
                );
                self.position = header.offset as u64;
                self.remaining = Some(header.size as u64);
                self.header = Some(header);
            }
        } else {
            let len = match self.remaining {
                Some(remaining) => remaining.min(block_len as u64) as usize,
                None => block_len,
            };
            if let Err(err) = self.store(&body[2..2 + len]) {
                return self.reject(err);
            }
        }

        self.frames += 1;
        self.expected_seq = next_seq(self.expected_seq);
        self.send(Control::Ack)?;

        Ok(Transition::Next(self.transition::<WaitFrame>()))
    }

    fn store(&mut self, data: &[u8]) -> Result<(), ReceiverError> {
        if data.is_empty() {
            return Ok(());
        }

        let offset = self.position;
        self.output.seek(SeekFrom::Start(offset)).map_err(|e| self.io_error(e))?;
        self.output.write_all(data).map_err(|e| self.io_error(e))?;

        if !self.header.is_some_and(|h| h.skip_verify()) {
            let mut readback = vec![0u8; data.len()];
            self.output.seek(SeekFrom::Start(offset)).map_err(|e| self.io_error(e))?;
            self.output.read_exact(&mut readback).map_err(|e| self.io_error(e))?;
            if readback != data {
                return Err(ReceiverError::VerifyMismatch { offset });
            }
        }

        self.position += data.len() as u64;
        self.bytes_written += data.len() as u64;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= data.len() as u64;
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Ping> {
    fn step(self: Box<Self>) -> Result<Transition, ReceiverError> {
        let mut fsm = *self;
        fsm.send(Control::Ready)?;

        let mut buf = [0u8; 1];
        match fsm.serial.read_timeout(&mut buf, fsm.config.ping_interval) {
            Ok(_) if buf[0] == Control::Eot.byte() => fsm.finish(),
            Ok(_) => match Control::from_byte(buf[0]) {
                Some(start) => fsm.accept_frame(start),
                None => {
                    let frame = fsm.frames;
                    fsm.reject(ReceiverError::UnexpectedStartByte { frame, byte: buf[0] })
                }
            },
            Err(e) if is_timeout(&e) => {
                if fsm.started.elapsed() >= fsm.config.handshake_timeout {
                    return Err(ReceiverError::NoTransfer(fsm.config.handshake_timeout));
                }
                debug!("Sender not started yet");
                Ok(Transition::Next(Box::new(fsm)))
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

impl ReceiverState for ReceiverFsm<WaitFrame> {
    fn step(self: Box<Self>) -> Result<Transition, ReceiverError> {
        let mut fsm = *self;

        let mut buf = [0u8; 1];
        match fsm.serial.read_timeout(&mut buf, fsm.config.frame_timeout) {
            Ok(_) if buf[0] == Control::Eot.byte() => fsm.finish(),
            Ok(_) => match Control::from_byte(buf[0]) {
                Some(start) => fsm.accept_frame(start),
                None => {
                    let frame = fsm.frames;
                    fsm.reject(ReceiverError::UnexpectedStartByte { frame, byte: buf[0] })
                }
            },
            Err(e) if is_timeout(&e) => {
                let frame = fsm.frames;
                fsm.reject(ReceiverError::FrameTimeout { frame })
            }
            Err(e) => Err(fsm.io_error(e)),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<Ping> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        output: Box<dyn FlashStorage>,
        config: ReceiverConfig,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<Ping>,
            serial,
            output,
            config,
            started: Instant::now(),
            header: None,
            expected_seq: 1,
            frames: 0,
            position: 0,
            remaining: None,
            bytes_written: 0,
        })
    }
}

pub fn run_receiver(mut state: Box<dyn ReceiverState>) -> Result<ReceiveReport, ReceiverError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::io::Cursor;
    use std::path::PathBuf;
    use crate::plan::TransferPlan;
    use crate::sender::{SenderFsm, SessionConfig, run_session};
    use crate::serial::{MockSerialPort, loopback_pair};

    const ACK: u8 = Control::Ack.byte();
    const CAN: u8 = Control::Can.byte();
    const EOT: u8 = Control::Eot.byte();
    const READY: u8 = Control::Ready.byte();

    fn open_output(name: &str, initial: &[u8]) -> (PathBuf, File) {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, initial).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        (path, file)
    }

    fn fast_config(expect_header: bool) -> ReceiverConfig {
        ReceiverConfig {
            expect_header,
            ping_interval: Duration::ZERO,
            handshake_timeout: Duration::from_secs(60),
            frame_timeout: Duration::ZERO,
        }
    }

    /// Flash whose writes fail, or whose read-back comes out corrupted
    struct FaultyFlash {
        cells: Cursor<Vec<u8>>,
        fail_writes: bool,
    }

    impl FaultyFlash {
        fn corrupting() -> Self {
            FaultyFlash { cells: Cursor::new(Vec::new()), fail_writes: false }
        }

        fn write_protected() -> Self {
            FaultyFlash { cells: Cursor::new(Vec::new()), fail_writes: true }
        }
    }

    impl Read for FaultyFlash {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.cells.read(buf)?;
            if n > 0 {
                buf[0] ^= 0xFF;
            }
            Ok(n)
        }
    }

    impl Write for FaultyFlash {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.fail_writes {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "write protected"));
            }
            self.cells.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FaultyFlash {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.cells.seek(pos)
        }
    }

    /// Replies for a sender that answers the first ping with frame 0 and each ACK with the next frame
    fn sender_script(plan: &TransferPlan) -> (Vec<Vec<u8>>, Vec<u8>) {
        let mut replies: Vec<Vec<u8>> = plan.frames().iter().map(|f| f.as_bytes().to_vec()).collect();
        replies.push(vec![EOT]);

        let mut expected_writes = vec![READY];
        expected_writes.extend(std::iter::repeat_n(ACK, plan.len() + 1));
        (replies, expected_writes)
    }

    #[test]
    fn test_receiver_full_transfer() {
        let payload: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
        let plan = TransferPlan::new(&payload, None).unwrap();
        let (replies, expected_writes) = sender_script(&plan);

        let (path, file) = open_output("xmodem1k_rx_plain.bin", &[]);
        let mock_serial = Box::new(MockSerialPort::new(&[], replies, expected_writes));
        let report = run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), fast_config(false)))
            .expect("Transfer should complete");

        assert_eq!(report.frames, 3);
        assert_eq!(report.bytes_written, 3 * 1024);

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 3 * 1024);
        assert_eq!(&content[..2500], payload.as_slice());
        assert!(content[2500..].iter().all(|&b| b == 0));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_flash_header_places_data() {
        let payload = [0x42u8; 50];
        let header = FlashHeader { offset: 16, size: 50, flags: 0 };
        let plan = TransferPlan::new(&payload, Some(&header)).unwrap();
        let (replies, expected_writes) = sender_script(&plan);

        // erased flash
        let (path, file) = open_output("xmodem1k_rx_header.bin", &[0xFF; 100]);
        let mock_serial = Box::new(MockSerialPort::new(&[], replies, expected_writes));
        let report = run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), fast_config(true)))
            .expect("Transfer should complete");

        assert_eq!(report.header, Some(header));
        assert_eq!(report.frames, 2);
        assert_eq!(report.bytes_written, 50);

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 100);
        assert!(content[..16].iter().all(|&b| b == 0xFF));
        assert_eq!(&content[16..66], &payload);
        assert!(content[66..].iter().all(|&b| b == 0xFF));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_keeps_pinging_until_data() {
        let plan = TransferPlan::new(b"late", None).unwrap();
        let (mut replies, mut expected_writes) = sender_script(&plan);
        replies.insert(0, vec![]);
        expected_writes.insert(0, READY);

        let (path, file) = open_output("xmodem1k_rx_ping.bin", &[]);
        let mock_serial = Box::new(MockSerialPort::new(&[], replies, expected_writes));
        run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), fast_config(false)))
            .expect("Transfer should complete");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_gives_up_without_sender() {
        let (path, file) = open_output("xmodem1k_rx_idle.bin", &[]);
        let mock_serial = Box::new(MockSerialPort::new(&[], vec![], vec![READY]));
        let config = ReceiverConfig { handshake_timeout: Duration::ZERO, ..fast_config(false) };

        let result = run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), config));
        assert!(matches!(result, Err(ReceiverError::NoTransfer(_))));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_empty_transfer() {
        let (path, file) = open_output("xmodem1k_rx_empty.bin", &[]);
        let mock_serial = Box::new(MockSerialPort::new(&[], vec![vec![EOT]], vec![READY, ACK]));

        let report = run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), fast_config(false)))
            .expect("Empty transfer should complete");
        assert_eq!(report.frames, 0);
        assert_eq!(report.bytes_written, 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_bad_checksum_cancels() {
        let plan = TransferPlan::new(b"corrupt me", None).unwrap();
        let mut frame = plan.frames()[0].as_bytes().to_vec();
        frame[5] ^= 0x01;

        let (path, file) = open_output("xmodem1k_rx_crc.bin", &[]);
        let mock_serial = Box::new(MockSerialPort::new(&[], vec![frame], vec![READY, CAN]));

        let result = run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), fast_config(false)));
        assert!(matches!(result, Err(ReceiverError::BadChecksum { frame: 0, .. })));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_missing_frame_cancels() {
        let plan = TransferPlan::new(&[9u8; 3000], None).unwrap();
        let frames: Vec<Vec<u8>> = plan.frames().iter().map(|f| f.as_bytes().to_vec()).collect();

        let (path, file) = open_output("xmodem1k_rx_seq.bin", &[]);
        let replies = vec![frames[0].clone(), frames[2].clone()];
        let mock_serial = Box::new(MockSerialPort::new(&[], replies, vec![READY, ACK, CAN]));

        match run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), fast_config(false))) {
            Err(ReceiverError::BadSequence { frame, seq, expected, .. }) => {
                assert_eq!(frame, 1);
                assert_eq!(seq, 3);
                assert_eq!(expected, 2);
            }
            other => panic!("Expected BadSequence, got {:?}", other),
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_truncated_frame_cancels() {
        let plan = TransferPlan::new(b"short", None).unwrap();
        let frame = plan.frames()[0].as_bytes()[..60].to_vec();

        let (path, file) = open_output("xmodem1k_rx_trunc.bin", &[]);
        let mock_serial = Box::new(MockSerialPort::new(&[], vec![frame], vec![READY, CAN]));

        let result = run_receiver(ReceiverFsm::new(mock_serial, Box::new(file), fast_config(false)));
        assert!(matches!(result, Err(ReceiverError::FrameTimeout { frame: 0 })));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_readback_mismatch_cancels() {
        let plan = TransferPlan::new(b"flash me", None).unwrap();
        let frame = plan.frames()[0].as_bytes().to_vec();

        let mock_serial = Box::new(MockSerialPort::new(&[], vec![frame], vec![READY, CAN]));
        let flash = Box::new(FaultyFlash::corrupting());

        let result = run_receiver(ReceiverFsm::new(mock_serial, flash, fast_config(false)));
        assert!(matches!(result, Err(ReceiverError::VerifyMismatch { offset: 0 })));
    }

    #[test]
    fn test_receiver_write_failure_cancels() {
        let plan = TransferPlan::new(b"flash me", None).unwrap();
        let frame = plan.frames()[0].as_bytes().to_vec();

        let mock_serial = Box::new(MockSerialPort::new(&[], vec![frame], vec![READY, CAN]));
        let flash = Box::new(FaultyFlash::write_protected());

        match run_receiver(ReceiverFsm::new(mock_serial, flash, fast_config(false))) {
            Err(ReceiverError::Io { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            other => panic!("Expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_receiver_no_verify_skips_readback() {
        let payload = b"trust me";
        let header = FlashHeader::new(0, payload.len() as u32, false);
        let plan = TransferPlan::new(payload, Some(&header)).unwrap();
        let (replies, expected_writes) = sender_script(&plan);

        let mock_serial = Box::new(MockSerialPort::new(&[], replies, expected_writes));
        let flash = Box::new(FaultyFlash::corrupting());

        let report = run_receiver(ReceiverFsm::new(mock_serial, flash, fast_config(true)))
            .expect("Transfer should complete without read-back");
        assert_eq!(report.bytes_written, payload.len() as u64);
    }

    #[test]
    fn test_sender_and_receiver_over_loopback() {
        let payload: Vec<u8> = (0..5000).map(|i| (i * 31 % 256) as u8).collect();
        let header = FlashHeader::new(0x200, payload.len() as u32, false);
        let plan = TransferPlan::new(&payload, Some(&header)).unwrap();

        let (path, file) = open_output("xmodem1k_rx_loopback.bin", &[]);
        let (host, device) = loopback_pair();

        let config = ReceiverConfig {
            expect_header: true,
            ping_interval: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(2),
        };
        let device_thread = std::thread::spawn(move || {
            run_receiver(ReceiverFsm::new(Box::new(device), Box::new(file), config))
        });

        let report = run_session(SenderFsm::new(Box::new(host), plan, SessionConfig::default()))
            .expect("Sender should complete");
        assert_eq!(report.frames, 6);

        let received = device_thread.join().unwrap().expect("Receiver should complete");
        assert_eq!(received.header, Some(header));
        assert_eq!(received.bytes_written, 5000);

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 0x200 + 5000);
        assert_eq!(&content[0x200..], payload.as_slice());

        std::fs::remove_file(&path).ok();
    }
}
