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

use std::io::{Read, Write};
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte channel the transfer sessions run over
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Read whatever arrives within `timeout`. Nothing arriving is a `TimedOut` error.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Take every byte already buffered without waiting for more
    fn drain_pending(&mut self) -> std::io::Result<Vec<u8>>;

    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_timeout(&mut buf[filled..], timeout)?;
        }
        Ok(())
    }
}

/// A timeout is "no data", anything else is a broken channel
pub fn is_timeout(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::TimedOut
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        match self.port.read(buf)? {
            0 => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data")),
            n => Ok(n),
        }
    }

    fn drain_pending(&mut self) -> std::io::Result<Vec<u8>> {
        let mut pending = Vec::new();
        loop {
            let available = self.port.bytes_to_read()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))? as usize;
            if available == 0 {
                return Ok(pending);
            }
            let start = pending.len();
            pending.resize(start + available, 0);
            self.port.read_exact(&mut pending[start..])?;
        }
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Bytes the peer has sent and we have not read yet
    rx: std::collections::VecDeque<u8>,
    // Bytes the peer sends after each write_all call (empty = silence)
    replies: std::collections::VecDeque<Vec<u8>>,
    // Fail the n-th write (0-based) with BrokenPipe
    fail_write: Option<usize>,
    writes: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    /// `initial` is already buffered when the session starts, `replies[n]`
    /// shows up after the n-th write.
    pub fn new(initial: &[u8], replies: Vec<Vec<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            rx: initial.iter().copied().collect(),
            replies: replies.into(),
            fail_write: None,
            writes: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    pub fn fail_on_write(mut self, n: usize) -> Self {
        self.fail_write = Some(n);
        self
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if self.fail_write == Some(self.writes) {
            self.writes += 1;
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Mock port closed"));
        }
        self.writes += 1;
        self.write_log.extend_from_slice(buf);
        if let Some(reply) = self.replies.pop_front() {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // Nothing buffered = timeout
        if self.rx.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                }
                None => break,
            }
        }

        Ok(bytes_read)
    }

    fn drain_pending(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(self.rx.drain(..).collect())
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert!(
            self.rx.is_empty() && self.replies.is_empty(),
            "MockSerialPort dropped with {} unread bytes and {} unsent replies",
            self.rx.len(),
            self.replies.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// Loopback Pair for Testing
// ============================================================================

/// One end of an in-memory null-modem cable
#[cfg(test)]
pub struct LoopbackPort {
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
}

#[cfg(test)]
pub fn loopback_pair() -> (LoopbackPort, LoopbackPort) {
    let (a_tx, b_rx) = std::sync::mpsc::channel();
    let (b_tx, a_rx) = std::sync::mpsc::channel();
    (
        LoopbackPort { tx: a_tx, rx: a_rx },
        LoopbackPort { tx: b_tx, rx: b_rx },
    )
}

#[cfg(test)]
impl SerialPort for LoopbackPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &byte in buf {
            self.tx.send(byte)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        if buf.is_empty() {
            return Ok(0);
        }
        buf[0] = match self.rx.recv_timeout(timeout) {
            Ok(byte) => byte,
            Err(RecvTimeoutError::Timeout) => {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "Loopback timeout"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Loopback closed"));
            }
        };

        let mut bytes_read = 1;
        while bytes_read < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                }
                Err(_) => break,
            }
        }
        Ok(bytes_read)
    }

    fn drain_pending(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(self.rx.try_iter().collect())
    }
}
