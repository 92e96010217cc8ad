//! Minimal async Modbus-TCP client.
//!
//! Covers the three function codes the particle counter needs:
//! read holding registers (0x03), read input registers (0x04) and write
//! single register (0x06). Every frame carries a 7-byte MBAP header:
//! transaction id, protocol id (always 0), remaining length and unit id.

use crate::error::ModbusError;
use bytes::{Buf, BufMut, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Function 0x03.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Function 0x04.
pub const READ_INPUT_REGISTERS: u8 = 0x04;
/// Function 0x06.
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

const MBAP_LEN: usize = 7;
const EXCEPTION_FLAG: u8 = 0x80;
/// Largest register count a single read may request.
pub const MAX_READ_COUNT: u16 = 125;

/// Builds a complete request frame.
pub fn encode_request(transaction: u16, unit_id: u8, function: u8, address: u16, word: u16) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_LEN + 5);
    frame.put_u16(transaction);
    frame.put_u16(0);
    frame.put_u16(6); // unit id + function + two words
    frame.put_u8(unit_id);
    frame.put_u8(function);
    frame.put_u16(address);
    frame.put_u16(word);
    frame
}

/// Response header fields needed to read and validate the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Echoed back by the device.
    pub transaction: u16,
    /// Always 0 for Modbus.
    pub protocol: u16,
    /// Bytes that follow, unit id included.
    pub length: u16,
    /// Slave address on the gateway.
    pub unit_id: u8,
}

impl MbapHeader {
    /// Decodes the seven header bytes.
    pub fn parse(mut raw: &[u8]) -> Result<Self, ModbusError> {
        if raw.len() < MBAP_LEN {
            return Err(ModbusError::Protocol(format!(
                "MBAP header too short: {} bytes",
                raw.len()
            )));
        }
        let header = Self {
            transaction: raw.get_u16(),
            protocol: raw.get_u16(),
            length: raw.get_u16(),
            unit_id: raw.get_u8(),
        };
        if header.protocol != 0 {
            return Err(ModbusError::Protocol(format!(
                "unexpected protocol id {}",
                header.protocol
            )));
        }
        if header.length < 2 {
            return Err(ModbusError::Protocol(format!(
                "invalid MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// PDU bytes that follow the header.
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length) - 1
    }
}

/// Decodes a register-read PDU (function byte included).
pub fn decode_registers(function: u8, mut pdu: &[u8], expected: u16) -> Result<Vec<u16>, ModbusError> {
    check_function(function, pdu)?;
    pdu.advance(1);
    if pdu.is_empty() {
        return Err(ModbusError::Protocol("missing byte count".into()));
    }
    let byte_count = usize::from(pdu.get_u8());
    if byte_count != usize::from(expected) * 2 || pdu.remaining() < byte_count {
        return Err(ModbusError::Protocol(format!(
            "expected {} register bytes, got {} (of {} available)",
            usize::from(expected) * 2,
            byte_count,
            pdu.remaining()
        )));
    }
    Ok((0..expected).map(|_| pdu.get_u16()).collect())
}

/// Validates the echo of a write-single-register PDU.
pub fn decode_write_echo(mut pdu: &[u8], address: u16, value: u16) -> Result<(), ModbusError> {
    check_function(WRITE_SINGLE_REGISTER, pdu)?;
    pdu.advance(1);
    if pdu.remaining() < 4 {
        return Err(ModbusError::Protocol("write echo too short".into()));
    }
    let (echo_addr, echo_value) = (pdu.get_u16(), pdu.get_u16());
    if echo_addr != address || echo_value != value {
        return Err(ModbusError::Protocol(format!(
            "write echo mismatch: {echo_addr}={echo_value}, sent {address}={value}"
        )));
    }
    Ok(())
}

fn check_function(function: u8, pdu: &[u8]) -> Result<(), ModbusError> {
    match pdu.first().copied() {
        Some(code) if code == function => Ok(()),
        Some(code) if code == function | EXCEPTION_FLAG => Err(ModbusError::Exception {
            function,
            code: pdu.get(1).copied().unwrap_or(0),
        }),
        Some(code) => Err(ModbusError::Protocol(format!(
            "function 0x{code:02X} in reply to 0x{function:02X}"
        ))),
        None => Err(ModbusError::Protocol("empty PDU".into())),
    }
}

/// One open Modbus-TCP session.
pub struct ModbusTcpClient {
    stream: TcpStream,
    unit_id: u8,
    transaction: u16,
    io_timeout: Duration,
}

impl ModbusTcpClient {
    /// Opens a TCP session, bounded by `io_timeout`.
    pub async fn connect(addr: &str, unit_id: u8, io_timeout: Duration) -> Result<Self, ModbusError> {
        let stream = with_deadline(io_timeout, TcpStream::connect(addr)).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            unit_id,
            transaction: 0,
            io_timeout,
        })
    }

    /// Reads `count` holding registers from `address`.
    pub async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.read(READ_HOLDING_REGISTERS, address, count).await
    }

    /// Reads `count` input registers from `address`.
    pub async fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.read(READ_INPUT_REGISTERS, address, count).await
    }

    /// Writes one holding register and checks the echo.
    pub async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        let pdu = self.transact(WRITE_SINGLE_REGISTER, address, value).await?;
        decode_write_echo(&pdu, address, value)
    }

    /// Shuts the socket down.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn read(&mut self, function: u8, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(ModbusError::Protocol(format!(
                "register count {count} outside 1..={MAX_READ_COUNT}"
            )));
        }
        let pdu = self.transact(function, address, count).await?;
        decode_registers(function, &pdu, count)
    }

    async fn transact(&mut self, function: u8, address: u16, word: u16) -> Result<Vec<u8>, ModbusError> {
        self.transaction = self.transaction.wrapping_add(1);
        let transaction = self.transaction;
        let frame = encode_request(transaction, self.unit_id, function, address, word);
        trace!(transaction, function, address, word, "Modbus request");

        let deadline = self.io_timeout;
        with_deadline(deadline, self.stream.write_all(&frame)).await?;

        let mut header = [0u8; MBAP_LEN];
        with_deadline(deadline, self.stream.read_exact(&mut header)).await?;
        let header = MbapHeader::parse(&header)?;
        if header.transaction != transaction {
            return Err(ModbusError::Protocol(format!(
                "transaction id {} in reply to {}",
                header.transaction, transaction
            )));
        }

        let mut pdu = vec![0u8; header.pdu_len()];
        with_deadline(deadline, self.stream.read_exact(&mut pdu)).await?;
        Ok(pdu)
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ModbusError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(deadline, fut).await {
        Ok(result) => result.map_err(ModbusError::from),
        Err(_) => Err(ModbusError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let frame = encode_request(0x0102, 1, WRITE_SINGLE_REGISTER, 1, 11);
        assert_eq!(
            frame.as_ref(),
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x0B]
        );
    }

    #[test]
    fn read_response_decodes_registers() {
        let pdu = [READ_INPUT_REGISTERS, 4, 0x00, 0x2A, 0x01, 0x00];
        assert_eq!(
            decode_registers(READ_INPUT_REGISTERS, &pdu, 2).unwrap(),
            vec![42, 256]
        );
    }

    #[test]
    fn exception_response_is_typed() {
        let pdu = [READ_HOLDING_REGISTERS | 0x80, 0x02];
        assert!(matches!(
            decode_registers(READ_HOLDING_REGISTERS, &pdu, 1),
            Err(ModbusError::Exception { function: 0x03, code: 0x02 })
        ));
    }

    #[test]
    fn short_byte_count_rejected() {
        let pdu = [READ_INPUT_REGISTERS, 2, 0x00, 0x01];
        assert!(matches!(
            decode_registers(READ_INPUT_REGISTERS, &pdu, 2),
            Err(ModbusError::Protocol(_))
        ));
    }

    #[test]
    fn write_echo_must_match() {
        let ok = [WRITE_SINGLE_REGISTER, 0x00, 0x01, 0x00, 0x0C];
        assert!(decode_write_echo(&ok, 1, 12).is_ok());
        assert!(decode_write_echo(&ok, 1, 11).is_err());
    }

    #[test]
    fn header_rejects_foreign_protocol() {
        let raw = [0x00, 0x01, 0x00, 0x07, 0x00, 0x03, 0x01];
        assert!(MbapHeader::parse(&raw).is_err());
        let raw = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01];
        let header = MbapHeader::parse(&raw).unwrap();
        assert_eq!(header.pdu_len(), 2);
        assert_eq!(header.unit_id, 1);
    }
}
