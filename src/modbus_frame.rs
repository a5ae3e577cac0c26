//! MODBUS-TCP application data unit framing.
//!
//! Only the client side of three function codes is implemented: 0x03 and 0x04
//! register reads and 0x05 single coil writes. Every ADU is a 7 byte MBAP
//! header followed by the PDU.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BreakerError, BreakerResult};

pub const MBAP_HEADER_LEN: usize = 7;
/// MBAP header plus the largest PDU a MODBUS device may send.
pub const MAX_ADU_LEN: usize = 260;
pub const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleCoil => 0x05,
        }
    }
}

/// Wire encoding of a single coil. The protocol only knows these two words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoilValue {
    On,
    Off,
}

impl CoilValue {
    pub fn to_wire(self) -> u16 {
        match self {
            CoilValue::On => 0xFF00,
            CoilValue::Off => 0x0000,
        }
    }

    pub fn from_wire(word: u16) -> Option<Self> {
        match word {
            0xFF00 => Some(CoilValue::On),
            0x0000 => Some(CoilValue::Off),
            _ => None,
        }
    }
}

impl From<bool> for CoilValue {
    fn from(on: bool) -> Self {
        if on {
            CoilValue::On
        } else {
            CoilValue::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: CoilValue },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
        }
    }

    fn put_pdu(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function().code());
        match *self {
            Request::ReadHoldingRegisters { address, quantity }
            | Request::ReadInputRegisters { address, quantity } => {
                buf.put_u16(address);
                buf.put_u16(quantity);
            }
            Request::WriteSingleCoil { address, value } => {
                buf.put_u16(address);
                buf.put_u16(value.to_wire());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    CoilWritten { address: u16, value: CoilValue },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of the unit id plus the PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(data: &[u8]) -> BreakerResult<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(BreakerError::malformed(format!(
                "MBAP header needs {} bytes, got {}",
                MBAP_HEADER_LEN,
                data.len()
            )));
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };
        if header.protocol_id != 0 {
            return Err(BreakerError::malformed(format!(
                "protocol id {} is not MODBUS",
                header.protocol_id
            )));
        }
        if header.length < 2 || MBAP_HEADER_LEN + header.pdu_len() > MAX_ADU_LEN {
            return Err(BreakerError::malformed(format!(
                "implausible MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

pub fn encode_request(transaction_id: u16, unit_id: u8, request: &Request) -> Bytes {
    let mut pdu = BytesMut::with_capacity(5);
    request.put_pdu(&mut pdu);

    let mut adu = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.put_u16(transaction_id);
    adu.put_u16(0);
    adu.put_u16(pdu.len() as u16 + 1);
    adu.put_u8(unit_id);
    adu.extend_from_slice(&pdu);
    adu.freeze()
}

/// Validate a complete response ADU against the request that produced it.
pub fn decode_response(request: &Request, transaction_id: u16, frame: &[u8]) -> BreakerResult<Response> {
    let header = MbapHeader::parse(frame)?;
    if header.transaction_id != transaction_id {
        return Err(BreakerError::malformed(format!(
            "transaction id mismatch: sent {}, got {}",
            transaction_id, header.transaction_id
        )));
    }
    let end = MBAP_HEADER_LEN + header.pdu_len();
    if frame.len() < end {
        return Err(BreakerError::malformed(format!(
            "frame truncated: header announces {} bytes, got {}",
            end,
            frame.len()
        )));
    }
    let pdu = &frame[MBAP_HEADER_LEN..end];
    if pdu.len() < 2 {
        return Err(BreakerError::malformed(format!("PDU of {} byte is too short", pdu.len())));
    }

    let expected = request.function().code();
    let function = pdu[0];
    if function == expected | EXCEPTION_FLAG {
        return Err(BreakerError::ProtocolException {
            function: expected,
            code: pdu[1],
        });
    }
    if function != expected {
        return Err(BreakerError::malformed(format!(
            "function code 0x{:02X} does not answer 0x{:02X}",
            function, expected
        )));
    }

    match *request {
        Request::ReadHoldingRegisters { quantity, .. } | Request::ReadInputRegisters { quantity, .. } => {
            let byte_count = pdu[1] as usize;
            if byte_count != quantity as usize * 2 {
                return Err(BreakerError::malformed(format!(
                    "expected {} data bytes, device announced {}",
                    quantity as usize * 2,
                    byte_count
                )));
            }
            if pdu.len() < 2 + byte_count {
                return Err(BreakerError::malformed(format!(
                    "register payload truncated: {} of {} bytes",
                    pdu.len() - 2,
                    byte_count
                )));
            }
            let registers = pdu[2..2 + byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(Response::Registers(registers))
        }
        Request::WriteSingleCoil { address, value } => {
            if pdu.len() < 5 {
                return Err(BreakerError::malformed(format!(
                    "coil echo needs 5 PDU bytes, got {}",
                    pdu.len()
                )));
            }
            let echoed_address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let echoed_value = CoilValue::from_wire(u16::from_be_bytes([pdu[3], pdu[4]]));
            if echoed_address != address || echoed_value != Some(value) {
                return Err(BreakerError::malformed(format!(
                    "coil echo mismatch at 0x{:04X}",
                    echoed_address
                )));
            }
            Ok(Response::CoilWritten { address, value })
        }
    }
}

/// Space separated upper-case hex, the form the frame capture layer parses.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a response ADU the way a device would. Used by test servers and fakes.
#[cfg(test)]
pub(crate) fn encode_response(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.put_u16(transaction_id);
    adu.put_u16(0);
    adu.put_u16(pdu.len() as u16 + 1);
    adu.put_u8(unit_id);
    adu.extend_from_slice(pdu);
    adu.to_vec()
}
