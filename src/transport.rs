use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{BreakerError, BreakerResult, TransportStage};
use crate::models::Endpoint;
use crate::modbus_frame::{
    decode_response, encode_request, format_hex, CoilValue, MbapHeader, Request, Response, MBAP_HEADER_LEN,
};

/// One MODBUS request/response exchange with a breaker. The seam every
/// higher layer talks through, so they can run against scripted devices.
#[async_trait]
pub trait ModbusLink: Send + Sync {
    async fn execute(&self, endpoint: &Endpoint, request: Request) -> BreakerResult<Response>;

    async fn read_input_registers(&self, endpoint: &Endpoint, address: u16, quantity: u16) -> BreakerResult<Vec<u16>> {
        match self.execute(endpoint, Request::ReadInputRegisters { address, quantity }).await? {
            Response::Registers(values) => Ok(values),
            other => Err(BreakerError::malformed(format!("unexpected response {:?}", other))),
        }
    }

    async fn read_holding_registers(&self, endpoint: &Endpoint, address: u16, quantity: u16) -> BreakerResult<Vec<u16>> {
        match self.execute(endpoint, Request::ReadHoldingRegisters { address, quantity }).await? {
            Response::Registers(values) => Ok(values),
            other => Err(BreakerError::malformed(format!("unexpected response {:?}", other))),
        }
    }

    async fn write_single_coil(&self, endpoint: &Endpoint, address: u16, value: CoilValue) -> BreakerResult<()> {
        match self.execute(endpoint, Request::WriteSingleCoil { address, value }).await? {
            Response::CoilWritten { .. } => Ok(()),
            other => Err(BreakerError::malformed(format!("unexpected response {:?}", other))),
        }
    }
}

/// Opens a fresh TCP connection for every request and closes it afterwards.
/// Gateways only allow a handful of sockets and each breaker is polled rarely.
pub struct TcpModbusClient {
    dial_timeout: Duration,
    read_timeout: Duration,
    transaction_id: AtomicU16,
}

impl TcpModbusClient {
    pub fn new(dial_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            read_timeout,
            transaction_id: AtomicU16::new(fastrand::u16(1..)),
        }
    }

    fn next_transaction_id(&self) -> u16 {
        let id = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.transaction_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }
}

pub(crate) async fn dial(addr: &str, dial_timeout: Duration) -> BreakerResult<TcpStream> {
    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(BreakerError::transport(addr, TransportStage::Connect, e)),
        Err(_) => Err(BreakerError::timed_out(addr, TransportStage::Connect)),
    }
}

/// The device closing mid-frame is a short response, not a link failure.
fn read_error(addr: &str, expected: usize, e: std::io::Error) -> BreakerError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BreakerError::malformed(format!("{} closed the connection before {} bytes arrived", addr, expected))
    } else {
        BreakerError::transport(addr, TransportStage::Read, e)
    }
}

async fn read_adu(stream: &mut TcpStream, addr: &str) -> BreakerResult<Vec<u8>> {
    let mut frame = vec![0u8; MBAP_HEADER_LEN];
    stream
        .read_exact(&mut frame)
        .await
        .map_err(|e| read_error(addr, MBAP_HEADER_LEN, e))?;
    let header = MbapHeader::parse(&frame)?;

    let total = MBAP_HEADER_LEN + header.pdu_len();
    frame.resize(total, 0);
    stream
        .read_exact(&mut frame[MBAP_HEADER_LEN..])
        .await
        .map_err(|e| read_error(addr, total, e))?;
    Ok(frame)
}

#[async_trait]
impl ModbusLink for TcpModbusClient {
    async fn execute(&self, endpoint: &Endpoint, request: Request) -> BreakerResult<Response> {
        let addr = endpoint.addr();
        let transaction_id = self.next_transaction_id();
        let adu = encode_request(transaction_id, endpoint.station_id, &request);

        let mut stream = dial(&addr, self.dial_timeout).await?;

        debug!(
            direction = "TX",
            frame = %format_hex(&adu),
            station = endpoint.station_id,
            "modbus {}",
            addr
        );
        match timeout(self.read_timeout, stream.write_all(&adu)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BreakerError::transport(&addr, TransportStage::Write, e)),
            Err(_) => return Err(BreakerError::timed_out(&addr, TransportStage::Write)),
        }

        let frame = match timeout(self.read_timeout, read_adu(&mut stream, &addr)).await {
            Ok(result) => result?,
            Err(_) => return Err(BreakerError::timed_out(&addr, TransportStage::Read)),
        };
        debug!(
            direction = "RX",
            frame = %format_hex(&frame),
            station = endpoint.station_id,
            "modbus {}",
            addr
        );

        // Single exchange per connection. A failed shutdown changes nothing for the caller.
        let _ = stream.shutdown().await;

        decode_response(&request, transaction_id, &frame)
    }
}
