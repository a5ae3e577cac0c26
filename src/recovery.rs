//! Gateway and device recovery.
//!
//! Two unrelated actions live here. A gateway reset only touches the
//! serial-to-Ethernet bridge and is run automatically when a read is refused.
//! A device reset reboots the breaker controller and is only ever run on
//! explicit request.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::GatewaySettings;
use crate::error::{BreakerError, BreakerResult};
use crate::models::Endpoint;
use crate::modbus_frame::{CoilValue, FunctionCode, Request, Response};
use crate::status::coil;
use crate::transport::{dial, ModbusLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayResetPath {
    ManagementCommand,
    SocketFlush { opened: usize },
}

#[async_trait]
pub trait GatewayReset: Send + Sync {
    async fn reset_gateway(&self, endpoint: &Endpoint) -> BreakerResult<GatewayResetPath>;
}

/// Resets a gateway over the network: vendor management command when the
/// management port answers, otherwise a burst of throwaway connections to
/// the MODBUS ports so the gateway drops its stale sockets.
pub struct TcpGatewayReset {
    management_port: Option<u16>,
    management_command: Vec<u8>,
    flush_ports: Vec<u16>,
    flush_connections: usize,
    dial_timeout: Duration,
}

impl TcpGatewayReset {
    pub fn new(settings: &GatewaySettings, dial_timeout: Duration) -> Self {
        Self {
            management_port: settings.management_port,
            management_command: settings.management_command.as_bytes().to_vec(),
            flush_ports: settings.flush_ports.clone(),
            flush_connections: settings.flush_connections,
            dial_timeout,
        }
    }

    async fn send_management_command(&self, endpoint: &Endpoint, port: u16) -> BreakerResult<()> {
        let addr = format!("{}:{}", endpoint.host, port);
        let mut stream = dial(&addr, self.dial_timeout).await?;
        stream
            .write_all(&self.management_command)
            .await
            .map_err(|e| BreakerError::transport(&addr, crate::error::TransportStage::Write, e))?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    async fn flush_sockets(&self, endpoint: &Endpoint) -> usize {
        let ports = if self.flush_ports.is_empty() {
            vec![endpoint.port]
        } else {
            self.flush_ports.clone()
        };
        let mut opened = 0;
        for port in ports {
            let addr = format!("{}:{}", endpoint.host, port);
            for _ in 0..self.flush_connections {
                match dial(&addr, self.dial_timeout).await {
                    Ok(stream) => {
                        drop(stream);
                        opened += 1;
                    }
                    Err(e) => debug!("Flush connection to {} failed: {}", addr, e),
                }
            }
        }
        opened
    }
}

#[async_trait]
impl GatewayReset for TcpGatewayReset {
    async fn reset_gateway(&self, endpoint: &Endpoint) -> BreakerResult<GatewayResetPath> {
        if let Some(port) = self.management_port {
            match self.send_management_command(endpoint, port).await {
                Ok(()) => {
                    info!("Gateway {} reset through management port {}", endpoint.host, port);
                    return Ok(GatewayResetPath::ManagementCommand);
                }
                Err(e) => debug!("Management port {} of {} unreachable: {}", port, endpoint.host, e),
            }
        }

        let opened = self.flush_sockets(endpoint).await;
        if opened == 0 {
            warn!("Gateway {} accepted none of the flush connections", endpoint.host);
        } else {
            info!("Gateway {} flushed with {} throwaway connections", endpoint.host, opened);
        }
        Ok(GatewayResetPath::SocketFlush { opened })
    }
}

pub struct RecoveryManager {
    link: Arc<dyn ModbusLink>,
    gateway: Arc<dyn GatewayReset>,
    settle: Duration,
    max_retries: AtomicU32,
}

impl RecoveryManager {
    pub fn new(link: Arc<dyn ModbusLink>, gateway: Arc<dyn GatewayReset>, settle: Duration) -> Self {
        Self {
            link,
            gateway,
            settle,
            max_retries: AtomicU32::new(1),
        }
    }

    pub fn link(&self) -> &Arc<dyn ModbusLink> {
        &self.link
    }

    pub fn set_max_retries(&self, retries: u32) {
        self.max_retries.store(retries.max(1), Ordering::Relaxed);
    }

    async fn read(&self, endpoint: &Endpoint, request: &Request) -> BreakerResult<Vec<u16>> {
        match self.link.execute(endpoint, request.clone()).await? {
            Response::Registers(values) => Ok(values),
            other => Err(BreakerError::malformed(format!("unexpected response {:?}", other))),
        }
    }

    /// Read registers, recovering once from a failure. A refused connection
    /// runs the gateway reset before the retry. When every retry fails the
    /// first error is returned. Never resets the device.
    pub async fn read_with_retry(
        &self,
        endpoint: &Endpoint,
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> BreakerResult<Vec<u16>> {
        let request = match function {
            FunctionCode::ReadInputRegisters => Request::ReadInputRegisters { address, quantity },
            FunctionCode::ReadHoldingRegisters => Request::ReadHoldingRegisters { address, quantity },
            FunctionCode::WriteSingleCoil => {
                return Err(BreakerError::UnsupportedOperation(
                    "coil writes are never retried".to_string(),
                ))
            }
        };

        let first = match self.read(endpoint, &request).await {
            Ok(values) => return Ok(values),
            Err(e) => e,
        };
        warn!(
            station = endpoint.station_id,
            "Read 0x{:04X} from {} failed: {}",
            address,
            endpoint.addr(),
            first
        );

        let retries = self.max_retries.load(Ordering::Relaxed);
        let mut refused = first.is_connection_refused();
        for attempt in 1..=retries {
            if refused {
                match self.gateway.reset_gateway(endpoint).await {
                    Ok(path) => debug!("Gateway reset via {:?}", path),
                    Err(e) => warn!("Gateway reset for {} failed: {}", endpoint.host, e),
                }
            }
            tokio::time::sleep(self.settle).await;

            match self.read(endpoint, &request).await {
                Ok(values) => {
                    info!(
                        station = endpoint.station_id,
                        "Read 0x{:04X} from {} recovered on retry {}",
                        address,
                        endpoint.addr(),
                        attempt
                    );
                    return Ok(values);
                }
                Err(e) => {
                    warn!("Retry {} of {} for {} failed: {}", attempt, retries, endpoint.addr(), e);
                    refused = e.is_connection_refused();
                }
            }
        }
        Err(first)
    }

    pub async fn reset_gateway(&self, endpoint: &Endpoint) -> BreakerResult<GatewayResetPath> {
        self.gateway.reset_gateway(endpoint).await
    }

    /// Reboot the breaker controller (about ten seconds of downtime). Only for
    /// explicit maintenance requests.
    pub async fn reset_device(&self, endpoint: &Endpoint) -> BreakerResult<()> {
        warn!(
            station = endpoint.station_id,
            "Device reset requested for {}, controller reboots for ~10s",
            endpoint.addr()
        );
        self.link
            .write_single_coil(endpoint, coil::DEVICE_RESET, CoilValue::On)
            .await
    }
}
