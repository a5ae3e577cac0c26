//! Scripted devices, gateways and stores shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{BreakerError, BreakerResult, TransportStage};
use crate::models::{Breaker, BreakerId, BreakerStatus, ControlOperation, ElectricalConfig, Endpoint, MonitorConfig};
use crate::modbus_frame::{CoilValue, Request, Response};
use crate::recovery::{GatewayReset, GatewayResetPath};
use crate::status::{coil, input};
use crate::store::{BreakerStore, JsonStore};
use crate::transport::ModbusLink;

pub fn refused() -> BreakerError {
    BreakerError::transport(
        "10.1.1.1:502",
        TransportStage::Connect,
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
    )
}

/// A breaker behind a gateway. Switch coil writes take effect after
/// `settle_reads` further status reads, like the real mechanism does.
pub struct ScriptedLink {
    status: Mutex<u16>,
    read_failures: Mutex<VecDeque<Option<BreakerError>>>,
    write_failure: Mutex<Option<BreakerError>>,
    pending_switch: Mutex<Option<(u16, u32)>>,
    follow_writes: bool,
    settle_reads: u32,
    input: Mutex<HashMap<u16, u16>>,
    holding: Mutex<HashMap<u16, u16>>,
    coil_writes: Mutex<Vec<(u16, CoilValue)>>,
    reads: AtomicUsize,
}

impl ScriptedLink {
    pub fn with_status(word: u16) -> Self {
        Self {
            status: Mutex::new(word),
            read_failures: Mutex::new(VecDeque::new()),
            write_failure: Mutex::new(None),
            pending_switch: Mutex::new(None),
            follow_writes: true,
            settle_reads: 1,
            input: Mutex::new(HashMap::new()),
            holding: Mutex::new(HashMap::new()),
            coil_writes: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// The switch never moves, whatever is written.
    pub fn stuck(word: u16) -> Self {
        Self {
            follow_writes: false,
            ..Self::with_status(word)
        }
    }

    pub fn settling_after(mut self, reads: u32) -> Self {
        self.settle_reads = reads;
        self
    }

    pub fn set_status(&self, word: u16) {
        *self.status.lock().unwrap() = word;
    }

    pub fn fail_next_reads(&self, errors: Vec<BreakerError>) {
        self.read_failures.lock().unwrap().extend(errors.into_iter().map(Some));
    }

    /// Let `skip` reads through, then fail the following ones.
    pub fn fail_reads_after(&self, skip: usize, errors: Vec<BreakerError>) {
        let mut plan = self.read_failures.lock().unwrap();
        plan.extend(std::iter::repeat_with(|| None).take(skip));
        plan.extend(errors.into_iter().map(Some));
    }

    pub fn fail_next_write(&self, error: BreakerError) {
        *self.write_failure.lock().unwrap() = Some(error);
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.input.lock().unwrap().insert(address, value);
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.holding.lock().unwrap().insert(address, value);
    }

    pub fn coil_writes(&self) -> Vec<(u16, CoilValue)> {
        self.coil_writes.lock().unwrap().clone()
    }

    pub fn switch_writes(&self) -> usize {
        self.coil_writes()
            .iter()
            .filter(|(address, _)| *address == coil::REMOTE_SWITCH)
            .count()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn read_status(&self) -> u16 {
        let mut pending = self.pending_switch.lock().unwrap();
        if let Some((word, remaining)) = pending.take() {
            if remaining <= 1 {
                *self.status.lock().unwrap() = word;
            } else {
                *pending = Some((word, remaining - 1));
            }
        }
        *self.status.lock().unwrap()
    }

    fn block(map: &Mutex<HashMap<u16, u16>>, address: u16, quantity: u16) -> Vec<u16> {
        let map = map.lock().unwrap();
        (address..address + quantity)
            .map(|a| map.get(&a).copied().unwrap_or(0))
            .collect()
    }
}

#[async_trait]
impl ModbusLink for ScriptedLink {
    async fn execute(&self, _endpoint: &Endpoint, request: Request) -> BreakerResult<Response> {
        match request {
            Request::ReadInputRegisters { address, quantity } => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                if let Some(Some(err)) = self.read_failures.lock().unwrap().pop_front() {
                    return Err(err);
                }
                if address == input::STATUS && quantity == 1 {
                    return Ok(Response::Registers(vec![self.read_status()]));
                }
                Ok(Response::Registers(Self::block(&self.input, address, quantity)))
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                if let Some(Some(err)) = self.read_failures.lock().unwrap().pop_front() {
                    return Err(err);
                }
                Ok(Response::Registers(Self::block(&self.holding, address, quantity)))
            }
            Request::WriteSingleCoil { address, value } => {
                if let Some(err) = self.write_failure.lock().unwrap().take() {
                    return Err(err);
                }
                self.coil_writes.lock().unwrap().push((address, value));
                if address == coil::REMOTE_SWITCH && self.follow_writes {
                    let high = *self.status.lock().unwrap() & 0xFF00;
                    let low = if value == CoilValue::On { 0x00F0 } else { 0x000F };
                    *self.pending_switch.lock().unwrap() = Some((high | low, self.settle_reads));
                }
                Ok(Response::CoilWritten { address, value })
            }
        }
    }
}

#[derive(Default)]
pub struct FakeGateway {
    resets: AtomicUsize,
}

impl FakeGateway {
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayReset for FakeGateway {
    async fn reset_gateway(&self, _endpoint: &Endpoint) -> BreakerResult<GatewayResetPath> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayResetPath::SocketFlush { opened: 0 })
    }
}

/// In-memory store that counts state writes and liveness refreshes.
pub struct CountingStore {
    inner: JsonStore,
    state_writes: AtomicUsize,
    touches: AtomicUsize,
}

impl Default for CountingStore {
    fn default() -> Self {
        Self {
            inner: JsonStore::in_memory(),
            state_writes: AtomicUsize::new(0),
            touches: AtomicUsize::new(0),
        }
    }
}

impl CountingStore {
    pub fn state_writes(&self) -> usize {
        self.state_writes.load(Ordering::SeqCst)
    }

    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BreakerStore for CountingStore {
    async fn list_enabled(&self) -> BreakerResult<Vec<Breaker>> {
        self.inner.list_enabled().await
    }

    async fn breaker(&self, id: BreakerId) -> BreakerResult<Breaker> {
        self.inner.breaker(id).await
    }

    async fn upsert_breaker(&self, breaker: Breaker) -> BreakerResult<()> {
        self.inner.upsert_breaker(breaker).await
    }

    async fn record_state(
        &self,
        id: BreakerId,
        status: BreakerStatus,
        local_lock: bool,
        at: DateTime<Utc>,
    ) -> BreakerResult<()> {
        self.state_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.record_state(id, status, local_lock, at).await
    }

    async fn touch(&self, id: BreakerId, at: DateTime<Utc>, reachable: bool) -> BreakerResult<()> {
        self.touches.fetch_add(1, Ordering::SeqCst);
        self.inner.touch(id, at, reachable).await
    }

    async fn set_remote_lock(&self, id: BreakerId, locked: bool) -> BreakerResult<()> {
        self.inner.set_remote_lock(id, locked).await
    }

    async fn save_electrical(&self, id: BreakerId, config: ElectricalConfig) -> BreakerResult<()> {
        self.inner.save_electrical(id, config).await
    }

    async fn save_operation(&self, operation: &ControlOperation) -> BreakerResult<()> {
        self.inner.save_operation(operation).await
    }

    async fn operation(&self, control_id: &str) -> BreakerResult<Option<ControlOperation>> {
        self.inner.operation(control_id).await
    }

    async fn load_monitor_config(&self) -> BreakerResult<Option<MonitorConfig>> {
        self.inner.load_monitor_config().await
    }

    async fn save_monitor_config(&self, config: &MonitorConfig) -> BreakerResult<()> {
        self.inner.save_monitor_config(config).await
    }
}

pub fn test_breaker(id: BreakerId) -> Breaker {
    Breaker::new(id, format!("cb-{}", id), Endpoint::new("10.1.1.1", 502, id as u8))
}
