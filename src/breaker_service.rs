use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ControlSettings;
use crate::error::{BreakerError, BreakerResult, LockSource};
use crate::models::{
    Breaker, BreakerId, BreakerStatus, ControlAction, ControlOperation, ControlOutcome, ElectricalConfig,
    Measurements, StatusReport,
};
use crate::modbus_frame::{CoilValue, FunctionCode};
use crate::recovery::{GatewayResetPath, RecoveryManager};
use crate::status::{self, coil, holding, input, DecodedStatus};
use crate::store::BreakerStore;
use crate::trip_reason::{decode_trip, TripDiagnosis};

// --- Safe operation phases ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPhase {
    Checking,
    AlreadyAtTarget,
    Locked,
    Commanding,
    Confirming,
    Succeeded,
    TimedOut,
    Failed,
}

/// Successful end of a safe close/open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeOutcome {
    pub outcome: ControlOutcome,
    /// Confirmation polls used, 0 when no command was needed.
    pub attempts: u32,
    pub elapsed: Duration,
}

// --- Breaker Service ---
/// Entry point for upstream callers: switching, status reads, lock and
/// maintenance commands. Every switching request goes through the safe
/// operation sequence (check, command, confirm).
pub struct BreakerService {
    store: Arc<dyn BreakerStore>,
    recovery: Arc<RecoveryManager>,
    settings: ControlSettings,
}

impl BreakerService {
    pub fn new(store: Arc<dyn BreakerStore>, recovery: Arc<RecoveryManager>, settings: ControlSettings) -> Self {
        Self {
            store,
            recovery,
            settings,
        }
    }

    async fn read_status(&self, breaker: &Breaker) -> BreakerResult<DecodedStatus> {
        let values = self
            .recovery
            .read_with_retry(&breaker.endpoint, FunctionCode::ReadInputRegisters, input::STATUS, 1)
            .await?;
        first_word(&values).map(status::decode)
    }

    /// Live status read. An unreachable device is reported as `Unknown`
    /// together with the last mirrored state.
    pub async fn get_breaker_status(&self, id: BreakerId) -> BreakerResult<StatusReport> {
        let breaker = self.store.breaker(id).await?;
        let report = match self.read_status(&breaker).await {
            Ok(decoded) => StatusReport {
                breaker_id: id,
                status: decoded.status(),
                locally_locked: Some(decoded.locally_locked),
                remotely_locked: breaker.is_locked,
                reachable: true,
                raw_status: Some(decoded.raw),
                last_known: breaker.status,
                last_update: breaker.last_update,
                error: None,
            },
            Err(e) => {
                warn!(breaker_id = id, "Status read failed: {}", e);
                StatusReport {
                    breaker_id: id,
                    status: BreakerStatus::Unknown,
                    locally_locked: None,
                    remotely_locked: breaker.is_locked,
                    reachable: false,
                    raw_status: None,
                    last_known: breaker.status,
                    last_update: breaker.last_update,
                    error: Some(e.to_string()),
                }
            }
        };
        Ok(report)
    }

    /// Run one control request to a terminal state. The returned operation
    /// carries success or the error kind; `Err` only means the breaker or the
    /// operation record could not be found or created.
    pub async fn set_breaker(&self, id: BreakerId, action: ControlAction) -> BreakerResult<ControlOperation> {
        let breaker = self.store.breaker(id).await?;
        let mut operation = ControlOperation::new(id, action);
        self.store.save_operation(&operation).await?;

        operation.begin();
        self.store.save_operation(&operation).await?;
        info!(
            breaker_id = id,
            control_id = %operation.control_id,
            "Control {:?} started on {}",
            action,
            breaker.name
        );

        let result = match action {
            ControlAction::On => self.safe_close(&breaker).await,
            ControlAction::Off => self.safe_open(&breaker).await,
            ControlAction::Toggle => self.toggle(&breaker).await,
        };

        match &result {
            Ok(done) => {
                operation.complete(done.outcome, done.attempts);
                info!(
                    breaker_id = id,
                    control_id = %operation.control_id,
                    "Control {:?} finished: {:?} after {} polls in {:?}",
                    action,
                    done.outcome,
                    done.attempts,
                    done.elapsed
                );
            }
            Err(e) => {
                operation.fail(e);
                warn!(
                    breaker_id = id,
                    control_id = %operation.control_id,
                    "Control {:?} failed: {}",
                    action,
                    e
                );
            }
        }

        if let Err(e) = self.store.save_operation(&operation).await {
            error!(control_id = %operation.control_id, "Failed to persist terminal operation: {}", e);
        }
        Ok(operation)
    }

    pub async fn operation(&self, control_id: &str) -> BreakerResult<Option<ControlOperation>> {
        self.store.operation(control_id).await
    }

    pub async fn safe_close(&self, breaker: &Breaker) -> BreakerResult<SafeOutcome> {
        self.drive(breaker, true).await
    }

    pub async fn safe_open(&self, breaker: &Breaker) -> BreakerResult<SafeOutcome> {
        self.drive(breaker, false).await
    }

    /// Read the current position and drive the breaker to the other one.
    pub async fn toggle(&self, breaker: &Breaker) -> BreakerResult<SafeOutcome> {
        let current = self.read_status(breaker).await?;
        match current.closed() {
            Some(true) => self.safe_open(breaker).await,
            Some(false) => self.safe_close(breaker).await,
            None => Err(BreakerError::UnsupportedOperation(format!(
                "cannot toggle from unknown switch state 0x{:04X}",
                current.raw
            ))),
        }
    }

    async fn drive(&self, breaker: &Breaker, close: bool) -> BreakerResult<SafeOutcome> {
        let started = Instant::now();
        let target = if close { "close" } else { "open" };
        if !breaker.is_controllable {
            return Err(BreakerError::UnsupportedOperation(format!(
                "breaker {} is not remotely controllable",
                breaker.id
            )));
        }

        debug!(breaker_id = breaker.id, phase = ?ControlPhase::Checking, "safe {}", target);
        let current = self
            .read_status(breaker)
            .await
            .inspect_err(|e| debug!(breaker_id = breaker.id, phase = ?ControlPhase::Failed, "safe {}: {}", target, e))?;
        if current.closed() == Some(close) {
            debug!(breaker_id = breaker.id, phase = ?ControlPhase::AlreadyAtTarget, "safe {}", target);
            self.mirror(breaker, &current).await;
            return Ok(SafeOutcome {
                outcome: ControlOutcome::AlreadyAtTarget,
                attempts: 0,
                elapsed: started.elapsed(),
            });
        }
        if current.locally_locked {
            debug!(breaker_id = breaker.id, phase = ?ControlPhase::Locked, "safe {}", target);
            return Err(BreakerError::DeviceLocked { lock: LockSource::Local });
        }
        if breaker.is_locked {
            debug!(breaker_id = breaker.id, phase = ?ControlPhase::Locked, "safe {}", target);
            return Err(BreakerError::DeviceLocked { lock: LockSource::Remote });
        }

        debug!(breaker_id = breaker.id, phase = ?ControlPhase::Commanding, "safe {}", target);
        self.recovery
            .link()
            .write_single_coil(&breaker.endpoint, coil::REMOTE_SWITCH, CoilValue::from(close))
            .await
            .inspect_err(|e| debug!(breaker_id = breaker.id, phase = ?ControlPhase::Failed, "safe {}: {}", target, e))?;

        debug!(breaker_id = breaker.id, phase = ?ControlPhase::Confirming, "safe {}", target);
        let attempts = self.settings.confirm_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.settings.confirm_interval()).await;
            let read = self
                .recovery
                .link()
                .read_input_registers(&breaker.endpoint, input::STATUS, 1)
                .await
                .and_then(|values| first_word(&values).map(status::decode));
            match read {
                Ok(decoded) if decoded.closed() == Some(close) => {
                    debug!(breaker_id = breaker.id, phase = ?ControlPhase::Succeeded, attempt, "safe {}", target);
                    self.mirror(breaker, &decoded).await;
                    return Ok(SafeOutcome {
                        outcome: ControlOutcome::Succeeded,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(decoded) => debug!(
                    breaker_id = breaker.id,
                    "Confirmation {}/{}: status 0x{:04X} not yet {}",
                    attempt,
                    attempts,
                    decoded.raw,
                    target
                ),
                Err(e) => debug!(
                    breaker_id = breaker.id,
                    "Confirmation {}/{} read failed: {}",
                    attempt,
                    attempts,
                    e
                ),
            }
        }

        debug!(breaker_id = breaker.id, phase = ?ControlPhase::TimedOut, "safe {}", target);
        Err(BreakerError::OperationTimedOut { attempts })
    }

    /// Store a state that a device read just confirmed.
    async fn mirror(&self, breaker: &Breaker, decoded: &DecodedStatus) {
        if let Err(e) = self
            .store
            .record_state(breaker.id, decoded.status(), decoded.locally_locked, chrono::Utc::now())
            .await
        {
            error!(breaker_id = breaker.id, "Failed to mirror confirmed state: {}", e);
        }
    }

    /// Issue the remote lock command and make the stored flag authoritative.
    pub async fn set_remote_lock(&self, id: BreakerId, locked: bool) -> BreakerResult<Breaker> {
        let breaker = self.store.breaker(id).await?;
        self.recovery
            .link()
            .write_single_coil(&breaker.endpoint, coil::REMOTE_LOCK, CoilValue::from(locked))
            .await?;
        self.store.set_remote_lock(id, locked).await?;
        info!(breaker_id = id, "Remote lock {}", if locked { "engaged" } else { "released" });
        self.store.breaker(id).await
    }

    /// Operator-initiated controller reboot.
    pub async fn reset_device(&self, id: BreakerId) -> BreakerResult<()> {
        let breaker = self.store.breaker(id).await?;
        self.recovery.reset_device(&breaker.endpoint).await
    }

    /// Operator-initiated gateway reset, the same sequence a refused read runs.
    pub async fn reset_gateway(&self, id: BreakerId) -> BreakerResult<GatewayResetPath> {
        let breaker = self.store.breaker(id).await?;
        self.recovery.reset_gateway(&breaker.endpoint).await
    }

    pub async fn trip_diagnosis(&self, id: BreakerId) -> BreakerResult<TripDiagnosis> {
        let breaker = self.store.breaker(id).await?;
        let values = self
            .recovery
            .read_with_retry(&breaker.endpoint, FunctionCode::ReadInputRegisters, input::TRIP_REASON, 1)
            .await?;
        let diagnosis = first_word(&values).map(decode_trip)?;
        if diagnosis.tripped() {
            let names: Vec<&str> = diagnosis.causes.iter().map(|c| c.name()).collect();
            info!(breaker_id = id, "Trip record 0x{:04X}: {}", diagnosis.raw, names.join(", "));
        }
        Ok(diagnosis)
    }

    pub async fn read_measurements(&self, id: BreakerId) -> BreakerResult<Measurements> {
        let breaker = self.store.breaker(id).await?;
        let values = self
            .recovery
            .read_with_retry(
                &breaker.endpoint,
                FunctionCode::ReadInputRegisters,
                input::MEASUREMENT_START,
                input::MEASUREMENT_COUNT,
            )
            .await?;
        status::decode_measurements(&values)
    }

    /// Read the programmed thresholds once and keep them with the breaker.
    pub async fn refresh_electrical_config(&self, id: BreakerId) -> BreakerResult<ElectricalConfig> {
        let breaker = self.store.breaker(id).await?;
        let values = self
            .recovery
            .read_with_retry(
                &breaker.endpoint,
                FunctionCode::ReadHoldingRegisters,
                holding::THRESHOLD_START,
                holding::THRESHOLD_COUNT,
            )
            .await?;
        let config = status::decode_electrical_config(&values)?;
        self.store.save_electrical(id, config.clone()).await?;
        Ok(config)
    }
}

fn first_word(values: &[u16]) -> BreakerResult<u16> {
    values
        .first()
        .copied()
        .ok_or_else(|| BreakerError::malformed("empty register response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::OperationStatus;
    use crate::recovery::RecoveryManager;
    use crate::store::JsonStore;
    use crate::test_support::{refused, test_breaker, FakeGateway, ScriptedLink};

    struct Rig {
        link: Arc<ScriptedLink>,
        store: Arc<JsonStore>,
        service: BreakerService,
    }

    async fn rig(link: ScriptedLink, breaker: Breaker) -> Rig {
        let link = Arc::new(link);
        let store = Arc::new(JsonStore::in_memory());
        store.upsert_breaker(breaker).await.unwrap();
        let recovery = Arc::new(RecoveryManager::new(
            link.clone(),
            Arc::new(FakeGateway::default()),
            Duration::ZERO,
        ));
        let settings = ControlSettings {
            confirm_attempts: 10,
            confirm_interval_ms: 0,
        };
        let service = BreakerService::new(store.clone(), recovery, settings);
        Rig { link, store, service }
    }

    #[tokio::test]
    async fn close_from_off_confirms_and_records() {
        let rig = rig(ScriptedLink::with_status(0x000F).settling_after(3), test_breaker(1)).await;
        let op = rig.service.set_breaker(1, ControlAction::On).await.unwrap();

        assert!(op.success);
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.outcome, Some(ControlOutcome::Succeeded));
        assert_eq!(op.confirm_attempts, 3);
        assert_eq!(rig.link.coil_writes(), vec![(coil::REMOTE_SWITCH, CoilValue::On)]);

        let stored = rig.service.operation(&op.control_id).await.unwrap().unwrap();
        assert!(stored.success);
        assert_eq!(stored.status, OperationStatus::Completed);
        assert_eq!(rig.store.breaker(1).await.unwrap().status, BreakerStatus::On);
    }

    #[tokio::test]
    async fn safe_close_is_idempotent() {
        let rig = rig(ScriptedLink::with_status(0x00F0), test_breaker(1)).await;
        let breaker = rig.store.breaker(1).await.unwrap();

        let first = rig.service.safe_close(&breaker).await.unwrap();
        let second = rig.service.safe_close(&breaker).await.unwrap();
        assert_eq!(first.outcome, ControlOutcome::AlreadyAtTarget);
        assert_eq!(second.outcome, ControlOutcome::AlreadyAtTarget);
        assert_eq!(rig.link.switch_writes(), 0);
    }

    #[tokio::test]
    async fn locally_locked_device_is_never_commanded() {
        let rig = rig(ScriptedLink::with_status(0x01F0), test_breaker(1)).await;
        let breaker = rig.store.breaker(1).await.unwrap();

        let err = rig.service.safe_open(&breaker).await.unwrap_err();
        assert!(matches!(err, BreakerError::DeviceLocked { lock: LockSource::Local }));
        assert!(rig.link.coil_writes().is_empty());

        rig.link.set_status(0x010F);
        let err = rig.service.safe_close(&breaker).await.unwrap_err();
        assert!(matches!(err, BreakerError::DeviceLocked { lock: LockSource::Local }));
        assert!(rig.link.coil_writes().is_empty());
    }

    #[tokio::test]
    async fn remote_lock_from_store_blocks_switching() {
        let mut breaker = test_breaker(1);
        breaker.is_locked = true;
        let rig = rig(ScriptedLink::with_status(0x000F), breaker).await;

        let op = rig.service.set_breaker(1, ControlAction::On).await.unwrap();
        assert_eq!(op.outcome, Some(ControlOutcome::Locked));
        assert_eq!(op.error_kind, Some(ErrorKind::DeviceLocked));
        assert_eq!(rig.link.switch_writes(), 0);
    }

    #[tokio::test]
    async fn unconfirmed_command_times_out_without_touching_status() {
        let rig = rig(ScriptedLink::stuck(0x000F), test_breaker(1)).await;
        let op = rig.service.set_breaker(1, ControlAction::On).await.unwrap();

        assert!(!op.success);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.outcome, Some(ControlOutcome::TimedOut));
        assert_eq!(op.confirm_attempts, 10);
        assert_eq!(rig.link.switch_writes(), 1);
        // 1 pre-check read + 10 confirmation polls
        assert_eq!(rig.link.reads(), 11);
        assert_eq!(rig.store.breaker(1).await.unwrap().status, BreakerStatus::Unknown);
    }

    #[tokio::test]
    async fn confirmation_tolerates_transient_read_errors() {
        let rig = rig(ScriptedLink::with_status(0x00F0), test_breaker(1)).await;
        let breaker = rig.store.breaker(1).await.unwrap();
        // pre-check passes, the first two confirmation polls fail
        rig.link.fail_reads_after(
            1,
            vec![refused(), BreakerError::timed_out("10.1.1.1:502", crate::error::TransportStage::Read)],
        );

        let outcome = rig.service.safe_open(&breaker).await.unwrap();
        assert_eq!(outcome.outcome, ControlOutcome::Succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(rig.link.switch_writes(), 1);
        assert_eq!(rig.store.breaker(1).await.unwrap().status, BreakerStatus::Off);
    }

    #[tokio::test]
    async fn toggle_reads_then_drives_the_opposite_way() {
        let rig = rig(ScriptedLink::with_status(0x00F0), test_breaker(1)).await;
        let op = rig.service.set_breaker(1, ControlAction::Toggle).await.unwrap();
        assert!(op.success);
        assert_eq!(rig.link.coil_writes(), vec![(coil::REMOTE_SWITCH, CoilValue::Off)]);
        assert_eq!(rig.store.breaker(1).await.unwrap().status, BreakerStatus::Off);
    }

    #[tokio::test]
    async fn toggle_refuses_unknown_position() {
        let rig = rig(ScriptedLink::with_status(0x0033), test_breaker(1)).await;
        let breaker = rig.store.breaker(1).await.unwrap();
        let err = rig.service.toggle(&breaker).await.unwrap_err();
        assert!(matches!(err, BreakerError::UnsupportedOperation(_)));
        assert!(rig.link.coil_writes().is_empty());
    }

    #[tokio::test]
    async fn non_controllable_breaker_is_rejected() {
        let mut breaker = test_breaker(1);
        breaker.is_controllable = false;
        let rig = rig(ScriptedLink::with_status(0x000F), breaker).await;
        let op = rig.service.set_breaker(1, ControlAction::On).await.unwrap();
        assert_eq!(op.error_kind, Some(ErrorKind::UnsupportedOperation));
        assert_eq!(rig.link.reads(), 0);
    }

    #[tokio::test]
    async fn unknown_breaker_is_an_error() {
        let rig = rig(ScriptedLink::with_status(0x000F), test_breaker(1)).await;
        assert!(matches!(
            rig.service.set_breaker(99, ControlAction::On).await,
            Err(BreakerError::BreakerNotFound(99))
        ));
    }

    #[tokio::test]
    async fn failed_status_read_reports_unknown_not_a_guess() {
        let rig = rig(ScriptedLink::with_status(0x00F0), test_breaker(1)).await;
        rig.store.record_state(1, BreakerStatus::On, false, chrono::Utc::now()).await.unwrap();
        rig.link.fail_next_reads(vec![refused(), refused()]);

        let report = rig.service.get_breaker_status(1).await.unwrap();
        assert_eq!(report.status, BreakerStatus::Unknown);
        assert!(!report.reachable);
        assert_eq!(report.last_known, BreakerStatus::On);
        assert!(report.locally_locked.is_none());
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn status_report_keeps_remote_lock_from_store() {
        let mut breaker = test_breaker(1);
        breaker.is_locked = true;
        let rig = rig(ScriptedLink::with_status(0x000F), breaker).await;
        let report = rig.service.get_breaker_status(1).await.unwrap();
        assert_eq!(report.status, BreakerStatus::Off);
        assert_eq!(report.locally_locked, Some(false));
        assert!(report.remotely_locked);
    }

    #[tokio::test]
    async fn remote_lock_command_is_persisted() {
        let rig = rig(ScriptedLink::with_status(0x000F), test_breaker(1)).await;
        let breaker = rig.service.set_remote_lock(1, true).await.unwrap();
        assert!(breaker.is_locked);
        assert_eq!(rig.link.coil_writes(), vec![(coil::REMOTE_LOCK, CoilValue::On)]);
    }

    #[tokio::test]
    async fn rejected_switch_command_fails_without_confirming() {
        let rig = rig(ScriptedLink::with_status(0x000F), test_breaker(1)).await;
        rig.link.fail_next_write(BreakerError::ProtocolException { function: 0x05, code: 0x04 });
        let op = rig.service.set_breaker(1, ControlAction::On).await.unwrap();

        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.outcome, Some(ControlOutcome::Failed));
        assert_eq!(op.error_kind, Some(ErrorKind::ProtocolException));
        // pre-check only, no confirmation polls
        assert_eq!(rig.link.reads(), 1);
    }

    #[tokio::test]
    async fn failed_lock_write_leaves_flag_alone() {
        let rig = rig(ScriptedLink::with_status(0x000F), test_breaker(1)).await;
        rig.link.fail_next_write(BreakerError::ProtocolException { function: 0x05, code: 0x04 });
        assert!(rig.service.set_remote_lock(1, true).await.is_err());
        assert!(!rig.store.breaker(1).await.unwrap().is_locked);
    }

    #[tokio::test]
    async fn diagnostics_and_provisioning_reads() {
        let rig = rig(ScriptedLink::with_status(0x000F), test_breaker(1)).await;
        rig.link.set_input(input::TRIP_REASON, 0x0001);
        rig.link.set_input(input::VOLTAGE, 231);
        rig.link.set_holding(holding::RATED_CURRENT, 6300);

        let trip = rig.service.trip_diagnosis(1).await.unwrap();
        assert_eq!(trip.reasons, vec!["过流保护"]);

        let m = rig.service.read_measurements(1).await.unwrap();
        assert_eq!(m.voltage_v, 231);

        let cfg = rig.service.refresh_electrical_config(1).await.unwrap();
        assert_eq!(cfg.rated_current, 63.0);
        assert_eq!(rig.store.breaker(1).await.unwrap().electrical, Some(cfg));
    }

    #[tokio::test]
    async fn device_reset_is_explicit() {
        let rig = rig(ScriptedLink::with_status(0x000F), test_breaker(1)).await;
        rig.service.reset_device(1).await.unwrap();
        assert_eq!(rig.link.coil_writes(), vec![(coil::DEVICE_RESET, CoilValue::On)]);
    }
}
