//! Application state: the composition root wiring every service together.
//! Nothing here is a process-wide singleton — tests construct an
//! independent `AppState` with whatever fakes they need.

use std::sync::Arc;

use tracing::{info, warn};

use crate::arbiter::{ThreatArbiter, ThreatSignal};
use crate::audit::AuditLog;
use crate::bus::{BusEvent, EventBus};
use crate::config::SentinelConfig;
use crate::fingerprint::{FingerprintService, HardwareComponentSource};
use crate::ml::MlAnomalyDetector;
use crate::orchestrator::PersistenceOrchestrator;
use crate::persistence::mechanisms::{
    AlternateStreamPersistence, FileSystemPersistence, KernelPersistence, RegistryPersistence,
    SteganographyPersistence, WmiPersistence,
};
use crate::persistence::PersistenceMechanism;
use crate::rules::RuleEngine;
use crate::session::SessionTracker;
use crate::signatures::SignatureDatabase;

pub const REMOVE_ALL_CONFIRMATION_KEY_ENV: &str = "SENTINEL_REMOVE_ALL_KEY";

pub struct AppState {
    pub config: SentinelConfig,
    pub fingerprint: FingerprintService,
    pub orchestrator: PersistenceOrchestrator,
    pub signatures: SignatureDatabase,
    pub sessions: SessionTracker,
    pub ml: MlAnomalyDetector,
    pub rules: tokio::sync::Mutex<RuleEngine>,
    pub arbiter: ThreatArbiter,
    pub bus: EventBus,
    pub audit: AuditLog,
    pub remove_all_key: String,
}

impl AppState {
    pub fn new(config: SentinelConfig, hardware_source: Box<dyn HardwareComponentSource>) -> Arc<Self> {
        let fingerprint = FingerprintService::new(hardware_source);

        let base_dir = std::env::temp_dir().join("sentinel-markers");
        let mechanisms: Vec<Arc<dyn PersistenceMechanism>> = vec![
            Arc::new(FileSystemPersistence::new(base_dir.join("fs-primary"))),
            Arc::new(RegistryPersistence::new(base_dir.join("registry"))),
            Arc::new(AlternateStreamPersistence::new(base_dir.join("ads"))),
            Arc::new(WmiPersistence::new(base_dir.join("wmi"))),
            Arc::new(SteganographyPersistence::new(base_dir.join("stego"))),
            Arc::new(KernelPersistence),
        ];
        let orchestrator = PersistenceOrchestrator::new(mechanisms, config.persistence.min_required_locations);

        let remove_all_key =
            std::env::var(REMOVE_ALL_CONFIRMATION_KEY_ENV).unwrap_or_else(|_| "sentinel-default-confirm-key".to_string());

        let ml = MlAnomalyDetector::new(config.ml.auto_threshold, config.ml.target_fp_rate);
        for (key, threshold) in &config.ml.detection_threshold {
            match crate::ml::anomaly_type_from_str(key) {
                Some(anomaly_type) => ml.set_detection_threshold(anomaly_type, *threshold),
                None => warn!(%key, "unrecognized ml.detection_threshold key in config"),
            }
        }
        for (key, threshold) in &config.ml.confidence_threshold {
            match crate::ml::anomaly_type_from_str(key) {
                Some(anomaly_type) => ml.set_confidence_threshold(anomaly_type, *threshold),
                None => warn!(%key, "unrecognized ml.confidence_threshold key in config"),
            }
        }

        let audit_path = config.audit.log_path.as_ref().map(std::path::PathBuf::from);

        Arc::new(Self {
            fingerprint,
            orchestrator,
            signatures: SignatureDatabase::new(),
            sessions: SessionTracker::new(config.session.clone()),
            ml,
            rules: tokio::sync::Mutex::new(RuleEngine::new()),
            arbiter: ThreatArbiter::new(),
            bus: EventBus::default(),
            audit: AuditLog::new(audit_path),
            remove_all_key,
            config,
        })
    }

    pub fn broadcast(&self, event: BusEvent) {
        self.bus.publish(event);
    }
}

/// Combines rule hits and ML detections for one evaluated event into threat
/// signals and runs them through the arbiter, persisting the resulting
/// reports to the audit log and the bus. This is the synchronous core of
/// the event -> detection -> arbitration pipeline; callers (handlers, replay
/// tooling) drive it per event.
pub fn arbitrate_and_publish(state: &AppState, signals: Vec<ThreatSignal>) {
    let reports = state.arbiter.arbitrate(signals, &state.sessions);
    for report in reports {
        state.sessions.apply_penalty(
            report.player.as_ref().map(|p| p.account_id).unwrap_or(0),
            report.threat_type,
            report.confirmed,
        );
        state.audit.record(
            "arbiter",
            None,
            "threat.report",
            "account",
            &report.player.as_ref().map(|p| p.account_id.to_string()).unwrap_or_default(),
            &report.description,
            true,
            None,
        );
        state.broadcast(BusEvent::ThreatReport(report));
    }
}

/// Background maintenance task: drives the orchestrator's refresh tick,
/// session trust recovery and audit retention purge on fixed intervals.
pub async fn run_maintenance_loop(state: Arc<AppState>) {
    let mut refresh_ticker = tokio::time::interval(std::time::Duration::from_secs(
        (state.config.persistence.refresh_hours as u64).saturating_mul(3600).max(60),
    ));
    let mut trust_ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    let mut audit_ticker = tokio::time::interval(std::time::Duration::from_secs(3600));

    loop {
        tokio::select! {
            _ = refresh_ticker.tick() => {
                if state.config.persistence.auto_refresh {
                    if let Err(e) = state.orchestrator.refresh_tick(&state.fingerprint).await {
                        warn!(error = %e, "persistence refresh tick failed");
                    }
                }
            }
            _ = trust_ticker.tick() => {
                state.sessions.recover_trust_tick();
            }
            _ = audit_ticker.tick() => {
                let purged = state.audit.purge_older_than(state.config.audit.retention_days);
                if purged > 0 {
                    info!(purged, "audit log retention purge");
                    state.broadcast(BusEvent::AuditPurge { removed: purged as u64 });
                }
                let _ = state.audit.flush().await;
            }
        }
    }
}
