//! Decides once per process which adapters may be polled.
//!
//! Every adapter is read a single time. A permission-class failure discards the adapter for the
//! rest of the session so the OS never shows its permission dialog twice.

use std::{io, time::Duration};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::signal_api::{AdapterSlot, Reading, SignalAdapter, SignalError, SignalKind};

/// Lowercase fragments of error messages raised by permission or accessibility denials.
const PERMISSION_PATTERNS: [&str; 6] = [
    "permission",
    "accessibility",
    "denied",
    "not authorized",
    "not trusted",
    "not permitted",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    /// Disabled in settings, never probed.
    Unchecked,
    Granted,
    Denied,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    None,
    Partial,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapability {
    pub name: String,
    pub kind: SignalKind,
    pub status: CapabilityStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub capabilities: Vec<AdapterCapability>,
    pub overall: OverallStatus,
}

impl CapabilityReport {
    fn new(capabilities: Vec<AdapterCapability>) -> Self {
        let overall = overall_status(&capabilities);
        Self {
            capabilities,
            overall,
        }
    }

    pub fn status_of(&self, kind: SignalKind) -> Option<CapabilityStatus> {
        self.capabilities
            .iter()
            .find(|capability| capability.kind == kind)
            .map(|capability| capability.status)
    }

    pub fn is_granted(&self, kind: SignalKind) -> bool {
        self.status_of(kind) == Some(CapabilityStatus::Granted)
    }
}

fn overall_status(capabilities: &[AdapterCapability]) -> OverallStatus {
    let checked = capabilities
        .iter()
        .filter(|capability| capability.status != CapabilityStatus::Unchecked);
    let (granted, total) = checked.fold((0, 0), |(granted, total), capability| {
        let is_granted = capability.status == CapabilityStatus::Granted;
        (granted + usize::from(is_granted), total + 1)
    });
    match granted {
        0 => OverallStatus::None,
        granted if granted == total => OverallStatus::Full,
        _ => OverallStatus::Partial,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Permission,
    Other,
}

/// Typed [SignalError::PermissionDenied] and IO permission errors are recognised directly, opaque
/// library errors by their message.
pub fn classify_failure(error: &anyhow::Error) -> FailureClass {
    let typed = error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<SignalError>(),
            Some(SignalError::PermissionDenied(_))
        ) || cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied)
    });
    if typed {
        return FailureClass::Permission;
    }

    let message = format!("{error:#}").to_lowercase();
    if PERMISSION_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
    {
        FailureClass::Permission
    } else {
        FailureClass::Other
    }
}

/// Adapter that passed the probe together with the reading taken during it.
pub struct GrantedAdapter {
    pub adapter: Box<dyn SignalAdapter>,
    pub baseline: Reading,
}

pub struct PermissionGate {
    pending: Vec<AdapterSlot>,
    disabled: Vec<SignalKind>,
    granted: Vec<GrantedAdapter>,
    report: Option<CapabilityReport>,
}

impl PermissionGate {
    /// Slots whose kind is not `enabled` are reported as unchecked and never touched.
    pub fn new(slots: Vec<AdapterSlot>, enabled: impl Fn(SignalKind) -> bool) -> Self {
        let (pending, disabled): (Vec<_>, Vec<_>) =
            slots.into_iter().partition(|slot| enabled(slot.kind()));
        Self {
            pending,
            disabled: disabled.iter().map(AdapterSlot::kind).collect(),
            granted: vec![],
            report: None,
        }
    }

    /// Probes every adapter on the first call. Later calls return the cached report and never
    /// touch an adapter again. A probe read that takes longer than `timeout` makes its adapter
    /// unavailable.
    pub async fn probe(&mut self, timeout: Duration) -> CapabilityReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        let mut capabilities = self
            .disabled
            .iter()
            .map(|kind| capability(*kind, CapabilityStatus::Unchecked, Some("disabled in settings".into())))
            .collect::<Vec<_>>();

        for slot in std::mem::take(&mut self.pending) {
            let entry = match slot {
                AdapterSlot::Unavailable { kind, reason } => {
                    info!("Adapter {kind} is unavailable: {reason}");
                    capability(kind, CapabilityStatus::Unavailable, Some(reason))
                }
                AdapterSlot::Available(adapter) => {
                    let kind = adapter.kind();
                    match probe_read(adapter, timeout).await {
                        Ok((adapter, baseline)) => {
                            info!("Adapter {kind} granted");
                            self.granted.push(GrantedAdapter { adapter, baseline });
                            capability(kind, CapabilityStatus::Granted, None)
                        }
                        Err(e) => match classify_failure(&e) {
                            FailureClass::Permission => {
                                warn!("Adapter {kind} denied, disabling it for this session {e:?}");
                                capability(kind, CapabilityStatus::Denied, Some(format!("{e:#}")))
                            }
                            FailureClass::Other => {
                                warn!("Adapter {kind} failed its probe {e:?}");
                                capability(kind, CapabilityStatus::Unavailable, Some(format!("{e:#}")))
                            }
                        },
                    }
                }
            };
            capabilities.push(entry);
        }

        capabilities.sort_by_key(|capability| capability.kind);
        let report = CapabilityReport::new(capabilities);
        info!("Permission probe finished with {:?}", report.overall);
        self.report = Some(report.clone());
        report
    }

    pub fn report(&self) -> Option<&CapabilityReport> {
        self.report.as_ref()
    }

    /// Hands granted adapters to the scheduler. Only the first caller receives them.
    pub fn take_granted(&mut self) -> Vec<GrantedAdapter> {
        std::mem::take(&mut self.granted)
    }

    /// Sticky denial for an adapter that hit a permission error after the probe.
    pub fn revoke(&mut self, kind: SignalKind, detail: String) {
        let Some(report) = self.report.as_mut() else {
            return;
        };
        if let Some(entry) = report
            .capabilities
            .iter_mut()
            .find(|capability| capability.kind == kind)
        {
            warn!("Revoking adapter {kind}: {detail}");
            entry.status = CapabilityStatus::Denied;
            entry.detail = Some(detail);
        }
        report.overall = overall_status(&report.capabilities);
    }
}

/// Reads once on the blocking pool. The adapter comes back only when the read succeeded in time.
async fn probe_read(
    mut adapter: Box<dyn SignalAdapter>,
    timeout: Duration,
) -> Result<(Box<dyn SignalAdapter>, Reading)> {
    let read = tokio::task::spawn_blocking(move || -> Result<(Box<dyn SignalAdapter>, Reading)> {
        let reading = adapter.read()?;
        Ok((adapter, reading))
    });

    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(anyhow!("Adapter probe did not complete {e}")),
        Err(_) => Err(anyhow!("Adapter probe took longer than {timeout:?}")),
    }
}

fn capability(kind: SignalKind, status: CapabilityStatus, detail: Option<String>) -> AdapterCapability {
    AdapterCapability {
        name: kind.capability_name().to_string(),
        kind,
        status,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use anyhow::anyhow;

    use crate::signal_api::{
        AdapterSlot, MockSignalAdapter, PointerPosition, Reading, SignalError, SignalKind,
    };

    use super::{
        CapabilityStatus, FailureClass, OverallStatus, PermissionGate, classify_failure,
    };

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn granted_mock(kind: SignalKind, reading: Reading) -> AdapterSlot {
        let mut adapter = MockSignalAdapter::new();
        adapter.expect_kind().return_const(kind);
        adapter
            .expect_read()
            .times(1)
            .returning(move || Ok(reading.clone()));
        AdapterSlot::Available(Box::new(adapter))
    }

    fn failing_mock(kind: SignalKind, message: &'static str) -> AdapterSlot {
        let mut adapter = MockSignalAdapter::new();
        adapter.expect_kind().return_const(kind);
        adapter
            .expect_read()
            .times(1)
            .returning(move || Err(anyhow!(message)));
        AdapterSlot::Available(Box::new(adapter))
    }

    #[tokio::test]
    async fn denial_is_cached_and_never_reprobed() {
        let mut gate = PermissionGate::new(
            vec![failing_mock(SignalKind::Pointer, "accessibility access denied")],
            |_| true,
        );

        let first = gate.probe(TIMEOUT).await;
        let second = gate.probe(TIMEOUT).await;

        assert_eq!(first, second);
        assert_eq!(first.status_of(SignalKind::Pointer), Some(CapabilityStatus::Denied));
        assert_eq!(first.overall, OverallStatus::None);
        assert!(gate.take_granted().is_empty());
    }

    #[tokio::test]
    async fn other_errors_mark_adapter_unavailable() {
        let mut gate = PermissionGate::new(
            vec![
                failing_mock(SignalKind::Window, "display connection closed"),
                AdapterSlot::Unavailable {
                    kind: SignalKind::Idle,
                    reason: "library missing".into(),
                },
            ],
            |_| true,
        );

        let report = gate.probe(TIMEOUT).await;

        assert_eq!(report.status_of(SignalKind::Window), Some(CapabilityStatus::Unavailable));
        assert_eq!(report.status_of(SignalKind::Idle), Some(CapabilityStatus::Unavailable));
        assert_eq!(report.overall, OverallStatus::None);
    }

    #[tokio::test]
    async fn mixed_results_are_partial_and_keep_baseline() {
        let position = PointerPosition { x: 4, y: 2 };
        let mut gate = PermissionGate::new(
            vec![
                granted_mock(SignalKind::Idle, Reading::IdleMs(10)),
                granted_mock(SignalKind::Pointer, Reading::Pointer(position)),
                failing_mock(SignalKind::Window, "Operation not permitted"),
            ],
            |_| true,
        );

        let report = gate.probe(TIMEOUT).await;
        gate.probe(TIMEOUT).await;

        assert_eq!(report.overall, OverallStatus::Partial);
        assert_eq!(report.status_of(SignalKind::Window), Some(CapabilityStatus::Denied));
        let granted = gate.take_granted();
        assert_eq!(granted.len(), 2);
        assert_eq!(granted[1].baseline, Reading::Pointer(position));
        assert!(gate.take_granted().is_empty());
    }

    #[tokio::test]
    async fn all_granted_is_full() {
        let mut gate = PermissionGate::new(
            vec![
                granted_mock(SignalKind::Idle, Reading::IdleMs(0)),
                granted_mock(SignalKind::Pointer, Reading::Pointer(PointerPosition { x: 0, y: 0 })),
            ],
            |_| true,
        );
        assert_eq!(gate.probe(TIMEOUT).await.overall, OverallStatus::Full);
    }

    #[tokio::test]
    async fn disabled_kinds_are_never_probed() {
        let mut adapter = MockSignalAdapter::new();
        adapter.expect_kind().return_const(SignalKind::Window);
        adapter.expect_read().never();
        let mut gate = PermissionGate::new(
            vec![
                AdapterSlot::Available(Box::new(adapter)),
                granted_mock(SignalKind::Idle, Reading::IdleMs(0)),
            ],
            |kind| kind != SignalKind::Window,
        );

        let report = gate.probe(TIMEOUT).await;

        assert_eq!(report.status_of(SignalKind::Window), Some(CapabilityStatus::Unchecked));
        assert_eq!(report.overall, OverallStatus::Full);
    }

    #[tokio::test]
    async fn hung_probe_read_is_bounded_by_timeout() {
        let mut adapter = MockSignalAdapter::new();
        adapter.expect_kind().return_const(SignalKind::Idle);
        adapter.expect_read().returning(|| {
            std::thread::sleep(Duration::from_millis(600));
            Ok(Reading::IdleMs(0))
        });
        let mut gate = PermissionGate::new(
            vec![
                AdapterSlot::Available(Box::new(adapter)),
                granted_mock(SignalKind::Pointer, Reading::Pointer(PointerPosition { x: 0, y: 0 })),
            ],
            |_| true,
        );

        let started = Instant::now();
        let report = gate.probe(Duration::from_millis(50)).await;

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(report.status_of(SignalKind::Idle), Some(CapabilityStatus::Unavailable));
        assert_eq!(report.status_of(SignalKind::Pointer), Some(CapabilityStatus::Granted));
        assert_eq!(report.overall, OverallStatus::Partial);
        assert_eq!(gate.take_granted().len(), 1);
    }

    #[tokio::test]
    async fn revoke_turns_granted_into_denied() {
        let mut gate = PermissionGate::new(
            vec![
                granted_mock(SignalKind::Idle, Reading::IdleMs(0)),
                granted_mock(SignalKind::Pointer, Reading::Pointer(PointerPosition { x: 0, y: 0 })),
            ],
            |_| true,
        );
        gate.probe(TIMEOUT).await;

        gate.revoke(SignalKind::Pointer, "accessibility revoked".into());

        let report = gate.report().cloned().unwrap();
        assert_eq!(report.status_of(SignalKind::Pointer), Some(CapabilityStatus::Denied));
        assert_eq!(report.overall, OverallStatus::Partial);
        assert_eq!(gate.probe(TIMEOUT).await, report);
    }

    #[test]
    fn classification_uses_types_then_messages() {
        let typed = anyhow::Error::from(SignalError::PermissionDenied("process 4".into()));
        let io = anyhow::Error::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        let wrapped = anyhow!("Not authorized to send Apple events").context("window query");

        assert_eq!(classify_failure(&typed), FailureClass::Permission);
        assert_eq!(classify_failure(&io), FailureClass::Permission);
        assert_eq!(classify_failure(&wrapped), FailureClass::Permission);
        assert_eq!(classify_failure(&anyhow!("timed out")), FailureClass::Other);
    }
}
