//! Service-wait engine
//!
//! A blocking barrier between a node's bootstrap steps: the caller awaits
//! [`ServiceWaitEngine::wait_for`] and does not proceed until every expected
//! instance of a service is running, or the timeout fires. A timeout is fatal
//! for the run and is not retried beyond the poll loop itself.
//!
//! Polls run at a fixed interval with no jitter or backoff. These are one-shot
//! bootstrap gates, not steady-state health checks.

use crate::clock::Clock;
use crate::cluster::{CapabilityMap, MembershipDirectory, Node, Role};
use crate::config::{BootstrapConfig, WaitSettings};
use crate::telemetry::instruments;
use crate::{Error, Result};
use async_trait::async_trait;
use opentelemetry::trace::Span;
use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counts running instances of a service
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn running_instances(&self, service: &str) -> Result<usize>;
}

/// Probe that counts running registrations in the membership directory
pub struct DirectoryProbe {
    directory: Arc<dyn MembershipDirectory>,
}

impl DirectoryProbe {
    pub fn new(directory: Arc<dyn MembershipDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ReadinessProbe for DirectoryProbe {
    async fn running_instances(&self, service: &str) -> Result<usize> {
        let providers = self.directory.find_providers(service).await?;
        Ok(providers.iter().filter(|p| p.is_running()).count())
    }
}

/// What to wait for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    pub service: String,
    /// Role providing the service; enables the bypass rules when set
    pub dependency: Option<Role>,
    pub expected_count: usize,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl WaitRequest {
    /// Wait for one running instance of `service`, with no bypass rules.
    pub fn new(service: impl Into<String>, settings: WaitSettings) -> Self {
        Self {
            service: service.into(),
            dependency: None,
            expected_count: 1,
            poll_interval: settings.poll_interval,
            timeout: settings.timeout,
        }
    }

    /// Wait for the service of `role` as named in the configuration.
    pub fn for_role(role: Role, config: &BootstrapConfig) -> Self {
        Self {
            dependency: Some(role),
            ..Self::new(config.catalog.service_name(role), config.wait)
        }
    }

    pub fn expecting(mut self, count: usize) -> Self {
        self.expected_count = count;
        self
    }
}

/// Why a wait was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    /// The calling node provides the service itself
    SelfProvided,
    /// The calling node's role does not need the service live
    Exempt,
    /// An operator override is trusted without verification
    OperatorOverride,
    /// No node holds the dependency, so there is nothing to wait for
    Absent,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::SelfProvided => "self_provided",
            BypassReason::Exempt => "exempt",
            BypassReason::OperatorOverride => "operator_override",
            BypassReason::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    /// Every expected instance polled as running
    Satisfied { observed: usize, waited: Duration },
    /// Opened without polling
    Bypassed { reason: BypassReason },
}

/// Proof that a dependency is ready; start steps take one before running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessGate {
    pub service: String,
    pub state: GateState,
}

impl ReadinessGate {
    pub fn was_bypassed(&self) -> bool {
        matches!(self.state, GateState::Bypassed { .. })
    }
}

enum PollOutcome {
    Satisfied { observed: usize, waited: Duration },
    TimedOut { observed: usize, waited: Duration },
}

/// Blocks bootstrap steps until their dependencies are running
pub struct ServiceWaitEngine {
    probe: Arc<dyn ReadinessProbe>,
    clock: Arc<dyn Clock>,
    capabilities: Arc<CapabilityMap>,
    config: Arc<BootstrapConfig>,
    local: Arc<Node>,
}

impl ServiceWaitEngine {
    pub fn new(
        probe: Arc<dyn ReadinessProbe>,
        clock: Arc<dyn Clock>,
        capabilities: Arc<CapabilityMap>,
        config: Arc<BootstrapConfig>,
        local: Arc<Node>,
    ) -> Self {
        Self {
            probe,
            clock,
            capabilities,
            config,
            local,
        }
    }

    /// Wait until `expected_count` instances of the service are running.
    ///
    /// Returns immediately when the local node provides the dependency, is
    /// exempt from waiting on it, or an operator override exists for it.
    /// Returns [`Error::TimeoutExceeded`] once the timeout has elapsed.
    pub async fn wait_for(&self, request: WaitRequest) -> Result<ReadinessGate> {
        if let Some(reason) = self.bypass_reason(&request) {
            info!(
                service = %request.service,
                node = %self.local.name,
                reason = reason.as_str(),
                "Skipping wait"
            );
            instruments::record_bypass(&request.service, reason.as_str());
            return Ok(ReadinessGate {
                service: request.service,
                state: GateState::Bypassed { reason },
            });
        }

        info!(
            service = %request.service,
            expected = request.expected_count,
            timeout_secs = request.timeout.as_secs(),
            "Waiting for service"
        );

        let mut span = instruments::start_span(
            "clusterboot.wait_for",
            vec![
                KeyValue::new("service", request.service.clone()),
                KeyValue::new("expected", request.expected_count as i64),
                KeyValue::new("node", self.local.name.clone()),
            ],
        );

        match self.poll(&request).await {
            PollOutcome::Satisfied { observed, waited } => {
                info!(
                    service = %request.service,
                    observed,
                    waited_ms = waited.as_millis() as u64,
                    "Service is ready"
                );
                instruments::record_wait(&request.service, "satisfied", waited);
                span.set_attribute(KeyValue::new("observed", observed as i64));
                span.end();
                Ok(ReadinessGate {
                    service: request.service,
                    state: GateState::Satisfied { observed, waited },
                })
            }
            PollOutcome::TimedOut { observed, waited } => {
                error!(
                    service = %request.service,
                    expected = request.expected_count,
                    observed,
                    waited_ms = waited.as_millis() as u64,
                    "Timed out waiting for service"
                );
                instruments::record_wait(&request.service, "timed_out", waited);
                let err = Error::TimeoutExceeded {
                    service: request.service,
                    expected: request.expected_count,
                    observed,
                    waited,
                };
                span.set_attribute(KeyValue::new("observed", observed as i64));
                instruments::fail_span(span, err.to_string());
                Err(err)
            }
        }
    }

    fn bypass_reason(&self, request: &WaitRequest) -> Option<BypassReason> {
        let dependency = request.dependency?;
        if self.local.has_role(dependency) {
            Some(BypassReason::SelfProvided)
        } else if self.capabilities.is_wait_exempt(&self.local, dependency) {
            Some(BypassReason::Exempt)
        } else if self.config.overrides.contains(dependency) {
            Some(BypassReason::OperatorOverride)
        } else {
            None
        }
    }

    async fn poll(&self, request: &WaitRequest) -> PollOutcome {
        let start = self.clock.now();
        let mut observed = 0;

        loop {
            instruments::record_poll(&request.service);
            match self.probe.running_instances(&request.service).await {
                Ok(count) => {
                    observed = count;
                    if count >= request.expected_count {
                        return PollOutcome::Satisfied {
                            observed,
                            waited: self.clock.now().saturating_sub(start),
                        };
                    }
                    debug!(
                        service = %request.service,
                        observed = count,
                        expected = request.expected_count,
                        "Service not ready yet"
                    );
                }
                Err(e) => {
                    warn!(service = %request.service, error = %e, "Readiness poll failed, retrying");
                }
            }

            let waited = self.clock.now().saturating_sub(start);
            if waited >= request.timeout {
                return PollOutcome::TimedOut { observed, waited };
            }
            self.clock.sleep(request.poll_interval).await;
        }
    }
}
