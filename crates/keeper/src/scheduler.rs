//! Per-target renewal scheduler
//!
//! Every target runs in its own task: once immediately, then on every tick
//! of its run interval. A run decides what is due, renews it, and hands the
//! result to the target's server adapter. Failures end that run only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use certkeeper_config::{TargetConfig, TimingConfig};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::acme::{AcmeError, AcmeOrchestrator};
use crate::ocsp::{OcspError, OcspFetcher};
use crate::server::{run_deploy_hook, PushError, Requirements, ServerAdapter};
use crate::store::{CertificateStore, StoreError};

/// Renewal run errors, by stage
#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("certificate request failed: {0}")]
    Acme(#[from] AcmeError),

    #[error("OCSP fetch failed: {0}")]
    Ocsp(#[from] OcspError),

    #[error("delivering material failed: {0}")]
    Push(#[from] PushError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no stored certificate to fetch an OCSP response for")]
    MissingChain,
}

/// What a run has to renew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenewalDecision {
    pub need_cert: bool,
    pub need_ocsp: bool,
}

impl RenewalDecision {
    /// Compare stored material against the configured thresholds.
    ///
    /// Missing or unreadable material counts as expired. A new certificate
    /// always comes with a new OCSP response when OCSP is wanted at all.
    pub fn evaluate(
        timing: &TimingConfig,
        store: &CertificateStore,
        requirements: Requirements,
        now: DateTime<Utc>,
    ) -> Self {
        let need_cert = match timing.cert_threshold() {
            Some(threshold) if requirements.certificate => {
                due(store.remaining_cert_validity(now), threshold)
            }
            _ => false,
        };
        let need_ocsp = match timing.ocsp_threshold() {
            Some(threshold) if requirements.ocsp => {
                need_cert || due(store.remaining_ocsp_validity(now), threshold)
            }
            _ => false,
        };

        Self { need_cert, need_ocsp }
    }

    pub fn is_idle(&self) -> bool {
        !self.need_cert && !self.need_ocsp
    }
}

fn due(remaining: Option<Duration>, threshold: Duration) -> bool {
    remaining.map_or(true, |r| r < threshold)
}

/// What a single run changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOutcome {
    pub cert_renewed: bool,
    pub ocsp_renewed: bool,
    pub server_updated: bool,
}

/// Runs the renewal pipeline of one target.
pub struct TargetRunner {
    target: TargetConfig,
    orchestrator: Arc<AcmeOrchestrator>,
    ocsp: Arc<dyn OcspFetcher>,
    /// Stored material has not reached the server yet.
    pending_push: AtomicBool,
}

impl TargetRunner {
    pub fn new(target: TargetConfig, orchestrator: Arc<AcmeOrchestrator>, ocsp: Arc<dyn OcspFetcher>) -> Self {
        Self {
            target,
            orchestrator,
            ocsp,
            pending_push: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// One complete run: decide, renew, persist, push.
    pub async fn run_once(&self) -> Result<RunOutcome, RenewalError> {
        let name = self.target.name();
        let mut adapter = ServerAdapter::for_target(&self.target)?;
        let decision = RenewalDecision::evaluate(
            &self.target.timing,
            adapter.store(),
            adapter.requirements(),
            Utc::now(),
        );

        let retry_push = self.pending_push.load(Ordering::SeqCst);

        info!(
            target = %name,
            cert = decision.need_cert,
            ocsp = decision.need_ocsp,
            retry_push,
            "Starting run"
        );
        let mut outcome = RunOutcome::default();
        if decision.is_idle() && !retry_push {
            return Ok(outcome);
        }

        let mut fresh_chain = None;
        if decision.need_cert {
            let issued = self.orchestrator.request_certificate(&self.target).await?;
            adapter.set_cert(&issued)?;
            outcome.cert_renewed = true;
            fresh_chain = Some(issued.chain);
        }

        if decision.need_ocsp {
            let chain = match fresh_chain {
                Some(chain) => chain,
                None => adapter.store().load_chain()?.ok_or(RenewalError::MissingChain)?,
            };

            match self.ocsp.fetch(&chain).await {
                Ok(response) => {
                    adapter.set_ocsp(&response)?;
                    outcome.ocsp_renewed = true;
                }
                Err(e) if outcome.cert_renewed => {
                    // The old response belongs to the replaced certificate.
                    warn!(target = %name, error = %e, "No OCSP response for the new certificate");
                    adapter.store().discard_ocsp()?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if retry_push && !outcome.cert_renewed {
            debug!(target = %name, "Delivering stored material again");
            adapter.stage_stored()?;
        }

        if adapter.has_changes() {
            match adapter.update_server().await {
                Ok(()) => {
                    outcome.server_updated = true;
                    self.pending_push.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(target = %name, error = %e, "Server update failed, retrying on the next run");
                    self.pending_push.store(true, Ordering::SeqCst);
                }
            }

            if let Some(hook) = &self.target.deploy_hook.executable {
                run_deploy_hook(hook).await?;
            }
        }

        info!(
            target = %name,
            cert_renewed = outcome.cert_renewed,
            ocsp_renewed = outcome.ocsp_renewed,
            server_updated = outcome.server_updated,
            "Run finished"
        );
        Ok(outcome)
    }

    /// Run immediately, then on every interval tick. Without an interval
    /// (or with `oneshot`) the target runs exactly once.
    pub async fn run_forever(self, oneshot: bool) {
        let name = self.target.name().to_string();

        let period = match self.target.timing.run_interval() {
            Some(period) if !oneshot => period,
            _ => {
                self.run_logged().await;
                return;
            }
        };

        info!(target = %name, interval_minutes = period.as_secs() / 60, "Scheduling renewals");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            debug!(target = %name, "Scheduled run");
            self.run_logged().await;
        }
    }

    async fn run_logged(&self) {
        let start = Instant::now();
        if let Err(e) = self.run_once().await {
            error!(
                target = %self.target.name(),
                error = %e,
                elapsed_secs = start.elapsed().as_secs(),
                "Run failed"
            );
        }
    }
}

/// Runs every target in its own task.
pub struct RenewalScheduler {
    runners: Vec<TargetRunner>,
    oneshot: bool,
}

impl RenewalScheduler {
    pub fn new(runners: Vec<TargetRunner>) -> Self {
        Self {
            runners,
            oneshot: false,
        }
    }

    /// Run each target once, ignoring the configured intervals.
    pub fn oneshot(mut self, oneshot: bool) -> Self {
        self.oneshot = oneshot;
        self
    }

    /// Returns once every target task has ended, which only happens when
    /// no target has a run interval (or `oneshot` is set).
    pub async fn run(self) {
        info!(targets = self.runners.len(), oneshot = self.oneshot, "Starting renewal scheduler");

        let mut tasks = JoinSet::new();
        for runner in self.runners {
            tasks.spawn(runner.run_forever(self.oneshot));
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Target task ended abnormally");
            }
        }

        info!("All targets finished");
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("targets", &self.runners.len())
            .field("oneshot", &self.oneshot)
            .finish()
    }
}
