//! Bounded readiness retry.
//!
//! An [`AttachCohort`] groups targets that are wired up together. Each attempt
//! looks up every target that is not attached yet and runs its action once it
//! is present. Missing targets reschedule the whole cohort after a fixed delay
//! until the attempt budget is spent.

use crate::notice::{Notice, Notifier};
use crate::task::TaskHandle;
use crate::ErrorPolicy;
use anyhow::Error;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;

type Lookup = Box<dyn Fn() -> Result<bool, Error> + Send + Sync>;
type Action = Box<dyn Fn() + Send + Sync>;

pub struct Target {
    id: String,
    lookup: Lookup,
    action: Action,
}

impl Target {
    pub fn new<L, A>(id: impl Into<String>, lookup: L, action: A) -> Self
    where
        L: Fn() -> Result<bool, Error> + Send + Sync + 'static,
        A: Fn() + Send + Sync + 'static,
    {
        Target {
            id: id.into(),
            lookup: Box::new(lookup),
            action: Box::new(action),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target").field("id", &self.id).finish()
    }
}

/// Who gets told when the budget runs out with targets still missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CohortReporting {
    /// One notice, and only when no target of the cohort was ever attached.
    #[default]
    SuppressOnPartial,
    /// One notice per missing target.
    PerTarget,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: Duration,
    pub reporting: CohortReporting,
    pub on_lookup_error: ErrorPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            delay: Duration::from_millis(300),
            reporting: CohortReporting::SuppressOnPartial,
            on_lookup_error: ErrorPolicy::Retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached { attempts: u32 },
    AlreadyAttached,
    Exhausted { attempts: u32, missing: Vec<String> },
    LookupFailed { attempts: u32, target: String, error: String },
    Cancelled { attempts: u32 },
}

pub struct AttachCohort {
    name: String,
    targets: Vec<Target>,
    // Attachment record: ids whose action already ran.
    attached: Mutex<HashSet<String>>,
    config: RetryConfig,
    notifier: Arc<dyn Notifier>,
}

impl AttachCohort {
    pub fn new(
        name: impl Into<String>,
        targets: Vec<Target>,
        config: RetryConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        AttachCohort {
            name: name.into(),
            targets,
            attached: Mutex::new(HashSet::new()),
            config,
            notifier,
        }
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.record().contains(id)
    }

    pub fn all_attached(&self) -> bool {
        let attached = self.record();
        self.targets.iter().all(|t| attached.contains(&t.id))
    }

    /// Run the retry loop from a fresh attempt counter. Once every target is
    /// attached this returns [`AttachOutcome::AlreadyAttached`] without looking
    /// anything up.
    pub async fn run_now(&self) -> AttachOutcome {
        self.run_until(&CancellationToken::new()).await
    }

    pub fn spawn(self: &Arc<Self>) -> TaskHandle<AttachOutcome> {
        let cohort = Arc::clone(self);
        TaskHandle::spawn(info_span!("attach", cohort = %self.name), |cancel| async move {
            cohort.run_until(&cancel).await
        })
    }

    pub async fn run_until(&self, cancel: &CancellationToken) -> AttachOutcome {
        if self.all_attached() {
            trace!(message = "Cohort already attached", cohort = %self.name);
            return AttachOutcome::AlreadyAttached;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(message = "Attach attempt", cohort = %self.name, attempt, max_attempts);

            match self.attempt(attempt) {
                Ok(missing) if missing.is_empty() => {
                    info!(message = "All targets attached", cohort = %self.name, attempts = attempt);
                    return AttachOutcome::Attached { attempts: attempt };
                }
                Ok(missing) => {
                    if attempt >= max_attempts {
                        error!(
                            message = "Targets still missing, giving up",
                            cohort = %self.name,
                            attempts = attempt,
                            missing = ?missing
                        );
                        self.report_failure(&missing);
                        return AttachOutcome::Exhausted {
                            attempts: attempt,
                            missing,
                        };
                    }
                    debug!(message = "Retrying attach", cohort = %self.name, delay = ?self.config.delay);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(message = "Attach cancelled", cohort = %self.name);
                            return AttachOutcome::Cancelled { attempts: attempt };
                        },
                        _ = tokio::time::sleep(self.config.delay) => {},
                    }
                }
                Err((target, err)) => {
                    error!(message = "Lookup failed", cohort = %self.name, target = %target, error = ?err);
                    self.report_failure(&self.missing());
                    return AttachOutcome::LookupFailed {
                        attempts: attempt,
                        target,
                        error: err.to_string(),
                    };
                }
            }
        }
    }

    // The record stays locked while actions run so no target is attached twice.
    // Actions must not call back into the cohort.
    fn attempt(&self, attempt: u32) -> Result<Vec<String>, (String, Error)> {
        let mut attached = self.record();
        let mut missing = vec![];

        for target in &self.targets {
            if attached.contains(&target.id) {
                continue;
            }
            match (target.lookup)() {
                Ok(true) => {
                    (target.action)();
                    attached.insert(target.id.clone());
                    debug!(message = "Target attached", target = %target.id, attempt);
                }
                Ok(false) => {
                    warn!(message = "Target not found", target = %target.id, attempt);
                    missing.push(target.id.clone());
                }
                Err(err) => match self.config.on_lookup_error {
                    ErrorPolicy::Retry => {
                        warn!(message = "Lookup error, treating as missing", target = %target.id, attempt, error = ?err);
                        missing.push(target.id.clone());
                    }
                    ErrorPolicy::Abort => return Err((target.id.clone(), err)),
                },
            }
        }

        Ok(missing)
    }

    fn report_failure(&self, missing: &[String]) {
        match self.config.reporting {
            CohortReporting::SuppressOnPartial => {
                if self.record().is_empty() {
                    self.notifier.notify(Notice::SetupFailed {
                        cohort: self.name.clone(),
                        missing: missing.to_vec(),
                    });
                } else {
                    warn!(
                        message = "Cohort partially attached, suppressing notice",
                        cohort = %self.name,
                        missing = ?missing
                    );
                }
            }
            CohortReporting::PerTarget => {
                for id in missing {
                    self.notifier.notify(Notice::SetupFailed {
                        cohort: self.name.clone(),
                        missing: vec![id.clone()],
                    });
                }
            }
        }
    }

    fn missing(&self) -> Vec<String> {
        let attached = self.record();
        self.targets
            .iter()
            .filter(|t| !attached.contains(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    fn record(&self) -> MutexGuard<'_, HashSet<String>> {
        self.attached.lock().unwrap_or_else(|p| p.into_inner())
    }
}
