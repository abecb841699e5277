//! Status side channel
//!
//! Control functions report user visible problems here instead of failing the
//! loop. The services layer renders the collected state into
//! [`ApicurioRegistryStatus`] after each run.

use crate::crd::{ApicurioRegistryStatus, ManagedResourceStatus, RegistryCondition};
use chrono::{DateTime, Utc};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_CONFIGURATION_ERROR: &str = "ConfigurationError";

/// Reason of the Ready condition.
///
/// Ordered by precedence: a transition never replaces a reason that sorts
/// higher within the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyReason {
    Reconciled,
    Reconciling,
    Initializing,
    Error,
}

impl ReadyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyReason::Reconciled => "Reconciled",
            ReadyReason::Reconciling => "Reconciling",
            ReadyReason::Initializing => "Initializing",
            ReadyReason::Error => "Error",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            ReadyReason::Reconciled => "Apicurio Registry is ready",
            ReadyReason::Reconciling => "Operator is reconciling the managed resources",
            ReadyReason::Initializing => "Apicurio Registry is starting up",
            ReadyReason::Error => {
                "An error occurred in the operator or the application. Please check other conditions and logs."
            }
        }
    }
}

/// Reason of the ConfigurationError condition, ordered by precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigurationErrorReason {
    Invalid,
    Required,
    InvalidPersistence,
}

impl ConfigurationErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationErrorReason::Invalid => "InvalidConfiguration",
            ConfigurationErrorReason::Required => "MissingRequiredConfiguration",
            ConfigurationErrorReason::InvalidPersistence => "InvalidPersistenceOption",
        }
    }
}

/// Status state collected during one loop run
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReporter {
    ready: ReadyReason,
    configuration_error: Option<(ConfigurationErrorReason, String)>,
    host: String,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self {
            ready: ReadyReason::Reconciled,
            configuration_error: None,
            host: String::new(),
        }
    }
}

impl StatusReporter {
    /// Forget everything reported by the previous run
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Move the Ready condition towards `reason`, respecting precedence
    pub fn transition(&mut self, reason: ReadyReason) {
        if reason > self.ready {
            self.ready = reason;
        }
    }

    pub fn ready(&self) -> ReadyReason {
        self.ready
    }

    /// Report a misconfiguration; also fails the Ready condition
    pub fn report_configuration_error(
        &mut self,
        reason: ConfigurationErrorReason,
        message: impl Into<String>,
    ) {
        let replace = match &self.configuration_error {
            Some((current, _)) => reason > *current,
            None => true,
        };
        if replace {
            self.configuration_error = Some((reason, message.into()));
        }
        self.transition(ReadyReason::Error);
    }

    pub fn configuration_error(&self) -> Option<&(ConfigurationErrorReason, String)> {
        self.configuration_error.as_ref()
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Render the collected state.
    ///
    /// Transition times of conditions whose status did not change are carried
    /// over from `previous`.
    pub fn render(
        &self,
        previous: Option<&ApicurioRegistryStatus>,
        managed_resources: Vec<ManagedResourceStatus>,
        now: DateTime<Utc>,
    ) -> ApicurioRegistryStatus {
        let mut conditions = vec![condition(
            CONDITION_READY,
            if self.ready == ReadyReason::Reconciled {
                "True"
            } else {
                "False"
            },
            self.ready.as_str(),
            self.ready.message(),
        )];
        if let Some((reason, message)) = &self.configuration_error {
            conditions.push(condition(
                CONDITION_CONFIGURATION_ERROR,
                "True",
                reason.as_str(),
                message,
            ));
        }

        for condition in conditions.iter_mut() {
            let carried = previous
                .and_then(|p| {
                    p.conditions
                        .iter()
                        .find(|c| c.condition_type == condition.condition_type)
                })
                .filter(|c| c.status == condition.status)
                .and_then(|c| c.last_transition_time.clone());
            condition.last_transition_time = carried.or_else(|| Some(now.to_rfc3339()));
        }

        let mut status = ApicurioRegistryStatus {
            conditions,
            managed_resources,
            ..Default::default()
        };
        status.info.host = self.host.clone();
        status
    }
}

fn condition(condition_type: &str, status: &str, reason: &str, message: &str) -> RegistryCondition {
    RegistryCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: None,
    }
}
