use super::{ENV_DATASOURCE_URL, ENV_KAFKA_BOOTSTRAP_SERVERS};
use crate::context::LoopContext;
use crate::control_loop::{ControlFunction, ControlMode};
use crate::crd::Persistence;
use crate::status::ConfigurationErrorReason;
use tracing::warn;

/// Reports configuration the operator can not act upon.
///
/// Runs in advisory mode: the problems persist until the user fixes the spec,
/// so they must never keep the loop from stabilizing.
#[derive(Debug, Default)]
pub struct ConfigurationErrorCF {
    problems: Vec<(ConfigurationErrorReason, String)>,
}

impl ControlFunction for ConfigurationErrorCF {
    fn describe(&self) -> &str {
        "ConfigurationErrorCF"
    }

    fn mode(&self) -> ControlMode {
        ControlMode::Advisory
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.problems.clear();
        let Some(registry) = ctx.registry() else {
            return;
        };
        let spec = &registry.spec;

        // Unknown persistence options are rejected by spec validation before the loop runs
        let Some(persistence) = spec.persistence() else {
            return;
        };

        if spec.deployment.image.is_empty() && ctx.config().default_image(persistence).is_none() {
            self.problems.push((
                ConfigurationErrorReason::Required,
                format!(
                    "No registry image is configured for persistence '{}', set spec.deployment.image",
                    persistence
                ),
            ));
        }

        let missing = |value: &str, variable: &str| {
            value.is_empty() && ctx.env().get(variable).is_none()
        };
        match persistence {
            Persistence::Sql if missing(&spec.configuration.sql.data_source.url, ENV_DATASOURCE_URL) => {
                self.problems.push((
                    ConfigurationErrorReason::Required,
                    "SQL persistence requires spec.configuration.sql.dataSource.url".to_string(),
                ));
            }
            Persistence::Kafkasql
                if missing(
                    &spec.configuration.kafkasql.bootstrap_servers,
                    ENV_KAFKA_BOOTSTRAP_SERVERS,
                ) =>
            {
                self.problems.push((
                    ConfigurationErrorReason::Required,
                    "Kafka persistence requires spec.configuration.kafkasql.bootstrapServers"
                        .to_string(),
                ));
            }
            _ => {}
        }
    }

    fn compare(&self) -> bool {
        !self.problems.is_empty()
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        for (reason, message) in self.problems.drain(..) {
            warn!(app = %ctx.app(), reason = reason.as_str(), "{}", message);
            ctx.status_mut().report_configuration_error(reason, message);
        }
    }
}
