//! Environment variables of the registry container
//!
//! The variables are merged in the env cache from three sources, lowest
//! priority first:
//!
//! 1. [`DeploymentEnvCF`] absorbs what the live Deployment already carries, so
//!    variables added by hand survive.
//! 2. [`EnvCF`] applies `spec.configuration.env`, keeping its declared order.
//! 3. [`OperatorEnvCF`]s translate the typed configuration (log levels,
//!    persistence, ...) into variables.
//!
//! [`JavaOptionsCF`] merges the JVM option variables, then [`EnvApplyCF`]
//! runs last and writes the linearized list back into the Deployment.

use super::{registry_container, registry_container_mut};
use crate::context::LoopContext;
use crate::control_loop::ControlFunction;
use crate::crd::{ApicurioRegistrySpec, Persistence};
use crate::env_cache::{EnvCacheEntry, EnvPriority};
use crate::java_options::{
    self, JavaOptions, JAVA_OPTIONS, JAVA_OPTIONS_COMBINED, JAVA_OPTIONS_LEGACY,
    JAVA_OPTIONS_OPERATOR,
};
use crate::resource_cache::EntryName;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;
use std::collections::HashSet;
use tracing::{debug, warn};

pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_REGISTRY_LOG_LEVEL: &str = "REGISTRY_LOG_LEVEL";
pub const ENV_DATASOURCE_URL: &str = "REGISTRY_DATASOURCE_URL";
pub const ENV_DATASOURCE_USERNAME: &str = "REGISTRY_DATASOURCE_USERNAME";
pub const ENV_DATASOURCE_PASSWORD: &str = "REGISTRY_DATASOURCE_PASSWORD";
pub const ENV_KAFKA_BOOTSTRAP_SERVERS: &str = "KAFKA_BOOTSTRAP_SERVERS";
pub const ENV_UI_READ_ONLY: &str = "REGISTRY_UI_FEATURES_READONLY";
pub const ENV_CORS_ALLOWED_ORIGINS: &str = "CORS_ALLOWED_ORIGINS";
pub const ENV_QUARKUS_PROFILE: &str = "QUARKUS_PROFILE";

fn deployment_env(ctx: &LoopContext) -> Option<&[EnvVar]> {
    let container = ctx
        .resources()
        .typed::<Deployment>()
        .and_then(registry_container)?;
    Some(container.env.as_deref().unwrap_or_default())
}

/// Absorbs the variables of the live Deployment at the lowest priority.
///
/// Variables that no longer appear on the Deployment are dropped from the
/// cache, but only while the cache holds no unapplied changes; otherwise
/// fresh entries from the other functions would be lost.
#[derive(Debug, Default)]
pub struct DeploymentEnvCF {
    absorb: Vec<EnvCacheEntry>,
    stale: Vec<String>,
}

impl ControlFunction for DeploymentEnvCF {
    fn describe(&self) -> &str {
        "DeploymentEnvCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.absorb.clear();
        self.stale.clear();

        let Some(vars) = deployment_env(ctx) else {
            return;
        };

        let env = ctx.env();
        let mut previous: Option<&str> = None;
        for var in vars {
            // Removal in progress, or the merged JVM options written by EnvApplyCF
            if env.was_deleted(&var.name) || var.name == JAVA_OPTIONS {
                continue;
            }
            match EnvCacheEntry::builder(var.clone())
                .priority(EnvPriority::Deployment)
                .after(previous)
                .build()
            {
                Ok(entry) if env.would_change(&entry) => self.absorb.push(entry),
                Ok(_) => {}
                Err(e) => warn!(app = %ctx.app(), error = %e, "Ignoring Deployment variable"),
            }
            previous = Some(var.name.as_str());
        }

        if self.absorb.is_empty() && !env.is_changed() {
            let present: HashSet<&str> = vars.iter().map(|v| v.name.as_str()).collect();
            self.stale = env
                .entries()
                .filter(|e| !present.contains(e.name()) && !java_options::is_internal(e.name()))
                .map(|e| e.name().to_string())
                .collect();
        }
    }

    fn compare(&self) -> bool {
        !self.absorb.is_empty() || !self.stale.is_empty()
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        for entry in self.absorb.drain(..) {
            ctx.env_mut().set(entry);
        }
        for name in self.stale.drain(..) {
            debug!(app = %ctx.app(), name = %name, "Variable removed from the Deployment");
            ctx.env_mut().delete_by_name(&name);
        }
    }
}

/// Applies `spec.configuration.env`.
///
/// Each variable depends on its predecessor in the spec, so the declared order
/// survives linearization and `$(VAR)` references keep working.
#[derive(Debug, Default)]
pub struct EnvCF {
    update: Vec<EnvCacheEntry>,
    remove: Vec<String>,
}

impl ControlFunction for EnvCF {
    fn describe(&self) -> &str {
        "EnvCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.update.clear();
        self.remove.clear();

        let Some(registry) = ctx.registry() else {
            return;
        };
        let declared = &registry.spec.configuration.env;

        let mut previous: Option<&str> = None;
        for var in declared {
            match EnvCacheEntry::builder(var.clone())
                .priority(EnvPriority::Spec)
                .after(previous)
                .build()
            {
                Ok(entry) if ctx.env().would_change(&entry) => self.update.push(entry),
                Ok(_) => {}
                Err(e) => warn!(app = %ctx.app(), error = %e, "Ignoring spec variable"),
            }
            previous = Some(var.name.as_str());
        }

        let names: HashSet<&str> = declared.iter().map(|v| v.name.as_str()).collect();
        self.remove = ctx
            .env()
            .entries()
            .filter(|e| e.priority() == EnvPriority::Spec && !names.contains(e.name()))
            .map(|e| e.name().to_string())
            .collect();
    }

    fn compare(&self) -> bool {
        !self.update.is_empty() || !self.remove.is_empty()
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        for name in self.remove.drain(..) {
            ctx.env_mut().delete_by_name(&name);
        }
        for entry in self.update.drain(..) {
            ctx.env_mut().set(entry);
        }
    }
}

type EnvTargets = Vec<(&'static str, Option<String>)>;

/// Derives operator managed variables from the typed configuration.
///
/// A variable with a value is set at operator priority. A variable without one
/// is removed, but only if the operator set it; a user supplied value in
/// `spec.configuration.env` is kept.
pub struct OperatorEnvCF {
    describe: &'static str,
    targets: fn(&ApicurioRegistrySpec) -> EnvTargets,
    set: Vec<EnvCacheEntry>,
    remove: Vec<&'static str>,
}

impl OperatorEnvCF {
    fn new(describe: &'static str, targets: fn(&ApicurioRegistrySpec) -> EnvTargets) -> Self {
        Self {
            describe,
            targets,
            set: Vec::new(),
            remove: Vec::new(),
        }
    }

    pub fn log_level() -> Self {
        Self::new("LogLevelCF", |spec| {
            vec![
                (ENV_LOG_LEVEL, Some(spec.configuration.log_level.clone())),
                (
                    ENV_REGISTRY_LOG_LEVEL,
                    Some(spec.configuration.registry_log_level.clone()),
                ),
            ]
        })
    }

    /// Data source variables; the password is only set when configured
    pub fn sql() -> Self {
        Self::new("SqlCF", |spec| {
            let data_source = &spec.configuration.sql.data_source;
            let active = spec.persistence() == Some(Persistence::Sql);
            let value = |v: &String| active.then(|| v.clone());
            vec![
                (ENV_DATASOURCE_URL, value(&data_source.url)),
                (ENV_DATASOURCE_USERNAME, value(&data_source.user_name)),
                (ENV_DATASOURCE_PASSWORD, value(&data_source.password)),
            ]
        })
    }

    pub fn kafkasql() -> Self {
        Self::new("KafkasqlCF", |spec| {
            let active = spec.persistence() == Some(Persistence::Kafkasql);
            vec![(
                ENV_KAFKA_BOOTSTRAP_SERVERS,
                active.then(|| spec.configuration.kafkasql.bootstrap_servers.clone()),
            )]
        })
    }

    /// Browser origins of the Ingress host, unless the user configured them
    pub fn cors() -> Self {
        Self::new("CorsCF", |spec| {
            let host = &spec.deployment.host;
            let value = (!declared(spec, ENV_CORS_ALLOWED_ORIGINS) && !host.is_empty())
                .then(|| format!("http://{},https://{}", host, host));
            vec![(ENV_CORS_ALLOWED_ORIGINS, value)]
        })
    }

    /// Production profile, unless the user selected another one
    pub fn profile() -> Self {
        Self::new("ProfileCF", |spec| {
            vec![(
                ENV_QUARKUS_PROFILE,
                (!declared(spec, ENV_QUARKUS_PROFILE)).then(|| "prod".to_string()),
            )]
        })
    }

    pub fn ui() -> Self {
        Self::new("UiCF", |spec| {
            vec![(
                ENV_UI_READ_ONLY,
                spec.configuration.ui.read_only.then(|| "true".to_string()),
            )]
        })
    }
}

fn declared(spec: &ApicurioRegistrySpec, name: &str) -> bool {
    spec.configuration.env.iter().any(|v| v.name == name)
}

impl ControlFunction for OperatorEnvCF {
    fn describe(&self) -> &str {
        self.describe
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.set.clear();
        self.remove.clear();

        let Some(registry) = ctx.registry() else {
            return;
        };
        for (name, value) in (self.targets)(&registry.spec) {
            match value.filter(|v| !v.is_empty()) {
                Some(value) => match EnvCacheEntry::simple(name, value).build() {
                    Ok(entry) if ctx.env().would_change(&entry) => self.set.push(entry),
                    Ok(_) => {}
                    Err(e) => warn!(app = %ctx.app(), error = %e, "Ignoring variable"),
                },
                None => {
                    let ours = ctx
                        .env()
                        .get(name)
                        .is_some_and(|e| e.priority() == EnvPriority::Operator);
                    if ours {
                        self.remove.push(name);
                    }
                }
            }
        }
    }

    fn compare(&self) -> bool {
        !self.set.is_empty() || !self.remove.is_empty()
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        for entry in self.set.drain(..) {
            ctx.env_mut().set(entry);
        }
        for name in self.remove.drain(..) {
            ctx.env_mut().delete_by_name(name);
        }
    }
}

/// Merges the JVM option variables into one value.
///
/// The deprecated variable is read first, the user variable next and the
/// operator options last, each overriding options of the same key. A value
/// that can not be parsed keeps the previous merge in place.
#[derive(Debug, Default)]
pub struct JavaOptionsCF {
    set: Option<EnvCacheEntry>,
    remove: bool,
}

impl ControlFunction for JavaOptionsCF {
    fn describe(&self) -> &str {
        "JavaOptionsCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.set = None;
        self.remove = false;

        let env = ctx.env();
        let mut sets: Vec<JavaOptions> = Vec::new();
        for name in [JAVA_OPTIONS_LEGACY, JAVA_OPTIONS, JAVA_OPTIONS_OPERATOR] {
            let Some(value) = env.get(name).and_then(|e| e.value().value.as_deref()) else {
                continue;
            };
            match java_options::parse(value) {
                Ok(options) => sets.push(options),
                Err(e) => {
                    warn!(app = %ctx.app(), variable = name, error = %e, "Could not parse JVM options");
                    return;
                }
            }
        }

        if sets.is_empty() {
            self.remove = env.get(JAVA_OPTIONS_COMBINED).is_some();
            return;
        }
        let value = java_options::render(&java_options::merge(&sets));
        match EnvCacheEntry::simple(JAVA_OPTIONS_COMBINED, value).build() {
            Ok(entry) if env.would_change(&entry) => self.set = Some(entry),
            Ok(_) => {}
            Err(e) => warn!(app = %ctx.app(), error = %e, "Ignoring merged JVM options"),
        }
    }

    fn compare(&self) -> bool {
        self.set.is_some() || self.remove
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        if let Some(entry) = self.set.take() {
            ctx.env_mut().set(entry);
        }
        if self.remove {
            ctx.env_mut().delete_by_name(JAVA_OPTIONS_COMBINED);
        }
    }
}

/// Identity of a variable as far as drift detection goes.
///
/// `valueFrom` sources get server side defaults, so only names and literal
/// values are compared.
fn fingerprint(vars: &[EnvVar]) -> Vec<(&str, Option<&str>)> {
    vars.iter()
        .map(|v| (v.name.as_str(), v.value.as_deref()))
        .collect()
}

/// Writes the linearized env cache into the registry container
#[derive(Debug, Default)]
pub struct EnvApplyCF {
    deployment_name: Option<EntryName>,
    last_deployment_name: Option<EntryName>,
    env_changed: bool,
    drifted: bool,
    target: Vec<EnvVar>,
}

impl ControlFunction for EnvApplyCF {
    fn describe(&self) -> &str {
        "EnvApplyCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.deployment_name = ctx
            .resources()
            .entry_of::<Deployment>()
            .map(|entry| entry.name().clone());
        self.env_changed = ctx.env().is_changed();

        match deployment_env(ctx) {
            Some(current) => {
                self.target = java_options::finalize(ctx.env().get_sorted());
                self.drifted = fingerprint(current) != fingerprint(&self.target);
            }
            None => {
                self.target.clear();
                self.drifted = false;
            }
        }
    }

    fn compare(&self) -> bool {
        self.deployment_name.is_some()
            && (self.env_changed
                || self.drifted
                || self.deployment_name != self.last_deployment_name)
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let target = std::mem::take(&mut self.target);
        ctx.resources_mut().patch::<Deployment, _>(|deployment| {
            if let Some(container) = registry_container_mut(deployment) {
                container.env = (!target.is_empty()).then_some(target);
            }
        });

        ctx.env_mut().process_and_advance_to_next_period();
        self.last_deployment_name = self.deployment_name.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ClusterCapabilities;
    use crate::resources::ResourceFactory;
    use crate::testing;

    fn var(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    fn context(spec: ApicurioRegistrySpec, deployment_env: Vec<EnvVar>) -> LoopContext {
        let mut ctx = testing::context_for(
            testing::registry("registry", spec),
            ClusterCapabilities::all(),
        );
        let mut deployment = ResourceFactory::from_context(&ctx).deployment();
        if let Some(container) = crate::cf::registry_container_mut(&mut deployment) {
            container.env = (!deployment_env.is_empty()).then_some(deployment_env);
        }
        ctx.resources_mut()
            .insert_observed("registry-deployment", deployment);
        ctx
    }

    fn step(cf: &mut dyn ControlFunction, ctx: &mut LoopContext) -> bool {
        cf.sense(ctx);
        let fired = cf.compare();
        if fired {
            cf.respond(ctx);
        }
        fired
    }

    fn container_env(ctx: &LoopContext) -> Vec<(String, String)> {
        deployment_env(ctx)
            .unwrap_or_default()
            .iter()
            .map(|v| (v.name.clone(), v.value.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn test_deployment_env_is_absorbed() {
        let mut ctx = context(
            ApicurioRegistrySpec::default(),
            vec![var("A", "1"), var("B", "$(A)")],
        );
        let mut cf = DeploymentEnvCF::default();
        assert!(step(&mut cf, &mut ctx));

        let b = ctx.env().get("B").unwrap();
        assert_eq!(b.priority(), EnvPriority::Deployment);
        assert_eq!(b.dependencies(), &["A".to_string()]);

        ctx.env_mut().process_and_advance_to_next_period();
        assert!(!step(&mut cf, &mut ctx));
    }

    #[test]
    fn test_deployment_env_drops_vanished_variables() {
        let mut ctx = context(ApicurioRegistrySpec::default(), vec![var("A", "1")]);
        ctx.env_mut()
            .set(EnvCacheEntry::simple("GONE", "x").build().unwrap());
        ctx.env_mut()
            .set(EnvCacheEntry::simple("A", "1").build().unwrap());

        let mut cf = DeploymentEnvCF::default();
        // Unapplied changes protect the cache
        assert!(!step(&mut cf, &mut ctx));

        ctx.env_mut().process_and_advance_to_next_period();
        assert!(step(&mut cf, &mut ctx));
        assert!(ctx.env().was_deleted("GONE"));
        assert!(ctx.env().get("A").is_some());
    }

    #[test]
    fn test_spec_env_overrides_deployment() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.env = vec![var("A", "spec")];
        let mut ctx = context(spec, vec![var("A", "live")]);

        step(&mut DeploymentEnvCF::default(), &mut ctx);
        assert!(step(&mut EnvCF::default(), &mut ctx));

        let a = ctx.env().get("A").unwrap();
        assert_eq!(a.priority(), EnvPriority::Spec);
        assert_eq!(a.value().value.as_deref(), Some("spec"));
    }

    #[test]
    fn test_spec_env_removal() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.env = vec![var("A", "1")];
        let mut ctx = context(spec, vec![]);
        let mut cf = EnvCF::default();
        assert!(step(&mut cf, &mut ctx));
        assert!(!step(&mut cf, &mut ctx));

        let registry = testing::registry("registry", ApicurioRegistrySpec::default());
        ctx.resources_mut().insert_observed("registry", registry);
        assert!(step(&mut cf, &mut ctx));
        assert!(ctx.env().was_deleted("A"));
    }

    #[test]
    fn test_log_level() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.log_level = "DEBUG".to_string();
        let mut ctx = context(spec, vec![]);
        let mut cf = OperatorEnvCF::log_level();

        assert!(step(&mut cf, &mut ctx));
        assert_eq!(
            ctx.env().get(ENV_LOG_LEVEL).unwrap().value().value.as_deref(),
            Some("DEBUG")
        );
        assert!(ctx.env().get(ENV_REGISTRY_LOG_LEVEL).is_none());
        assert!(!step(&mut cf, &mut ctx));

        // Cleared in the spec
        let registry = testing::registry("registry", ApicurioRegistrySpec::default());
        ctx.resources_mut().insert_observed("registry", registry);
        assert!(step(&mut cf, &mut ctx));
        assert!(ctx.env().was_deleted(ENV_LOG_LEVEL));
    }

    #[test]
    fn test_user_variable_is_not_removed() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.env = vec![var(ENV_LOG_LEVEL, "WARN")];
        let mut ctx = context(spec, vec![]);

        step(&mut EnvCF::default(), &mut ctx);
        assert!(!step(&mut OperatorEnvCF::log_level(), &mut ctx));
        assert!(ctx.env().get(ENV_LOG_LEVEL).is_some());
    }

    #[test]
    fn test_sql_only_when_selected() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.sql.data_source.url = "jdbc:postgresql://db/registry".to_string();
        spec.configuration.sql.data_source.user_name = "registry".to_string();
        let mut ctx = context(spec.clone(), vec![]);
        let mut cf = OperatorEnvCF::sql();
        assert!(!step(&mut cf, &mut ctx));

        spec.configuration.persistence = "sql".to_string();
        ctx.resources_mut()
            .insert_observed("registry", testing::registry("registry", spec));
        assert!(step(&mut cf, &mut ctx));
        assert!(ctx.env().get(ENV_DATASOURCE_URL).is_some());
        assert!(ctx.env().get(ENV_DATASOURCE_USERNAME).is_some());
        assert!(ctx.env().get(ENV_DATASOURCE_PASSWORD).is_none());
    }

    #[test]
    fn test_kafkasql_and_ui() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.persistence = "kafkasql".to_string();
        spec.configuration.kafkasql.bootstrap_servers = "kafka:9092".to_string();
        spec.configuration.ui.read_only = true;
        let mut ctx = context(spec, vec![]);

        assert!(step(&mut OperatorEnvCF::kafkasql(), &mut ctx));
        assert!(step(&mut OperatorEnvCF::ui(), &mut ctx));
        assert_eq!(
            ctx.env()
                .get(ENV_KAFKA_BOOTSTRAP_SERVERS)
                .unwrap()
                .value()
                .value
                .as_deref(),
            Some("kafka:9092")
        );
        assert_eq!(
            ctx.env().get(ENV_UI_READ_ONLY).unwrap().value().value.as_deref(),
            Some("true")
        );
    }

    #[test]
    fn test_cors_follows_host() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.deployment.host = "registry.example.com".to_string();
        let mut ctx = context(spec, vec![]);
        let mut cf = OperatorEnvCF::cors();

        assert!(step(&mut cf, &mut ctx));
        assert_eq!(
            ctx.env()
                .get(ENV_CORS_ALLOWED_ORIGINS)
                .unwrap()
                .value()
                .value
                .as_deref(),
            Some("http://registry.example.com,https://registry.example.com")
        );
        assert!(!step(&mut cf, &mut ctx));

        let registry = testing::registry("registry", ApicurioRegistrySpec::default());
        ctx.resources_mut().insert_observed("registry", registry);
        assert!(step(&mut cf, &mut ctx));
        assert!(ctx.env().was_deleted(ENV_CORS_ALLOWED_ORIGINS));
    }

    #[test]
    fn test_user_cors_and_profile_win() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.deployment.host = "registry.example.com".to_string();
        spec.configuration.env = vec![
            var(ENV_CORS_ALLOWED_ORIGINS, "*"),
            var(ENV_QUARKUS_PROFILE, "dev"),
        ];
        let mut ctx = context(spec, vec![]);

        step(&mut EnvCF::default(), &mut ctx);
        assert!(!step(&mut OperatorEnvCF::cors(), &mut ctx));
        assert!(!step(&mut OperatorEnvCF::profile(), &mut ctx));
        assert_eq!(
            ctx.env().get(ENV_QUARKUS_PROFILE).unwrap().value().value.as_deref(),
            Some("dev")
        );
    }

    #[test]
    fn test_default_profile() {
        let mut ctx = context(ApicurioRegistrySpec::default(), vec![]);
        let mut cf = OperatorEnvCF::profile();
        assert!(step(&mut cf, &mut ctx));
        assert_eq!(
            ctx.env().get(ENV_QUARKUS_PROFILE).unwrap().value().value.as_deref(),
            Some("prod")
        );
        assert!(!step(&mut cf, &mut ctx));
    }

    #[test]
    fn test_java_options_are_merged() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.env = vec![
            var(JAVA_OPTIONS_LEGACY, "-Dcolor=green -Dcute=false"),
            var(JAVA_OPTIONS, "-Danimal=frog -Dcute=true"),
            var("VAR_3_NAME", "VAR_3_VALUE"),
        ];
        let mut ctx = context(spec, vec![]);
        step(&mut EnvCF::default(), &mut ctx);

        let mut cf = JavaOptionsCF::default();
        assert!(step(&mut cf, &mut ctx));
        assert!(!step(&mut cf, &mut ctx));

        let mut apply = EnvApplyCF::default();
        assert!(step(&mut apply, &mut ctx));
        assert_eq!(
            container_env(&ctx),
            vec![
                (JAVA_OPTIONS_LEGACY.to_string(), "-Dcolor=green -Dcute=false".to_string()),
                (
                    JAVA_OPTIONS.to_string(),
                    "-Danimal=frog -Dcolor=green -Dcute=true".to_string()
                ),
                ("VAR_3_NAME".to_string(), "VAR_3_VALUE".to_string()),
            ]
        );

        // The merged variable on the Deployment is neither absorbed nor stale
        let mut deployment_env = DeploymentEnvCF::default();
        assert!(!step(&mut deployment_env, &mut ctx));
        assert!(ctx.env().get(JAVA_OPTIONS_COMBINED).is_some());
        assert!(!step(&mut cf, &mut ctx));
        assert!(!step(&mut apply, &mut ctx));
    }

    #[test]
    fn test_operator_java_options() {
        let mut ctx = context(ApicurioRegistrySpec::default(), vec![]);
        ctx.env_mut().set(
            EnvCacheEntry::simple(JAVA_OPTIONS_OPERATOR, "-Dtls=on")
                .build()
                .unwrap(),
        );
        let mut cf = JavaOptionsCF::default();
        assert!(step(&mut cf, &mut ctx));
        assert!(step(&mut EnvApplyCF::default(), &mut ctx));
        assert_eq!(
            container_env(&ctx),
            vec![(JAVA_OPTIONS.to_string(), "-Dtls=on".to_string())]
        );

        ctx.env_mut().delete_by_name(JAVA_OPTIONS_OPERATOR);
        assert!(step(&mut cf, &mut ctx));
        assert!(ctx.env().was_deleted(JAVA_OPTIONS_COMBINED));
    }

    #[test]
    fn test_unparsable_java_options_keep_previous_merge() {
        let mut ctx = context(ApicurioRegistrySpec::default(), vec![]);
        ctx.env_mut().set(
            EnvCacheEntry::simple(JAVA_OPTIONS, "-Da=1")
                .priority(EnvPriority::Spec)
                .build()
                .unwrap(),
        );
        let mut cf = JavaOptionsCF::default();
        assert!(step(&mut cf, &mut ctx));

        ctx.env_mut().set(
            EnvCacheEntry::simple(JAVA_OPTIONS, "-Da='1")
                .priority(EnvPriority::Spec)
                .build()
                .unwrap(),
        );
        assert!(!step(&mut cf, &mut ctx));
        assert_eq!(
            ctx.env()
                .get(JAVA_OPTIONS_COMBINED)
                .unwrap()
                .value()
                .value
                .as_deref(),
            Some("-Da=1")
        );
    }

    #[test]
    fn test_env_apply_writes_sorted_list() {
        let mut ctx = context(ApicurioRegistrySpec::default(), vec![]);
        ctx.env_mut().set(
            EnvCacheEntry::simple("B", "$(A)")
                .depends_on("A")
                .build()
                .unwrap(),
        );
        ctx.env_mut()
            .set(EnvCacheEntry::simple("A", "1").build().unwrap());

        let mut cf = EnvApplyCF::default();
        assert!(step(&mut cf, &mut ctx));
        assert_eq!(
            container_env(&ctx),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "$(A)".to_string())
            ]
        );
        assert!(!ctx.env().is_changed());
        assert!(!step(&mut cf, &mut ctx));
    }

    #[test]
    fn test_env_apply_repairs_drift() {
        let mut ctx = context(ApicurioRegistrySpec::default(), vec![var("A", "edited")]);
        ctx.env_mut().set(
            EnvCacheEntry::simple("A", "1")
                .priority(EnvPriority::Spec)
                .build()
                .unwrap(),
        );
        ctx.env_mut().process_and_advance_to_next_period();

        let mut cf = EnvApplyCF::default();
        assert!(step(&mut cf, &mut ctx));
        assert_eq!(
            container_env(&ctx),
            vec![("A".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn test_env_apply_waits_for_deployment() {
        let mut ctx = testing::context_for(
            testing::registry("registry", ApicurioRegistrySpec::default()),
            ClusterCapabilities::all(),
        );
        ctx.env_mut()
            .set(EnvCacheEntry::simple("A", "1").build().unwrap());
        assert!(!step(&mut EnvApplyCF::default(), &mut ctx));
    }
}
