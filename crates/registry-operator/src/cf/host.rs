use crate::context::LoopContext;
use crate::control_loop::ControlFunction;
use crate::resources::{read_host, write_host};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;

/// Keeps the Ingress host aligned with `spec.deployment.host`
#[derive(Debug, Default)]
pub struct HostCF {
    service_name: Option<String>,
    existing_host: Option<String>,
    target_host: String,
}

impl ControlFunction for HostCF {
    fn describe(&self) -> &str {
        "HostCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.service_name = ctx
            .resources()
            .entry_of::<Service>()
            .and_then(|entry| entry.name().as_str())
            .map(String::from);

        self.existing_host = match (&self.service_name, ctx.resources().typed::<Ingress>()) {
            (Some(service), Some(ingress)) => read_host(ingress, service),
            _ => None,
        };

        self.target_host = ctx
            .registry()
            .map(|r| r.spec.deployment.host.clone())
            .unwrap_or_default();
    }

    fn compare(&self) -> bool {
        // An Ingress without a rule for our Service is left alone
        self.existing_host
            .as_ref()
            .is_some_and(|host| !self.target_host.is_empty() && *host != self.target_host)
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let Some(service) = self.service_name.as_deref() else {
            return;
        };
        let host = self.target_host.as_str();
        ctx.resources_mut()
            .patch::<Ingress, _>(|ingress| write_host(ingress, service, host));
    }
}
