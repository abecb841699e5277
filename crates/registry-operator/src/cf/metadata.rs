//! Labels and annotations of the managed resources
//!
//! Both functions only add or overwrite keys. Keys added by other tools are
//! kept, and keys removed from the spec stay on the objects.

use super::pod_metadata_mut;
use crate::context::LoopContext;
use crate::control_loop::ControlFunction;
use crate::kinds::{Resource, ResourceKey};
use crate::resources::ResourceFactory;
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::BTreeMap;

type Labels = BTreeMap<String, String>;

fn contains_all(actual: Option<&Labels>, expected: &Labels) -> bool {
    expected
        .iter()
        .all(|(key, value)| actual.and_then(|a| a.get(key)) == Some(value))
}

fn merge(target: &mut Option<Labels>, values: &Labels) {
    target
        .get_or_insert_with(BTreeMap::new)
        .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn pod_template_metadata(resource: &Resource) -> Option<(Option<&Labels>, Option<&Labels>)> {
    match resource {
        Resource::Deployment(deployment) => {
            let metadata = deployment.spec.as_ref()?.template.metadata.as_ref();
            Some((
                metadata.and_then(|m| m.labels.as_ref()),
                metadata.and_then(|m| m.annotations.as_ref()),
            ))
        }
        _ => None,
    }
}

/// Common labels on every managed object, plus the spec labels on the pods
#[derive(Debug, Default)]
pub struct LabelsCF {
    common: Labels,
    pod: Labels,
    stale: Vec<ResourceKey>,
    stale_pod: bool,
}

impl ControlFunction for LabelsCF {
    fn describe(&self) -> &str {
        "LabelsCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.common = ResourceFactory::from_context(ctx).common_labels();
        self.pod = self.common.clone();
        if let Some(registry) = ctx.registry() {
            self.pod.extend(registry.spec.deployment.metadata.labels.clone());
        }

        self.stale.clear();
        self.stale_pod = false;
        for key in ResourceKey::MANAGED {
            let Some(entry) = ctx.resources().get(&key) else {
                continue;
            };
            if !contains_all(entry.value().metadata().labels.as_ref(), &self.common) {
                self.stale.push(key);
            }
            if let Some((labels, _)) = pod_template_metadata(entry.value()) {
                self.stale_pod = !contains_all(labels, &self.pod);
            }
        }
    }

    fn compare(&self) -> bool {
        !self.stale.is_empty() || self.stale_pod
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        for key in &self.stale {
            if let Some(entry) = ctx.resources_mut().get_mut(key) {
                let common = &self.common;
                entry.apply_patch(|mut resource| {
                    merge(&mut resource.metadata_mut().labels, common);
                    resource
                });
            }
        }
        if self.stale_pod {
            let pod = &self.pod;
            ctx.resources_mut().patch::<Deployment, _>(|deployment| {
                if let Some(metadata) = pod_metadata_mut(deployment) {
                    merge(&mut metadata.labels, pod);
                }
            });
        }
    }
}

/// Spec annotations on the registry pods
#[derive(Debug, Default)]
pub struct AnnotationsCF {
    target: Labels,
    stale: bool,
}

impl ControlFunction for AnnotationsCF {
    fn describe(&self) -> &str {
        "AnnotationsCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.target = ctx
            .registry()
            .map(|r| r.spec.deployment.metadata.annotations.clone())
            .unwrap_or_default();

        self.stale = ctx
            .resources()
            .get(&ResourceKey::Deployment)
            .and_then(|entry| pod_template_metadata(entry.value()))
            .is_some_and(|(_, annotations)| !contains_all(annotations, &self.target));
    }

    fn compare(&self) -> bool {
        self.stale
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let target = &self.target;
        ctx.resources_mut().patch::<Deployment, _>(|deployment| {
            if let Some(metadata) = pod_metadata_mut(deployment) {
                merge(&mut metadata.annotations, target);
            }
        });
    }
}
