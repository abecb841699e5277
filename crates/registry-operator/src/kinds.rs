//! Managed resource kinds
//!
//! The resource cache stores every managed object as one [`Resource`] value.
//! [`ResourceKind`] maps each k8s-openapi type to its variant and cache key, so
//! control functions work with concrete types and a mismatch is a compile error.

use crate::crd::ApicurioRegistry;
use crate::resource_cache::{ResourceCache, ResourceCacheEntry};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::fmt;

/// Semantic role of a cached object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    /// The desired state
    Registry,
    Deployment,
    Service,
    Ingress,
    PodDisruptionBudget,
    NetworkPolicy,
}

impl ResourceKey {
    /// Keys of the objects the operator creates, in creation order
    pub const MANAGED: [ResourceKey; 5] = [
        ResourceKey::Deployment,
        ResourceKey::Service,
        ResourceKey::Ingress,
        ResourceKey::PodDisruptionBudget,
        ResourceKey::NetworkPolicy,
    ];

    /// Kubernetes kind of the object stored under this key
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKey::Registry => "ApicurioRegistry",
            ResourceKey::Deployment => "Deployment",
            ResourceKey::Service => "Service",
            ResourceKey::Ingress => "Ingress",
            ResourceKey::PodDisruptionBudget => "PodDisruptionBudget",
            ResourceKey::NetworkPolicy => "NetworkPolicy",
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Any object the operator tracks
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Registry(Box<ApicurioRegistry>),
    Deployment(Box<Deployment>),
    Service(Box<Service>),
    Ingress(Box<Ingress>),
    PodDisruptionBudget(Box<PodDisruptionBudget>),
    NetworkPolicy(Box<NetworkPolicy>),
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        match self {
            Resource::Registry(_) => ResourceKey::Registry,
            Resource::Deployment(_) => ResourceKey::Deployment,
            Resource::Service(_) => ResourceKey::Service,
            Resource::Ingress(_) => ResourceKey::Ingress,
            Resource::PodDisruptionBudget(_) => ResourceKey::PodDisruptionBudget,
            Resource::NetworkPolicy(_) => ResourceKey::NetworkPolicy,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Resource::Registry(r) => &r.metadata,
            Resource::Deployment(r) => &r.metadata,
            Resource::Service(r) => &r.metadata,
            Resource::Ingress(r) => &r.metadata,
            Resource::PodDisruptionBudget(r) => &r.metadata,
            Resource::NetworkPolicy(r) => &r.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Resource::Registry(r) => &mut r.metadata,
            Resource::Deployment(r) => &mut r.metadata,
            Resource::Service(r) => &mut r.metadata,
            Resource::Ingress(r) => &mut r.metadata,
            Resource::PodDisruptionBudget(r) => &mut r.metadata,
            Resource::NetworkPolicy(r) => &mut r.metadata,
        }
    }
}

/// A k8s-openapi type that can live in the resource cache
pub trait ResourceKind: Clone + Sized {
    /// Cache key objects of this type are stored under
    const KEY: ResourceKey;

    fn from_resource(resource: &Resource) -> Option<&Self>;

    fn from_resource_mut(resource: &mut Resource) -> Option<&mut Self>;

    fn into_resource(self) -> Resource;
}

macro_rules! resource_kind {
    ($variant:ident, $ty:ty) => {
        impl ResourceKind for $ty {
            const KEY: ResourceKey = ResourceKey::$variant;

            fn from_resource(resource: &Resource) -> Option<&Self> {
                match resource {
                    Resource::$variant(value) => Some(&**value),
                    _ => None,
                }
            }

            fn from_resource_mut(resource: &mut Resource) -> Option<&mut Self> {
                match resource {
                    Resource::$variant(value) => Some(&mut **value),
                    _ => None,
                }
            }

            fn into_resource(self) -> Resource {
                Resource::$variant(Box::new(self))
            }
        }
    };
}

resource_kind!(Registry, ApicurioRegistry);
resource_kind!(Deployment, Deployment);
resource_kind!(Service, Service);
resource_kind!(Ingress, Ingress);
resource_kind!(PodDisruptionBudget, PodDisruptionBudget);
resource_kind!(NetworkPolicy, NetworkPolicy);

/// Resource cache of one registry instance
pub type RegistryCache = ResourceCache<ResourceKey, Resource>;

/// Cache entry of one managed object
pub type RegistryCacheEntry = ResourceCacheEntry<Resource>;

impl ResourceCacheEntry<Resource> {
    /// Current value as `T`
    pub fn typed<T: ResourceKind>(&self) -> Option<&T> {
        T::from_resource(self.value())
    }

    /// Patch the current value as `T`
    pub fn patch<T, F>(&mut self, patch: F)
    where
        T: ResourceKind,
        F: FnOnce(&mut T),
    {
        self.apply_patch(|mut resource| {
            if let Some(value) = T::from_resource_mut(&mut resource) {
                patch(value);
            }
            resource
        });
    }
}

impl ResourceCache<ResourceKey, Resource> {
    /// Cached entry for `T`, if any
    pub fn entry_of<T: ResourceKind>(&self) -> Option<&RegistryCacheEntry> {
        self.get(&T::KEY)
    }

    /// Current value of the cached `T`, if any
    pub fn typed<T: ResourceKind>(&self) -> Option<&T> {
        self.get(&T::KEY).and_then(|entry| entry.typed::<T>())
    }

    /// Patch the cached `T`; returns false when nothing is cached
    pub fn patch<T, F>(&mut self, patch: F) -> bool
    where
        T: ResourceKind,
        F: FnOnce(&mut T),
    {
        match self.get_mut(&T::KEY) {
            Some(entry) => {
                entry.patch::<T, F>(patch);
                true
            }
            None => false,
        }
    }

    /// Track a new object that still has to be created
    pub fn insert_new<T: ResourceKind>(&mut self, value: T) {
        self.set(T::KEY, ResourceCacheEntry::not_created(value.into_resource()));
    }

    /// Track an object as observed in the cluster
    pub fn insert_observed<T: ResourceKind>(&mut self, name: impl Into<String>, value: T) {
        self.set(T::KEY, ResourceCacheEntry::observed(name, value.into_resource()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_cache::EntryName;
    use k8s_openapi::api::apps::v1::DeploymentSpec;

    fn deployment(replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("app-deployment".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_typed_access() {
        let mut cache = RegistryCache::new();
        cache.insert_observed("app-deployment", deployment(1));

        assert!(cache.typed::<Service>().is_none());
        let d = cache.typed::<Deployment>().unwrap();
        assert_eq!(d.spec.as_ref().and_then(|s| s.replicas), Some(1));
        assert_eq!(
            cache.entry_of::<Deployment>().map(|e| e.name().clone()),
            Some(EntryName::Named("app-deployment".to_string()))
        );
    }

    #[test]
    fn test_typed_patch() {
        let mut cache = RegistryCache::new();
        cache.insert_observed("app-deployment", deployment(1));

        assert!(cache.patch::<Deployment, _>(|d| {
            if let Some(spec) = d.spec.as_mut() {
                spec.replicas = Some(3);
            }
        }));
        assert!(!cache.patch::<Service, _>(|_| {}));

        let entry = cache.entry_of::<Deployment>().unwrap();
        assert!(entry.has_changed());
        let original = entry.original_value();
        assert_eq!(original, &deployment(1).into_resource());
        assert_eq!(entry.value(), &deployment(3).into_resource());
    }

    #[test]
    fn test_insert_new() {
        let mut cache = RegistryCache::new();
        cache.insert_new(Service::default());
        let entry = cache.entry_of::<Service>().unwrap();
        assert!(!entry.name().is_created());
        assert!(entry.has_changed());
        assert_eq!(entry.value().key(), ResourceKey::Service);
    }
}
