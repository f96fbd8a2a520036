//! Function catalogs and parameter binding.
//!
//! This module is the simulator's invocation gateway: a generic `Registry<H>`
//! maps logical names to boxed async handlers, built once at startup through a
//! builder that collects duplicate-registration errors. Orchestrations,
//! activities, and entity operations each get a registry of their own handler
//! trait; `ServiceProvider` supplies injected dependencies to activity and
//! entity bodies.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::runtime::context::{ActivityContext, OrchestrationContext};
use crate::runtime::entity::EntityContext;

/// Trait implemented by orchestration handlers invoked by the run loop.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: Value) -> Result<Value, EngineError>;
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext) -> Result<Value, EngineError>;
}

/// Trait implemented by entity operation handlers.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn invoke(&self, ctx: EntityContext) -> Result<(), EngineError>;
}

/// Boxed future produced by registered handler closures; the builders box at
/// registration time so wrapper types stay object-safe and simple.
pub type InvokeFuture<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F>(pub F)
where
    F: Fn(OrchestrationContext, Value) -> InvokeFuture<Result<Value, EngineError>>
        + Send
        + Sync
        + 'static;

#[async_trait]
impl<F> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, Value) -> InvokeFuture<Result<Value, EngineError>>
        + Send
        + Sync
        + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: Value) -> Result<Value, EngineError> {
        (self.0)(ctx, input).await
    }
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F>(pub F)
where
    F: Fn(ActivityContext) -> InvokeFuture<Result<Value, EngineError>> + Send + Sync + 'static;

#[async_trait]
impl<F> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext) -> InvokeFuture<Result<Value, EngineError>> + Send + Sync + 'static,
{
    async fn invoke(&self, ctx: ActivityContext) -> Result<Value, EngineError> {
        (self.0)(ctx).await
    }
}

/// Function wrapper that implements `EntityHandler`.
pub struct FnEntity<F>(pub F)
where
    F: Fn(EntityContext) -> InvokeFuture<Result<(), EngineError>> + Send + Sync + 'static;

#[async_trait]
impl<F> EntityHandler for FnEntity<F>
where
    F: Fn(EntityContext) -> InvokeFuture<Result<(), EngineError>> + Send + Sync + 'static,
{
    async fn invoke(&self, ctx: EntityContext) -> Result<(), EngineError> {
        (self.0)(ctx).await
    }
}

/// Immutable registry mapping logical names to handlers.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone/Default impls since H: ?Sized doesn't auto-derive.
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type EntityRegistry = Registry<dyn EntityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;
pub type EntityRegistryBuilder = RegistryBuilder<dyn EntityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Look up a handler by logical name.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let result = self.inner.get(name).cloned();
        if result.is_none() {
            tracing::debug!(
                requested_name = %name,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        result
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

/// Builder collecting registrations; duplicate names are recorded as errors
/// surfaced by `build_result`.
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build, returning an error listing every duplicate registration.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    /// Merge another registry into this builder.
    pub fn merge(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors
                    .push(format!("duplicate {error_prefix} in merge: {name}"));
            } else {
                self.map.insert(name.clone(), handler.clone());
            }
        }
        self
    }

    fn insert(&mut self, name: String, handler: Arc<H>, error_prefix: &str) {
        if self.map.contains_key(&name) {
            self.errors
                .push(format!("duplicate {error_prefix} registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        let handler = FnOrchestration(move |ctx: OrchestrationContext, input: Value| {
            let fut: InvokeFuture<Result<Value, EngineError>> = Box::pin(f(ctx, input));
            fut
        });
        self.insert(name.into(), Arc::new(handler), "orchestration");
        self
    }

    /// Register with serde-typed input/output; the wrapper normalizes at the
    /// registry boundary.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, EngineError>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input: Value| {
            let f = f.clone();
            async move {
                let input: In = serde_json::from_value(input)
                    .map_err(|e| EngineError::activity(format!("decode input: {e}")))?;
                let out = f(ctx, input).await?;
                serde_json::to_value(out)
                    .map_err(|e| EngineError::activity(format!("encode output: {e}")))
            }
        };
        self.register(name, wrapper)
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        let handler = FnActivity(move |ctx: ActivityContext| {
            let fut: InvokeFuture<Result<Value, EngineError>> = Box::pin(f(ctx));
            fut
        });
        self.insert(name.into(), Arc::new(handler), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, EngineError>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext| {
            let f = f.clone();
            async move {
                let input: In = ctx.input_as()?;
                let out = f(ctx, input).await?;
                serde_json::to_value(out)
                    .map_err(|e| EngineError::activity(format!("encode output: {e}")))
            }
        };
        self.register(name, wrapper)
    }
}

impl EntityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(EntityContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let handler = FnEntity(move |ctx: EntityContext| {
            let fut: InvokeFuture<Result<(), EngineError>> = Box::pin(f(ctx));
            fut
        });
        self.insert(name.into(), Arc::new(handler), "entity operation");
        self
    }
}

/// Type-keyed map of injected dependencies, resolved by activity and entity
/// bodies through `ctx.service::<T>()`. The registry+binder replacement for
/// the original's runtime service-provider reflection.
#[derive(Clone, Default)]
pub struct ServiceProvider {
    inner: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceProvider {
    pub fn builder() -> ServiceProviderBuilder {
        ServiceProviderBuilder {
            map: HashMap::new(),
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }
}

#[derive(Default)]
pub struct ServiceProviderBuilder {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceProviderBuilder {
    pub fn provide<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.map.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    pub fn build(self) -> ServiceProvider {
        ServiceProvider {
            inner: Arc::new(self.map),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_registration_is_an_error() {
        let result = ActivityRegistry::builder()
            .register("A", |_ctx: ActivityContext| async move { Ok(json!(1)) })
            .register("A", |_ctx: ActivityContext| async move { Ok(json!(2)) })
            .build_result();
        let err = result.err().expect("duplicate should be rejected");
        assert!(err.contains("duplicate activity registration: A"));
    }

    #[test]
    fn merge_combines_and_detects_collisions() {
        let base = ActivityRegistry::builder()
            .register("A", |_ctx: ActivityContext| async move { Ok(json!(1)) })
            .build();
        let merged = ActivityRegistry::builder()
            .register("B", |_ctx: ActivityContext| async move { Ok(json!(2)) })
            .merge(base.clone(), "activity")
            .build();
        assert!(merged.has("A") && merged.has("B"));
        assert_eq!(merged.count(), 2);

        let collision = ActivityRegistry::builder()
            .register("A", |_ctx: ActivityContext| async move { Ok(json!(3)) })
            .merge(base, "activity")
            .build_result();
        assert!(collision.is_err());
    }

    #[test]
    fn service_provider_resolves_by_type() {
        struct Db {
            url: String,
        }
        let services = ServiceProvider::builder()
            .provide(Db {
                url: "sqlite://memory".into(),
            })
            .build();
        let db = services.get::<Db>().expect("registered service resolves");
        assert_eq!(db.url, "sqlite://memory");
        assert!(services.get::<u64>().is_none());
    }
}
