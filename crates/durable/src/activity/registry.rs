//! Activity registry
//!
//! Maps activity type names to handlers. Typed [`Activity`] implementations,
//! plain async closures and an optional catch-all handler all resolve
//! through the same table at dispatch time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Activity execution result
pub type ActivityResult = Result<Value, ActivityError>;

/// Activity handler function type
pub type ActivityHandler =
    Arc<dyn Fn(Arc<ActivityContext>, Value) -> BoxFuture<'static, ActivityResult> + Send + Sync>;

/// Registry of activity handlers
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
    fallback: Option<ActivityHandler>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        let activity = Arc::new(activity);
        self.handlers.insert(
            A::TYPE.to_string(),
            boxed(move |ctx: Arc<ActivityContext>, input: Value| {
                let activity = Arc::clone(&activity);
                async move {
                    let input: A::Input = serde_json::from_value(input)?;
                    let output = activity.execute(&ctx, input).await?;
                    Ok(serde_json::to_value(output)?)
                }
            }),
        );
        self
    }

    /// Register an async closure under a name
    ///
    /// # Example
    ///
    /// ```
    /// use keel_durable::activity::ActivityRegistry;
    ///
    /// let mut registry = ActivityRegistry::new();
    /// registry.register_fn("echo", |_ctx, input| async move { Ok(input) });
    /// assert!(registry.contains("echo"));
    /// ```
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Arc<ActivityContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        self.handlers.insert(activity_type.into(), boxed(f));
        self
    }

    /// Handle every activity type without a dedicated registration
    ///
    /// The handler can read the requested type from
    /// [`ActivityContext::activity_type`].
    pub fn set_fallback<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Arc<ActivityContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        self.fallback = Some(boxed(f));
        self
    }

    /// Resolve the handler for an activity type
    pub fn resolve(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers
            .get(activity_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Check if an activity type has a dedicated handler
    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// Get the number of registered activity types
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}

fn boxed<F, Fut>(f: F) -> ActivityHandler
where
    F: Fn(Arc<ActivityContext>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActivityResult> + Send + 'static,
{
    Arc::new(
        move |ctx: Arc<ActivityContext>, input: Value| -> BoxFuture<'static, ActivityResult> {
            Box::pin(f(ctx, input))
        },
    )
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
