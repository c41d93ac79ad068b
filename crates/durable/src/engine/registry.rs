//! Workflow type lookup
//!
//! Runs are stored with a workflow type name and a JSON input. The registry
//! turns that pair back into a live instance behind [`AnyWorkflow`], for new
//! runs and for every replay. Lookup order: a typed or named registration,
//! then the fallback factory if one is set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::activity::ActivityFailure;
use crate::workflow::{Workflow, WorkflowContext, WorkflowError, WorkflowResult, WorkflowSignal};

/// Object-safe view of a [`Workflow`]
///
/// Mirrors the handler set of [`Workflow`] with inputs and outputs kept as
/// JSON, so the engine can drive any registered type.
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &str;

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> WorkflowResult;

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> WorkflowResult;

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        failure: &ActivityFailure,
    ) -> WorkflowResult;

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> WorkflowResult;

    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal) -> WorkflowResult;

    fn on_cancel_requested(&mut self, ctx: &mut WorkflowContext, reason: &str) -> WorkflowResult;

    /// Read-only; must not change what later handlers decide
    fn query(&self, name: &str, args: &Value) -> Result<Value, WorkflowError>;
}

struct Typed<W>(W);

impl<W: Workflow> AnyWorkflow for Typed<W> {
    fn workflow_type(&self) -> &str {
        W::TYPE
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> WorkflowResult {
        self.0.on_start(ctx)
    }

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> WorkflowResult {
        self.0.on_activity_completed(ctx, activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        failure: &ActivityFailure,
    ) -> WorkflowResult {
        self.0.on_activity_failed(ctx, activity_id, failure)
    }

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> WorkflowResult {
        self.0.on_timer_fired(ctx, timer_id)
    }

    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal) -> WorkflowResult {
        self.0.on_signal(ctx, signal)
    }

    fn on_cancel_requested(&mut self, ctx: &mut WorkflowContext, reason: &str) -> WorkflowResult {
        self.0.on_cancel_requested(ctx, reason)
    }

    fn query(&self, name: &str, args: &Value) -> Result<Value, WorkflowError> {
        self.0.query(name, args)
    }
}

/// Box a typed workflow for use from a hand-written factory
pub fn erase<W: Workflow>(workflow: W) -> Box<dyn AnyWorkflow> {
    Box::new(Typed(workflow))
}

/// Builds an instance from a run's JSON input
pub type WorkflowFactory =
    Arc<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Builds an instance for any type name without its own factory
pub type FallbackFactory =
    Arc<dyn Fn(&str, Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Workflow types known to an engine
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
    fallback: Option<FallbackFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `W` startable under [`Workflow::TYPE`]
    ///
    /// Registering a second type with the same name replaces the first.
    pub fn register<W: Workflow>(&mut self) -> &mut Self {
        self.factories.insert(
            W::TYPE.to_string(),
            Arc::new(|input: Value| -> Result<Box<dyn AnyWorkflow>, serde_json::Error> {
                Ok(erase(W::new(serde_json::from_value(input)?)))
            }),
        );
        self
    }

    /// Make a hand-written factory startable under `workflow_type`
    pub fn register_dynamic<F>(&mut self, workflow_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync + 'static,
    {
        self.factories.insert(workflow_type.into(), Arc::new(factory));
        self
    }

    /// Consulted for every type name without a registration
    pub fn set_fallback<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn(&str, Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error>
            + Send
            + Sync
            + 'static,
    {
        self.fallback = Some(Arc::new(factory));
        self
    }

    /// True only for explicit registrations, not the fallback
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Instantiate `workflow_type` from its JSON input
    pub fn create(&self, workflow_type: &str, input: Value) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let built = match (self.factories.get(workflow_type), &self.fallback) {
            (Some(factory), _) => factory(input),
            (None, Some(fallback)) => fallback(workflow_type, input),
            (None, None) => return Err(RegistryError::UnknownType(workflow_type.to_string())),
        };
        built.map_err(|source| RegistryError::BadInput {
            workflow_type: workflow_type.to_string(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered names, in no particular order
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.workflow_types().collect();
        types.sort_unstable();
        f.debug_struct("WorkflowRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no workflow registered as '{0}'")]
    UnknownType(String),

    #[error("input does not fit workflow '{workflow_type}': {source}")]
    BadInput {
        workflow_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowAction;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        quantity: i64,
    }

    /// Reserves stock, then completes with double the reserved count
    struct Reserve {
        order: Order,
    }

    impl Workflow for Reserve {
        const TYPE: &'static str = "reserve";
        type Input = Order;
        type Output = i64;

        fn new(order: Order) -> Self {
            Self { order }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowResult {
            Ok(vec![WorkflowAction::schedule_activity(
                "hold",
                "hold_stock",
                json!({ "quantity": self.order.quantity }),
            )])
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            result: Value,
        ) -> WorkflowResult {
            let held: i64 = serde_json::from_value(result)?;
            Ok(vec![WorkflowAction::complete(json!(held * 2))])
        }

        fn query(&self, name: &str, _args: &Value) -> Result<Value, WorkflowError> {
            match name {
                "quantity" => Ok(json!(self.order.quantity)),
                other => Err(WorkflowError::new(format!("unknown query: {other}"))),
            }
        }
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register::<Reserve>();
        registry
    }

    #[test]
    fn test_create_registered_type() {
        let registry = registry();
        let instance = registry.create("reserve", json!({ "quantity": 3 })).unwrap();

        assert_eq!(instance.workflow_type(), "reserve");
        assert_eq!(instance.query("quantity", &Value::Null).unwrap(), json!(3));
        assert!(!registry.contains("refund"));
    }

    #[test]
    fn test_lookup_failures() {
        let registry = registry();

        assert!(matches!(
            registry.create("refund", json!({})),
            Err(RegistryError::UnknownType(name)) if name == "refund"
        ));
        assert!(matches!(
            registry.create("reserve", json!({ "qty": 3 })),
            Err(RegistryError::BadInput { workflow_type, .. }) if workflow_type == "reserve"
        ));
    }

    #[test]
    fn test_erased_handlers_delegate() {
        let mut instance = registry().create("reserve", json!({ "quantity": 4 })).unwrap();
        let mut ctx = WorkflowContext::new("order-1", Uuid::now_v7(), "reserve", Utc::now());

        let started = instance.on_start(&mut ctx).unwrap();
        assert!(matches!(
            &started[..],
            [WorkflowAction::ScheduleActivity { activity_type, .. }] if activity_type == "hold_stock"
        ));

        let done = instance.on_activity_completed(&mut ctx, "hold", json!(4)).unwrap();
        assert_eq!(done, vec![WorkflowAction::complete(json!(8))]);

        let err = instance
            .on_activity_failed(&mut ctx, "hold", &ActivityFailure::cancelled("stop"))
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("ACTIVITY_FAILED"));
    }

    #[test]
    fn test_dynamic_and_fallback_factories() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register_dynamic("reserve-v2", |input| Ok(erase(Reserve::new(serde_json::from_value(input)?))))
            .set_fallback(|name, input| {
                assert!(name.starts_with("legacy-"));
                Ok(erase(Reserve::new(serde_json::from_value(input)?)))
            });

        assert!(registry.contains("reserve-v2"));
        assert!(!registry.contains("legacy-reserve"));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry
                .create("legacy-reserve", json!({ "quantity": 1 }))
                .unwrap()
                .workflow_type(),
            "reserve"
        );
    }

    #[test]
    fn test_debug_lists_types() {
        let mut registry = registry();
        registry.register_dynamic("audit", |input| Ok(erase(Reserve::new(serde_json::from_value(input)?))));

        let debug = format!("{registry:?}");
        assert!(debug.contains(r#"["audit", "reserve"]"#));
        assert!(debug.contains("fallback: false"));
    }
}
