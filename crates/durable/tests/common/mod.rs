//! Shared workflows and drivers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use keel_durable::activity::{ActivityInvoker, ActivityRegistry};
use keel_durable::clock::ManualClock;
use keel_durable::engine::TaskOutcome;
use keel_durable::prelude::*;

pub const QUEUE: &str = "default";

// =============================================================================
// Workflows
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInput {
    pub amount: i64,
    pub max_attempts: u32,
    #[serde(default)]
    pub heartbeat_ms: Option<u64>,
}

/// One activity, completing with its result
pub struct Transfer {
    input: TransferInput,
    receipt: Option<Value>,
}

impl Workflow for Transfer {
    const TYPE: &'static str = "transfer";
    type Input = TransferInput;
    type Output = Value;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            receipt: None,
        }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowResult {
        let retry = RetryPolicy::exponential()
            .with_max_attempts(self.input.max_attempts)
            .with_initial_interval(Duration::from_secs(1));
        let mut options = ActivityOptions::default()
            .with_retry(retry)
            .with_start_to_close_timeout(Duration::from_secs(30));
        if let Some(ms) = self.input.heartbeat_ms {
            options = options.with_heartbeat(Duration::from_millis(ms));
        }
        Ok(vec![WorkflowAction::schedule_activity_with(
            "debit",
            "debit",
            json!({ "amount": self.input.amount }),
            options,
        )])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Value,
    ) -> WorkflowResult {
        self.receipt = Some(result.clone());
        Ok(vec![WorkflowAction::complete(result)])
    }

    fn query(&self, name: &str, _args: &Value) -> Result<Value, WorkflowError> {
        match name {
            "amount" => Ok(json!(self.input.amount)),
            "receipt" => Ok(self.receipt.clone().unwrap_or(Value::Null)),
            other => Err(WorkflowError::new(format!("unknown query: {other}"))),
        }
    }
}

/// Waits for an approval signal or a deadline, whichever is recorded first
///
/// A `hold` signal drops the deadline and leaves the run waiting for approval.
#[derive(Default)]
pub struct Approval {
    held: bool,
}

impl Workflow for Approval {
    const TYPE: &'static str = "approval";
    type Input = ();
    type Output = String;

    fn new(_input: ()) -> Self {
        Self::default()
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowResult {
        Ok(vec![WorkflowAction::timer("deadline", Duration::from_secs(60))])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowResult {
        Ok(vec![])
    }

    fn on_timer_fired(&mut self, _ctx: &mut WorkflowContext, _timer_id: &str) -> WorkflowResult {
        Ok(vec![WorkflowAction::complete(json!("expired"))])
    }

    fn on_signal(&mut self, _ctx: &mut WorkflowContext, signal: &WorkflowSignal) -> WorkflowResult {
        match signal.name.as_str() {
            "hold" if !self.held => {
                self.held = true;
                Ok(vec![WorkflowAction::cancel_timer("deadline")])
            }
            "approve" if self.held => Ok(vec![WorkflowAction::complete(json!("approved"))]),
            "approve" => Ok(vec![
                WorkflowAction::cancel_timer("deadline"),
                WorkflowAction::complete(json!("approved")),
            ]),
            _ => Ok(vec![]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterInput {
    pub count: u32,
    pub limit: u32,
}

/// Counts up one run at a time with continue-as-new
pub struct Counter {
    input: CounterInput,
}

impl Workflow for Counter {
    const TYPE: &'static str = "counter";
    type Input = CounterInput;
    type Output = u32;

    fn new(input: Self::Input) -> Self {
        Self { input }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowResult {
        if self.input.count >= self.input.limit {
            return Ok(vec![WorkflowAction::complete(json!(self.input.count))]);
        }
        Ok(vec![WorkflowAction::timer("tick", Duration::from_secs(1))])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowResult {
        Ok(vec![])
    }

    fn on_timer_fired(&mut self, _ctx: &mut WorkflowContext, _timer_id: &str) -> WorkflowResult {
        Ok(vec![WorkflowAction::continue_as_new(json!({
            "count": self.input.count + 1,
            "limit": self.input.limit,
        }))])
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Engine on an in-memory store and a manual clock
pub struct Harness {
    pub engine: Arc<Engine<InMemoryEventLogStore>>,
    pub store: Arc<InMemoryEventLogStore>,
    pub clock: Arc<ManualClock>,
    pub invoker: ActivityInvoker,
}

pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry
        .register::<Transfer>()
        .register::<Approval>()
        .register::<Counter>();
    registry
}

impl Harness {
    pub fn new(workflows: WorkflowRegistry, activities: ActivityRegistry) -> Self {
        let store = Arc::new(InMemoryEventLogStore::new());
        let clock = Arc::new(ManualClock::new());
        Self::on_store(store, clock, workflows, activities)
    }

    pub fn with_config(
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::new(InMemoryEventLogStore::new());
        let clock = Arc::new(ManualClock::new());
        Self::build(store, clock, workflows, activities, config)
    }

    pub fn on_store(
        store: Arc<InMemoryEventLogStore>,
        clock: Arc<ManualClock>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
    ) -> Self {
        Self::build(store, clock, workflows, activities, EngineConfig::default())
    }

    fn build(
        store: Arc<InMemoryEventLogStore>,
        clock: Arc<ManualClock>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        config: EngineConfig,
    ) -> Self {
        let engine = Arc::new(Engine::with_clock(
            store.clone(),
            workflows,
            config,
            clock.clone(),
        ));
        Self {
            engine,
            store,
            clock,
            invoker: ActivityInvoker::new(Arc::new(activities)),
        }
    }

    /// Run every workflow task currently queued
    pub async fn run_workflow_tasks(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.engine.poll_workflow_task(QUEUE, Duration::ZERO).await {
            self.engine.run_workflow_task(&task).await.unwrap();
            ran += 1;
        }
        ran
    }

    /// Run every activity task currently queued
    pub async fn run_activity_tasks(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.engine.poll_activity_task(QUEUE, Duration::ZERO).await {
            let cancel = self.engine.cancellation_token(&task);
            let outcome = self.invoker.invoke(&task, cancel, self.engine.as_ref()).await;
            self.engine
                .complete_task(task.id, TaskOutcome::Activity(outcome))
                .await
                .unwrap();
            ran += 1;
        }
        ran
    }

    /// Run tasks until none are left
    pub async fn drain(&self) {
        loop {
            let ran = self.run_workflow_tasks().await + self.run_activity_tasks().await;
            if ran == 0 {
                break;
            }
        }
    }

    /// Move the clock forward and fire whatever became due
    pub async fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.engine.fire_due_timers().await
    }

    pub async fn kinds(&self, execution_id: &str) -> Vec<&'static str> {
        self.engine
            .history(execution_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event.kind())
            .collect()
    }
}

pub fn transfer_input(amount: i64, max_attempts: u32) -> Value {
    serde_json::to_value(TransferInput {
        amount,
        max_attempts,
        heartbeat_ms: None,
    })
    .unwrap()
}
