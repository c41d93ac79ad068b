//! Deterministic context handed to workflow handlers
//!
//! Workflow code must not read the wall clock, draw random numbers or
//! iterate unordered maps in ways that affect its output. The context offers
//! replay-safe replacements: time comes from the event being applied,
//! randomness is seeded from the run id, and branch choices for code changes
//! are recorded in history through [`WorkflowContext::get_version`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

/// Version returned for a change point that predates the code change
pub const DEFAULT_VERSION: i32 = -1;

/// Context for one replay of a workflow
#[derive(Debug)]
pub struct WorkflowContext {
    execution_id: String,
    run_id: Uuid,
    workflow_type: String,
    now: DateTime<Utc>,
    replaying: bool,
    cancel_requested: bool,
    versions: HashMap<String, i32>,
    new_markers: Vec<(String, i32)>,
    violation: Option<String>,
    rng: StdRng,
}

impl WorkflowContext {
    /// Create a context for a run
    pub fn new(
        execution_id: impl Into<String>,
        run_id: Uuid,
        workflow_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let (hi, lo) = run_id.as_u64_pair();
        Self {
            execution_id: execution_id.into(),
            run_id,
            workflow_type: workflow_type.into(),
            now,
            replaying: false,
            cancel_requested: false,
            versions: HashMap::new(),
            new_markers: Vec::new(),
            violation: None,
            rng: StdRng::seed_from_u64(hi ^ lo),
        }
    }

    /// Client-supplied execution id
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Current run id
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Registered workflow type
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Time at which the event being handled was recorded
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Whether the handler is re-running an input whose commands are already recorded
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Whether a client has asked this execution to cancel
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Replay-safe random number
    pub fn random_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Replay-safe UUID
    pub fn new_uuid(&mut self) -> Uuid {
        uuid::Builder::from_random_bytes(self.rng.gen()).into_uuid()
    }

    /// Choose a branch for a code change
    ///
    /// The first call for `change_id` in a run records `max_supported` in
    /// history and returns it. Later calls, including every replay, return
    /// the recorded value. A change point reached while replaying history
    /// written before the change existed returns [`DEFAULT_VERSION`].
    ///
    /// A returned value outside `[min_supported, max_supported]` means this
    /// code can no longer run the execution; the task fails with a
    /// non-determinism error once the handler returns.
    pub fn get_version(&mut self, change_id: &str, min_supported: i32, max_supported: i32) -> i32 {
        let version = match self.versions.get(change_id) {
            Some(&recorded) => recorded,
            None => {
                let chosen = if self.replaying {
                    DEFAULT_VERSION
                } else {
                    self.new_markers.push((change_id.to_string(), max_supported));
                    max_supported
                };
                self.versions.insert(change_id.to_string(), chosen);
                chosen
            }
        };

        if version < min_supported || version > max_supported {
            self.violation.get_or_insert_with(|| {
                format!(
                    "version {version} for change '{change_id}' is outside supported range [{min_supported}, {max_supported}]"
                )
            });
        }

        version
    }

    pub(crate) fn load_marker(&mut self, change_id: String, version: i32) {
        self.versions.entry(change_id).or_insert(version);
    }

    pub(crate) fn set_now(&mut self, now: DateTime<Utc>) {
        self.now = now;
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    pub(crate) fn mark_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    pub(crate) fn take_new_markers(&mut self) -> Vec<(String, i32)> {
        std::mem::take(&mut self.new_markers)
    }

    pub(crate) fn take_violation(&mut self) -> Option<String> {
        self.violation.take()
    }
}
