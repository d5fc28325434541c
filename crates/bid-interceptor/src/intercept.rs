//! Interception orchestrator.
//!
//! `intercept` partitions a candidate batch against the registry, eagerly
//! synthesizes the response and auction configs for each match, and schedules
//! their delivery after each rule's delay. Completion is a countdown latch
//! keyed by the match count: `done` fires exactly once, after every scheduled
//! delivery has run its side effects, regardless of relative delays. The
//! caller gets the unmatched residue back synchronously and never blocks.

use crate::config::DebuggingConfig;
use crate::defaults::{default_response_processors, ResponseProcessors};
use crate::registry::{self, CompiledRule, MatchResult, RuleRegistry};
use crate::spec::RuleDefinition;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Deferred-delivery primitive: run `task` after `delay`. Injectable so tests
/// can substitute a deterministic clock.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>);
}

/// Default scheduler: spawns a tokio task that sleeps for the delay. Must be
/// used within a tokio runtime.
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}

struct QueuedTask {
    due: Duration,
    seq: usize,
    task: Box<dyn FnOnce() + Send>,
}

/// Deterministic scheduler for tests: queues tasks and runs them on demand in
/// delay order (scheduling order breaks ties).
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<QueuedTask>>,
    seq: AtomicUsize,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued task, shortest delay first. Tasks queued while
    /// running (none in practice) wait for the next call.
    pub fn run_all(&self) {
        let mut tasks = std::mem::take(&mut *self.queue.lock());
        tasks.sort_by_key(|t| (t.due, t.seq));
        for queued in tasks {
            (queued.task)();
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(QueuedTask {
            due: delay,
            seq,
            task,
        });
    }
}

/// Delivery callback for a synthesized response: `(response, originating bid)`.
pub type AddBidFn = Arc<dyn Fn(Value, Value) + Send + Sync>;
/// Delivery callback for one auction config: `(config, bid, bidder request)`.
pub type AddPaapiConfigFn = Arc<dyn Fn(Value, Value, Value) + Send + Sync>;
/// Completion callback; invoked exactly once per `intercept` call.
pub type DoneFn = Arc<dyn Fn() + Send + Sync>;

/// Arguments to one `intercept` call.
pub struct InterceptArgs {
    /// Candidate batch; defaults to `bid_request.bids` when absent.
    pub bids: Option<Vec<Value>>,
    /// The umbrella bidder request; also the positional match context.
    pub bid_request: Value,
    pub add_bid: AddBidFn,
    pub add_paapi_config: AddPaapiConfigFn,
    pub done: DoneFn,
}

/// Residual work for the real (non-mocked) path.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptOutcome {
    /// The unmatched subset, order preserved.
    pub bids: Vec<Value>,
    /// Independent copy of the bidder request with its bid list replaced by
    /// the unmatched subset.
    pub bid_request: Value,
}

/// The interception engine: compiled rule registry plus the collaborators for
/// response post-processing and delivery scheduling.
pub struct BidInterceptor {
    registry: RuleRegistry,
    processors: ResponseProcessors,
    scheduler: Arc<dyn Scheduler>,
}

impl BidInterceptor {
    /// Engine with the default media-type processors and the tokio scheduler.
    pub fn new() -> Self {
        Self {
            registry: RuleRegistry::new(),
            processors: default_response_processors(),
            scheduler: Arc::new(TokioScheduler),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_processors(mut self, processors: ResponseProcessors) -> Self {
        self.processors = processors;
        self
    }

    /// Replace the active rule set (replace-the-whole-list semantics).
    pub fn update_config(&self, defs: &[RuleDefinition]) {
        self.registry.update_config(defs);
    }

    /// Replace the active rule set from a raw JSON array of rule objects.
    pub fn update_config_json(&self, raw: &Value) {
        self.registry.update_config_json(raw);
    }

    /// Rebuild the rule set from a debugging config envelope. A disabled
    /// envelope installs an empty rule list.
    pub fn apply_config(&self, config: &DebuggingConfig) {
        if config.enabled {
            self.update_config(&config.rules());
        } else {
            self.update_config(&[]);
        }
    }

    /// Filter rule definitions to the serializable subset (see
    /// [`registry::serialize_config`]). Advisory for persistence only; the
    /// active in-memory rules are unaffected.
    pub fn serialize_config(&self, defs: &[RuleDefinition]) -> Vec<Value> {
        registry::serialize_config(defs)
    }

    pub fn rule_count(&self) -> usize {
        self.registry.rule_count()
    }

    /// First matching rule for a candidate, if any.
    pub fn match_rule(&self, candidate: &Value, context: &[Value]) -> Option<Arc<CompiledRule>> {
        self.registry.match_rule(candidate, context)
    }

    /// Partition a batch into matched and unmatched.
    pub fn match_all(&self, bids: &[Value], context: &[Value]) -> (Vec<MatchResult>, Vec<Value>) {
        self.registry.match_all(bids, context)
    }

    /// Divert matched bids to synthesized delivery and return the unmatched
    /// residue for the real path. All synthesis happens synchronously here;
    /// only delivery (and the completion signal) is deferred.
    pub fn intercept(&self, args: InterceptArgs) -> InterceptOutcome {
        let InterceptArgs {
            bids,
            bid_request,
            add_bid,
            add_paapi_config,
            done,
        } = args;

        let bids = bids.unwrap_or_else(|| {
            bid_request
                .get("bids")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        });

        let context = [bid_request.clone()];
        let (matches, unmatched) = self.registry.match_all(&bids, &context);

        if matches.is_empty() {
            // Still asynchronous: done never runs inside the caller's stack.
            let done = Arc::clone(&done);
            self.scheduler
                .schedule(Duration::ZERO, Box::new(move || done()));
            return InterceptOutcome { bids, bid_request };
        }

        let remaining = Arc::new(AtomicUsize::new(matches.len()));
        for matched in matches {
            let MatchResult { bid, rule } = matched;
            let response = rule.response(&bid, &context, &self.processors);
            let paapi_configs = rule.paapi_configs(&bid, &context);
            let delay = rule.delay();
            let bid_id = bid.get("bidId").and_then(Value::as_str).unwrap_or("?");
            debug!(
                "rule #{} intercepted bid {} (delay {}ms, {} auction config(s))",
                rule.ordinal(),
                bid_id,
                delay.as_millis(),
                paapi_configs.len()
            );

            let add_bid = Arc::clone(&add_bid);
            let add_paapi_config = Arc::clone(&add_paapi_config);
            let done = Arc::clone(&done);
            let remaining = Arc::clone(&remaining);
            let request = bid_request.clone();
            self.scheduler.schedule(
                delay,
                Box::new(move || {
                    if let Some(response) = response {
                        add_bid(response, bid.clone());
                    }
                    for config in paapi_configs {
                        add_paapi_config(config, bid.clone(), request.clone());
                    }
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        done();
                    }
                }),
            );
        }

        let mut residual_request = bid_request;
        if let Some(obj) = residual_request.as_object_mut() {
            obj.insert("bids".to_string(), Value::Array(unmatched.clone()));
        }
        InterceptOutcome {
            bids: unmatched,
            bid_request: residual_request,
        }
    }
}

impl Default for BidInterceptor {
    fn default() -> Self {
        Self::new()
    }
}
