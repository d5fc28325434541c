//! Rule-driven bid interception and mock response synthesis.
//!
//! The engine evaluates incoming bids against an ordered list of rules. Each
//! rule pairs a match spec (`when`) with a response template (`then`) and
//! optionally a set of on-device auction configs (`paapi`). Matched bids are
//! diverted out of the real bidding path: the engine synthesizes a mock
//! response from defaults plus the rule's overrides and delivers it after the
//! rule's configured delay, signaling completion once every matched bid has
//! been handled. Unmatched bids pass through untouched.
//!
//! Rules are authored as JSON (optionally via the [`spec::RuleDefinition`]
//! builder for native closures), compiled once, and swapped atomically, so a
//! host can reconfigure the engine while auctions are in flight.
//!
//! ```no_run
//! use bid_interceptor::{BidInterceptor, InterceptArgs};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let interceptor = BidInterceptor::new();
//! interceptor.update_config_json(&json!([
//!     {"when": {"bidder": "exampleBidder"}, "then": {"cpm": 1.23}},
//! ]));
//!
//! let outcome = interceptor.intercept(InterceptArgs {
//!     bids: None,
//!     bid_request: json!({"bidderRequestId": "br-1", "bids": [
//!         {"bidder": "exampleBidder", "bidId": "b-1"},
//!     ]}),
//!     add_bid: Arc::new(|response, _bid| println!("mock response: {response}")),
//!     add_paapi_config: Arc::new(|_config, _bid, _request| {}),
//!     done: Arc::new(|| println!("batch complete")),
//! });
//! assert!(outcome.bids.is_empty());
//! ```

pub mod config;
pub mod defaults;
pub mod intercept;
pub mod matcher;
pub mod paapi;
pub mod registry;
pub mod replacer;
pub mod script;
pub mod spec;

pub use config::DebuggingConfig;
pub use intercept::{
    AddBidFn, AddPaapiConfigFn, BidInterceptor, DoneFn, InterceptArgs, InterceptOutcome,
    ManualScheduler, Scheduler, TokioScheduler,
};
pub use registry::{serialize_config, CompiledRule, MatchResult, RuleRegistry};
pub use spec::{Delay, RuleDefinition, RuleOptions, SpecNode};
