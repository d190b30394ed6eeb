//! Request serving for the inference server.
//!
//! This crate wraps the model pipeline in the two layers that keep a request
//! inside its latency budget, and exposes the protocol front ends that feed
//! it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       infer-server                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  GrpcFrontend (150 ms, "grpcServer")                        │
//! │  DubboFrontend (100 ms, "dubboServer")                      │
//! │  serve: decode ─▶ dispatch ─▶ encode                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Dispatcher (spawned unit of work vs deadline vs cancel)    │
//! │  └── validate, watch tenant, resolve config snapshot        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CircuitBreakers (failsafe, one breaker per key)            │
//! │  ├── primary: ModelPipeline::run                            │
//! │  └── fallback: ModelPipeline::run on degraded strategy      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  InferService (assembles everything from InferSettings)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod breaker;
pub mod dispatcher;
pub mod frontend;
pub mod logging;
pub mod service;

pub use breaker::{Breaker, BreakerPolicy, CircuitBreakers, CircuitOutcome, TracingInstrument};
pub use dispatcher::{Dispatcher, InterruptReason, Interrupted};
pub use frontend::{
    DUBBO_BREAKER_KEY, DubboFrontend, Frontend, FrontendProfile, GRPC_BREAKER_KEY, GrpcFrontend,
    RecRequest, RecResponse, RecommendRequest, RecommendResponse, Reply, StringList, serve,
    serve_with_cancel,
};
pub use logging::init_logging;
pub use service::InferService;
