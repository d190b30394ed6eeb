//! Protocol front ends.
//!
//! Two RPC front ends share the dispatcher and differ only in their message
//! shapes, deadline and breaker key. Each decodes its request into an
//! [`InferenceRequest`], dispatches it, and encodes the [`InferResponse`] (or
//! the sentinel of an interrupted call) back into its own response shape.
//!
//! Listeners and wire codecs are not part of this crate; these types are what
//! a transport binding hands in and gets back.

use std::future::Future;
use std::time::Duration;

use infer_core::{DispatchSettings, InferResponse, InferenceRequest, ScoredItem, TenantKey};
use serde::{Deserialize, Serialize};

use crate::dispatcher::{Dispatcher, InterruptReason};

/// Breaker key of the gRPC front end.
pub const GRPC_BREAKER_KEY: &str = "grpcServer";

/// Breaker key of the Dubbo front end.
pub const DUBBO_BREAKER_KEY: &str = "dubboServer";

// ============================================================================
// Frontend trait
// ============================================================================

/// What distinguishes one front end from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendProfile {
    /// Name used in logs.
    pub name: &'static str,

    /// Circuit breaker key.
    pub breaker_key: &'static str,

    /// Wall-clock budget per request.
    pub deadline: Duration,
}

/// A protocol front end.
pub trait Frontend {
    /// Transport request shape.
    type Request;

    /// Transport response shape.
    type Response;

    /// Deadline and breaker key.
    fn profile(&self) -> &FrontendProfile;

    /// Normalize a transport request.
    fn decode(&self, request: Self::Request) -> InferenceRequest;

    /// Encode a response, the sentinel of an interrupted call included.
    fn encode(&self, response: InferResponse) -> Self::Response;
}

/// A front end's answer, with the interruption reason when there was one.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<R> {
    /// The encoded response; always well formed.
    pub response: R,

    /// Set when the deadline or a cancellation ended the wait.
    pub interrupted: Option<InterruptReason>,
}

/// Decode, dispatch under the front end's deadline, and encode.
pub async fn serve<F: Frontend>(
    frontend: &F,
    dispatcher: &Dispatcher,
    request: F::Request,
) -> Reply<F::Response> {
    serve_with_cancel(frontend, dispatcher, request, std::future::pending()).await
}

/// Like [`serve`], also ending the wait when `cancelled` resolves.
pub async fn serve_with_cancel<F, C>(
    frontend: &F,
    dispatcher: &Dispatcher,
    request: F::Request,
    cancelled: C,
) -> Reply<F::Response>
where
    F: Frontend,
    C: Future<Output = ()>,
{
    let profile = frontend.profile();
    let request = frontend.decode(request);

    match dispatcher
        .dispatch_with_cancel(request, profile.deadline, profile.breaker_key, cancelled)
        .await
    {
        Ok(response) => Reply {
            response: frontend.encode(response),
            interrupted: None,
        },
        Err(interrupted) => {
            tracing::info!(frontend = profile.name, reason = %interrupted.reason, "replying with sentinel");
            Reply {
                response: frontend.encode(interrupted.response),
                interrupted: Some(interrupted.reason),
            }
        }
    }
}

fn recall_num(raw: i32) -> u32 {
    u32::try_from(raw).unwrap_or(0)
}

// ============================================================================
// gRPC
// ============================================================================

/// Repeated string wrapper used by the gRPC request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringList {
    /// The strings.
    pub value: Vec<String>,
}

/// gRPC recommend request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendRequest {
    /// Tenant data id.
    pub data_id: String,
    /// Tenant group id.
    pub group_id: String,
    /// Tenant namespace.
    pub namespace: String,
    /// User to recommend for.
    pub user_id: String,
    /// Results wanted; negative values count as zero.
    pub recall_num: i32,
    /// Candidate items.
    pub item_list: Option<StringList>,
    /// `"recall"` or `"rank"`.
    pub model_type: String,
}

/// gRPC recommend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendResponse {
    /// Status code.
    pub code: i32,
    /// Diagnostic message.
    pub message: String,
    /// Result rows.
    pub data: Vec<ScoredItem>,
}

/// The gRPC front end.
#[derive(Debug, Clone)]
pub struct GrpcFrontend {
    profile: FrontendProfile,
}

impl GrpcFrontend {
    /// Create the front end with its deadline from `settings`.
    pub fn new(settings: &DispatchSettings) -> Self {
        Self {
            profile: FrontendProfile {
                name: "grpc",
                breaker_key: GRPC_BREAKER_KEY,
                deadline: settings.grpc_deadline(),
            },
        }
    }
}

impl Frontend for GrpcFrontend {
    type Request = RecommendRequest;
    type Response = RecommendResponse;

    fn profile(&self) -> &FrontendProfile {
        &self.profile
    }

    fn decode(&self, request: RecommendRequest) -> InferenceRequest {
        InferenceRequest::new(
            TenantKey::new(request.data_id, request.group_id, request.namespace),
            request.user_id,
            request.model_type,
        )
        .with_items(request.item_list.map(|l| l.value).unwrap_or_default())
        .with_recall_num(recall_num(request.recall_num))
    }

    fn encode(&self, response: InferResponse) -> RecommendResponse {
        RecommendResponse {
            code: response.code,
            message: response.message,
            data: response.data,
        }
    }
}

// ============================================================================
// Dubbo
// ============================================================================

/// Dubbo recommend request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecRequest {
    /// Tenant data id.
    pub data_id: String,
    /// Tenant group id.
    pub group_id: String,
    /// Tenant namespace id.
    pub namespace_id: String,
    /// User to recommend for.
    pub user_id: String,
    /// Results wanted; negative values count as zero.
    pub recall_num: i32,
    /// Candidate items.
    pub item_list: Vec<String>,
    /// `"recall"` or `"rank"`.
    pub model_type: String,
}

/// Dubbo recommend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecResponse {
    /// Status code.
    pub code: i32,
    /// Diagnostic message.
    pub message: String,
    /// Result rows.
    pub data: Vec<ScoredItem>,
}

/// The Dubbo front end.
#[derive(Debug, Clone)]
pub struct DubboFrontend {
    profile: FrontendProfile,
}

impl DubboFrontend {
    /// Create the front end with its deadline from `settings`.
    pub fn new(settings: &DispatchSettings) -> Self {
        Self {
            profile: FrontendProfile {
                name: "dubbo",
                breaker_key: DUBBO_BREAKER_KEY,
                deadline: settings.dubbo_deadline(),
            },
        }
    }
}

impl Frontend for DubboFrontend {
    type Request = RecRequest;
    type Response = RecResponse;

    fn profile(&self) -> &FrontendProfile {
        &self.profile
    }

    fn decode(&self, request: RecRequest) -> InferenceRequest {
        InferenceRequest::new(
            TenantKey::new(request.data_id, request.group_id, request.namespace_id),
            request.user_id,
            request.model_type,
        )
        .with_items(request.item_list)
        .with_recall_num(recall_num(request.recall_num))
    }

    fn encode(&self, response: InferResponse) -> RecResponse {
        RecResponse {
            code: response.code,
            message: response.message,
            data: response.data,
        }
    }
}
