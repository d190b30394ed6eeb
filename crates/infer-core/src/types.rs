//! Common types shared by every stage of the inference pipeline.
//!
//! These types are transport-agnostic: the protocol front ends decode their
//! own request shapes into an [`InferenceRequest`] and encode an
//! [`InferResponse`] back out.

use serde::{Deserialize, Serialize};

/// Status code of a successfully served request.
pub const STATUS_OK: i32 = 200;

/// Default status of every response until the pipeline overwrites it.
pub const STATUS_NOT_FOUND: i32 = 404;

// ============================================================================
// Request
// ============================================================================

/// Identifies a tenant's service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    /// Configuration data id; the tenant id proper.
    pub data_id: String,

    /// Configuration group.
    pub group_id: String,

    /// Configuration namespace.
    pub namespace_id: String,
}

impl TenantKey {
    /// Create a tenant key.
    pub fn new(
        data_id: impl Into<String>,
        group_id: impl Into<String>,
        namespace_id: impl Into<String>,
    ) -> Self {
        Self {
            data_id: data_id.into(),
            group_id: group_id.into(),
            namespace_id: namespace_id.into(),
        }
    }
}

/// A normalized inference request.
///
/// Built once per inbound call. The only transformation allowed afterwards is
/// [`InferenceRequest::degrade`], which consumes the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Tenant the request is served for.
    pub tenant: TenantKey,

    /// User to recommend for.
    pub user_id: String,

    /// Candidate items (required for rank).
    pub item_list: Vec<String>,

    /// `"recall"` or `"rank"`.
    pub model_type: String,

    /// Number of results wanted.
    pub recall_num: u32,
}

impl InferenceRequest {
    /// Create a request for a tenant, user and model type.
    pub fn new(
        tenant: TenantKey,
        user_id: impl Into<String>,
        model_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant,
            user_id: user_id.into(),
            model_type: model_type.into(),
            ..Default::default()
        }
    }

    /// Set the candidate items.
    pub fn with_items<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.item_list = items.into_iter().map(Into::into).collect();
        self
    }

    /// Set the number of results wanted.
    pub fn with_recall_num(mut self, recall_num: u32) -> Self {
        self.recall_num = recall_num;
        self
    }

    /// Tenant id used for config lookup and cache keys.
    pub fn tenant_id(&self) -> &str {
        &self.tenant.data_id
    }

    /// Reduce the workload for degraded serving.
    ///
    /// Keeps at most `lower_rank_num` candidate items and replaces the recall
    /// count with `lower_recall_num`. A list already shorter than the bound is
    /// kept whole.
    pub fn degrade(mut self, lower_rank_num: usize, lower_recall_num: u32) -> Self {
        self.item_list.truncate(lower_rank_num);
        self.recall_num = lower_recall_num;
        self
    }
}

// ============================================================================
// Features
// ============================================================================

/// A single serialized feature blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqExampleBuff {
    /// Entity id the blob belongs to.
    pub key: String,

    /// Raw serialized example bytes.
    pub buff: Vec<u8>,
}

impl SeqExampleBuff {
    /// Create a blob.
    pub fn new(key: impl Into<String>, buff: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            buff,
        }
    }

    /// An empty blob standing in for a lookup that produced nothing.
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, Vec::new())
    }

    /// Whether the blob carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.buff.is_empty()
    }
}

/// The assembled feature bundle for one request.
///
/// Any part may be empty: assembly is best-effort under a deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleFeatures {
    /// Offline (batch-computed) user features.
    pub user: SeqExampleBuff,

    /// Online/context user features.
    pub user_context: SeqExampleBuff,

    /// Per-item features, in request order of the items that arrived.
    #[serde(default)]
    pub items: Vec<SeqExampleBuff>,
}

impl ExampleFeatures {
    /// Features with empty user blobs and no items.
    pub fn empty_for(user_id: &str) -> Self {
        Self {
            user: SeqExampleBuff::empty(user_id),
            user_context: SeqExampleBuff::empty(user_id),
            items: Vec::new(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// One candidate produced by vector search or rank scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInfo {
    /// Item identifier.
    pub item_id: String,

    /// Raw similarity or rank score.
    pub score: f32,
}

impl ItemInfo {
    /// Create a candidate.
    pub fn new(item_id: impl Into<String>, score: f32) -> Self {
        Self {
            item_id: item_id.into(),
            score,
        }
    }
}

/// A formatted result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    /// Item identifier.
    pub itemid: String,

    /// Score rounded to four decimal digits.
    pub score: f64,
}

/// The response handed back to a protocol front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferResponse {
    /// Numeric status; [`STATUS_NOT_FOUND`] unless the pipeline succeeded.
    pub code: i32,

    /// Diagnostic message, empty on success.
    #[serde(default)]
    pub message: String,

    /// Result rows.
    #[serde(default)]
    pub data: Vec<ScoredItem>,
}

impl InferResponse {
    /// The sentinel "not found" response.
    pub fn not_found() -> Self {
        Self {
            code: STATUS_NOT_FOUND,
            message: String::new(),
            data: Vec::new(),
        }
    }

    /// A successful response carrying result rows.
    pub fn ok(data: Vec<ScoredItem>) -> Self {
        Self {
            code: STATUS_OK,
            message: String::new(),
            data,
        }
    }

    /// Attach a diagnostic message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Whether this is a served (non-sentinel) response.
    pub fn is_ok(&self) -> bool {
        self.code == STATUS_OK
    }
}

impl Default for InferResponse {
    fn default() -> Self {
        Self::not_found()
    }
}
