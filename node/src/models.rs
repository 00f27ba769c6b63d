use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use survey_zk::elgamal::{CipherVector, PublicKey};
use survey_zk::proofs::ProofCategory;
use survey_zk::types::RangeBound;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Output-grouping key, e.g. `"[0]"`.
pub type GroupKey = String;

/// Group key → ciphertext vector.
pub type GroupedResponse = BTreeMap<GroupKey, CipherVector>;

pub const DEFAULT_GROUP: &str = "[0]";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofMode {
    #[default]
    None,
    Plain,
    /// Same proofs as `plain`; verifiers reuse a prepared range key.
    Optimized,
}

impl ProofMode {
    pub fn enabled(&self) -> bool {
        !matches!(self, ProofMode::None)
    }
}

/// Differential-privacy noise parameters. All zero means disabled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffPParams {
    pub lap_mean: f64,
    pub lap_scale: f64,
    pub noise_list_size: usize,
    pub quanta: f64,
    pub scale: f64,
    pub limit: f64,
}

impl DiffPParams {
    /// True if any parameter is set.
    pub fn enabled(&self) -> bool {
        self.lap_mean != 0.0
            || self.lap_scale != 0.0
            || self.noise_list_size != 0
            || self.quanta != 0.0
            || self.scale != 0.0
            || self.limit != 0.0
    }
}

/// Operator name plus its parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    /// Value range for histogram-like operators.
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
    /// Number of regressors for `lin_reg`.
    #[serde(default)]
    pub dimension: usize,
}

impl OperationSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min: 0,
            max: 0,
            dimension: 0,
        }
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_dimension(mut self, d: usize) -> Self {
        self.dimension = d;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub operation: OperationSpec,
    /// Ordered input column ids.
    pub selector: Vec<String>,
    /// One bound per output slot; empty when proofs are off.
    #[serde(default)]
    pub ranges: Vec<RangeBound>,
    #[serde(default)]
    pub proofs: ProofMode,
    #[serde(default)]
    pub obfuscation: bool,
    #[serde(default)]
    pub diffp: DiffPParams,
    /// Outer index = signer, inner = one per output slot (hex public points).
    #[serde(default)]
    pub signatures: Vec<Vec<String>>,
    #[serde(default)]
    pub verifiers: Vec<NodeId>,
    /// Simulation-only replication factor; 0 disables it.
    #[serde(default)]
    pub cutting_factor: usize,
    #[serde(default)]
    pub groups: Vec<GroupKey>,
}

impl Query {
    pub fn new(operation: OperationSpec, selector: Vec<String>) -> Self {
        Self {
            operation,
            selector,
            ranges: Vec::new(),
            proofs: ProofMode::None,
            obfuscation: false,
            diffp: DiffPParams::default(),
            signatures: Vec::new(),
            verifiers: Vec::new(),
            cutting_factor: 0,
            groups: Vec::new(),
        }
    }

    /// Declared groups, or the single default group.
    pub fn group_keys(&self) -> Vec<GroupKey> {
        if self.groups.is_empty() {
            vec![DEFAULT_GROUP.to_string()]
        } else {
            self.groups.clone()
        }
    }
}

/// Minimum number of attesting verifying nodes per category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub range: u32,
    #[serde(default)]
    pub shuffle: u32,
    #[serde(default)]
    pub aggregation: u32,
    #[serde(default)]
    pub obfuscation: u32,
    #[serde(default)]
    pub key_switch: u32,
}

impl Thresholds {
    pub fn uniform(t: u32) -> Self {
        Self {
            range: t,
            shuffle: t,
            aggregation: t,
            obfuscation: t,
            key_switch: t,
        }
    }

    pub fn get(&self, category: ProofCategory) -> u32 {
        match category {
            ProofCategory::Range => self.range,
            ProofCategory::Shuffle => self.shuffle,
            ProofCategory::Aggregation => self.aggregation,
            ProofCategory::Obfuscation => self.obfuscation,
            ProofCategory::KeySwitch => self.key_switch,
        }
    }

    pub fn all_zero(&self) -> bool {
        ProofCategory::ALL.iter().all(|c| self.get(*c) == 0)
    }
}

/// Who is in the network and under which keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// The first entry is the root.
    pub computing_nodes: Vec<NodeId>,
    pub data_providers: BTreeMap<NodeId, Vec<NodeId>>,
    pub verifying_nodes: Vec<NodeId>,
    pub node_keys: BTreeMap<NodeId, PublicKey>,
    pub joint_key: PublicKey,
}

/// A query plus everything the network needs to run it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurveyQuery {
    pub session_id: SessionId,
    pub query: Query,
    /// Computing node roster; the first entry is the root.
    pub computing_nodes: Vec<NodeId>,
    /// Computing node → its data providers.
    pub assignment: BTreeMap<NodeId, Vec<NodeId>>,
    pub node_keys: BTreeMap<NodeId, PublicKey>,
    pub joint_key: PublicKey,
    pub querier_key: PublicKey,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// False when sent by the client, true when re-broadcast between computing nodes.
    #[serde(default)]
    pub intra_message: bool,
}

impl SurveyQuery {
    pub fn root(&self) -> Option<&NodeId> {
        self.computing_nodes.first()
    }

    pub fn providers_of(&self, cn: &NodeId) -> &[NodeId] {
        self.assignment.get(cn).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn data_provider_count(&self) -> usize {
        self.assignment.values().map(Vec::len).sum()
    }

    pub fn proofs_enabled(&self) -> bool {
        self.query.proofs.enabled()
    }

    /// Identical apart from the routing flag.
    pub fn same_survey(&self, other: &SurveyQuery) -> bool {
        let mut a = self.clone();
        a.intra_message = other.intra_message;
        &a == other
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Pending,
    Verified,
    Disputed,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Pending => "pending",
            Disposition::Verified => "verified",
            Disposition::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Disposition::Pending),
            "verified" => Some(Disposition::Verified),
            "disputed" => Some(Disposition::Disputed),
            _ => None,
        }
    }
}

/// Per-category accept counts (attesting verifying nodes).
pub type VerificationBitmap = BTreeMap<ProofCategory, u32>;

/// A committed ledger block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub index: i64,
    pub session_id: SessionId,
    pub disposition: Disposition,
    pub bitmap: VerificationBitmap,
    pub prev_hash: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------------------------
// HTTP payloads
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct SurveyRequest {
    pub query: Query,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub session_id: SessionId,
    pub results: BTreeMap<GroupKey, Vec<f64>>,
    pub proofs_requested: bool,
    pub verification_endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub session_id: SessionId,
    pub disposition: Disposition,
    pub bitmap: VerificationBitmap,
    pub block: Option<BlockRef>,
}
