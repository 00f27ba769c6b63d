//! An in-process deployment: every role runs as a task on one shared [`Network`].

use crate::client::Client;
use crate::config::ClusterConfig;
use crate::errors::SurveyError;
use crate::models::{NodeId, SessionId, SurveyQuery, Topology};
use crate::network::Network;
use crate::protocols::data_collection::DataProvider;
use crate::protocols::NodeContext;
use crate::provider::{DataLoader, Neutralizer};
use crate::service::ComputingNode;
use crate::state::ProofKeys;
use crate::verification::{GateStatus, Ledger, ThresholdGate, VerifyingNode};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use survey_zk::elgamal::{aggregate_public_keys, KeyPair};
use tokio::task::JoinHandle;

pub struct LocalCluster {
    network: Network,
    topology: Topology,
    gates: BTreeMap<NodeId, Arc<ThresholdGate>>,
    ledger: Ledger,
    proof_keys: ProofKeys,
    decryption_limit: i64,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Start `cn-{i}`, `dp-{i}-{j}` and `vn-{i}`. `providers` supplies each data provider's
    /// loader and neutralizer from its computing node and provider index.
    pub fn start<F>(config: &ClusterConfig, ledger: Ledger, proof_keys: ProofKeys, mut providers: F) -> Self
    where
        F: FnMut(usize, usize) -> (Arc<dyn DataLoader>, Arc<dyn Neutralizer>),
    {
        let network = Network::new(config.channel_capacity);
        let mut tasks = Vec::new();

        let mut computing_nodes = Vec::with_capacity(config.computing_nodes);
        let mut data_providers = BTreeMap::new();
        let mut node_keys = BTreeMap::new();
        for i in 0..config.computing_nodes {
            let id = NodeId::new(format!("cn-{i}"));
            let keys = KeyPair::generate(&mut OsRng);
            node_keys.insert(id.clone(), keys.public);

            let mailbox = network.register(id.clone());
            let node = ComputingNode::new(NodeContext::new(id.clone(), keys, network.clone()));
            tasks.push(node.spawn(mailbox));

            let mut dps = Vec::with_capacity(config.providers_per_node);
            for j in 0..config.providers_per_node {
                let dp_id = NodeId::new(format!("dp-{i}-{j}"));
                let (loader, neutralizer) = providers(i, j);
                let mailbox = network.register(dp_id.clone());
                let dp = Arc::new(DataProvider::new(
                    dp_id.clone(),
                    network.clone(),
                    loader,
                    neutralizer,
                    proof_keys.clone(),
                ));
                tasks.push(dp.spawn(mailbox));
                dps.push(dp_id);
            }
            data_providers.insert(id.clone(), dps);
            computing_nodes.push(id);
        }

        let mut verifying_nodes = Vec::with_capacity(config.verifying_nodes);
        let mut gates = BTreeMap::new();
        for i in 0..config.verifying_nodes {
            let id = NodeId::new(format!("vn-{i}"));
            let gate = Arc::new(ThresholdGate::new(ledger.clone()));
            let mailbox = network.register(id.clone());
            let vn = Arc::new(VerifyingNode::new(id.clone(), network.clone(), proof_keys.clone(), gate.clone()));
            tasks.push(vn.spawn(mailbox));
            gates.insert(id.clone(), gate);
            verifying_nodes.push(id);
        }

        let joint_key = aggregate_public_keys(node_keys.values());
        tracing::info!(
            computing_nodes = computing_nodes.len(),
            data_providers = data_providers.values().map(Vec::len).sum::<usize>(),
            verifying_nodes = verifying_nodes.len(),
            "local cluster started"
        );

        Self {
            network,
            topology: Topology {
                computing_nodes,
                data_providers,
                verifying_nodes,
                node_keys,
                joint_key,
            },
            gates,
            ledger,
            proof_keys,
            decryption_limit: config.decryption_limit,
            tasks,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Where clients submit surveys.
    pub fn root(&self) -> Option<&NodeId> {
        self.topology.computing_nodes.first()
    }

    /// Gate deciding `survey`: the one on the first node of its verifier roster.
    pub fn gate_for(&self, survey: &SurveyQuery) -> Option<&Arc<ThresholdGate>> {
        survey.query.verifiers.first().and_then(|id| self.gates.get(id))
    }

    /// Status from whichever gate tracks `session`.
    pub fn verification_status(&self, session: &SessionId) -> Option<GateStatus> {
        self.gates.values().find_map(|gate| gate.status(session))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn proof_keys(&self) -> &ProofKeys {
        &self.proof_keys
    }

    /// A querier attached to this cluster's network.
    pub async fn client(&self, name: &str) -> Result<Client, SurveyError> {
        Client::connect(NodeId::new(name), self.network.clone(), self.decryption_limit).await
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
