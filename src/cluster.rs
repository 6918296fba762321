//! Cluster API access.
//!
//! Pod and node access goes through the `ClusterApi` trait so observers and
//! the contractor can be exercised in tests without a live cluster.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::api::{ListParams, Patch, PatchParams};
use kube::Api;
use serde_json::json;

/// Capabilities the reconciliation core needs from the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List pods across all namespaces.
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// List all nodes in the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Merge the given labels into a node's metadata and replace its taint
    /// list.
    async fn patch_node(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        taints: Vec<Taint>,
    ) -> Result<()>;
}

/// Production implementation backed by the kubernetes API server.
pub struct KubeClusterApi {
    client: kube::Client,
}

impl KubeClusterApi {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

/// Establish cluster credentials for one reconciliation tick.
///
/// Credentials are re-established every tick because in-cluster tokens are
/// temporary and do not survive extended execution.
pub async fn connect(external: bool) -> Result<KubeClusterApi> {
    let config = if external {
        kube::Config::from_kubeconfig(&kube::config::KubeConfigOptions::default())
            .await
            .context("Loading kubeconfig credentials")?
    } else {
        kube::Config::incluster().context("Loading in-cluster credentials")?
    };
    let client = kube::Client::try_from(config).context("Building cluster client")?;
    Ok(KubeClusterApi::new(client))
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default())
            .await
            .context("Listing cluster pods")?;
        Ok(pods.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .context("Listing cluster nodes")?;
        Ok(nodes.items)
    }

    async fn patch_node(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        taints: Vec<Taint>,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {"labels": labels},
            "spec": {"taints": taints},
        });
        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .with_context(|| format!("Patching node {name}"))?;
        Ok(())
    }
}

/// Recorded node patch issued against the mock cluster.
#[derive(Debug, Clone)]
pub struct NodePatch {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

/// Mock implementation for testing
#[derive(Default)]
pub struct MockClusterApi {
    pub pods: Vec<Pod>,
    pub nodes: Vec<Node>,
    pub patches: Mutex<Vec<NodePatch>>,
}

impl MockClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pods(mut self, pods: Vec<Pod>) -> Self {
        self.pods = pods;
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn recorded_patches(&self) -> Vec<NodePatch> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }

    async fn patch_node(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        taints: Vec<Taint>,
    ) -> Result<()> {
        self.patches.lock().unwrap().push(NodePatch {
            name: name.to_string(),
            labels,
            taints,
        });
        Ok(())
    }
}
