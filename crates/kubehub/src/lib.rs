//! kln kubehub: kube client construction and a `ResourceStore` over the
//! dynamic API.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kln_core::{Record, ResourceType};
use kln_store::{Propagation, ResourceStore, StoreError};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client, Config,
};
use metrics::histogram;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Build a client from an explicit kubeconfig path, or the default chain
/// (in-cluster, `KUBECONFIG`, `~/.kube/config`) when none is given.
pub async fn get_kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default().await.context("building default kube client");
    };
    let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("loading kubeconfig {}", path.display()))?;
    Client::try_from(cfg).context("building kube client")
}

/// Resolve a resource type against the API server. Returns the API resource
/// and whether it is namespaced.
async fn find_api_resource(client: Client, rt: &ResourceType) -> Result<Option<(ApiResource, bool)>> {
    let discovery = Discovery::new(client).filter(&[rt.group.as_str()]).run().await?;
    for group in discovery.groups() {
        if group.name() != rt.group {
            continue;
        }
        for (ar, caps) in group.versioned_resources(&rt.version) {
            if ar.plural == rt.resource {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(Some((ar, namespaced)));
            }
        }
    }
    Ok(None)
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn record_from(rt: &ResourceType, obj: &DynamicObject) -> Result<Record, StoreError> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Record::from_object(rt.clone(), &raw).map_err(|e| StoreError::Transport(anyhow!(e)))
}

fn map_kube_err(e: kube::Error, rt: &ResourceType, namespace: Option<&str>, name: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::not_found(rt, namespace, name),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::conflict(rt, namespace, name),
        other => StoreError::Transport(anyhow::Error::new(other).context(format!("{} {:?}/{}", rt, namespace, name))),
    }
}

fn propagation_policy(p: Propagation) -> PropagationPolicy {
    match p {
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Orphan => PropagationPolicy::Orphan,
    }
}

/// `ResourceStore` backed by the kube dynamic API. Resource types are
/// resolved through discovery once and cached for the life of the store.
pub struct KubeStore {
    client: Client,
    resolved: Mutex<FxHashMap<ResourceType, Option<(ApiResource, bool)>>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: Mutex::new(FxHashMap::default()) }
    }

    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        Ok(Self::new(get_kube_client(kubeconfig).await?))
    }

    async fn resolve(&self, rt: &ResourceType) -> Result<(ApiResource, bool), StoreError> {
        let mut cache = self.resolved.lock().await;
        let entry = match cache.get(rt) {
            Some(hit) => hit.clone(),
            None => {
                let found = find_api_resource(self.client.clone(), rt)
                    .await
                    .with_context(|| format!("discovering {}", rt))?;
                match &found {
                    Some((ar, namespaced)) => debug!(gvr = %rt, kind = %ar.kind, namespaced, "resource type resolved"),
                    None => info!(gvr = %rt, "resource type not served by the cluster"),
                }
                cache.insert(rt.clone(), found.clone());
                found
            }
        };
        entry.ok_or_else(|| StoreError::NotFound(format!("resource type {} is not served", rt)))
    }

    async fn all_api(&self, rt: &ResourceType) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, _) = self.resolve(rt).await?;
        Ok(Api::all_with(self.client.clone(), &ar))
    }

    async fn object_api(&self, rt: &ResourceType, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resolve(rt).await?;
        match (namespaced, namespace) {
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            (true, None) => Err(StoreError::Transport(anyhow!("namespace required for namespaced kind {}", rt))),
            (false, _) => Ok(Api::all_with(self.client.clone(), &ar)),
        }
    }

    async fn list_with(&self, rt: &ResourceType, lp: &ListParams) -> Result<Vec<Record>, StoreError> {
        let t0 = Instant::now();
        let api = self.all_api(rt).await?;
        let list = api.list(lp).await.map_err(|e| map_kube_err(e, rt, None, "*"))?;
        histogram!("kln_kube_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(gvr = %rt, count = list.items.len(), selector = ?lp.label_selector, "listed");
        list.items.iter().map(|o| record_from(rt, o)).collect()
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn list(&self, rt: &ResourceType) -> Result<Vec<Record>, StoreError> {
        self.list_with(rt, &ListParams::default()).await
    }

    async fn list_labeled(&self, rt: &ResourceType, key: &str, value: &str) -> Result<Vec<Record>, StoreError> {
        let lp = ListParams::default().labels(&format!("{}={}", key, value));
        self.list_with(rt, &lp).await
    }

    async fn patch_labels(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Record, StoreError> {
        let t0 = Instant::now();
        let api = self.object_api(rt, namespace).await?;
        let payload = serde_json::json!({"metadata": {"labels": labels}});
        let obj = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .map_err(|e| map_kube_err(e, rt, namespace, name))?;
        histogram!("kln_kube_patch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        record_from(rt, &obj)
    }

    async fn delete(
        &self,
        rt: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        propagation: Option<Propagation>,
    ) -> Result<(), StoreError> {
        let t0 = Instant::now();
        let api = self.object_api(rt, namespace).await?;
        let dp = DeleteParams { propagation_policy: propagation.map(propagation_policy), ..Default::default() };
        let _ = api.delete(name, &dp).await.map_err(|e| map_kube_err(e, rt, namespace, name))?;
        histogram!("kln_kube_delete_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }
}
