//! In-memory backend.
//!
//! Reference implementation of [`Backend`] semantics, used as the local
//! store in tests. All collections live behind one mutex; the append-only
//! changelog deduplicates rows by ID so mirroring is idempotent.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GupError;
use crate::plan::phase::{OperationPlan, PlanChange};

use super::{
    Backend, Operation, OpsCenterLink, RoleRecord, SiteRecord, TrustedCluster,
};

#[derive(Default)]
struct Inner {
    plans: HashMap<(String, Uuid), OperationPlan>,
    changelog: Vec<PlanChange>,
    operations: HashMap<String, Vec<Operation>>,
    sites: HashMap<String, SiteRecord>,
    links: HashMap<String, Vec<OpsCenterLink>>,
    trusted_clusters: Vec<TrustedCluster>,
    roles: Vec<RoleRecord>,
}

/// In-memory [`Backend`].
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an operation; the latest added is the last operation.
    pub fn add_operation(&self, operation: Operation) {
        let mut inner = self.inner.lock().expect("backend lock");
        inner
            .operations
            .entry(operation.cluster_name.clone())
            .or_default()
            .push(operation);
    }

    pub fn add_site(&self, site: SiteRecord) {
        let mut inner = self.inner.lock().expect("backend lock");
        inner.sites.insert(site.account_id.clone(), site);
    }

    pub fn set_links(&self, cluster_name: &str, links: Vec<OpsCenterLink>) {
        let mut inner = self.inner.lock().expect("backend lock");
        inner.links.insert(cluster_name.to_string(), links);
    }

    pub fn set_trusted_clusters(&self, clusters: Vec<TrustedCluster>) {
        self.inner.lock().expect("backend lock").trusted_clusters = clusters;
    }

    pub fn set_roles(&self, roles: Vec<RoleRecord>) {
        self.inner.lock().expect("backend lock").roles = roles;
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_operation_plan(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<OperationPlan> {
        let inner = self.inner.lock().expect("backend lock");
        inner
            .plans
            .get(&(cluster_name.to_string(), operation_id))
            .cloned()
            .ok_or_else(|| {
                GupError::NotFound(format!("operation plan for {operation_id}")).into()
            })
    }

    async fn create_operation_plan(&self, plan: &OperationPlan) -> Result<()> {
        let mut inner = self.inner.lock().expect("backend lock");
        let key = (plan.cluster_name.clone(), plan.operation_id);
        if inner.plans.contains_key(&key) {
            return Err(GupError::AlreadyExists(format!(
                "operation plan for {}",
                plan.operation_id
            ))
            .into());
        }
        inner.plans.insert(key, plan.clone());
        Ok(())
    }

    async fn create_operation_plan_change(&self, change: &PlanChange) -> Result<()> {
        let mut inner = self.inner.lock().expect("backend lock");
        if inner.changelog.iter().any(|c| c.id == change.id) {
            return Ok(());
        }
        inner.changelog.push(change.clone());
        Ok(())
    }

    async fn get_operation_plan_changelog(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Vec<PlanChange>> {
        let inner = self.inner.lock().expect("backend lock");
        Ok(inner
            .changelog
            .iter()
            .filter(|c| c.cluster_name == cluster_name && c.operation_id == operation_id)
            .cloned()
            .collect())
    }

    async fn get_last_operation(&self, cluster_name: &str) -> Result<Operation> {
        let inner = self.inner.lock().expect("backend lock");
        inner
            .operations
            .get(cluster_name)
            .and_then(|ops| ops.last())
            .cloned()
            .ok_or_else(|| {
                GupError::NotFound(format!("operations for cluster {cluster_name}")).into()
            })
    }

    async fn update_operation(&self, operation: &Operation) -> Result<()> {
        let mut inner = self.inner.lock().expect("backend lock");
        let operations = inner
            .operations
            .get_mut(&operation.cluster_name)
            .ok_or_else(|| {
                GupError::NotFound(format!("operations for cluster {}", operation.cluster_name))
            })?;
        let existing = operations
            .iter_mut()
            .find(|o| o.id == operation.id)
            .ok_or_else(|| GupError::NotFound(format!("operation {}", operation.id)))?;
        *existing = operation.clone();
        Ok(())
    }

    async fn get_local_site(&self, account_id: &str) -> Result<SiteRecord> {
        let inner = self.inner.lock().expect("backend lock");
        inner
            .sites
            .get(account_id)
            .cloned()
            .ok_or_else(|| GupError::NotFound(format!("site for account {account_id}")).into())
    }

    async fn update_site(&self, site: &SiteRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("backend lock");
        inner.sites.insert(site.account_id.clone(), site.clone());
        Ok(())
    }

    async fn get_ops_center_links(&self, cluster_name: &str) -> Result<Vec<OpsCenterLink>> {
        let inner = self.inner.lock().expect("backend lock");
        Ok(inner.links.get(cluster_name).cloned().unwrap_or_default())
    }

    async fn get_trusted_clusters(&self) -> Result<Vec<TrustedCluster>> {
        let inner = self.inner.lock().expect("backend lock");
        Ok(inner.trusted_clusters.clone())
    }

    async fn get_roles(&self) -> Result<Vec<RoleRecord>> {
        let inner = self.inner.lock().expect("backend lock");
        Ok(inner.roles.clone())
    }
}
