//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tenantflow_core::{ExpectedVersion, JobId, TenantId};

use super::types::{JobStats, JobStatus, ProvisioningJob};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} was modified concurrently (expected {expected:?}, found {actual})")]
    Conflict {
        id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless the workspace already has an active job, in which
    /// case that job is returned with `false`. Atomic per workspace.
    async fn create_if_absent(
        &self,
        job: ProvisioningJob,
    ) -> Result<(ProvisioningJob, bool), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<ProvisioningJob>, JobStoreError>;

    /// Most recently created job of a workspace, any status.
    async fn latest_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<ProvisioningJob>, JobStoreError>;

    /// Active jobs, `in_progress` before `pending`, oldest first.
    async fn list_runnable(&self, limit: usize) -> Result<Vec<ProvisioningJob>, JobStoreError>;

    /// Persist `job` if the stored version matches; returns the job with its
    /// new version.
    async fn update(
        &self,
        job: &ProvisioningJob,
        expected: ExpectedVersion,
    ) -> Result<ProvisioningJob, JobStoreError>;

    /// Latest job per workspace, newest first. `tenant_id` narrows to one.
    async fn latest_per_tenant(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError>;

    /// Active jobs not updated since `idle_since`.
    async fn list_stuck(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError>;

    /// Jobs that failed at or after `since`, newest first.
    async fn list_failed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError>;

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<JobStats, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create_if_absent(
        &self,
        job: ProvisioningJob,
    ) -> Result<(ProvisioningJob, bool), JobStoreError> {
        (**self).create_if_absent(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<ProvisioningJob>, JobStoreError> {
        (**self).get(id).await
    }

    async fn latest_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<ProvisioningJob>, JobStoreError> {
        (**self).latest_for_tenant(tenant_id).await
    }

    async fn list_runnable(&self, limit: usize) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        (**self).list_runnable(limit).await
    }

    async fn update(
        &self,
        job: &ProvisioningJob,
        expected: ExpectedVersion,
    ) -> Result<ProvisioningJob, JobStoreError> {
        (**self).update(job, expected).await
    }

    async fn latest_per_tenant(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        (**self).latest_per_tenant(tenant_id, limit).await
    }

    async fn list_stuck(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        (**self).list_stuck(idle_since, limit).await
    }

    async fn list_failed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        (**self).list_failed_since(since, limit).await
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id).await
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, ProvisioningJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, ProvisioningJob>>, JobStoreError>
    {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Unavailable("job table poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobId, ProvisioningJob>>, JobStoreError>
    {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Unavailable("job table poisoned".into()))
    }
}

fn newest_first(a: &ProvisioningJob, b: &ProvisioningJob) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_if_absent(
        &self,
        mut job: ProvisioningJob,
    ) -> Result<(ProvisioningJob, bool), JobStoreError> {
        let mut jobs = self.write()?;
        if let Some(active) = jobs
            .values()
            .find(|j| j.workspace_id == job.workspace_id && j.is_active())
        {
            return Ok((active.clone(), false));
        }
        job.version = 1;
        jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    async fn get(&self, id: JobId) -> Result<Option<ProvisioningJob>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn latest_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<ProvisioningJob>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| j.workspace_id == tenant_id)
            .min_by(|a, b| newest_first(a, b))
            .cloned())
    }

    async fn list_runnable(&self, limit: usize) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut runnable: Vec<ProvisioningJob> =
            jobs.values().filter(|j| j.is_active()).cloned().collect();
        runnable.sort_by(|a, b| {
            let resume_first = |j: &ProvisioningJob| j.status != JobStatus::InProgress;
            resume_first(a)
                .cmp(&resume_first(b))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        runnable.truncate(limit);
        Ok(runnable)
    }

    async fn update(
        &self,
        job: &ProvisioningJob,
        expected: ExpectedVersion,
    ) -> Result<ProvisioningJob, JobStoreError> {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if !expected.matches(stored.version) {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected,
                actual: stored.version,
            });
        }
        let mut updated = job.clone();
        updated.version = stored.version + 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn latest_per_tenant(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut latest: HashMap<TenantId, &ProvisioningJob> = HashMap::new();
        for job in jobs.values() {
            if tenant_id.is_some_and(|t| t != job.workspace_id) {
                continue;
            }
            latest
                .entry(job.workspace_id)
                .and_modify(|current| {
                    if newest_first(job, current).is_lt() {
                        *current = job;
                    }
                })
                .or_insert(job);
        }

        let mut latest: Vec<ProvisioningJob> = latest.into_values().cloned().collect();
        latest.sort_by(newest_first);
        latest.truncate(limit);
        Ok(latest)
    }

    async fn list_stuck(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut stuck: Vec<ProvisioningJob> = jobs
            .values()
            .filter(|j| j.is_active() && j.updated_at < idle_since)
            .cloned()
            .collect();
        stuck.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn list_failed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut failed: Vec<ProvisioningJob> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && j.updated_at >= since)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            if tenant_id.is_none_or(|t| t == job.workspace_id) {
                stats.add(job.status, 1);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::jobs::JobSource;

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn job_at(tenant: TenantId, at: DateTime<Utc>) -> ProvisioningJob {
        ProvisioningJob::new(tenant, JobSource::Manual, serde_json::json!({}), at)
    }

    #[tokio::test]
    async fn create_if_absent_returns_the_active_job() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let now = Utc::now();

        let (first, created) = store.create_if_absent(job_at(tenant, now)).await.unwrap();
        assert!(created);
        assert_eq!(first.version, 1);

        let (second, created) = store.create_if_absent(job_at(tenant, now)).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);

        // A terminal job does not block a new one.
        let mut done = first.clone();
        done.mark_completed(now);
        store.update(&done, ExpectedVersion::Exact(1)).await.unwrap();
        let (_, created) = store.create_if_absent(job_at(tenant, now)).await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn update_rejects_stale_versions() {
        let store = InMemoryJobStore::new();
        let (job, _) = store
            .create_if_absent(job_at(test_tenant(), Utc::now()))
            .await
            .unwrap();

        let updated = store.update(&job, ExpectedVersion::Exact(1)).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.update(&job, ExpectedVersion::Exact(1)).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { actual: 2, .. }));
    }

    #[tokio::test]
    async fn runnable_jobs_resume_before_new_ones() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let (older_pending, _) = store
            .create_if_absent(job_at(test_tenant(), now - Duration::minutes(10)))
            .await
            .unwrap();
        let (newer, _) = store
            .create_if_absent(job_at(test_tenant(), now))
            .await
            .unwrap();
        let mut resumed = newer.clone();
        resumed.mark_in_progress(now);
        store.update(&resumed, ExpectedVersion::Exact(1)).await.unwrap();

        let runnable = store.list_runnable(10).await.unwrap();
        assert_eq!(runnable[0].id, newer.id);
        assert_eq!(runnable[1].id, older_pending.id);
    }

    #[tokio::test]
    async fn stuck_and_latest_queries() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let tenant = test_tenant();

        let (stale, _) = store
            .create_if_absent(job_at(tenant, now - Duration::hours(2)))
            .await
            .unwrap();
        store
            .create_if_absent(job_at(test_tenant(), now))
            .await
            .unwrap();

        let stuck = store
            .list_stuck(now - Duration::minutes(15), 10)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, stale.id);

        let latest = store.latest_per_tenant(None, 10).await.unwrap();
        assert_eq!(latest.len(), 2);
        let only = store.latest_per_tenant(Some(tenant), 10).await.unwrap();
        assert_eq!(only[0].id, stale.id);

        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(store.stats(Some(tenant)).await.unwrap().total(), 1);
    }
}
