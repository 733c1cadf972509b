use crate::errors::PermError;
use crate::storage::PermissionStore;
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Name of the job deleting memberships whose expiry has passed
pub const PRUNE_EXPIRED_MEMBERSHIPS: &str = "prune_expired_memberships";

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(store: Arc<dyn PermissionStore>) -> Result<JobScheduler, PermError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| PermError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let store_clone = store.clone();

    // Prune expired memberships job - runs every hour at 15 minutes past
    let prune_job = Job::new_async("0 15 * * * *", move |_uuid, _l| {
        let store = store_clone.clone();
        Box::pin(async move {
            info!("Running {} job", PRUNE_EXPIRED_MEMBERSHIPS);
            match prune_expired_memberships(store.as_ref()).await {
                Ok(count) => info!("Pruned {} expired memberships", count),
                Err(e) => error!("Failed to prune expired memberships: {}", e),
            }
        })
    })
    .map_err(|e| PermError::Other(format!("Failed to create prune memberships job: {}", e)))?;

    sched
        .add(prune_job)
        .await
        .map_err(|e| PermError::Other(format!("Failed to add prune memberships job: {}", e)))?;

    // Start the scheduler
    sched
        .start()
        .await
        .map_err(|e| PermError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", 1);

    Ok(sched)
}

async fn prune_expired_memberships(store: &dyn PermissionStore) -> Result<u64, PermError> {
    store
        .delete_expired_memberships(Utc::now().timestamp(), None)
        .await
}

/// Manually trigger a job by name, returning the number of records it touched
pub async fn trigger_job_manually(
    store: &dyn PermissionStore,
    job_name: &str,
) -> Result<u64, PermError> {
    info!("Manually triggering job: {}", job_name);

    let result = match job_name {
        PRUNE_EXPIRED_MEMBERSHIPS => prune_expired_memberships(store).await,
        _ => {
            return Err(PermError::Other(format!("Unknown job name: {}", job_name)));
        }
    };

    match &result {
        Ok(count) => info!(
            "Manually triggered job {} completed: {} records",
            job_name, count
        ),
        Err(e) => error!("Manually triggered job {} failed: {}", job_name, e),
    }

    result
}
