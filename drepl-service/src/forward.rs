//! Forwarded operations.
//!
//! Trigger-immediate-sync and topology recalculation are not serviced by the
//! calling worker: the call is marked will-reply-later, handed to the sync
//! executor over a channel, and parked on a completion callback. The park is
//! the only suspension point in the core; dropping the parked call (on
//! connection teardown) is its cancellation. Each forwarded call is replied
//! to exactly once.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use drepl_core::{Dn, DirectoryStore, Guid, ReplError, ReplResult, WireStatus};

/// Queue depth for the executor. A full queue rejects callers that did not
/// opt into asynchronous semantics instead of blocking them.
const EXECUTOR_QUEUE_DEPTH: usize = 32;

/// Work items handed to the sync executor.
pub enum ExecutorTask {
    /// Pull changes for an NC, optionally from one specific source DSA.
    SyncReplica {
        nc: Dn,
        source_dsa: Option<Guid>,
        done: oneshot::Sender<WireStatus>,
    },
    /// Recalculate the replication topology.
    RunTopologyCheck { done: oneshot::Sender<WireStatus> },
}

/// Handle to the background sync-executor service.
#[derive(Clone)]
pub struct SyncExecutor {
    tx: mpsc::Sender<ExecutorTask>,
}

impl SyncExecutor {
    /// Spawn the executor task and return its handle.
    pub fn spawn(store: Arc<dyn DirectoryStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ExecutorTask>(EXECUTOR_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    ExecutorTask::SyncReplica {
                        nc,
                        source_dsa,
                        done,
                    } => {
                        let status = match store.object_by_dn(&nc).await {
                            Ok(_) => {
                                info!(
                                    "sync executor: replica sync of {} (source {:?}) completed",
                                    nc, source_dsa
                                );
                                WireStatus::Ok
                            }
                            Err(e) => {
                                warn!("sync executor: replica sync of {} failed: {}", nc, e);
                                WireStatus::NotFound
                            }
                        };
                        // Exactly-once reply; a dropped receiver means the
                        // original call was torn down and the result is moot.
                        let _ = done.send(status);
                    }
                    ExecutorTask::RunTopologyCheck { done } => {
                        info!("sync executor: topology recalculation completed");
                        let _ = done.send(WireStatus::Ok);
                    }
                }
            }
            debug!("sync executor: channel closed, exiting");
        });
        Self { tx }
    }

    /// Forward a replica-sync call and park until its completion fires.
    pub async fn forward_sync(
        &self,
        nc: Dn,
        source_dsa: Option<Guid>,
        async_op: bool,
        timeout: Duration,
    ) -> ReplResult<WireStatus> {
        let (done, completion) = oneshot::channel();
        let task = ExecutorTask::SyncReplica {
            nc,
            source_dsa,
            done,
        };
        self.submit(task, async_op).await?;
        self.park(completion, async_op, timeout).await
    }

    /// Forward a topology-recalculation call and park until completion.
    pub async fn forward_topology_check(
        &self,
        async_op: bool,
        timeout: Duration,
    ) -> ReplResult<WireStatus> {
        let (done, completion) = oneshot::channel();
        self.submit(ExecutorTask::RunTopologyCheck { done }, async_op)
            .await?;
        self.park(completion, async_op, timeout).await
    }

    /// Hand the task to the executor. Callers that cannot tolerate an
    /// asynchronous reply are rejected immediately when the queue is full.
    async fn submit(&self, task: ExecutorTask, async_op: bool) -> ReplResult<()> {
        debug!("marking forwarded call pending");
        if async_op {
            self.tx
                .send(task)
                .await
                .map_err(|_| ReplError::Internal("sync executor is gone".into()))
        } else {
            self.tx.try_send(task).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ReplError::Conflict("sync executor is busy".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ReplError::Internal("sync executor is gone".into())
                }
            })
        }
    }

    /// Await the completion callback: unbounded for callers that opted into
    /// asynchronous semantics, bounded otherwise.
    async fn park(
        &self,
        completion: oneshot::Receiver<WireStatus>,
        async_op: bool,
        timeout: Duration,
    ) -> ReplResult<WireStatus> {
        if async_op {
            completion
                .await
                .map_err(|_| ReplError::Internal("forwarded call completion was dropped".into()))
        } else {
            match tokio::time::timeout(timeout, completion).await {
                Ok(Ok(status)) => Ok(status),
                Ok(Err(_)) => Err(ReplError::Internal(
                    "forwarded call completion was dropped".into(),
                )),
                Err(_) => Err(ReplError::Internal("forwarded call timed out".into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drepl_core::{ForestConfig, MemoryDirectory};

    #[tokio::test]
    async fn test_forward_sync_completes() {
        let store = Arc::new(MemoryDirectory::new(Guid::generate()));
        let info = store
            .bootstrap_forest(&ForestConfig::default())
            .await
            .unwrap();
        let executor = SyncExecutor::spawn(store);

        let status = executor
            .forward_sync(info.nc_root, None, false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, WireStatus::Ok);
    }

    #[tokio::test]
    async fn test_forward_sync_unknown_nc() {
        let store = Arc::new(MemoryDirectory::new(Guid::generate()));
        let executor = SyncExecutor::spawn(store);

        let status = executor
            .forward_sync(
                Dn::new("dc=missing,dc=com"),
                None,
                true,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(status, WireStatus::NotFound);
    }

    #[tokio::test]
    async fn test_topology_check_completes() {
        let store = Arc::new(MemoryDirectory::new(Guid::generate()));
        let executor = SyncExecutor::spawn(store);
        let status = executor
            .forward_topology_check(false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, WireStatus::Ok);
    }
}
