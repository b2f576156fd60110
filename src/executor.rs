use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::harvest::info::{HarvestInfo, HarvestStatus};
use crate::harvest::runner::{HarvestJob, HarvestRunner};

/// Runs several providers' harvests in parallel, at most
/// `concurrency_limit` at a time.
pub struct HarvestExecutor {
    runner: Arc<HarvestRunner>,
    semaphore: Arc<Semaphore>,
}

impl HarvestExecutor {
    pub fn new(runner: Arc<HarvestRunner>, concurrency_limit: usize) -> Self {
        Self {
            runner,
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    /// Runs every job and returns one info per job, in job order.
    ///
    /// A job that fails or panics only affects its own info; the others run
    /// to completion. All jobs share `cancel`.
    #[instrument(skip_all, fields(providers = jobs.len()))]
    pub async fn run_all(
        &self,
        jobs: Vec<HarvestJob>,
        cancel: &CancellationToken,
    ) -> Vec<HarvestInfo> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let runner = self.runner.clone();
            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();
            let provider = job.descriptor.provider_id;
            let mode = job.mode;

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return HarvestInfo::failed(
                            provider,
                            mode,
                            None,
                            format!("Semaphore error: {}", e),
                        )
                    }
                };
                runner.run_job(&job, &cancel).await
            });
            handles.push((provider, mode, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (provider, mode, handle) in handles {
            let info = match handle.await {
                Ok(info) => info,
                Err(e) => {
                    error!(provider, error = %e, "Harvest task panicked");
                    let info_store = &self.runner.services().info_store;
                    let previous = info_store.load(provider).await.ok().flatten();
                    let info = HarvestInfo::failed(
                        provider,
                        mode,
                        previous.as_ref(),
                        format!("harvest task panicked: {}", e),
                    );
                    if let Err(e) = info_store.save(&info).await {
                        error!(provider, error = %e, "Failed to persist harvest info");
                    }
                    info
                }
            };
            results.push(info);
        }

        info!(
            succeeded = results
                .iter()
                .filter(|i| i.status == HarvestStatus::Succeeded)
                .count(),
            total = results.len(),
            "Finished harvest cycle"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarvesterConfig;
    use crate::harvest::cursor::Watermark;
    use crate::harvest::info::{HarvestMode, HarvestStatus};
    use crate::harvest::memory::MemoryBackend;
    use crate::mapping::{MappingDescriptor, SourceKind};
    use crate::model::ProviderId;
    use crate::snapshot::SnapshotStore;
    use crate::traits::{ConnectorError, SourceBatch, SourceConnector};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Empty source that tracks how many pulls run at once.
    struct GaugedConnector {
        provider: ProviderId,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        panics: bool,
    }

    #[async_trait]
    impl SourceConnector for GaugedConnector {
        fn provider_id(&self) -> ProviderId {
            self.provider
        }

        async fn pull(
            &self,
            _cursor: Option<&Watermark>,
            _max_batch: usize,
        ) -> Result<SourceBatch, ConnectorError> {
            if self.panics {
                panic!("connector bug");
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(SourceBatch {
                records: Vec::new(),
                watermark: Some(Watermark::ChangeSequence(1)),
                has_more: false,
            })
        }
    }

    fn jobs(count: u32, panicking: Option<u32>, peak: &Arc<AtomicUsize>) -> Vec<HarvestJob> {
        let running = Arc::new(AtomicUsize::new(0));
        (1..=count)
            .map(|provider| {
                let connector = GaugedConnector {
                    provider,
                    running: running.clone(),
                    peak: peak.clone(),
                    panics: panicking == Some(provider),
                };
                let descriptor = MappingDescriptor::new(
                    provider,
                    format!("Provider {provider}"),
                    format!("ds-{provider}"),
                    "example.org",
                    SourceKind::Structured,
                );
                HarvestJob::new(Arc::new(connector), Arc::new(descriptor), HarvestMode::Full)
            })
            .collect()
    }

    fn executor(backend: &MemoryBackend, limit: usize) -> HarvestExecutor {
        let runner = HarvestRunner::new(
            &HarvesterConfig::default(),
            Arc::new(SnapshotStore::default()),
            backend.services(),
        );
        HarvestExecutor::new(Arc::new(runner), limit)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let backend = MemoryBackend::new();
        let peak = Arc::new(AtomicUsize::new(0));
        let results = executor(&backend, 2)
            .run_all(jobs(5, None, &peak), &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|i| i.status == HarvestStatus::Succeeded));
        let providers: Vec<_> = results.iter().map(|i| i.provider_id).collect();
        assert_eq!(providers, vec![1, 2, 3, 4, 5]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_provider_fails_alone() {
        let backend = MemoryBackend::new();
        let peak = Arc::new(AtomicUsize::new(0));
        let results = executor(&backend, 4)
            .run_all(jobs(3, Some(2), &peak), &CancellationToken::new())
            .await;

        assert_eq!(results[0].status, HarvestStatus::Succeeded);
        assert_eq!(results[1].status, HarvestStatus::Failed);
        assert!(results[1].message.as_deref().unwrap().contains("panicked"));
        assert_eq!(results[2].status, HarvestStatus::Succeeded);
        assert_eq!(
            backend.infos.latest(2).map(|i| i.status),
            Some(HarvestStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_second_cycle_reads_persisted_cursor() {
        let backend = MemoryBackend::new();
        let executor = executor(&backend, 2);
        let peak = Arc::new(AtomicUsize::new(0));

        executor.run_all(jobs(1, None, &peak), &CancellationToken::new()).await;
        let mut second = jobs(1, None, &peak);
        second[0].mode = HarvestMode::Incremental;
        let results = executor.run_all(second, &CancellationToken::new()).await;

        assert_eq!(results[0].cursor_before, Some(Watermark::ChangeSequence(1)));
        assert_eq!(
            results[0].previous.as_ref().map(|p| p.status),
            Some(HarvestStatus::Succeeded)
        );
    }
}
