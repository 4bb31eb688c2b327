//! Integration tests for the full job pipeline.
//!
//! Tests: Submission → JobStore → Orchestrator → Capabilities → JobStore
//!
//! Verifies:
//! - Critical failures fail the job with the capability's message
//! - Best-effort failures leave the job Completed and are recorded out of band
//! - Concurrent and stale claims resolve to exactly one active worker

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use adsight_ai::{
        AccountSnapshot, AnalysisResults, Analyzer, ArtifactHandle, CampaignSnapshot, Capabilities,
        CapabilityError, ExportRequest, Exporter, Notification, Notifier, NotifyAck, SnapshotSource,
    };
    use adsight_core::{AccountId, JobRef, OwnerId};
    use adsight_jobs::{AnalysisStatus, Claim, ReportSource, ReportStatus, SourceDescriptor};
    use adsight_metrics::NormalizedMetrics;

    use crate::accounts::{InMemoryAccountDirectory, LinkedAccount};
    use crate::jobs::{InMemoryJobStore, JobStore, JobStoreError};
    use crate::orchestrator::{
        InMemoryStageWarningSink, Orchestrator, OrchestratorConfig, OrchestratorError, Stage,
        StageTimeouts, TerminalStatus, WorkerPool, WorkerPoolConfig,
    };
    use crate::service::{JobService, SubmissionLimits};

    /// How a scripted capability answers.
    #[derive(Debug, Clone)]
    enum Script {
        Succeed,
        Fail(&'static str),
        Hang,
    }

    impl Script {
        async fn run<T>(&self, value: impl FnOnce() -> T) -> Result<T, CapabilityError> {
            match self {
                Script::Succeed => Ok(value()),
                Script::Fail(msg) => Err(CapabilityError::rejected(*msg)),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(value())
                }
            }
        }
    }

    struct FakeAnalyzer {
        script: Script,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        async fn analyze(&self, metrics: &NormalizedMetrics) -> Result<AnalysisResults, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let rows = metrics.total_rows;
            self.script
                .run(|| AnalysisResults {
                    insights: vec![format!("{rows} rows analysed"), "CTR is healthy".to_string()],
                    ..Default::default()
                })
                .await
        }
    }

    struct FakeExporter {
        script: Script,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Exporter for FakeExporter {
        async fn export(&self, request: &ExportRequest) -> Result<ArtifactHandle, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let job = request.job;
            self.script.run(|| ArtifactHandle::new(format!("mem://{job}"))).await
        }
    }

    struct FakeNotifier {
        script: Script,
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, notification: &Notification) -> Result<NotifyAck, CapabilityError> {
            self.sent.lock().unwrap().push(notification.clone());
            self.script.run(NotifyAck::default).await
        }
    }

    struct FakeSnapshots {
        script: Script,
    }

    #[async_trait]
    impl SnapshotSource for FakeSnapshots {
        async fn fetch_snapshot(&self, account: AccountId) -> Result<AccountSnapshot, CapabilityError> {
            self.script
                .run(|| AccountSnapshot {
                    account_id: account,
                    platform: "meta".to_string(),
                    fetched_at: Utc::now(),
                    campaigns: vec![CampaignSnapshot {
                        campaign_id: "c-1".to_string(),
                        name: "Launch".to_string(),
                        status: Some("ACTIVE".to_string()),
                        budget: Some(100.0),
                        spend: Some(42.0),
                        impressions: Some(5_000),
                        clicks: Some(120),
                        conversions: Some(6),
                        ctr: Some(2.4),
                        cpc: Some(0.35),
                        cpm: Some(8.4),
                    }],
                })
                .await
        }
    }

    struct Scripts {
        analyze: Script,
        export: Script,
        notify: Script,
        snapshot: Script,
    }

    impl Default for Scripts {
        fn default() -> Self {
            Self {
                analyze: Script::Succeed,
                export: Script::Succeed,
                notify: Script::Succeed,
                snapshot: Script::Succeed,
            }
        }
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        accounts: Arc<InMemoryAccountDirectory>,
        service: JobService,
        orchestrator: Arc<Orchestrator>,
        warnings: Arc<InMemoryStageWarningSink>,
        analyzer: Arc<FakeAnalyzer>,
        exporter: Arc<FakeExporter>,
        notifier: Arc<FakeNotifier>,
        owner: OwnerId,
    }

    fn harness(scripts: Scripts) -> Harness {
        harness_with(scripts, |_| {})
    }

    fn harness_with(scripts: Scripts, tweak: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
        let store = InMemoryJobStore::arc();
        let accounts = Arc::new(InMemoryAccountDirectory::new());
        let warnings = Arc::new(InMemoryStageWarningSink::new());

        let analyzer = Arc::new(FakeAnalyzer {
            script: scripts.analyze,
            calls: AtomicUsize::new(0),
        });
        let exporter = Arc::new(FakeExporter {
            script: scripts.export,
            calls: AtomicUsize::new(0),
        });
        let notifier = Arc::new(FakeNotifier {
            script: scripts.notify,
            sent: Mutex::new(Vec::new()),
        });
        let capabilities = Capabilities {
            analyzer: analyzer.clone(),
            exporter: exporter.clone(),
            notifier: notifier.clone(),
            snapshots: Arc::new(FakeSnapshots {
                script: scripts.snapshot,
            }),
        };

        let mut config = OrchestratorConfig {
            timeouts: StageTimeouts {
                normalize: Duration::from_secs(5),
                analyze: Duration::from_millis(100),
                export: Duration::from_millis(100),
                fetch_snapshot: Duration::from_millis(100),
                notify: Duration::from_millis(100),
            },
            ..OrchestratorConfig::default()
        };
        tweak(&mut config);

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            capabilities,
            warnings.clone(),
            config,
        ));
        let service = JobService::new(store.clone(), accounts.clone(), SubmissionLimits::default());

        Harness {
            store,
            accounts,
            service,
            orchestrator,
            warnings,
            analyzer,
            exporter,
            notifier,
            owner: OwnerId::new(),
        }
    }

    fn ads_csv() -> SourceDescriptor {
        SourceDescriptor::csv(
            "ads.csv",
            "Ad Name,Impressions,Clicks,Spend\nA,100,10,5\nB,200,20,10\nC,300,30,15\n",
        )
    }

    fn notified(h: &Harness) -> Vec<Notification> {
        h.notifier.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn analysis_completes_then_exports_and_notifies() {
        let h = harness(Scripts::default());
        let job = h
            .service
            .submit_analysis(h.owner, ads_csv(), Some("owner@example.com".into()))
            .await
            .unwrap();

        let outcome = h.orchestrator.process_next("w-1").await.unwrap().unwrap();
        assert_eq!(outcome.job, JobRef::from(job.id));
        assert_eq!(outcome.status, TerminalStatus::Completed);
        assert!(outcome.warnings.is_empty());

        let stored = h.service.get_analysis(h.owner, job.id).await.unwrap();
        assert_eq!(stored.status(), AnalysisStatus::Completed);
        assert!(stored.error().is_none());
        assert!(stored.completed_at().is_some());
        let results = h.service.analysis_results(h.owner, job.id).await.unwrap();
        assert_eq!(results.insights[0], "3 rows analysed");

        assert_eq!(h.exporter.calls.load(Ordering::SeqCst), 1);
        let sent = notified(&h);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "owner@example.com");
        assert_eq!(sent[0].summary.insight_count, 2);
        assert_eq!(
            sent[0].artifact.as_ref().map(ArtifactHandle::as_str),
            Some(format!("mem://analysis:{}", job.id).as_str())
        );

        // Nothing left to do.
        assert!(h.orchestrator.process_next("w-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn analyze_failure_fails_job_with_capability_message_and_skips_notify() {
        let h = harness(Scripts {
            analyze: Script::Fail("model quota exceeded"),
            ..Scripts::default()
        });
        let job = h
            .service
            .submit_analysis(h.owner, ads_csv(), Some("owner@example.com".into()))
            .await
            .unwrap();

        let outcome = h.orchestrator.run_analysis(job.id, "w-1").await.unwrap();
        assert_eq!(outcome.status, TerminalStatus::Failed);
        assert!(matches!(
            outcome.failure,
            Some(OrchestratorError::CriticalStageFailure {
                stage: Stage::Analyze,
                ..
            })
        ));

        let stored = h.service.get_analysis(h.owner, job.id).await.unwrap();
        assert_eq!(stored.status(), AnalysisStatus::Failed);
        assert_eq!(stored.error(), Some("model quota exceeded"));
        assert!(stored.results().is_none());

        assert!(notified(&h).is_empty());
        assert_eq!(h.exporter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.orchestrator.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn malformed_input_fails_without_calling_analyzer() {
        let h = harness(Scripts::default());
        let job = h
            .service
            .submit_analysis(
                h.owner,
                SourceDescriptor::csv("ads.csv", "Impressions,Clicks\n100\n"),
                None,
            )
            .await
            .unwrap();

        let outcome = h.orchestrator.run_analysis(job.id, "w-1").await.unwrap();
        assert!(matches!(outcome.failure, Some(OrchestratorError::MalformedInput(_))));

        let stored = h.store.get_analysis(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), AnalysisStatus::Failed);
        assert!(stored.error().unwrap().starts_with("malformed input"));
        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn header_only_csv_is_left_to_the_analyzer() {
        let h = harness(Scripts::default());
        let job = h
            .service
            .submit_analysis(h.owner, SourceDescriptor::csv("ads.csv", "Impressions,Clicks\n"), None)
            .await
            .unwrap();

        let outcome = h.orchestrator.run_analysis(job.id, "w-1").await.unwrap();
        assert_eq!(outcome.status, TerminalStatus::Completed);
        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);

        let results = h.service.analysis_results(h.owner, job.id).await.unwrap();
        assert_eq!(results.insights[0], "0 rows analysed");
    }

    #[tokio::test]
    async fn oversized_source_fails_before_normalizing() {
        let source = ads_csv();
        let limit = source.payload.size_bytes() - 1;
        let h = harness_with(Scripts::default(), |config| config.max_source_bytes = limit);
        // Submission limits are looser than the worker's, as with a job
        // written by an older deployment.
        let job = h.service.submit_analysis(h.owner, source, None).await.unwrap();

        let outcome = h.orchestrator.run_analysis(job.id, "w-1").await.unwrap();
        assert_eq!(outcome.status, TerminalStatus::Failed);
        assert!(matches!(
            outcome.failure,
            Some(OrchestratorError::CriticalStageFailure {
                stage: Stage::Normalize,
                ..
            })
        ));
        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 0);

        let stored = h.store.get_analysis(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), AnalysisStatus::Failed);
        assert!(stored.error().unwrap().contains("bytes"));
    }

    #[tokio::test]
    async fn analyze_timeout_is_a_critical_failure() {
        let h = harness(Scripts {
            analyze: Script::Hang,
            ..Scripts::default()
        });
        let job = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();

        let outcome = h.orchestrator.run_analysis(job.id, "w-1").await.unwrap();
        assert_eq!(outcome.status, TerminalStatus::Failed);

        let stored = h.store.get_analysis(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error(), Some("analyze timed out after 100ms"));
    }

    #[tokio::test]
    async fn best_effort_failures_after_analysis_keep_it_completed() {
        let h = harness(Scripts {
            export: Script::Fail("renderer offline"),
            notify: Script::Hang,
            ..Scripts::default()
        });
        let job = h
            .service
            .submit_analysis(h.owner, ads_csv(), Some("owner@example.com".into()))
            .await
            .unwrap();

        let outcome = h.orchestrator.run_analysis(job.id, "w-1").await.unwrap();
        assert_eq!(outcome.status, TerminalStatus::Completed);
        assert_eq!(outcome.warnings.len(), 2);

        let stored = h.store.get_analysis(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), AnalysisStatus::Completed);
        assert!(stored.error().is_none());

        // Notify still runs, just without an artifact.
        let sent = notified(&h);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].artifact.is_none());

        let stages: Vec<_> = h
            .warnings
            .for_job(job.id.into())
            .into_iter()
            .map(|w| w.stage)
            .collect();
        assert_eq!(stages, [Stage::Export, Stage::Notify]);
        assert_eq!(h.orchestrator.stats().best_effort_warnings, 2);
    }

    #[tokio::test]
    async fn report_on_unfinished_analysis_fails_source_not_ready() {
        let h = harness(Scripts::default());
        let analysis = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();
        let report = h
            .service
            .submit_report(
                h.owner,
                ReportSource::FromAnalysis {
                    analysis_id: analysis.id,
                },
                None,
            )
            .await
            .unwrap();

        let outcome = h.orchestrator.run_report(report.id, "w-1").await.unwrap();
        assert!(matches!(outcome.failure, Some(OrchestratorError::SourceNotReady(_))));

        let stored = h.service.get_report(h.owner, report.id).await.unwrap();
        assert_eq!(stored.status(), ReportStatus::Failed);
        assert!(stored.artifact().is_none());
        assert_eq!(
            stored.error().map(str::to_string),
            Some(format!("source not ready: analysis {} is pending", analysis.id))
        );
        assert_eq!(h.exporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn report_notify_failure_leaves_report_completed() {
        let h = harness(Scripts {
            notify: Script::Fail("mailbox full"),
            ..Scripts::default()
        });
        let analysis = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();
        h.orchestrator.run_analysis(analysis.id, "w-1").await.unwrap();

        let report = h
            .service
            .submit_report(
                h.owner,
                ReportSource::FromAnalysis {
                    analysis_id: analysis.id,
                },
                Some("owner@example.com".into()),
            )
            .await
            .unwrap();
        let outcome = h.orchestrator.run_report(report.id, "w-1").await.unwrap();

        assert_eq!(outcome.status, TerminalStatus::Completed);
        assert!(matches!(
            outcome.warnings.as_slice(),
            [OrchestratorError::BestEffortStageFailure {
                stage: Stage::Notify,
                ..
            }]
        ));

        let stored = h.service.get_report(h.owner, report.id).await.unwrap();
        assert_eq!(stored.status(), ReportStatus::Completed);
        assert_eq!(
            stored.artifact().map(ArtifactHandle::as_str),
            Some(format!("mem://report:{}", report.id).as_str())
        );
        assert!(stored.error().is_none());

        let warnings = h.warnings.for_job(report.id.into());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "mailbox full");
    }

    #[tokio::test]
    async fn report_export_failure_is_critical() {
        let h = harness(Scripts {
            export: Script::Fail("disk full"),
            ..Scripts::default()
        });
        let analysis = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();
        h.orchestrator.run_analysis(analysis.id, "w-1").await.unwrap();
        let report = h
            .service
            .submit_report(
                h.owner,
                ReportSource::FromAnalysis {
                    analysis_id: analysis.id,
                },
                Some("owner@example.com".into()),
            )
            .await
            .unwrap();

        let outcome = h.orchestrator.run_report(report.id, "w-1").await.unwrap();
        assert_eq!(outcome.status, TerminalStatus::Failed);

        let stored = h.store.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.error(), Some("disk full"));
        assert!(notified(&h).is_empty());
    }

    fn link_account(h: &Harness) -> AccountId {
        let id = AccountId::new();
        h.accounts.register(LinkedAccount {
            id,
            owner: h.owner,
            platform: "meta".into(),
            active: true,
        });
        id
    }

    #[tokio::test]
    async fn live_account_report_exports_snapshot() {
        let h = harness(Scripts::default());
        let account_id = link_account(&h);
        let report = h
            .service
            .submit_report(
                h.owner,
                ReportSource::FromLiveAccount { account_id },
                Some("owner@example.com".into()),
            )
            .await
            .unwrap();

        let outcome = h.orchestrator.process_next("w-1").await.unwrap().unwrap();
        assert_eq!(outcome.job, JobRef::from(report.id));
        assert_eq!(outcome.status, TerminalStatus::Completed);

        let sent = notified(&h);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].summary.headline_insights[0], "1 campaigns on meta");
    }

    #[tokio::test]
    async fn live_snapshot_failure_fails_report() {
        let h = harness(Scripts {
            snapshot: Script::Fail("token expired"),
            ..Scripts::default()
        });
        let account_id = link_account(&h);
        let report = h
            .service
            .submit_report(h.owner, ReportSource::FromLiveAccount { account_id }, None)
            .await
            .unwrap();

        let outcome = h.orchestrator.run_report(report.id, "w-1").await.unwrap();
        assert!(matches!(
            outcome.failure,
            Some(OrchestratorError::CriticalStageFailure {
                stage: Stage::FetchSnapshot,
                ..
            })
        ));
        let stored = h.store.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.error(), Some("token expired"));
        assert_eq!(h.exporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let h = harness(Scripts::default());
        let job = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();

        let (a, b) = tokio::join!(
            h.orchestrator.run_analysis(job.id, "w-a"),
            h.orchestrator.run_analysis(job.id, "w-b"),
        );

        let (won, lost): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(Result::is_ok);
        assert_eq!(won.len(), 1);
        assert!(matches!(
            lost.as_slice(),
            [Err(OrchestratorError::ClaimConflict(_))]
        ));
        assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.orchestrator.stats().claim_conflicts, 1);
        assert_eq!(h.orchestrator.stats().jobs_processed, 1);
    }

    #[tokio::test]
    async fn stale_claim_is_recovered_and_old_holder_cannot_commit() {
        let h = harness(Scripts::default());
        let job = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();

        // A worker claimed the job an hour ago and then died.
        let crashed = Claim::new("w-crashed", Utc::now() - chrono::Duration::hours(1));
        let crashed_token = crashed.token;
        let mut abandoned = h
            .store
            .claim_analysis(job.id, crashed, chrono::Duration::seconds(900))
            .await
            .unwrap();

        let outcome = h.orchestrator.process_next("w-1").await.unwrap().unwrap();
        assert_eq!(outcome.status, TerminalStatus::Completed);

        // The old holder wakes up and tries to finish its copy.
        abandoned
            .fail(crashed_token, String::from("late"), Utc::now())
            .unwrap();
        assert!(matches!(
            h.store.commit_analysis(&abandoned, crashed_token).await,
            Err(JobStoreError::ClaimConflict(_))
        ));
        let stored = h.store.get_analysis(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), AnalysisStatus::Completed);
    }

    #[tokio::test]
    async fn fresh_claims_are_not_recovered() {
        let h = harness(Scripts::default());
        let job = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();
        h.store
            .claim_analysis(
                job.id,
                Claim::new("w-busy", Utc::now()),
                chrono::Duration::seconds(900),
            )
            .await
            .unwrap();

        assert!(h.orchestrator.process_next("w-1").await.unwrap().is_none());
        let queue = h.service.queue_status(h.owner).await.unwrap();
        assert_eq!(queue.analyses[0].status(), AnalysisStatus::Processing);
    }

    #[tokio::test]
    async fn retry_resubmits_failed_analysis() {
        let h = harness(Scripts {
            analyze: Script::Fail("upstream 503"),
            ..Scripts::default()
        });
        let failed = h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();
        h.orchestrator.run_analysis(failed.id, "w-1").await.unwrap();

        let retry = h.service.retry_analysis(h.owner, failed.id).await.unwrap();
        assert_ne!(retry.id, failed.id);
        assert_eq!(retry.retry_of, Some(failed.id));
        assert_eq!(retry.status(), AnalysisStatus::Pending);
        assert_eq!(retry.source, failed.source);

        // The failed record is untouched.
        let original = h.service.get_analysis(h.owner, failed.id).await.unwrap();
        assert_eq!(original.status(), AnalysisStatus::Failed);

        assert!(matches!(
            h.service.retry_analysis(OwnerId::new(), failed.id).await,
            Err(OrchestratorError::Forbidden(_))
        ));

        let stats = h.service.stats(h.owner).await.unwrap();
        assert_eq!(stats.analyses.failed, 1);
        assert_eq!(stats.analyses.pending, 1);
    }

    #[tokio::test]
    async fn worker_pool_drains_queue_and_shuts_down() {
        let h = harness(Scripts::default());
        for _ in 0..5 {
            h.service.submit_analysis(h.owner, ads_csv(), None).await.unwrap();
        }

        let pool = WorkerPool::spawn(
            h.orchestrator.clone(),
            WorkerPoolConfig {
                workers: 3,
                poll_interval: Duration::from_millis(10),
                name: "test-worker".into(),
            },
        );
        assert_eq!(pool.worker_count(), 3);

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pool.stats().jobs_completed == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "pool did not drain the queue");

        pool.shutdown().await;

        let stats = h.service.stats(h.owner).await.unwrap();
        assert_eq!(stats.analyses.completed, 5);
    }
}
