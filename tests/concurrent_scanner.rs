// Scheduling, isolation and draining of scan jobs

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{info, BlockingPlugin, EchoPlugin, PanickingPlugin, ScriptedHandshaker, ServerModel, SlowPlugin};
use rust_tlsaudit::errors::SchedulerError;
use rust_tlsaudit::{
    ClientAuthRequirement, CommandId, ConcurrentScanner, IsolationMode, PluginRegistry,
    ScanCommand, ScanErrorKind, ScanJob, ScannerOptions, ServerConnectivityInfo, TlsVersion,
};

fn server() -> Arc<ServerConnectivityInfo> {
    Arc::new(info(TlsVersion::Tls12, ClientAuthRequirement::None, None))
}

fn scanner(registry: PluginRegistry, options: ScannerOptions) -> ConcurrentScanner {
    let tls = ScriptedHandshaker::new(ServerModel::new(&[TlsVersion::Tls12]));
    ConcurrentScanner::new(Arc::new(registry), tls, options)
}

fn jobs(command: ScanCommand, count: usize) -> Vec<ScanJob> {
    let server = server();
    (0..count)
        .map(|_| ScanJob::new(server.clone(), command.clone()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_job_gets_exactly_one_outcome() {
    let registry = PluginRegistry::new().with_plugin(Arc::new(EchoPlugin(CommandId::FallbackScsv)));
    let scanner = scanner(registry, ScannerOptions::default().with_workers(4));

    let outcomes = scanner
        .submit(jobs(ScanCommand::FallbackScsv, 20))
        .unwrap()
        .collect_all()
        .await;

    assert_eq!(outcomes.len(), 20);
    let ids: HashSet<u64> = outcomes.iter().map(|(job, _)| job.id).collect();
    assert_eq!(ids.len(), 20);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
}

#[tokio::test]
async fn job_ids_keep_increasing_across_batches() {
    let registry = PluginRegistry::new().with_plugin(Arc::new(EchoPlugin(CommandId::FallbackScsv)));
    let scanner = scanner(registry, ScannerOptions::default().with_workers(2));

    let first = scanner
        .submit(jobs(ScanCommand::FallbackScsv, 3))
        .unwrap()
        .collect_all()
        .await;
    let second = scanner
        .submit(jobs(ScanCommand::FallbackScsv, 3))
        .unwrap()
        .collect_all()
        .await;

    let first_max = first.iter().map(|(job, _)| job.id).max().unwrap();
    assert!(second.iter().all(|(job, _)| job.id > first_max));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_plugin_does_not_take_down_its_siblings() {
    let registry = PluginRegistry::new()
        .with_plugin(Arc::new(EchoPlugin(CommandId::FallbackScsv)))
        .with_plugin(Arc::new(PanickingPlugin));
    let scanner = scanner(registry, ScannerOptions::default().with_workers(2));

    let mut batch = jobs(ScanCommand::FallbackScsv, 3);
    batch.extend(jobs(ScanCommand::ProtocolVersions, 2));
    batch.extend(jobs(ScanCommand::FallbackScsv, 3));

    let outcomes = scanner.submit(batch).unwrap().collect_all().await;
    assert_eq!(outcomes.len(), 8);

    for (job, outcome) in &outcomes {
        match job.command {
            ScanCommand::ProtocolVersions => {
                let error = outcome.as_ref().unwrap_err();
                assert_eq!(error.kind, ScanErrorKind::WorkerCrashed);
            }
            _ => assert!(outcome.is_ok()),
        }
    }

    // the pool keeps serving after a crash
    let again = scanner
        .submit(jobs(ScanCommand::FallbackScsv, 1))
        .unwrap()
        .collect_all()
        .await;
    assert!(again[0].1.is_ok());
}

#[tokio::test]
async fn slow_job_times_out() {
    let registry = PluginRegistry::new()
        .with_plugin(Arc::new(SlowPlugin(Duration::from_secs(30))))
        .with_plugin(Arc::new(EchoPlugin(CommandId::FallbackScsv)));
    let scanner = scanner(registry, ScannerOptions::default().with_workers(2));

    let slow = ScanJob::new(server(), ScanCommand::CertificateInfo)
        .with_timeout(Duration::from_millis(200));
    let fast = ScanJob::new(server(), ScanCommand::FallbackScsv);

    let outcomes = scanner.submit([slow, fast]).unwrap().collect_all().await;
    assert_eq!(outcomes.len(), 2);
    for (job, outcome) in &outcomes {
        match job.command {
            ScanCommand::CertificateInfo => {
                assert_eq!(outcome.as_ref().unwrap_err().kind, ScanErrorKind::Timeout)
            }
            _ => assert!(outcome.is_ok()),
        }
    }
}

#[tokio::test]
async fn default_timeout_applies_to_jobs_without_one() {
    let registry = PluginRegistry::new().with_plugin(Arc::new(SlowPlugin(Duration::from_secs(30))));
    let options = ScannerOptions::default()
        .with_workers(1)
        .with_default_timeout(Some(Duration::from_millis(200)));
    let scanner = scanner(registry, options);

    let outcomes = scanner
        .submit(jobs(ScanCommand::CertificateInfo, 1))
        .unwrap()
        .collect_all()
        .await;
    assert_eq!(outcomes[0].1.as_ref().unwrap_err().kind, ScanErrorKind::Timeout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_threads_keep_their_worker_busy() {
    let plugin = BlockingPlugin::new(Duration::from_millis(300));
    let registry = PluginRegistry::new().with_plugin(plugin.clone());
    let options = ScannerOptions::default()
        .with_workers(1)
        .with_default_timeout(Some(Duration::from_millis(100)));
    let scanner = scanner(registry, options);

    let started = Instant::now();
    let outcomes = scanner
        .submit(jobs(ScanCommand::CertificateInfo, 4))
        .unwrap()
        .collect_all()
        .await;

    assert_eq!(outcomes.len(), 4);
    for (_, outcome) in &outcomes {
        assert_eq!(outcome.as_ref().unwrap_err().kind, ScanErrorKind::Timeout);
    }
    // one worker never has more than one thread scanning
    assert_eq!(plugin.peak(), 1);
    // each later job waited for the previous thread to finish blocking
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn timed_out_async_job_frees_its_worker_at_once() {
    let registry = PluginRegistry::new()
        .with_plugin(Arc::new(SlowPlugin(Duration::from_secs(30))))
        .with_plugin(Arc::new(EchoPlugin(CommandId::FallbackScsv)));
    let scanner = scanner(registry, ScannerOptions::default().with_workers(1));

    let slow = ScanJob::new(server(), ScanCommand::CertificateInfo)
        .with_timeout(Duration::from_millis(100));
    let fast = ScanJob::new(server(), ScanCommand::FallbackScsv);

    let outcomes = tokio::time::timeout(
        Duration::from_secs(5),
        scanner.submit([slow, fast]).unwrap().collect_all(),
    )
    .await
    .expect("the slow job's thread was never cancelled");

    assert_eq!(outcomes.len(), 2);
    for (job, outcome) in &outcomes {
        match job.command {
            ScanCommand::CertificateInfo => {
                assert_eq!(outcome.as_ref().unwrap_err().kind, ScanErrorKind::Timeout)
            }
            _ => assert!(outcome.is_ok()),
        }
    }
}

#[tokio::test]
async fn drain_gives_up_on_a_blocked_thread() {
    let plugin = BlockingPlugin::new(Duration::from_secs(3));
    let registry = PluginRegistry::new().with_plugin(plugin.clone());
    let options = ScannerOptions::default()
        .with_workers(1)
        .with_default_timeout(Some(Duration::from_millis(50)));
    let scanner = scanner(registry, options);

    let outcomes = scanner.submit(jobs(ScanCommand::CertificateInfo, 2)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    scanner.drain(Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let outcomes = outcomes.collect_all().await;
    let kinds: Vec<ScanErrorKind> = outcomes
        .iter()
        .map(|(_, outcome)| outcome.as_ref().unwrap_err().kind)
        .collect();
    assert!(kinds.contains(&ScanErrorKind::Timeout));
    assert!(kinds.contains(&ScanErrorKind::Cancelled));
}

#[tokio::test]
async fn unknown_command_is_a_plugin_error() {
    let scanner = scanner(PluginRegistry::new(), ScannerOptions::default().with_workers(1));

    let outcomes = scanner
        .submit(jobs(ScanCommand::FallbackScsv, 1))
        .unwrap()
        .collect_all()
        .await;
    let error = outcomes[0].1.as_ref().unwrap_err();
    assert_eq!(error.kind, ScanErrorKind::Plugin);
    assert!(error.message.contains("no plugin"));
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let scanner = scanner(PluginRegistry::new(), ScannerOptions::default().with_workers(1));

    let outcomes = scanner.submit(Vec::new()).unwrap();
    assert_eq!(outcomes.remaining(), 0);
    assert!(outcomes.collect_all().await.is_empty());
}

#[tokio::test]
async fn drain_waits_for_jobs_within_the_grace_period() {
    let registry = PluginRegistry::new().with_plugin(Arc::new(SlowPlugin(Duration::from_millis(50))));
    let scanner = scanner(registry, ScannerOptions::default().with_workers(2));

    let outcomes = scanner.submit(jobs(ScanCommand::CertificateInfo, 4)).unwrap();
    scanner.drain(Duration::from_secs(10)).await;

    let outcomes = outcomes.collect_all().await;
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
}

#[tokio::test]
async fn drain_cancels_what_is_left_after_the_grace_period() {
    let registry = PluginRegistry::new().with_plugin(Arc::new(SlowPlugin(Duration::from_secs(30))));
    let scanner = scanner(registry, ScannerOptions::default().with_workers(1));

    let outcomes = scanner.submit(jobs(ScanCommand::CertificateInfo, 3)).unwrap();
    scanner.drain(Duration::from_millis(100)).await;
    assert!(scanner.is_draining());

    let outcomes = outcomes.collect_all().await;
    assert_eq!(outcomes.len(), 3);
    for (_, outcome) in &outcomes {
        assert_eq!(outcome.as_ref().unwrap_err().kind, ScanErrorKind::Cancelled);
    }
}

#[tokio::test]
async fn draining_scanner_refuses_new_jobs() {
    let scanner = scanner(PluginRegistry::new(), ScannerOptions::default().with_workers(1));
    scanner.drain(Duration::from_millis(100)).await;

    let refused = scanner.submit(jobs(ScanCommand::FallbackScsv, 1));
    assert!(matches!(refused, Err(SchedulerError::Draining)));
}

#[tokio::test]
async fn missing_worker_program_is_a_crash() {
    let registry = PluginRegistry::new().with_plugin(Arc::new(EchoPlugin(CommandId::FallbackScsv)));
    let options = ScannerOptions::default()
        .with_workers(1)
        .with_isolation(IsolationMode::Process {
            program: "/nonexistent/rust-tlsaudit".into(),
        });
    let scanner = scanner(registry, options);

    let outcomes = scanner
        .submit(jobs(ScanCommand::FallbackScsv, 1))
        .unwrap()
        .collect_all()
        .await;
    assert_eq!(outcomes[0].1.as_ref().unwrap_err().kind, ScanErrorKind::WorkerCrashed);
}
