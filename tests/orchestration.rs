use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use viralcast::checks::env_vars::{
    EnvSnapshot, AIRTABLE_API_KEY, AIRTABLE_BASE_ID, APIFY_API_TOKEN, N8N_API_KEY, OPENAI_API_KEY,
};
use viralcast::checks::health::{HealthChecker, HealthStatus};
use viralcast::checks::validator::SetupValidator;
use viralcast::checks::CheckError;
use viralcast::config::{AppConfig, ServicesConfig};
use viralcast::runtime::{ProcessEventKind, ProcessSupervisor, SpawnOptions};
use viralcast::terminal::port::{PortAllocator, PortSearch};

fn credentials() -> EnvSnapshot {
    EnvSnapshot::from_pairs([
        (OPENAI_API_KEY, "sk-integration-0000"),
        (AIRTABLE_API_KEY, "patIntegration0000"),
        (AIRTABLE_BASE_ID, "appIntegration0000"),
        (APIFY_API_TOKEN, "apify_api_integration"),
        (N8N_API_KEY, "n8n-integration"),
    ])
}

fn project(root: &Path, platforms: &str) -> AppConfig {
    std::fs::create_dir_all(root.join("config")).unwrap();
    std::fs::create_dir_all(root.join("workflows")).unwrap();
    std::fs::write(root.join("config/platforms.json"), platforms).unwrap();
    std::fs::write(root.join("config/airtable-schema.json"), r#"{"tables": {}}"#).unwrap();
    std::fs::write(
        root.join("workflows/discovery.json"),
        r#"{"name": "discovery", "nodes": [], "connections": {}}"#,
    )
    .unwrap();

    let unreachable = "http://127.0.0.1:1".to_string();
    AppConfig {
        project_dir: root.to_path_buf(),
        services: ServicesConfig {
            openai_base_url: unreachable.clone(),
            airtable_base_url: unreachable.clone(),
            apify_base_url: unreachable.clone(),
            n8n_base_url: unreachable,
            timeout_secs: 2,
        },
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn three_held_ports_lead_to_the_fourth() {
    let held: Vec<TcpListener> = (47510..=47512)
        .map(|p| TcpListener::bind(("127.0.0.1", p)).unwrap())
        .collect();
    let allocator = PortAllocator::new();

    let allocation = allocator
        .find_available_port(47510, &PortSearch::new().range(47510, 47515))
        .await
        .unwrap();
    assert_eq!(allocation.port, 47513);
    assert!(!allocation.is_preferred);

    // A reservation hides the port from the next caller until released.
    assert!(allocator.reserve(47513, "first"));
    let next = allocator
        .claim(47510, &PortSearch::new().range(47510, 47515), "second")
        .await
        .unwrap();
    assert_eq!(next.port, 47514);
    drop(held);
}

#[tokio::test]
async fn failing_command_gets_two_retries_then_leaves_the_registry() {
    let supervisor = ProcessSupervisor::new();
    let mut events = supervisor.subscribe();
    let options = SpawnOptions {
        max_restarts: 2,
        restart_delay: Duration::ZERO,
        ..SpawnOptions::default()
    };
    supervisor.spawn_process("x", "false", &[], options).await.unwrap();

    let mut spawns = 0;
    let wait = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.name != "x" {
                continue;
            }
            match event.kind {
                ProcessEventKind::Spawned { .. } => spawns += 1,
                ProcessEventKind::Terminated { .. } => break,
                _ => {}
            }
        }
    });
    wait.await.unwrap();

    assert_eq!(spawns, 3);
    assert!(!supervisor.contains("x"));
}

#[tokio::test]
async fn shutdown_empties_the_registry() {
    let supervisor = ProcessSupervisor::new();
    for name in ["a", "b", "c"] {
        supervisor
            .spawn_process(
                name,
                "sh",
                &["-c".to_string(), "exec sleep 60".to_string()],
                SpawnOptions::default(),
            )
            .await
            .unwrap();
    }
    assert_eq!(supervisor.list().len(), 3);

    tokio::time::timeout(Duration::from_secs(15), supervisor.shutdown())
        .await
        .unwrap();
    assert!(supervisor.list().is_empty());
    assert!(supervisor.is_shutting_down());
}

#[tokio::test]
async fn empty_platforms_file_is_an_invalid_structure() {
    let dir = tempfile::tempdir().unwrap();
    let config = project(dir.path(), "{}");
    let validator = SetupValidator::with_probes(config, credentials(), Vec::new());

    let report = validator.run().await;
    assert!(!report.is_success());
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].error,
        Some(CheckError::InvalidConfigStructure { .. })
    ));
}

#[tokio::test]
async fn every_service_down_is_unhealthy_with_one_error_each() {
    let dir = tempfile::tempdir().unwrap();
    let config = project(dir.path(), r#"{"platforms": ["tiktok"]}"#);
    let checker = HealthChecker::new(config, credentials()).unwrap();

    let (report, path) = checker.check_and_persist().await.unwrap();
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert_eq!(report.errors.len(), 4);
    for issue in &report.errors {
        assert!(issue.message.contains(&issue.source), "{:?}", issue);
    }
    assert!(path.starts_with(dir.path().join("reports")));
    assert!(path.exists());
}
