// Database discovery against the in-memory store.

mod common;

use std::{sync::Arc, time::Duration};

use common::{FakeConnector, Reply, SchemaCheck};
use pgsched_scheduler::{launch, DatabaseSeeker, DispatcherSettings, Registration};
use tokio::{sync::watch, time::Instant};

fn store_with(databases: &[&str]) -> FakeConnector {
    let store = FakeConnector::new();
    store.with(|s| s.databases = databases.iter().map(|d| d.to_string()).collect());
    store
}

fn seeker(store: &FakeConnector, exclude: &[&str]) -> DatabaseSeeker<FakeConnector> {
    DatabaseSeeker::new(
        Arc::new(store.clone()),
        "postgres",
        exclude.iter().map(|d| d.to_string()).collect(),
        Duration::from_secs(30),
        DispatcherSettings::default(),
    )
}

fn names<C: pgsched_scheduler::Connector>(dispatchers: &[pgsched_scheduler::Dispatcher<C>]) -> Vec<String> {
    let mut names: Vec<String> = dispatchers.iter().map(|d| d.database().to_string()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn only_databases_with_schema_get_dispatchers() {
    let store = store_with(&["postgres", "alpha", "beta", "gamma"]);
    store.with(|s| s.schemas.insert("beta".into(), SchemaCheck::Missing));
    let mut seeker = seeker(&store, &[]);

    let dispatchers = seeker.discover().await.unwrap();

    assert_eq!(names(&dispatchers), vec!["alpha", "gamma"]);
    assert_eq!(seeker.registrations()["alpha"], Registration::Active);
    assert!(matches!(seeker.registrations()["beta"], Registration::Failed(_)));
    // bootstrap and beta released, alpha and gamma held as polling handles
    assert_eq!(store.with(|s| s.open_connections), 2);

    drop(dispatchers);
    assert_eq!(store.with(|s| s.open_connections), 0);
}

#[tokio::test]
async fn bootstrap_and_configured_names_are_excluded() {
    let store = store_with(&["postgres", "admin", "alpha"]);
    let mut seeker = seeker(&store, &["admin"]);

    let dispatchers = seeker.discover().await.unwrap();

    assert_eq!(names(&dispatchers), vec!["alpha"]);
    let exclude = store.with(|s| s.last_exclude.clone());
    assert!(exclude.contains(&"postgres".to_string()));
    assert!(exclude.contains(&"admin".to_string()));
}

#[tokio::test(start_paused = true)]
async fn hung_check_is_abandoned_at_timeout() {
    let store = store_with(&["alpha", "beta", "gamma"]);
    store.with(|s| s.schemas.insert("gamma".into(), SchemaCheck::Hang));
    let mut seeker = seeker(&store, &[]);
    let started = Instant::now();

    let dispatchers = seeker.discover().await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    assert_eq!(names(&dispatchers), vec!["alpha", "beta"]);
    assert!(matches!(seeker.registrations()["gamma"], Registration::Failed(_)));
    // gamma's handle went away with its aborted check
    assert_eq!(store.with(|s| s.open_connections), 2);
}

#[tokio::test]
async fn unreachable_bootstrap_is_an_error() {
    let store = store_with(&["alpha"]);
    store.with(|s| s.connect_failures = 1);
    let mut seeker = seeker(&store, &[]);

    assert!(seeker.discover().await.is_err());
    assert!(seeker.registrations().is_empty());
}

#[tokio::test]
async fn single_tenant_promotion_requires_schema() {
    let store = store_with(&[]);
    store.with(|s| s.schemas.insert("beta".into(), SchemaCheck::Missing));
    let mut seeker = seeker(&store, &[]);

    let dispatcher = seeker.promote("alpha").await.unwrap();
    assert_eq!(dispatcher.database(), "alpha");
    assert!(seeker.promote("beta").await.is_err());
    assert_eq!(store.with(|s| s.open_connections), 1);
}

#[tokio::test(start_paused = true)]
async fn discovered_dispatchers_run_independently() {
    let store = store_with(&["alpha", "gamma"]);
    store.script(Vec::new(), Reply::Wait(None));
    let mut seeker = seeker(&store, &[]);
    let dispatchers = seeker.discover().await.unwrap();

    let (tx, rx) = watch::channel(false);
    let mut running = launch(dispatchers, &rx);
    tokio::time::sleep(Duration::from_secs(1)).await;
    tx.send(true).unwrap();

    let mut stopped = Vec::new();
    while let Some(joined) = running.join_next().await {
        let (name, stats) = joined.unwrap();
        assert_eq!(stats.polls, 1);
        stopped.push(name);
    }
    stopped.sort();
    assert_eq!(stopped, vec!["alpha", "gamma"]);
    assert_eq!(store.with(|s| s.open_connections), 0);
}
