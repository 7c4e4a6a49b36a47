//! Load and distribution tests for the forward proxy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::collections::HashMap;
use std::time::Instant;

mod common;

#[tokio::test]
async fn test_round_robin_distribution() {
    let mut backends = Vec::new();
    for id in ["b1", "b2", "b3"] {
        let addr = common::start_mock_backend(id).await;
        backends.push(common::backend(id, addr));
    }
    let proxy = common::spawn_proxy(common::quiet_config(backends)).await;
    let client = common::client();

    let mut counts: HashMap<String, u32> = HashMap::new();
    for i in 0..30 {
        let resp = client.get(proxy.url(&format!("/item/{}", i))).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        *counts.entry(resp.text().await.unwrap()).or_default() += 1;
    }

    assert_eq!(counts.len(), 3);
    for id in ["b1", "b2", "b3"] {
        assert_eq!(counts[id], 10, "uneven distribution: {:?}", counts);
    }

    proxy.stop().await;
}

#[tokio::test]
async fn test_cached_get_skips_backend() {
    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    let addr = common::start_programmable_backend(move |path| {
        h.fetch_add(1, Ordering::SeqCst);
        async move { (200, format!("payload for {}", path)) }
    })
    .await;

    let mut config = common::quiet_config(vec![common::backend("b1", addr)]);
    config.cache.enabled = true;
    config.cache.ttl_secs = 60;
    let proxy = common::spawn_proxy(config).await;
    let client = common::client();

    for _ in 0..3 {
        let resp = client.get(proxy.url("/catalog?page=1")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "payload for /catalog?page=1");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Non-GET requests always go upstream.
    let resp = client.post(proxy.url("/catalog?page=1")).body("x").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let snapshot = proxy.manager.metrics_snapshot();
    assert_eq!(snapshot.global.cache_hits, 2);

    proxy.stop().await;
}

#[tokio::test]
async fn test_concurrent_load() {
    let mut backends = Vec::new();
    for id in ["b1", "b2", "b3"] {
        let addr = common::start_mock_backend(id).await;
        backends.push(common::backend(id, addr));
    }
    let mut config = common::quiet_config(backends);
    config.pool.max_connections_per_backend = 4;
    config.pool.connect_timeout_ms = 5_000;
    let proxy = common::spawn_proxy(config).await;
    let client = common::client();

    let num_tasks = 20;
    let requests_per_task = 25;
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..num_tasks {
        let client = client.clone();
        let url = proxy.url("/load");
        handles.push(tokio::spawn(async move {
            let mut ok = 0;
            for _ in 0..requests_per_task {
                if let Ok(resp) = client.get(&url).send().await {
                    if resp.status().is_success() {
                        ok += 1;
                    }
                }
            }
            ok
        }));
    }

    let mut total_ok = 0;
    for handle in handles {
        total_ok += handle.await.unwrap();
    }
    let elapsed = start.elapsed();
    println!(
        "{} requests in {:?} ({:.0} req/s)",
        num_tasks * requests_per_task,
        elapsed,
        (num_tasks * requests_per_task) as f64 / elapsed.as_secs_f64()
    );

    assert_eq!(total_ok, num_tasks * requests_per_task);

    let snapshot = proxy.manager.metrics_snapshot();
    assert_eq!(snapshot.global.requests, (num_tasks * requests_per_task) as u64);
    for id in ["b1", "b2", "b3"] {
        let stats = proxy.manager.pool().stats(id).unwrap();
        assert_eq!(stats.in_use, 0);
        assert!(stats.idle <= 4);
    }

    proxy.stop().await;
}
