use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tallykv_core::{Decision, Engine, StoreConfig};
use tokio::sync::Semaphore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SessionRecord {
    user_id: String,
    username: String,
    status: String,
    plan: String,
    last_seen: u64,
    last_login_ip: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedItem {
    name: String,
    price: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tallykv_workload=info,tallykv_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine = Engine::with_config(StoreConfig::from_env())?;

    tracing::info!("TallyKV workload");
    println!();

    session_records(&engine)?;
    page_cache(&engine)?;
    active_user_bitmap(&engine)?;
    unique_visitors(&engine)?;
    sequential_rate_limit(&engine)?;
    concurrent_rate_limit(&engine).await?;
    item_cache_with_multiple_ttls(&engine)?;
    expiry(&engine).await?;

    engine.shutdown();
    println!();
    tracing::info!("workload finished");

    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Whole-record session storage under one key
fn session_records(engine: &Engine) -> Result<()> {
    tracing::info!("1. Session record");

    let record = SessionRecord {
        user_id: "123".into(),
        username: "alice123".into(),
        status: "active".into(),
        plan: "premium".into(),
        last_seen: unix_millis(),
        last_login_ip: "192.168.0.1".into(),
    };
    engine
        .store()
        .put("user:session:123", serde_json::to_vec(&record)?, None)?;

    let raw = engine
        .store()
        .get("user:session:123")
        .context("session record missing")?;
    let loaded: SessionRecord = serde_json::from_slice(&raw)?;
    ensure!(loaded == record, "session record changed on the way through");

    tracing::info!("   ✓ session for {} ({})", loaded.username, loaded.plan);
    Ok(())
}

/// TTL-scoped page cache; a miss is handled here, not by the engine
fn page_cache(engine: &Engine) -> Result<()> {
    tracing::info!("2. Page cache");

    let key = "cache:homepage:/landing";
    let html = match engine.store().get(key) {
        Some(html) => html,
        None => {
            let rendered = Bytes::from_static(b"<html>Homepage HTML content...</html>");
            engine
                .store()
                .put(key, rendered.clone(), Some(Duration::from_secs(120)))?;
            rendered
        }
    };
    ensure!(engine.store().get(key) == Some(html), "cached page differs");

    let ttl = engine.store().ttl(key).flatten().context("page should expire")?;
    tracing::info!("   ✓ homepage cached, expires in {:?}", ttl);
    Ok(())
}

fn set_bit(bitmap: &mut Vec<u8>, offset: usize, on: bool) {
    let byte = offset / 8;
    if bitmap.len() <= byte {
        bitmap.resize(byte + 1, 0);
    }
    let mask = 0x80u8 >> (offset % 8);
    if on {
        bitmap[byte] |= mask;
    } else {
        bitmap[byte] &= !mask;
    }
}

fn get_bit(bitmap: &[u8], offset: usize) -> bool {
    bitmap
        .get(offset / 8)
        .is_some_and(|byte| byte & (0x80u8 >> (offset % 8)) != 0)
}

/// Daily-active flag per user id, addressed bit by bit on the caller side
fn active_user_bitmap(engine: &Engine) -> Result<()> {
    tracing::info!("3. Active user bitmap");

    let key = "users:active:2025-04-07";
    let mut bitmap = engine.store().get(key).map(|b| b.to_vec()).unwrap_or_default();
    set_bit(&mut bitmap, 123, true);
    engine.store().put(key, bitmap, Some(Duration::from_secs(2 * 24 * 3600)))?;

    let stored = engine.store().get(key).context("bitmap missing")?;
    ensure!(get_bit(&stored, 123), "user 123 should be active");
    ensure!(!get_bit(&stored, 124), "user 124 should not be active");
    ensure!(!get_bit(&stored, 10_000), "out of range bits read as zero");

    tracing::info!("   ✓ user 123 active today ({} byte bitmap)", stored.len());
    Ok(())
}

fn unique_visitors(engine: &Engine) -> Result<()> {
    tracing::info!("4. Unique visitors");

    let sketches = engine.sketches();
    sketches.add_all("visits:homepage", ["user:123", "user:456", "user:789"]);
    sketches.add_all("visits:homepage", ["user:123", "user:456", "user:789"]);
    let small = sketches.count("visits:homepage");
    ensure!(small == 3, "expected 3 unique visitors, got {}", small);

    let start = Instant::now();
    sketches.add_all("visits:catalog", (0..200_000).map(|i| format!("user:{}", i)));
    let estimate = sketches.count("visits:catalog");
    let error = (estimate as f64 - 200_000.0).abs() / 200_000.0;
    ensure!(error < 0.05, "estimate {} too far from 200000", estimate);

    tracing::info!(
        "   ✓ homepage: {}, catalog: {} (error {:.2}%, {:?})",
        small,
        estimate,
        error * 100.0,
        start.elapsed()
    );
    Ok(())
}

fn sequential_rate_limit(engine: &Engine) -> Result<()> {
    tracing::info!("5. Rate limit (5 per 60s)");

    let mut accepted = 0;
    for attempt in 1..=7 {
        let decision = engine
            .limiter()
            .try_acquire("user:rate_limit:123", 5, Duration::from_secs(60))?;
        tracing::info!("   attempt {}: {:?}", attempt, decision);
        if decision == Decision::Accepted {
            accepted += 1;
        }
    }
    ensure!(accepted == 5, "expected 5 accepted, got {}", accepted);

    tracing::info!("   ✓ 5 accepted, 2 rejected");
    Ok(())
}

/// Many tasks racing for one counter must never exceed the limit
async fn concurrent_rate_limit(engine: &Engine) -> Result<()> {
    let calls = 500;
    let limit = 100;
    tracing::info!("6. Concurrent rate limit ({} calls, limit {})", calls, limit);

    let semaphore = Arc::new(Semaphore::new(64));
    let accepted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let futures: Vec<_> = (0..calls)
        .map(|_| {
            let engine = engine.clone();
            let semaphore = Arc::clone(&semaphore);
            let accepted = Arc::clone(&accepted);
            async move {
                let _permit = semaphore.acquire().await?;
                let decision = tokio::task::spawn_blocking(move || {
                    engine
                        .limiter()
                        .try_acquire("api:/login", limit, Duration::from_secs(60))
                })
                .await??;
                if decision.is_accepted() {
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<_, anyhow::Error>(())
            }
        })
        .collect();

    join_all(futures)
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    let accepted = accepted.load(Ordering::SeqCst);
    ensure!(accepted as u64 == limit, "expected {} accepted, got {}", limit, accepted);

    tracing::info!("   ✓ {} accepted in {:?}", accepted, start.elapsed());
    Ok(())
}

fn item_cache_with_multiple_ttls(engine: &Engine) -> Result<()> {
    tracing::info!("7. Item cache with per-item TTLs");

    let items = [
        ("cache:item:123", CachedItem { name: "Product 123".into(), price: 50 }, 300),
        ("cache:item:124", CachedItem { name: "Product 124".into(), price: 60 }, 900),
    ];
    for (key, item, ttl) in &items {
        engine
            .store()
            .put(*key, serde_json::to_vec(item)?, Some(Duration::from_secs(*ttl)))?;
    }
    for (key, _, _) in &items {
        let raw = engine.store().get(key).with_context(|| format!("{} missing", key))?;
        let item: CachedItem = serde_json::from_slice(&raw)?;
        tracing::info!("   {} -> {} (${})", key, item.name, item.price);
    }

    let mut cached: Vec<String> = engine
        .store()
        .keys()
        .into_iter()
        .filter(|key| key.starts_with("cache:item:"))
        .collect();
    cached.sort();
    ensure!(cached.len() == 2, "expected 2 cached items, found {:?}", cached);
    tracing::info!("   ✓ {} items cached", cached.len());
    Ok(())
}

async fn expiry(engine: &Engine) -> Result<()> {
    tracing::info!("8. Expiry");

    engine.store().put("k", "v1", Some(Duration::from_secs(1)))?;
    ensure!(
        engine.store().get("k").as_deref() == Some(&b"v1"[..]),
        "value should be live"
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    ensure!(engine.store().get("k").is_none(), "value should have expired");

    tracing::info!("   ✓ value gone after its TTL");
    Ok(())
}
