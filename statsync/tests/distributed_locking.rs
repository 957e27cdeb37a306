//! Job locks shared through one SQLite file.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use statsync::database::repositories::SqlxLocker;
use statsync::database::{DbPool, init_pool_with_size, run_migrations};
use statsync::lock::Locker;
use statsync::metrics::MetricsCollector;
use statsync::scheduler::{JobDefinition, Scheduler, SchedulerConfig, handler_fn};

async fn setup_db(dir: &TempDir) -> DbPool {
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("locks.db").to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool_with_size(&url, 16).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_exactly_one_owner_wins_each_round() {
    let dir = TempDir::new().unwrap();
    let pool = setup_db(&dir).await;

    for round in 0..5 {
        let mut set = JoinSet::new();
        for owner in 0..16 {
            // One locker per owner, as separate instances would have.
            let locker = SqlxLocker::new(pool.clone());
            set.spawn(async move {
                let owner_id = format!("instance-{owner}");
                let won = locker
                    .try_acquire("crawl-fbref", Duration::from_secs(60), &owner_id)
                    .await
                    .unwrap();
                (owner_id, won)
            });
        }

        let mut winners = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (owner_id, won) = joined.unwrap();
            if won {
                winners.push(owner_id);
            }
        }
        assert_eq!(winners.len(), 1, "round {round}: {winners:?}");

        SqlxLocker::new(pool.clone())
            .release("crawl-fbref", &winners[0])
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_schedulers_never_overlap() {
    let dir = TempDir::new().unwrap();
    let pool = setup_db(&dir).await;
    let root = CancellationToken::new();
    let metrics = Arc::new(MetricsCollector::new());

    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let mut schedulers = Vec::new();
    for instance in ["a", "b"] {
        let job = JobDefinition::new("crawl", "* * * * * *").with_timeout_secs(5);
        let mut scheduler = Scheduler::new(
            SchedulerConfig::new(instance),
            vec![job],
            Arc::new(SqlxLocker::new(pool.clone())),
            metrics.clone(),
            &root,
        )
        .unwrap();

        let running = running.clone();
        let max_running = max_running.clone();
        let runs = runs.clone();
        scheduler.register_handler(
            "crawl",
            handler_fn(move |_ctx| {
                let running = running.clone();
                let max_running = max_running.clone();
                let runs = runs.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let scheduler = Arc::new(scheduler);
        scheduler.start().unwrap();
        schedulers.push(scheduler);
    }

    tokio::time::sleep(Duration::from_millis(4500)).await;
    root.cancel();
    for scheduler in &schedulers {
        scheduler.stop().await.unwrap();
    }

    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    assert!(runs.load(Ordering::SeqCst) >= 1);
    // Both instances fire every second, so most firings find the lock taken.
    assert!(metrics.job("crawl").contention >= 2);

    let (held,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_lock")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(held, 0, "stop releases every lock");
}
