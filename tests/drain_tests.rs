
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use test_harness::{shell_job, test_config, MockOs, TestScheduler, MB, USER};
use wava::client::Client;
use wava::config::WavaHome;
use wava::daemon::Daemon;
use wava::os::Signal;
use wava::protocol::RetCode;

const WAIT: Duration = Duration::from_secs(10);

/// Test that cancelling the daemon's shutdown token drains every job.
#[tokio::test]
async fn test_shutdown_token_drains_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let home = WavaHome::new(dir.path());
    let daemon = Daemon::new(home.clone(), test_config(300 * MB)).with_os(MockOs::new(1200 * MB));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(daemon.run(shutdown.clone()));

    let client = Client::new(home).with_attach_timeout(WAIT);
    assert!(
        test_harness::wait_for(
            || async { client.is_daemon_running() },
            WAIT,
            Duration::from_millis(20)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let running = client.submit(shell_job("sleep 30", 200 * MB)).await.unwrap();
    let running = tokio::spawn(running.collect());
    let queued = client.submit(shell_job("sleep 30", 200 * MB)).await.unwrap();
    let queued = tokio::spawn(queued.collect());

    let listed = test_harness::wait_for(
        || {
            let client = client.clone();
            async move {
                match client.jobs(true).await {
                    Ok(session) => session.collect().await.is_ok_and(|o| {
                        let text = o.stdout_text();
                        text.contains("running") && text.contains("queued")
                    }),
                    Err(_) => false,
                }
            }
        },
        WAIT,
        Duration::from_millis(100),
    )
    .await;
    assert!(listed, "one job should run and one should wait");

    shutdown.cancel();
    let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(result.is_ok());

    let running = running.await.unwrap().unwrap();
    assert!(running.event("shutdown").is_some());
    assert_eq!(running.retcode, Some(RetCode::Cancelled.code()));

    let queued = queued.await.unwrap().unwrap();
    assert!(queued.event("shutdown").is_some());
    assert!(queued.event("running").is_none());
    assert_eq!(queued.retcode, Some(RetCode::Cancelled.code()));

    assert!(!client.is_daemon_running());
}

/// A job that ignores SIGTERM is swept with SIGKILL after the grace period.
#[tokio::test]
async fn test_drain_escalates_to_sigkill() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let peer = ts.submit(1, shell_job("trap '' TERM; sleep 30", 100 * MB), USER).await;
    let pid = ts.wait_pid(1, WAIT).await.unwrap();
    // Give the shell time to install the trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    ts.scheduler.close().await;
    assert!(ts.scheduler.wait_idle(WAIT).await, "job should be gone after SIGKILL");
    assert!(started.elapsed() >= Duration::from_millis(400));

    let kills = ts.os.kills();
    assert!(kills.contains(&(pid, Signal::SIGTERM)));
    assert!(kills.contains(&(pid, Signal::SIGKILL)));
    assert_eq!(peer.retcode(WAIT).await, Some(RetCode::Cancelled.code() as i64));
    assert!(peer.has("shutdown"));

    ts.shutdown().await;
}

/// Closing twice is harmless and the scheduler stays closed.
#[tokio::test]
async fn test_close_is_idempotent() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    ts.scheduler.close().await;
    ts.scheduler.close().await;
    assert!(ts.scheduler.is_closed().await);
    assert!(ts.scheduler.wait_idle(Duration::from_millis(100)).await);
    assert!(ts.scheduler.jobs().await.is_empty());

    ts.shutdown().await;
}

/// Group changes are refused once the scheduler is closed.
#[tokio::test]
async fn test_closed_scheduler_refuses_group_updates() {
    let ts = TestScheduler::new(test_config(1000 * MB));
    ts.scheduler.close().await;

    let result = ts
        .scheduler
        .update_group(
            &wava::protocol::GroupRequest {
                name: Some("late".to_string()),
                ..Default::default()
            },
            USER,
        )
        .await;
    assert!(matches!(result, Err(wava::error::WavaError::Closed)));

    ts.shutdown().await;
}
