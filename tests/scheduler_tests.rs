
use std::time::Duration;

use test_harness::{shell_job, test_config, TestScheduler, MB, OTHER_USER, ROOT, USER};
use wava::config::PromisePolicy;
use wava::error::WavaError;
use wava::os::Signal;
use wava::protocol::{GroupRequest, RetCode};
use wava::scheduler::JobState;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_job_that_fits_runs_and_next_waits() {
    let ts = TestScheduler::new(test_config(2000 * MB));

    let a = ts.submit(1, shell_job("sleep 1", 1000 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());

    let b = ts.submit(2, shell_job("echo done", 1500 * MB), USER).await;
    let queued = b.wait_event("queued", WAIT).await.expect("B should be queued");
    assert_eq!(queued.as_u64(), Some(1));
    assert!(!b.has("running"));

    assert_eq!(a.retcode(WAIT).await, Some(0));
    assert!(b.wait_event("running", WAIT).await.is_some());
    assert_eq!(b.retcode(WAIT).await, Some(0));
    assert_eq!(b.stdout(), "done\n");

    let names = b.names();
    assert_eq!(names.first().map(String::as_str), Some("id"));
    let maxrss = names.iter().position(|n| n == "maxrss").unwrap();
    let retcode = names.iter().position(|n| n == "retcode").unwrap();
    assert!(maxrss < retcode);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let peer = ts.submit(1, shell_job("echo oops >&2; exit 3", 100 * MB), USER).await;
    assert_eq!(peer.retcode(WAIT).await, Some(3));
    assert_eq!(peer.stderr(), "oops\n");

    ts.shutdown().await;
}

#[tokio::test]
async fn test_launch_failure_reports_error() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let mut request = shell_job("true", 100 * MB);
    request.command = vec!["/definitely/not/a/binary".to_string()];
    let peer = ts.submit(1, request, USER).await;

    assert_eq!(peer.retcode(WAIT).await, Some(RetCode::Error.code() as i64));
    assert!(peer.has("error"));
    assert!(peer.stderr().contains("/definitely/not/a/binary"));
    assert_eq!(ts.scheduler.job_state(1).await, JobState::Absent);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let a = ts.submit(1, shell_job("sleep 30", 1000 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());
    let b = ts.submit(2, shell_job("sleep 30", 500 * MB), USER).await;
    assert!(b.wait_event("queued", WAIT).await.is_some());

    ts.scheduler.cancel(2, USER).await.unwrap();
    assert_eq!(b.retcode(WAIT).await, Some(RetCode::Cancelled.code() as i64));
    assert!(b.has("cancelled"));
    assert_eq!(ts.scheduler.job_state(2).await, JobState::Absent);

    ts.scheduler.cancel(1, USER).await.unwrap();
    assert_eq!(a.retcode(WAIT).await, Some(RetCode::Cancelled.code() as i64));
    assert!(a.has("cancelled"));
    assert!(ts.os.kills().iter().any(|(_, s)| *s == Signal::SIGTERM));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_cancel_requires_owner_or_root() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let a = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());

    let denied = ts.scheduler.cancel(1, OTHER_USER).await;
    assert!(matches!(denied, Err(WavaError::PermissionDenied(_))));
    assert_eq!(
        denied.unwrap_err().ret_code(),
        RetCode::NotRootUser
    );

    ts.scheduler.cancel(1, ROOT).await.unwrap();
    assert_eq!(a.retcode(WAIT).await, Some(RetCode::Cancelled.code() as i64));

    assert!(matches!(
        ts.scheduler.cancel(99, ROOT).await,
        Err(WavaError::JobNotFound(99))
    ));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejections() {
    let config = test_config(1000 * MB).with_max_job_rss(600 * MB);
    let ts = TestScheduler::new(config);

    let peer = test_harness::TestPeer::new(1);
    let result = ts
        .scheduler
        .submit(1, shell_job("true", 2000 * MB), USER, peer.channel.clone())
        .await;
    assert!(matches!(result, Err(WavaError::Rejected(_))));
    assert!(peer.wait_event("exceed_global", WAIT).await.is_some());

    let peer = test_harness::TestPeer::new(2);
    let result = ts
        .scheduler
        .submit(2, shell_job("true", 700 * MB), USER, peer.channel.clone())
        .await;
    assert!(matches!(result, Err(WavaError::Rejected(_))));
    assert!(peer.wait_event("exceed_disallowed", WAIT).await.is_some());

    let parent = ts.submit(3, shell_job("sleep 30", 600 * MB), USER).await;
    assert!(parent.wait_event("running", WAIT).await.is_some());
    let peer = test_harness::TestPeer::new(4);
    let result = ts
        .scheduler
        .submit(4, shell_job("true", 500 * MB).with_parent(3), USER, peer.channel.clone())
        .await;
    assert!(matches!(result, Err(WavaError::Rejected(_))));
    let tree = peer.wait_event("exceed_tree", WAIT).await.unwrap();
    assert_eq!(tree.as_u64(), Some(1100 * MB));

    assert_eq!(ts.scheduler.job_state(1).await, JobState::Absent);
    assert_eq!(ts.scheduler.job_state(2).await, JobState::Absent);
    assert_eq!(ts.scheduler.job_state(4).await, JobState::Absent);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_id_is_refused() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let _a = ts.submit(7, shell_job("sleep 30", 100 * MB), USER).await;
    let peer = test_harness::TestPeer::new(7);
    let result = ts
        .scheduler
        .submit(7, shell_job("true", 100 * MB), USER, peer.channel.clone())
        .await;
    assert!(matches!(result, Err(WavaError::DuplicateId(7))));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_strict_promise_violation_kills_job() {
    let ts = TestScheduler::new(test_config(1000 * MB));
    ts.os.set_default_rss(600 * MB);

    let peer = ts.submit(1, shell_job("sleep 30", 500 * MB), USER).await;
    let exceeded = peer
        .wait_event("exceed_disallowed", WAIT)
        .await
        .expect("overrun should be reported");
    assert_eq!(exceeded.as_u64(), Some(600 * MB));

    let code = peer.retcode(WAIT).await.expect("job should be killed");
    assert_eq!(code, 128 + Signal::SIGTERM as i64);
    assert_eq!(peer.last("maxrss").and_then(|e| e.as_u64()), Some(600 * MB));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_lax_promise_overrun_is_tolerated() {
    let config = test_config(2000 * MB).with_promise_policy(PromisePolicy::Lax);
    let ts = TestScheduler::new(config);
    ts.os.set_default_rss(700 * MB);

    let peer = ts.submit(1, shell_job("sleep 30", 500 * MB), USER).await;
    assert!(peer.wait_event("exceed_allowed", WAIT).await.is_some());

    let scheduler = ts.scheduler.clone();
    test_harness::assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .process(1)
                    .await
                    .is_some_and(|p| p.promised_rss == 700 * MB)
            }
        },
        WAIT,
        "promise should be raised to the observed RSS",
    )
    .await;

    ts.os.set_default_rss(750 * MB);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(peer.count("exceed_allowed"), 1);
    assert_eq!(ts.scheduler.job_state(1).await, JobState::Running);
    assert_eq!(ts.scheduler.promised_total().await, 750 * MB);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_head_of_line_blocks_smaller_jobs() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let a = ts.submit(1, shell_job("sleep 30", 600 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());
    let b = ts.submit(2, shell_job("sleep 30", 600 * MB), USER).await;
    let c = ts.submit(3, shell_job("true", 100 * MB), USER).await;

    assert_eq!(b.wait_event("queued", WAIT).await.and_then(|e| e.as_u64()), Some(1));
    assert_eq!(c.wait_event("queued", WAIT).await.and_then(|e| e.as_u64()), Some(2));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ts.scheduler.job_state(3).await, JobState::Queued);
    assert!(!c.has("running"));

    ts.scheduler.cancel(2, USER).await.unwrap();
    assert!(c.wait_event("running", WAIT).await.is_some());
    assert_eq!(c.retcode(WAIT).await, Some(0));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_queue_positions_follow_arrival_order() {
    let ts = TestScheduler::new(test_config(100 * MB));

    let a = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());

    let b = ts.submit(2, shell_job("true", 100 * MB), USER).await;
    let c = ts.submit(3, shell_job("true", 100 * MB), USER).await;
    let d = ts.submit(4, shell_job("true", 100 * MB), USER).await;
    assert_eq!(b.wait_event("queued", WAIT).await.and_then(|e| e.as_u64()), Some(1));
    assert_eq!(c.wait_event("queued", WAIT).await.and_then(|e| e.as_u64()), Some(2));
    assert_eq!(d.wait_event("queued", WAIT).await.and_then(|e| e.as_u64()), Some(3));
    assert_eq!(ts.scheduler.queued_ids().await, vec![2, 3, 4]);

    // Positions are only re-sent when they change.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(d.count("queued"), 1);

    ts.scheduler.cancel(2, USER).await.unwrap();
    assert!(c.wait_value("queued", 1, WAIT).await);
    assert!(d.wait_value("queued", 2, WAIT).await, "D should move up to position 2");

    ts.shutdown().await;
}

#[tokio::test]
async fn test_group_priority_orders_queue() {
    let ts = TestScheduler::new(test_config(100 * MB));

    ts.scheduler
        .update_group(
            &GroupRequest {
                name: Some("batch".to_string()),
                priority: Some(10),
                ..GroupRequest::default()
            },
            USER,
        )
        .await
        .unwrap();

    let a = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());

    let low = ts
        .submit(2, shell_job("true", 100 * MB).with_group("batch"), USER)
        .await;
    let normal = ts.submit(3, shell_job("true", 100 * MB), USER).await;

    assert_eq!(normal.wait_event("queued", WAIT).await.and_then(|e| e.as_u64()), Some(1));
    assert_eq!(ts.scheduler.queued_ids().await, vec![3, 2]);
    assert!(
        low.wait_value("queued", 2, WAIT).await,
        "batch job should queue behind the default group"
    );

    // Raising the group's priority re-keys its members.
    ts.scheduler
        .update_group(
            &GroupRequest {
                name: Some("batch".to_string()),
                priority: Some(-5),
                ..GroupRequest::default()
            },
            ROOT,
        )
        .await
        .unwrap();
    assert!(low.wait_value("priority", -5, WAIT).await);
    assert_eq!(ts.scheduler.queued_ids().await, vec![2, 3]);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_group_permissions() {
    let ts = TestScheduler::new(test_config(100 * MB));

    let negative = GroupRequest {
        name: Some("vip".to_string()),
        priority: Some(-1),
        ..GroupRequest::default()
    };
    assert!(matches!(
        ts.scheduler.update_group(&negative, USER).await,
        Err(WavaError::PermissionDenied(_))
    ));

    let owned = GroupRequest {
        name: Some("mine".to_string()),
        priority: Some(3),
        ..GroupRequest::default()
    };
    let group = ts.scheduler.update_group(&owned, USER).await.unwrap();
    assert_eq!(group.owner, USER);
    assert!(matches!(
        ts.scheduler.update_group(&owned, OTHER_USER).await,
        Err(WavaError::PermissionDenied(_))
    ));
    assert!(matches!(
        ts.scheduler.delete_group("mine", OTHER_USER).await,
        Err(WavaError::PermissionDenied(_))
    ));
    ts.scheduler.delete_group("mine", USER).await.unwrap();

    assert!(ts.scheduler.delete_group("default", ROOT).await.is_err());
    assert!(matches!(
        ts.scheduler.delete_group("missing", ROOT).await,
        Err(WavaError::GroupNotFound(_))
    ));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_group_delete_refused_while_jobs_remain() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    ts.scheduler
        .update_group(
            &GroupRequest {
                name: Some("etl".to_string()),
                ..GroupRequest::default()
            },
            USER,
        )
        .await
        .unwrap();
    let peer = ts
        .submit(1, shell_job("sleep 30", 100 * MB).with_group("etl"), USER)
        .await;
    assert!(peer.wait_event("running", WAIT).await.is_some());

    assert!(matches!(
        ts.scheduler.delete_group("etl", USER).await,
        Err(WavaError::GroupNotEmpty { jobs: 1, .. })
    ));

    ts.scheduler.cancel(1, USER).await.unwrap();
    assert!(peer.retcode(WAIT).await.is_some());
    ts.scheduler.delete_group("etl", USER).await.unwrap();
    assert!(ts.scheduler.group("etl").await.is_none());

    ts.shutdown().await;
}

#[tokio::test]
async fn test_dynamic_group_is_reaped_when_idle() {
    let config = test_config(1000 * MB).with_dynamic_group_idle_secs(0);
    let ts = TestScheduler::new(config);

    let peer = ts
        .submit(1, shell_job("sleep 0.3", 100 * MB).with_group("adhoc"), USER)
        .await;
    let group = ts.scheduler.group("adhoc").await.expect("group created on submit");
    assert!(group.dynamic);
    assert_eq!(group.owner, USER);

    assert_eq!(peer.retcode(WAIT).await, Some(0));
    let scheduler = ts.scheduler.clone();
    test_harness::assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move { scheduler.group("adhoc").await.is_none() }
        },
        WAIT,
        "empty dynamic group should be removed",
    )
    .await;
    assert!(ts.scheduler.group("default").await.is_some());

    ts.shutdown().await;
}

#[tokio::test]
async fn test_niceness_is_spread_over_running_jobs() {
    let config = test_config(1000 * MB).with_niceness_range(0, 1);
    let ts = TestScheduler::new(config);

    let a = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    let b = ts.submit(2, shell_job("sleep 30", 100 * MB), USER).await;
    let a_pid = ts.wait_pid(1, WAIT).await.unwrap();
    let b_pid = ts.wait_pid(2, WAIT).await.unwrap();

    assert_eq!(a.wait_event("niceness", WAIT).await.and_then(|e| e.as_i64()), Some(0));
    assert_eq!(b.wait_event("niceness", WAIT).await.and_then(|e| e.as_i64()), Some(1));
    assert_eq!(ts.os.niceness_of(a_pid), Some(0));
    assert_eq!(ts.os.niceness_of(b_pid), Some(1));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_stale_queued_peer_is_dropped() {
    let ts = TestScheduler::new(test_config(100 * MB));

    let a = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());
    let mut b = ts.submit(2, shell_job("true", 100 * MB), USER).await;
    assert!(b.wait_event("queued", WAIT).await.is_some());

    b.disconnect();
    assert!(
        ts.wait_state(2, JobState::Absent, WAIT).await,
        "queued job of a vanished peer should be removed"
    );

    ts.shutdown().await;
}

#[tokio::test]
async fn test_stale_running_peer_is_killed() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let mut a = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    let pid = ts.wait_pid(1, WAIT).await.unwrap();

    a.disconnect();
    assert!(ts.wait_state(1, JobState::Absent, WAIT).await);
    assert!(ts.os.kills().contains(&(pid, Signal::SIGTERM)));

    ts.shutdown().await;
}

#[tokio::test]
async fn test_starvation_stops_one_blocked_job() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let p1 = ts.submit(1, shell_job("sleep 30", 500 * MB), USER).await;
    let p2 = ts.submit(2, shell_job("sleep 30", 500 * MB), USER).await;
    assert!(p1.wait_event("running", WAIT).await.is_some());
    assert!(p2.wait_event("running", WAIT).await.is_some());

    let c1 = ts
        .submit(3, shell_job("true", 500 * MB).with_parent(1), USER)
        .await;
    let _c2 = ts
        .submit(4, shell_job("true", 500 * MB).with_parent(2), USER)
        .await;

    // Both parents are blocked: the lowest-priority one is stopped.
    assert!(p2.wait_event("deadlock_stop", WAIT).await.is_some());
    assert!(p2.retcode(WAIT).await.is_some());
    assert!(!p1.has("deadlock_stop"));
    assert!(!p1.has("starvation_relaunch"));

    assert_eq!(c1.retcode(WAIT).await, Some(0));
    assert_eq!(ts.scheduler.job_state(1).await, JobState::Running);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_starvation_prefers_idempotent_victim() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let p1 = ts
        .submit(1, shell_job("sleep 30", 500 * MB).idempotent(), USER)
        .await;
    let p2 = ts.submit(2, shell_job("sleep 30", 500 * MB), USER).await;
    assert!(p1.wait_event("running", WAIT).await.is_some());
    assert!(p2.wait_event("running", WAIT).await.is_some());

    let _c1 = ts
        .submit(3, shell_job("sleep 30", 500 * MB).with_parent(1), USER)
        .await;
    let _c2 = ts
        .submit(4, shell_job("sleep 30", 500 * MB).with_parent(2), USER)
        .await;

    assert!(p1.wait_event("starvation_relaunch", WAIT).await.is_some());
    assert!(!p2.has("deadlock_stop"));
    assert_eq!(p1.count("starvation_relaunch"), 1);

    // The victim keeps its id and waits until its child has been admitted.
    let scheduler = ts.scheduler.clone();
    test_harness::assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move {
                scheduler.queued_ids().await == vec![1, 4]
                    && scheduler.running_ids().await.contains(&3)
            }
        },
        WAIT,
        "relaunched job should wait at the head of the queue",
    )
    .await;
    assert_eq!(ts.scheduler.job_state(1).await, JobState::Queued);
    assert!(!p1.has("retcode"));
    assert_eq!(p1.count("starvation_relaunch"), 1);

    ts.shutdown().await;
}

/// Blocked jobs holding more than the configured share of capacity trigger
/// starvation handling even while other jobs make progress.
#[tokio::test]
async fn test_starvation_on_blocked_rss_ratio() {
    let mut config = test_config(1000 * MB);
    config.max_blocked_rss_starvation_ratio = 0.3;
    let ts = TestScheduler::new(config);

    let unblocked = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    let parent = ts.submit(2, shell_job("sleep 30", 400 * MB), USER).await;
    assert!(unblocked.wait_event("running", WAIT).await.is_some());
    assert!(parent.wait_event("running", WAIT).await.is_some());

    let child = ts
        .submit(3, shell_job("sleep 30", 550 * MB).with_parent(2), USER)
        .await;

    assert!(parent.wait_event("deadlock_stop", WAIT).await.is_some());
    assert!(child.wait_event("running", WAIT).await.is_some());
    assert!(!unblocked.has("deadlock_stop"));
    assert_eq!(ts.scheduler.job_state(1).await, JobState::Running);
    assert_eq!(parent.count("deadlock_stop"), 1);

    ts.shutdown().await;
}

/// Below the ratio, a blocked parent next to a running job is left alone.
#[tokio::test]
async fn test_no_starvation_below_blocked_rss_ratio() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let unblocked = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    let parent = ts.submit(2, shell_job("sleep 30", 400 * MB), USER).await;
    assert!(unblocked.wait_event("running", WAIT).await.is_some());
    assert!(parent.wait_event("running", WAIT).await.is_some());

    let child = ts
        .submit(3, shell_job("sleep 30", 550 * MB).with_parent(2), USER)
        .await;
    assert!(child.wait_event("queued", WAIT).await.is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!parent.has("deadlock_stop"));
    assert_eq!(ts.scheduler.job_state(2).await, JobState::Running);
    assert_eq!(ts.scheduler.job_state(3).await, JobState::Queued);

    ts.shutdown().await;
}

/// Within one group, jobs are served by id no matter the submission order.
#[tokio::test]
async fn test_group_queue_is_ordered_by_job_id() {
    let ts = TestScheduler::new(test_config(1000 * MB));

    let big = ts.submit(1, shell_job("sleep 30", 900 * MB), USER).await;
    assert!(big.wait_event("running", WAIT).await.is_some());

    let later = ts
        .submit(6, shell_job("true", 200 * MB).with_group("g"), USER)
        .await;
    let earlier = ts
        .submit(5, shell_job("true", 200 * MB).with_group("g"), USER)
        .await;
    assert!(later.wait_event("id", WAIT).await.is_some());
    assert!(earlier.wait_event("id", WAIT).await.is_some());

    assert_eq!(ts.scheduler.queued_ids().await, vec![5, 6]);
    assert!(earlier.wait_value("queued", 1, WAIT).await);
    assert!(later.wait_value("queued", 2, WAIT).await);

    ts.shutdown().await;
}

#[tokio::test]
async fn test_close_cancels_everything() {
    let ts = TestScheduler::new(test_config(100 * MB));

    let a = ts.submit(1, shell_job("sleep 30", 100 * MB), USER).await;
    assert!(a.wait_event("running", WAIT).await.is_some());
    let b = ts.submit(2, shell_job("true", 100 * MB), USER).await;
    assert!(b.wait_event("queued", WAIT).await.is_some());

    ts.scheduler.close().await;
    assert_eq!(b.retcode(WAIT).await, Some(RetCode::Cancelled.code() as i64));
    assert!(b.has("shutdown"));
    assert!(a.wait_event("shutdown", WAIT).await.is_some());
    assert_eq!(a.retcode(WAIT).await, Some(RetCode::Cancelled.code() as i64));

    let peer = test_harness::TestPeer::new(3);
    assert!(matches!(
        ts.scheduler
            .submit(3, shell_job("true", MB), USER, peer.channel.clone())
            .await,
        Err(WavaError::Closed)
    ));
    assert!(ts.scheduler.wait_idle(WAIT).await);

    ts.shutdown().await;
}
