// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Late materialization tests.
//!
//! These run without a tokio runtime so item files are read inline.

mod common;

use common::*;
use jobq_core::error::ErrorKind;
use jobq_core::factory::FactoryState;
use jobq_core::log::Key;
use jobq_core::queue::{RetryHint, SetFlags};

/// Submit an empty cluster carrying a factory, with optional item rows.
fn submit_factory(t: &mut TestQueue, template: &str, rows: Option<&[&str]>) -> i32 {
    let alice = t.user("alice");
    t.queue.begin_transaction(alice).unwrap();
    let cluster = t.queue.new_cluster(alice).unwrap();
    if let Some(rows) = rows {
        let rows = rows.iter().map(|r| r.to_string()).collect();
        t.queue.send_materialize_item_data(alice, cluster, rows).unwrap();
    }
    t.queue.set_job_factory(alice, cluster, template).unwrap();
    t.queue.commit_transaction(alice, true).unwrap();
    t.queue.disconnect(alice);
    cluster
}

#[test]
fn test_factory_with_item_data() {
    let mut t = TestQueue::with_config(|c| c.cluster_initial_value = 101);
    let template = "executable = /bin/echo\narguments = $(Item)\nqueue Item from cluster101.items\n";
    let cluster = submit_factory(&mut t, template, Some(&["alpha", "beta", "gamma"]));
    assert_eq!(cluster, 101);
    assert_eq!(t.queue.cluster_size(cluster), 0);
    assert!(t.queue.log().contains(Key::cluster(cluster)));

    for proc in 0..3 {
        let outcome = t.queue.materialize_next(cluster).unwrap();
        assert_eq!(outcome.created, Some(Key::job(cluster, proc)));
    }
    let outcome = t.queue.materialize_next(cluster).unwrap();
    assert!(!outcome.is_created());
    assert_eq!(outcome.retry, RetryHint::None);
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::NoMoreItems));

    let job = Key::job(cluster, 2);
    assert_eq!(t.queue.resolve_attribute(job, "Args").as_deref(), Some("\"gamma\""));
    assert_eq!(t.queue.resolve_attribute(job, "Cmd").as_deref(), Some("\"/bin/echo\""));
    assert_eq!(t.queue.resolve_attribute(job, "JobStatus").as_deref(), Some("1"));
    assert_eq!(t.queue.resolve_attribute(job, "Owner").as_deref(), Some("\"alice\""));
    assert_eq!(t.queue.cluster_size(cluster), 3);

    let info = t.queue.factory_info(cluster).unwrap();
    assert_eq!(info.item_count, 3);
    assert_eq!(info.total_procs, Some(3));
}

#[test]
fn test_materialize_limit_throttles() {
    let mut t = TestQueue::new();
    let alice = t.user("alice");
    t.queue.begin_transaction(alice).unwrap();
    let cluster = t.queue.new_cluster(alice).unwrap();
    t.queue.set_job_factory(alice, cluster, "queue 10\n").unwrap();
    t.set(alice, cluster, -1, "JobMaterializeLimit", "3");
    t.queue.commit_transaction(alice, true).unwrap();

    assert_eq!(t.queue.materialize_tick(), 3);
    let outcome = t.queue.materialize_next(cluster).unwrap();
    assert_eq!(outcome.retry, RetryHint::Later);
    assert_eq!(t.queue.cluster_size(cluster), 3);

    t.queue.destroy_proc(alice, cluster, 0).unwrap();
    assert_eq!(t.queue.materialize_tick(), 1);
    assert!(t.queue.log().contains(Key::job(cluster, 3)));
}

#[test]
fn test_owner_quota_pauses_materialization() {
    let mut t = TestQueue::with_config(|c| c.max_jobs_per_owner = 2);
    let cluster = submit_factory(&mut t, "queue 5\n", None);

    assert_eq!(t.queue.materialize_tick(), 2);
    assert_eq!(t.queue.materialize_next(cluster).unwrap().retry, RetryHint::Later);
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::Running));
}

#[test]
fn test_factory_resumes_after_restart() {
    let mut t = TestQueue::new();
    let cluster = submit_factory(&mut t, "+Index = $(ProcId)\nqueue 5\n", None);
    t.queue.materialize_next(cluster).unwrap();
    t.queue.materialize_next(cluster).unwrap();
    assert_eq!(t.queue.cluster_size(cluster), 2);

    t.reopen();
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::Running));
    assert_eq!(
        t.queue.log().get_attr(Key::cluster(cluster), "JobMaterializeNextProcId"),
        Some("2")
    );
    assert_eq!(t.queue.materialize_tick(), 3);
    for proc in 0..5 {
        assert!(t.queue.log().contains(Key::job(cluster, proc)));
    }
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::NoMoreItems));
}

#[test]
fn test_destroy_cluster_stops_factory() {
    let mut t = TestQueue::new();
    let cluster = submit_factory(&mut t, "queue 10\n", None);
    t.queue.materialize_next(cluster).unwrap();
    t.queue.materialize_next(cluster).unwrap();
    let digest = t.dir.path().join(format!("cluster{}.digest", cluster));
    assert!(digest.exists());

    let alice = t.user("alice");
    assert_eq!(t.queue.destroy_cluster(alice, cluster, "no longer needed").unwrap(), 2);
    assert!(!t.queue.log().contains(Key::cluster(cluster)));
    assert!(!digest.exists());
    assert_eq!(t.queue.materialize_tick(), 0);
    assert_eq!(t.queue.queue_summary().active_factories, 0);
}

#[test]
fn test_held_factory_resumes_on_release() {
    let mut t = TestQueue::new();
    let cluster = submit_factory(&mut t, "queue 2\n", None);
    let alice = t.user("alice");
    t.queue
        .set_attribute(alice, cluster, -1, "JobMaterializePaused", "1", SetFlags::default())
        .unwrap();
    assert_eq!(t.queue.materialize_tick(), 0);

    t.queue
        .set_attribute(alice, cluster, -1, "JobMaterializePaused", "0", SetFlags::default())
        .unwrap();
    assert_eq!(t.queue.materialize_tick(), 2);
}

#[test]
fn test_bad_templates_rejected() {
    let mut t = TestQueue::new();
    let alice = t.user("alice");
    t.queue.begin_transaction(alice).unwrap();
    let cluster = t.queue.new_cluster(alice).unwrap();

    let err = t
        .queue
        .set_job_factory(alice, cluster, "executable = /bin/true\n")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = t
        .queue
        .set_job_factory(alice, cluster, "queue x from /etc/passwd\n")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    t.queue.set_job_factory(alice, cluster, "queue 1\n").unwrap();
    let err = t.queue.set_job_factory(alice, cluster, "queue 2\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    t.queue.abort_transaction(alice).unwrap();

    assert!(!t.dir.path().join(format!("cluster{}.digest", cluster)).exists());
}

#[test]
fn test_removed_factory_stays_stopped() {
    let mut t = TestQueue::new();
    let cluster = submit_factory(&mut t, "+LeaveJobInQueue = true\nqueue 5\n", None);
    assert!(t.queue.materialize_next(cluster).unwrap().is_created());

    let alice = t.user("alice");
    assert_eq!(t.queue.destroy_cluster(alice, cluster, "cancelled").unwrap(), 0);
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::ClusterRemoved));

    let err = t
        .queue
        .set_attribute(alice, cluster, -1, "JobMaterializePaused", "0", SetFlags::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(
        t.queue.log().get_attr(Key::cluster(cluster), "JobMaterializePaused"),
        Some("3")
    );

    t.reopen();
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::ClusterRemoved));
    assert_eq!(t.queue.materialize_tick(), 0);
    assert_eq!(t.queue.cluster_size(cluster), 1);
}

#[test]
fn test_clients_cannot_stop_factory_for_good() {
    let mut t = TestQueue::new();
    let cluster = submit_factory(&mut t, "queue 3\n", None);
    let alice = t.user("alice");
    for code in ["-1", "2", "3"] {
        let err = t
            .queue
            .set_attribute(alice, cluster, -1, "JobMaterializePaused", code, SetFlags::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::Running));
    assert_eq!(t.queue.materialize_tick(), 3);
}

#[test]
fn test_factory_continues_after_existing_procs() {
    let mut t = TestQueue::new();
    let cluster = t.submit("alice", 2);
    let alice = t.user("alice");
    t.queue
        .set_job_factory(alice, cluster, "+Index = $(ProcId)\nqueue 4\n")
        .unwrap();
    assert_eq!(
        t.queue.log().get_attr(Key::cluster(cluster), "JobMaterializeNextProcId"),
        Some("2")
    );

    assert_eq!(t.queue.materialize_tick(), 2);
    assert_eq!(
        t.queue.resolve_attribute(Key::job(cluster, 3), "Index").as_deref(),
        Some("3")
    );
    assert_eq!(t.queue.cluster_size(cluster), 4);
    assert_eq!(t.queue.model().factory_state(cluster), Some(FactoryState::NoMoreItems));
}

#[test]
fn test_factory_in_submission_skips_allocated_procs() {
    let mut t = TestQueue::new();
    let alice = t.user("alice");
    t.queue.begin_transaction(alice).unwrap();
    let cluster = t.queue.new_cluster(alice).unwrap();
    t.queue.new_proc(alice, cluster).unwrap();
    t.queue
        .set_job_factory(alice, cluster, "queue Item in (a, b, c)\n")
        .unwrap();
    t.queue.commit_transaction(alice, true).unwrap();

    assert_eq!(t.queue.materialize_tick(), 2);
    assert!(t.queue.log().contains(Key::job(cluster, 2)));
    assert!(!t.queue.log().contains(Key::job(cluster, 3)));
    assert_ne!(t.queue.model().factory_state(cluster), Some(FactoryState::Held));
}

#[test]
fn test_system_limit_caps_cluster_limit() {
    let mut t = TestQueue::with_config(|c| c.max_materialize_per_cluster = 2);
    let alice = t.user("alice");
    t.queue.begin_transaction(alice).unwrap();
    let cluster = t.queue.new_cluster(alice).unwrap();
    t.queue.set_job_factory(alice, cluster, "queue 5\n").unwrap();
    t.set(alice, cluster, -1, "JobMaterializeLimit", "4");
    t.queue.commit_transaction(alice, true).unwrap();

    assert_eq!(t.queue.materialize_tick(), 2);
    assert_eq!(t.queue.materialize_next(cluster).unwrap().retry, RetryHint::Later);
    assert_eq!(t.queue.cluster_size(cluster), 2);

    t.queue.destroy_proc(alice, cluster, 1).unwrap();
    assert_eq!(t.queue.materialize_tick(), 1);
    assert!(t.queue.log().contains(Key::job(cluster, 2)));
    assert_eq!(t.queue.cluster_size(cluster), 2);
}
