// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for submission, attribute access and removal through the queue.

mod common;

use common::*;
use jobq_core::connection::ConnectionInfo;
use jobq_core::error::ErrorKind;
use jobq_core::log::Key;
use jobq_core::queue::{DestroyOutcome, SetFlags};

#[test]
fn test_abort_restores_committed_value() {
    let mut t = TestQueue::new();
    let alice = t.user("alice");

    assert_eq!(t.queue.new_cluster(alice).unwrap(), 100);
    assert_eq!(t.queue.new_proc(alice, 100).unwrap(), 0);
    t.set(alice, 100, 0, "Foo", "1");

    t.queue.begin_transaction(alice).unwrap();
    t.set(alice, 100, 0, "Foo", "2");
    t.queue.abort_transaction(alice).unwrap();

    assert_eq!(t.queue.get_attribute(alice, 100, 0, "Foo").unwrap(), "1");
}

#[test]
fn test_jobs_inherit_cluster_attributes() {
    let mut t = TestQueue::new();
    let alice = t.user("alice");
    let cluster = t.queue.new_cluster(alice).unwrap();
    t.queue.new_proc(alice, cluster).unwrap();
    t.queue.new_proc(alice, cluster).unwrap();
    t.set(alice, cluster, -1, "Cmd", "\"/bin/sleep\"");
    t.set(alice, cluster, 1, "Cmd", "\"/bin/true\"");

    assert_eq!(t.queue.get_attribute(alice, cluster, 0, "Cmd").unwrap(), "\"/bin/sleep\"");
    assert_eq!(t.queue.get_attribute(alice, cluster, 1, "Cmd").unwrap(), "\"/bin/true\"");
    assert_eq!(t.queue.get_attribute(alice, cluster, 0, "Owner").unwrap(), "\"alice\"");

    t.queue.delete_attribute(alice, cluster, 1, "Cmd").unwrap();
    assert_eq!(t.queue.get_attribute(alice, cluster, 1, "Cmd").unwrap(), "\"/bin/sleep\"");
}

#[test]
fn test_other_users_cannot_modify_jobs() {
    let mut t = TestQueue::new();
    let cluster = t.submit("alice", 1);
    let bob = t.user("bob");

    let err = t
        .queue
        .set_attribute(bob, cluster, 0, "Foo", "1", SetFlags::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(err.error_code(), "PERMISSION_DENIED");
    assert_eq!(t.queue.destroy_proc(bob, cluster, 0).unwrap_err().kind(), ErrorKind::PermissionDenied);

    let root = t.queue.connect(ConnectionInfo::user("root"));
    t.set(root, cluster, 0, "Foo", "1");
}

#[test]
fn test_immutable_and_secure_attributes() {
    let mut t = TestQueue::new();
    let cluster = t.submit("alice", 1);
    let alice = t.user("alice");

    let err = t
        .queue
        .set_attribute(alice, cluster, 0, "Owner", "\"mallory\"", SetFlags::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let err = t
        .queue
        .set_attribute(alice, cluster, 0, "ProcId", "7", SetFlags::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let err = t
        .queue
        .set_attribute(alice, cluster, -1, "JobMaterializeNextProcId", "9", SetFlags::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let legacy = t.queue.connect(ConnectionInfo::user("alice").legacy());
    t.queue
        .set_attribute(legacy, cluster, -1, "JobMaterializeNextProcId", "9", SetFlags::default())
        .unwrap();
    assert_eq!(t.queue.resolve_attribute(Key::cluster(cluster), "JobMaterializeNextProcId"), None);
}

#[test]
fn test_super_user_cannot_reown_committed_job() {
    let mut t = TestQueue::new();
    t.submit("bob", 1);
    let cluster = t.submit("alice", 1);
    let root = t.queue.connect(ConnectionInfo::user("root"));

    let err = t
        .queue
        .set_attribute(root, cluster, 0, "Owner", "\"bob\"", SetFlags::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(
        t.queue.resolve_attribute(Key::job(cluster, 0), "Owner").as_deref(),
        Some("\"alice\"")
    );
}

#[test]
fn test_status_change_tracks_history() {
    let mut t = TestQueue::new();
    let cluster = t.submit("alice", 1);
    let alice = t.user("alice");
    t.set(alice, cluster, 0, "JobStatus", "1");
    t.set(alice, cluster, 0, "JobStatus", "2");

    let key = Key::job(cluster, 0);
    assert_eq!(t.queue.resolve_attribute(key, "LastJobStatus").as_deref(), Some("1"));
    assert!(t.queue.resolve_attribute(key, "EnteredCurrentStatus").is_some());
    assert_eq!(t.queue.queue_summary().running, 1);
}

#[test]
fn test_per_owner_quota_is_monotonic() {
    let mut t = TestQueue::with_config(|c| c.max_jobs_per_owner = 2);
    let alice = t.user("alice");
    let cluster = t.queue.new_cluster(alice).unwrap();
    t.queue.new_proc(alice, cluster).unwrap();
    t.queue.new_proc(alice, cluster).unwrap();

    let err = t.queue.new_proc(alice, cluster).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(t.queue.cluster_size(cluster), 2);

    assert_eq!(t.queue.destroy_proc(alice, cluster, 0).unwrap(), DestroyOutcome::Destroyed);
    assert_eq!(t.queue.new_proc(alice, cluster).unwrap(), 2);
    assert_eq!(t.queue.new_proc(alice, cluster).unwrap_err().kind(), ErrorKind::QuotaExceeded);
}

#[test]
fn test_per_submission_quota() {
    let mut t = TestQueue::with_config(|c| c.max_jobs_per_submission = 3);
    let alice = t.user("alice");
    t.queue.begin_transaction(alice).unwrap();
    let cluster = t.queue.new_cluster(alice).unwrap();
    for _ in 0..3 {
        t.queue.new_proc(alice, cluster).unwrap();
    }
    assert_eq!(t.queue.new_proc(alice, cluster).unwrap_err().kind(), ErrorKind::QuotaExceeded);
    t.queue.commit_transaction(alice, true).unwrap();
    assert_eq!(t.queue.cluster_size(cluster), 3);
}

#[test]
fn test_cluster_refcount_and_destroy() {
    let mut t = TestQueue::new();
    let cluster = t.submit("alice", 3);
    let alice = t.user("alice");
    assert_eq!(t.queue.cluster_size(cluster), 3);

    t.queue.begin_transaction(alice).unwrap();
    t.queue.destroy_proc(alice, cluster, 0).unwrap();
    t.queue.destroy_proc(alice, cluster, 1).unwrap();
    assert_eq!(t.queue.cluster_size(cluster), 1);
    t.queue.abort_transaction(alice).unwrap();
    assert_eq!(t.queue.cluster_size(cluster), 3);

    assert_eq!(t.queue.destroy_cluster(alice, cluster, "done").unwrap(), 3);
    assert!(!t.queue.log().contains(Key::cluster(cluster)));
    assert_eq!(t.queue.queue_summary().clusters, 0);
}

#[test]
fn test_cluster_ids_advance_and_persist() {
    let mut t = TestQueue::new();
    let first = t.submit("alice", 1);
    let second = t.submit("alice", 1);
    assert_eq!((first, second), (100, 101));

    t.reopen();
    assert_eq!(t.queue.next_cluster_id(), 102);
    assert_eq!(t.submit("bob", 1), 102);
}

#[test]
fn test_submit_requirement_rejects_commit() {
    let mut t = TestQueue::with_config(|c| {
        c.submit_requirements =
            jobq_core::config::parse_submit_requirements("HasCmd: Cmd =!= undefined").unwrap();
    });
    let alice = t.user("alice");
    t.queue.begin_transaction(alice).unwrap();
    let cluster = t.queue.new_cluster(alice).unwrap();
    t.queue.new_proc(alice, cluster).unwrap();
    let err = t.queue.commit_transaction(alice, true).unwrap_err();
    assert_eq!(err.error_code(), "SUBMIT_REQUIREMENT_FAILED");
    assert!(!t.queue.log().contains(Key::job(cluster, 0)));
    assert_eq!(t.queue.cluster_size(cluster), 0);
}

#[test]
fn test_submit_transform_sets_attribute() {
    let mut t = TestQueue::with_config(|c| {
        c.submit_transforms =
            jobq_core::config::parse_submit_transforms("Site = \"local\" if Site =?= undefined").unwrap();
    });
    let cluster = t.submit("alice", 1);
    assert_eq!(
        t.queue.resolve_attribute(Key::job(cluster, 0), "Site").as_deref(),
        Some("\"local\"")
    );
}

#[test]
fn test_cluster_ids_wrap_and_skip_live_clusters() {
    let mut t = TestQueue::with_config(|c| c.cluster_max_value = 101);
    assert_eq!(t.submit("alice", 1), 100);
    assert_eq!(t.submit("alice", 1), 101);
    assert_eq!(t.queue.next_cluster_id(), 100);

    let alice = t.user("alice");
    let err = t.queue.new_cluster(alice).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(t.queue.next_cluster_id(), 101);
    assert_eq!(t.queue.cluster_size(100), 1);

    assert_eq!(t.queue.destroy_cluster(alice, 100, "done").unwrap(), 1);
    assert_eq!(t.queue.new_cluster(alice).unwrap_err().kind(), ErrorKind::Conflict);
    assert_eq!(t.queue.new_cluster(alice).unwrap(), 100);
    assert_eq!(t.queue.next_cluster_id(), 101);
}
