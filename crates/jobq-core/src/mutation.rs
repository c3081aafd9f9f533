// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Attribute mutation checks.
//!
//! Every attribute write, remote or internal, is planned here before it is
//! staged. Checks run in a fixed order:
//!
//! 1. name and value syntax
//! 2. secure attributes (remote callers never; legacy callers are ignored)
//! 3. existing records: ownership, immutable and protected attributes
//! 4. new records: only inside the caller's own submission
//! 5. special names (`Owner`, `NiceUser`, `JobStatus`, id fields)
//! 6. configured rounding
//!
//! The result is a [`PlannedWrite`]: the writes to stage (the requested one
//! plus derived ones such as `User`) and the category flags they raise.

use std::collections::HashSet;

use chrono::Utc;
use tracing::debug;

use crate::attributes::{self as attr, AttributePolicy, CategoryFlags};
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::expr::{self, NoAttrs};
use crate::factory::FactoryState;
use crate::log::{Key, Transaction, TransactionalLog};
use crate::model::{ChainLookup, resolve_attribute};

/// A remote caller as seen by the checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteActor {
    /// Authenticated identity, if any.
    pub identity: Option<String>,
    /// The connection completed authentication.
    pub authenticated: bool,
    /// Speaks the legacy protocol.
    pub legacy: bool,
    /// Identity is a configured super-user.
    pub super_user: bool,
    /// The super-user asked to act with elevated rights.
    pub allow_protected: bool,
    /// Cluster created by the current submission.
    pub active_cluster: Option<i32>,
    /// Next proc id of the current submission.
    pub next_proc: i32,
}

/// Who is asking for a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The queue itself (materialization, recovery, cleanup).
    Internal,
    /// A connected client.
    Remote(RemoteActor),
}

impl Actor {
    /// The remote caller, if this is one.
    pub fn remote(&self) -> Option<&RemoteActor> {
        match self {
            Actor::Internal => None,
            Actor::Remote(r) => Some(r),
        }
    }
}

/// Writes to stage for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannedWrite {
    /// `(name, value)` pairs, the requested write first.
    pub writes: Vec<(String, String)>,
    /// Category flags raised.
    pub flags: CategoryFlags,
    /// The request was dropped without error (secure attribute, legacy
    /// caller).
    pub ignored: bool,
}

/// Everything the checks read.
pub struct MutationContext<'a> {
    /// Committed state.
    pub log: &'a TransactionalLog,
    /// The transaction the write would join.
    pub txn: Option<&'a Transaction>,
    /// Attribute classification.
    pub policy: &'a AttributePolicy,
    /// Queue configuration.
    pub config: &'a QueueConfig,
    /// Owners that have submitted before.
    pub owner_history: &'a HashSet<String>,
    /// The caller.
    pub actor: &'a Actor,
}

/// Value of the derived `User` attribute.
pub fn user_name(owner: &str, nice: bool, uid_domain: &str) -> String {
    if nice {
        format!("nice-user.{}@{}", owner, uid_domain)
    } else {
        format!("{}@{}", owner, uid_domain)
    }
}

impl MutationContext<'_> {
    fn scope(&self, key: Key) -> ChainLookup<'_> {
        ChainLookup::in_transaction(self.log, self.txn, key)
    }

    /// Ownership check for acting on an existing record.
    pub fn check_owner(&self, key: Key) -> Result<()> {
        let Some(remote) = self.actor.remote() else {
            return Ok(());
        };
        if self.config.all_users_trusted || remote.super_user {
            return Ok(());
        }
        let Some(identity) = remote.identity.as_deref() else {
            return Err(QueueError::denied(key, "connection has no identity"));
        };
        let owner = resolve_attribute(self.log, None, key, attr::OWNER)
            .and_then(|text| expr::unquote(&text));
        match owner {
            None => Ok(()),
            Some(owner) if owner == identity => Ok(()),
            Some(owner) => Err(QueueError::denied(
                key,
                format!("owned by {}, not {}", owner, identity),
            )),
        }
    }

    fn check_caller(&self, key: Key) -> Result<()> {
        if let Some(remote) = self.actor.remote() {
            if !remote.authenticated {
                return Err(QueueError::denied(key, "connection is not authenticated"));
            }
            if key.is_header() {
                return Err(QueueError::denied(key, "the header record is internal"));
            }
        }
        if key.record_type().is_none() {
            return Err(QueueError::invalid("key", format!("{} is not a record key", key)));
        }
        Ok(())
    }

    /// True if the secure check says to drop the request silently.
    fn check_secure(&self, key: Key, name: &str, flags: CategoryFlags) -> Result<bool> {
        match self.actor.remote() {
            Some(remote) if flags.contains(CategoryFlags::SECURE) => {
                if remote.legacy {
                    debug!(key = %key, attr = name, "Ignoring secure attribute from legacy client");
                    Ok(true)
                } else {
                    Err(QueueError::denied(key, format!("{} is reserved", name)))
                }
            }
            _ => Ok(false),
        }
    }

    /// Scope check for records that are not committed yet.
    fn check_uncommitted(&self, key: Key) -> Result<()> {
        let exists = self.log.exists_in_transaction(self.txn, key);
        let Some(remote) = self.actor.remote() else {
            return if exists {
                Ok(())
            } else {
                Err(QueueError::not_found(format!("record {}", key)))
            };
        };
        let in_submission = remote.active_cluster == Some(key.cluster)
            && (key.is_cluster() || key.proc < remote.next_proc);
        if !exists {
            if remote.active_cluster == Some(key.cluster) && key.proc >= remote.next_proc {
                return Err(QueueError::denied(key, "proc id not allocated"));
            }
            return Err(QueueError::not_found(format!("record {}", key)));
        }
        if !in_submission {
            return Err(QueueError::denied(key, "outside the active submission"));
        }
        Ok(())
    }

    /// Value a committed record shows for `name`; jobs see through to
    /// their cluster.
    fn committed_value(&self, key: Key, name: &str) -> Option<String> {
        if key.is_job() {
            resolve_attribute(self.log, self.txn, key, name)
        } else {
            self.log.get_attr(key, name).map(str::to_string)
        }
    }

    /// Remote callers may only hold or release a factory that can still run.
    fn check_pause_request(&self, key: Key, value: &str) -> Result<()> {
        if self.actor.remote().is_none() {
            return Ok(());
        }
        let requested = expr::eval_text(value, &NoAttrs)
            .as_int()
            .and_then(FactoryState::from_code);
        if !matches!(requested, Some(FactoryState::Running | FactoryState::Held)) {
            return Err(QueueError::denied(
                key,
                format!("{} may only be set to 0 or 1", attr::MATERIALIZE_PAUSED),
            ));
        }
        let current = self
            .log
            .lookup_in_transaction(self.txn, key, attr::MATERIALIZE_PAUSED)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(FactoryState::from_code);
        if let Some(state) = current.filter(|s| s.is_terminal()) {
            return Err(QueueError::denied(key, format!("job factory is {}", state)));
        }
        Ok(())
    }

    /// Plan `SetAttribute(key, name, value)`.
    pub fn check_set(&self, key: Key, name: &str, value: &str) -> Result<PlannedWrite> {
        if !expr::is_valid_attr_name(name) {
            return Err(QueueError::invalid("name", format!("'{}' is not a valid attribute name", name)));
        }
        let value = value.trim();
        if !expr::is_valid_attr_value(value) {
            return Err(QueueError::invalid(name, format!("'{}' does not parse", value)));
        }
        self.check_caller(key)?;

        let mut flags = self.policy.classify(name);
        if self.check_secure(key, name, flags)? {
            return Ok(PlannedWrite {
                ignored: true,
                ..PlannedWrite::default()
            });
        }

        let mut value = value.to_string();
        if flags.contains(CategoryFlags::OWNER) && value.eq_ignore_ascii_case("undefined") {
            let identity = self
                .actor
                .remote()
                .and_then(|r| r.identity.as_deref())
                .ok_or_else(|| QueueError::invalid(attr::OWNER, "no identity to default to"))?;
            value = expr::quote(identity);
        }

        if key.is_cluster() && name.eq_ignore_ascii_case(attr::MATERIALIZE_PAUSED) {
            self.check_pause_request(key, &value)?;
        }

        let committed = self.log.contains(key);
        if committed {
            self.check_owner(key)?;
            let previous = self.committed_value(key, name);
            let changes = previous.as_deref().is_some_and(|p| p != value);
            if flags.contains(CategoryFlags::IMMUTABLE)
                && changes
                && !(key.is_cluster() && attr::is_factory_adjustable(name))
            {
                return Err(QueueError::denied(key, format!("{} is immutable", name)));
            }
            if let Some(remote) = self.actor.remote() {
                if flags.contains(CategoryFlags::PROTECTED)
                    && previous.as_deref() != Some(value.as_str())
                    && !(remote.super_user && remote.allow_protected)
                {
                    return Err(QueueError::denied(key, format!("{} is protected", name)));
                }
            }
            if key.is_cluster() {
                flags |= CategoryFlags::CLUSTER_EDITED;
            }
        } else {
            self.check_uncommitted(key)?;
        }

        let mut planned = PlannedWrite {
            writes: vec![(name.to_string(), value.clone())],
            flags,
            ignored: false,
        };
        self.derive(key, name, &value, &mut planned)?;
        self.round(name, &mut planned);
        Ok(planned)
    }

    fn derive(&self, key: Key, name: &str, value: &str, planned: &mut PlannedWrite) -> Result<()> {
        let flags = planned.flags;
        let scope = self.scope(key);

        if flags.contains(CategoryFlags::JOB_ID) {
            let expected = if name.eq_ignore_ascii_case(attr::CLUSTER_ID) {
                Some(key.cluster)
            } else if key.is_job() {
                Some(key.proc)
            } else {
                None
            };
            let given = expr::eval_text(value, &NoAttrs).as_int();
            if expected.is_none() || given != expected.map(i64::from) {
                return Err(QueueError::denied(
                    key,
                    format!("{} must equal the record key", name),
                ));
            }
        }

        if flags.contains(CategoryFlags::OWNER) {
            let owner = expr::unquote(value)
                .ok_or_else(|| QueueError::invalid(attr::OWNER, "owner must be a string"))?;
            if let Some(remote) = self.actor.remote() {
                let is_self = remote.identity.as_deref() == Some(owner.as_str());
                let may_impersonate = remote.super_user && self.owner_history.contains(&owner);
                if !self.config.all_users_trusted && !is_self && !may_impersonate {
                    return Err(QueueError::denied(
                        key,
                        format!("may not set owner to {}", owner),
                    ));
                }
            }
            let nice = scope.eval(attr::NICE_USER).is_true();
            planned.writes.push((
                attr::USER.to_string(),
                expr::quote(&user_name(&owner, nice, &self.config.uid_domain)),
            ));
        }

        if flags.contains(CategoryFlags::NICE_USER) {
            if let Some(owner) = scope.eval(attr::OWNER).as_str() {
                let nice = expr::eval_text(value, &scope).is_true();
                planned.writes.push((
                    attr::USER.to_string(),
                    expr::quote(&user_name(owner, nice, &self.config.uid_domain)),
                ));
            }
        }

        if flags.contains(CategoryFlags::STATUS) && key.is_job() {
            let previous = scope.eval(attr::JOB_STATUS).as_int();
            let next = expr::eval_text(value, &NoAttrs).as_int();
            if previous != next {
                planned.writes.push((
                    attr::LAST_JOB_STATUS.to_string(),
                    previous.unwrap_or(0).to_string(),
                ));
                planned.writes.push((
                    attr::ENTERED_CURRENT_STATUS.to_string(),
                    Utc::now().timestamp().to_string(),
                ));
            }
        }
        Ok(())
    }

    fn round(&self, name: &str, planned: &mut PlannedWrite) {
        let Some(rule) = self.config.round_rule(name) else {
            return;
        };
        let raw = planned.writes[0].1.clone();
        if let Some(rounded) = rule.apply(&raw) {
            if rounded != raw {
                planned.writes[0].1 = rounded;
                planned.writes.push((format!("{}_RAW", name), raw));
            }
        }
    }

    /// Plan `DeleteAttribute(key, name)`.
    pub fn check_delete(&self, key: Key, name: &str) -> Result<PlannedWrite> {
        if !expr::is_valid_attr_name(name) {
            return Err(QueueError::invalid("name", format!("'{}' is not a valid attribute name", name)));
        }
        self.check_caller(key)?;
        let mut flags = self.policy.classify(name);
        if self.check_secure(key, name, flags)? {
            return Ok(PlannedWrite {
                ignored: true,
                ..PlannedWrite::default()
            });
        }
        if !self.log.exists_in_transaction(self.txn, key) {
            return Err(QueueError::not_found(format!("record {}", key)));
        }
        if self.log.lookup_in_transaction(self.txn, key, name).is_none() {
            return Err(QueueError::not_found(format!("attribute {} of {}", name, key)));
        }

        if self.log.contains(key) {
            self.check_owner(key)?;
            let committed_value = if key.is_job() {
                let effective = resolve_attribute(self.log, None, key, name);
                let fallback = self
                    .log
                    .lookup_in_transaction(self.txn, Key::cluster(key.cluster), name);
                self.log.get_attr(key, name).is_some() || (effective.is_some() && effective != fallback)
            } else {
                self.log.get_attr(key, name).is_some()
            };
            if flags.contains(CategoryFlags::IMMUTABLE) && committed_value {
                return Err(QueueError::denied(key, format!("{} is immutable", name)));
            }
            if let Some(remote) = self.actor.remote() {
                if flags.contains(CategoryFlags::PROTECTED) && !(remote.super_user && remote.allow_protected) {
                    return Err(QueueError::denied(key, format!("{} is protected", name)));
                }
            }
            if key.is_cluster() {
                flags |= CategoryFlags::CLUSTER_EDITED;
            }
        } else {
            self.check_uncommitted(key)?;
        }
        Ok(PlannedWrite {
            writes: Vec::new(),
            flags,
            ignored: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::log::{LogOp, RecordType};
    use crate::rounding::RoundingRule;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        log: TransactionalLog,
        policy: AttributePolicy,
        config: QueueConfig,
        history: HashSet<String>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut log = TransactionalLog::open(dir.path().join("q.log"), 0).unwrap();
        let mut txn = log.begin();
        txn.stage(LogOp::NewRecord {
            key: Key::cluster(1),
            kind: RecordType::Cluster,
        });
        for (name, value) in [("Owner", "\"alice\""), ("ClusterId", "1"), ("JobMaterializeLimit", "5")] {
            txn.stage(LogOp::SetAttr {
                key: Key::cluster(1),
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        txn.stage(LogOp::NewRecord {
            key: Key::job(1, 0),
            kind: RecordType::Job,
        });
        for (name, value) in [("ProcId", "0"), ("JobStatus", "1"), ("QDate", "100")] {
            txn.stage(LogOp::SetAttr {
                key: Key::job(1, 0),
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        log.commit(txn, true).unwrap();

        let mut config = QueueConfig::default();
        config.uid_domain = "example.org".to_string();
        config.round_attrs.insert("imagesize".to_string(), RoundingRule::PowerOfTen(3));
        config.immutable_attrs.push("JobMaterializeLimit".to_string());
        let policy = AttributePolicy::new(&config.immutable_attrs, &config.protected_attrs, &config.secure_attrs);
        Fixture {
            _dir: dir,
            log,
            policy,
            config,
            history: HashSet::from(["alice".to_string()]),
        }
    }

    fn remote(identity: &str) -> Actor {
        Actor::Remote(RemoteActor {
            identity: Some(identity.to_string()),
            authenticated: true,
            ..RemoteActor::default()
        })
    }

    impl Fixture {
        fn ctx<'a>(&'a self, actor: &'a Actor, txn: Option<&'a Transaction>) -> MutationContext<'a> {
            MutationContext {
                log: &self.log,
                txn,
                policy: &self.policy,
                config: &self.config,
                owner_history: &self.history,
                actor,
            }
        }
    }

    #[test]
    fn test_syntax_errors() {
        let f = fixture();
        let alice = remote("alice");
        let ctx = f.ctx(&alice, None);
        let err = ctx.check_set(Key::job(1, 0), "1Bad", "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = ctx.check_set(Key::job(1, 0), "Foo", "1 +").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_secure_attribute_by_protocol() {
        let f = fixture();
        let alice = remote("alice");
        let err = f
            .ctx(&alice, None)
            .check_set(Key::cluster(1), "JobMaterializeNextProcId", "9")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let legacy = Actor::Remote(RemoteActor {
            identity: Some("alice".to_string()),
            authenticated: true,
            legacy: true,
            ..RemoteActor::default()
        });
        let planned = f
            .ctx(&legacy, None)
            .check_set(Key::cluster(1), "JobMaterializeNextProcId", "9")
            .unwrap();
        assert!(planned.ignored);
        assert!(planned.writes.is_empty());

        let internal = Actor::Internal;
        let planned = f
            .ctx(&internal, None)
            .check_set(Key::cluster(1), "JobMaterializeNextProcId", "9")
            .unwrap();
        assert!(!planned.ignored);
    }

    #[test]
    fn test_ownership_and_super_user() {
        let f = fixture();
        let bob = remote("bob");
        let err = f.ctx(&bob, None).check_set(Key::job(1, 0), "Foo", "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let root = Actor::Remote(RemoteActor {
            identity: Some("root".to_string()),
            authenticated: true,
            super_user: true,
            ..RemoteActor::default()
        });
        assert!(f.ctx(&root, None).check_set(Key::job(1, 0), "Foo", "1").is_ok());

        let anonymous = Actor::Remote(RemoteActor::default());
        let err = f
            .ctx(&anonymous, None)
            .check_set(Key::job(1, 0), "Foo", "1")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_immutable_and_factory_allow_list() {
        let f = fixture();
        let alice = remote("alice");
        let ctx = f.ctx(&alice, None);
        let err = ctx.check_set(Key::cluster(1), "Owner", "\"bob\"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        // Same value is not a change.
        assert!(ctx.check_set(Key::cluster(1), "Owner", "\"alice\"").is_ok());
        // Configured immutable but adjustable by the factory on cluster records.
        assert!(ctx.check_set(Key::cluster(1), "JobMaterializeLimit", "7").is_ok());
        assert!(ctx.check_delete(Key::job(1, 0), "ProcId").is_err());
    }

    #[test]
    fn test_inherited_owner_is_immutable_on_jobs() {
        let mut f = fixture();
        f.history.insert("bob".to_string());
        let root = Actor::Remote(RemoteActor {
            identity: Some("root".to_string()),
            authenticated: true,
            super_user: true,
            ..RemoteActor::default()
        });
        let ctx = f.ctx(&root, None);
        let err = ctx.check_set(Key::job(1, 0), "Owner", "\"bob\"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("immutable"));
        assert!(ctx.check_set(Key::job(1, 0), "Owner", "\"alice\"").is_ok());
    }

    #[test]
    fn test_remote_pause_codes_limited_to_hold_and_release() {
        let f = fixture();
        let alice = remote("alice");
        let ctx = f.ctx(&alice, None);
        assert!(ctx.check_set(Key::cluster(1), "JobMaterializePaused", "1").is_ok());
        assert!(ctx.check_set(Key::cluster(1), "JobMaterializePaused", "0").is_ok());
        for code in ["-1", "2", "3", "\"0\""] {
            let err = ctx.check_set(Key::cluster(1), "JobMaterializePaused", code).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied, "code {}", code);
        }
        let internal = Actor::Internal;
        assert!(f.ctx(&internal, None).check_set(Key::cluster(1), "JobMaterializePaused", "3").is_ok());

        let mut txn = Transaction::new();
        txn.stage(LogOp::SetAttr {
            key: Key::cluster(1),
            name: "JobMaterializePaused".to_string(),
            value: "3".to_string(),
        });
        let err = f
            .ctx(&alice, Some(&txn))
            .check_set(Key::cluster(1), "JobMaterializePaused", "0")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_protected_needs_elevated_super_user() {
        let f = fixture();
        let alice = remote("alice");
        let err = f.ctx(&alice, None).check_set(Key::job(1, 0), "QDate", "200").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(f.ctx(&alice, None).check_set(Key::job(1, 0), "QDate", "100").is_ok());

        let elevated = Actor::Remote(RemoteActor {
            identity: Some("condor".to_string()),
            authenticated: true,
            super_user: true,
            allow_protected: true,
            ..RemoteActor::default()
        });
        assert!(f.ctx(&elevated, None).check_set(Key::job(1, 0), "QDate", "200").is_ok());
    }

    #[test]
    fn test_uncommitted_records_need_submission_scope() {
        let f = fixture();
        let mut txn = Transaction::new();
        txn.stage(LogOp::NewRecord {
            key: Key::cluster(2),
            kind: RecordType::Cluster,
        });
        txn.stage(LogOp::NewRecord {
            key: Key::job(2, 0),
            kind: RecordType::Job,
        });
        let in_scope = Actor::Remote(RemoteActor {
            identity: Some("alice".to_string()),
            authenticated: true,
            active_cluster: Some(2),
            next_proc: 1,
            ..RemoteActor::default()
        });
        let ctx = f.ctx(&in_scope, Some(&txn));
        assert!(ctx.check_set(Key::job(2, 0), "Foo", "1").is_ok());
        assert!(ctx.check_set(Key::cluster(2), "Foo", "1").is_ok());
        assert_eq!(
            ctx.check_set(Key::job(2, 1), "Foo", "1").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            ctx.check_set(Key::job(3, 0), "Foo", "1").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let elsewhere = remote("alice");
        assert_eq!(
            f.ctx(&elsewhere, Some(&txn))
                .check_set(Key::job(2, 0), "Foo", "1")
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_owner_derives_user() {
        let f = fixture();
        let mut txn = Transaction::new();
        txn.stage(LogOp::NewRecord {
            key: Key::cluster(3),
            kind: RecordType::Cluster,
        });
        txn.stage(LogOp::SetAttr {
            key: Key::cluster(3),
            name: "NiceUser".to_string(),
            value: "true".to_string(),
        });
        let alice = Actor::Remote(RemoteActor {
            identity: Some("alice".to_string()),
            authenticated: true,
            active_cluster: Some(3),
            ..RemoteActor::default()
        });
        let ctx = f.ctx(&alice, Some(&txn));
        let planned = ctx.check_set(Key::cluster(3), "Owner", "UNDEFINED").unwrap();
        assert_eq!(
            planned.writes,
            vec![
                ("Owner".to_string(), "\"alice\"".to_string()),
                ("User".to_string(), "\"nice-user.alice@example.org\"".to_string()),
            ]
        );
        assert_eq!(
            ctx.check_set(Key::cluster(3), "Owner", "\"mallory\"").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_super_user_impersonates_known_owners_only() {
        let f = fixture();
        let mut txn = Transaction::new();
        txn.stage(LogOp::NewRecord {
            key: Key::cluster(4),
            kind: RecordType::Cluster,
        });
        let root = Actor::Remote(RemoteActor {
            identity: Some("root".to_string()),
            authenticated: true,
            super_user: true,
            active_cluster: Some(4),
            ..RemoteActor::default()
        });
        let ctx = f.ctx(&root, Some(&txn));
        assert!(ctx.check_set(Key::cluster(4), "Owner", "\"alice\"").is_ok());
        assert!(ctx.check_set(Key::cluster(4), "Owner", "\"stranger\"").is_err());
    }

    #[test]
    fn test_job_id_fields_must_match_key() {
        let f = fixture();
        let internal = Actor::Internal;
        let ctx = f.ctx(&internal, None);
        assert!(ctx.check_set(Key::job(1, 0), "ProcId", "0").is_ok());
        assert!(ctx.check_set(Key::cluster(1), "ClusterId", "1").is_ok());
        assert!(ctx.check_set(Key::cluster(1), "ProcId", "0").is_err());

        let alice = remote("alice");
        let err = f
            .ctx(&alice, None)
            .check_set(Key::cluster(1), "ClusterId", "2")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_status_change_records_previous() {
        let f = fixture();
        let alice = remote("alice");
        let planned = f.ctx(&alice, None).check_set(Key::job(1, 0), "JobStatus", "5").unwrap();
        assert!(planned.flags.contains(CategoryFlags::STATUS));
        assert_eq!(planned.writes[1], ("LastJobStatus".to_string(), "1".to_string()));
        assert_eq!(planned.writes[2].0, "EnteredCurrentStatus");

        let same = f.ctx(&alice, None).check_set(Key::job(1, 0), "JobStatus", "1").unwrap();
        assert_eq!(same.writes.len(), 1);
    }

    #[test]
    fn test_rounding_keeps_raw_value() {
        let f = fixture();
        let alice = remote("alice");
        let planned = f.ctx(&alice, None).check_set(Key::job(1, 0), "ImageSize", "1234").unwrap();
        assert_eq!(
            planned.writes,
            vec![
                ("ImageSize".to_string(), "2000".to_string()),
                ("ImageSize_RAW".to_string(), "1234".to_string()),
            ]
        );
    }

    #[test]
    fn test_delete_checks() {
        let f = fixture();
        let alice = remote("alice");
        let ctx = f.ctx(&alice, None);
        assert_eq!(
            ctx.check_delete(Key::job(1, 0), "Missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(ctx.check_delete(Key::job(1, 0), "JobStatus").is_ok());
        assert_eq!(
            ctx.check_delete(Key::job(1, 0), "QDate").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
    }
}
