// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Well-known attribute names and their classification.
//!
//! Every attribute write is classified once at pipeline entry through a
//! static table sorted by case-folded name. The resulting [`CategoryFlags`]
//! tell the mutation pipeline which checks apply (immutable, protected,
//! secure) and tell the commit path which side effects to dispatch.

use std::collections::HashSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Accounting group.
pub const ACCT_GROUP: &str = "AcctGroup";
/// User part of the accounting group.
pub const ACCT_GROUP_USER: &str = "AcctGroupUser";
/// Cluster id of a record.
pub const CLUSTER_ID: &str = "ClusterId";
/// Epoch seconds when the job completed.
pub const COMPLETION_DATE: &str = "CompletionDate";
/// Concurrency limit names.
pub const CONCURRENCY_LIMITS: &str = "ConcurrencyLimits";
/// Cluster attributes changed after submission.
pub const EDITED_CLUSTER_ATTRS: &str = "EditedClusterAttrs";
/// Epoch seconds of the last status change.
pub const ENTERED_CURRENT_STATUS: &str = "EnteredCurrentStatus";
/// Queue-unique job id.
pub const GLOBAL_JOB_ID: &str = "GlobalJobId";
/// Why the job is held.
pub const HOLD_REASON: &str = "HoldReason";
/// Hold reason code.
pub const HOLD_REASON_CODE: &str = "HoldReasonCode";
/// Hold reason sub-code.
pub const HOLD_REASON_SUBCODE: &str = "HoldReasonSubCode";
/// Set once the finished-job hook ran.
pub const JOB_FINISHED_HOOK_DONE: &str = "JobFinishedHookDone";
/// User priority.
pub const JOB_PRIO: &str = "JobPrio";
/// Status code, see [`crate::model::JobStatus`].
pub const JOB_STATUS: &str = "JobStatus";
/// Execution universe.
pub const JOB_UNIVERSE: &str = "JobUniverse";
/// Status before the last change.
pub const LAST_JOB_STATUS: &str = "LastJobStatus";
/// Keep the record after removal was requested.
pub const LEAVE_JOB_IN_QUEUE: &str = "LeaveJobInQueue";
/// Expression gating materialization.
pub const MATERIALIZE_CONSTRAINT: &str = "JobMaterializeConstraint";
/// Inline factory template (spool version 0).
pub const MATERIALIZE_DIGEST: &str = "JobMaterializeDigest";
/// Factory template side file.
pub const MATERIALIZE_DIGEST_FILE: &str = "JobMaterializeDigestFile";
/// Factory item data side file.
pub const MATERIALIZE_ITEMS_FILE: &str = "JobMaterializeItemsFile";
/// Cap on live jobs of a factory cluster.
pub const MATERIALIZE_LIMIT: &str = "JobMaterializeLimit";
/// Cap on idle jobs of a factory cluster.
pub const MATERIALIZE_MAX_IDLE: &str = "JobMaterializeMaxIdle";
/// Proc id of the next materialized job.
pub const MATERIALIZE_NEXT_PROC_ID: &str = "JobMaterializeNextProcId";
/// Next item row to materialize.
pub const MATERIALIZE_NEXT_ROW: &str = "JobMaterializeNextRow";
/// Factory state code.
pub const MATERIALIZE_PAUSED: &str = "JobMaterializePaused";
/// Why the factory is paused.
pub const MATERIALIZE_PAUSE_REASON: &str = "JobMaterializePauseReason";
/// Next cluster id, on the header.
pub const NEXT_CLUSTER_NUM: &str = "NextClusterNum";
/// Low-priority submission.
pub const NICE_USER: &str = "NiceUser";
/// Submitting user.
pub const OWNER: &str = "Owner";
/// Proc id of a job record.
pub const PROC_ID: &str = "ProcId";
/// Epoch seconds of submission.
pub const Q_DATE: &str = "QDate";
/// Why the job was removed.
pub const REMOVE_REASON: &str = "RemoveReason";
/// On-disk layout version, on the header.
pub const SPOOL_VERSION: &str = "SpoolVersion";
/// Jobs a factory produces in total.
pub const TOTAL_SUBMIT_PROCS: &str = "TotalSubmitProcs";
/// `owner@uid_domain`.
pub const USER: &str = "User";

/// Bit set of attribute categories.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CategoryFlags(u32);

impl CategoryFlags {
    /// No category.
    pub const NONE: Self = Self(0);
    /// Cannot change once committed on an existing record.
    pub const IMMUTABLE: Self = Self(1 << 0);
    /// Only a super-user acting with elevated rights may change it.
    pub const PROTECTED: Self = Self(1 << 1);
    /// Reserved for the queue itself.
    pub const SECURE: Self = Self(1 << 2);
    /// Affects scheduling order.
    pub const SCHEDULING: Self = Self(1 << 3);
    /// Affects live idle/running/held counters.
    pub const STATUS: Self = Self(1 << 4);
    /// Factory pause state or limits must be re-evaluated.
    pub const MATERIALIZE: Self = Self(1 << 5);
    /// Must equal the record key.
    pub const JOB_ID: Self = Self(1 << 6);
    /// Owner identity; derives `User`.
    pub const OWNER: Self = Self(1 << 7);
    /// Derives `User`.
    pub const NICE_USER: Self = Self(1 << 8);
    /// Hold reason fields.
    pub const HOLD: Self = Self(1 << 9);
    /// Accounting identity.
    pub const ACCOUNTING: Self = Self(1 << 10);

    /// A job record was created.
    pub const NEW_JOB: Self = Self(1 << 16);
    /// A job record was destroyed.
    pub const DESTROYED_JOB: Self = Self(1 << 17);
    /// A committed cluster record was edited.
    pub const CLUSTER_EDITED: Self = Self(1 << 18);
    /// A cluster record was created.
    pub const NEW_CLUSTER: Self = Self(1 << 19);

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit in `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True when no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set every bit in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for CategoryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CategoryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CategoryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(CategoryFlags, &str)] = &[
            (CategoryFlags::IMMUTABLE, "IMMUTABLE"),
            (CategoryFlags::PROTECTED, "PROTECTED"),
            (CategoryFlags::SECURE, "SECURE"),
            (CategoryFlags::SCHEDULING, "SCHEDULING"),
            (CategoryFlags::STATUS, "STATUS"),
            (CategoryFlags::MATERIALIZE, "MATERIALIZE"),
            (CategoryFlags::JOB_ID, "JOB_ID"),
            (CategoryFlags::OWNER, "OWNER"),
            (CategoryFlags::NICE_USER, "NICE_USER"),
            (CategoryFlags::HOLD, "HOLD"),
            (CategoryFlags::ACCOUNTING, "ACCOUNTING"),
            (CategoryFlags::NEW_JOB, "NEW_JOB"),
            (CategoryFlags::DESTROYED_JOB, "DESTROYED_JOB"),
            (CategoryFlags::CLUSTER_EDITED, "CLUSTER_EDITED"),
            (CategoryFlags::NEW_CLUSTER, "NEW_CLUSTER"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "CategoryFlags({})", set.join(" | "))
    }
}

const fn flags(bits: &[CategoryFlags]) -> CategoryFlags {
    let mut out = 0;
    let mut i = 0;
    while i < bits.len() {
        out |= bits[i].0;
        i += 1;
    }
    CategoryFlags(out)
}

use CategoryFlags as C;

// Sorted by lowercase name; checked by a unit test.
static CLASSIFICATION: &[(&str, CategoryFlags)] = &[
    ("acctgroup", flags(&[C::ACCOUNTING, C::SCHEDULING])),
    ("acctgroupuser", flags(&[C::ACCOUNTING, C::SCHEDULING])),
    ("clusterid", flags(&[C::JOB_ID, C::IMMUTABLE])),
    ("concurrencylimits", C::SCHEDULING),
    ("editedclusterattrs", C::SECURE),
    ("globaljobid", C::PROTECTED),
    ("holdreason", C::HOLD),
    ("holdreasoncode", C::HOLD),
    ("holdreasonsubcode", C::HOLD),
    ("jobfinishedhookdone", C::SECURE),
    ("jobmaterializeconstraint", C::MATERIALIZE),
    ("jobmaterializedigestfile", C::SECURE),
    ("jobmaterializeitemsfile", C::SECURE),
    ("jobmaterializelimit", C::MATERIALIZE),
    ("jobmaterializemaxidle", C::MATERIALIZE),
    ("jobmaterializenextprocid", C::SECURE),
    ("jobmaterializenextrow", C::SECURE),
    ("jobmaterializepaused", C::MATERIALIZE),
    ("jobprio", C::SCHEDULING),
    ("jobstatus", flags(&[C::STATUS, C::SCHEDULING])),
    ("niceuser", flags(&[C::NICE_USER, C::SCHEDULING])),
    ("owner", flags(&[C::OWNER, C::IMMUTABLE, C::SCHEDULING])),
    ("procid", flags(&[C::JOB_ID, C::IMMUTABLE])),
    ("qdate", C::PROTECTED),
    ("totalsubmitprocs", C::SECURE),
    ("user", C::PROTECTED),
];

/// Cluster attributes the factory may keep adjusting after submission even
/// when they are configured immutable.
static FACTORY_ADJUSTABLE: &[&str] = &[
    MATERIALIZE_CONSTRAINT,
    MATERIALIZE_LIMIT,
    MATERIALIZE_MAX_IDLE,
    MATERIALIZE_NEXT_PROC_ID,
    MATERIALIZE_NEXT_ROW,
    MATERIALIZE_PAUSED,
    MATERIALIZE_PAUSE_REASON,
    TOTAL_SUBMIT_PROCS,
];

/// Built-in classification of `name`.
pub fn builtin_flags(name: &str) -> CategoryFlags {
    let folded = name.to_ascii_lowercase();
    CLASSIFICATION
        .binary_search_by(|(entry, _)| (*entry).cmp(folded.as_str()))
        .map_or(CategoryFlags::NONE, |i| CLASSIFICATION[i].1)
}

/// True for cluster attributes the factory may adjust after submission.
pub fn is_factory_adjustable(name: &str) -> bool {
    FACTORY_ADJUSTABLE
        .iter()
        .any(|n| n.eq_ignore_ascii_case(name))
}

fn fold_names<'a>(names: impl IntoIterator<Item = &'a String>) -> HashSet<String> {
    names.into_iter().map(|n| n.to_ascii_lowercase()).collect()
}

/// Built-in classification plus configured extra names.
#[derive(Debug, Clone, Default)]
pub struct AttributePolicy {
    immutable: HashSet<String>,
    protected: HashSet<String>,
    secure: HashSet<String>,
}

impl AttributePolicy {
    /// Build from configured name lists.
    pub fn new<'a>(
        immutable: impl IntoIterator<Item = &'a String>,
        protected: impl IntoIterator<Item = &'a String>,
        secure: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        Self {
            immutable: fold_names(immutable),
            protected: fold_names(protected),
            secure: fold_names(secure),
        }
    }

    /// Classify an attribute name.
    pub fn classify(&self, name: &str) -> CategoryFlags {
        let mut out = builtin_flags(name);
        let folded = name.to_ascii_lowercase();
        if self.immutable.contains(&folded) {
            out |= CategoryFlags::IMMUTABLE;
        }
        if self.protected.contains(&folded) {
            out |= CategoryFlags::PROTECTED;
        }
        if self.secure.contains(&folded) {
            out |= CategoryFlags::SECURE;
        }
        out
    }
}
