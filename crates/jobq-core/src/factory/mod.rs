// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job factories (late materialization).
//!
//! A factory belongs to one cluster and turns a [`SubmitDigest`] plus item
//! rows into job records on demand. It decides *what* the next job is; the
//! queue decides *whether* one may be created now (limits and policy) and
//! stages the result in a transaction.
//!
//! # States
//!
//! | State | Code | Terminal | Resumable |
//! |-------|------|----------|-----------|
//! | `Running` | 0 | no | |
//! | `Held` | 1 | no | yes |
//! | `NoMoreItems` | 2 | yes | no |
//! | `ClusterRemoved` | 3 | yes | no |
//! | `Invalid` | -1 | yes | no |
//!
//! The code is persisted in the cluster's `JobMaterializePaused`
//! attribute so the state survives a restart.

pub mod digest;
pub mod items;

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use digest::{ItemSpec, JobBindings, SubmitDigest, bind_row};
use items::{ItemSource, ReaderState, RowStatus};

/// Factory state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FactoryState {
    /// Template failed to load.
    Invalid,
    /// Materializing.
    Running,
    /// Paused; may be resumed.
    Held,
    /// Every item has been used.
    NoMoreItems,
    /// The cluster was removed.
    ClusterRemoved,
}

impl FactoryState {
    /// Persisted code.
    pub fn code(self) -> i64 {
        match self {
            FactoryState::Invalid => -1,
            FactoryState::Running => 0,
            FactoryState::Held => 1,
            FactoryState::NoMoreItems => 2,
            FactoryState::ClusterRemoved => 3,
        }
    }

    /// Decode a persisted code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(FactoryState::Invalid),
            0 => Some(FactoryState::Running),
            1 => Some(FactoryState::Held),
            2 => Some(FactoryState::NoMoreItems),
            3 => Some(FactoryState::ClusterRemoved),
            _ => None,
        }
    }

    /// True when the factory will never materialize again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FactoryState::Invalid | FactoryState::NoMoreItems | FactoryState::ClusterRemoved
        )
    }
}

impl std::fmt::Display for FactoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FactoryState::Invalid => "invalid",
            FactoryState::Running => "running",
            FactoryState::Held => "held",
            FactoryState::NoMoreItems => "no_more_items",
            FactoryState::ClusterRemoved => "cluster_removed",
        };
        f.write_str(name)
    }
}

/// What the factory would create next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextJob {
    /// Create this job.
    Create(PlannedJob),
    /// The next row has not been read yet.
    Pending,
    /// Nothing left to create.
    Exhausted,
    /// The template or item source failed.
    Failed(String),
}

/// One job ready to be staged.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedJob {
    /// Proc id to create.
    pub proc: i32,
    /// Row the job came from, if items are used.
    pub row: Option<usize>,
    /// Step within the row.
    pub step: u32,
    /// Expanded attributes.
    pub attrs: Vec<(String, String)>,
    /// New `JobMaterializeNextRow` value when this job finishes a row.
    pub next_row: Option<usize>,
}

/// Snapshot reported by `factory_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactoryInfo {
    /// Cluster id.
    pub cluster_id: i32,
    /// Current state.
    pub state: FactoryState,
    /// Total jobs the factory will make, once known.
    pub total_procs: Option<usize>,
    /// Jobs per row.
    pub step_size: u32,
    /// Item rows read so far.
    pub item_count: usize,
    /// Item reader state.
    pub reader_state: &'static str,
    /// Load or read error.
    pub error: Option<String>,
}

/// Materialization state of one cluster.
#[derive(Debug)]
pub struct JobFactory {
    cluster: i32,
    state: FactoryState,
    digest: Option<SubmitDigest>,
    items: Option<ItemSource>,
    error: Option<String>,
}

impl JobFactory {
    /// Build a factory from template text.
    ///
    /// `items_file` overrides the template's own item file and is used when
    /// rows were sent separately. A relative item path is resolved against
    /// `spool_dir`. A parse failure yields an `Invalid` factory rather than
    /// an error so one bad cluster cannot stop the others.
    pub fn load(
        cluster: i32,
        template: &str,
        items_file: Option<&Path>,
        spool_dir: &Path,
        state: FactoryState,
    ) -> Self {
        let digest = match SubmitDigest::parse(template) {
            Ok(digest) => digest,
            Err(e) => {
                info!(cluster_id = cluster, error = %e, "Job factory template is invalid");
                return Self::invalid(cluster, e.to_string());
            }
        };

        let items = match (items_file, &digest.queue().items) {
            (Some(path), _) => Some(ItemSource::open(path)),
            (None, ItemSpec::File(path)) => {
                let path: PathBuf = if path.is_absolute() {
                    path.clone()
                } else {
                    spool_dir.join(path)
                };
                Some(ItemSource::open(&path))
            }
            (None, ItemSpec::Inline(rows)) => Some(ItemSource::inline(rows.clone())),
            (None, ItemSpec::None) => None,
        };

        debug!(
            cluster_id = cluster,
            step = digest.queue().step,
            has_items = items.is_some(),
            state = %state,
            "Loaded job factory"
        );
        Self {
            cluster,
            state,
            digest: Some(digest),
            items,
            error: None,
        }
    }

    /// A factory whose template could not be used.
    pub fn invalid(cluster: i32, error: impl Into<String>) -> Self {
        Self {
            cluster,
            state: FactoryState::Invalid,
            digest: None,
            items: None,
            error: Some(error.into()),
        }
    }

    /// Cluster id.
    pub fn cluster(&self) -> i32 {
        self.cluster
    }

    /// Current state.
    pub fn state(&self) -> FactoryState {
        self.state
    }

    /// The parsed template, unless the factory is invalid.
    pub fn digest(&self) -> Option<&SubmitDigest> {
        self.digest.as_ref()
    }

    /// Last load or materialization error.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Jobs per item row.
    pub fn step_size(&self) -> u32 {
        self.digest.as_ref().map_or(1, |d| d.queue().step)
    }

    /// Raise the pause level. Only effective while `Running` or `Held`,
    /// and never lowers the level. Returns true if the state changed.
    pub fn pause(&mut self, to: FactoryState, reason: Option<&str>) -> bool {
        if self.state.is_terminal() || to == FactoryState::Running {
            return false;
        }
        let raises = to == FactoryState::Invalid || to.code() > self.state.code();
        if !raises {
            return false;
        }
        info!(cluster_id = self.cluster, from = %self.state, to = %to, reason, "Job factory paused");
        self.state = to;
        if to.is_terminal() {
            if let Some(items) = self.items.as_mut() {
                items.cancel();
            }
        }
        if let Some(reason) = reason {
            self.error = Some(reason.to_string());
        }
        true
    }

    /// Undo a `Held` pause. Returns true if the factory is running again.
    pub fn resume(&mut self) -> bool {
        if self.state != FactoryState::Held {
            return false;
        }
        info!(cluster_id = self.cluster, "Job factory resumed");
        self.state = FactoryState::Running;
        self.error = None;
        true
    }

    /// Total jobs the factory makes, if known yet.
    pub fn total_procs(&mut self) -> Option<usize> {
        let digest = self.digest.as_ref()?;
        let step = digest.queue().step as usize;
        let Some(items) = self.items.as_mut() else {
            return Some(step);
        };
        items.poll();
        if items.state() != ReaderState::Exhausted {
            return None;
        }
        let slice = digest.queue().slice;
        let selected = (0..items.len()).filter(|row| slice.selects(*row)).count();
        Some(selected * step)
    }

    /// Work out the job for `next_proc_id`.
    ///
    /// `next_row` is the stored row cursor; `None` means start at the first
    /// selected row.
    pub fn plan_next(&mut self, next_proc_id: i32, next_row: Option<usize>) -> NextJob {
        let Some(digest) = self.digest.as_ref() else {
            return NextJob::Failed(self.error.clone().unwrap_or_else(|| "no template".to_string()));
        };
        let queue = digest.queue();
        let step_size = queue.step;
        let step = next_proc_id.max(0) as u32 % step_size;
        let cluster = self.cluster;

        let (row, vars) = match self.items.as_mut() {
            None => {
                if next_proc_id.max(0) as u32 >= step_size {
                    return NextJob::Exhausted;
                }
                (None, Vec::new())
            }
            Some(items) => {
                let row = next_row.unwrap_or_else(|| queue.slice.first());
                if !queue.slice.selects(row) {
                    return NextJob::Exhausted;
                }
                match items.row(row) {
                    RowStatus::Available(text) => (Some(row), bind_row(&queue.var_names(), text)),
                    RowStatus::Pending => return NextJob::Pending,
                    RowStatus::End => return NextJob::Exhausted,
                    RowStatus::Failed(e) => return NextJob::Failed(e.to_string()),
                }
            }
        };

        let bindings = JobBindings {
            cluster,
            proc: next_proc_id,
            step,
            row,
            vars,
        };
        match digest.make_job(&bindings) {
            Ok(attrs) => {
                let next_row = match row {
                    Some(r) if step + 1 == step_size => {
                        Some(queue.slice.next_after(r).unwrap_or(r + 1))
                    }
                    _ => None,
                };
                NextJob::Create(PlannedJob {
                    proc: next_proc_id,
                    row,
                    step,
                    attrs,
                    next_row,
                })
            }
            Err(e) => NextJob::Failed(e),
        }
    }

    /// Stop any item read in flight.
    pub fn cancel_reader(&mut self) {
        if let Some(items) = self.items.as_mut() {
            items.cancel();
        }
    }

    /// Report for `factory_info`.
    pub fn info(&mut self) -> FactoryInfo {
        let total_procs = self.total_procs();
        let (item_count, reader_state) = match self.items.as_ref() {
            Some(items) => (items.len(), items.state().as_str()),
            None => (0, "none"),
        };
        let error = self
            .error
            .clone()
            .or_else(|| self.items.as_ref().and_then(|i| i.error().map(str::to_string)));
        FactoryInfo {
            cluster_id: self.cluster,
            state: self.state,
            total_procs,
            step_size: self.step_size(),
            item_count,
            reader_state,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(template: &str) -> JobFactory {
        JobFactory::load(101, template, None, Path::new("/tmp"), FactoryState::Running)
    }

    fn create(next: NextJob) -> PlannedJob {
        match next {
            NextJob::Create(job) => job,
            other => panic!("expected a job, got {:?}", other),
        }
    }

    #[test]
    fn test_state_codes_roundtrip() {
        for state in [
            FactoryState::Invalid,
            FactoryState::Running,
            FactoryState::Held,
            FactoryState::NoMoreItems,
            FactoryState::ClusterRemoved,
        ] {
            assert_eq!(FactoryState::from_code(state.code()), Some(state));
        }
        assert_eq!(FactoryState::from_code(7), None);
        assert!(FactoryState::Invalid.is_terminal());
        assert!(!FactoryState::Held.is_terminal());
    }

    #[test]
    fn test_three_rows_step_one() {
        let mut f = factory("arguments = $(Item)\nqueue Item in (a, b, c)\n");
        assert_eq!(f.total_procs(), Some(3));

        let mut next_row = None;
        for (proc, item) in ["a", "b", "c"].iter().enumerate() {
            let job = create(f.plan_next(proc as i32, next_row));
            assert_eq!(job.proc, proc as i32);
            assert_eq!(job.row, Some(proc));
            assert!(job.attrs.contains(&("Args".to_string(), format!("\"{}\"", item))));
            next_row = job.next_row;
        }
        assert_eq!(f.plan_next(3, next_row), NextJob::Exhausted);
    }

    #[test]
    fn test_step_advances_row_after_last_step() {
        let mut f = factory("arguments = $(Item).$(Step)\nqueue 2 Item in (x, y)\n");
        assert_eq!(f.total_procs(), Some(4));
        let first = create(f.plan_next(0, None));
        assert_eq!((first.row, first.step, first.next_row), (Some(0), 0, None));
        let second = create(f.plan_next(1, None));
        assert_eq!((second.row, second.step, second.next_row), (Some(0), 1, Some(1)));
        let third = create(f.plan_next(2, Some(1)));
        assert_eq!(third.row, Some(1));
        assert!(third.attrs.contains(&("Args".to_string(), "\"y.0\"".to_string())));
    }

    #[test]
    fn test_queue_n_without_items() {
        let mut f = factory("executable = /bin/true\nqueue 2\n");
        assert_eq!(f.total_procs(), Some(2));
        assert!(matches!(f.plan_next(1, None), NextJob::Create(_)));
        assert_eq!(f.plan_next(2, None), NextJob::Exhausted);
    }

    #[test]
    fn test_invalid_template() {
        let mut f = factory("executable = /bin/true\n");
        assert_eq!(f.state(), FactoryState::Invalid);
        assert!(f.error().is_some());
        assert!(matches!(f.plan_next(0, None), NextJob::Failed(_)));
        assert!(!f.pause(FactoryState::Held, None));
        assert!(!f.resume());
    }

    #[test]
    fn test_pause_and_resume_rules() {
        let mut f = factory("queue 3\n");
        assert!(!f.resume());
        assert!(f.pause(FactoryState::Held, Some("by user")));
        assert!(!f.pause(FactoryState::Held, None));
        assert!(f.resume());
        assert_eq!(f.state(), FactoryState::Running);

        assert!(f.pause(FactoryState::NoMoreItems, None));
        assert!(!f.resume());
        assert!(!f.pause(FactoryState::Held, None));
        assert_eq!(f.state(), FactoryState::NoMoreItems);
    }

    #[test]
    fn test_sliced_rows() {
        let mut f = factory("arguments = $(Item)\nqueue Item in [1::2] (a, b, c, d)\n");
        assert_eq!(f.total_procs(), Some(2));
        let first = create(f.plan_next(0, None));
        assert_eq!(first.row, Some(1));
        assert_eq!(first.next_row, Some(3));
        let second = create(f.plan_next(1, first.next_row));
        assert_eq!(second.row, Some(3));
        assert_eq!(f.plan_next(2, second.next_row), NextJob::Exhausted);
    }

    #[test]
    fn test_make_job_failure_is_reported() {
        let mut f = factory("+Bad = $(Item) +\nqueue Item in (1)\n");
        assert!(matches!(f.plan_next(0, None), NextJob::Failed(_)));
    }

    #[test]
    fn test_info_snapshot() {
        let mut f = factory("queue Item in (a, b)\n");
        let info = f.info();
        assert_eq!(info.cluster_id, 101);
        assert_eq!(info.state, FactoryState::Running);
        assert_eq!(info.total_procs, Some(2));
        assert_eq!(info.item_count, 2);
        assert_eq!(info.reader_state, "exhausted");
    }
}
