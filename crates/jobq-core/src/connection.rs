// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-connection session state.
//!
//! Authentication happens outside the queue; a connection arrives with the
//! identity it proved (if any) and the protocol generation it speaks.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::mutation::{Actor, RemoteActor};
use crate::queue::ActiveTransaction;

/// Connection identifier.
pub type ConnectionId = Uuid;

/// Protocol generation of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    /// Older clients; writes of reserved attributes are dropped silently.
    Legacy,
    /// Current clients; writes of reserved attributes fail.
    Current,
}

/// What the authentication layer tells the queue about a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Authenticated identity.
    pub identity: Option<String>,
    /// Authentication completed.
    pub authenticated: bool,
    /// Protocol generation.
    pub protocol: ProtocolVersion,
    /// A super-user asked to override protected attributes.
    pub allow_protected: bool,
}

impl ConnectionInfo {
    /// An authenticated caller on the current protocol.
    pub fn user(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            authenticated: true,
            protocol: ProtocolVersion::Current,
            allow_protected: false,
        }
    }

    /// A caller that did not authenticate.
    pub fn anonymous() -> Self {
        Self {
            identity: None,
            authenticated: false,
            protocol: ProtocolVersion::Current,
            allow_protected: false,
        }
    }

    /// Same caller, legacy protocol.
    pub fn legacy(mut self) -> Self {
        self.protocol = ProtocolVersion::Legacy;
        self
    }

    /// Same caller, asking for protected-attribute rights.
    pub fn with_protected(mut self) -> Self {
        self.allow_protected = true;
        self
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Connection {
    /// Id.
    pub id: ConnectionId,
    /// Caller description.
    pub info: ConnectionInfo,
    /// Cluster created by the current submission.
    pub active_cluster: Option<i32>,
    /// Next proc id in `active_cluster`.
    pub next_proc: i32,
    /// Open transaction.
    pub txn: Option<ActiveTransaction>,
    /// Last request time, for the idle watchdog.
    pub last_activity: Instant,
}

impl Connection {
    /// New connection with no submission in progress.
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            info,
            active_cluster: None,
            next_proc: 0,
            txn: None,
            last_activity: Instant::now(),
        }
    }

    /// Record activity.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// The caller as seen by the mutation checks.
    pub fn actor(&self, super_users: &[String]) -> Actor {
        let super_user = self
            .info
            .identity
            .as_ref()
            .is_some_and(|id| self.info.authenticated && super_users.iter().any(|s| s == id));
        Actor::Remote(RemoteActor {
            identity: self.info.identity.clone(),
            authenticated: self.info.authenticated,
            legacy: self.info.protocol == ProtocolVersion::Legacy,
            super_user,
            allow_protected: self.info.allow_protected,
            active_cluster: self.active_cluster,
            next_proc: self.next_proc,
        })
    }
}
