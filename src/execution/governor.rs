//! Concurrency governor - at most one running run per concurrency group
//!
//! Runs are admitted in the order they are registered. A run whose group
//! already has a holder waits until the holder's [`Permit`] is dropped. When
//! the group cancels in progress, registering also cancels the holder, so
//! the newest run is the one that gets to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Cooperative cancellation signal shared by a run and its jobs
///
/// Cancelling is idempotent; the first reason wins.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<watch::Sender<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { inner: Arc::new(tx) }
    }

    /// Request cancellation; returns false if already cancelled
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.inner.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.borrow().clone()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.inner.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(Option::is_some).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

struct GroupHolder {
    run_id: Uuid,
    cancel: CancelToken,
    released: watch::Receiver<()>,
}

type Groups = Arc<Mutex<HashMap<String, GroupHolder>>>;

/// Admission control for concurrency groups
#[derive(Clone, Default)]
pub struct ConcurrencyGovernor {
    groups: Groups,
}

/// Registration of a run with the governor
pub struct Admission {
    run_id: Uuid,
    predecessor: Option<watch::Receiver<()>>,
    permit: Permit,

    /// Run that was cancelled to make room for this one
    pub superseded: Option<Uuid>,
}

/// Held by a run while it may execute; dropping it releases the group
pub struct Permit {
    groups: Groups,
    group: Option<String>,
    run_id: Uuid,
    _released: watch::Sender<()>,
}

impl ConcurrencyGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run in its group
    ///
    /// Must be called in event order. Runs without a group are admitted
    /// immediately.
    pub fn register(
        &self,
        group: Option<&str>,
        run_id: Uuid,
        cancel_in_progress: bool,
        cancel: &CancelToken,
    ) -> Admission {
        let (released_tx, released_rx) = watch::channel(());
        let permit = Permit {
            groups: self.groups.clone(),
            group: group.map(str::to_string),
            run_id,
            _released: released_tx,
        };

        let Some(group) = group else {
            return Admission {
                run_id,
                predecessor: None,
                permit,
                superseded: None,
            };
        };

        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let previous = groups.insert(
            group.to_string(),
            GroupHolder {
                run_id,
                cancel: cancel.clone(),
                released: released_rx,
            },
        );

        let mut superseded = None;
        if let Some(previous) = &previous {
            if cancel_in_progress {
                if previous
                    .cancel
                    .cancel(format!("superseded by run {}", run_id))
                {
                    info!(
                        "Cancelling run {} in group {}: superseded by run {}",
                        previous.run_id, group, run_id
                    );
                }
                superseded = Some(previous.run_id);
            } else {
                debug!("Run {} queued behind run {} in group {}", run_id, previous.run_id, group);
            }
        }

        Admission {
            run_id,
            predecessor: previous.map(|holder| holder.released),
            permit,
            superseded,
        }
    }

    /// Run currently registered last in a group
    pub fn holder(&self, group: &str) -> Option<Uuid> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.get(group).map(|holder| holder.run_id)
    }

    /// Cancel whatever run holds a group
    pub fn cancel_group(&self, group: &str, reason: &str) -> Option<Uuid> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let holder = groups.get(group)?;
        holder.cancel.cancel(reason);
        Some(holder.run_id)
    }
}

impl Admission {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wait until every earlier run in the group has released it
    pub async fn admitted(mut self) -> Permit {
        if let Some(released) = self.predecessor.as_mut() {
            // Only errors once the predecessor's permit is dropped
            while released.changed().await.is_ok() {}
        }
        self.permit
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let Some(group) = &self.group else {
            return;
        };
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if groups
            .get(group)
            .is_some_and(|holder| holder.run_id == self.run_id)
        {
            groups.remove(group);
            debug!("Group {} released by run {}", group, self.run_id);
        }
    }
}
