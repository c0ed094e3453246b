//! Session registry: the in-memory map from VM id to VM record.
//!
//! The registry is the single source of truth for which VMs exist and what
//! state they are in. It is empty at startup, never persisted, and shared by
//! `Arc` with the components that need it.

use chrono::{DateTime, Local, TimeDelta};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::error::VmError;
use crate::provision::{RemoteConfig, VmKind, VmSpec};
use crate::runtime::{RuntimeChannel, RuntimeHandle};
use crate::state::{StopInfo, StopReason, Transition, VmState};

/// Operator-assigned VM identifier.
pub type VmId = String;

/// Maximum length of a VM id.
const MAX_ID_LEN: usize = 64;

/// Validates an operator-supplied VM id.
pub fn validate_id(id: &str) -> Result<(), VmError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(VmError::InvalidId(id.to_string()))
    }
}

/// One VM known to this process.
pub struct VmRecord {
    id: VmId,
    kind: VmKind,
    profile: String,
    state: VmState,
    created_at: DateTime<Local>,
    runtime: Option<RuntimeHandle>,
    remote: Option<RemoteConfig>,
    stop: Option<StopInfo>,
}

impl VmRecord {
    fn new(spec: VmSpec, runtime: RuntimeHandle) -> Self {
        let kind = spec.kind();
        let remote = spec.strategy.remote_config().cloned();
        Self {
            id: spec.id,
            kind,
            profile: spec.profile,
            state: VmState::Running,
            created_at: Local::now(),
            runtime: Some(runtime),
            remote,
            stop: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Returns a handle-free copy of the record.
    pub fn snapshot(&self) -> VmSnapshot {
        VmSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            profile: self.profile.clone(),
            state: self.state,
            created_at: self.created_at,
            stop: self.stop,
            remote_host: self.remote.as_ref().map(|r| r.host.clone()),
            runtime: self.runtime.as_ref().map(|r| r.describe()),
        }
    }
}

/// Point-in-time copy of a VM record.
#[derive(Debug, Clone, Serialize)]
pub struct VmSnapshot {
    pub id: VmId,
    pub kind: VmKind,
    pub profile: String,
    pub state: VmState,
    pub created_at: DateTime<Local>,
    pub stop: Option<StopInfo>,
    pub remote_host: Option<String>,
    pub runtime: Option<String>,
}

impl VmSnapshot {
    /// Time since creation; frozen at the stop time for a tombstone.
    pub fn uptime(&self) -> TimeDelta {
        let end = self.stop.map(|s| s.at).unwrap_or_else(Local::now);
        (end - self.created_at).max(TimeDelta::zero())
    }

    /// Uptime rendered as `"{days}d {hours}h {minutes}m"`.
    pub fn uptime_display(&self) -> String {
        format_uptime(self.uptime())
    }

    pub fn is_tombstone(&self) -> bool {
        self.state == VmState::Stopped
    }
}

pub fn format_uptime(delta: TimeDelta) -> String {
    let secs = delta.num_seconds().max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

/// Thread-safe registry of VM records.
///
/// Each record lives behind its DashMap shard lock; every read copies the
/// record under that lock, so snapshots are never torn. Locks are never held
/// across an `.await`.
pub struct SessionRegistry {
    records: DashMap<VmId, VmRecord>,
    /// Maximum number of live (non-tombstoned) VMs.
    max_live: Option<usize>,
}

impl SessionRegistry {
    /// Creates an empty registry with no live-VM limit.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            max_live: None,
        }
    }

    /// Creates an empty registry that admits at most `max_live` live VMs.
    pub fn with_limit(max_live: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_live: Some(max_live),
        }
    }

    /// Checks that `id` is valid, unused, and that the live limit allows
    /// one more VM.
    pub fn ensure_available(&self, id: &str) -> Result<(), VmError> {
        validate_id(id)?;
        if self.records.contains_key(id) {
            return Err(VmError::DuplicateId(id.to_string()));
        }
        self.check_limit(id)
    }

    fn check_limit(&self, id: &str) -> Result<(), VmError> {
        match self.max_live {
            Some(limit) if self.live_count() >= limit => Err(VmError::LimitReached {
                id: id.to_string(),
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Registers a VM whose runtime has already been started.
    ///
    /// If the id is taken the runtime is terminated and `DuplicateId` is
    /// returned.
    pub fn create(&self, spec: VmSpec, runtime: RuntimeHandle) -> Result<VmSnapshot, VmError> {
        if let Err(err) = validate_id(&spec.id).and_then(|_| self.check_limit(&spec.id)) {
            release_runtime(&spec.id, runtime);
            return Err(err);
        }

        match self.records.entry(spec.id.clone()) {
            Entry::Occupied(entry) => {
                let id = entry.key().clone();
                drop(entry);
                release_runtime(&id, runtime);
                Err(VmError::DuplicateId(id))
            }
            Entry::Vacant(entry) => {
                let record = VmRecord::new(spec, runtime);
                let snapshot = record.snapshot();
                entry.insert(record);

                tracing::info!(
                    vm_id = %snapshot.id,
                    kind = %snapshot.kind,
                    profile = %snapshot.profile,
                    "Registered VM"
                );
                Ok(snapshot)
            }
        }
    }

    /// Returns a snapshot of the record for `id`.
    pub fn get(&self, id: &str) -> Result<VmSnapshot, VmError> {
        self.records
            .get(id)
            .map(|entry| entry.value().snapshot())
            .ok_or_else(|| VmError::NotFound(id.to_string()))
    }

    /// Snapshots every record. Order is unspecified.
    pub fn list(&self) -> Vec<VmSnapshot> {
        self.records
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Removes a record. Removing an absent id (including a second removal)
    /// is `NotFound`. A live, unattached VM is terminated first; an attached
    /// VM must be detached or stopped before it can be removed.
    pub fn remove(&self, id: &str) -> Result<VmSnapshot, VmError> {
        let (_, mut record) = self
            .records
            .remove_if(id, |_, record| record.state != VmState::Attached)
            .ok_or_else(|| {
                if self.records.contains_key(id) {
                    VmError::AlreadyAttached(id.to_string())
                } else {
                    VmError::NotFound(id.to_string())
                }
            })?;

        if let Some(runtime) = record.runtime.take() {
            release_runtime(id, runtime);
        }
        tracing::info!(vm_id = %id, "Removed VM record");
        Ok(record.snapshot())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records that are not tombstones.
    pub fn live_count(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.value().state.is_live())
            .count()
    }

    /// Ids of all records that are not tombstones.
    pub fn live_ids(&self) -> Vec<VmId> {
        self.records
            .iter()
            .filter(|entry| entry.value().state.is_live())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Ids of all records currently in `Attached`.
    pub fn attached_ids(&self) -> Vec<VmId> {
        self.records
            .iter()
            .filter(|entry| entry.value().state == VmState::Attached)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Applies an attach or detach transition to the record for `id`.
    ///
    /// Stop and process exit go through [`retire`](Self::retire), which also
    /// releases the runtime.
    pub(crate) fn transition(&self, id: &str, event: Transition) -> Result<VmState, VmError> {
        debug_assert!(matches!(event, Transition::Attach | Transition::Detach));

        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| VmError::NotFound(id.to_string()))?;
        let record = entry.value_mut();

        let next = record
            .state
            .apply(event)
            .map_err(|err| VmError::from_transition(id, record.state, err))?;

        tracing::debug!(vm_id = %id, from = %record.state, to = %next, "VM state transition");
        record.state = next;
        Ok(next)
    }

    /// Moves a live record to `Stopped`, records the reason, and hands back
    /// its runtime so the caller can terminate it outside the lock.
    pub(crate) fn retire(
        &self,
        id: &str,
        reason: StopReason,
    ) -> Result<(VmSnapshot, Option<RuntimeHandle>), VmError> {
        let event = match reason {
            StopReason::Operator => Transition::Stop,
            StopReason::Crashed { .. } => Transition::ProcessExited,
        };

        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| VmError::NotFound(id.to_string()))?;
        let record = entry.value_mut();

        let next = record
            .state
            .apply(event)
            .map_err(|err| VmError::from_transition(id, record.state, err))?;

        tracing::debug!(vm_id = %id, from = %record.state, to = %next, reason = %reason, "VM state transition");
        record.state = next;
        record.stop = Some(StopInfo::now(reason));
        let runtime = record.runtime.take();
        Ok((record.snapshot(), runtime))
    }

    /// Runs `f` against the live runtime of `id` under the record lock.
    pub fn with_runtime<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut dyn RuntimeChannel) -> T,
    ) -> Result<T, VmError> {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| VmError::NotFound(id.to_string()))?;
        let record = entry.value_mut();
        let state = record.state;

        match record.runtime.as_mut() {
            Some(runtime) if state.is_live() => Ok(f(runtime.as_mut())),
            _ => Err(VmError::NotRunning {
                id: id.to_string(),
                state,
            }),
        }
    }

    /// Removes tombstones that stopped more than `grace` ago.
    pub fn purge_stopped(&self, grace: std::time::Duration) -> Vec<VmId> {
        let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
        let now = Local::now();
        let expired = |record: &VmRecord| match record.stop {
            Some(stop) if record.state == VmState::Stopped => now - stop.at >= grace,
            _ => false,
        };

        let candidates: Vec<VmId> = self
            .records
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let purged: Vec<VmId> = candidates
            .into_iter()
            .filter(|id| self.records.remove_if(id, |_, r| expired(r)).is_some())
            .collect();

        if !purged.is_empty() {
            tracing::debug!(count = purged.len(), "Purged VM tombstones");
        }
        purged
    }

    /// Stops every live VM. Used at teardown; failures are logged, not
    /// returned. Returns the number of VMs stopped.
    pub fn shutdown(&self) -> usize {
        let mut stopped = 0;
        for id in self.live_ids() {
            match self.retire(&id, StopReason::Operator) {
                Ok((_, runtime)) => {
                    if let Some(runtime) = runtime {
                        release_runtime(&id, runtime);
                    }
                    stopped += 1;
                }
                Err(err) => tracing::warn!(vm_id = %id, error = %err, "Could not stop VM at shutdown"),
            }
        }

        if stopped > 0 {
            tracing::info!(count = stopped, "Stopped all live VMs");
        }
        stopped
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminates a runtime, logging the outcome.
pub(crate) fn release_runtime(id: &str, mut runtime: RuntimeHandle) -> Option<i32> {
    match runtime.terminate() {
        Ok(code) => {
            tracing::debug!(vm_id = %id, exit_code = ?code, "Runtime terminated");
            code
        }
        Err(err) => {
            tracing::warn!(vm_id = %id, error = %err, "Failed to terminate runtime");
            None
        }
    }
}
