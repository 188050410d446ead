//! Shared state board
//!
//! Every service task reads and writes its state through the board. Changes
//! are published twice: as [`StateChange`] messages for observers, and as a
//! generation counter that tasks wait on. The mutex is never held across an
//! await.

use super::state::ServiceState;
use crate::compose::topology::ServiceId;
use crate::error::{BerthError, Result};
use crate::runtime::RuntimeHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Capacity of the change channel; slow observers see `Lagged`
const EVENT_CAPACITY: usize = 256;

/// Transitions kept in the board's history
pub const HISTORY_LIMIT: usize = 64;

/// A state transition of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub service: String,
    pub from: ServiceState,
    pub to: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Current status of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    /// Reason of the last transition, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Restarts performed so far
    #[serde(default)]
    pub attempts: u32,
    /// Failed with no restart left
    #[serde(default)]
    pub exhausted: bool,
    /// Pending behind a dependency that will not come back
    #[serde(default)]
    pub blocked: bool,
    /// Stop ran out of time
    #[serde(default)]
    pub stop_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<RuntimeHandle>,
    pub since: DateTime<Utc>,
}

impl ServiceStatus {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ServiceState::Pending,
            detail: None,
            attempts: 0,
            exhausted: false,
            blocked: false,
            stop_failed: false,
            handle: None,
            since: Utc::now(),
        }
    }

    /// Nothing more will happen to this service until shutdown
    pub fn is_settled(&self) -> bool {
        match self.state {
            ServiceState::Healthy | ServiceState::Stopped => true,
            ServiceState::Failed => self.exhausted,
            ServiceState::Pending => self.blocked,
            _ => false,
        }
    }
}

/// Slots of every service, guarded by the board's mutex
#[derive(Debug)]
pub struct Slots {
    slots: Vec<ServiceStatus>,
    halted: bool,
    changes: Vec<StateChange>,
    /// Something other than a state changed since the last publish
    dirty: bool,
    history: VecDeque<StateChange>,
}

impl Slots {
    pub fn get(&self, id: ServiceId) -> &ServiceStatus {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: ServiceId) -> &mut ServiceStatus {
        self.dirty = true;
        &mut self.slots[id.index()]
    }

    pub fn state(&self, id: ServiceId) -> ServiceState {
        self.slots[id.index()].state
    }

    /// Shutdown has begun; no service may start any more
    pub fn halted(&self) -> bool {
        self.halted
    }

    fn halt(&mut self) {
        if !self.halted {
            self.halted = true;
            self.dirty = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceStatus> {
        self.slots.iter()
    }

    /// Move a service to a new state, validating the transition
    pub fn set(&mut self, id: ServiceId, to: ServiceState, detail: Option<String>) -> Result<()> {
        let slot = &mut self.slots[id.index()];
        let from = slot.state;
        if !from.can_transition(to) {
            return Err(BerthError::InvalidTransition {
                service: slot.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.apply(id, to, detail);
        Ok(())
    }

    /// Move a service to a new state without validation
    pub fn force(&mut self, id: ServiceId, to: ServiceState, detail: Option<String>) {
        self.apply(id, to, detail);
    }

    fn apply(&mut self, id: ServiceId, to: ServiceState, detail: Option<String>) {
        let slot = &mut self.slots[id.index()];
        let from = slot.state;
        let at = Utc::now();

        slot.state = to;
        slot.detail = detail.clone();
        slot.since = at;
        if to != ServiceState::Pending {
            slot.blocked = false;
        }

        match &detail {
            Some(reason) => info!("{}: {} -> {} ({})", slot.name, from, to, reason),
            None => info!("{}: {} -> {}", slot.name, from, to),
        }

        let change = StateChange {
            service: slot.name.clone(),
            from,
            to,
            detail,
            at,
        };
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(change.clone());
        self.changes.push(change);
    }
}

/// State board shared by the supervisor and its tasks
pub struct StateBoard {
    slots: Mutex<Slots>,
    generation: watch::Sender<u64>,
    events: broadcast::Sender<StateChange>,
}

impl StateBoard {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let (generation, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            slots: Mutex::new(Slots {
                slots: names.into_iter().map(ServiceStatus::new).collect(),
                halted: false,
                changes: Vec::new(),
                dirty: false,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            }),
            generation,
            events,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| BerthError::Lock("Failed to lock state board".to_string()))
    }

    /// Run `f` under the lock, then publish whatever it changed
    pub fn update<T>(&self, f: impl FnOnce(&mut Slots) -> T) -> Result<T> {
        let (result, changes, dirty) = {
            let mut slots = self.lock()?;
            let result = f(&mut slots);
            let dirty = std::mem::replace(&mut slots.dirty, false);
            (result, std::mem::take(&mut slots.changes), dirty)
        };

        if dirty || !changes.is_empty() {
            self.publish(changes);
        }
        Ok(result)
    }

    /// Waiters only wake when something actually changed
    fn publish(&self, changes: Vec<StateChange>) {
        for change in changes {
            // no receivers is fine
            let _ = self.events.send(change);
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Validated transition of one service
    pub fn transition(&self, id: ServiceId, to: ServiceState, detail: Option<String>) -> Result<()> {
        self.update(|slots| slots.set(id, to, detail))?
    }

    /// Read-only view
    pub fn read<T>(&self, f: impl FnOnce(&Slots) -> T) -> Result<T> {
        let slots = self.lock()?;
        Ok(f(&slots))
    }

    pub fn state(&self, id: ServiceId) -> Result<ServiceState> {
        self.read(|slots| slots.state(id))
    }

    pub fn snapshot(&self) -> Result<Vec<ServiceStatus>> {
        self.read(|slots| slots.slots.clone())
    }

    /// The most recent transitions, oldest first
    pub fn history(&self) -> Result<Vec<StateChange>> {
        self.read(|slots| slots.history.iter().cloned().collect())
    }

    /// Forbid further starts and wake every waiter
    pub fn halt(&self) -> Result<()> {
        self.update(|slots| slots.halt())
    }

    /// Wait until `check` returns a value. `check` runs under the lock, may
    /// change slots, and runs again after every published change.
    pub async fn wait_for<T>(&self, mut check: impl FnMut(&mut Slots) -> Option<T>) -> Result<T> {
        let mut generation = self.generation.subscribe();
        loop {
            if let Some(value) = self.update(&mut check)? {
                return Ok(value);
            }
            if generation.changed().await.is_err() {
                return Err(BerthError::Internal("state board closed".to_string()));
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_invalid_transition_is_rejected() {
        let board = StateBoard::new(["db"]);
        let err = board
            .transition(ServiceId(0), ServiceState::Healthy, None)
            .unwrap_err();
        assert!(matches!(err, BerthError::InvalidTransition { .. }));
        assert_eq!(board.state(ServiceId(0)).unwrap(), ServiceState::Pending);
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let board = StateBoard::new(["db"]);
        let mut events = board.subscribe();

        board
            .transition(ServiceId(0), ServiceState::Starting, None)
            .unwrap();
        board
            .transition(ServiceId(0), ServiceState::Healthy, Some("probe".to_string()))
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!((first.from, first.to), (ServiceState::Pending, ServiceState::Starting));
        let second = events.recv().await.unwrap();
        assert_eq!(second.to, ServiceState::Healthy);
        assert_eq!(second.detail.as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_change() {
        let board = Arc::new(StateBoard::new(["db", "web"]));

        let waiter = {
            let board = board.clone();
            tokio::spawn(async move {
                board
                    .wait_for(|slots| {
                        (slots.state(ServiceId(0)) == ServiceState::Healthy).then_some(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        board
            .transition(ServiceId(0), ServiceState::Starting, None)
            .unwrap();
        board
            .transition(ServiceId(0), ServiceState::Healthy, None)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_waiter_sleeps() {
        let board = Arc::new(StateBoard::new(["db"]));
        let checks = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let waiter = {
            let board = board.clone();
            let checks = checks.clone();
            tokio::spawn(async move {
                board
                    .wait_for(|_| {
                        checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        None::<()>
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let idle = checks.load(std::sync::atomic::Ordering::SeqCst);
        assert!(idle <= 2, "check ran {} times on an idle board", idle);

        // a real change still wakes it
        board
            .transition(ServiceId(0), ServiceState::Starting, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(checks.load(std::sync::atomic::Ordering::SeqCst) > idle);

        // reading without changing anything does not
        let before = checks.load(std::sync::atomic::Ordering::SeqCst);
        board.update(|slots| slots.get(ServiceId(0)).attempts).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(checks.load(std::sync::atomic::Ordering::SeqCst), before);

        waiter.abort();
    }

    #[test]
    fn test_history_is_bounded() {
        let board = StateBoard::new(["db"]);
        board
            .transition(ServiceId(0), ServiceState::Starting, None)
            .unwrap();
        for _ in 0..HISTORY_LIMIT {
            board
                .transition(ServiceId(0), ServiceState::Failed, Some("crash".to_string()))
                .unwrap();
            board
                .transition(ServiceId(0), ServiceState::Starting, None)
                .unwrap();
        }

        let history = board.history().unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        // the first Pending -> Starting fell off
        assert!(history.iter().all(|c| c.from != ServiceState::Pending));
        assert_eq!(history.last().unwrap().to, ServiceState::Starting);
    }

    #[test]
    fn test_settled_states() {
        let mut status = ServiceStatus::new("db");
        assert!(!status.is_settled());
        status.blocked = true;
        assert!(status.is_settled());

        status.blocked = false;
        status.state = ServiceState::Failed;
        assert!(!status.is_settled());
        status.exhausted = true;
        assert!(status.is_settled());
    }
}
