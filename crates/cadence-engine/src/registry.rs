//! Registry of live TDD cycles for one workflow instance.
//!
//! # Locking
//!
//! The map sits behind an `RwLock`; each cycle sits behind its own `Mutex`.
//! Commands for one story clone the cycle's `Arc` under a brief read lock and
//! then hold only that cycle's mutex, so different stories never wait on each
//! other while one story's commands are strictly serialized.
//!
//! Lock order is map → cycles in story-id order. Nothing that holds a cycle
//! mutex ever waits on the map, and register/unregister take the write lock,
//! so aggregate queries (taken under the read lock) never see a cycle
//! mid-registration or mid-removal.

use std::collections::BTreeMap;
use std::sync::{
    Arc, LazyLock, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::state::TddState;
use crate::tdd::{TddCycle, TddStatus};

static STORY_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("story id pattern is valid")
});

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A live cycle already exists for the story.
    #[error("Cycle already registered for story: {0}")]
    DuplicateCycle(String),

    /// No live cycle for the story.
    #[error("No cycle registered for story: {0}")]
    CycleNotFound(String),

    /// Story id is empty or contains disallowed characters.
    #[error("Invalid story id: {0:?}")]
    InvalidStoryId(String),
}

/// Aggregate facts over a consistent snapshot of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    /// Number of live cycles.
    pub count: usize,
    /// Story ids, sorted.
    pub ids: Vec<String>,
    /// Whether every live cycle is DONE (vacuously true when empty).
    pub all_terminal: bool,
    /// Story ids whose cycle is not DONE, sorted.
    pub active: Vec<String>,
}

impl RegistrySummary {
    /// Summary of an empty registry.
    pub fn empty() -> Self {
        Self {
            all_terminal: true,
            ..Self::default()
        }
    }

    /// Build a summary from `(story_id, state)` pairs.
    pub fn from_states<'a>(states: impl IntoIterator<Item = (&'a str, TddState)>) -> Self {
        let mut summary = Self::empty();
        for (story_id, state) in states {
            summary.count += 1;
            summary.ids.push(story_id.to_string());
            if !state.is_terminal() {
                summary.active.push(story_id.to_string());
            }
        }
        summary.ids.sort();
        summary.active.sort();
        summary.all_terminal = summary.active.is_empty();
        summary
    }
}

type SharedCycle = Arc<Mutex<TddCycle>>;

/// Concurrency-safe map from story id to cycle.
#[derive(Debug, Default)]
pub struct CycleRegistry {
    cycles: RwLock<BTreeMap<String, SharedCycle>>,
}

impl CycleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a story id.
    pub fn validate_story_id(story_id: &str) -> Result<(), RegistryError> {
        if STORY_ID.is_match(story_id) {
            Ok(())
        } else {
            Err(RegistryError::InvalidStoryId(story_id.to_string()))
        }
    }

    /// Register a new cycle at DESIGN and return its cycle id.
    pub fn register(&self, story_id: &str) -> Result<Uuid, RegistryError> {
        Self::validate_story_id(story_id)?;
        let mut cycles = self.write();
        if cycles.contains_key(story_id) {
            return Err(RegistryError::DuplicateCycle(story_id.to_string()));
        }
        let cycle = TddCycle::new(story_id);
        let cycle_id = cycle.cycle_id;
        cycles.insert(story_id.to_string(), Arc::new(Mutex::new(cycle)));
        debug!(story_id, %cycle_id, "Registered TDD cycle");
        Ok(cycle_id)
    }

    /// Register cycles for every story, or none of them.
    pub fn register_all(&self, story_ids: &[String]) -> Result<Vec<(String, Uuid)>, RegistryError> {
        for story_id in story_ids {
            Self::validate_story_id(story_id)?;
        }
        let mut cycles = self.write();
        for (index, story_id) in story_ids.iter().enumerate() {
            if cycles.contains_key(story_id) || story_ids[..index].contains(story_id) {
                return Err(RegistryError::DuplicateCycle(story_id.clone()));
            }
        }

        let mut registered = Vec::with_capacity(story_ids.len());
        for story_id in story_ids {
            let cycle = TddCycle::new(story_id.as_str());
            registered.push((story_id.clone(), cycle.cycle_id));
            cycles.insert(story_id.clone(), Arc::new(Mutex::new(cycle)));
        }
        debug!(count = registered.len(), "Registered TDD cycles");
        Ok(registered)
    }

    /// Insert an existing cycle, e.g. when restoring a snapshot.
    pub fn insert(&self, cycle: TddCycle) -> Result<(), RegistryError> {
        Self::validate_story_id(&cycle.story_id)?;
        let mut cycles = self.write();
        if cycles.contains_key(&cycle.story_id) {
            return Err(RegistryError::DuplicateCycle(cycle.story_id));
        }
        cycles.insert(cycle.story_id.clone(), Arc::new(Mutex::new(cycle)));
        Ok(())
    }

    /// Remove a cycle and return its final state.
    ///
    /// Waits for any in-flight command on the same story to finish.
    pub fn unregister(&self, story_id: &str) -> Result<TddCycle, RegistryError> {
        let mut cycles = self.write();
        let shared = cycles
            .remove(story_id)
            .ok_or_else(|| RegistryError::CycleNotFound(story_id.to_string()))?;
        let cycle = lock(&shared).clone();
        debug!(story_id, state = %cycle.state, "Unregistered TDD cycle");
        Ok(cycle)
    }

    /// Remove every cycle satisfying `predicate`, in story-id order.
    pub fn unregister_where(&self, mut predicate: impl FnMut(&TddCycle) -> bool) -> Vec<TddCycle> {
        let mut cycles = self.write();
        let mut removed = Vec::new();
        cycles.retain(|_, shared| {
            let cycle = lock(shared);
            if predicate(&cycle) {
                removed.push(cycle.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Copy of the cycle for `story_id`.
    pub fn get(&self, story_id: &str) -> Result<TddCycle, RegistryError> {
        let shared = self.shared(story_id)?;
        let cycle = lock(&shared).clone();
        Ok(cycle)
    }

    /// Status of the cycle for `story_id`.
    pub fn status(&self, story_id: &str) -> Result<TddStatus, RegistryError> {
        let shared = self.shared(story_id)?;
        let status = lock(&shared).status();
        Ok(status)
    }

    /// Run `f` with exclusive access to one story's cycle.
    ///
    /// Only that story is serialized; other stories proceed concurrently.
    pub fn with_cycle<R>(
        &self,
        story_id: &str,
        f: impl FnOnce(&mut TddCycle) -> R,
    ) -> Result<R, RegistryError> {
        let shared = self.shared(story_id)?;
        let mut cycle = lock(&shared);
        Ok(f(&mut cycle))
    }

    /// Run `f` with every cycle locked, in story-id order.
    ///
    /// Registration and removal wait until `f` returns, so `f` sees and may
    /// mutate the complete set atomically.
    pub fn with_all<R>(&self, f: impl FnOnce(&mut [MutexGuard<'_, TddCycle>]) -> R) -> R {
        let cycles = self.read();
        let mut guards: Vec<MutexGuard<'_, TddCycle>> = cycles.values().map(|c| lock(c)).collect();
        f(&mut guards)
    }

    /// Aggregate facts over a consistent snapshot.
    pub fn summary(&self) -> RegistrySummary {
        let cycles = self.read();
        let states: Vec<(&str, TddState)> = cycles
            .iter()
            .map(|(story_id, shared)| (story_id.as_str(), lock(shared).state))
            .collect();
        RegistrySummary::from_states(states)
    }

    /// Copies of every cycle, in story-id order.
    pub fn cycles(&self) -> Vec<TddCycle> {
        let cycles = self.read();
        cycles.values().map(|shared| lock(shared).clone()).collect()
    }

    /// Whether a live cycle exists for `story_id`.
    pub fn contains(&self, story_id: &str) -> bool {
        self.read().contains_key(story_id)
    }

    /// Number of live cycles.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the registry holds no cycles.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn shared(&self, story_id: &str) -> Result<SharedCycle, RegistryError> {
        self.read()
            .get(story_id)
            .cloned()
            .ok_or_else(|| RegistryError::CycleNotFound(story_id.to_string()))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, SharedCycle>> {
        self.cycles.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, SharedCycle>> {
        self.cycles.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Cycle mutations are single assignments after validation, so a poisoned
/// cycle still holds a consistent value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
