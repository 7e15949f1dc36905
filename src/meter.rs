use crate::attributes::{Attributes, Compiled, History};
use crate::provider::{Contract, Supply};
use serde_derive::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterStatus {
    #[default]
    Loading,
    Ready,
    Error,
}

impl fmt::Display for MeterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MeterStatus::Loading => "loading",
            MeterStatus::Ready => "ready",
            MeterStatus::Error => "error",
        })
    }
}

/// Everything the presentation layer may read about one meter
#[derive(Debug, Clone, Default)]
pub struct MeterState {
    pub status: MeterStatus,
    pub attributes: Attributes,
    pub history: History,
    pub supplies: Vec<Supply>,
    pub contracts: Vec<Contract>,
}

fn read(state: &RwLock<MeterState>) -> RwLockReadGuard<'_, MeterState> {
    state.read().unwrap_or_else(|e| e.into_inner())
}

fn write(state: &RwLock<MeterState>) -> RwLockWriteGuard<'_, MeterState> {
    state.write().unwrap_or_else(|e| e.into_inner())
}

/// Writer side, owned by the meter's coordinator
#[derive(Debug)]
pub struct MeterHandle {
    cups: String,
    scups: String,
    state: Arc<RwLock<MeterState>>,
}

impl MeterHandle {
    pub fn new(cups: &str, scups: &str) -> Self {
        Self {
            cups: cups.to_ascii_uppercase(),
            scups: scups.to_ascii_uppercase(),
            state: Arc::new(RwLock::new(MeterState::default())),
        }
    }

    pub fn cups(&self) -> &str {
        &self.cups
    }

    pub fn scups(&self) -> &str {
        &self.scups
    }

    pub fn view(&self) -> MeterView {
        MeterView {
            cups: self.cups.clone(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn status(&self) -> MeterStatus {
        read(&self.state).status
    }

    pub fn set_status(&self, status: MeterStatus) {
        write(&self.state).status = status;
    }

    /// Publishes a freshly compiled summary and marks the meter ready
    pub fn publish(&self, compiled: Compiled, supplies: &[Supply], contracts: &[Contract]) {
        let mut state = write(&self.state);
        state.attributes = compiled.attributes;
        state.history = compiled.history;
        state.supplies = supplies.to_vec();
        state.contracts = contracts.to_vec();
        state.status = MeterStatus::Ready;
    }
}

/// Read-only accessor over a meter's state
#[derive(Debug, Clone)]
pub struct MeterView {
    cups: String,
    state: Arc<RwLock<MeterState>>,
}

impl MeterView {
    pub fn cups(&self) -> &str {
        &self.cups
    }

    pub fn status(&self) -> MeterStatus {
        read(&self.state).status
    }

    pub fn attributes(&self) -> Attributes {
        read(&self.state).attributes.clone()
    }

    /// Runs `f` against the current state without copying it
    pub fn with_state<T>(&self, f: impl FnOnce(&MeterState) -> T) -> T {
        f(&read(&self.state))
    }
}

/// Views of every configured meter keyed by upper-case meter code
#[derive(Debug, Clone, Default)]
pub struct MeterRegistry {
    meters: Arc<RwLock<HashMap<String, MeterView>>>,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: &MeterHandle) {
        self.meters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.scups().to_string(), handle.view());
    }

    pub fn get(&self, scups: &str) -> Option<MeterView> {
        self.meters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&scups.to_ascii_uppercase())
            .cloned()
    }

    pub fn contains(&self, scups: &str) -> bool {
        self.get(scups).is_some()
    }

    /// True when some meter already tracks the full identifier `cups`
    pub fn is_configured(&self, cups: &str) -> bool {
        self.meters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|v| v.cups().eq_ignore_ascii_case(cups))
    }

    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .meters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        codes.sort();
        codes
    }
}
