//! Process-wide registry of named counter sets, read by external pollers.
//!
//! A `CounterSet` maps keys to either a plain integer that callers bump with
//! `add`, or a live object (`Exportable`) whose value is computed on every
//! snapshot. Rate counters are published the second way, so polling never
//! needs a push from the request path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{MetricsError, Result};

/// Name of the set listing every instrumented endpoint, for discovery.
pub const DISCOVERY_SET: &str = "exphttp";

/// Something whose current value can be rendered for a poller.
pub trait Exportable: Send + Sync {
    fn export(&self) -> Value;
}

/// One entry of a `CounterSet`.
#[derive(Clone)]
pub enum Var {
    Int(Arc<AtomicI64>),
    Exported(Arc<dyn Exportable>),
}

impl Var {
    fn export(&self) -> Value {
        match self {
            Var::Int(v) => Value::from(v.load(Ordering::Relaxed)),
            Var::Exported(e) => e.export(),
        }
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Int(v) => write!(f, "Int({})", v.load(Ordering::Relaxed)),
            Var::Exported(e) => write!(f, "Exported({})", e.export()),
        }
    }
}

// ─── CounterSet ──────────────────────────────────────────────────

/// Named group of counters. Reads and increments of existing keys only take
/// the shared lock; a new key takes the write lock once.
pub struct CounterSet {
    name: String,
    vars: RwLock<BTreeMap<String, Var>>,
}

impl CounterSet {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            vars: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `delta` to the integer at `key`, creating it at zero first.
    ///
    /// If `key` currently holds an exported object it is replaced by a fresh
    /// integer, the same as `expvar.Map.Add` does with a non-integer value.
    pub fn add(&self, key: &str, delta: i64) {
        if let Some(Var::Int(v)) = self.vars.read().get(key) {
            v.fetch_add(delta, Ordering::Relaxed);
            return;
        }

        let mut vars = self.vars.write();
        match vars.get(key) {
            Some(Var::Int(v)) => {
                v.fetch_add(delta, Ordering::Relaxed);
            }
            _ => {
                vars.insert(key.to_owned(), Var::Int(Arc::new(AtomicI64::new(delta))));
            }
        }
    }

    /// Publish `value` under `key`, returning whatever it replaced.
    pub fn set(&self, key: &str, value: Arc<dyn Exportable>) -> Option<Var> {
        self.vars
            .write()
            .insert(key.to_owned(), Var::Exported(value))
    }

    pub fn get(&self, key: &str) -> Option<Var> {
        self.vars.read().get(key).cloned()
    }

    /// Current value of an integer key; `None` if absent or not an integer.
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.vars.read().get(key) {
            Some(Var::Int(v)) => Some(v.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.vars.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.read().is_empty()
    }

    /// Every key rendered to JSON. Values are read one at a time, so the
    /// result is not a point-in-time snapshot across keys.
    pub fn snapshot(&self) -> Value {
        let vars: Vec<(String, Var)> = self
            .vars
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // exported objects may take their own locks; don't hold ours meanwhile
        let map: Map<String, Value> = vars.into_iter().map(|(k, v)| (k, v.export())).collect();
        Value::Object(map)
    }
}

impl fmt::Debug for CounterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterSet")
            .field("name", &self.name)
            .field("vars", &self.snapshot())
            .finish()
    }
}

// ─── Registry ────────────────────────────────────────────────────

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// Collection of uniquely named counter sets.
#[derive(Debug, Default)]
pub struct Registry {
    sets: RwLock<BTreeMap<String, Arc<CounterSet>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Create and publish an empty set called `name`.
    pub fn new_named_set(&self, name: &str) -> Result<Arc<CounterSet>> {
        let mut sets = self.sets.write();
        if sets.contains_key(name) {
            return Err(MetricsError::DuplicateName(name.to_owned()));
        }
        let set = Arc::new(CounterSet::new(name));
        sets.insert(name.to_owned(), set.clone());
        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CounterSet>> {
        self.sets.read().get(name).cloned()
    }

    /// The discovery set, created on first use.
    pub fn discovery(&self) -> Arc<CounterSet> {
        if let Some(set) = self.get(DISCOVERY_SET) {
            return set;
        }
        self.sets
            .write()
            .entry(DISCOVERY_SET.to_owned())
            .or_insert_with(|| Arc::new(CounterSet::new(DISCOVERY_SET)))
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.sets.read().keys().cloned().collect()
    }

    /// `{ set name: { key: value } }` for every registered set.
    pub fn snapshot(&self) -> Value {
        let sets: Vec<Arc<CounterSet>> = self.sets.read().values().cloned().collect();
        let map: Map<String, Value> = sets
            .iter()
            .map(|s| (s.name().to_owned(), s.snapshot()))
            .collect();
        Value::Object(map)
    }
}
