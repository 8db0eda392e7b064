//! Environment-driven fault injection for integration testing.
//!
//! Conditions are armed through environment variables at startup, or from
//! tests through [`Debugger::set`]. Production paths consult the registry
//! with [`check`]; an unarmed condition costs one read lock.

use log::{debug, error};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StopCond {
    /// Override the snapshot frequency at runtime.
    RaftSnapFreq,
    /// Sleep before connecting each committed block, in milliseconds.
    ChainConnectSleep,
}

impl StopCond {
    fn env_name(self) -> &'static str {
        match self {
            StopCond::RaftSnapFreq => "DEBUG_RAFT_SNAP_FREQ",
            StopCond::ChainConnectSleep => "DEBUG_CHAIN_CONNECT_SLEEP",
        }
    }
}

const ALL_CONDS: [StopCond; 2] = [StopCond::RaftSnapFreq, StopCond::ChainConnectSleep];

pub struct Debugger {
    conds: RwLock<HashMap<StopCond, i64>>,
}

pub static TEST_DEBUGGER: Lazy<Debugger> = Lazy::new(Debugger::from_env);

impl Debugger {
    fn from_env() -> Self {
        let dbg = Debugger {
            conds: RwLock::new(HashMap::new()),
        };

        for cond in ALL_CONDS {
            let env = match std::env::var(cond.env_name()) {
                Ok(v) if !v.is_empty() => v,
                _ => continue,
            };
            match env.parse::<i64>() {
                Ok(val) => {
                    debug!("debug condition {:?} armed with {}", cond, val);
                    dbg.set(cond, val);
                }
                Err(e) => {
                    error!("{} must be an integer: {}", cond.env_name(), e);
                }
            }
        }

        dbg
    }

    pub fn set(&self, cond: StopCond, value: i64) {
        self.conds.write().unwrap().insert(cond, value);
    }

    pub fn unset(&self, cond: StopCond) {
        self.conds.write().unwrap().remove(&cond);
    }

    pub fn value(&self, cond: StopCond) -> Option<i64> {
        self.conds.read().unwrap().get(&cond).copied()
    }
}

/// Runs `f` with the armed value when `cond` is set. No-op otherwise.
pub fn check<F: FnOnce(i64)>(cond: StopCond, f: F) {
    if let Some(v) = TEST_DEBUGGER.value(cond) {
        f(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_condition_is_noop() {
        let dbg = Debugger {
            conds: RwLock::new(HashMap::new()),
        };
        assert_eq!(dbg.value(StopCond::RaftSnapFreq), None);
    }

    #[test]
    fn set_and_unset() {
        let dbg = Debugger {
            conds: RwLock::new(HashMap::new()),
        };
        dbg.set(StopCond::ChainConnectSleep, 25);
        assert_eq!(dbg.value(StopCond::ChainConnectSleep), Some(25));
        dbg.unset(StopCond::ChainConnectSleep);
        assert_eq!(dbg.value(StopCond::ChainConnectSleep), None);
    }
}
