//! Agent registry: identity, capability set, liveness clock
//!
//! Liveness is always computed from the monotonic clock distance to the last
//! heartbeat; it is never a stored flag an outside caller has to toggle. The
//! registry itself is not thread-safe — the fabric serializes every mutation
//! behind one mutex with small critical sections.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, SynapseError};
use crate::fabric::message::{AgentId, MessageType};

/// Snapshot of one agent's registration and counters
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub version: String,
    /// Message types the agent declared it can handle
    pub capabilities: HashSet<MessageType>,
    /// Monotonic nanoseconds of the last observed heartbeat
    pub last_heartbeat_nanos: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Running mean of handler processing time for messages delivered to
    /// this agent, in microseconds
    pub average_processing_time_us: f64,
}

struct AgentEntry {
    info: AgentInfo,
    handled: u64,
    /// Set once the disconnect notification for the current outage has fired
    notified_disconnect: bool,
    /// Consecutive sweeps this agent has been past its timeout
    disconnect_sweeps: u32,
}

/// Result of one liveness sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Agents that crossed the timeout since the last sweep
    pub newly_disconnected: Vec<AgentId>,
    /// Agents whose registry entries were reclaimed this sweep
    pub reaped: Vec<AgentId>,
}

/// Registry of agents keyed by id
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentEntry>,
    timeout_nanos: u64,
    reap_periods: u32,
}

impl AgentRegistry {
    pub fn new(timeout_nanos: u64, reap_periods: u32) -> Self {
        Self {
            agents: HashMap::new(),
            timeout_nanos,
            reap_periods,
        }
    }

    /// Register or re-register an agent. Re-registration refreshes name,
    /// version and capabilities and resets the liveness clock; counters
    /// survive.
    pub fn register(
        &mut self,
        id: AgentId,
        name: &str,
        version: &str,
        capabilities: &[MessageType],
        now_nanos: u64,
    ) -> Result<()> {
        if !id.is_registrable() {
            return Err(SynapseError::config(format!(
                "agent id {:#010x} is a reserved sentinel",
                id.raw()
            )));
        }

        let capabilities: HashSet<MessageType> = capabilities.iter().copied().collect();
        match self.agents.get_mut(&id) {
            Some(entry) => {
                entry.info.name = name.to_owned();
                entry.info.version = version.to_owned();
                entry.info.capabilities = capabilities;
                entry.info.last_heartbeat_nanos = now_nanos;
                entry.notified_disconnect = false;
                entry.disconnect_sweeps = 0;
            }
            None => {
                self.agents.insert(
                    id,
                    AgentEntry {
                        info: AgentInfo {
                            id,
                            name: name.to_owned(),
                            version: version.to_owned(),
                            capabilities,
                            last_heartbeat_nanos: now_nanos,
                            messages_sent: 0,
                            messages_received: 0,
                            average_processing_time_us: 0.0,
                        },
                        handled: 0,
                        notified_disconnect: false,
                        disconnect_sweeps: 0,
                    },
                );
            }
        }
        Ok(())
    }

    /// Remove an agent; returns whether it was present
    pub fn unregister(&mut self, id: AgentId) -> bool {
        self.agents.remove(&id).is_some()
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.agents.contains_key(&id)
    }

    /// Refresh the liveness clock; a disconnected agent becomes active again
    pub fn mark_heartbeat(&mut self, id: AgentId, now_nanos: u64) {
        if let Some(entry) = self.agents.get_mut(&id) {
            entry.info.last_heartbeat_nanos = now_nanos;
            entry.notified_disconnect = false;
            entry.disconnect_sweeps = 0;
        }
    }

    /// True iff the agent is registered and inside its liveness window
    pub fn is_active(&self, id: AgentId, now_nanos: u64) -> bool {
        self.agents
            .get(&id)
            .map(|entry| now_nanos.saturating_sub(entry.info.last_heartbeat_nanos) < self.timeout_nanos)
            .unwrap_or(false)
    }

    /// Snapshot of every currently live agent
    pub fn active_snapshot(&self, now_nanos: u64) -> Vec<AgentInfo> {
        let mut active: Vec<AgentInfo> = self
            .agents
            .values()
            .filter(|entry| {
                now_nanos.saturating_sub(entry.info.last_heartbeat_nanos) < self.timeout_nanos
            })
            .map(|entry| entry.info.clone())
            .collect();
        active.sort_by_key(|info| info.id);
        active
    }

    /// Ids of every live agent
    pub fn active_ids(&self, now_nanos: u64) -> Vec<AgentId> {
        self.active_snapshot(now_nanos)
            .into_iter()
            .map(|info| info.id)
            .collect()
    }

    pub fn record_sent(&mut self, id: AgentId) {
        if let Some(entry) = self.agents.get_mut(&id) {
            entry.info.messages_sent += 1;
        }
    }

    /// Count a delivery and fold the handler latency into the running mean
    pub fn record_received(&mut self, id: AgentId, processing_us: f64) {
        if let Some(entry) = self.agents.get_mut(&id) {
            entry.info.messages_received += 1;
            entry.handled += 1;
            let n = entry.handled as f64;
            entry.info.average_processing_time_us +=
                (processing_us - entry.info.average_processing_time_us) / n;
        }
    }

    /// Sweep for timeouts: report agents that newly crossed the timeout and
    /// reclaim entries that stayed disconnected for the configured number of
    /// sweep periods.
    pub fn sweep(&mut self, now_nanos: u64) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for (id, entry) in &mut self.agents {
            let timed_out =
                now_nanos.saturating_sub(entry.info.last_heartbeat_nanos) >= self.timeout_nanos;
            if timed_out {
                if !entry.notified_disconnect {
                    entry.notified_disconnect = true;
                    outcome.newly_disconnected.push(*id);
                }
                entry.disconnect_sweeps += 1;
                if entry.disconnect_sweeps > self.reap_periods {
                    outcome.reaped.push(*id);
                }
            }
        }

        for id in &outcome.reaped {
            self.agents.remove(id);
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(5 * SEC, 3)
    }

    #[test]
    fn test_register_and_liveness() {
        let mut reg = registry();
        reg.register(AgentId(1), "architect", "1.0", &[], 0).unwrap();
        assert!(reg.is_active(AgentId(1), 0));
        assert!(reg.is_active(AgentId(1), 4 * SEC));
        assert!(!reg.is_active(AgentId(1), 5 * SEC));

        reg.mark_heartbeat(AgentId(1), 5 * SEC);
        assert!(reg.is_active(AgentId(1), 9 * SEC));
    }

    #[test]
    fn test_sentinels_rejected() {
        let mut reg = registry();
        assert!(reg.register(AgentId::BROADCAST, "x", "1", &[], 0).is_err());
        assert!(reg.register(AgentId::UNKNOWN, "x", "1", &[], 0).is_err());
    }

    #[test]
    fn test_reregistration_keeps_counters() {
        let mut reg = registry();
        reg.register(AgentId(2), "sim", "1.0", &[], 0).unwrap();
        reg.record_sent(AgentId(2));
        reg.record_sent(AgentId(2));
        reg.register(AgentId(2), "sim", "1.1", &[MessageType::CellUpdate], SEC)
            .unwrap();

        let snapshot = reg.active_snapshot(SEC);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].version, "1.1");
        assert_eq!(snapshot[0].messages_sent, 2);
        assert!(snapshot[0].capabilities.contains(&MessageType::CellUpdate));
    }

    #[test]
    fn test_sweep_notifies_once_then_reaps() {
        let mut reg = registry();
        reg.register(AgentId(3), "ux", "1.0", &[], 0).unwrap();

        let outcome = reg.sweep(6 * SEC);
        assert_eq!(outcome.newly_disconnected, vec![AgentId(3)]);
        assert!(outcome.reaped.is_empty());

        // Subsequent sweeps stay quiet until the reap threshold passes.
        let outcome = reg.sweep(7 * SEC);
        assert!(outcome.newly_disconnected.is_empty());
        let outcome = reg.sweep(8 * SEC);
        assert!(outcome.newly_disconnected.is_empty());
        let outcome = reg.sweep(9 * SEC);
        assert_eq!(outcome.reaped, vec![AgentId(3)]);
        assert!(!reg.contains(AgentId(3)));
    }

    #[test]
    fn test_processing_time_running_mean() {
        let mut reg = registry();
        reg.register(AgentId(4), "integ", "1.0", &[], 0).unwrap();
        reg.record_received(AgentId(4), 10.0);
        reg.record_received(AgentId(4), 20.0);
        let snapshot = reg.active_snapshot(0);
        assert!((snapshot[0].average_processing_time_us - 15.0).abs() < 1e-9);
        assert_eq!(snapshot[0].messages_received, 2);
    }
}
