//! Agent communication fabric
//!
//! Routes fixed-size binary messages between registered agents over
//! per-direction SPSC rings, with a bounded priority path for messages whose
//! loss is unacceptable, per-type handler dispatch, heartbeat-driven
//! liveness, and a discovery protocol.
//!
//! ## Threading
//!
//! Three workers run for the fabric's lifetime:
//!
//! - **dispatch** drains the priority list, then every agent-pair queue in
//!   round-robin, invoking the handler registered for each message type
//! - **heartbeat** emits a heartbeat from the local agent every interval and
//!   sweeps the registry for timeouts
//! - **discovery** answers discovery probes with a description of the local
//!   agent
//!
//! Handlers always run on the dispatch worker. No lock is held across a
//! handler invocation, so a handler may call `send` freely.
//!
//! A queue exists per (sender → recipient) direction, created lazily on
//! first use, which keeps every ring single-producer as long as each agent
//! sends from one thread — the contract callers must uphold.

pub mod message;
pub mod registry;

pub use message::{
    AgentId, Message, MessageBuilder, MessageDomain, MessagePriority, MessageType,
};
pub use registry::{AgentInfo, AgentRegistry, SweepOutcome};

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::constants::{
    AGENT_TIMEOUT_MS, DEFAULT_INBOX_CAPACITY, DISCONNECT_REAP_PERIODS, DISCOVERY_TIMEOUT_MS,
    DISPATCH_BATCH, DISPATCH_IDLE_SLEEP_US, HEARTBEAT_INTERVAL_MS, MAX_PRIORITY_MESSAGES,
};
use crate::error::{Result, SynapseError};
use crate::monitoring::DispatchMonitor;
use crate::spsc::SpscRing;
use crate::utils::{MonotonicClock, TimestampProvider};

/// Per-type message handler, invoked on the dispatch worker. Returns whether
/// the message was processed successfully; failures are counted, not retried.
pub type Handler = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Description of an agent, carried in discovery responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub name: String,
    pub version: String,
    pub capabilities: Vec<MessageType>,
}

impl AgentDescriptor {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SynapseError::codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(descriptor, _)| descriptor)
            .map_err(|e| SynapseError::codec(e.to_string()))
    }
}

/// Fabric configuration
#[derive(Clone)]
pub struct FabricConfig {
    /// Identity the heartbeat and discovery workers speak for
    pub local_agent: AgentId,
    /// Capacity of each directional agent-pair queue (power of 2)
    pub inbox_capacity: usize,
    pub heartbeat_interval: Duration,
    pub agent_timeout: Duration,
    /// Upper bound of the priority message list
    pub priority_bound: usize,
    /// Time source for liveness math; tests inject a manual clock
    pub clock: Arc<dyn TimestampProvider>,
}

impl FabricConfig {
    pub fn new(local_agent: AgentId) -> Result<Self> {
        if !local_agent.is_registrable() {
            return Err(SynapseError::config("local agent id must not be a sentinel"));
        }
        Ok(Self {
            local_agent,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            agent_timeout: Duration::from_millis(AGENT_TIMEOUT_MS),
            priority_bound: MAX_PRIORITY_MESSAGES,
            clock: Arc::new(MonotonicClock),
        })
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(SynapseError::config("inbox capacity must be a power of 2"));
        }
        self.inbox_capacity = capacity;
        Ok(self)
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_priority_bound(mut self, bound: usize) -> Result<Self> {
        if bound == 0 {
            return Err(SynapseError::config("priority bound must be positive"));
        }
        self.priority_bound = bound;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = clock;
        self
    }
}

/// Snapshot of the fabric's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct FabricMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub handler_failures: u64,
    pub priority_evictions: u64,
    /// Total records currently queued across every pair queue
    pub queue_utilization: u64,
    /// Number of live directional queues
    pub active_connections: u64,
}

struct FabricShared {
    config: FabricConfig,
    /// Workers iterate while set
    running: AtomicBool,
    /// Latched by `stop`; send paths fail once set
    stopped: AtomicBool,
    registry: Mutex<AgentRegistry>,
    /// Directional queues keyed (recipient, sender) so the dispatcher walks
    /// them grouped by recipient
    channels: Mutex<BTreeMap<(AgentId, AgentId), Arc<SpscRing<Message>>>>,
    priority: Mutex<Vec<Message>>,
    handlers: Mutex<HashMap<MessageType, Handler>>,
    discovery_tx: Sender<AgentId>,
    discovery_rx: Mutex<Option<Receiver<AgentId>>>,
    next_message_id: AtomicU64,
    monitor: DispatchMonitor,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    priority_evictions: AtomicU64,
}

/// Agent communication fabric
pub struct CommunicationFabric {
    shared: Arc<FabricShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommunicationFabric {
    pub fn new(config: FabricConfig) -> Result<Self> {
        let timeout_nanos = config.agent_timeout.as_nanos() as u64;
        let (discovery_tx, discovery_rx) = bounded(64);

        Ok(Self {
            shared: Arc::new(FabricShared {
                registry: Mutex::new(AgentRegistry::new(timeout_nanos, DISCONNECT_REAP_PERIODS)),
                config,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                channels: Mutex::new(BTreeMap::new()),
                priority: Mutex::new(Vec::new()),
                handlers: Mutex::new(HashMap::new()),
                discovery_tx,
                discovery_rx: Mutex::new(Some(discovery_rx)),
                next_message_id: AtomicU64::new(1),
                monitor: DispatchMonitor::new(),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
                priority_evictions: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the dispatch, heartbeat and discovery workers
    pub fn start(&self) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(SynapseError::ShuttingDown);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut workers = self.workers.lock();
        for (name, f) in [
            ("fabric-dispatch", FabricShared::dispatch_worker as fn(Arc<FabricShared>)),
            ("fabric-heartbeat", FabricShared::heartbeat_worker),
            ("fabric-discovery", FabricShared::discovery_worker),
        ] {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || f(shared))
                .map_err(|e| SynapseError::config(format!("failed to spawn {name}: {e}")))?;
            workers.push(handle);
        }
        debug!(local = self.shared.config.local_agent.raw(), "fabric started");
        Ok(())
    }

    /// Stop the workers and join them. Idempotent; messages already picked up
    /// by the dispatcher finish their handler invocations.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!("fabric stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    // ----- agent management -----

    /// Register an agent (idempotent by id; re-registration refreshes the
    /// record and resets liveness)
    pub fn register_agent(
        &self,
        id: AgentId,
        name: &str,
        version: &str,
        capabilities: &[MessageType],
    ) -> Result<()> {
        let now = self.shared.config.clock.now_nanos();
        self.shared.registry.lock().register(id, name, version, capabilities, now)
    }

    /// Unregister an agent, draining and releasing its queues
    pub fn unregister_agent(&self, id: AgentId) -> Result<()> {
        let present = self.shared.registry.lock().unregister(id);
        if !present {
            return Err(SynapseError::UnknownRecipient(id.raw()));
        }
        self.shared.remove_queues_for(id);
        Ok(())
    }

    /// Snapshot of currently live agents
    pub fn list_active(&self) -> Vec<AgentInfo> {
        let now = self.shared.config.clock.now_nanos();
        self.shared.registry.lock().active_snapshot(now)
    }

    /// True iff a heartbeat was observed within the liveness timeout
    pub fn is_active(&self, id: AgentId) -> bool {
        let now = self.shared.config.clock.now_nanos();
        self.shared.registry.lock().is_active(id, now)
    }

    /// Refresh an agent's liveness clock directly (in-process agents that
    /// are not the fabric's local identity use this instead of heartbeat
    /// messages)
    pub fn heartbeat(&self, id: AgentId) {
        let now = self.shared.config.clock.now_nanos();
        self.shared.registry.lock().mark_heartbeat(id, now);
    }

    // ----- messaging -----

    /// Stamp, validate and enqueue a message into the recipient's inbox, or
    /// every live inbox for a `BROADCAST` recipient
    pub fn send(&self, message: Message) -> Result<()> {
        self.shared.send(message)
    }

    /// Convenience constructor-and-send
    pub fn send_to(
        &self,
        sender: AgentId,
        recipient: AgentId,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<()> {
        self.shared.send(Message::new(sender, recipient, msg_type, payload)?)
    }

    /// Fan-out send from `sender` to every live agent except `sender`;
    /// returns the number of inboxes reached
    pub fn broadcast(
        &self,
        sender: AgentId,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<usize> {
        let mut message = Message::new(sender, AgentId::BROADCAST, msg_type, payload)?;
        message.set_priority(MessagePriority::Normal);
        self.shared.broadcast(message)
    }

    /// Insert a message into the bounded priority list, processed before the
    /// normal queues on the next dispatch tick
    pub fn send_priority(&self, message: Message) -> Result<()> {
        self.shared.send_priority(message)
    }

    // ----- handlers -----

    /// Install the handler invoked on the dispatch worker for `msg_type`
    pub fn register_handler<F>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.shared.handlers.lock().insert(msg_type, Arc::new(handler));
    }

    pub fn unregister_handler(&self, msg_type: MessageType) {
        self.shared.handlers.lock().remove(&msg_type);
    }

    // ----- discovery -----

    /// Probe for an agent and wait until it is observed live, up to
    /// `timeout` (wall time). Returns whether the agent answered within the
    /// window.
    pub fn discover(&self, id: AgentId, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(Duration::from_millis(DISCOVERY_TIMEOUT_MS));
        let local = self.shared.config.local_agent;
        // Empty payload marks a probe; responses carry a descriptor.
        if self.send_to(local, id, MessageType::AgentDiscovery, &[]).is_err() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_active(id) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    // ----- metrics -----

    pub fn metrics(&self) -> FabricMetrics {
        let shared = &self.shared;
        let channels = shared.channels.lock();
        let queue_utilization: u64 = channels.values().map(|q| q.len() as u64).sum();
        let active_connections = channels.len() as u64;
        drop(channels);

        FabricMetrics {
            messages_sent: shared.sent.load(Ordering::Relaxed),
            messages_received: shared.received.load(Ordering::Relaxed),
            messages_dropped: shared.dropped.load(Ordering::Relaxed),
            handler_failures: shared.handler_failures.load(Ordering::Relaxed),
            priority_evictions: shared.priority_evictions.load(Ordering::Relaxed),
            queue_utilization,
            active_connections,
        }
    }

    pub fn reset_metrics(&self) {
        let shared = &self.shared;
        shared.sent.store(0, Ordering::Relaxed);
        shared.received.store(0, Ordering::Relaxed);
        shared.dropped.store(0, Ordering::Relaxed);
        shared.handler_failures.store(0, Ordering::Relaxed);
        shared.priority_evictions.store(0, Ordering::Relaxed);
        shared.monitor.reset();
    }

    /// Dispatch latency statistics (handler invocation path)
    pub fn dispatch_stats(&self) -> crate::monitoring::DispatchStats {
        self.shared.monitor.stats()
    }

    /// Drain queues and invoke handlers on the calling thread until no work
    /// remains. Intended for tests and single-threaded hosts that do not
    /// start the workers.
    pub fn pump(&self) -> usize {
        self.shared.dispatch_pass()
    }
}

impl Drop for CommunicationFabric {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FabricShared {
    fn guard_send(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SynapseError::ShuttingDown);
        }
        Ok(())
    }

    fn stamp(&self, message: &mut Message) {
        message.set_timestamp(self.config.clock.now_nanos());
        message.set_message_id(self.next_message_id.fetch_add(1, Ordering::Relaxed));
    }

    /// Validate sender registration and structural shape
    fn validate(&self, message: &Message) -> Result<()> {
        if !message.is_well_formed() {
            return Err(SynapseError::invalid_message("malformed header"));
        }
        if !self.registry.lock().contains(message.sender()) {
            return Err(SynapseError::invalid_message(format!(
                "sender {:#010x} is not registered",
                message.sender().raw()
            )));
        }
        Ok(())
    }

    fn queue_for(&self, recipient: AgentId, sender: AgentId) -> Result<Arc<SpscRing<Message>>> {
        let mut channels = self.channels.lock();
        if let Some(queue) = channels.get(&(recipient, sender)) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(SpscRing::with_capacity(self.config.inbox_capacity)?);
        channels.insert((recipient, sender), Arc::clone(&queue));
        Ok(queue)
    }

    fn remove_queues_for(&self, id: AgentId) {
        let mut channels = self.channels.lock();
        channels.retain(|(recipient, sender), _| *recipient != id && *sender != id);
    }

    fn send(&self, mut message: Message) -> Result<()> {
        self.guard_send()?;
        self.validate(&message)?;
        self.stamp(&mut message);

        if message.recipient().is_broadcast() {
            return self.broadcast_stamped(message).map(|_| ());
        }

        {
            let registry = self.registry.lock();
            if !registry.contains(message.recipient()) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(SynapseError::UnknownRecipient(message.recipient().raw()));
            }
        }

        let queue = self.queue_for(message.recipient(), message.sender())?;
        match queue.try_enqueue(message) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.registry.lock().record_sent(message.sender());
                Ok(())
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    recipient = message.recipient().raw(),
                    "inbox full, message dropped"
                );
                Err(e)
            }
        }
    }

    fn broadcast(&self, mut message: Message) -> Result<usize> {
        self.guard_send()?;
        self.validate(&message)?;
        self.stamp(&mut message);
        self.broadcast_stamped(message)
    }

    fn broadcast_stamped(&self, message: Message) -> Result<usize> {
        let now = self.config.clock.now_nanos();
        let recipients: Vec<AgentId> = {
            let registry = self.registry.lock();
            registry
                .active_ids(now)
                .into_iter()
                .filter(|id| *id != message.sender())
                .collect()
        };

        let mut reached = 0usize;
        for recipient in recipients {
            let queue = self.queue_for(recipient, message.sender())?;
            // Each delivered copy names its actual recipient.
            let mut copy = message;
            copy.set_recipient(recipient);
            if queue.try_enqueue(copy).is_ok() {
                reached += 1;
                self.sent.fetch_add(1, Ordering::Relaxed);
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(recipient = recipient.raw(), "broadcast drop: inbox full");
            }
        }
        self.registry.lock().record_sent(message.sender());
        Ok(reached)
    }

    fn send_priority(&self, mut message: Message) -> Result<()> {
        self.guard_send()?;
        self.validate(&message)?;
        self.stamp(&mut message);
        self.push_priority(message)
    }

    /// Bounded insert with the eviction ladder: oldest LOW first, then the
    /// oldest entry of strictly lower priority than the incoming message.
    fn push_priority(&self, message: Message) -> Result<()> {
        let mut priority = self.priority.lock();
        if priority.len() >= self.config.priority_bound {
            let victim = priority
                .iter()
                .position(|m| m.priority() == MessagePriority::Low)
                .or_else(|| priority.iter().position(|m| m.priority() < message.priority()));
            match victim {
                Some(index) => {
                    priority.remove(index);
                    self.priority_evictions.fetch_add(1, Ordering::Relaxed);
                    warn!("priority list full, evicted an entry");
                }
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(SynapseError::QueueFull);
                }
            }
        }
        priority.push(message);
        Ok(())
    }

    // ----- workers -----

    fn dispatch_worker(shared: Arc<FabricShared>) {
        debug!("dispatch worker up");
        while shared.running.load(Ordering::Acquire) {
            if shared.dispatch_pass() == 0 {
                std::thread::sleep(Duration::from_micros(DISPATCH_IDLE_SLEEP_US));
            }
        }
        // Final drain so nothing accepted before the stop flag is stranded.
        shared.dispatch_pass();
        debug!("dispatch worker down");
    }

    /// One full pass: priority list first (higher priority first, FIFO within
    /// equal priority), then every pair queue round-robin. Returns the number
    /// of messages dispatched.
    fn dispatch_pass(&self) -> usize {
        let mut dispatched = 0usize;

        let mut urgent = {
            let mut priority = self.priority.lock();
            std::mem::take(&mut *priority)
        };
        // Stable sort preserves insertion order within a priority class.
        urgent.sort_by_key(|m| Reverse(m.priority()));
        for message in urgent {
            self.dispatch_one(message.recipient(), &message);
            dispatched += 1;
        }

        let queues: Vec<(AgentId, Arc<SpscRing<Message>>)> = {
            let channels = self.channels.lock();
            channels
                .iter()
                .map(|((recipient, _), queue)| (*recipient, Arc::clone(queue)))
                .collect()
        };

        for (recipient, queue) in queues {
            for _ in 0..DISPATCH_BATCH {
                match queue.try_dequeue() {
                    Some(message) => {
                        self.dispatch_one(recipient, &message);
                        dispatched += 1;
                    }
                    None => break,
                }
            }
        }
        dispatched
    }

    fn dispatch_one(&self, recipient: AgentId, message: &Message) {
        let Some(msg_type) = message.msg_type() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // Liveness bookkeeping: any heartbeat or probe proves the sender up.
        match msg_type {
            MessageType::AgentHeartbeat => {
                let now = self.config.clock.now_nanos();
                self.registry.lock().mark_heartbeat(message.sender(), now);
            }
            MessageType::AgentDiscovery if message.payload_size() == 0 => {
                let now = self.config.clock.now_nanos();
                self.registry.lock().mark_heartbeat(message.sender(), now);
                // Only probes aimed at the local agent get a descriptor
                // reply; responses carry a payload and are never forwarded.
                if message.recipient() == self.config.local_agent
                    || message.recipient().is_broadcast()
                {
                    let _ = self.discovery_tx.try_send(message.sender());
                }
            }
            _ => {}
        }

        // Clone the handler out before invoking: a handler that calls `send`
        // must never find the handler map locked.
        let handler = self.handlers.lock().get(&msg_type).cloned();
        if let Some(handler) = handler {
            let started = Instant::now();
            let ok = handler(message);
            let elapsed = started.elapsed();
            self.monitor.record(elapsed.as_nanos() as u64);
            if !ok {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                trace!(msg_type = message.msg_type_raw(), "handler reported failure");
            }
            if !recipient.is_broadcast() {
                self.registry
                    .lock()
                    .record_received(recipient, elapsed.as_secs_f64() * 1e6);
            }
        }
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn heartbeat_worker(shared: Arc<FabricShared>) {
        debug!("heartbeat worker up");
        while shared.running.load(Ordering::Acquire) {
            std::thread::sleep(shared.config.heartbeat_interval);
            if !shared.running.load(Ordering::Acquire) {
                break;
            }

            let now = shared.config.clock.now_nanos();
            let local = shared.config.local_agent;
            shared.registry.lock().mark_heartbeat(local, now);

            // Fan the local heartbeat out; failure just means nobody is
            // listening yet.
            if let Ok(message) =
                Message::new(local, AgentId::BROADCAST, MessageType::AgentHeartbeat, &[])
            {
                let _ = shared.broadcast(message);
            }

            let outcome = shared.registry.lock().sweep(now);
            for id in outcome.newly_disconnected {
                warn!(agent = id.raw(), "agent timed out");
                shared.remove_queues_for(id);
                // Synthetic shutdown notification, delivered through the
                // priority path so the dispatch worker runs the handler.
                if let Ok(mut notice) =
                    Message::new(id, local, MessageType::AgentShutdown, &[])
                {
                    notice.set_priority(MessagePriority::Critical);
                    shared.stamp(&mut notice);
                    let _ = shared.push_priority(notice);
                }
            }
            for id in outcome.reaped {
                debug!(agent = id.raw(), "disconnected agent reclaimed");
            }
        }
        debug!("heartbeat worker down");
    }

    fn discovery_worker(shared: Arc<FabricShared>) {
        let Some(rx) = shared.discovery_rx.lock().take() else {
            return;
        };
        debug!("discovery worker up");
        while shared.running.load(Ordering::Acquire) {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(prober) => {
                    let local = shared.config.local_agent;
                    let descriptor = {
                        let now = shared.config.clock.now_nanos();
                        let registry = shared.registry.lock();
                        registry
                            .active_snapshot(now)
                            .into_iter()
                            .find(|info| info.id == local)
                            .map(|info| AgentDescriptor {
                                id: info.id,
                                name: info.name,
                                version: info.version,
                                capabilities: info.capabilities.into_iter().collect(),
                            })
                    };
                    let Some(descriptor) = descriptor else { continue };
                    let Ok(payload) = descriptor.to_bytes() else { continue };
                    if let Ok(reply) =
                        Message::new(local, prober, MessageType::AgentDiscovery, &payload)
                    {
                        let _ = shared.send(reply);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("discovery worker down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn fabric_with_clock() -> (CommunicationFabric, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = FabricConfig::new(AgentId::SYSTEM_ARCHITECT)
            .unwrap()
            .with_inbox_capacity(64)
            .unwrap()
            .with_clock(Arc::clone(&clock) as Arc<dyn TimestampProvider>);
        (CommunicationFabric::new(config).unwrap(), clock)
    }

    #[test]
    fn test_send_requires_registered_recipient() {
        let (fabric, _clock) = fabric_with_clock();
        fabric
            .register_agent(AgentId(1), "architect", "1.0", &[])
            .unwrap();

        let result = fabric.send_to(AgentId(1), AgentId(2), MessageType::MemoryStats, b"x");
        assert!(matches!(result, Err(SynapseError::UnknownRecipient(2))));
    }

    #[test]
    fn test_send_requires_registered_sender() {
        let (fabric, _clock) = fabric_with_clock();
        fabric.register_agent(AgentId(2), "sim", "1.0", &[]).unwrap();

        let result = fabric.send_to(AgentId(1), AgentId(2), MessageType::MemoryStats, b"x");
        assert!(matches!(result, Err(SynapseError::InvalidMessage(_))));
    }

    #[test]
    fn test_unicast_delivery_via_pump() {
        let (fabric, _clock) = fabric_with_clock();
        fabric.register_agent(AgentId(1), "a", "1.0", &[]).unwrap();
        fabric.register_agent(AgentId(2), "b", "1.0", &[]).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        fabric.register_handler(MessageType::CellUpdate, move |message| {
            assert_eq!(message.sender(), AgentId(1));
            assert_eq!(message.recipient(), AgentId(2));
            assert_eq!(message.payload(), b"cells");
            seen_in_handler.fetch_add(1, Ordering::SeqCst);
            true
        });

        fabric
            .send_to(AgentId(1), AgentId(2), MessageType::CellUpdate, b"cells")
            .unwrap();
        assert_eq!(fabric.pump(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_message_ids_are_monotonic() {
        let (fabric, _clock) = fabric_with_clock();
        fabric.register_agent(AgentId(1), "a", "1.0", &[]).unwrap();
        fabric.register_agent(AgentId(2), "b", "1.0", &[]).unwrap();

        let last = Arc::new(AtomicU64::new(0));
        let last_in_handler = Arc::clone(&last);
        fabric.register_handler(MessageType::PatternData, move |message| {
            let prev = last_in_handler.swap(message.message_id(), Ordering::SeqCst);
            assert!(message.message_id() > prev);
            true
        });

        for _ in 0..10 {
            fabric
                .send_to(AgentId(1), AgentId(2), MessageType::PatternData, &[])
                .unwrap();
        }
        assert_eq!(fabric.pump(), 10);
    }

    #[test]
    fn test_priority_eviction_ladder() {
        let clock = Arc::new(ManualClock::new());
        let config = FabricConfig::new(AgentId(1))
            .unwrap()
            .with_priority_bound(2)
            .unwrap()
            .with_clock(clock as Arc<dyn TimestampProvider>);
        let fabric = CommunicationFabric::new(config).unwrap();
        fabric.register_agent(AgentId(1), "a", "1.0", &[]).unwrap();
        fabric.register_agent(AgentId(2), "b", "1.0", &[]).unwrap();

        let mk = |priority: MessagePriority| {
            MessageBuilder::new(AgentId(1), AgentId(2), MessageType::ErrorReport)
                .priority(priority)
                .build()
                .unwrap()
        };

        fabric.send_priority(mk(MessagePriority::Low)).unwrap();
        fabric.send_priority(mk(MessagePriority::High)).unwrap();
        // Low entry is evicted to admit the third message.
        fabric.send_priority(mk(MessagePriority::Critical)).unwrap();
        assert_eq!(fabric.metrics().priority_evictions, 1);

        // Now the list holds High and Critical; a Low insert can only evict
        // something strictly lower than itself and finds nothing.
        let result = fabric.send_priority(mk(MessagePriority::Low));
        assert!(matches!(result, Err(SynapseError::QueueFull)));
    }

    #[test]
    fn test_handler_failures_counted() {
        let (fabric, _clock) = fabric_with_clock();
        fabric.register_agent(AgentId(1), "a", "1.0", &[]).unwrap();
        fabric.register_agent(AgentId(2), "b", "1.0", &[]).unwrap();
        fabric.register_handler(MessageType::ErrorReport, |_| false);

        fabric
            .send_to(AgentId(1), AgentId(2), MessageType::ErrorReport, &[])
            .unwrap();
        fabric.pump();
        assert_eq!(fabric.metrics().handler_failures, 1);
    }

    #[test]
    fn test_send_after_stop_fails() {
        let (fabric, _clock) = fabric_with_clock();
        fabric.register_agent(AgentId(1), "a", "1.0", &[]).unwrap();
        fabric.register_agent(AgentId(2), "b", "1.0", &[]).unwrap();
        fabric.stop();
        let result = fabric.send_to(AgentId(1), AgentId(2), MessageType::MemoryStats, &[]);
        assert!(matches!(result, Err(SynapseError::ShuttingDown)));
    }

    #[test]
    fn test_reentrant_send_from_handler() {
        let (fabric, _clock) = fabric_with_clock();
        let fabric = Arc::new(fabric);
        fabric.register_agent(AgentId(1), "a", "1.0", &[]).unwrap();
        fabric.register_agent(AgentId(2), "b", "1.0", &[]).unwrap();

        let shared = Arc::clone(&fabric.shared);
        fabric.register_handler(MessageType::OptimizationHint, move |message| {
            // Reply from the handler; must not deadlock.
            if message.payload() == b"ping" {
                let reply =
                    Message::new(AgentId(2), AgentId(1), MessageType::OptimizationHint, b"pong")
                        .unwrap();
                shared.send(reply).is_ok()
            } else {
                true
            }
        });

        fabric
            .send_to(AgentId(1), AgentId(2), MessageType::OptimizationHint, b"ping")
            .unwrap();
        assert_eq!(fabric.pump(), 1);
        // The reply enqueued by the handler is waiting for the next pass.
        assert_eq!(fabric.pump(), 1);
    }
}
