//! Fixed-layout message records
//!
//! A `Message` is exactly 4 KiB, cache-line aligned, and trivially copyable
//! so it moves through the SPSC rings without serialization. The 32-byte
//! header is packed little-endian with field offsets pinned by compile-time
//! assertions; the payload is opaque bytes interpreted according to the
//! type tag.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::constants::{MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE, MESSAGE_SIZE};
use crate::error::{Result, SynapseError};

/// Functional domain of a message type, encoded in the tag's high nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDomain {
    System,
    Performance,
    Simulation,
    Ux,
    Control,
}

/// Closed set of message type tags
///
/// Values are wire-stable and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    // System messages
    AgentDiscovery = 0x1000,
    AgentHeartbeat = 0x1001,
    AgentShutdown = 0x1002,

    // Performance data
    PerformanceMetrics = 0x2000,
    GpuUtilization = 0x2001,
    MemoryStats = 0x2002,

    // Simulation data
    SimulationState = 0x3000,
    CellUpdate = 0x3001,
    PatternData = 0x3002,

    // UX data
    UxMetrics = 0x4000,
    InteractionEvent = 0x4001,
    HeatmapUpdate = 0x4002,

    // Control messages
    OptimizationHint = 0x5000,
    ConfigurationUpdate = 0x5001,
    ErrorReport = 0x5002,
}

impl MessageType {
    /// Decode a raw tag, rejecting values outside the closed set
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x1000 => Self::AgentDiscovery,
            0x1001 => Self::AgentHeartbeat,
            0x1002 => Self::AgentShutdown,
            0x2000 => Self::PerformanceMetrics,
            0x2001 => Self::GpuUtilization,
            0x2002 => Self::MemoryStats,
            0x3000 => Self::SimulationState,
            0x3001 => Self::CellUpdate,
            0x3002 => Self::PatternData,
            0x4000 => Self::UxMetrics,
            0x4001 => Self::InteractionEvent,
            0x4002 => Self::HeatmapUpdate,
            0x5000 => Self::OptimizationHint,
            0x5001 => Self::ConfigurationUpdate,
            0x5002 => Self::ErrorReport,
            _ => return None,
        })
    }

    /// Functional domain, from the tag's high nibble
    pub fn domain(self) -> MessageDomain {
        match (self as u32) >> 12 {
            0x1 => MessageDomain::System,
            0x2 => MessageDomain::Performance,
            0x3 => MessageDomain::Simulation,
            0x4 => MessageDomain::Ux,
            _ => MessageDomain::Control,
        }
    }
}

/// Agent identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct AgentId(pub u32);

impl AgentId {
    /// Sentinel recipient: deliver to every live agent except the sender
    pub const BROADCAST: AgentId = AgentId(0);
    pub const SYSTEM_ARCHITECT: AgentId = AgentId(1);
    pub const SIMULATION_ENGINEER: AgentId = AgentId(2);
    pub const UX_INTELLIGENCE: AgentId = AgentId(3);
    pub const INTEGRATION_SPECIALIST: AgentId = AgentId(4);
    pub const UNKNOWN: AgentId = AgentId(0xFFFF_FFFF);

    /// Raw wire value
    pub fn raw(self) -> u32 {
        self.0
    }

    /// True for the broadcast sentinel
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// True iff this id may appear in the registry
    pub fn is_registrable(self) -> bool {
        self != Self::BROADCAST && self != Self::UNKNOWN
    }
}

/// Message priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl MessagePriority {
    /// Decode a raw priority byte
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            3 => Self::Critical,
            _ => return None,
        })
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Packed 32-byte message header
///
/// `payload_size` sits at offset 29, so the struct must stay packed; fields
/// are read by value only (taking references into a packed struct is
/// undefined behavior).
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MessageHeader {
    timestamp: u64,
    message_id: u64,
    msg_type: u32,
    sender: u32,
    recipient: u32,
    priority: u8,
    payload_size: u16,
    flags: u8,
}

const_assert_eq!(std::mem::size_of::<MessageHeader>(), MESSAGE_HEADER_SIZE);
const_assert_eq!(std::mem::offset_of!(MessageHeader, timestamp), 0);
const_assert_eq!(std::mem::offset_of!(MessageHeader, message_id), 8);
const_assert_eq!(std::mem::offset_of!(MessageHeader, msg_type), 16);
const_assert_eq!(std::mem::offset_of!(MessageHeader, sender), 20);
const_assert_eq!(std::mem::offset_of!(MessageHeader, recipient), 24);
const_assert_eq!(std::mem::offset_of!(MessageHeader, priority), 28);
const_assert_eq!(std::mem::offset_of!(MessageHeader, payload_size), 29);
const_assert_eq!(std::mem::offset_of!(MessageHeader, flags), 31);

/// Fixed 4 KiB message record, cache-line aligned for zero-copy transfer
/// through the agent-pair rings
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct Message {
    header: MessageHeader,
    payload: [u8; MAX_PAYLOAD_SIZE],
}

const_assert_eq!(std::mem::size_of::<Message>(), MESSAGE_SIZE);
const_assert_eq!(std::mem::align_of::<Message>(), 64);

impl Default for Message {
    fn default() -> Self {
        // All fields are plain integers; the zero pattern is a valid message.
        unsafe { std::mem::zeroed() }
    }
}

impl Message {
    /// Construct a message with the given routing fields and payload
    ///
    /// The timestamp and message id stay zero until the fabric stamps them
    /// at send time.
    pub fn new(
        sender: AgentId,
        recipient: AgentId,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SynapseError::invalid_message(format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut message = Self::default();
        message.header.msg_type = msg_type as u32;
        message.header.sender = sender.raw();
        message.header.recipient = recipient.raw();
        message.header.priority = MessagePriority::Normal as u8;
        message.header.payload_size = payload.len() as u16;
        message.payload[..payload.len()].copy_from_slice(payload);
        Ok(message)
    }

    /// Send timestamp in monotonic nanoseconds (zero until sent)
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Per-fabric monotonically increasing id (zero until sent)
    pub fn message_id(&self) -> u64 {
        self.header.message_id
    }

    /// Decoded type tag, `None` if the raw tag is outside the closed set
    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_raw(self.header.msg_type)
    }

    /// Raw type tag
    pub fn msg_type_raw(&self) -> u32 {
        self.header.msg_type
    }

    pub fn sender(&self) -> AgentId {
        AgentId(self.header.sender)
    }

    pub fn recipient(&self) -> AgentId {
        AgentId(self.header.recipient)
    }

    /// Priority, defaulting malformed bytes to `Normal`
    pub fn priority(&self) -> MessagePriority {
        MessagePriority::from_raw(self.header.priority).unwrap_or_default()
    }

    pub fn set_priority(&mut self, priority: MessagePriority) {
        self.header.priority = priority as u8;
    }

    /// Reserved flag byte (zero in this protocol revision)
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Payload bytes up to the declared size
    pub fn payload(&self) -> &[u8] {
        let size = (self.header.payload_size as usize).min(MAX_PAYLOAD_SIZE);
        &self.payload[..size]
    }

    pub fn payload_size(&self) -> usize {
        self.header.payload_size as usize
    }

    /// Header plus declared payload
    pub fn total_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload_size()
    }

    pub(crate) fn set_timestamp(&mut self, nanos: u64) {
        self.header.timestamp = nanos;
    }

    pub(crate) fn set_message_id(&mut self, id: u64) {
        self.header.message_id = id;
    }

    pub(crate) fn set_recipient(&mut self, recipient: AgentId) {
        self.header.recipient = recipient.raw();
    }

    /// Structural validity: bounded payload, type tag in the closed set,
    /// sender not a sentinel. Registration of the sender is checked by the
    /// fabric, which owns the registry.
    pub fn is_well_formed(&self) -> bool {
        self.header.payload_size as usize <= MAX_PAYLOAD_SIZE
            && self.msg_type().is_some()
            && self.sender().is_registrable()
    }

    /// Serialize the header to its authoritative little-endian layout
    pub fn header_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut bytes = [0u8; MESSAGE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.header.timestamp.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.header.message_id.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.header.msg_type.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.header.sender.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.header.recipient.to_le_bytes());
        bytes[28] = self.header.priority;
        bytes[29..31].copy_from_slice(&self.header.payload_size.to_le_bytes());
        bytes[31] = self.header.flags;
        bytes
    }

    /// Rebuild a message from a header image and payload bytes
    pub fn from_wire(header: &[u8], payload: &[u8]) -> Result<Self> {
        if header.len() != MESSAGE_HEADER_SIZE {
            return Err(SynapseError::codec("truncated message header"));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SynapseError::codec("payload exceeds message bound"));
        }

        let mut message = Self::default();
        message.header.timestamp = u64::from_le_bytes(header[0..8].try_into().unwrap());
        message.header.message_id = u64::from_le_bytes(header[8..16].try_into().unwrap());
        message.header.msg_type = u32::from_le_bytes(header[16..20].try_into().unwrap());
        message.header.sender = u32::from_le_bytes(header[20..24].try_into().unwrap());
        message.header.recipient = u32::from_le_bytes(header[24..28].try_into().unwrap());
        message.header.priority = header[28];
        message.header.payload_size = u16::from_le_bytes(header[29..31].try_into().unwrap());
        message.header.flags = header[31];

        if message.header.payload_size as usize != payload.len() {
            return Err(SynapseError::codec("payload length disagrees with header"));
        }
        message.payload[..payload.len()].copy_from_slice(payload);
        Ok(message)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("timestamp", &self.timestamp())
            .field("message_id", &self.message_id())
            .field("msg_type", &self.msg_type_raw())
            .field("sender", &self.sender())
            .field("recipient", &self.recipient())
            .field("priority", &self.priority())
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

/// Builder for messages with non-default priority or typed payloads
pub struct MessageBuilder {
    message: Result<Message>,
}

impl MessageBuilder {
    pub fn new(sender: AgentId, recipient: AgentId, msg_type: MessageType) -> Self {
        Self {
            message: Message::new(sender, recipient, msg_type, &[]),
        }
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        if let Ok(message) = &mut self.message {
            message.set_priority(priority);
        }
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        if payload.len() > MAX_PAYLOAD_SIZE {
            self.message = Err(SynapseError::invalid_message(format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
            return self;
        }
        if let Ok(message) = &mut self.message {
            message.header.payload_size = payload.len() as u16;
            message.payload[..payload.len()].copy_from_slice(payload);
            // Zero any bytes left over from a previous payload call.
            message.payload[payload.len()..].fill(0);
        }
        self
    }

    pub fn build(self) -> Result<Message> {
        self.message
    }
}
