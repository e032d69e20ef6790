//! Core types and tick pipeline for the Hearsay communication simulation.
//!
//! Senders queue communicative intents into per-actor outboxes. Once per tick
//! the pipeline drains due intents into a shared bounded message stream and
//! deposits their traces into the ambient [`SignalGrid`], then three delivery
//! paths (targeted medium, vision contact, broadcast fallback) read the frozen
//! stream and decode messages per receiver with integrity, misread, deception,
//! and secrecy loss. A semantic bridge turns accepted inbox entries into
//! domain receipts. Every probabilistic roll is derived from a deterministic
//! hash of `(token, receiver, salt)` so replays are bit-identical.

pub use hearsay_field::{
    AmbientSampler, CellId, ChannelDecay, FieldError, MediumKind, MediumMap, SignalCell,
    SignalChannel, SignalGrid, Transport, TransportMask,
};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{Key, SecondaryMap, SlotMap, new_key_type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for communicating actors backed by a generational slot map.
    pub struct ActorId;
}

/// Convenience alias for associating side data with actors.
pub type ActorMap<T> = SecondaryMap<ActorId, T>;

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

const SALT_TOKEN: u64 = 0x51ED_270B_9A6F_F3C1;
const SALT_DECEPTION: u64 = 0x9E37_79B9_7F4A_7C15;
const SALT_MISREAD: u64 = 0xC2B2_AE3D_27D4_EB4F;
const SALT_MISREAD_KIND: u64 = 0x165667B19E3779F9;

/// splitmix64 finalizer; the sole source of in-pipeline randomness.
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    x
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xCBF2_9CE4_8422_2325_u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

/// Deterministic uniform draw in `[0, 1)` for one `(token, receiver, salt)` triple.
fn roll_unit(token: Token, receiver: ActorId, salt: u64) -> f32 {
    let mut h = mix64(u64::from(token.0) ^ salt);
    h = mix64(h ^ receiver.data().as_ffi());
    ((h >> 40) as f32) / (1u64 << 24) as f32
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D world position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Deterministic 32-bit identity of one message emission, stable across
/// repeats of the same outbox entry.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Token(pub u32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Effect a decoded message should produce in the receiver's reaction layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InterruptKind {
    /// Cheap signal-of-contact notice, emitted for every first observation.
    MessageReceived,
    /// Acknowledgement of a previously received emission.
    AckReceived,
    /// Directive from a commander or employer.
    Order,
    /// Danger or condition alert.
    Warning,
    /// Attention request with no further payload.
    Hail,
    /// Status or observation report.
    Report,
}

impl InterruptKind {
    const fn code(self) -> u64 {
        match self {
            Self::MessageReceived => 1,
            Self::AckReceived => 2,
            Self::Order => 3,
            Self::Warning => 4,
            Self::Hail => 5,
            Self::Report => 6,
        }
    }
}

/// Scheduling weight carried alongside a message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Routine,
    Urgent,
    Critical,
}

/// Behavioral flags attached to an emission.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageFlags {
    /// Sender keeps re-emitting until an acknowledgement arrives.
    pub requests_ack: bool,
    /// Addressed to no one in particular.
    pub broadcast: bool,
    /// Content is intentionally false.
    pub deceptive: bool,
    /// Content is obfuscated and needs a bypass skill to read.
    pub encrypted: bool,
}

/// One emission in the shared stream. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub token: Token,
    pub emitted: Tick,
    pub expires: Tick,
    pub cell: CellId,
    pub sender: ActorId,
    pub origin: Position,
    pub interrupt: InterruptKind,
    pub priority: Priority,
    pub payload_id: String,
    pub transport: Transport,
    pub strength: f32,
    pub clarity: f32,
    pub deception: f32,
    pub secrecy: f32,
    pub target: Option<ActorId>,
    /// For acknowledgement emissions: the token being confirmed.
    pub ack_of: Option<Token>,
    pub flags: MessageFlags,
}

impl Message {
    /// Whether the message can be observed at `now`.
    #[must_use]
    pub fn visible_at(&self, now: Tick) -> bool {
        self.emitted.0 <= now.0 && now.0 <= self.expires.0
    }

    /// Ticks elapsed since emission.
    #[must_use]
    pub fn age_at(&self, now: Tick) -> u64 {
        now.0.saturating_sub(self.emitted.0)
    }
}

/// Bounded append-mostly ring of live emissions.
///
/// When full, the oldest entry is evicted before appending; expired entries
/// are pruned at the end of each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStream {
    entries: VecDeque<Message>,
    capacity: usize,
}

impl MessageStream {
    /// Create a stream holding at most `capacity` live messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no messages are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of live entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// All live entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> &VecDeque<Message> {
        &self.entries
    }

    /// Append a message, evicting the oldest entry first when full.
    /// Returns true when an eviction happened.
    pub fn push(&mut self, message: Message) -> bool {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            true
        } else {
            false
        };
        self.entries.push_back(message);
        evicted
    }

    /// Iterate messages observable at `now`.
    pub fn iter_visible(&self, now: Tick) -> impl Iterator<Item = &Message> {
        self.entries.iter().filter(move |m| m.visible_at(now))
    }

    /// Drop messages whose expiration has passed, returning how many.
    pub fn prune_expired(&mut self, now: Tick) -> usize {
        let before = self.entries.len();
        self.entries.retain(|m| m.expires.0 >= now.0);
        before - self.entries.len()
    }
}

/// A pending communicative intent in a sender's outbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub interrupt: InterruptKind,
    pub priority: Priority,
    pub payload_id: String,
    /// Overrides the sender's preferred transport mask when present.
    pub preferred: Option<TransportMask>,
    pub target: Option<ActorId>,
    pub ack_of: Option<Token>,
    pub flags: MessageFlags,
    pub strength: f32,
    pub clarity: f32,
    pub deception: f32,
    pub secrecy: f32,
    pub focus_cost: f32,
    pub cadence_ticks: u32,
    pub ttl_ticks: u32,
    pub max_attempts: u32,
    pub attempts: u32,
    pub next_emit: Tick,
    pub created: Tick,
    /// Set on the first successful emission; re-emissions reuse it.
    pub first_emit: Option<Tick>,
    /// Assigned once at first emission.
    pub token: Option<Token>,
}

impl OutboxEntry {
    /// New intent with neutral defaults; adjust fields before queueing.
    #[must_use]
    pub fn new(interrupt: InterruptKind, payload_id: impl Into<String>) -> Self {
        Self {
            interrupt,
            priority: Priority::default(),
            payload_id: payload_id.into(),
            preferred: None,
            target: None,
            ack_of: None,
            flags: MessageFlags::default(),
            strength: 1.0,
            clarity: 1.0,
            deception: 0.0,
            secrecy: 0.0,
            focus_cost: 0.0,
            cadence_ticks: 8,
            ttl_ticks: 240,
            max_attempts: 1,
            attempts: 0,
            next_emit: Tick::zero(),
            created: Tick::zero(),
            first_emit: None,
            token: None,
        }
    }

    /// Same intent addressed at one receiver.
    #[must_use]
    pub fn addressed_to(mut self, target: ActorId) -> Self {
        self.target = Some(target);
        self
    }
}

/// Per-sender communication state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderState {
    pub outbox: Vec<OutboxEntry>,
    /// Externally replenished attention pool spent on costly emissions.
    pub focus: f32,
    pub preferred: TransportMask,
}

/// Static decode capabilities of a receiving actor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReceiverConfig {
    pub enabled: bool,
    pub transport_mask: TransportMask,
    pub decode_skill: f32,
    pub noise_floor: f32,
    pub deception_detect_skill: f32,
    pub secrecy_bypass_skill: f32,
    pub misread_chance_scale: f32,
    pub max_inbox: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport_mask: TransportMask::all(),
            decode_skill: 0.7,
            noise_floor: 0.05,
            deception_detect_skill: 0.5,
            secrecy_bypass_skill: 0.0,
            misread_chance_scale: 0.35,
            max_inbox: 32,
        }
    }
}

/// How badly a message was misunderstood.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MisreadSeverity {
    Moderate,
    Major,
    Critical,
}

/// What shape the misunderstanding took.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MisreadKind {
    GarbledContent,
    WrongUrgency,
    MisattributedSender,
}

/// Misread classification attached to a decoded message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Misread {
    pub severity: MisreadSeverity,
    pub kind: MisreadKind,
}

/// One observed emission in a receiver's inbox ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxEntry {
    pub token: Token,
    pub source_emitted: Tick,
    pub sender: ActorId,
    pub origin: Position,
    pub interrupt: InterruptKind,
    pub transport: Transport,
    pub payload_id: String,
    pub requests_ack: bool,
    pub integrity: f32,
    pub misread: Option<Misread>,
    pub deception_detected: Option<bool>,
    /// Observations of this `(token, emitted)` pair, first included.
    pub repeats: u32,
    pub accepted: bool,
    pub receipted: bool,
    pub ack_enqueued: bool,
    pub lost: bool,
}

/// Runtime state of a receiving actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverState {
    pub config: ReceiverConfig,
    inbox: VecDeque<InboxEntry>,
    interrupts: Vec<Interrupt>,
}

impl ReceiverState {
    #[must_use]
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            inbox: VecDeque::new(),
            interrupts: Vec::new(),
        }
    }

    /// Inbox ledger, oldest first.
    #[must_use]
    pub fn inbox(&self) -> &VecDeque<InboxEntry> {
        &self.inbox
    }

    /// Pending interrupts not yet taken by the reaction layer.
    #[must_use]
    pub fn interrupts(&self) -> &[Interrupt] {
        &self.interrupts
    }

    fn entry_mut(&mut self, token: Token, emitted: Tick) -> Option<&mut InboxEntry> {
        self.inbox
            .iter_mut()
            .find(|e| e.token == token && e.source_emitted == emitted)
    }

    fn push_entry(&mut self, entry: InboxEntry) {
        while self.inbox.len() >= self.config.max_inbox.max(1) {
            self.inbox.pop_front();
        }
        self.inbox.push_back(entry);
    }
}

/// Personality and skill stats consumed from the character system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ActorStats {
    pub intellect: f32,
    pub conviction: f32,
    /// Social-stat proxy for lying when no disguise is active.
    pub guile: f32,
    /// Present while the actor is actively disguising.
    pub disguise_skill: Option<f32>,
}

impl Default for ActorStats {
    fn default() -> Self {
        Self {
            intellect: 0.5,
            conviction: 0.5,
            guile: 0.3,
            disguise_skill: None,
        }
    }
}

impl ActorStats {
    /// Effective lie skill: disguise when active, social proxy otherwise.
    #[must_use]
    pub fn lie_skill(&self) -> f32 {
        clamp01(self.disguise_skill.unwrap_or(self.guile))
    }

    /// Repeat exposures after which a receiver accepts a low-fidelity
    /// message anyway. Low intellect and high conviction raise it.
    #[must_use]
    pub fn yield_threshold(&self) -> u32 {
        let raw = 2.0 + (1.0 - clamp01(self.intellect)) * 12.0 + clamp01(self.conviction) * 16.0;
        raw.round().clamp(2.0, 30.0) as u32
    }
}

/// One entry of a receiver's live perception list (from the perception system).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PerceivedContact {
    pub target: ActorId,
    pub transport: Transport,
    pub confidence: f32,
    pub distance: f32,
}

/// Ambient signal readings a receiver's senses already sampled this tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalPerceptionState {
    pub sound_level: f32,
    pub sound_confidence: f32,
    pub em_level: f32,
    pub em_confidence: f32,
}

impl SignalPerceptionState {
    /// Effective signal quality perceived on a medium-carried transport.
    #[must_use]
    pub fn perceived(&self, transport: Transport) -> f32 {
        match transport {
            Transport::Hearing => self.sound_level * self.sound_confidence,
            Transport::Em => self.em_level * self.em_confidence,
            Transport::Vision | Transport::Paranormal => 0.0,
        }
    }
}

/// A raw detection-threshold crossing from a receiver's low-level senses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SensedSignal {
    pub cell: CellId,
    pub transport: Transport,
    pub strength: f32,
    pub noticed: Tick,
}

/// Entry of the per-receiver interrupt queue consumed by the reaction layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interrupt {
    pub kind: InterruptKind,
    pub sender: ActorId,
    pub token: Token,
    pub integrity: f32,
    pub misread: Option<Misread>,
    pub deception_detected: Option<bool>,
}

/// Domain-level record registered by the semantic layer for a pending token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticRecord {
    pub intent: String,
    pub registered: Tick,
}

/// Pluggable token → semantic-record table populated by the layer above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticTable {
    records: HashMap<Token, SemanticRecord>,
}

impl SemanticTable {
    /// Register the semantic intent behind a token.
    pub fn register(&mut self, token: Token, intent: impl Into<String>, now: Tick) {
        self.records.insert(
            token,
            SemanticRecord {
                intent: intent.into(),
                registered: now,
            },
        );
    }

    /// Look up the record for a token, if the higher layer registered one.
    #[must_use]
    pub fn lookup(&self, token: Token) -> Option<&SemanticRecord> {
        self.records.get(&token)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when no records are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn gc(&mut self, now: Tick, window: u32) -> u64 {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.registered.0 + u64::from(window) >= now.0);
        (before - self.records.len()) as u64
    }
}

/// Receipt handed to the semantic layer for one accepted delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub token: Token,
    pub receiver: ActorId,
    pub sender: ActorId,
    pub transport: Transport,
    pub interrupt: InterruptKind,
    pub intent: Option<String>,
    pub integrity: f32,
    pub deception_detected: Option<bool>,
    pub requests_ack: bool,
    pub payload_id: String,
    pub tick: Tick,
}

/// Monotonic observability counters; failures are counted, never thrown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommsCounters {
    pub messages_emitted: u64,
    pub messages_dropped: u64,
    pub stream_evictions: u64,
    pub deliveries: u64,
    pub messages_lost: u64,
    pub misreads: u64,
    pub deceptions_detected: u64,
    pub acks_enqueued: u64,
    pub acks_confirmed: u64,
    pub receipts_processed: u64,
    pub semantic_discarded: u64,
}

/// Per-tick delta summary emitted to sinks and retained in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickReport {
    pub tick: Tick,
    /// True when the pipeline was gated off (paused or playback).
    pub skipped: bool,
    pub emitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub lost: u64,
    pub acks_confirmed: u64,
    pub receipts: u64,
    pub stream_len: usize,
}

impl TickReport {
    fn skipped_at(tick: Tick) -> Self {
        Self {
            tick,
            skipped: true,
            emitted: 0,
            delivered: 0,
            dropped: 0,
            lost: 0,
            acks_confirmed: 0,
            receipts: 0,
            stream_len: 0,
        }
    }

    fn from_delta(tick: Tick, before: &CommsCounters, after: &CommsCounters, stream_len: usize) -> Self {
        Self {
            tick,
            skipped: false,
            emitted: after.messages_emitted - before.messages_emitted,
            delivered: after.deliveries - before.deliveries,
            dropped: after.messages_dropped - before.messages_dropped,
            lost: after.messages_lost - before.messages_lost,
            acks_confirmed: after.acks_confirmed - before.acks_confirmed,
            receipts: after.receipts_processed - before.receipts_processed,
            stream_len,
        }
    }
}

/// Sink invoked after each processed tick.
pub trait CommsSink: Send {
    fn on_tick(&mut self, report: &TickReport);
}

/// No-op sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl CommsSink for NullSink {
    fn on_tick(&mut self, _report: &TickReport) {}
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum CommsError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Field substrate rejected its configuration.
    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Static configuration for a Hearsay world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommsConfig {
    /// Width of the world in world units.
    pub world_width: u32,
    /// Height of the world in world units.
    pub world_height: u32,
    /// Size of one signal cell in world units (must evenly divide width/height).
    pub cell_size: u32,
    /// Shared per-tick emission/delivery budget across all actors.
    pub max_messages_per_tick: u32,
    /// Ticks a message stays observable after emission.
    pub max_message_age_ticks: u32,
    /// Maximum live messages in the shared stream.
    pub max_stream: usize,
    /// Multiplier from intent strength to deposited field level.
    pub emission_scale: f32,
    /// Cap on any single field cell level.
    pub max_field_strength: f32,
    /// Per-channel ambient decay factors.
    pub decay: ChannelDecay,
    /// Medium filling cells without an override.
    pub default_medium: MediumKind,
    /// Integrity at or above which a message is accepted outright.
    pub accept_threshold: f32,
    /// Age penalty per tick when ranking broadcast candidates.
    pub broadcast_age_penalty: f32,
    /// Effective secrecy above which an unreadable message is lost.
    pub secrecy_loss_threshold: f32,
    /// Integrity below which secrecy loss applies.
    pub secrecy_integrity_floor: f32,
    /// Integrity bucket boundaries for misread severity.
    pub misread_critical_below: f32,
    pub misread_major_below: f32,
    /// How much an accomplished liar suppresses deception detection.
    pub lie_skill_discount: f32,
    /// Ticks an orphaned semantic record survives before garbage collection.
    pub semantic_window_ticks: u32,
    /// Maximum number of recent tick reports retained in-memory.
    pub history_capacity: usize,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            world_width: 2_400,
            world_height: 2_400,
            cell_size: 40,
            max_messages_per_tick: 64,
            max_message_age_ticks: 90,
            max_stream: 256,
            emission_scale: 0.9,
            max_field_strength: 1.0,
            decay: ChannelDecay::default(),
            default_medium: MediumKind::Atmosphere,
            accept_threshold: 0.55,
            broadcast_age_penalty: 0.01,
            secrecy_loss_threshold: 0.5,
            secrecy_integrity_floor: 0.25,
            misread_critical_below: 0.15,
            misread_major_below: 0.30,
            lie_skill_discount: 0.6,
            semantic_window_ticks: 600,
            history_capacity: 256,
        }
    }
}

impl CommsConfig {
    /// Validates the configuration, returning derived grid dimensions.
    fn grid_dimensions(&self) -> Result<(u32, u32), CommsError> {
        if self.world_width == 0 || self.world_height == 0 {
            return Err(CommsError::InvalidConfig(
                "world dimensions must be non-zero",
            ));
        }
        if self.cell_size == 0 {
            return Err(CommsError::InvalidConfig("cell_size must be non-zero"));
        }
        if !self.world_width.is_multiple_of(self.cell_size)
            || !self.world_height.is_multiple_of(self.cell_size)
        {
            return Err(CommsError::InvalidConfig(
                "world dimensions must be divisible by cell_size",
            ));
        }
        if self.max_stream == 0 {
            return Err(CommsError::InvalidConfig("max_stream must be non-zero"));
        }
        if self.max_message_age_ticks == 0 {
            return Err(CommsError::InvalidConfig(
                "max_message_age_ticks must be non-zero",
            ));
        }
        if self.history_capacity == 0 {
            return Err(CommsError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        if self.emission_scale < 0.0 || self.max_field_strength <= 0.0 {
            return Err(CommsError::InvalidConfig(
                "emission_scale must be non-negative and max_field_strength positive",
            ));
        }
        let unit_bounded = [
            self.accept_threshold,
            self.secrecy_loss_threshold,
            self.secrecy_integrity_floor,
            self.misread_critical_below,
            self.misread_major_below,
            self.lie_skill_discount,
        ];
        if unit_bounded.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(CommsError::InvalidConfig(
                "thresholds and discounts must lie in [0, 1]",
            ));
        }
        if self.misread_critical_below > self.misread_major_below {
            return Err(CommsError::InvalidConfig(
                "misread severity buckets must be ordered",
            ));
        }
        if self.broadcast_age_penalty < 0.0 {
            return Err(CommsError::InvalidConfig(
                "broadcast_age_penalty must be non-negative",
            ));
        }
        Ok((
            self.world_width / self.cell_size,
            self.world_height / self.cell_size,
        ))
    }
}

/// Deterministic token for one emission lineage.
fn emission_token(
    first_emit: Tick,
    sender: ActorId,
    payload_id: &str,
    interrupt: InterruptKind,
) -> Token {
    let mut h = mix64(first_emit.0 ^ SALT_TOKEN);
    h = mix64(h ^ sender.data().as_ffi());
    h = mix64(h ^ fnv1a(payload_id.as_bytes()));
    h = mix64(h ^ interrupt.code());
    Token((h ^ (h >> 32)) as u32)
}

/// Channel resolution order: vision first, hearing last.
const TRANSPORT_PRIORITY: [Transport; 4] = [
    Transport::Vision,
    Transport::Paranormal,
    Transport::Em,
    Transport::Hearing,
];

/// Pick the concrete channel for an emission, or `None` when nothing survives
/// the medium filter.
fn resolve_transport(wanted: TransportMask, supported: TransportMask) -> Option<Transport> {
    let candidates = wanted.intersect(supported);
    TRANSPORT_PRIORITY
        .into_iter()
        .find(|t| candidates.contains(*t))
}

/// Outcome of running the shared decode algorithm for one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Decoded {
    integrity: f32,
    misread: Option<Misread>,
    deception_detected: Option<bool>,
    lost: bool,
}

/// Shared decode algorithm: integrity, deception detection, secrecy loss,
/// and misread classification for one observation.
fn decode(
    config: &CommsConfig,
    message: &Message,
    receiver: ActorId,
    receiver_cfg: &ReceiverConfig,
    sender_lie_skill: f32,
    signal01: f32,
) -> Decoded {
    let integrity = clamp01(
        clamp01(signal01) * clamp01(message.clarity) * clamp01(receiver_cfg.decode_skill)
            - clamp01(receiver_cfg.noise_floor),
    );

    let deception_detected = if message.deception > 0.0 || message.flags.deceptive {
        let detect_chance = clamp01(receiver_cfg.deception_detect_skill)
            * clamp01(message.deception)
            * (1.0 - sender_lie_skill * config.lie_skill_discount);
        Some(roll_unit(message.token, receiver, SALT_DECEPTION) < detect_chance)
    } else {
        None
    };

    if message.secrecy > 0.0 || message.flags.encrypted {
        let effective = clamp01(message.secrecy)
            * (1.0 - clamp01(receiver_cfg.secrecy_bypass_skill));
        if effective > config.secrecy_loss_threshold && integrity < config.secrecy_integrity_floor
        {
            return Decoded {
                integrity,
                misread: None,
                deception_detected,
                lost: true,
            };
        }
    }

    let mis_chance = receiver_cfg.misread_chance_scale.max(0.0) * (1.0 - integrity);
    let misread = if roll_unit(message.token, receiver, SALT_MISREAD) < mis_chance {
        let severity = if integrity < config.misread_critical_below {
            MisreadSeverity::Critical
        } else if integrity < config.misread_major_below {
            MisreadSeverity::Major
        } else {
            MisreadSeverity::Moderate
        };
        let kind = match (roll_unit(message.token, receiver, SALT_MISREAD_KIND) * 3.0) as u32 {
            0 => MisreadKind::GarbledContent,
            1 => MisreadKind::WrongUrgency,
            _ => MisreadKind::MisattributedSender,
        };
        Some(Misread { severity, kind })
    } else {
        None
    };

    Decoded {
        integrity,
        misread,
        deception_detected,
        lost: false,
    }
}

/// Aggregate world state: actors, their comms buffers, the shared stream and
/// the ambient field, advanced one deterministic tick at a time.
pub struct CommsWorld {
    config: CommsConfig,
    tick: Tick,
    paused: bool,
    playback: bool,
    actors: SlotMap<ActorId, Position>,
    stats: ActorMap<ActorStats>,
    senders: ActorMap<SenderState>,
    receivers: ActorMap<ReceiverState>,
    perception: ActorMap<Vec<PerceivedContact>>,
    ambient: ActorMap<SignalPerceptionState>,
    sensed: ActorMap<Vec<SensedSignal>>,
    stream: MessageStream,
    field: SignalGrid,
    medium: MediumMap,
    semantic: SemanticTable,
    receipts: Vec<Receipt>,
    pending_acks: Vec<(ActorId, OutboxEntry)>,
    counters: CommsCounters,
    history: VecDeque<TickReport>,
    sink: Box<dyn CommsSink>,
}

impl fmt::Debug for CommsWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommsWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("actor_count", &self.actors.len())
            .field("stream_len", &self.stream.len())
            .finish()
    }
}

impl CommsWorld {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: CommsConfig) -> Result<Self, CommsError> {
        Self::with_sink(config, Box::new(NullSink))
    }

    /// Instantiate a new world using the supplied configuration and sink.
    pub fn with_sink(config: CommsConfig, sink: Box<dyn CommsSink>) -> Result<Self, CommsError> {
        let (grid_w, grid_h) = config.grid_dimensions()?;
        let field = SignalGrid::new(grid_w, grid_h, config.cell_size as f32, config.decay)?;
        let history_capacity = config.history_capacity;
        Ok(Self {
            medium: MediumMap::new(config.default_medium),
            stream: MessageStream::new(config.max_stream),
            field,
            config,
            tick: Tick::zero(),
            paused: false,
            playback: false,
            actors: SlotMap::with_key(),
            stats: ActorMap::new(),
            senders: ActorMap::new(),
            receivers: ActorMap::new(),
            perception: ActorMap::new(),
            ambient: ActorMap::new(),
            sensed: ActorMap::new(),
            semantic: SemanticTable::default(),
            receipts: Vec::new(),
            pending_acks: Vec::new(),
            counters: CommsCounters::default(),
            history: VecDeque::with_capacity(history_capacity),
            sink,
        })
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Gate the pipeline off while the simulation is paused.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Gate the pipeline off while replaying recorded state.
    pub fn set_playback(&mut self, playback: bool) {
        self.playback = playback;
    }

    /// Replace the report sink.
    pub fn set_sink(&mut self, sink: Box<dyn CommsSink>) {
        self.sink = sink;
    }

    /// Spawn an actor at `position` with default stats.
    pub fn spawn_actor(&mut self, position: Position) -> ActorId {
        let id = self.actors.insert(position);
        self.stats.insert(id, ActorStats::default());
        id
    }

    /// Remove an actor and all of its communication state.
    pub fn remove_actor(&mut self, id: ActorId) -> Option<Position> {
        self.stats.remove(id);
        self.senders.remove(id);
        self.receivers.remove(id);
        self.perception.remove(id);
        self.ambient.remove(id);
        self.sensed.remove(id);
        self.actors.remove(id)
    }

    /// Number of live actors.
    #[must_use]
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Current position of an actor.
    #[must_use]
    pub fn position(&self, id: ActorId) -> Option<Position> {
        self.actors.get(id).copied()
    }

    /// Move an actor.
    pub fn set_position(&mut self, id: ActorId, position: Position) {
        if let Some(slot) = self.actors.get_mut(id) {
            *slot = position;
        }
    }

    /// Replace an actor's stats.
    pub fn set_stats(&mut self, id: ActorId, stats: ActorStats) {
        if self.actors.contains_key(id) {
            self.stats.insert(id, stats);
        }
    }

    /// Give an actor a sender role with the provided preferred channels.
    pub fn enable_sender(&mut self, id: ActorId, preferred: TransportMask) {
        if self.actors.contains_key(id) {
            self.senders.insert(
                id,
                SenderState {
                    outbox: Vec::new(),
                    focus: 0.0,
                    preferred,
                },
            );
        }
    }

    /// Give an actor a receiver role.
    pub fn enable_receiver(&mut self, id: ActorId, config: ReceiverConfig) {
        if self.actors.contains_key(id) {
            self.receivers.insert(id, ReceiverState::new(config));
        }
    }

    /// Borrow a sender's state.
    #[must_use]
    pub fn sender(&self, id: ActorId) -> Option<&SenderState> {
        self.senders.get(id)
    }

    /// Mutably borrow a sender's state (focus replenishment, outbox edits).
    #[must_use]
    pub fn sender_mut(&mut self, id: ActorId) -> Option<&mut SenderState> {
        self.senders.get_mut(id)
    }

    /// Borrow a receiver's state.
    #[must_use]
    pub fn receiver(&self, id: ActorId) -> Option<&ReceiverState> {
        self.receivers.get(id)
    }

    /// Mutably borrow a receiver's state.
    #[must_use]
    pub fn receiver_mut(&mut self, id: ActorId) -> Option<&mut ReceiverState> {
        self.receivers.get_mut(id)
    }

    /// Queue a communicative intent on a sender's outbox.
    /// Returns false when the actor has no sender role.
    pub fn queue_intent(&mut self, id: ActorId, mut entry: OutboxEntry) -> bool {
        let Some(sender) = self.senders.get_mut(id) else {
            return false;
        };
        entry.created = self.tick;
        if entry.next_emit.0 < self.tick.0 {
            entry.next_emit = self.tick;
        }
        sender.outbox.push(entry);
        true
    }

    /// Replace a receiver's live perception list (perception system input).
    pub fn set_perception(&mut self, id: ActorId, contacts: Vec<PerceivedContact>) {
        if self.actors.contains_key(id) {
            self.perception.insert(id, contacts);
        }
    }

    /// Replace a receiver's ambient signal readings (perception system input).
    pub fn set_ambient(&mut self, id: ActorId, state: SignalPerceptionState) {
        if self.actors.contains_key(id) {
            self.ambient.insert(id, state);
        }
    }

    /// Append a raw detection-threshold crossing for the broadcast path.
    pub fn push_sensed(&mut self, id: ActorId, signal: SensedSignal) {
        if !self.actors.contains_key(id) {
            return;
        }
        if let Some(list) = self.sensed.get_mut(id) {
            list.push(signal);
        } else {
            self.sensed.insert(id, vec![signal]);
        }
    }

    /// Convenience stand-in for the perception system: sample the ambient
    /// field at each receiver's own cell with full confidence.
    pub fn refresh_ambient_from_field(&mut self) {
        let now = self.tick.0;
        let ids: Vec<ActorId> = self.receivers.keys().collect();
        for id in ids {
            let Some(position) = self.actors.get(id).copied() else {
                continue;
            };
            let cell = self.field.cell_at(position.x, position.y);
            let state = SignalPerceptionState {
                sound_level: self.field.ambient(cell, SignalChannel::Sound, now),
                sound_confidence: 1.0,
                em_level: self.field.ambient(cell, SignalChannel::Em, now),
                em_confidence: 1.0,
            };
            self.ambient.insert(id, state);
        }
    }

    /// Register the semantic intent behind a token (layer-above input).
    pub fn register_semantic(&mut self, token: Token, intent: impl Into<String>) {
        let now = self.tick;
        self.semantic.register(token, intent, now);
    }

    /// Semantic table, for inspection.
    #[must_use]
    pub fn semantic(&self) -> &SemanticTable {
        &self.semantic
    }

    /// Take all pending interrupts for an actor (reaction layer output).
    pub fn take_interrupts(&mut self, id: ActorId) -> Vec<Interrupt> {
        self.receivers
            .get_mut(id)
            .map(|state| std::mem::take(&mut state.interrupts))
            .unwrap_or_default()
    }

    /// Drain all receipts produced by the semantic bridge.
    pub fn drain_receipts(&mut self) -> Vec<Receipt> {
        std::mem::take(&mut self.receipts)
    }

    /// Shared message stream, for inspection.
    #[must_use]
    pub fn stream(&self) -> &MessageStream {
        &self.stream
    }

    /// Ambient signal field.
    #[must_use]
    pub fn field(&self) -> &SignalGrid {
        &self.field
    }

    /// Medium lookup, mutable for scenario setup.
    #[must_use]
    pub fn medium_mut(&mut self) -> &mut MediumMap {
        &mut self.medium
    }

    /// Observability counters.
    #[must_use]
    pub const fn counters(&self) -> &CommsCounters {
        &self.counters
    }

    /// Iterate over retained tick reports.
    pub fn history(&self) -> impl Iterator<Item = &TickReport> {
        self.history.iter()
    }

    /// Execute one pipeline tick. No-ops (without mutating any buffer) while
    /// paused or in playback mode.
    pub fn step(&mut self) -> TickReport {
        if self.paused || self.playback {
            return TickReport::skipped_at(self.tick);
        }
        let now = self.tick.next();
        let before = self.counters;
        let mut budget = self.config.max_messages_per_tick;

        self.stage_outbox_drain(now, &mut budget);
        self.stage_targeted_delivery(now, &mut budget);
        self.stage_vision_delivery(now, &mut budget);
        self.stage_broadcast_delivery(now, &mut budget);
        self.flush_pending_acks(now);
        self.stage_semantic_bridge(now);
        self.stream.prune_expired(now);

        self.tick = now;
        let report = TickReport::from_delta(now, &before, &self.counters, self.stream.len());
        self.sink.on_tick(&report);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(report.clone());
        report
    }

    /// Outbox drain: the only stage that creates messages or writes the field.
    fn stage_outbox_drain(&mut self, now: Tick, budget: &mut u32) {
        let ids: Vec<ActorId> = self.senders.keys().collect();
        for id in ids {
            let Some(origin) = self.actors.get(id).copied() else {
                continue;
            };
            let (mut entries, mut focus, preferred_default) = {
                let Some(sender) = self.senders.get_mut(id) else {
                    continue;
                };
                (
                    std::mem::take(&mut sender.outbox),
                    sender.focus,
                    sender.preferred,
                )
            };

            let mut kept = Vec::with_capacity(entries.len());
            for mut entry in entries.drain(..) {
                if *budget == 0 || entry.next_emit.0 > now.0 {
                    kept.push(entry);
                    continue;
                }
                if entry.attempts >= entry.max_attempts
                    || now.0 > entry.created.0 + u64::from(entry.ttl_ticks)
                {
                    self.counters.messages_dropped += 1;
                    continue;
                }
                if entry.strength <= 0.0 {
                    self.counters.messages_dropped += 1;
                    continue;
                }
                if entry.focus_cost > 0.0 && focus < entry.focus_cost {
                    // Deferred, never silently dropped.
                    entry.next_emit = Tick(now.0 + u64::from(entry.cadence_ticks.max(1)));
                    kept.push(entry);
                    continue;
                }

                let cell = self.field.cell_at(origin.x, origin.y);
                let supported = self.medium.at(cell).supported();
                let wanted = entry.preferred.unwrap_or(preferred_default);
                let Some(transport) = resolve_transport(wanted, supported) else {
                    self.counters.messages_dropped += 1;
                    continue;
                };

                if entry.focus_cost > 0.0 {
                    focus -= entry.focus_cost;
                }
                if let Some(channel) = transport.carrier_channel() {
                    self.field.deposit(
                        cell,
                        channel,
                        entry.strength * self.config.emission_scale,
                        self.config.max_field_strength,
                        now.0,
                    );
                }

                let first_emit = *entry.first_emit.get_or_insert(now);
                let token = *entry.token.get_or_insert_with(|| {
                    emission_token(first_emit, id, &entry.payload_id, entry.interrupt)
                });

                let message = Message {
                    token,
                    emitted: now,
                    expires: Tick(now.0 + u64::from(self.config.max_message_age_ticks)),
                    cell,
                    sender: id,
                    origin,
                    interrupt: entry.interrupt,
                    priority: entry.priority,
                    payload_id: entry.payload_id.clone(),
                    transport,
                    strength: entry.strength,
                    clarity: entry.clarity,
                    deception: entry.deception,
                    secrecy: entry.secrecy,
                    target: entry.target,
                    ack_of: entry.ack_of,
                    flags: entry.flags,
                };
                if self.stream.push(message) {
                    self.counters.stream_evictions += 1;
                    self.counters.messages_dropped += 1;
                }
                self.counters.messages_emitted += 1;
                *budget -= 1;

                entry.attempts += 1;
                if entry.flags.requests_ack {
                    // Re-armed until an ack arrives or attempts run out.
                    entry.next_emit = Tick(now.0 + u64::from(entry.cadence_ticks.max(1)));
                    kept.push(entry);
                }
            }

            if let Some(sender) = self.senders.get_mut(id) {
                sender.outbox = kept;
                sender.focus = focus;
            }
        }
    }

    /// Targeted Hearing/EM delivery via the receiver's sampled ambient state.
    fn stage_targeted_delivery(&mut self, now: Tick, budget: &mut u32) {
        let candidates: Vec<Message> = self
            .stream
            .iter_visible(now)
            .filter(|m| {
                m.target.is_some() && matches!(m.transport, Transport::Hearing | Transport::Em)
            })
            .cloned()
            .collect();
        if candidates.is_empty() {
            return;
        }

        // Signal sourcing is read-only and parallel; application is serial
        // under the shared budget.
        let ambient = &self.ambient;
        let signals: Vec<f32> = candidates
            .par_iter()
            .map(|message| {
                message.target.map_or(0.0, |target| {
                    ambient
                        .get(target)
                        .map_or(0.0, |state| state.perceived(message.transport))
                })
            })
            .collect();

        for (message, signal01) in candidates.iter().zip(signals) {
            if *budget == 0 {
                break;
            }
            if signal01 <= 0.0 {
                continue;
            }
            let Some(target) = message.target else {
                continue;
            };
            self.apply_delivery(target, message, signal01, now, budget);
        }
    }

    /// Vision delivery: requires a live perception contact with the sender.
    fn stage_vision_delivery(&mut self, now: Tick, budget: &mut u32) {
        let candidates: Vec<Message> = self
            .stream
            .iter_visible(now)
            .filter(|m| m.target.is_some() && m.transport == Transport::Vision)
            .cloned()
            .collect();

        for message in candidates {
            if *budget == 0 {
                break;
            }
            let Some(target) = message.target else {
                continue;
            };
            let confidence = self.perception.get(target).and_then(|contacts| {
                contacts
                    .iter()
                    .find(|c| c.target == message.sender && c.transport == Transport::Vision)
                    .map(|c| c.confidence)
            });
            let Some(confidence) = confidence else {
                continue;
            };
            if confidence <= 0.0 {
                continue;
            }
            self.apply_delivery(target, &message, confidence, now, budget);
        }
    }

    /// Broadcast fallback: match raw detection-threshold crossings against
    /// same-cell, same-channel messages. Raw signals are consumed either way.
    fn stage_broadcast_delivery(&mut self, now: Tick, budget: &mut u32) {
        let ids: Vec<ActorId> = self.sensed.keys().collect();
        for receiver_id in ids {
            let signals = self
                .sensed
                .get_mut(receiver_id)
                .map(std::mem::take)
                .unwrap_or_default();
            for sensed in signals {
                if *budget == 0 {
                    break;
                }
                let age_penalty = self.config.broadcast_age_penalty;
                let best = self
                    .stream
                    .iter_visible(now)
                    .filter(|m| {
                        m.cell == sensed.cell
                            && m.transport == sensed.transport
                            && (m.target.is_none() || m.target == Some(receiver_id))
                    })
                    .max_by_key(|m| {
                        OrderedFloat(m.strength - age_penalty * m.age_at(now) as f32)
                    })
                    .cloned();
                let Some(message) = best else {
                    continue;
                };
                self.apply_delivery(receiver_id, &message, sensed.strength, now, budget);
            }
        }
    }

    /// Shared accept-or-drop path for all three delivery systems.
    fn apply_delivery(
        &mut self,
        receiver_id: ActorId,
        message: &Message,
        signal01: f32,
        now: Tick,
        budget: &mut u32,
    ) {
        if *budget == 0 {
            return;
        }
        let Some(receiver_cfg) = self.receivers.get(receiver_id).map(|s| s.config) else {
            return;
        };
        if !receiver_cfg.enabled || !receiver_cfg.transport_mask.contains(message.transport) {
            return;
        }

        if message.interrupt == InterruptKind::AckReceived {
            self.process_ack(receiver_id, message, budget);
            return;
        }

        let sender_lie_skill = self
            .stats
            .get(message.sender)
            .copied()
            .unwrap_or_default()
            .lie_skill();
        let decoded = decode(
            &self.config,
            message,
            receiver_id,
            &receiver_cfg,
            sender_lie_skill,
            signal01,
        );
        let yield_threshold = self
            .stats
            .get(receiver_id)
            .copied()
            .unwrap_or_default()
            .yield_threshold();
        let accept_threshold = self.config.accept_threshold;

        let Some(state) = self.receivers.get_mut(receiver_id) else {
            return;
        };

        if let Some(entry) = state.entry_mut(message.token, message.emitted) {
            // Re-observation: count the repeat, never duplicate effects.
            entry.repeats += 1;
            *budget -= 1;
            self.counters.deliveries += 1;
            if entry.lost || entry.accepted {
                return;
            }
            entry.integrity = entry.integrity.max(decoded.integrity);
            if entry.integrity >= accept_threshold || entry.repeats >= yield_threshold {
                entry.accepted = true;
                let interrupt = Interrupt {
                    kind: entry.interrupt,
                    sender: entry.sender,
                    token: entry.token,
                    integrity: entry.integrity,
                    misread: entry.misread,
                    deception_detected: entry.deception_detected,
                };
                state.interrupts.push(interrupt);
                if message.flags.requests_ack {
                    self.maybe_enqueue_ack(receiver_id, message, now);
                }
            }
            return;
        }

        *budget -= 1;
        self.counters.deliveries += 1;

        if decoded.lost {
            // Secrecy loss: consume the source, emit nothing decodable.
            state.push_entry(InboxEntry {
                token: message.token,
                source_emitted: message.emitted,
                sender: message.sender,
                origin: message.origin,
                interrupt: message.interrupt,
                transport: message.transport,
                payload_id: message.payload_id.clone(),
                requests_ack: message.flags.requests_ack,
                integrity: decoded.integrity,
                misread: None,
                deception_detected: decoded.deception_detected,
                repeats: 1,
                accepted: false,
                receipted: true,
                ack_enqueued: false,
                lost: true,
            });
            self.counters.messages_lost += 1;
            return;
        }

        if decoded.misread.is_some() {
            self.counters.misreads += 1;
        }
        if decoded.deception_detected == Some(true) {
            self.counters.deceptions_detected += 1;
        }

        // A first observation accepts on integrity alone; the yield rule only
        // comes into play on repeats.
        let accepted = decoded.integrity >= accept_threshold;
        state.push_entry(InboxEntry {
            token: message.token,
            source_emitted: message.emitted,
            sender: message.sender,
            origin: message.origin,
            interrupt: message.interrupt,
            transport: message.transport,
            payload_id: message.payload_id.clone(),
            requests_ack: message.flags.requests_ack,
            integrity: decoded.integrity,
            misread: decoded.misread,
            deception_detected: decoded.deception_detected,
            repeats: 1,
            accepted,
            receipted: false,
            ack_enqueued: false,
            lost: false,
        });

        // Signal-of-contact hook, emitted regardless of acceptance.
        state.interrupts.push(Interrupt {
            kind: InterruptKind::MessageReceived,
            sender: message.sender,
            token: message.token,
            integrity: decoded.integrity,
            misread: decoded.misread,
            deception_detected: decoded.deception_detected,
        });
        if accepted {
            state.interrupts.push(Interrupt {
                kind: message.interrupt,
                sender: message.sender,
                token: message.token,
                integrity: decoded.integrity,
                misread: decoded.misread,
                deception_detected: decoded.deception_detected,
            });
            if message.flags.requests_ack {
                self.maybe_enqueue_ack(receiver_id, message, now);
            }
        }
    }

    /// Ack receipt: cancel the original sender's re-armed entries. Needs no
    /// further decoding.
    fn process_ack(&mut self, receiver_id: ActorId, message: &Message, budget: &mut u32) {
        let Some(state) = self.receivers.get_mut(receiver_id) else {
            return;
        };
        if let Some(entry) = state.entry_mut(message.token, message.emitted) {
            entry.repeats += 1;
            *budget -= 1;
            self.counters.deliveries += 1;
            return;
        }
        state.push_entry(InboxEntry {
            token: message.token,
            source_emitted: message.emitted,
            sender: message.sender,
            origin: message.origin,
            interrupt: InterruptKind::AckReceived,
            transport: message.transport,
            payload_id: message.payload_id.clone(),
            requests_ack: false,
            integrity: 1.0,
            misread: None,
            deception_detected: None,
            repeats: 1,
            accepted: true,
            receipted: true,
            ack_enqueued: false,
            lost: false,
        });
        state.interrupts.push(Interrupt {
            kind: InterruptKind::AckReceived,
            sender: message.sender,
            token: message.token,
            integrity: 1.0,
            misread: None,
            deception_detected: None,
        });
        *budget -= 1;
        self.counters.deliveries += 1;

        let Some(confirmed) = message.ack_of else {
            return;
        };
        if let Some(sender_state) = self.senders.get_mut(receiver_id) {
            sender_state
                .outbox
                .retain(|entry| !(entry.token == Some(confirmed) && entry.flags.requests_ack));
        }
        self.counters.acks_confirmed += 1;
    }

    /// Queue an acknowledgement back to the sender unless one is already
    /// pending or was already sent for the same token. Dedupe is per token,
    /// not per emission, so re-emissions never re-trigger acks.
    fn maybe_enqueue_ack(&mut self, receiver_id: ActorId, message: &Message, now: Tick) {
        let already_pending = self
            .receivers
            .get(receiver_id)
            .is_some_and(|s| {
                s.inbox
                    .iter()
                    .any(|e| e.token == message.token && e.ack_enqueued)
            })
            || self
                .pending_acks
                .iter()
                .any(|(id, e)| *id == receiver_id && e.ack_of == Some(message.token))
            || self.senders.get(receiver_id).is_some_and(|s| {
                s.outbox.iter().any(|e| e.ack_of == Some(message.token))
            });
        if already_pending {
            return;
        }
        if let Some(entry) = self
            .receivers
            .get_mut(receiver_id)
            .and_then(|s| s.entry_mut(message.token, message.emitted))
        {
            entry.ack_enqueued = true;
        }

        let mut ack = OutboxEntry::new(InterruptKind::AckReceived, message.payload_id.clone());
        ack.target = Some(message.sender);
        ack.ack_of = Some(message.token);
        ack.strength = 0.6;
        ack.cadence_ticks = 1;
        ack.ttl_ticks = 60;
        ack.created = now;
        ack.next_emit = now.next();
        self.pending_acks.push((receiver_id, ack));
        self.counters.acks_enqueued += 1;
    }

    /// Flush ack entries created during the delivery passes into their
    /// senders' outboxes.
    fn flush_pending_acks(&mut self, _now: Tick) {
        for (id, entry) in std::mem::take(&mut self.pending_acks) {
            if !self.actors.contains_key(id) {
                continue;
            }
            if self.senders.get(id).is_none() {
                self.senders.insert(
                    id,
                    SenderState {
                        outbox: Vec::new(),
                        focus: 0.0,
                        preferred: TransportMask::of(&[Transport::Hearing, Transport::Em]),
                    },
                );
            }
            if let Some(sender) = self.senders.get_mut(id) {
                sender.outbox.push(entry);
            }
        }
    }

    /// Semantic bridge: turn newly accepted entries into receipts, drop
    /// entries that can no longer be re-observed, GC orphaned records.
    fn stage_semantic_bridge(&mut self, now: Tick) {
        let ids: Vec<ActorId> = self.receivers.keys().collect();
        for receiver_id in ids {
            let Some(state) = self.receivers.get_mut(receiver_id) else {
                continue;
            };
            for entry in state.inbox.iter_mut() {
                if !entry.accepted || entry.receipted {
                    continue;
                }
                entry.receipted = true;
                let intent = self
                    .semantic
                    .lookup(entry.token)
                    .map(|record| record.intent.clone());
                self.receipts.push(Receipt {
                    token: entry.token,
                    receiver: receiver_id,
                    sender: entry.sender,
                    transport: entry.transport,
                    interrupt: entry.interrupt,
                    intent,
                    integrity: entry.integrity,
                    deception_detected: entry.deception_detected,
                    requests_ack: entry.requests_ack,
                    payload_id: entry.payload_id.clone(),
                    tick: now,
                });
                self.counters.receipts_processed += 1;
            }
            // Keep ledger entries only while the source emission could still
            // be re-observed; the dedupe invariant needs nothing longer.
            let max_age = u64::from(self.config.max_message_age_ticks);
            state
                .inbox
                .retain(|entry| entry.source_emitted.0 + max_age >= now.0);
        }
        let discarded = self.semantic.gc(now, self.config.semantic_window_ticks);
        self.counters.semantic_discarded += discarded;
    }
}
