//! Ambient signal substrate for the Hearsay communication pipeline.
//!
//! A [`SignalGrid`] buckets world positions into cells and stores per-cell
//! scent/sound/EM levels that decay exponentially over elapsed ticks. Decay is
//! applied lazily: writes settle a cell to the current tick before adding,
//! reads compute the decayed value without mutating, so untouched cells cost
//! nothing per tick.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted when constructing field state.
#[derive(Debug, Error)]
pub enum FieldError {
    /// Indicates configuration values that cannot be used (e.g., zero grid dimensions).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Physical means of carrying a message between actors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Pressure waves through the surrounding medium.
    Hearing,
    /// Electromagnetic emission (radio, light pulses).
    Em,
    /// Line-of-sight gestures and displays.
    Vision,
    /// Channels that ignore the medium entirely.
    Paranormal,
}

impl Transport {
    /// Bit used by [`TransportMask`] for this transport.
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Hearing => 0b0001,
            Self::Em => 0b0010,
            Self::Vision => 0b0100,
            Self::Paranormal => 0b1000,
        }
    }

    /// The ambient channel this transport leaves traces in, if any.
    #[must_use]
    pub const fn carrier_channel(self) -> Option<SignalChannel> {
        match self {
            Self::Hearing => Some(SignalChannel::Sound),
            Self::Em => Some(SignalChannel::Em),
            Self::Vision | Self::Paranormal => None,
        }
    }
}

/// Bit set of transports an actor can emit or sense on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportMask(pub u8);

impl TransportMask {
    /// Empty mask.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// Mask covering every transport.
    #[must_use]
    pub const fn all() -> Self {
        Self(0b1111)
    }

    /// Build a mask from individual transports.
    #[must_use]
    pub fn of(transports: &[Transport]) -> Self {
        Self(transports.iter().fold(0, |acc, t| acc | t.bit()))
    }

    /// Whether the mask contains `transport`.
    #[must_use]
    pub const fn contains(self, transport: Transport) -> bool {
        self.0 & transport.bit() != 0
    }

    /// Intersection of two masks.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Union of two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether no transport survives.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Ambient environment filling a cell, filtering which transports propagate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediumKind {
    /// Breathable gas; carries everything.
    #[default]
    Atmosphere,
    /// No pressure medium; sound cannot propagate.
    Vacuum,
    /// Dense water column; EM attenuates to nothing.
    Underwater,
}

impl MediumKind {
    /// Transports this medium can carry.
    #[must_use]
    pub const fn supported(self) -> TransportMask {
        match self {
            Self::Atmosphere => TransportMask::all(),
            Self::Vacuum => TransportMask(
                Transport::Em.bit() | Transport::Vision.bit() | Transport::Paranormal.bit(),
            ),
            Self::Underwater => TransportMask(
                Transport::Hearing.bit() | Transport::Vision.bit() | Transport::Paranormal.bit(),
            ),
        }
    }
}

/// Spatial bucket identifier (flat row-major cell index).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct CellId(pub u32);

/// Medium lookup: a world-wide default plus sparse per-cell overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediumMap {
    default: MediumKind,
    overrides: std::collections::HashMap<CellId, MediumKind>,
}

impl MediumMap {
    /// Construct a map with the given default medium.
    #[must_use]
    pub fn new(default: MediumKind) -> Self {
        Self {
            default,
            overrides: std::collections::HashMap::new(),
        }
    }

    /// Override the medium for a single cell.
    pub fn set(&mut self, cell: CellId, kind: MediumKind) {
        if kind == self.default {
            self.overrides.remove(&cell);
        } else {
            self.overrides.insert(cell, kind);
        }
    }

    /// Medium filling `cell`.
    #[must_use]
    pub fn at(&self, cell: CellId) -> MediumKind {
        self.overrides.get(&cell).copied().unwrap_or(self.default)
    }
}

/// Ambient channels a cell accumulates traces in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalChannel {
    Scent,
    Sound,
    Em,
}

/// Per-channel exponential decay factors applied once per elapsed tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChannelDecay {
    pub scent: f32,
    pub sound: f32,
    pub em: f32,
}

impl ChannelDecay {
    fn factor(&self, channel: SignalChannel) -> f32 {
        match channel {
            SignalChannel::Scent => self.scent,
            SignalChannel::Sound => self.sound,
            SignalChannel::Em => self.em,
        }
    }

    fn validate(&self) -> Result<(), FieldError> {
        let factors = [self.scent, self.sound, self.em];
        if factors.iter().any(|f| !(0.0..=1.0).contains(f)) {
            return Err(FieldError::InvalidConfig(
                "decay factors must lie in [0, 1]",
            ));
        }
        Ok(())
    }
}

impl Default for ChannelDecay {
    fn default() -> Self {
        // Sound dies fastest, scent lingers.
        Self {
            scent: 0.995,
            sound: 0.82,
            em: 0.90,
        }
    }
}

/// One cell's accumulated signal levels.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalCell {
    pub scent: f32,
    pub sound: f32,
    pub em: f32,
    pub last_update: u64,
}

impl SignalCell {
    fn level(&self, channel: SignalChannel) -> f32 {
        match channel {
            SignalChannel::Scent => self.scent,
            SignalChannel::Sound => self.sound,
            SignalChannel::Em => self.em,
        }
    }

    fn level_mut(&mut self, channel: SignalChannel) -> &mut f32 {
        match channel {
            SignalChannel::Scent => &mut self.scent,
            SignalChannel::Sound => &mut self.sound,
            SignalChannel::Em => &mut self.em,
        }
    }
}

/// Read seam used by delivery code to probe ambient levels.
pub trait AmbientSampler {
    /// Decayed level of `channel` in `cell` as of `now`, without mutating.
    fn ambient(&self, cell: CellId, channel: SignalChannel, now: u64) -> f32;
}

/// Uniform grid of decaying signal cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalGrid {
    width: u32,
    height: u32,
    cell_size: f32,
    decay: ChannelDecay,
    cells: Vec<SignalCell>,
}

impl SignalGrid {
    /// Construct a grid of `width * height` quiet cells.
    pub fn new(
        width: u32,
        height: u32,
        cell_size: f32,
        decay: ChannelDecay,
    ) -> Result<Self, FieldError> {
        if width == 0 || height == 0 {
            return Err(FieldError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        if cell_size <= 0.0 {
            return Err(FieldError::InvalidConfig("cell_size must be positive"));
        }
        decay.validate()?;
        Ok(Self {
            width,
            height,
            cell_size,
            decay,
            cells: vec![SignalCell::default(); (width as usize) * (height as usize)],
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    #[must_use]
    pub fn cells(&self) -> &[SignalCell] {
        &self.cells
    }

    /// Quantize a world position into its cell bucket, wrapping toroidally.
    #[must_use]
    pub fn cell_at(&self, x: f32, y: f32) -> CellId {
        let cx = (x / self.cell_size).floor().rem_euclid(self.width as f32) as u32;
        let cy = (y / self.cell_size).floor().rem_euclid(self.height as f32) as u32;
        CellId(cy * self.width + cx)
    }

    fn decayed(&self, cell: &SignalCell, channel: SignalChannel, now: u64) -> f32 {
        let level = cell.level(channel);
        if level <= 0.0 {
            return 0.0;
        }
        let elapsed = now.saturating_sub(cell.last_update);
        if elapsed == 0 {
            return level;
        }
        level * self.decay.factor(channel).powi(elapsed.min(i32::MAX as u64) as i32)
    }

    /// Settle a cell to `now`, then add `amount` on `channel`, capped at `cap`.
    pub fn deposit(&mut self, cell: CellId, channel: SignalChannel, amount: f32, cap: f32, now: u64) {
        let Some(index) = self.index_of(cell) else {
            return;
        };
        let decay = self.decay;
        let slot = &mut self.cells[index];
        let elapsed = now.saturating_sub(slot.last_update);
        if elapsed > 0 {
            let exponent = elapsed.min(i32::MAX as u64) as i32;
            slot.scent *= decay.scent.powi(exponent);
            slot.sound *= decay.sound.powi(exponent);
            slot.em *= decay.em.powi(exponent);
        }
        slot.last_update = now;
        let level = slot.level_mut(channel);
        *level = (*level + amount.max(0.0)).min(cap);
    }

    fn index_of(&self, cell: CellId) -> Option<usize> {
        let index = cell.0 as usize;
        (index < self.cells.len()).then_some(index)
    }
}

impl AmbientSampler for SignalGrid {
    fn ambient(&self, cell: CellId, channel: SignalChannel, now: u64) -> f32 {
        self.index_of(cell)
            .map_or(0.0, |index| self.decayed(&self.cells[index], channel, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> SignalGrid {
        SignalGrid::new(
            8,
            8,
            10.0,
            ChannelDecay {
                scent: 1.0,
                sound: 0.5,
                em: 0.9,
            },
        )
        .expect("grid")
    }

    #[test]
    fn rejects_bad_dimensions() {
        assert!(SignalGrid::new(0, 4, 10.0, ChannelDecay::default()).is_err());
        assert!(SignalGrid::new(4, 4, 0.0, ChannelDecay::default()).is_err());
        let bad = ChannelDecay {
            sound: 1.5,
            ..ChannelDecay::default()
        };
        assert!(SignalGrid::new(4, 4, 10.0, bad).is_err());
    }

    #[test]
    fn quantizes_and_wraps_positions() {
        let grid = grid();
        assert_eq!(grid.cell_at(0.0, 0.0), CellId(0));
        assert_eq!(grid.cell_at(25.0, 0.0), CellId(2));
        assert_eq!(grid.cell_at(0.0, 15.0), CellId(8));
        // One world-width to the right lands in the same column.
        assert_eq!(grid.cell_at(85.0, 0.0), grid.cell_at(5.0, 0.0));
        // Negative coordinates wrap instead of truncating to zero.
        assert_eq!(grid.cell_at(-5.0, 0.0), CellId(7));
    }

    #[test]
    fn deposit_then_sample_decays_per_elapsed_tick() {
        let mut grid = grid();
        let cell = grid.cell_at(5.0, 5.0);
        grid.deposit(cell, SignalChannel::Sound, 0.8, 1.0, 10);
        assert!((grid.ambient(cell, SignalChannel::Sound, 10) - 0.8).abs() < 1e-6);
        // Three elapsed ticks at 0.5 per tick.
        assert!((grid.ambient(cell, SignalChannel::Sound, 13) - 0.1).abs() < 1e-6);
        // Reading never settles the cell.
        assert_eq!(grid.cells()[cell.0 as usize].last_update, 10);
    }

    #[test]
    fn deposit_settles_old_level_before_adding() {
        let mut grid = grid();
        let cell = CellId(3);
        grid.deposit(cell, SignalChannel::Sound, 0.8, 1.0, 0);
        grid.deposit(cell, SignalChannel::Sound, 0.1, 1.0, 2);
        // 0.8 * 0.5^2 + 0.1
        assert!((grid.ambient(cell, SignalChannel::Sound, 2) - 0.3).abs() < 1e-6);
        assert_eq!(grid.cells()[cell.0 as usize].last_update, 2);
    }

    #[test]
    fn deposit_caps_at_max_strength() {
        let mut grid = grid();
        let cell = CellId(0);
        grid.deposit(cell, SignalChannel::Em, 0.9, 1.0, 0);
        grid.deposit(cell, SignalChannel::Em, 0.9, 1.0, 0);
        assert!((grid.ambient(cell, SignalChannel::Em, 0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn channels_decay_independently() {
        let mut grid = grid();
        let cell = CellId(9);
        grid.deposit(cell, SignalChannel::Scent, 0.4, 1.0, 0);
        grid.deposit(cell, SignalChannel::Em, 0.4, 1.0, 0);
        assert!((grid.ambient(cell, SignalChannel::Scent, 5) - 0.4).abs() < 1e-6);
        assert!((grid.ambient(cell, SignalChannel::Em, 5) - 0.4 * 0.9_f32.powi(5)).abs() < 1e-6);
    }

    #[test]
    fn vacuum_suppresses_hearing_only() {
        let supported = MediumKind::Vacuum.supported();
        assert!(!supported.contains(Transport::Hearing));
        assert!(supported.contains(Transport::Em));
        assert!(supported.contains(Transport::Vision));
        assert!(supported.contains(Transport::Paranormal));
    }

    #[test]
    fn underwater_suppresses_em() {
        let supported = MediumKind::Underwater.supported();
        assert!(supported.contains(Transport::Hearing));
        assert!(!supported.contains(Transport::Em));
    }

    #[test]
    fn medium_map_overrides_single_cells() {
        let mut map = MediumMap::new(MediumKind::Atmosphere);
        map.set(CellId(4), MediumKind::Vacuum);
        assert_eq!(map.at(CellId(4)), MediumKind::Vacuum);
        assert_eq!(map.at(CellId(5)), MediumKind::Atmosphere);
        map.set(CellId(4), MediumKind::Atmosphere);
        assert_eq!(map.at(CellId(4)), MediumKind::Atmosphere);
    }

    #[test]
    fn transport_masks_compose() {
        let mask = TransportMask::of(&[Transport::Hearing, Transport::Vision]);
        assert!(mask.contains(Transport::Hearing));
        assert!(!mask.contains(Transport::Em));
        assert!(mask.intersect(TransportMask::of(&[Transport::Em])).is_empty());
        assert_eq!(
            mask.union(TransportMask::of(&[Transport::Em])),
            TransportMask::of(&[Transport::Hearing, Transport::Vision, Transport::Em])
        );
    }
}
