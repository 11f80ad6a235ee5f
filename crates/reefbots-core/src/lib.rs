//! Bioenergetics and life-cycle core shared across the ReefBots workspace.
//!
//! Each fish ingests forage mass that rides a gut transit pipeline for a
//! species-configured delay, matures into digesta energy, and is allocated
//! across bounded physiological reserves (short-term, reproductive, long-term,
//! in that fixed order). Accumulated age drives juvenile → initial-phase →
//! terminal-phase transitions whose boundary ages are sampled once per fish
//! from a piecewise-linear inverse CDF, and larvae metamorphose into settled
//! juveniles through an external hatchery collaborator. The world registry
//! owns every agent; all sampling threads a single seeded generator so that
//! identical seeds replay identical histories.

use ordered_float::OrderedFloat;
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Div, Mul};
use thiserror::Error;

new_key_type! {
    /// Stable handle for fish backed by a generational slot map.
    pub struct FishId;
}

/// Convenience alias for associating side data with fish.
pub type FishMap<T> = SecondaryMap<FishId, T>;

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Discrete simulation clock value.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
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

/// Marker implemented by the zero-sized dimension tags carried by [`Quantity`].
pub trait Dimension: Copy + fmt::Debug + PartialEq + Eq + 'static {}

/// Mass of forage or digesta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MassDim;
impl Dimension for MassDim {}

/// Digested energy held in reserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyDim;
impl Dimension for EnergyDim {}

/// Simulation time measured in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeDim;
impl Dimension for TimeDim {}

/// Forage mass required to yield one unit of digested energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MassPerEnergyDim;
impl Dimension for MassPerEnergyDim {}

/// Non-negative scalar amount tagged with a physical dimension.
///
/// The phantom dimension makes cross-dimension arithmetic a compile error;
/// mass only becomes energy through the explicit quotient division below.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity<D: Dimension> {
    value: f32,
    #[serde(skip)]
    _dim: PhantomData<D>,
}

/// Mass quantity (grams of forage or digesta).
pub type Mass = Quantity<MassDim>;
/// Energy quantity (units of digested energy).
pub type Energy = Quantity<EnergyDim>;
/// Age or duration quantity (ticks).
pub type Age = Quantity<TimeDim>;
/// Mass-per-energy quotient used to convert matured digesta mass to energy.
pub type MassPerEnergy = Quantity<MassPerEnergyDim>;

impl<D: Dimension> Quantity<D> {
    /// Wraps a raw scalar. Amounts are never negative; a negative or NaN
    /// input is a caller bug.
    #[must_use]
    pub fn new(value: f32) -> Self {
        debug_assert!(
            value.is_finite() && value >= 0.0,
            "quantity must be finite and non-negative, got {value}"
        );
        Self {
            value,
            _dim: PhantomData,
        }
    }

    /// The zero amount.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            value: 0.0,
            _dim: PhantomData,
        }
    }

    /// Raw scalar value.
    #[must_use]
    pub const fn value(self) -> f32 {
        self.value
    }

    /// Returns true when the amount is exactly zero.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.value == 0.0
    }

    /// Smaller of two amounts.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self::new(self.value.min(other.value))
    }

    /// Larger of two amounts.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self::new(self.value.max(other.value))
    }

    /// Subtraction floored at zero, preserving the non-negativity invariant.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self::new((self.value - other.value).max(0.0))
    }
}

impl<D: Dimension> Default for Quantity<D> {
    fn default() -> Self {
        Self::zero()
    }
}

impl<D: Dimension> PartialEq for Quantity<D> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<D: Dimension> PartialOrd for Quantity<D> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl<D: Dimension> Add for Quantity<D> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.value + rhs.value)
    }
}

impl<D: Dimension> AddAssign for Quantity<D> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<D: Dimension> Mul<f32> for Quantity<D> {
    type Output = Self;

    /// Scales the amount by a non-negative factor.
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.value * rhs)
    }
}

impl Div<Quantity<MassPerEnergyDim>> for Quantity<MassDim> {
    type Output = Quantity<EnergyDim>;

    /// Converts digesta mass to energy through a mass-per-energy quotient.
    fn div(self, rhs: Quantity<MassPerEnergyDim>) -> Quantity<EnergyDim> {
        debug_assert!(rhs.value > 0.0, "mass-per-energy quotient must be positive");
        Quantity::new(self.value / rhs.value)
    }
}

/// Errors raised when constructing world state or species tables.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReefStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A species id that does not resolve against the configured table.
    #[error("unknown species id {0:?}")]
    UnknownSpecies(SpeciesId),
    /// A fish handle that no longer resolves against the arena.
    #[error("unknown fish handle")]
    UnknownFish,
}

/// Bounded accumulator of a physical quantity.
///
/// Holds `lower ≤ amount ≤ upper` at all times; [`BoundedStore::store`] fills
/// only up to the upper bound and reports how much actually fit.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedStore<D: Dimension> {
    amount: Quantity<D>,
    lower: Quantity<D>,
    upper: Quantity<D>,
}

impl<D: Dimension> BoundedStore<D> {
    /// Creates a store starting at its lower bound.
    pub fn new(lower: Quantity<D>, upper: Quantity<D>) -> Result<Self, ReefStateError> {
        if !(lower.value().is_finite() && lower.value() >= 0.0) {
            return Err(ReefStateError::InvalidConfig(
                "store lower bound must be finite and non-negative",
            ));
        }
        if !upper.value().is_finite() {
            return Err(ReefStateError::InvalidConfig(
                "store upper bound must be finite",
            ));
        }
        if upper < lower {
            return Err(ReefStateError::InvalidConfig(
                "store upper bound must not be below its lower bound",
            ));
        }
        Ok(Self {
            amount: lower,
            lower,
            upper,
        })
    }

    /// Creates a store over `[0, capacity]`.
    pub fn with_capacity(capacity: Quantity<D>) -> Result<Self, ReefStateError> {
        Self::new(Quantity::zero(), capacity)
    }

    /// Adds as much of `delta` as fits under the upper bound, returning the
    /// portion actually stored. The caller recovers rejected overflow as
    /// `delta - stored`.
    pub fn store(&mut self, delta: Quantity<D>) -> Quantity<D> {
        assert!(
            delta.value().is_finite() && delta.value() >= 0.0,
            "stored delta must be finite and non-negative"
        );
        let stored = delta.min(self.headroom());
        self.amount += stored;
        stored
    }

    /// Current amount held.
    #[must_use]
    pub const fn amount(&self) -> Quantity<D> {
        self.amount
    }

    /// Lower bound.
    #[must_use]
    pub const fn lower(&self) -> Quantity<D> {
        self.lower
    }

    /// Upper bound.
    #[must_use]
    pub const fn upper(&self) -> Quantity<D> {
        self.upper
    }

    /// Remaining room before the upper bound.
    #[must_use]
    pub fn headroom(&self) -> Quantity<D> {
        self.upper.saturating_sub(self.amount)
    }

    /// Whether the store sits exactly at its lower bound.
    #[must_use]
    pub fn at_lower_limit(&self) -> bool {
        self.amount == self.lower
    }

    /// Whether the store sits exactly at its upper bound.
    #[must_use]
    pub fn at_upper_limit(&self) -> bool {
        self.amount == self.upper
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TransitItem {
    matures_at: Tick,
    seq: u64,
    amount: OrderedFloat<f32>,
}

/// Time-delayed multiset of quantities ordered by maturation tick.
///
/// Ties on the maturation tick break by insertion order so that repeated runs
/// drain in an identical sequence. Each item is removed exactly once, at or
/// after its maturation tick.
#[derive(Debug, Clone)]
pub struct DelayQueue<D: Dimension> {
    heap: BinaryHeap<Reverse<TransitItem>>,
    next_seq: u64,
    in_transit: Quantity<D>,
}

impl<D: Dimension> Default for DelayQueue<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dimension> DelayQueue<D> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            in_transit: Quantity::zero(),
        }
    }

    /// Inserts an item maturing `delay` ticks after `now`. `delay` must be
    /// positive; a non-positive delay is a configuration bug upstream.
    pub fn add(&mut self, amount: Quantity<D>, now: Tick, delay: u32) {
        assert!(delay > 0, "transit delay must be positive");
        assert!(
            amount.value().is_finite() && amount.value() >= 0.0,
            "transit amount must be finite and non-negative"
        );
        let item = TransitItem {
            matures_at: Tick(now.0 + u64::from(delay)),
            seq: self.next_seq,
            amount: OrderedFloat(amount.value()),
        };
        self.next_seq += 1;
        self.in_transit += amount;
        self.heap.push(Reverse(item));
    }

    /// Removes every item with `matures_at ≤ now`, returning the summed
    /// amount. Repeated calls with a non-decreasing `now` never double-count.
    pub fn drain_expired(&mut self, now: Tick) -> Quantity<D> {
        let mut total = Quantity::zero();
        while self.heap.peek().is_some_and(|entry| entry.0.matures_at <= now) {
            if let Some(Reverse(item)) = self.heap.pop() {
                total += Quantity::new(item.amount.into_inner());
            }
        }
        self.in_transit = self.in_transit.saturating_sub(total);
        total
    }

    /// Read-only view of pending items ordered by `(matures_at, insertion)`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Quantity<D>, Tick)> {
        let mut items: Vec<TransitItem> = self.heap.iter().map(|entry| entry.0).collect();
        items.sort_unstable();
        items
            .into_iter()
            .map(|item| (Quantity::new(item.amount.into_inner()), item.matures_at))
            .collect()
    }

    /// Total amount still in transit.
    #[must_use]
    pub const fn pending(&self) -> Quantity<D> {
        self.in_transit
    }

    /// Number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true when nothing is in transit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Single `(interval length, probability mass)` segment of an age table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgeSegment {
    /// Length of the age interval, in scaled ticks.
    pub length: f32,
    /// Probability mass assigned to the interval.
    pub mass: f32,
}

/// Serializable description of a piecewise-linear age distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgeDistributionConfig {
    /// Ordered interval segments; masses must sum to 1.
    pub segments: Vec<AgeSegment>,
    /// Affine offset added after interpolation (earliest reachable age).
    pub shift: f32,
    /// Affine scale applied to interpolated interval positions.
    pub scale: f32,
}

impl AgeDistributionConfig {
    /// Appends a segment to the breakpoint table. Masses are only required
    /// to sum to 1 once the complete table is compiled.
    pub fn push_segment(&mut self, length: f32, mass: f32) {
        self.segments.push(AgeSegment { length, mass });
    }
}

impl Default for AgeDistributionConfig {
    fn default() -> Self {
        Self {
            segments: vec![
                AgeSegment {
                    length: 150.0,
                    mass: 0.5,
                },
                AgeSegment {
                    length: 210.0,
                    mass: 0.35,
                },
                AgeSegment {
                    length: 300.0,
                    mass: 0.15,
                },
            ],
            shift: 30.0,
            scale: 1.0,
        }
    }
}

const MASS_TOLERANCE: f32 = 1e-4;

/// Piecewise-linear inverse CDF mapping a uniform draw in `[0, 1]` to an age.
///
/// Monotonic non-decreasing in the draw; `evaluate(0)` is the configured
/// shift and `evaluate(1)` is `total_length * scale + shift`.
#[derive(Debug, Clone)]
pub struct AgeDistribution {
    segments: Vec<AgeSegment>,
    cumulative_mass: Vec<f32>,
    total_length: f32,
    shift: f32,
    scale: f32,
}

impl AgeDistribution {
    /// Validates and compiles a segment table. The complete table must carry
    /// positive masses summing to 1 and finite non-negative lengths.
    pub fn new(config: &AgeDistributionConfig) -> Result<Self, ReefStateError> {
        if config.segments.is_empty() {
            return Err(ReefStateError::InvalidConfig(
                "age distribution needs at least one segment",
            ));
        }
        if !(config.shift.is_finite() && config.shift >= 0.0) {
            return Err(ReefStateError::InvalidConfig(
                "age distribution shift must be finite and non-negative",
            ));
        }
        if !(config.scale.is_finite() && config.scale > 0.0) {
            return Err(ReefStateError::InvalidConfig(
                "age distribution scale must be finite and positive",
            ));
        }
        let mut cumulative_mass = Vec::with_capacity(config.segments.len());
        let mut total_mass = 0.0f32;
        let mut total_length = 0.0f32;
        for segment in &config.segments {
            if !(segment.length.is_finite() && segment.length >= 0.0) {
                return Err(ReefStateError::InvalidConfig(
                    "age segment length must be finite and non-negative",
                ));
            }
            if !(segment.mass.is_finite() && segment.mass > 0.0) {
                return Err(ReefStateError::InvalidConfig(
                    "age segment mass must be finite and positive",
                ));
            }
            total_mass += segment.mass;
            total_length += segment.length;
            cumulative_mass.push(total_mass);
        }
        if (total_mass - 1.0).abs() > MASS_TOLERANCE {
            return Err(ReefStateError::InvalidConfig(
                "age distribution masses must sum to 1",
            ));
        }
        // Pin the final breakpoint so evaluate(1.0) lands exactly on the tail.
        if let Some(last) = cumulative_mass.last_mut() {
            *last = 1.0;
        }
        Ok(Self {
            segments: config.segments.clone(),
            cumulative_mass,
            total_length,
            shift: config.shift,
            scale: config.scale,
        })
    }

    /// Maps a cumulative probability to an age by locating the bracketing
    /// segment and interpolating linearly within it.
    #[must_use]
    pub fn evaluate(&self, p: f32) -> Age {
        assert!(
            (0.0..=1.0).contains(&p),
            "cdf argument must lie in [0, 1], got {p}"
        );
        let mut base_mass = 0.0f32;
        let mut base_length = 0.0f32;
        let mut raw = self.total_length;
        for (segment, &cum) in self.segments.iter().zip(&self.cumulative_mass) {
            if p <= cum {
                let span = cum - base_mass;
                raw = if span > 0.0 {
                    base_length + (p - base_mass) / span * segment.length
                } else {
                    base_length
                };
                break;
            }
            base_mass = cum;
            base_length += segment.length;
        }
        Age::new(raw.clamp(0.0, self.total_length) * self.scale + self.shift)
    }

    /// Sum of all interval lengths, before scale and shift.
    #[must_use]
    pub const fn total_length(&self) -> f32 {
        self.total_length
    }

    /// Affine offset applied after interpolation.
    #[must_use]
    pub const fn shift(&self) -> f32 {
        self.shift
    }

    /// Affine scale applied before the offset.
    #[must_use]
    pub const fn scale(&self) -> f32 {
        self.scale
    }
}

/// Lifetime probability mass of each life phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PhaseProbabilities {
    pub juvenile: f32,
    pub initial: f32,
    pub terminal: f32,
}

impl Default for PhaseProbabilities {
    fn default() -> Self {
        Self {
            juvenile: 0.5,
            initial: 0.35,
            terminal: 0.15,
        }
    }
}

impl PhaseProbabilities {
    /// Checks that each mass is finite and non-negative and the table sums
    /// to 1.
    pub fn validate(&self) -> Result<(), ReefStateError> {
        for mass in [self.juvenile, self.initial, self.terminal] {
            if !(mass.is_finite() && mass >= 0.0) {
                return Err(ReefStateError::InvalidConfig(
                    "phase probability must be finite and non-negative",
                ));
            }
        }
        let total = self.juvenile + self.initial + self.terminal;
        if (total - 1.0).abs() > MASS_TOLERANCE {
            return Err(ReefStateError::InvalidConfig(
                "phase probabilities must sum to 1",
            ));
        }
        Ok(())
    }

    /// Rescales the table so the masses sum to exactly 1.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let total = self.juvenile + self.initial + self.terminal;
        Self {
            juvenile: self.juvenile / total,
            initial: self.initial / total,
            terminal: self.terminal / total,
        }
    }
}

/// Phase-transition ages sampled once per fish at spawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseBoundaries {
    /// Age at which a juvenile enters the initial phase.
    pub age_at_initial: Age,
    /// Age at which an initial-phase fish enters the terminal phase.
    pub age_at_terminal: Age,
}

impl PhaseBoundaries {
    /// Samples both boundary ages from a single uniform draw, anchored by the
    /// cumulative juvenile and juvenile+initial masses. One draw per fish
    /// keeps phase timing reproducible from the world seed alone, and the
    /// monotonic CDF guarantees `age_at_initial ≤ age_at_terminal`.
    pub fn sample(
        ages: &AgeDistribution,
        phases: PhaseProbabilities,
        rng: &mut dyn RngCore,
    ) -> Self {
        let u: f32 = rng.random();
        let age_at_initial = ages.evaluate(clamp01(u * phases.juvenile));
        let age_at_terminal = ages.evaluate(clamp01(phases.juvenile + u * phases.initial));
        Self {
            age_at_initial,
            age_at_terminal,
        }
    }
}

/// Life phase of a settled fish. Phases only ever advance.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Phase {
    #[default]
    Juvenile,
    Initial,
    Terminal,
}

/// Recorded cause for a retired fish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CauseOfDeath {
    Starvation,
    Predation,
    Senescence,
    Metamorphosis,
}

/// Phase state machine with an absorbing death flag.
#[derive(Debug, Clone, PartialEq)]
pub struct LifeCycle {
    phase: Phase,
    cause_of_death: Option<CauseOfDeath>,
    boundaries: PhaseBoundaries,
}

impl LifeCycle {
    /// Creates a juvenile life cycle with pre-sampled boundary ages.
    #[must_use]
    pub fn new(boundaries: PhaseBoundaries) -> Self {
        debug_assert!(
            boundaries.age_at_initial <= boundaries.age_at_terminal,
            "phase boundaries must be ordered"
        );
        Self {
            phase: Phase::Juvenile,
            cause_of_death: None,
            boundaries,
        }
    }

    /// Advances at most one phase for the given age. No-op once dead;
    /// `Terminal` has no further transition.
    pub fn advance(&mut self, age: Age) {
        if self.is_dead() {
            return;
        }
        match self.phase {
            Phase::Juvenile if age >= self.boundaries.age_at_initial => {
                self.phase = Phase::Initial;
            }
            Phase::Initial if age >= self.boundaries.age_at_terminal => {
                self.phase = Phase::Terminal;
            }
            _ => {}
        }
    }

    /// Records a cause of death. Killing an already-dead fish is a no-op and
    /// the first cause wins.
    pub fn kill(&mut self, cause: CauseOfDeath) {
        if self.cause_of_death.is_none() {
            self.cause_of_death = Some(cause);
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the death flag has been set.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.cause_of_death.is_some()
    }

    /// Recorded cause of death, if any.
    #[must_use]
    pub const fn cause_of_death(&self) -> Option<CauseOfDeath> {
        self.cause_of_death
    }

    /// Sampled phase-boundary ages.
    #[must_use]
    pub const fn boundaries(&self) -> PhaseBoundaries {
        self.boundaries
    }

    /// Phase-derived reproductive eligibility: past the juvenile phase and
    /// alive. Whether a fish actually invests reproductively is an external
    /// decision fed into [`Compartments::transfer`].
    #[must_use]
    pub fn is_reproductive(&self) -> bool {
        self.phase != Phase::Juvenile && !self.is_dead()
    }
}

/// One-shot trigger retiring a larva in favor of a settled juvenile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetamorphosisSchedule {
    trigger: Tick,
    fired: bool,
}

impl MetamorphosisSchedule {
    /// Creates a pending schedule firing at `trigger`.
    #[must_use]
    pub const fn new(trigger: Tick) -> Self {
        Self {
            trigger,
            fired: false,
        }
    }

    /// Configured trigger tick.
    #[must_use]
    pub const fn trigger(&self) -> Tick {
        self.trigger
    }

    /// Whether the schedule has already fired.
    #[must_use]
    pub const fn is_fired(&self) -> bool {
        self.fired
    }

    /// True when the schedule is still pending and the trigger has passed.
    #[must_use]
    pub const fn due(&self, now: Tick) -> bool {
        !self.fired && now.0 >= self.trigger.0
    }

    /// Marks the schedule as fired; terminal.
    pub fn fire(&mut self) {
        self.fired = true;
    }
}

/// Per-step allocation flux produced by [`Compartments::transfer`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferReport {
    /// Energy matured out of the gut pipeline this step.
    pub digesta: Energy,
    pub stored_short_term: Energy,
    pub stored_reproductive: Energy,
    pub stored_long_term: Energy,
    /// Energy beyond long-term capacity, permanently egested.
    pub discarded: Energy,
}

/// Physiological reserve compartments of a settled fish.
///
/// Matured digesta tops up the short-term reserve first, then the
/// reproductive reserve while the fish is in a reproductive state, then the
/// long-term reserve; anything beyond long-term capacity is discarded. The
/// ordering is fixed policy: the short-term reserve fuels immediate
/// metabolism, and reproductive investment outranks long-term banking only
/// during a reproductive state.
#[derive(Debug, Clone)]
pub struct Compartments {
    gut: DelayQueue<MassDim>,
    short_term: BoundedStore<EnergyDim>,
    long_term: BoundedStore<EnergyDim>,
    reproductive: BoundedStore<EnergyDim>,
    transit_delay: u32,
    mass_per_energy: MassPerEnergy,
}

impl Compartments {
    /// Builds empty compartments from a validated species configuration.
    pub fn from_species(species: &SpeciesConfig) -> Result<Self, ReefStateError> {
        if species.transit_delay == 0 {
            return Err(ReefStateError::InvalidConfig(
                "transit delay must be at least one tick",
            ));
        }
        if !(species.mass_per_energy.value().is_finite() && species.mass_per_energy.value() > 0.0) {
            return Err(ReefStateError::InvalidConfig(
                "mass-per-energy quotient must be finite and positive",
            ));
        }
        Ok(Self {
            gut: DelayQueue::new(),
            short_term: BoundedStore::with_capacity(species.short_term_capacity)?,
            long_term: BoundedStore::with_capacity(species.long_term_capacity)?,
            reproductive: BoundedStore::with_capacity(species.reproductive_capacity)?,
            transit_delay: species.transit_delay,
            mass_per_energy: species.mass_per_energy,
        })
    }

    /// Queues forage mass into the gut pipeline at the configured delay.
    pub fn ingest(&mut self, mass: Mass, now: Tick) {
        self.gut.add(mass, now, self.transit_delay);
    }

    /// Drains matured digesta and allocates it across the reserves in fixed
    /// order. Conservation holds exactly:
    /// `stored_short + stored_reproductive + stored_long + discarded == digesta`.
    pub fn transfer(&mut self, now: Tick, reproductive: bool) -> TransferReport {
        let matured = self.gut.drain_expired(now);
        let digesta = matured / self.mass_per_energy;
        let stored_short_term = self.short_term.store(digesta);
        let mut overflow = digesta.saturating_sub(stored_short_term);
        let mut stored_reproductive = Energy::zero();
        if reproductive {
            stored_reproductive = self.reproductive.store(overflow);
            overflow = overflow.saturating_sub(stored_reproductive);
        }
        let stored_long_term = self.long_term.store(overflow);
        let discarded = overflow.saturating_sub(stored_long_term);
        TransferReport {
            digesta,
            stored_short_term,
            stored_reproductive,
            stored_long_term,
            discarded,
        }
    }

    /// Gut transit pipeline.
    #[must_use]
    pub fn gut(&self) -> &DelayQueue<MassDim> {
        &self.gut
    }

    /// Short-term reserve.
    #[must_use]
    pub fn short_term(&self) -> &BoundedStore<EnergyDim> {
        &self.short_term
    }

    /// Long-term reserve.
    #[must_use]
    pub fn long_term(&self) -> &BoundedStore<EnergyDim> {
        &self.long_term
    }

    /// Reproductive reserve.
    #[must_use]
    pub fn reproductive(&self) -> &BoundedStore<EnergyDim> {
        &self.reproductive
    }

    /// Mass-per-energy quotient applied to matured digesta.
    #[must_use]
    pub const fn mass_per_energy(&self) -> MassPerEnergy {
        self.mass_per_energy
    }

    /// Sum of all reserve amounts.
    #[must_use]
    pub fn total_reserves(&self) -> Energy {
        self.short_term.amount() + self.long_term.amount() + self.reproductive.amount()
    }
}

/// Index into the configured species table.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct SpeciesId(pub u16);

/// Immutable per-species parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeciesConfig {
    /// Display name used in logs and telemetry.
    pub name: String,
    /// Gut transit delay between ingestion and digesta maturation, in ticks.
    pub transit_delay: u32,
    /// Forage mass required to yield one unit of digested energy.
    pub mass_per_energy: MassPerEnergy,
    /// Capacity of the short-term reserve fueling immediate metabolism.
    pub short_term_capacity: Energy,
    /// Capacity of the long-term reserve; surplus beyond it is egested.
    pub long_term_capacity: Energy,
    /// Capacity of the reproductive reserve.
    pub reproductive_capacity: Energy,
    /// Lifetime probability mass of each phase.
    pub phase_probabilities: PhaseProbabilities,
    /// Piecewise-linear age table sampled once per fish at settlement.
    pub maturation_ages: AgeDistributionConfig,
    /// Age (ticks) at which a larva metamorphoses into a juvenile.
    pub metamorphosis_age: u32,
    /// Starting age (ticks) assigned to a freshly settled juvenile.
    pub settlement_age: u32,
}

impl Default for SpeciesConfig {
    fn default() -> Self {
        Self {
            name: "bluehead wrasse".to_string(),
            transit_delay: 4,
            mass_per_energy: Quantity::new(2.0),
            short_term_capacity: Quantity::new(5.0),
            long_term_capacity: Quantity::new(100.0),
            reproductive_capacity: Quantity::new(3.0),
            phase_probabilities: PhaseProbabilities::default(),
            maturation_ages: AgeDistributionConfig::default(),
            metamorphosis_age: 20,
            settlement_age: 30,
        }
    }
}

impl SpeciesConfig {
    /// Validates every parameter, failing fast before any fish is spawned.
    pub fn validate(&self) -> Result<(), ReefStateError> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<Species, ReefStateError> {
        if self.transit_delay == 0 {
            return Err(ReefStateError::InvalidConfig(
                "transit delay must be at least one tick",
            ));
        }
        if !(self.mass_per_energy.value().is_finite() && self.mass_per_energy.value() > 0.0) {
            return Err(ReefStateError::InvalidConfig(
                "mass-per-energy quotient must be finite and positive",
            ));
        }
        for capacity in [
            self.short_term_capacity.value(),
            self.long_term_capacity.value(),
            self.reproductive_capacity.value(),
        ] {
            if !(capacity.is_finite() && capacity >= 0.0) {
                return Err(ReefStateError::InvalidConfig(
                    "reserve capacity must be finite and non-negative",
                ));
            }
        }
        self.phase_probabilities.validate()?;
        let ages = AgeDistribution::new(&self.maturation_ages)?;
        Ok(Species {
            config: self.clone(),
            ages,
            phases: self.phase_probabilities.normalized(),
        })
    }
}

/// Species configuration compiled with its derived age distribution.
#[derive(Debug, Clone)]
struct Species {
    config: SpeciesConfig,
    ages: AgeDistribution,
    phases: PhaseProbabilities,
}

/// Static configuration for a ReefBots world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReefConfig {
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    /// Interval (ticks) between telemetry batches; 0 disables telemetry.
    pub telemetry_interval: u32,
    /// Per-species parameter tables; at least one entry.
    pub species: Vec<SpeciesConfig>,
}

impl Default for ReefConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            history_capacity: 256,
            telemetry_interval: 1,
            species: vec![SpeciesConfig::default()],
        }
    }
}

impl ReefConfig {
    fn compile_species(&self) -> Result<Vec<Species>, ReefStateError> {
        if self.history_capacity == 0 {
            return Err(ReefStateError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        if self.species.is_empty() {
            return Err(ReefStateError::InvalidConfig(
                "at least one species must be configured",
            ));
        }
        self.species.iter().map(SpeciesConfig::compile).collect()
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Scalar fields for a single fish used when inserting or snapshotting from
/// the SoA store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FishData {
    pub species: SpeciesId,
    pub age: u32,
}

/// Collection of per-fish columns for hot-path iteration.
#[derive(Debug, Default)]
pub struct FishColumns {
    species: Vec<SpeciesId>,
    ages: Vec<u32>,
}

impl FishColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.species.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, fish: FishData) {
        self.species.push(fish.species);
        self.ages.push(fish.age);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> FishData {
        let removed = FishData {
            species: self.species.swap_remove(index),
            age: self.ages.swap_remove(index),
        };
        self.debug_assert_coherent();
        removed
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> FishData {
        FishData {
            species: self.species[index],
            age: self.ages[index],
        }
    }

    /// Immutable access to the species column.
    #[must_use]
    pub fn species(&self) -> &[SpeciesId] {
        &self.species
    }

    /// Immutable access to age counters.
    #[must_use]
    pub fn ages(&self) -> &[u32] {
        &self.ages
    }

    /// Mutable access to age counters.
    #[must_use]
    pub fn ages_mut(&mut self) -> &mut [u32] {
        &mut self.ages
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.species.len(), self.ages.len());
    }
}

/// Dense SoA storage with generational handles for fish access.
#[derive(Debug, Default)]
pub struct FishArena {
    slots: SlotMap<FishId, usize>,
    handles: Vec<FishId>,
    columns: FishColumns,
}

impl FishArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: FishColumns::new(),
        }
    }

    /// Number of active fish.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no fish are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over active fish handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = FishId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &FishColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut FishColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: FishId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live fish.
    #[must_use]
    pub fn contains(&self, id: FishId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new fish and return its handle.
    pub fn insert(&mut self, fish: FishData) -> FishId {
        let index = self.columns.len();
        self.columns.push(fish);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: FishId) -> Option<FishData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Return a copy of the scalar fields for `id`.
    #[must_use]
    pub fn snapshot(&self, id: FishId) -> Option<FishData> {
        self.index_of(id).map(|index| self.columns.snapshot(index))
    }
}

/// Per-fish component set beyond the dense SoA columns.
///
/// Behavior is selected by querying which components are present: larvae
/// carry only a metamorphosis schedule, settled fish carry physiology and a
/// life cycle.
#[derive(Debug, Clone)]
pub struct FishRuntime {
    pub physiology: Option<Compartments>,
    pub life_cycle: Option<LifeCycle>,
    pub metamorphosis: Option<MetamorphosisSchedule>,
    /// Externally supplied spawning-season flag routed into
    /// [`Compartments::transfer`]; the core invents no additional gating.
    pub reproductive: bool,
    /// Flux recorded by the most recent digestion stage.
    pub last_transfer: TransferReport,
}

impl FishRuntime {
    /// Runtime for a pelagic larva awaiting metamorphosis.
    #[must_use]
    pub fn larval(schedule: MetamorphosisSchedule) -> Self {
        Self {
            physiology: None,
            life_cycle: None,
            metamorphosis: Some(schedule),
            reproductive: false,
            last_transfer: TransferReport::default(),
        }
    }

    /// Runtime for a settled fish with reserves and a life cycle.
    #[must_use]
    pub fn settled(physiology: Compartments, life_cycle: LifeCycle) -> Self {
        Self {
            physiology: Some(physiology),
            life_cycle: Some(life_cycle),
            metamorphosis: None,
            reproductive: false,
            last_transfer: TransferReport::default(),
        }
    }

    /// Whether the fish carries the settled component set.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.physiology.is_some() && self.life_cycle.is_some()
    }

    /// Whether the fish is a larva whose schedule has not fired.
    #[must_use]
    pub fn is_larval(&self) -> bool {
        self.life_cycle.is_none()
            && self
                .metamorphosis
                .as_ref()
                .is_some_and(|schedule| !schedule.is_fired())
    }

    /// Terminal check honored before every per-fish operation: a dead life
    /// cycle, or a fired schedule on a larva.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        match &self.life_cycle {
            Some(cycle) => cycle.is_dead(),
            None => self
                .metamorphosis
                .as_ref()
                .is_some_and(MetamorphosisSchedule::is_fired),
        }
    }
}

/// Combined snapshot of dense columns and runtime components for a single
/// fish.
#[derive(Debug, Clone)]
pub struct FishState {
    pub id: FishId,
    pub data: FishData,
    pub runtime: FishRuntime,
}

/// Death event surfaced to collaborators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeathRecord {
    pub id: FishId,
    pub species: SpeciesId,
    pub cause: CauseOfDeath,
}

/// Summary emitted to telemetry sinks each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub fish_count: usize,
    pub settlements: usize,
    pub deaths: usize,
    pub digesta_energy: f32,
    pub discarded_energy: f32,
    pub total_reserves: f32,
    pub average_reserves: f32,
}

/// Scalar metric sampled during telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: Cow<'static, str>,
    pub value: f64,
}

impl MetricSample {
    /// Creates a new metric sample.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Helper for `f32` values.
    #[must_use]
    pub fn from_f32(name: &'static str, value: f32) -> Self {
        Self::new(name, f64::from(value))
    }
}

/// Event type recorded for telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TelemetryEventKind {
    Settlements,
    Deaths,
    Custom(Cow<'static, str>),
}

/// Structured telemetry event entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub kind: TelemetryEventKind,
    pub count: usize,
}

impl TelemetryEvent {
    /// Construct a new event entry.
    #[must_use]
    pub fn new(kind: TelemetryEventKind, count: usize) -> Self {
        Self { kind, count }
    }
}

/// Aggregate payload forwarded to telemetry sinks.
#[derive(Debug, Clone)]
pub struct TelemetryBatch {
    pub summary: TickSummary,
    pub metrics: Vec<MetricSample>,
    pub events: Vec<TelemetryEvent>,
    pub deaths: Vec<DeathRecord>,
}

/// Telemetry sink invoked after each tick.
pub trait ReefTelemetry: Send {
    fn on_tick(&mut self, batch: &TelemetryBatch);
}

/// No-op telemetry sink.
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl ReefTelemetry for NullTelemetry {
    fn on_tick(&mut self, _batch: &TelemetryBatch) {}
}

/// Starting state for the juvenile that replaces a retired larva.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub starting_age: u32,
}

/// External collaborator invoked exactly once per completed metamorphosis.
pub trait Hatchery: Send {
    /// Produce the starting state for a settling juvenile of `species`,
    /// drawing any randomness from the shared seeded generator.
    fn settle(&mut self, species: &SpeciesConfig, rng: &mut dyn RngCore) -> Settlement;
}

/// Hatchery that settles juveniles at the species' configured starting age.
#[derive(Debug, Default)]
pub struct DefaultHatchery;

impl Hatchery for DefaultHatchery {
    fn settle(&mut self, species: &SpeciesConfig, _rng: &mut dyn RngCore) -> Settlement {
        Settlement {
            starting_age: species.settlement_age,
        }
    }
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TickEvents {
    pub tick: Tick,
    pub deaths: Vec<DeathRecord>,
    pub settlements: usize,
    pub digesta_energy: Energy,
    pub discarded_energy: Energy,
}

#[derive(Debug, Clone)]
struct SettlementOrder {
    species: SpeciesId,
}

#[derive(Debug, Clone, Copy, Default)]
struct DigestionTotals {
    digesta: Energy,
    discarded: Energy,
}

/// Aggregate world state owning every fish and all shared collaborators.
pub struct ReefState {
    config: ReefConfig,
    species: Vec<Species>,
    tick: Tick,
    rng: SmallRng,
    fish: FishArena,
    runtime: FishMap<FishRuntime>,
    pending_deaths: Vec<(FishId, CauseOfDeath)>,
    pending_settlements: Vec<SettlementOrder>,
    telemetry: Box<dyn ReefTelemetry>,
    hatchery: Box<dyn Hatchery>,
    last_deaths: usize,
    last_settlements: usize,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for ReefState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReefState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("fish_count", &self.fish.len())
            .finish()
    }
}

impl ReefState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: ReefConfig) -> Result<Self, ReefStateError> {
        Self::with_collaborators(config, Box::new(NullTelemetry), Box::new(DefaultHatchery))
    }

    /// Instantiate a new world with explicit telemetry and hatchery
    /// collaborators.
    pub fn with_collaborators(
        config: ReefConfig,
        telemetry: Box<dyn ReefTelemetry>,
        hatchery: Box<dyn Hatchery>,
    ) -> Result<Self, ReefStateError> {
        let species = config.compile_species()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            species,
            tick: Tick::zero(),
            rng,
            fish: FishArena::new(),
            runtime: FishMap::new(),
            pending_deaths: Vec::new(),
            pending_settlements: Vec::new(),
            telemetry,
            hatchery,
            last_deaths: 0,
            last_settlements: 0,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    fn stage_aging(&mut self) {
        for age in self.fish.columns_mut().ages_mut() {
            *age = age.saturating_add(1);
        }
    }

    fn stage_digestion(&mut self, now: Tick) -> DigestionTotals {
        let mut totals = DigestionTotals::default();
        let handles: Vec<FishId> = self.fish.iter_handles().collect();
        for id in handles {
            let Some(runtime) = self.runtime.get_mut(id) else {
                continue;
            };
            if runtime.is_retired() {
                continue;
            }
            let reproductive = runtime.reproductive;
            let Some(physiology) = runtime.physiology.as_mut() else {
                continue;
            };
            let report = physiology.transfer(now, reproductive);
            totals.digesta += report.digesta;
            totals.discarded += report.discarded;
            runtime.last_transfer = report;
        }
        totals
    }

    fn stage_life_cycle(&mut self) {
        let ages = self.fish.columns().ages();
        for (index, id) in self.fish.iter_handles().enumerate() {
            let age = Age::new(ages[index] as f32);
            if let Some(runtime) = self.runtime.get_mut(id)
                && let Some(cycle) = runtime.life_cycle.as_mut()
            {
                cycle.advance(age);
            }
        }
    }

    fn stage_metamorphosis(&mut self, now: Tick) {
        let handles: Vec<FishId> = self.fish.iter_handles().collect();
        for id in handles {
            let Some(species) = self.fish.snapshot(id).map(|data| data.species) else {
                continue;
            };
            let Some(runtime) = self.runtime.get_mut(id) else {
                continue;
            };
            let Some(schedule) = runtime.metamorphosis.as_mut() else {
                continue;
            };
            if !schedule.due(now) {
                continue;
            }
            schedule.fire();
            self.pending_deaths.push((id, CauseOfDeath::Metamorphosis));
            self.pending_settlements.push(SettlementOrder { species });
        }
    }

    fn stage_death_cleanup(&mut self) -> Vec<DeathRecord> {
        if self.pending_deaths.is_empty() {
            self.last_deaths = 0;
            return Vec::new();
        }
        let mut seen = HashSet::new();
        let mut dead = Vec::new();
        for (id, cause) in self.pending_deaths.drain(..) {
            if seen.insert(id) && self.fish.contains(id) {
                if let Some(index) = self.fish.index_of(id) {
                    dead.push((index, id, cause));
                }
            }
        }
        if dead.is_empty() {
            self.last_deaths = 0;
            return Vec::new();
        }
        dead.sort_by_key(|(index, _, _)| *index);
        let mut records = Vec::with_capacity(dead.len());
        for &(_, id, cause) in &dead {
            if let Some(data) = self.fish.snapshot(id) {
                records.push(DeathRecord {
                    id,
                    species: data.species,
                    cause,
                });
            }
        }
        for (_, id, _) in dead.into_iter().rev() {
            self.runtime.remove(id);
            self.fish.remove(id);
        }
        self.last_deaths = records.len();
        records
    }

    fn stage_settlement_commit(&mut self) {
        if self.pending_settlements.is_empty() {
            self.last_settlements = 0;
            return;
        }
        let orders = std::mem::take(&mut self.pending_settlements);
        self.last_settlements = orders.len();
        for order in orders {
            let Some(species) = self.species.get(order.species.0 as usize) else {
                continue;
            };
            let starting_age = self
                .hatchery
                .settle(&species.config, &mut self.rng)
                .starting_age;
            let _ = self.settle_fish(order.species, starting_age);
        }
    }

    fn stage_telemetry(&mut self, next_tick: Tick, totals: DigestionTotals, deaths: &[DeathRecord]) {
        if self.config.telemetry_interval == 0
            || !next_tick
                .0
                .is_multiple_of(u64::from(self.config.telemetry_interval))
        {
            self.last_settlements = 0;
            self.last_deaths = 0;
            return;
        }

        let handles: Vec<FishId> = self.fish.iter_handles().collect();
        let runtime = &self.runtime;
        let reserves: Vec<f32> = handles
            .par_iter()
            .map(|id| {
                runtime
                    .get(*id)
                    .and_then(|rt| rt.physiology.as_ref())
                    .map_or(0.0, |physiology| physiology.total_reserves().value())
            })
            .collect();
        let total_reserves: f32 = reserves.iter().sum();
        let fish_count = handles.len();
        let average_reserves = if fish_count > 0 {
            total_reserves / fish_count as f32
        } else {
            0.0
        };

        let summary = TickSummary {
            tick: next_tick,
            fish_count,
            settlements: self.last_settlements,
            deaths: self.last_deaths,
            digesta_energy: totals.digesta.value(),
            discarded_energy: totals.discarded.value(),
            total_reserves,
            average_reserves,
        };
        let metrics = vec![
            MetricSample::from_f32("digesta_energy", summary.digesta_energy),
            MetricSample::from_f32("discarded_energy", summary.discarded_energy),
            MetricSample::from_f32("total_reserves", summary.total_reserves),
        ];
        let mut events = Vec::with_capacity(2);
        if self.last_settlements > 0 {
            events.push(TelemetryEvent::new(
                TelemetryEventKind::Settlements,
                self.last_settlements,
            ));
        }
        if self.last_deaths > 0 {
            events.push(TelemetryEvent::new(
                TelemetryEventKind::Deaths,
                self.last_deaths,
            ));
        }

        let batch = TelemetryBatch {
            summary: summary.clone(),
            metrics,
            events,
            deaths: deaths.to_vec(),
        };
        self.telemetry.on_tick(&batch);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.last_settlements = 0;
        self.last_deaths = 0;
    }

    /// Execute one simulation tick pipeline returning emitted events.
    pub fn step(&mut self) -> TickEvents {
        let next_tick = self.tick.next();

        self.stage_aging();
        let totals = self.stage_digestion(next_tick);
        self.stage_life_cycle();
        self.stage_metamorphosis(next_tick);
        let deaths = self.stage_death_cleanup();
        self.stage_settlement_commit();
        let settlements = self.last_settlements;
        self.stage_telemetry(next_tick, totals, &deaths);
        self.tick = next_tick;

        TickEvents {
            tick: next_tick,
            deaths,
            settlements,
            digesta_energy: totals.digesta,
            discarded_energy: totals.discarded,
        }
    }

    fn settle_fish(
        &mut self,
        species_id: SpeciesId,
        starting_age: u32,
    ) -> Result<FishId, ReefStateError> {
        let species = self
            .species
            .get(species_id.0 as usize)
            .ok_or(ReefStateError::UnknownSpecies(species_id))?;
        let boundaries = PhaseBoundaries::sample(&species.ages, species.phases, &mut self.rng);
        let physiology = Compartments::from_species(&species.config)?;
        let id = self.fish.insert(FishData {
            species: species_id,
            age: starting_age,
        });
        self.runtime
            .insert(id, FishRuntime::settled(physiology, LifeCycle::new(boundaries)));
        Ok(id)
    }

    /// Spawn a settled juvenile at the species' configured starting age,
    /// sampling its phase-boundary ages from the shared seeded generator.
    pub fn spawn_juvenile(&mut self, species: SpeciesId) -> Result<FishId, ReefStateError> {
        let starting_age = self
            .species
            .get(species.0 as usize)
            .ok_or(ReefStateError::UnknownSpecies(species))?
            .config
            .settlement_age;
        self.settle_fish(species, starting_age)
    }

    /// Spawn a pelagic larva whose metamorphosis schedule triggers at
    /// `now + metamorphosis_age`.
    pub fn spawn_larva(&mut self, species: SpeciesId) -> Result<FishId, ReefStateError> {
        let trigger = {
            let config = &self
                .species
                .get(species.0 as usize)
                .ok_or(ReefStateError::UnknownSpecies(species))?
                .config;
            Tick(self.tick.0 + u64::from(config.metamorphosis_age))
        };
        let id = self.fish.insert(FishData { species, age: 0 });
        self.runtime
            .insert(id, FishRuntime::larval(MetamorphosisSchedule::new(trigger)));
        Ok(id)
    }

    /// Queue forage mass into a fish's gut pipeline. Safe no-op on retired
    /// fish and on larvae, which do not feed through the pipeline.
    pub fn ingest(&mut self, id: FishId, mass: Mass) -> Result<(), ReefStateError> {
        let now = self.tick;
        let Some(runtime) = self.runtime.get_mut(id) else {
            return Err(ReefStateError::UnknownFish);
        };
        if runtime.is_retired() {
            return Ok(());
        }
        if let Some(physiology) = runtime.physiology.as_mut() {
            physiology.ingest(mass, now);
        }
        Ok(())
    }

    /// Record an external death cause. Returns false for unknown or already
    /// retired fish; the corpse is removed at the next cleanup stage.
    pub fn kill(&mut self, id: FishId, cause: CauseOfDeath) -> bool {
        let Some(runtime) = self.runtime.get_mut(id) else {
            return false;
        };
        if runtime.is_retired() {
            return false;
        }
        if let Some(cycle) = runtime.life_cycle.as_mut() {
            cycle.kill(cause);
        }
        if let Some(schedule) = runtime.metamorphosis.as_mut() {
            schedule.fire();
        }
        self.pending_deaths.push((id, cause));
        true
    }

    /// Flag a fish as being in its reproductive season. Returns false for
    /// unknown handles.
    pub fn set_reproductive(&mut self, id: FishId, reproductive: bool) -> bool {
        match self.runtime.get_mut(id) {
            Some(runtime) => {
                runtime.reproductive = reproductive;
                true
            }
            None => false,
        }
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &ReefConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Read-only access to the fish arena.
    #[must_use]
    pub fn fish(&self) -> &FishArena {
        &self.fish
    }

    /// Number of live fish.
    #[must_use]
    pub fn fish_count(&self) -> usize {
        self.fish.len()
    }

    /// Configuration for a species id, if configured.
    #[must_use]
    pub fn species_config(&self, id: SpeciesId) -> Option<&SpeciesConfig> {
        self.species.get(id.0 as usize).map(|species| &species.config)
    }

    /// Remove a fish by handle, returning its last known data.
    pub fn remove_fish(&mut self, id: FishId) -> Option<FishData> {
        self.runtime.remove(id);
        self.fish.remove(id)
    }

    /// Immutable access to per-fish runtime components.
    #[must_use]
    pub fn runtime(&self) -> &FishMap<FishRuntime> {
        &self.runtime
    }

    /// Borrow runtime components for a specific fish.
    #[must_use]
    pub fn fish_runtime(&self, id: FishId) -> Option<&FishRuntime> {
        self.runtime.get(id)
    }

    /// Mutably borrow runtime components for a specific fish.
    #[must_use]
    pub fn fish_runtime_mut(&mut self, id: FishId) -> Option<&mut FishRuntime> {
        self.runtime.get_mut(id)
    }

    /// Produce a combined snapshot of a fish's scalar columns and runtime.
    #[must_use]
    pub fn snapshot_fish(&self, id: FishId) -> Option<FishState> {
        let data = self.fish.snapshot(id)?;
        let runtime = self.runtime.get(id)?.clone();
        Some(FishState { id, data, runtime })
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replace the telemetry sink.
    pub fn set_telemetry(&mut self, telemetry: Box<dyn ReefTelemetry>) {
        self.telemetry = telemetry;
    }

    /// Replace the hatchery collaborator.
    pub fn set_hatchery(&mut self, hatchery: Box<dyn Hatchery>) {
        self.hatchery = hatchery;
    }
}
