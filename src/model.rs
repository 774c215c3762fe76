use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::EngineError;

/// Whole currency units. Rates, fees, discounts and totals all share this type.
pub type Amount = i64;

/// A calendar day. Reservation and lock boundaries never carry a time of day.
pub type Day = NaiveDate;

/// Midnight UTC at the start of `day`.
pub fn midnight_utc(day: Day) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// Truncate an instant to its UTC calendar day.
pub fn normalize(at: DateTime<Utc>) -> Day {
    at.date_naive()
}

/// Half-open day range `[start, end)`. The end day is the checkout day and is
/// free for the next arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Day,
    pub end: Day,
}

impl DateRange {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: Day, end: Day) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::Validation(format!(
                "start date {start} must be before end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Build a range from arbitrary instants, truncating both to their UTC day.
    pub fn from_instants(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, EngineError> {
        Self::try_new(normalize(start), normalize(end))
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: Day) -> bool {
        self.start <= day && day < self.end
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RentalType {
    ShortTerm,
    LongTerm,
}

/// The price basis of an estate or reservation. Exactly one of nightly or
/// monthly pricing applies, and it decides the rental type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rate {
    Nightly(Amount),
    Monthly(Amount),
}

impl Rate {
    pub fn rental_type(&self) -> RentalType {
        match self {
            Rate::Nightly(_) => RentalType::ShortTerm,
            Rate::Monthly(_) => RentalType::LongTerm,
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            Rate::Nightly(a) | Rate::Monthly(a) => *a,
        }
    }

    pub fn price_per_night(&self) -> Option<Amount> {
        match self {
            Rate::Nightly(a) => Some(*a),
            Rate::Monthly(_) => None,
        }
    }

    pub fn price_per_month(&self) -> Option<Amount> {
        match self {
            Rate::Monthly(a) => Some(*a),
            Rate::Nightly(_) => None,
        }
    }
}

/// Estate details supplied by the listing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estate {
    pub id: Ulid,
    pub host_id: Ulid,
    pub rate: Rate,
    /// Guests covered by the base rate.
    pub guests_included: u32,
    /// Additional guests accepted on top of `guests_included`, each charged `extra_guest_fee`.
    pub extra_people_allowance: u32,
    pub extra_guest_fee: Amount,
    /// Flat discount applied once when any children are on the reservation.
    pub children_discount: Amount,
    /// In nights for nightly estates, in smart months for monthly ones.
    pub min_stay: u32,
    pub max_stay: Option<u32>,
    /// `Some(n)`: a business estate leased by the unit, `n` units available.
    pub business_units: Option<u32>,
    pub hidden: bool,
}

impl Estate {
    pub fn new(id: Ulid, host_id: Ulid, rate: Rate) -> Self {
        Self {
            id,
            host_id,
            rate,
            guests_included: 2,
            extra_people_allowance: 0,
            extra_guest_fee: 0,
            children_discount: 0,
            min_stay: 1,
            max_stay: None,
            business_units: None,
            hidden: false,
        }
    }

    pub fn is_business(&self) -> bool {
        self.business_units.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Guest,
    Host,
}

/// Who is performing an operation. Passed explicitly to every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn guest(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Guest }
    }

    pub fn host(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Host }
    }
}

/// Residential stays count people; business leases count units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Occupancy {
    Guests { guests: u32, children: u32 },
    Units(u32),
}

impl Occupancy {
    pub fn guests(guests: u32) -> Self {
        Occupancy::Guests { guests, children: 0 }
    }

    pub fn unit_count(&self) -> Option<u32> {
        match self {
            Occupancy::Units(n) => Some(*n),
            Occupancy::Guests { .. } => None,
        }
    }
}

/// Itemized price. Line items are retained so the total can be audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub base_price: Amount,
    pub extra_people_fee: Option<Amount>,
    pub children_discount: Option<Amount>,
    pub total_price: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Canceled,
    Completed,
}

impl ReservationStatus {
    /// Active reservations occupy the calendar.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Canceled => "CANCELED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A staged date proposal on a residential reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingChange {
    Extend { new_end: Day, extra_price: Amount },
    UpdateDate { new_range: DateRange, price: PriceBreakdown },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedChange {
    pub change: PendingChange,
    pub note: Option<String>,
}

/// A staged unit-count proposal on a business lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingContractChange {
    pub new_unit_count: u32,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub estate_id: Ulid,
    pub guest_id: Ulid,
    /// Copied from the estate at creation.
    pub host_id: Ulid,
    pub range: DateRange,
    /// Snapshot of the estate rate at creation.
    pub rate: Rate,
    pub occupancy: Occupancy,
    pub price: PriceBreakdown,
    pub status: ReservationStatus,
    pub pending_change: Option<StagedChange>,
    pub pending_contract_change: Option<PendingContractChange>,
    pub is_contract_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn rental_type(&self) -> RentalType {
        self.rate.rental_type()
    }

    pub fn is_long_term(&self) -> bool {
        self.rental_type() == RentalType::LongTerm
    }

    pub fn is_business(&self) -> bool {
        matches!(self.occupancy, Occupancy::Units(_))
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn has_proposal(&self) -> bool {
        self.pending_change.is_some() || self.pending_contract_change.is_some()
    }

    pub fn is_participant(&self, user_id: Ulid) -> bool {
        self.guest_id == user_id || self.host_id == user_id
    }
}

/// A host-created blackout window. Existence is its only state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockWindow {
    pub id: Ulid,
    pub estate_id: Ulid,
    pub host_id: Ulid,
    pub range: DateRange,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Running review tally. Stored as a sum so the average never drifts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub score_sum: u64,
    pub count: u64,
}

impl RatingSummary {
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.score_sum as f64 / self.count as f64)
    }

    pub fn with_score(self, score: u8) -> Self {
        Self {
            score_sum: self.score_sum + u64::from(score),
            count: self.count + 1,
        }
    }
}

/// Everything the engine knows about one estate. Guarded by a single lock.
#[derive(Debug, Clone)]
pub struct EstateState {
    pub terms: Estate,
    /// Every reservation ever made here, terminal ones included, sorted by `range.start`.
    pub reservations: Vec<Reservation>,
    /// Lock windows sorted by `range.start`.
    pub locks: Vec<LockWindow>,
    pub rating: RatingSummary,
}

impl EstateState {
    pub fn new(terms: Estate) -> Self {
        Self {
            terms,
            reservations: Vec::new(),
            locks: Vec::new(),
            rating: RatingSummary::default(),
        }
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Insert or replace a reservation, keeping sort order by start day.
    pub fn upsert_reservation(&mut self, reservation: Reservation) {
        if let Some(pos) = self.reservations.iter().position(|r| r.id == reservation.id) {
            self.reservations.remove(pos);
        }
        let pos = self
            .reservations
            .partition_point(|r| r.range.start <= reservation.range.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn insert_lock(&mut self, lock: LockWindow) {
        let pos = self.locks.partition_point(|l| l.range.start <= lock.range.start);
        self.locks.insert(pos, lock);
    }

    pub fn remove_lock(&mut self, id: &Ulid) -> Option<LockWindow> {
        let pos = self.locks.iter().position(|l| l.id == *id)?;
        Some(self.locks.remove(pos))
    }

    /// Active reservations overlapping `query`. Binary search skips everything
    /// starting on or after `query.end`.
    pub fn active_overlapping<'a>(
        &'a self,
        query: &'a DateRange,
    ) -> impl Iterator<Item = &'a Reservation> + 'a {
        let right_bound = self
            .reservations
            .partition_point(|r| r.range.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.range.end > query.start)
    }

    pub fn locks_overlapping<'a>(
        &'a self,
        query: &'a DateRange,
    ) -> impl Iterator<Item = &'a LockWindow> + 'a {
        let right_bound = self.locks.partition_point(|l| l.range.start < query.end);
        self.locks[..right_bound]
            .iter()
            .filter(move |l| l.range.end > query.start)
    }
}

/// WAL record format. Reservations are always written whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EstateRegistered { estate: Estate },
    EstateUpdated { estate: Estate },
    ReservationCreated { reservation: Reservation },
    ReservationUpdated { reservation: Reservation },
    LockPlaced { lock: LockWindow },
    LocksRemoved { estate_id: Ulid, ids: Vec<Ulid> },
    RatingRecorded { estate_id: Ulid, rating: RatingSummary },
}

impl Event {
    pub fn estate_id(&self) -> Ulid {
        match self {
            Event::EstateRegistered { estate } | Event::EstateUpdated { estate } => estate.id,
            Event::ReservationCreated { reservation }
            | Event::ReservationUpdated { reservation } => reservation.estate_id,
            Event::LockPlaced { lock } => lock.estate_id,
            Event::LocksRemoved { estate_id, .. } | Event::RatingRecorded { estate_id, .. } => {
                *estate_id
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// What occupies a stretch of the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Reservation(Ulid),
    Lock(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarEntry {
    pub range: DateRange,
    pub occupant: Occupant,
}

/// A booking intent as received from the request tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub estate_id: Ulid,
    pub range: DateRange,
    pub occupancy: Occupancy,
}
