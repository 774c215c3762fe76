use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::lifecycle::{self, Completion};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability;
use crate::pricing::{self, StayLength};

use super::availability::{check_available, validate_range};
use super::{Engine, EngineError};

pub(super) fn validate_note(note: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN
    {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

/// Everything `create_reservation` checks short of availability.
pub(super) fn check_bookable(
    terms: &Estate,
    range: &DateRange,
    occupancy: &Occupancy,
    today: Day,
) -> Result<PriceBreakdown, EngineError> {
    validate_range(range)?;
    if range.start < today {
        return Err(EngineError::Validation(format!(
            "start date {} is in the past",
            range.start
        )));
    }
    if terms.hidden {
        return Err(EngineError::Validation(format!(
            "estate {} is not accepting bookings",
            terms.id
        )));
    }
    pricing::quote(terms, &terms.rate, range, occupancy)
}

fn unwrap_committed(result: Option<Reservation>, id: Ulid) -> Result<Reservation, EngineError> {
    result.ok_or(EngineError::NotFound(id))
}

impl Engine {
    // ── Estate registry ──────────────────────────────────────

    pub async fn register_estate(&self, estate: Estate) -> Result<(), EngineError> {
        pricing::validate_terms(&estate)?;
        let _registry = self.registry.lock().await;
        if self.estates.len() >= MAX_ESTATES {
            return Err(EngineError::LimitExceeded("too many estates"));
        }
        if self.estates.contains_key(&estate.id) {
            return Err(EngineError::AlreadyExists(estate.id));
        }

        let id = estate.id;
        let event = Event::EstateRegistered { estate: estate.clone() };
        self.wal.append(&event).await?;
        self.estates
            .insert(id, Arc::new(RwLock::new(EstateState::new(estate))));
        metrics::gauge!(observability::ESTATES_ACTIVE).set(self.estates.len() as f64);
        tracing::info!(estate_id = %id, "estate registered");
        Ok(())
    }

    /// Replace an estate's terms. Committed reservations keep their price.
    pub async fn update_estate(&self, estate: Estate) -> Result<(), EngineError> {
        pricing::validate_terms(&estate)?;
        let mut guard = self.estate_write(&estate.id).await?;
        if guard.terms.host_id != estate.host_id {
            return Err(EngineError::Validation("an estate cannot change host".into()));
        }
        let reshaped = guard.terms.rate.rental_type() != estate.rate.rental_type()
            || guard.terms.is_business() != estate.is_business();
        if reshaped && guard.reservations.iter().any(Reservation::is_active) {
            return Err(EngineError::Validation(
                "cannot change rental type or business status while reservations are active".into(),
            ));
        }
        let id = estate.id;
        let event = Event::EstateUpdated { estate };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(estate_id = %id, hidden = guard.terms.hidden, "estate updated");
        Ok(())
    }

    // ── Booking ──────────────────────────────────────────────

    /// Check, price and commit a new reservation inside one write-locked section.
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        request: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        const OP: &str = "create";
        let started = std::time::Instant::now();
        let result = self.create_reservation_inner(actor, request).await;
        match &result {
            Ok(r) => {
                observability::record_transition(OP, "ok");
                metrics::histogram!(observability::TRANSITION_DURATION_SECONDS, "op" => OP)
                    .record(started.elapsed().as_secs_f64());
                tracing::info!(
                    reservation_id = %r.id,
                    estate_id = %r.estate_id,
                    range = %r.range,
                    status = %r.status,
                    total = r.price.total_price,
                    "reservation created"
                );
            }
            Err(e) => {
                observability::record_transition(OP, e.label());
                tracing::debug!(estate_id = %request.estate_id, error = %e, "booking rejected");
            }
        }
        result
    }

    async fn create_reservation_inner(
        &self,
        actor: &Actor,
        request: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        let BookingRequest { estate_id, range, occupancy } = request;
        let now = self.clock.now();
        let mut guard = self.estate_write(&estate_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ESTATE {
            return Err(EngineError::LimitExceeded("too many reservations on estate"));
        }

        let price = check_bookable(&guard.terms, &range, &occupancy, normalize(now))?;
        check_available(&guard, &range, None)?;
        let (reservation, effects) =
            lifecycle::open(&guard.terms, actor, range, occupancy, price, now)?;

        let event = Event::ReservationCreated { reservation: reservation.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        self.run_effects(&reservation, &effects).await;
        drop(guard);

        self.notify
            .send(estate_id, Notice::ReservationChanged(reservation.clone()));
        Ok(reservation)
    }

    // ── Long-term approval ───────────────────────────────────

    pub async fn approve_long_term(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let committed = self
            .transition(id, "approve", |_, r| lifecycle::approve_long_term(r, actor).map(Some))
            .await?;
        unwrap_committed(committed, id)
    }

    pub async fn deny_by_host(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let committed = self
            .transition(id, "deny", |_, r| lifecycle::deny_by_host(r, actor).map(Some))
            .await?;
        unwrap_committed(committed, id)
    }

    pub async fn cancel_reservation(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let committed = self
            .transition(id, "cancel", |_, r| lifecycle::cancel(r, actor).map(Some))
            .await?;
        unwrap_committed(committed, id)
    }

    // ── Date negotiation ─────────────────────────────────────

    pub async fn propose_extend(
        &self,
        actor: &Actor,
        id: Ulid,
        new_end: Day,
        note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        validate_note(&note)?;
        let committed = self
            .transition(id, "propose_extend", |state, r| {
                lifecycle::propose_extend(r, actor, new_end, note, |r, proposed| {
                    validate_range(proposed)?;
                    check_available(state, proposed, Some(r.id))?;
                    pricing::check_stay_length(&state.terms, StayLength::of(&r.rate, proposed))?;
                    pricing::extension_price(r, proposed.end)
                })
                .map(Some)
            })
            .await?;
        unwrap_committed(committed, id)
    }

    pub async fn propose_date_change(
        &self,
        actor: &Actor,
        id: Ulid,
        new_range: DateRange,
        note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        validate_note(&note)?;
        let today = normalize(self.clock.now());
        let committed = self
            .transition(id, "propose_date_change", |state, r| {
                lifecycle::propose_date_change(r, actor, new_range, note, |r, proposed| {
                    validate_range(proposed)?;
                    if proposed.start < today {
                        return Err(EngineError::Validation(format!(
                            "start date {} is in the past",
                            proposed.start
                        )));
                    }
                    check_available(state, proposed, Some(r.id))?;
                    // Booked rate, current limits.
                    pricing::quote(&state.terms, &r.rate, proposed, &r.occupancy)
                })
                .map(Some)
            })
            .await?;
        unwrap_committed(committed, id)
    }

    /// Commit a staged date change. The staged range is re-checked, since it
    /// was not held while the proposal was open.
    pub async fn approve_change(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let committed = self
            .transition(id, "approve_change", |state, r| {
                let effects = lifecycle::approve_change(r, actor)?;
                check_available(state, &r.range, Some(r.id))?;
                Ok(Some(effects))
            })
            .await?;
        unwrap_committed(committed, id)
    }

    pub async fn deny_change(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let committed = self
            .transition(id, "deny_change", |_, r| lifecycle::deny_change(r, actor).map(Some))
            .await?;
        unwrap_committed(committed, id)
    }

    // ── Unit-count negotiation ───────────────────────────────

    pub async fn propose_unit_count_change(
        &self,
        actor: &Actor,
        id: Ulid,
        new_unit_count: u32,
        note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        validate_note(&note)?;
        let committed = self
            .transition(id, "propose_unit_change", |state, r| {
                lifecycle::propose_unit_count_change(r, actor, new_unit_count, note, |_, units| {
                    pricing::check_unit_count(state.terms.business_units.unwrap_or(0), units)
                })
                .map(Some)
            })
            .await?;
        unwrap_committed(committed, id)
    }

    pub async fn approve_unit_count_change(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let committed = self
            .transition(id, "approve_unit_change", |state, r| {
                lifecycle::approve_unit_count_change(r, actor, |r, units| {
                    pricing::quote(&state.terms, &r.rate, &r.range, &Occupancy::Units(units))
                })
                .map(Some)
            })
            .await?;
        unwrap_committed(committed, id)
    }

    pub async fn deny_unit_count_change(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let committed = self
            .transition(id, "deny_unit_change", |_, r| {
                lifecycle::deny_unit_count_change(r, actor).map(Some)
            })
            .await?;
        unwrap_committed(committed, id)
    }

    // ── Completion ───────────────────────────────────────────

    /// Manual completion by either party. Completing an already completed
    /// reservation succeeds without writing anything.
    pub async fn complete_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<(Completion, Reservation), EngineError> {
        let now = self.clock.now();
        let grace = self.completion_grace;
        let committed = self
            .transition(id, "complete", |_, r| {
                let (outcome, effects) = lifecycle::complete(r, actor, now, grace)?;
                Ok((outcome == Completion::Completed).then_some(effects))
            })
            .await?;
        match committed {
            Some(r) => {
                metrics::counter!(observability::COMPLETIONS_TOTAL, "trigger" => "manual").increment(1);
                Ok((Completion::Completed, r))
            }
            None => Ok((Completion::AlreadyCompleted, self.get_reservation(id).await?)),
        }
    }

    /// Delivered completion job. Completes the reservation only if it is still
    /// CONFIRMED and has ended; every other case is a silent no-op. Returns
    /// whether the reservation was completed.
    pub async fn fire_completion(&self, id: Ulid, trigger: &'static str) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let grace = self.completion_grace;
        let committed = match self
            .transition(id, "fire", |_, r| Ok(lifecycle::fire(r, now, grace).then(Vec::new)))
            .await
        {
            Ok(c) => c,
            Err(EngineError::NotFound(_)) => {
                tracing::debug!(reservation_id = %id, "completion fired for unknown reservation");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        match committed {
            Some(_) => {
                self.unscheduled.remove(&id);
                metrics::counter!(observability::COMPLETIONS_TOTAL, "trigger" => trigger).increment(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Ratings ──────────────────────────────────────────────

    /// Fold one review score into the estate's running tally in a single step.
    pub async fn record_rating(&self, estate_id: Ulid, score: u8) -> Result<RatingSummary, EngineError> {
        if !(1..=5).contains(&score) {
            return Err(EngineError::Validation(format!(
                "rating {score} is outside 1..=5"
            )));
        }
        let mut guard = self.estate_write(&estate_id).await?;
        let rating = guard.rating.with_score(score);
        let event = Event::RatingRecorded { estate_id, rating };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(rating)
    }
}
