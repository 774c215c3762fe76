use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::lifecycle;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{self, validate_range};
use super::mutations::check_bookable;
use super::{Engine, EngineError, SharedEstateState};

fn validate_window(window: &DateRange) -> Result<(), EngineError> {
    validate_range(window)?;
    if window.nights() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    fn estate_states(&self) -> Vec<SharedEstateState> {
        self.estates.iter().map(|e| e.value().clone()).collect()
    }

    async fn estate_read(
        &self,
        estate_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<EstateState>, EngineError> {
        let state = self
            .get_estate_state(estate_id)
            .ok_or(EngineError::NotFound(*estate_id))?;
        Ok(state.read_owned().await)
    }

    pub async fn get_estate(&self, estate_id: Ulid) -> Result<Estate, EngineError> {
        Ok(self.estate_read(&estate_id).await?.terms.clone())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let estate_id = self
            .estate_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.estate_read(&estate_id).await?;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every reservation on an estate, terminal ones included, by start date.
    pub async fn reservations_for_estate(&self, estate_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.estate_read(&estate_id).await?.reservations.clone())
    }

    pub async fn reservations_for_guest(&self, guest_id: Ulid) -> Vec<Reservation> {
        let mut found = Vec::new();
        for state in self.estate_states() {
            let guard = state.read().await;
            found.extend(guard.reservations.iter().filter(|r| r.guest_id == guest_id).cloned());
        }
        found.sort_by_key(|r| r.range.start);
        found
    }

    pub async fn reservations_for_host(&self, host_id: Ulid) -> Vec<Reservation> {
        let mut found = Vec::new();
        for state in self.estate_states() {
            let guard = state.read().await;
            if guard.terms.host_id == host_id {
                found.extend(guard.reservations.iter().cloned());
            }
        }
        found.sort_by_key(|r| r.range.start);
        found
    }

    pub async fn locks_for_estate(&self, estate_id: Ulid) -> Result<Vec<LockWindow>, EngineError> {
        Ok(self.estate_read(&estate_id).await?.locks.clone())
    }

    pub async fn is_available(
        &self,
        estate_id: Ulid,
        range: DateRange,
        exclude_reservation: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        validate_range(&range)?;
        let guard = self.estate_read(&estate_id).await?;
        Ok(availability::is_available(&guard, &range, exclude_reservation))
    }

    pub async fn calendar(&self, estate_id: Ulid, window: DateRange) -> Result<Vec<CalendarEntry>, EngineError> {
        validate_window(&window)?;
        let guard = self.estate_read(&estate_id).await?;
        Ok(availability::calendar(&guard, &window))
    }

    pub async fn occupied_ranges(&self, estate_id: Ulid, window: DateRange) -> Result<Vec<DateRange>, EngineError> {
        validate_window(&window)?;
        let guard = self.estate_read(&estate_id).await?;
        Ok(availability::occupied_ranges(&guard, &window))
    }

    pub async fn free_ranges(&self, estate_id: Ulid, window: DateRange) -> Result<Vec<DateRange>, EngineError> {
        validate_window(&window)?;
        let guard = self.estate_read(&estate_id).await?;
        Ok(availability::free_ranges(&guard, &window))
    }

    /// Price preview with the same checks as booking, availability aside.
    pub async fn quote(
        &self,
        estate_id: Ulid,
        range: DateRange,
        occupancy: Occupancy,
    ) -> Result<PriceBreakdown, EngineError> {
        let today = normalize(self.clock.now());
        let guard = self.estate_read(&estate_id).await?;
        check_bookable(&guard.terms, &range, &occupancy, today)
    }

    pub async fn rating(&self, estate_id: Ulid) -> Result<RatingSummary, EngineError> {
        Ok(self.estate_read(&estate_id).await?.rating)
    }

    // ── Background support ───────────────────────────────────

    /// CONFIRMED reservations that have ended by `now`.
    pub async fn collect_due_completions(&self, now: DateTime<Utc>) -> Vec<Ulid> {
        let mut due = Vec::new();
        for state in self.estate_states() {
            let guard = state.read().await;
            due.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| {
                        r.status == ReservationStatus::Confirmed
                            && lifecycle::has_ended(r, now, self.completion_grace)
                    })
                    .map(|r| r.id),
            );
        }
        due
    }

    /// Reservations waiting for their completion job to be (re)armed.
    pub fn pending_reconciliation(&self) -> usize {
        self.unscheduled.len()
    }

    /// Retry arming jobs for every reservation in the reconciliation set.
    /// Entries that are no longer CONFIRMED are dropped. Returns how many
    /// jobs were armed.
    pub async fn reconcile_schedules(&self) -> usize {
        let pending: Vec<Ulid> = self.unscheduled.iter().map(|id| *id).collect();
        let mut armed = 0;
        for id in pending {
            let Some(estate_id) = self.estate_for_reservation(&id) else {
                self.unscheduled.remove(&id);
                continue;
            };
            let Ok(guard) = self.estate_write(&estate_id).await else {
                self.unscheduled.remove(&id);
                continue;
            };
            let end = match guard.reservation(&id) {
                Some(r) if r.status == ReservationStatus::Confirmed => r.range.end,
                _ => {
                    self.unscheduled.remove(&id);
                    continue;
                }
            };
            // Held so a concurrent transition cannot re-arm with stale dates.
            self.arm_completion(id, end, true).await;
            drop(guard);
            if !self.unscheduled.contains(&id) {
                armed += 1;
            }
        }
        metrics::gauge!(observability::RECONCILIATION_BACKLOG).set(self.unscheduled.len() as f64);
        if armed > 0 {
            tracing::info!(armed, remaining = self.unscheduled.len(), "reconciled completion jobs");
        }
        armed
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut guards = Vec::new();
        for state in self.estate_states() {
            guards.push(state.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::EstateRegistered { estate: guard.terms.clone() });
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated { reservation: reservation.clone() });
            }
            for lock in &guard.locks {
                events.push(Event::LockPlaced { lock: lock.clone() });
            }
            if guard.rating.count > 0 {
                events.push(Event::RatingRecorded {
                    estate_id: guard.terms.id,
                    rating: guard.rating,
                });
            }
        }

        let count = events.len();
        // Guards stay held until the rewrite lands so no append slips in between.
        self.wal.compact(events).await?;
        drop(guards);
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
