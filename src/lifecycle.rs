//! Reservation lifecycle as pure transitions over a [`Reservation`] value.
//!
//! Every function checks the actor first, then the current state, then runs
//! any caller-supplied pricing/availability check, and only then mutates. On
//! error the reservation is left untouched. Side effects on the scheduler and
//! the contract collaborator are returned as [`Effect`]s for the engine to run.

use chrono::{DateTime, Duration, Utc};
use ulid::Ulid;

use crate::error::EngineError;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    Lease,
    DateAmendment,
    UnitAmendment,
    Cancellation,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Lease => "lease",
            ContractKind::DateAmendment => "date_amendment",
            ContractKind::UnitAmendment => "unit_amendment",
            ContractKind::Cancellation => "cancellation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ScheduleCompletion { ends: Day },
    RescheduleCompletion { ends: Day },
    CancelCompletion,
    RequestContract(ContractKind),
}

/// Result of a completion attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    AlreadyCompleted,
}

fn require_guest(r: &Reservation, actor: &Actor, op: &'static str) -> Result<(), EngineError> {
    if !r.is_participant(actor.user_id) {
        return Err(EngineError::Unauthorized(format!(
            "{} is not a party to reservation {}",
            actor.user_id, r.id
        )));
    }
    if actor.role != Role::Guest || actor.user_id != r.guest_id {
        return Err(EngineError::Unauthorized(format!("only the guest may {op}")));
    }
    Ok(())
}

fn require_host(r: &Reservation, actor: &Actor, op: &'static str) -> Result<(), EngineError> {
    if !r.is_participant(actor.user_id) {
        return Err(EngineError::Unauthorized(format!(
            "{} is not a party to reservation {}",
            actor.user_id, r.id
        )));
    }
    if actor.role != Role::Host || actor.user_id != r.host_id {
        return Err(EngineError::Unauthorized(format!("only the host may {op}")));
    }
    Ok(())
}

fn require_status(
    r: &Reservation,
    wanted: ReservationStatus,
    op: &'static str,
) -> Result<(), EngineError> {
    if r.status != wanted {
        return Err(EngineError::IllegalTransition { op, status: r.status });
    }
    Ok(())
}

fn require_live(r: &Reservation, op: &'static str) -> Result<(), EngineError> {
    if r.status.is_terminal() {
        return Err(EngineError::IllegalTransition { op, status: r.status });
    }
    Ok(())
}

fn require_residential(r: &Reservation) -> Result<(), EngineError> {
    if r.is_business() {
        return Err(EngineError::Validation(
            "business leases change by unit count, not by dates".into(),
        ));
    }
    Ok(())
}

/// A reservation has ended once the clock reaches midnight UTC of its end day plus `grace`.
pub fn has_ended(r: &Reservation, now: DateTime<Utc>, grace: Duration) -> bool {
    now >= midnight_utc(r.range.end) + grace
}

/// Build a new reservation. Short stays are accepted immediately; long-term
/// leases wait for the host.
pub fn open(
    estate: &Estate,
    guest: &Actor,
    range: DateRange,
    occupancy: Occupancy,
    price: PriceBreakdown,
    now: DateTime<Utc>,
) -> Result<(Reservation, Vec<Effect>), EngineError> {
    if guest.role != Role::Guest {
        return Err(EngineError::Unauthorized("only guests may book".into()));
    }
    if guest.user_id == estate.host_id {
        return Err(EngineError::Unauthorized("hosts cannot book their own estate".into()));
    }
    let long_term = estate.rate.rental_type() == RentalType::LongTerm;
    let status = if long_term {
        ReservationStatus::Pending
    } else {
        ReservationStatus::Confirmed
    };
    let reservation = Reservation {
        id: Ulid::new(),
        estate_id: estate.id,
        guest_id: guest.user_id,
        host_id: estate.host_id,
        range,
        rate: estate.rate,
        occupancy,
        price,
        status,
        pending_change: None,
        pending_contract_change: None,
        is_contract_required: long_term,
        created_at: now,
        updated_at: now,
    };
    let effects = if long_term {
        Vec::new()
    } else {
        vec![Effect::ScheduleCompletion { ends: range.end }]
    };
    Ok((reservation, effects))
}

pub fn approve_long_term(r: &mut Reservation, actor: &Actor) -> Result<Vec<Effect>, EngineError> {
    const OP: &str = "approve";
    require_host(r, actor, OP)?;
    require_status(r, ReservationStatus::Pending, OP)?;
    if !r.is_long_term() || r.has_proposal() {
        return Err(EngineError::IllegalTransition { op: OP, status: r.status });
    }
    r.status = ReservationStatus::Confirmed;
    Ok(vec![
        Effect::ScheduleCompletion { ends: r.range.end },
        Effect::RequestContract(ContractKind::Lease),
    ])
}

/// Stage an extension of the end date. `price_extension` runs the caller's
/// availability and pricing checks against the proposed range.
pub fn propose_extend<F>(
    r: &mut Reservation,
    actor: &Actor,
    new_end: Day,
    note: Option<String>,
    price_extension: F,
) -> Result<Vec<Effect>, EngineError>
where
    F: FnOnce(&Reservation, &DateRange) -> Result<Amount, EngineError>,
{
    const OP: &str = "extend";
    require_guest(r, actor, OP)?;
    require_live(r, OP)?;
    require_residential(r)?;
    require_status(r, ReservationStatus::Confirmed, OP)?;
    if new_end <= r.range.end {
        return Err(EngineError::Validation(format!(
            "new end date {new_end} must be after the current end date {}",
            r.range.end
        )));
    }
    let proposed = DateRange::new(r.range.start, new_end);
    let extra_price = price_extension(r, &proposed)?;
    r.pending_change = Some(StagedChange {
        change: PendingChange::Extend { new_end, extra_price },
        note,
    });
    r.status = ReservationStatus::Pending;
    Ok(Vec::new())
}

/// Stage a move to a different date range. `price_range` prices the whole
/// proposed stay after checking it is free.
pub fn propose_date_change<F>(
    r: &mut Reservation,
    actor: &Actor,
    new_range: DateRange,
    note: Option<String>,
    price_range: F,
) -> Result<Vec<Effect>, EngineError>
where
    F: FnOnce(&Reservation, &DateRange) -> Result<PriceBreakdown, EngineError>,
{
    const OP: &str = "change dates of";
    require_guest(r, actor, OP)?;
    require_live(r, OP)?;
    require_residential(r)?;
    require_status(r, ReservationStatus::Confirmed, OP)?;
    if new_range == r.range {
        return Err(EngineError::Validation("proposed dates match the current dates".into()));
    }
    let price = price_range(r, &new_range)?;
    r.pending_change = Some(StagedChange {
        change: PendingChange::UpdateDate { new_range, price },
        note,
    });
    r.status = ReservationStatus::Pending;
    Ok(Vec::new())
}

pub fn approve_change(r: &mut Reservation, actor: &Actor) -> Result<Vec<Effect>, EngineError> {
    const OP: &str = "approve change";
    require_host(r, actor, OP)?;
    require_live(r, OP)?;
    let Some(staged) = r.pending_change.take() else {
        return Err(EngineError::NothingStaged(OP));
    };
    let mut effects = Vec::with_capacity(2);
    match staged.change {
        PendingChange::Extend { new_end, extra_price } => {
            r.range = DateRange::new(r.range.start, new_end);
            r.price.base_price += extra_price;
            r.price.total_price += extra_price;
        }
        PendingChange::UpdateDate { new_range, price } => {
            r.range = new_range;
            r.price = price;
            if r.is_long_term() {
                effects.push(Effect::RequestContract(ContractKind::DateAmendment));
            }
        }
    }
    r.status = ReservationStatus::Confirmed;
    effects.insert(0, Effect::RescheduleCompletion { ends: r.range.end });
    Ok(effects)
}

pub fn deny_change(r: &mut Reservation, actor: &Actor) -> Result<Vec<Effect>, EngineError> {
    const OP: &str = "deny change";
    require_host(r, actor, OP)?;
    require_live(r, OP)?;
    if r.pending_change.take().is_none() {
        return Err(EngineError::NothingStaged(OP));
    }
    r.status = ReservationStatus::Confirmed;
    // The original end may have passed while the proposal was open.
    Ok(vec![Effect::RescheduleCompletion { ends: r.range.end }])
}

/// Stage a unit-count change on a business lease. `check_units` validates the
/// new count against the estate.
pub fn propose_unit_count_change<F>(
    r: &mut Reservation,
    actor: &Actor,
    new_unit_count: u32,
    note: Option<String>,
    check_units: F,
) -> Result<Vec<Effect>, EngineError>
where
    F: FnOnce(&Reservation, u32) -> Result<(), EngineError>,
{
    const OP: &str = "change units of";
    require_guest(r, actor, OP)?;
    require_live(r, OP)?;
    let Some(current) = r.occupancy.unit_count() else {
        return Err(EngineError::Validation(
            "unit counts only apply to business leases".into(),
        ));
    };
    require_status(r, ReservationStatus::Confirmed, OP)?;
    if new_unit_count == current {
        return Err(EngineError::Validation(format!(
            "reservation already has {current} units"
        )));
    }
    check_units(r, new_unit_count)?;
    r.pending_contract_change = Some(PendingContractChange { new_unit_count, note });
    r.status = ReservationStatus::Pending;
    Ok(Vec::new())
}

/// Commit a staged unit-count change. `reprice` prices the committed range at
/// the new unit count and may still reject it.
pub fn approve_unit_count_change<F>(
    r: &mut Reservation,
    actor: &Actor,
    reprice: F,
) -> Result<Vec<Effect>, EngineError>
where
    F: FnOnce(&Reservation, u32) -> Result<PriceBreakdown, EngineError>,
{
    const OP: &str = "approve unit change";
    require_host(r, actor, OP)?;
    require_live(r, OP)?;
    let Some(staged) = r.pending_contract_change.as_ref() else {
        return Err(EngineError::NothingStaged(OP));
    };
    let units = staged.new_unit_count;
    let price = reprice(r, units)?;
    r.pending_contract_change = None;
    r.occupancy = Occupancy::Units(units);
    r.price = price;
    r.status = ReservationStatus::Confirmed;
    Ok(vec![
        Effect::RescheduleCompletion { ends: r.range.end },
        Effect::RequestContract(ContractKind::UnitAmendment),
    ])
}

pub fn deny_unit_count_change(r: &mut Reservation, actor: &Actor) -> Result<Vec<Effect>, EngineError> {
    const OP: &str = "deny unit change";
    require_host(r, actor, OP)?;
    require_live(r, OP)?;
    if r.pending_contract_change.take().is_none() {
        return Err(EngineError::NothingStaged(OP));
    }
    r.status = ReservationStatus::Confirmed;
    Ok(vec![Effect::RescheduleCompletion { ends: r.range.end }])
}

pub fn cancel(r: &mut Reservation, actor: &Actor) -> Result<Vec<Effect>, EngineError> {
    const OP: &str = "cancel";
    require_guest(r, actor, OP)?;
    require_live(r, OP)?;
    r.status = ReservationStatus::Canceled;
    r.pending_change = None;
    r.pending_contract_change = None;
    let mut effects = vec![Effect::CancelCompletion];
    if r.is_long_term() {
        effects.push(Effect::RequestContract(ContractKind::Cancellation));
    }
    Ok(effects)
}

/// Host rejection of a long-term request that was never confirmed.
pub fn deny_by_host(r: &mut Reservation, actor: &Actor) -> Result<Vec<Effect>, EngineError> {
    const OP: &str = "deny";
    require_host(r, actor, OP)?;
    require_status(r, ReservationStatus::Pending, OP)?;
    if !r.is_long_term() || r.has_proposal() {
        return Err(EngineError::IllegalTransition { op: OP, status: r.status });
    }
    r.status = ReservationStatus::Canceled;
    Ok(vec![Effect::CancelCompletion])
}

/// Manual completion by either party. Completing twice is a no-op.
pub fn complete(
    r: &mut Reservation,
    actor: &Actor,
    now: DateTime<Utc>,
    grace: Duration,
) -> Result<(Completion, Vec<Effect>), EngineError> {
    const OP: &str = "complete";
    if !r.is_participant(actor.user_id) {
        return Err(EngineError::Unauthorized(format!(
            "{} is not a party to reservation {}",
            actor.user_id, r.id
        )));
    }
    match r.status {
        ReservationStatus::Completed => return Ok((Completion::AlreadyCompleted, Vec::new())),
        ReservationStatus::Confirmed => {}
        status @ (ReservationStatus::Pending | ReservationStatus::Canceled) => {
            return Err(EngineError::IllegalTransition { op: OP, status });
        }
    }
    if !has_ended(r, now, grace) {
        return Err(EngineError::NotYetEnded(r.range.end));
    }
    r.status = ReservationStatus::Completed;
    Ok((Completion::Completed, vec![Effect::CancelCompletion]))
}

/// Scheduler-driven completion. Returns whether anything changed; every other
/// observed state is a silent no-op.
pub fn fire(r: &mut Reservation, now: DateTime<Utc>, grace: Duration) -> bool {
    if r.status != ReservationStatus::Confirmed || !has_ended(r, now, grace) {
        return false;
    }
    r.status = ReservationStatus::Completed;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn day(y: i32, m: u32, d: u32) -> Day {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()
    }

    fn price(total: Amount) -> PriceBreakdown {
        PriceBreakdown {
            base_price: total,
            extra_people_fee: None,
            children_discount: None,
            total_price: total,
        }
    }

    struct Parties {
        guest: Actor,
        host: Actor,
        stranger: Actor,
    }

    fn parties(estate: &Estate) -> Parties {
        Parties {
            guest: Actor::guest(Ulid::new()),
            host: Actor::host(estate.host_id),
            stranger: Actor::guest(Ulid::new()),
        }
    }

    fn short_stay() -> (Reservation, Parties) {
        let estate = Estate::new(Ulid::new(), Ulid::new(), Rate::Nightly(100));
        let p = parties(&estate);
        let range = DateRange::new(day(2024, 3, 1), day(2024, 3, 4));
        let (r, _) = open(&estate, &p.guest, range, Occupancy::guests(2), price(300), now()).unwrap();
        (r, p)
    }

    fn long_stay() -> (Reservation, Parties) {
        let estate = Estate::new(Ulid::new(), Ulid::new(), Rate::Monthly(800));
        let p = parties(&estate);
        let range = DateRange::new(day(2024, 3, 1), day(2024, 6, 1));
        let (r, _) = open(&estate, &p.guest, range, Occupancy::guests(1), price(2400), now()).unwrap();
        (r, p)
    }

    fn business_lease(units: u32) -> (Reservation, Parties) {
        let mut estate = Estate::new(Ulid::new(), Ulid::new(), Rate::Monthly(1000));
        estate.business_units = Some(10);
        let p = parties(&estate);
        let range = DateRange::new(day(2024, 3, 1), day(2024, 6, 1));
        let (mut r, _) =
            open(&estate, &p.guest, range, Occupancy::Units(units), price(3000), now()).unwrap();
        approve_long_term(&mut r, &p.host).unwrap();
        (r, p)
    }

    #[test]
    fn short_term_opens_confirmed_and_arms_completion() {
        let estate = Estate::new(Ulid::new(), Ulid::new(), Rate::Nightly(100));
        let guest = Actor::guest(Ulid::new());
        let range = DateRange::new(day(2024, 3, 1), day(2024, 3, 4));
        let (r, effects) = open(&estate, &guest, range, Occupancy::guests(1), price(300), now()).unwrap();
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert!(!r.is_contract_required);
        assert_eq!(r.host_id, estate.host_id);
        assert_eq!(effects, vec![Effect::ScheduleCompletion { ends: range.end }]);
    }

    #[test]
    fn long_term_opens_pending_without_job() {
        let (r, _) = long_stay();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert!(r.is_contract_required);
    }

    #[test]
    fn host_cannot_book_own_estate() {
        let estate = Estate::new(Ulid::new(), Ulid::new(), Rate::Nightly(100));
        let range = DateRange::new(day(2024, 3, 1), day(2024, 3, 4));
        let as_guest = Actor::guest(estate.host_id);
        let err = open(&estate, &as_guest, range, Occupancy::guests(1), price(300), now()).unwrap_err();
        assert!(err.is_authorization());
        let as_host = Actor::host(Ulid::new());
        assert!(open(&estate, &as_host, range, Occupancy::guests(1), price(300), now()).is_err());
    }

    #[test]
    fn approve_long_term_arms_job_and_requests_lease() {
        let (mut r, p) = long_stay();
        let effects = approve_long_term(&mut r, &p.host).unwrap();
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert_eq!(
            effects,
            vec![
                Effect::ScheduleCompletion { ends: r.range.end },
                Effect::RequestContract(ContractKind::Lease),
            ]
        );
        // Second approval is bad timing.
        assert!(approve_long_term(&mut r, &p.host).unwrap_err().is_state());
    }

    #[test]
    fn approve_long_term_requires_the_host() {
        let (mut r, p) = long_stay();
        assert!(approve_long_term(&mut r, &p.guest).unwrap_err().is_authorization());
        assert!(approve_long_term(&mut r, &p.stranger).unwrap_err().is_authorization());
        assert_eq!(r.status, ReservationStatus::Pending);
    }

    #[test]
    fn short_term_cannot_be_approved() {
        let (mut r, p) = short_stay();
        let err = approve_long_term(&mut r, &p.host).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { status: ReservationStatus::Confirmed, .. }));
    }

    #[test]
    fn proposal_leaves_committed_fields_untouched() {
        let (mut r, p) = short_stay();
        let before = (r.range, r.price);
        propose_extend(&mut r, &p.guest, day(2024, 3, 9), Some("longer".into()), |_, _| Ok(500))
            .unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!((r.range, r.price), before);
        assert_eq!(
            r.pending_change.as_ref().map(|s| s.change),
            Some(PendingChange::Extend { new_end: day(2024, 3, 9), extra_price: 500 })
        );
    }

    #[test]
    fn approve_extend_commits_and_reschedules() {
        let (mut r, p) = short_stay();
        propose_extend(&mut r, &p.guest, day(2024, 3, 9), None, |_, _| Ok(500)).unwrap();
        let effects = approve_change(&mut r, &p.host).unwrap();
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert_eq!(r.range.end, day(2024, 3, 9));
        assert_eq!(r.price.total_price, 800);
        assert_eq!(r.price.base_price, 800);
        assert!(r.pending_change.is_none());
        assert_eq!(effects, vec![Effect::RescheduleCompletion { ends: day(2024, 3, 9) }]);
    }

    #[test]
    fn deny_change_restores_confirmed_state() {
        let (mut r, p) = short_stay();
        let before = r.clone();
        let new_range = DateRange::new(day(2024, 4, 1), day(2024, 4, 5));
        propose_date_change(&mut r, &p.guest, new_range, None, |_, _| Ok(price(400))).unwrap();
        deny_change(&mut r, &p.host).unwrap();
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert_eq!(r.range, before.range);
        assert_eq!(r.price, before.price);
        assert!(r.pending_change.is_none());
    }

    #[test]
    fn date_move_on_long_term_regenerates_contract() {
        let (mut r, p) = long_stay();
        approve_long_term(&mut r, &p.host).unwrap();
        let new_range = DateRange::new(day(2024, 4, 1), day(2024, 7, 1));
        propose_date_change(&mut r, &p.guest, new_range, None, |_, _| Ok(price(2400))).unwrap();
        let effects = approve_change(&mut r, &p.host).unwrap();
        assert_eq!(r.range, new_range);
        assert_eq!(
            effects,
            vec![
                Effect::RescheduleCompletion { ends: day(2024, 7, 1) },
                Effect::RequestContract(ContractKind::DateAmendment),
            ]
        );
    }

    #[test]
    fn failed_check_does_not_stage() {
        let (mut r, p) = short_stay();
        let err = propose_extend(&mut r, &p.guest, day(2024, 3, 9), None, |_, _| {
            Err(EngineError::Conflict(Ulid::nil()))
        })
        .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert!(r.pending_change.is_none());
    }

    #[test]
    fn second_proposal_while_pending_is_rejected() {
        let (mut r, p) = short_stay();
        propose_extend(&mut r, &p.guest, day(2024, 3, 9), None, |_, _| Ok(500)).unwrap();
        let err = propose_extend(&mut r, &p.guest, day(2024, 3, 10), None, |_, _| Ok(600)).unwrap_err();
        assert!(err.is_state());
    }

    #[test]
    fn approve_without_proposal_is_a_state_error() {
        let (mut r, p) = short_stay();
        assert_eq!(
            approve_change(&mut r, &p.host).unwrap_err(),
            EngineError::NothingStaged("approve change")
        );
        assert!(deny_change(&mut r, &p.host).unwrap_err().is_state());
        assert!(deny_unit_count_change(&mut r, &p.host).unwrap_err().is_state());
    }

    #[test]
    fn extend_must_move_end_forward() {
        let (mut r, p) = short_stay();
        let err = propose_extend(&mut r, &p.guest, day(2024, 3, 4), None, |_, _| Ok(0)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn unit_change_round_trip() {
        let (mut r, p) = business_lease(2);
        propose_unit_count_change(&mut r, &p.guest, 4, Some("growing".into()), |_, _| Ok(())).unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(r.occupancy, Occupancy::Units(2));

        let effects = approve_unit_count_change(&mut r, &p.host, |_, units| {
            Ok(price(1000 * 3 * Amount::from(units)))
        })
        .unwrap();
        assert_eq!(r.occupancy, Occupancy::Units(4));
        assert_eq!(r.price.total_price, 12_000);
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert!(effects.contains(&Effect::RequestContract(ContractKind::UnitAmendment)));
    }

    #[test]
    fn unit_change_denied_keeps_units() {
        let (mut r, p) = business_lease(2);
        propose_unit_count_change(&mut r, &p.guest, 1, None, |_, _| Ok(())).unwrap();
        deny_unit_count_change(&mut r, &p.host).unwrap();
        assert_eq!(r.occupancy, Occupancy::Units(2));
        assert!(r.pending_contract_change.is_none());
        assert_eq!(r.status, ReservationStatus::Confirmed);
    }

    #[test]
    fn business_leases_do_not_take_date_changes() {
        let (mut r, p) = business_lease(2);
        let err = propose_extend(&mut r, &p.guest, day(2024, 7, 1), None, |_, _| Ok(0)).unwrap_err();
        assert!(err.is_validation());
        let (mut res, p) = short_stay();
        let err = propose_unit_count_change(&mut res, &p.guest, 2, None, |_, _| Ok(())).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn cancel_long_term_requests_cancellation_contract() {
        let (mut r, p) = long_stay();
        let effects = cancel(&mut r, &p.guest).unwrap();
        assert_eq!(r.status, ReservationStatus::Canceled);
        assert_eq!(
            effects,
            vec![
                Effect::CancelCompletion,
                Effect::RequestContract(ContractKind::Cancellation),
            ]
        );
    }

    #[test]
    fn cancel_is_guest_only() {
        let (mut r, p) = short_stay();
        assert!(cancel(&mut r, &p.host).unwrap_err().is_authorization());
        assert!(cancel(&mut r, &p.stranger).unwrap_err().is_authorization());
    }

    #[test]
    fn deny_by_host_only_for_unconfirmed_long_term() {
        let (mut r, p) = long_stay();
        deny_by_host(&mut r, &p.host).unwrap();
        assert_eq!(r.status, ReservationStatus::Canceled);

        let (mut r, p) = long_stay();
        approve_long_term(&mut r, &p.host).unwrap();
        assert!(deny_by_host(&mut r, &p.host).unwrap_err().is_state());
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let (mut r, p) = short_stay();
        cancel(&mut r, &p.guest).unwrap();
        let snapshot = r.clone();
        assert!(cancel(&mut r, &p.guest).unwrap_err().is_state());
        assert!(approve_change(&mut r, &p.host).unwrap_err().is_state());
        assert!(deny_change(&mut r, &p.host).unwrap_err().is_state());
        assert!(deny_by_host(&mut r, &p.host).unwrap_err().is_state());
        assert!(propose_extend(&mut r, &p.guest, day(2024, 3, 9), None, |_, _| Ok(0))
            .unwrap_err()
            .is_state());
        let late = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        assert!(complete(&mut r, &p.guest, late, Duration::zero()).unwrap_err().is_state());
        assert!(!fire(&mut r, late, Duration::zero()));
        assert_eq!(r, snapshot);
    }

    #[test]
    fn complete_waits_for_end_date() {
        let (mut r, p) = short_stay();
        let before_end = Utc.with_ymd_and_hms(2024, 3, 3, 23, 59, 59).unwrap();
        assert_eq!(
            complete(&mut r, &p.guest, before_end, Duration::zero()).unwrap_err(),
            EngineError::NotYetEnded(day(2024, 3, 4))
        );
        let at_end = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let (outcome, _) = complete(&mut r, &p.host, at_end, Duration::zero()).unwrap();
        assert_eq!(outcome, Completion::Completed);
        let (again, effects) = complete(&mut r, &p.host, at_end, Duration::zero()).unwrap();
        assert_eq!(again, Completion::AlreadyCompleted);
        assert!(effects.is_empty());
    }

    #[test]
    fn pending_reservation_is_not_completable() {
        let (mut r, p) = long_stay();
        let late = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        assert!(complete(&mut r, &p.guest, late, Duration::zero()).unwrap_err().is_state());
        assert!(!fire(&mut r, late, Duration::zero()));
        assert_eq!(r.status, ReservationStatus::Pending);
    }

    #[test]
    fn fire_is_idempotent() {
        let (mut r, _) = short_stay();
        let late = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        assert!(fire(&mut r, late, Duration::zero()));
        let after_first = r.clone();
        assert!(!fire(&mut r, late, Duration::zero()));
        assert_eq!(r, after_first);
    }

    #[test]
    fn grace_delays_completion() {
        let (mut r, _) = short_stay();
        let at_end = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        assert!(!fire(&mut r, at_end, Duration::hours(11)));
        assert!(fire(&mut r, at_end + Duration::hours(11), Duration::hours(11)));
    }
}
