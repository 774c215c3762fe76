use chrono::{Datelike, Months};

use crate::error::EngineError;
use crate::limits::*;
use crate::model::*;

/// Days a long-term stay may run past its last whole month before another
/// month is charged.
pub const GRACE_DAYS: i64 = 5;

/// Calendar months between the range bounds, rounded up by one when the
/// leftover days exceed [`GRACE_DAYS`].
pub fn smart_months(range: &DateRange) -> u32 {
    let (start, end) = (range.start, range.end);
    let mut whole = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    if end.day() < start.day() {
        whole -= 1;
    }
    let whole = whole.max(0) as u32;
    // Adding months clamps to the end of short months, so the anchor never passes `end`.
    let remainder = start
        .checked_add_months(Months::new(whole))
        .map_or(0, |anchor| (end - anchor).num_days());
    if remainder > GRACE_DAYS { whole + 1 } else { whole }
}

/// Stay length in the unit the rate is charged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StayLength {
    Nights(u32),
    Months(u32),
}

impl StayLength {
    pub fn of(rate: &Rate, range: &DateRange) -> Self {
        match rate {
            Rate::Nightly(_) => StayLength::Nights(range.nights().max(0) as u32),
            Rate::Monthly(_) => StayLength::Months(smart_months(range)),
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            StayLength::Nights(n) | StayLength::Months(n) => *n,
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            StayLength::Nights(_) => "nights",
            StayLength::Months(_) => "months",
        }
    }
}

impl std::fmt::Display for StayLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.count(), self.unit())
    }
}

pub fn check_stay_length(estate: &Estate, stay: StayLength) -> Result<(), EngineError> {
    let n = stay.count();
    if n == 0 {
        return Err(EngineError::Validation(
            "stay is shorter than one billable month".into(),
        ));
    }
    if n < estate.min_stay {
        return Err(EngineError::Validation(format!(
            "stay of {stay} is below the minimum of {} {}",
            estate.min_stay,
            stay.unit()
        )));
    }
    if let Some(max) = estate.max_stay
        && n > max
    {
        return Err(EngineError::Validation(format!(
            "stay of {stay} exceeds the maximum of {max} {}",
            stay.unit()
        )));
    }
    Ok(())
}

/// Line items that depend on who is staying, plus the unit multiplier for business leases.
struct OccupancyCharges {
    extra_people_fee: Option<Amount>,
    children_discount: Option<Amount>,
    units: Amount,
}

fn occupancy_charges(estate: &Estate, occupancy: &Occupancy) -> Result<OccupancyCharges, EngineError> {
    match (estate.business_units, occupancy) {
        (Some(available), Occupancy::Units(units)) => {
            check_unit_count(available, *units)?;
            Ok(OccupancyCharges {
                extra_people_fee: None,
                children_discount: None,
                units: Amount::from(*units),
            })
        }
        (None, Occupancy::Guests { guests, children }) => {
            if *guests == 0 {
                return Err(EngineError::Validation("at least one guest is required".into()));
            }
            let people = guests + children;
            if people > MAX_GUESTS {
                return Err(EngineError::LimitExceeded("too many guests"));
            }
            let capacity = estate.guests_included + estate.extra_people_allowance;
            if people > capacity {
                return Err(EngineError::Validation(format!(
                    "{people} people exceed the estate capacity of {capacity}"
                )));
            }
            let extra = people.saturating_sub(estate.guests_included);
            let extra_people_fee = if extra > 0 {
                let fee = Amount::from(extra)
                    .checked_mul(estate.extra_guest_fee)
                    .ok_or(EngineError::LimitExceeded("price overflow"))?;
                Some(fee)
            } else {
                None
            };
            // Flat, once per reservation, regardless of how many children.
            let children_discount = (*children > 0).then_some(estate.children_discount);
            Ok(OccupancyCharges {
                extra_people_fee,
                children_discount,
                units: 1,
            })
        }
        (Some(_), Occupancy::Guests { .. }) => Err(EngineError::Validation(
            "business estates are leased by unit count".into(),
        )),
        (None, Occupancy::Units(_)) => Err(EngineError::Validation(
            "unit counts only apply to business estates".into(),
        )),
    }
}

pub fn check_unit_count(available: u32, requested: u32) -> Result<(), EngineError> {
    if requested == 0 {
        return Err(EngineError::Validation("at least one unit is required".into()));
    }
    if requested > available {
        return Err(EngineError::Validation(format!(
            "{requested} units requested but only {available} available"
        )));
    }
    Ok(())
}

/// Price a stay from scratch. `rate` is passed separately from the estate so
/// that reservations are repriced at the rate they were booked at.
pub fn quote(
    estate: &Estate,
    rate: &Rate,
    range: &DateRange,
    occupancy: &Occupancy,
) -> Result<PriceBreakdown, EngineError> {
    let stay = StayLength::of(rate, range);
    check_stay_length(estate, stay)?;
    let charges = occupancy_charges(estate, occupancy)?;

    let base_price = Amount::from(stay.count())
        .checked_mul(rate.amount())
        .and_then(|p| p.checked_mul(charges.units))
        .ok_or(EngineError::LimitExceeded("price overflow"))?;
    let total_price = base_price
        .checked_add(charges.extra_people_fee.unwrap_or(0))
        .and_then(|p| p.checked_sub(charges.children_discount.unwrap_or(0)))
        .ok_or(EngineError::LimitExceeded("price overflow"))?
        .max(0);

    Ok(PriceBreakdown {
        base_price,
        extra_people_fee: charges.extra_people_fee,
        children_discount: charges.children_discount,
        total_price,
    })
}

/// Extra charge for pushing a reservation's end out to `new_end`. Only the
/// added nights or months are charged, at the booked rate; guest fees are not
/// re-evaluated.
pub fn extension_price(reservation: &Reservation, new_end: Day) -> Result<Amount, EngineError> {
    let current = reservation.range;
    let extended = DateRange::try_new(current.start, new_end)?;
    let added = match reservation.rate {
        Rate::Nightly(_) => extended.nights() - current.nights(),
        Rate::Monthly(_) => i64::from(smart_months(&extended)) - i64::from(smart_months(&current)),
    };
    let units = Amount::from(reservation.occupancy.unit_count().unwrap_or(1));
    added
        .max(0)
        .checked_mul(reservation.rate.amount())
        .and_then(|p| p.checked_mul(units))
        .ok_or(EngineError::LimitExceeded("price overflow"))
}

/// Sanity-check estate details before they are accepted from the listing side.
pub fn validate_terms(estate: &Estate) -> Result<(), EngineError> {
    let rate = estate.rate.amount();
    if rate <= 0 {
        return Err(EngineError::Validation("rate must be positive".into()));
    }
    if rate > MAX_RATE {
        return Err(EngineError::LimitExceeded("rate too large"));
    }
    if estate.extra_guest_fee < 0 || estate.children_discount < 0 {
        return Err(EngineError::Validation("fees and discounts cannot be negative".into()));
    }
    if estate.extra_guest_fee > MAX_RATE || estate.children_discount > MAX_RATE {
        return Err(EngineError::LimitExceeded("fee too large"));
    }
    if estate.guests_included == 0 {
        return Err(EngineError::Validation("an estate must include at least one guest".into()));
    }
    if estate.guests_included + estate.extra_people_allowance > MAX_GUESTS {
        return Err(EngineError::LimitExceeded("too many guests"));
    }
    if let Some(max) = estate.max_stay
        && max < estate.min_stay
    {
        return Err(EngineError::Validation("maximum stay is below minimum stay".into()));
    }
    if let Some(units) = estate.business_units {
        if !matches!(estate.rate, Rate::Monthly(_)) {
            return Err(EngineError::Validation("business estates must be priced monthly".into()));
        }
        if units == 0 {
            return Err(EngineError::Validation("a business estate needs at least one unit".into()));
        }
        if units > MAX_UNITS {
            return Err(EngineError::LimitExceeded("too many units"));
        }
    }
    Ok(())
}
