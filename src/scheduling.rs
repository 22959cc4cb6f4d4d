//! Appointment rules that do not touch the database: date/time parsing,
//! the status state machine, participant resolution and calendar buckets.

use chrono::{Duration, NaiveDate, NaiveTime};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AppointmentStatus, Role};

pub const MAX_RANGE_DAYS: i64 = 366;
pub const MAX_CALENDAR_DAYS: i64 = 14;

/// Strict `YYYY-MM-DD`.
pub fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, ApiError> {
    let s = raw.trim();
    let well_formed = s.len() == 10
        && s.char_indices().all(|(i, c)| match i {
            4 | 7 => c == '-',
            _ => c.is_ascii_digit(),
        });
    if !well_formed {
        return Err(ApiError::validation(format!("{field} must be YYYY-MM-DD")));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::validation(format!("{field} is not a valid date")))
}

/// `HH:MM` or `HH:MM:SS`, 24h.
pub fn parse_time(field: &str, raw: &str) -> Result<NaiveTime, ApiError> {
    let s = raw.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| ApiError::validation(format!("{field} must be HH:MM")))
}

pub fn ensure_time_order(start: NaiveTime, end: NaiveTime) -> Result<(), ApiError> {
    if end <= start {
        return Err(ApiError::validation("hora_fin must be after hora_inicio"));
    }
    Ok(())
}

pub fn required_text(field: &str, raw: Option<&str>) -> Result<String, ApiError> {
    match raw.map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(ApiError::validation(format!("{field} is required"))),
    }
}

/// Inclusive `[start, end]` day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn parse(start: &str, end: &str) -> Result<Self, ApiError> {
        let start = parse_date("fecha_inicio", start)?;
        let end = parse_date("fecha_fin", end)?;
        if end < start {
            return Err(ApiError::validation("fecha_fin must not be before fecha_inicio"));
        }
        if (end - start).num_days() >= MAX_RANGE_DAYS {
            return Err(ApiError::validation(format!(
                "date range must span at most {MAX_RANGE_DAYS} days"
            )));
        }
        Ok(Self { start, end })
    }

    /// `days` consecutive days starting at `start`.
    pub fn calendar(start: NaiveDate, days: i64) -> Result<Self, ApiError> {
        if !(1..=MAX_CALENDAR_DAYS).contains(&days) {
            return Err(ApiError::validation(format!(
                "dias must be between 1 and {MAX_CALENDAR_DAYS}"
            )));
        }
        Ok(Self {
            start,
            end: start + Duration::days(days - 1),
        })
    }

    pub fn contains(&self, d: NaiveDate) -> bool {
        self.start <= d && d <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

/* ============================================================
   Status state machine
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Confirm,
    Complete,
    Cancel,
}

impl StatusAction {
    fn target(self) -> AppointmentStatus {
        match self {
            StatusAction::Confirm => AppointmentStatus::Confirmed,
            StatusAction::Complete => AppointmentStatus::Completed,
            StatusAction::Cancel => AppointmentStatus::Cancelled,
        }
    }

    fn staff_only(self) -> bool {
        !matches!(self, StatusAction::Cancel)
    }
}

pub fn is_terminal(status: AppointmentStatus) -> bool {
    matches!(
        status,
        AppointmentStatus::Completed | AppointmentStatus::Cancelled
    )
}

/// pendiente -> confirmada -> completada, pendiente|confirmada -> cancelada.
pub fn transition(
    current: AppointmentStatus,
    action: StatusAction,
    actor: Role,
) -> Result<AppointmentStatus, ApiError> {
    if action.staff_only() && !actor.is_staff() {
        return Err(ApiError::forbidden(
            "Only clinic staff can confirm or complete appointments",
        ));
    }

    let allowed = matches!(
        (current, action),
        (AppointmentStatus::Pending, StatusAction::Confirm)
            | (AppointmentStatus::Confirmed, StatusAction::Complete)
            | (AppointmentStatus::Pending, StatusAction::Cancel)
            | (AppointmentStatus::Confirmed, StatusAction::Cancel)
    );

    if !allowed {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!("cannot move appointment from {current} to {}", action.target()),
        ));
    }
    Ok(action.target())
}

/// Status change requested through a generic PATCH. Same status is a no-op.
pub fn transition_to(
    current: AppointmentStatus,
    target: AppointmentStatus,
    actor: Role,
) -> Result<AppointmentStatus, ApiError> {
    if current == target {
        return Ok(current);
    }
    let action = match target {
        AppointmentStatus::Confirmed => StatusAction::Confirm,
        AppointmentStatus::Completed => StatusAction::Complete,
        AppointmentStatus::Cancelled => StatusAction::Cancel,
        AppointmentStatus::Pending => {
            return Err(ApiError::Conflict(
                "INVALID_TRANSITION",
                format!("cannot move appointment from {current} back to pendiente"),
            ));
        }
    };
    transition(current, action, actor)
}

/* ============================================================
   Participants
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participants {
    pub paciente_id: Uuid,
    pub doctor_id: Uuid,
    pub auxiliar_id: Option<Uuid>,
}

/// Who the appointment is for depends on who books it: patients book for
/// themselves, doctors for a chosen patient, auxiliaries for a chosen
/// doctor and patient.
pub fn resolve_participants(
    actor_id: Uuid,
    actor_role: Role,
    paciente_id: Option<Uuid>,
    doctor_id: Option<Uuid>,
    auxiliar_id: Option<Uuid>,
) -> Result<Participants, ApiError> {
    let need = |field: &str, v: Option<Uuid>| {
        v.ok_or_else(|| ApiError::validation(format!("{field} is required")))
    };

    match actor_role {
        Role::Patient => {
            if paciente_id.is_some_and(|p| p != actor_id) {
                return Err(ApiError::forbidden(
                    "Patients can only book appointments for themselves",
                ));
            }
            Ok(Participants {
                paciente_id: actor_id,
                doctor_id: need("doctor_id", doctor_id)?,
                auxiliar_id: None,
            })
        }
        Role::Doctor => {
            if doctor_id.is_some_and(|d| d != actor_id) {
                return Err(ApiError::forbidden(
                    "Doctors can only book appointments on their own schedule",
                ));
            }
            Ok(Participants {
                paciente_id: need("paciente_id", paciente_id)?,
                doctor_id: actor_id,
                auxiliar_id,
            })
        }
        Role::Auxiliary => {
            if auxiliar_id.is_some_and(|a| a != actor_id) {
                return Err(ApiError::forbidden(
                    "Auxiliaries can only book appointments they assist",
                ));
            }
            Ok(Participants {
                paciente_id: need("paciente_id", paciente_id)?,
                doctor_id: need("doctor_id", doctor_id)?,
                auxiliar_id: Some(actor_id),
            })
        }
        Role::Admin => Ok(Participants {
            paciente_id: need("paciente_id", paciente_id)?,
            doctor_id: need("doctor_id", doctor_id)?,
            auxiliar_id,
        }),
    }
}

/// Half-open interval overlap on the same day.
pub fn overlaps(a: (NaiveTime, NaiveTime), b: (NaiveTime, NaiveTime)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/* ============================================================
   Calendar buckets
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct CalendarDay<T> {
    pub fecha: NaiveDate,
    pub citas: Vec<T>,
}

/// One bucket per day in `range`, empty days included. Items outside the
/// range are dropped; order within a day is preserved.
pub fn build_calendar<T>(
    range: DateRange,
    items: Vec<T>,
    date_of: impl Fn(&T) -> NaiveDate,
) -> Vec<CalendarDay<T>> {
    let mut days: Vec<CalendarDay<T>> = range
        .days()
        .map(|fecha| CalendarDay {
            fecha,
            citas: Vec::new(),
        })
        .collect();

    for item in items {
        let d = date_of(&item);
        if !range.contains(d) {
            continue;
        }
        let idx = (d - range.start).num_days() as usize;
        days[idx].citas.push(item);
    }
    days
}
