//! Due-date expressions for `create_work_item` steps.
//!
//! Accepted forms: `YYYY-MM-DD`, an RFC 3339 timestamp, `today`,
//! `tomorrow`, and `+N days` / `-N days` / `+N weeks` (singular units too).
//! Relative forms are anchored to the execution date passed in.

use chrono::{DateTime, Duration, NaiveDate};

use super::template::ResolutionError;

/// True for the forms anchored to the execution date: `today`, `tomorrow`
/// and `+N days` / `-N weeks`. Absolute dates and timestamps are not.
pub fn is_relative_date(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("today") || trimmed.eq_ignore_ascii_case("tomorrow") {
        return true;
    }
    let Some(rest) = trimmed.strip_prefix('+').or_else(|| trimmed.strip_prefix('-')) else {
        return false;
    };
    let Some((amount, unit)) = rest.trim().split_once(char::is_whitespace) else {
        return false;
    };
    !amount.is_empty()
        && amount.bytes().all(|b| b.is_ascii_digit())
        && matches!(
            unit.trim().to_ascii_lowercase().as_str(),
            "day" | "days" | "week" | "weeks"
        )
}

pub fn resolve_date(input: &str, today: NaiveDate) -> Result<NaiveDate, ResolutionError> {
    let trimmed = input.trim();
    let invalid = || ResolutionError::InvalidDate(trimmed.to_string());

    match trimmed.to_ascii_lowercase().as_str() {
        "today" => return Ok(today),
        "tomorrow" => return Ok(today + Duration::days(1)),
        _ => {}
    }

    if let Some(sign) = trimmed.chars().next().filter(|c| *c == '+' || *c == '-') {
        let rest = trimmed[1..].trim();
        let (amount, unit) = rest.split_once(char::is_whitespace).ok_or_else(invalid)?;
        let amount: i64 = amount.parse().map_err(|_| invalid())?;
        let days = match unit.trim().to_ascii_lowercase().as_str() {
            "day" | "days" => amount,
            "week" | "weeks" => amount.checked_mul(7).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        let offset = Duration::try_days(if sign == '-' { -days } else { days }).ok_or_else(invalid)?;
        return today.checked_add_signed(offset).ok_or_else(invalid);
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.date_naive())
        .map_err(|_| invalid())
}
