//! 5-field cron evaluator (min hour dom month dow), evaluated in UTC.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // Handle */N (every N)
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    // Handle comma-separated values
    for part in field.split(',') {
        // Handle range N-M
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

fn field_is_valid(field: &str, min: u32, max: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return matches!(step.parse::<u32>(), Ok(n) if n > 0);
    }
    field.split(',').all(|part| {
        if let Some((start_s, end_s)) = part.split_once('-') {
            matches!(
                (start_s.parse::<u32>(), end_s.parse::<u32>()),
                (Ok(start), Ok(end)) if start <= end && start >= min && end <= max
            )
        } else {
            matches!(part.parse::<u32>(), Ok(n) if n >= min && n <= max)
        }
    })
}

/// Check if a UTC datetime matches a 5-field cron expression.
pub fn cron_matches(cron: &str, dt: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Structural validation, applied at agent upsert.
pub fn validate_cron(cron: &str) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_is_valid(fields[0], 0, 59)
        && field_is_valid(fields[1], 0, 23)
        && field_is_valid(fields[2], 1, 31)
        && field_is_valid(fields[3], 1, 12)
        && field_is_valid(fields[4], 0, 6)
}
