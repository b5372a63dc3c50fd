use crate::core::error::LabGpuError;
use chrono::NaiveTime;

/// Parse a memory requirement into gigabytes.
///
/// Supported formats:
/// - `"10G"` or `"10g"`: gigabytes
/// - `"10"`: gigabytes (default unit)
/// - `"1.5G"`: fractional values are allowed
///
/// # Examples
///
/// ```
/// use labgpu::utils::parsers::parse_memory_gb;
///
/// assert_eq!(parse_memory_gb("10G").unwrap(), 10.0);
/// assert_eq!(parse_memory_gb("10g").unwrap(), 10.0);
/// assert_eq!(parse_memory_gb("1.5G").unwrap(), 1.5);
/// ```
pub fn parse_memory_gb(memory_str: &str) -> Result<f64, LabGpuError> {
    let trimmed = memory_str.trim();
    let number = trimmed.trim_end_matches(['G', 'g']).trim();

    if number.is_empty() {
        return Err(LabGpuError::InvalidMemory(memory_str.to_string()));
    }

    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(LabGpuError::InvalidMemory(memory_str.to_string())),
    }
}

/// Parse a wall-clock boundary of the night window.
///
/// Supported formats:
/// - `"HH:MM"`: hours and minutes
/// - `"HH"`: whole hour
///
/// # Examples
///
/// ```
/// use chrono::NaiveTime;
/// use labgpu::utils::parsers::parse_clock_time;
///
/// assert_eq!(parse_clock_time("08:30").unwrap(), NaiveTime::from_hms_opt(8, 30, 0).unwrap());
/// assert_eq!(parse_clock_time("23").unwrap(), NaiveTime::from_hms_opt(23, 0, 0).unwrap());
/// ```
pub fn parse_clock_time(time_str: &str) -> Result<NaiveTime, LabGpuError> {
    let invalid = || LabGpuError::InvalidClockTime(time_str.to_string());
    let mut parts = time_str.trim().split(':');

    let hour = parts
        .next()
        .and_then(|h| h.trim().parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let minute = match parts.next() {
        Some(m) => m.trim().parse::<u32>().map_err(|_| invalid())?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(invalid());
    }

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}
