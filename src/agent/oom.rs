use crate::core::round2;
use crate::core::scheduler::OOM_MARGIN_GB;
use crate::core::task::OomSignal;
use regex::Regex;
use std::sync::LazyLock;

/// Only this many trailing stderr lines are scanned.
pub const STDERR_TAIL_LINES: usize = 100;

static OOM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)CUDA out of memory.*?Tried to allocate\s+([0-9]+(?:\.[0-9]+)?)\s*([a-z]+)")
        .expect("OOM pattern is a valid regex")
});

/// Convert an allocation size reported by the CUDA allocator to GB.
///
/// Units are matched by prefix: `MiB`/`MB` style units are mebibytes,
/// `KiB` kibibytes; anything else is taken as gigabytes.
pub fn to_gb(amount: f64, unit: &str) -> f64 {
    let unit = unit.to_ascii_lowercase();
    if unit.starts_with("mi") {
        amount / 1024.0
    } else if unit.starts_with("ki") {
        amount / (1024.0 * 1024.0)
    } else {
        amount
    }
}

/// Scan the stderr tail, newest line first, for a CUDA out-of-memory diagnostic.
///
/// The returned signal carries task id 0; the caller fills it in.
pub fn parse_oom<S: AsRef<str>>(stderr_lines: &[S], current_used_gb: f64) -> Option<OomSignal> {
    let pattern = &*OOM_PATTERN;

    stderr_lines
        .iter()
        .rev()
        .take(STDERR_TAIL_LINES)
        .find_map(|line| {
            let caps = pattern.captures(line.as_ref())?;
            let amount = caps[1].parse::<f64>().ok()?;
            let missing_gb = to_gb(amount, &caps[2]);
            Some(OomSignal {
                task_id: 0,
                missing_gb: round2(missing_gb),
                new_min_vram_gb: round2(current_used_gb + missing_gb + OOM_MARGIN_GB),
            })
        })
}
