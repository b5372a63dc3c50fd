use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Learned memory footprint for a class of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProfile {
    pub peak_vram_gb: f64,
    pub success_count: u32,
}

/// Lookup table from profile key (e.g. "alice:train") to learned profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProfiles {
    profiles: HashMap<String, TaskProfile>,
}

impl TaskProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&TaskProfile> {
        self.profiles.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, profile: TaskProfile) {
        self.profiles.insert(key.into(), profile);
    }

    /// Seed a profile from a submitter's stated requirement. Existing entries win.
    pub(crate) fn seed(&mut self, key: &str, vram_gb: f64) -> bool {
        if self.profiles.contains_key(key) {
            return false;
        }
        self.profiles.insert(
            key.to_string(),
            TaskProfile {
                peak_vram_gb: vram_gb,
                success_count: 0,
            },
        );
        true
    }

    /// Fold in the observed peak of a successful run.
    pub fn record_success(&mut self, key: &str, observed_peak_gb: f64) {
        let profile = self.profiles.entry(key.to_string()).or_insert(TaskProfile {
            peak_vram_gb: 0.0,
            success_count: 0,
        });
        profile.peak_vram_gb = profile.peak_vram_gb.max(observed_peak_gb);
        profile.success_count += 1;
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_does_not_overwrite() {
        let mut profiles = TaskProfiles::new();
        profiles.insert(
            "a:train",
            TaskProfile {
                peak_vram_gb: 20.0,
                success_count: 3,
            },
        );
        assert!(!profiles.seed("a:train", 4.0));
        assert_eq!(profiles.get("a:train").unwrap().peak_vram_gb, 20.0);

        assert!(profiles.seed("a:eval", 4.0));
        assert_eq!(profiles.get("a:eval").unwrap().success_count, 0);
    }

    #[test]
    fn test_record_success_keeps_peak() {
        let mut profiles = TaskProfiles::new();
        profiles.record_success("b:train", 12.0);
        profiles.record_success("b:train", 9.5);

        let profile = profiles.get("b:train").unwrap();
        assert_eq!(profile.peak_vram_gb, 12.0);
        assert_eq!(profile.success_count, 2);
    }
}
