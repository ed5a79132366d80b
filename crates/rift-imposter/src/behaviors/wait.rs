//! Wait behavior - add latency before response.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WaitBehavior {
    /// Fixed delay in milliseconds
    Fixed(u64),
    /// Random delay within range
    Range {
        #[serde(rename = "min")]
        min_ms: u64,
        #[serde(rename = "max")]
        max_ms: u64,
    },
}

impl WaitBehavior {
    /// Get the wait duration in milliseconds
    pub fn get_duration_ms(&self) -> u64 {
        match *self {
            WaitBehavior::Fixed(ms) => ms,
            WaitBehavior::Range { min_ms, max_ms } if min_ms < max_ms => {
                use rand::Rng;
                rand::thread_rng().gen_range(min_ms..=max_ms)
            }
            WaitBehavior::Range { min_ms, .. } => min_ms,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.get_duration_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_behavior_fixed() {
        let wait = WaitBehavior::Fixed(100);
        assert_eq!(wait.get_duration_ms(), 100);
    }

    #[test]
    fn test_wait_behavior_range() {
        let wait = WaitBehavior::Range {
            min_ms: 100,
            max_ms: 200,
        };
        for _ in 0..10 {
            let duration = wait.get_duration_ms();
            assert!((100..=200).contains(&duration));
        }
    }

    #[test]
    fn test_wait_behavior_serde() {
        let wait: WaitBehavior = serde_yaml::from_str("100").unwrap();
        assert_eq!(wait, WaitBehavior::Fixed(100));

        let wait: WaitBehavior = serde_yaml::from_str("min: 100\nmax: 200").unwrap();
        assert_eq!(
            wait,
            WaitBehavior::Range {
                min_ms: 100,
                max_ms: 200
            }
        );
    }
}
