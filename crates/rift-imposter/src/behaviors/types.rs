//! Configuration types for response behaviors.

use super::wait::WaitBehavior;
use serde::{Deserialize, Serialize};

/// `_behaviors` block attached to a single response.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBehaviors {
    /// Add latency before response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitBehavior>,

    /// Repeat response N times before advancing to next
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
}

impl ResponseBehaviors {
    pub fn is_empty(&self) -> bool {
        self.wait.is_none() && self.repeat.is_none()
    }

    /// Reject values that would make the behavior meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.repeat == Some(0) {
            return Err("repeat behavior must be greater than 0".to_string());
        }
        if let Some(WaitBehavior::Range { min_ms, max_ms }) = self.wait {
            if min_ms > max_ms {
                return Err(format!(
                    "wait behavior range is empty: min {min_ms} is greater than max {max_ms}"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behaviors_deserialize() {
        let behaviors: ResponseBehaviors =
            serde_json::from_str(r#"{"wait": 250, "repeat": 3}"#).unwrap();
        assert_eq!(behaviors.wait, Some(WaitBehavior::Fixed(250)));
        assert_eq!(behaviors.repeat, Some(3));
        assert!(behaviors.validate().is_ok());
    }

    #[test]
    fn test_zero_repeat_rejected() {
        let behaviors = ResponseBehaviors {
            wait: None,
            repeat: Some(0),
        };
        assert!(behaviors.validate().is_err());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let behaviors: ResponseBehaviors =
            serde_json::from_str(r#"{"wait": {"min": 200, "max": 100}}"#).unwrap();
        assert!(behaviors.validate().is_err());
    }
}
