//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on steps followed by one `run` call.
    pub max_cascade: usize,
    /// Type-check process bodies when they are declared.
    pub check_declarations: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cascade: 1024,
            check_declarations: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_cascade": 8}"#).unwrap();
        assert_eq!(config.max_cascade, 8);
        assert!(config.check_declarations);
    }
}
