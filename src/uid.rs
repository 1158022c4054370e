use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a scene surface.
///
/// Patch ids are dense and only valid for one registry pass; surfaces keep
/// their `UID` across passes, so results are published against it.
#[derive(Eq, PartialEq, Hash, Debug, Clone, Serialize, Deserialize)]
pub struct UID(String);

impl From<&str> for UID {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UID {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Default for UID {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl UID {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uids_are_unique() {
        let a = UID::new();
        let b = UID::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_str_roundtrip() {
        let uid = UID::from("floor");
        assert_eq!(uid.as_str(), "floor");
        assert_eq!(uid.to_string(), "floor");
    }
}
