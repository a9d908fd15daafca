use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a Plan, assigned by the remote store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanId(u64);

impl PlanId {
    /// Creates a new `PlanId`
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying u64 value
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Identifier of the user owning a plan.
///
/// Opaque to this crate; authentication hands it over as a string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Position of a session inside a plan: day index and session index, both 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionRef {
    pub plan_id: PlanId,
    pub day_index: usize,
    pub session_index: usize,
}

impl SessionRef {
    #[must_use]
    pub fn new(plan_id: PlanId, day_index: usize, session_index: usize) -> Self {
        Self {
            plan_id,
            day_index,
            session_index,
        }
    }
}

impl fmt::Debug for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlanId({})", self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

// ─── Display Implementations ───────────────────────────────────────────────────

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plan {} day {} session {}",
            self.plan_id, self.day_index, self.session_index
        )
    }
}

// ─── FromStr Implementations ───────────────────────────────────────────────────

/// Error type for parsing ID from string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    kind: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {} from string", self.kind)
    }
}

impl std::error::Error for ParseIdError {}

impl FromStr for PlanId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(PlanId::new)
            .map_err(|_| ParseIdError {
                kind: "PlanId".to_string(),
            })
    }
}

impl FromStr for UserId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.contains(':') {
            return Err(ParseIdError {
                kind: "UserId".to_string(),
            });
        }
        Ok(UserId::new(trimmed))
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_id_display() {
        let id = PlanId::new(42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_plan_id_from_str() {
        let id: PlanId = "123".parse().unwrap();
        assert_eq!(id, PlanId::new(123));
    }

    #[test]
    fn test_plan_id_from_str_invalid() {
        let result = "not-a-number".parse::<PlanId>();
        assert!(result.is_err());
    }

    #[test]
    fn test_user_id_rejects_separator() {
        assert!("alice".parse::<UserId>().is_ok());
        assert!("ali:ce".parse::<UserId>().is_err());
        assert!("  ".parse::<UserId>().is_err());
    }

    #[test]
    fn test_session_ref_display() {
        let at = SessionRef::new(PlanId::new(7), 1, 2);
        assert_eq!(at.to_string(), "plan 7 day 1 session 2");
    }
}
