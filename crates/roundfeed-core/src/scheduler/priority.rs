//! Request priorities.

use serde::{Deserialize, Serialize};

/// Priority of a scheduled call. Declaration order is lowest to highest, so
/// `Priority::Critical > Priority::Background`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Non-essential work.
    Background,
    /// Bulk or analytics reads.
    Low,
    /// Regular reads such as polling fetches.
    Medium,
    /// User-facing writes.
    High,
    /// Must go out as soon as possible.
    Critical,
}

impl Priority {
    /// Whether this priority may use the burst allowance.
    #[must_use]
    pub const fn can_burst(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Background => "background",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::Background);
    }

    #[test]
    fn test_burst_eligibility() {
        assert!(Priority::Critical.can_burst());
        assert!(Priority::High.can_burst());
        assert!(!Priority::Medium.can_burst());
        assert!(!Priority::Background.can_burst());
    }
}
