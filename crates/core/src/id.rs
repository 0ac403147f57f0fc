//! Job identifiers.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

const PREFIX: &str = "job_";

/// Externally stable identifier of a job, rendered as `job_<ULID>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(Ulid);

impl JobId {
    /// Generate a new JobId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = ulid::DecodeError;

    /// Accepts both `job_<ULID>` and the bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Ok(Self(raw.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_parse() {
        let id = JobId::new();
        let rendered = id.to_string();
        assert!(rendered.starts_with("job_"));
        assert_eq!(rendered.parse::<JobId>().unwrap(), id);
    }

    #[test]
    fn parse_accepts_bare_ulid() {
        let ulid = Ulid::new();
        let id: JobId = ulid.to_string().parse().unwrap();
        assert_eq!(id, JobId(ulid));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("job_not-a-ulid".parse::<JobId>().is_err());
    }
}
