use std::fmt;

/// Machine-readable error codes for operator tooling and log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    IncidentNotFound,
    InvalidStatus,
    EmptyTransitionTarget,
    InvalidPageRequest,
    InvalidEnumValue,
    StoreReadFailed,
    StoreWriteFailed,
    RelationLookupFailed,
    FeedUnavailable,
    CorruptStore,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::IncidentNotFound => "E2001",
            Self::InvalidStatus => "E2002",
            Self::EmptyTransitionTarget => "E2003",
            Self::InvalidPageRequest => "E2004",
            Self::InvalidEnumValue => "E2005",
            Self::StoreReadFailed => "E3001",
            Self::StoreWriteFailed => "E3002",
            Self::RelationLookupFailed => "E3003",
            Self::CorruptStore => "E3004",
            Self::FeedUnavailable => "E4001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Command desk not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::IncidentNotFound => "Incident not found",
            Self::InvalidStatus => "Unknown incident status",
            Self::EmptyTransitionTarget => "Transition target is empty",
            Self::InvalidPageRequest => "Invalid page request",
            Self::InvalidEnumValue => "Invalid severity/scope value",
            Self::StoreReadFailed => "Backing store read failed",
            Self::StoreWriteFailed => "Backing store write failed",
            Self::RelationLookupFailed => "Officer lookup failed",
            Self::CorruptStore => "Corrupt SQLite store",
            Self::FeedUnavailable => "Change feed unavailable",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to the command desk.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `sitrep init` to create the local store."),
            Self::ConfigParseError => Some("Fix syntax in .sitrep/config.toml and retry."),
            Self::IncidentNotFound => None,
            Self::InvalidStatus => {
                Some("Use one of: pending, dispatched, on_site, resolved, completed.")
            }
            Self::EmptyTransitionTarget => Some("Pass the status the incident should move to."),
            Self::InvalidPageRequest => Some("Pages start at 1 and page size must be positive."),
            Self::InvalidEnumValue => {
                Some("Use one of the documented severity (all/critical/high/moderate/low) values.")
            }
            Self::StoreReadFailed => Some("The view shows an empty page until the store recovers."),
            Self::StoreWriteFailed => Some("The view was re-synchronized; retry the transition."),
            Self::RelationLookupFailed => Some("The reporter is shown as a placeholder officer."),
            Self::CorruptStore => Some("Restore .sitrep/sitrep.db from backup or re-run init."),
            Self::FeedUnavailable => Some("Data may be stale; reconnect the view."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
