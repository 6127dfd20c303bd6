use std::fmt;

/// Machine-readable error codes for log scraping and CI annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    TimeUnavailable,
    TimestampFormat,
    StatusReadFailed,
    StatusWriteFailed,
    SnapshotReadFailed,
    ProcessSpawnFailed,
    ProcessFailed,
    ProcessTimedOut,
    UnexpectedSolverOutput,
    DownloadFailed,
    GitCommandFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::TimeUnavailable => "E1101",
            Self::TimestampFormat => "E1102",
            Self::StatusReadFailed => "E2001",
            Self::StatusWriteFailed => "E2002",
            Self::SnapshotReadFailed => "E2003",
            Self::ProcessSpawnFailed => "E3001",
            Self::ProcessFailed => "E3002",
            Self::ProcessTimedOut => "E3003",
            Self::UnexpectedSolverOutput => "E4001",
            Self::DownloadFailed => "E5001",
            Self::GitCommandFailed => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::TimeUnavailable => "No time server answered",
            Self::TimestampFormat => "Malformed timestamp",
            Self::StatusReadFailed => "Status document read failed",
            Self::StatusWriteFailed => "Status document write failed",
            Self::SnapshotReadFailed => "Download snapshot read failed",
            Self::ProcessSpawnFailed => "Subprocess could not be started",
            Self::ProcessFailed => "Subprocess exited with an error",
            Self::ProcessTimedOut => "Subprocess timed out",
            Self::UnexpectedSolverOutput => "Unexpected solver output shape",
            Self::DownloadFailed => "Package download failed",
            Self::GitCommandFailed => "git command failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in chantest.toml and retry."),
            Self::TimeUnavailable => {
                Some("Check outbound UDP/123 access or configure [time].servers.")
            }
            Self::TimestampFormat => Some("Timestamps must look like 2024-01-31T12:00:00+00:00."),
            Self::StatusReadFailed | Self::SnapshotReadFailed => {
                Some("Check that the directory exists and is readable.")
            }
            Self::StatusWriteFailed => Some("Check disk space and write permissions."),
            Self::ProcessSpawnFailed => Some("Make sure the configured program is on PATH."),
            Self::ProcessFailed | Self::ProcessTimedOut | Self::DownloadFailed => None,
            Self::UnexpectedSolverOutput => {
                Some("The solver version likely changed its --json layout; pin or update it.")
            }
            Self::GitCommandFailed => Some("Check network access to the stats repository."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
