//! Error taxonomy shared by the scheduler and the test phases.

/// Broad classification of a failure, used to decide how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, enum_map::Enum, serde::Serialize)]
pub enum ErrorKind {
    /// Peer sent a malformed, oversized or unexpected message
    ProtocolViolation,
    /// A bounded wait expired
    Timeout,
    /// Queue full or a worker could not be spawned
    ResourceExhaustion,
    /// Peer closed or reset the connection
    PeerFault,
    /// A listener could not be bound
    ConfigurationFault,
    /// Scheduler bookkeeping became inconsistent
    InternalInvariantViolation,
}

impl ErrorKind {
    /// Whether a failure of this kind inside one test should end the whole session.
    pub fn is_fatal_for_session(self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigurationFault | ErrorKind::InternalInvariantViolation
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ProtocolViolation => "protocol violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhaustion => "resource exhaustion",
            ErrorKind::PeerFault => "peer fault",
            ErrorKind::ConfigurationFault => "configuration fault",
            ErrorKind::InternalInvariantViolation => "internal invariant violation",
        };
        write!(f, "{name}")
    }
}

/// Exit status of a session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, enum_map::Enum, serde::Serialize)]
pub enum ExitCode {
    Success,
    ListenerCreation,
    AcceptTimeout,
    AcceptError,
    ProtocolViolation,
    PeerFault,
    LifetimeExceeded,
    Evicted,
    HeartbeatFailed,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::ListenerCreation => 1,
            ExitCode::AcceptTimeout => 2,
            ExitCode::AcceptError => 3,
            ExitCode::ProtocolViolation => 4,
            ExitCode::PeerFault => 5,
            ExitCode::LifetimeExceeded => 6,
            ExitCode::Evicted => 7,
            ExitCode::HeartbeatFailed => 8,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Where in a test pipeline a failure happened; picks the worker exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FailurePoint {
    Listen,
    AcceptTimeout,
    Accept,
    /// On a data connection once it is established
    Exchange,
    /// On the control connection
    Control,
}

/// A failure with its classification attached.
///
/// The source keeps the full context chain; the kind and failure point drive recovery.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct SessionError {
    #[source]
    pub source: anyhow::Error,
    pub kind: ErrorKind,
    pub point: FailurePoint,
    /// The connection can no longer be read after this failure
    pub stream_lost: bool,
}

impl SessionError {
    pub fn new(source: anyhow::Error, kind: ErrorKind, point: FailurePoint) -> Self {
        Self {
            source,
            kind,
            point,
            stream_lost: false,
        }
    }

    pub fn with_stream_lost(mut self) -> Self {
        self.stream_lost = true;
        self
    }

    pub fn listen(source: anyhow::Error) -> Self {
        Self::new(source, ErrorKind::ConfigurationFault, FailurePoint::Listen)
    }

    pub fn exchange(source: anyhow::Error, kind: ErrorKind) -> Self {
        Self::new(source, kind, FailurePoint::Exchange)
    }

    pub fn control(source: anyhow::Error, kind: ErrorKind) -> Self {
        Self::new(source, kind, FailurePoint::Control)
    }

    /// Whether the whole session has to stop, not just the test that failed.
    ///
    /// Losing the control connection leaves nobody to report to.
    pub fn ends_session(&self) -> bool {
        self.kind.is_fatal_for_session()
            || (self.point == FailurePoint::Control
                && (self.kind == ErrorKind::PeerFault || self.stream_lost))
    }

    pub fn exit_code(&self) -> ExitCode {
        match (self.point, self.kind) {
            (FailurePoint::Listen, _) => ExitCode::ListenerCreation,
            (FailurePoint::AcceptTimeout, _) => ExitCode::AcceptTimeout,
            (FailurePoint::Accept, _) => ExitCode::AcceptError,
            (FailurePoint::Exchange | FailurePoint::Control, ErrorKind::PeerFault) => {
                ExitCode::PeerFault
            }
            (FailurePoint::Exchange | FailurePoint::Control, ErrorKind::Timeout) => {
                ExitCode::LifetimeExceeded
            }
            (FailurePoint::Exchange | FailurePoint::Control, _) => ExitCode::ProtocolViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes: std::collections::HashSet<i32> = [
            ExitCode::Success,
            ExitCode::ListenerCreation,
            ExitCode::AcceptTimeout,
            ExitCode::AcceptError,
            ExitCode::ProtocolViolation,
            ExitCode::PeerFault,
            ExitCode::LifetimeExceeded,
            ExitCode::Evicted,
            ExitCode::HeartbeatFailed,
        ]
        .iter()
        .map(|c| c.code())
        .collect();
        assert_eq!(codes.len(), 9);
        assert_eq!(ExitCode::Success.code(), 0);
    }

    #[test]
    fn failure_point_selects_exit_code() {
        let err = SessionError::listen(anyhow::anyhow!("address in use"));
        assert_eq!(err.exit_code(), ExitCode::ListenerCreation);
        assert!(err.kind.is_fatal_for_session());
        let err = SessionError::new(
            anyhow::anyhow!("no connection"),
            ErrorKind::Timeout,
            FailurePoint::AcceptTimeout,
        );
        assert_eq!(err.exit_code(), ExitCode::AcceptTimeout);
        assert!(!err.kind.is_fatal_for_session());
        let err = SessionError::exchange(anyhow::anyhow!("bad type"), ErrorKind::ProtocolViolation);
        assert_eq!(err.exit_code(), ExitCode::ProtocolViolation);
        assert_eq!(format!("{err}"), "bad type");
        assert!(!err.ends_session());
    }

    #[test]
    fn losing_control_ends_the_session() {
        let data = SessionError::exchange(anyhow::anyhow!("reset"), ErrorKind::PeerFault);
        assert!(!data.ends_session());
        let control = SessionError::control(anyhow::anyhow!("reset"), ErrorKind::PeerFault);
        assert!(control.ends_session());
        assert_eq!(control.exit_code(), ExitCode::PeerFault);
        let slow = SessionError::control(anyhow::anyhow!("no reply"), ErrorKind::Timeout);
        assert!(!slow.ends_session());
        assert!(SessionError::listen(anyhow::anyhow!("in use")).ends_session());
        let unreadable =
            SessionError::control(anyhow::anyhow!("oversized"), ErrorKind::ProtocolViolation)
                .with_stream_lost();
        assert!(unreadable.ends_session());
        assert_eq!(unreadable.exit_code(), ExitCode::ProtocolViolation);
        let data =
            SessionError::exchange(anyhow::anyhow!("oversized"), ErrorKind::ProtocolViolation)
                .with_stream_lost();
        assert!(!data.ends_session());
    }
}
