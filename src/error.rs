// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Error codes returned by the coordinator, and errors surfaced to the application.
use std::fmt;
use thiserror::Error;

/// An error code carried by a heartbeat response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The heartbeat succeeded.
    None,
    /// The coordinator is still loading group state.
    CoordinatorLoadInProgress,
    /// The coordinator is not available.
    CoordinatorNotAvailable,
    /// The receiving broker is not the coordinator of the group.
    NotCoordinator,
    /// The member id is not known to the coordinator.
    UnknownMemberId,
    /// The member is not authorized to read one of its topics.
    TopicAuthorizationFailed,
    /// The member is not authorized to access the group.
    GroupAuthorizationFailed,
    /// The request version is not supported by the coordinator.
    UnsupportedVersion,
    /// The request was malformed.
    InvalidRequest,
    /// The group has reached its maximum size.
    GroupMaxSizeReached,
    /// The member epoch is stale or otherwise invalid.
    FencedMemberEpoch,
    /// The static instance id is still held by another member.
    UnreleasedInstanceId,
    /// The requested server-side assignor does not exist.
    UnsupportedAssignor,
    /// The topology sent by a streams member was rejected.
    StreamsInvalidTopology,
    /// The topology epoch sent by a streams member was rejected.
    StreamsInvalidTopologyEpoch,
    /// The member's topology is stale relative to the group.
    StreamsTopologyFenced,
    /// An error code this crate doesn't know about.
    Unknown(i16),
}

/// How the engine reacts to an [ErrorCode].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Back off and retry the heartbeat unchanged.
    Retriable,
    /// Forget the coordinator and retry as soon as a new one is discovered.
    CoordinatorStale,
    /// Release everything, reset the epoch, and rejoin.
    Fencing,
    /// Surface to the application, but remain in the current state.
    Authorization,
    /// Surface to the application and stop participating in the group.
    Fatal,
}

impl ErrorCode {
    /// Returns the wire representation of this error code.
    pub fn code(&self) -> i16 {
        match *self {
            Self::None => 0,
            Self::CoordinatorLoadInProgress => 14,
            Self::CoordinatorNotAvailable => 15,
            Self::NotCoordinator => 16,
            Self::UnknownMemberId => 25,
            Self::TopicAuthorizationFailed => 29,
            Self::GroupAuthorizationFailed => 30,
            Self::UnsupportedVersion => 35,
            Self::InvalidRequest => 42,
            Self::GroupMaxSizeReached => 81,
            Self::FencedMemberEpoch => 110,
            Self::UnreleasedInstanceId => 111,
            Self::UnsupportedAssignor => 112,
            Self::StreamsInvalidTopology => 130,
            Self::StreamsInvalidTopologyEpoch => 131,
            Self::StreamsTopologyFenced => 132,
            Self::Unknown(code) => code,
        }
    }

    /// Decode an error code from its wire representation.
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => Self::None,
            14 => Self::CoordinatorLoadInProgress,
            15 => Self::CoordinatorNotAvailable,
            16 => Self::NotCoordinator,
            25 => Self::UnknownMemberId,
            29 => Self::TopicAuthorizationFailed,
            30 => Self::GroupAuthorizationFailed,
            35 => Self::UnsupportedVersion,
            42 => Self::InvalidRequest,
            81 => Self::GroupMaxSizeReached,
            110 => Self::FencedMemberEpoch,
            111 => Self::UnreleasedInstanceId,
            112 => Self::UnsupportedAssignor,
            130 => Self::StreamsInvalidTopology,
            131 => Self::StreamsInvalidTopologyEpoch,
            132 => Self::StreamsTopologyFenced,
            code => Self::Unknown(code),
        }
    }

    /// Returns the default classification of this error code.
    ///
    /// Anything unrecognized is fatal: an unknown code means either a bug, or a coordinator
    /// speaking a newer protocol than we do.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CoordinatorLoadInProgress => ErrorKind::Retriable,
            Self::CoordinatorNotAvailable | Self::NotCoordinator => ErrorKind::CoordinatorStale,
            Self::FencedMemberEpoch | Self::UnknownMemberId => ErrorKind::Fencing,
            Self::GroupAuthorizationFailed | Self::TopicAuthorizationFailed => {
                ErrorKind::Authorization
            }
            _ => ErrorKind::Fatal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown error code {}", code),
            known => write!(f, "{:?} ({})", known, known.code()),
        }
    }
}

/// A failure to deliver a heartbeat or receive its response.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection to the coordinator was lost.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// No response arrived in time.
    #[error("request timed out")]
    Timeout,

    /// Any other network-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The coordinator does not speak the request's protocol version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
}

impl TransportError {
    /// Returns true if the heartbeat should be retried after backing off.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::UnsupportedVersion(_))
    }
}

/// A failure reported by (or on behalf of) an application callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// The callback ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The callback request was dropped without being completed.
    #[error("callback request was dropped without completion")]
    Abandoned,
}

impl CallbackError {
    /// Create a [CallbackError::Failed] from anything printable.
    pub fn failed<E: fmt::Display>(e: E) -> Self {
        Self::Failed(e.to_string())
    }
}

/// An error surfaced to the application through the event channel.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    /// The member lacks permission on the group or one of its topics. The member stays in
    /// its current state, so it recovers once permissions are granted.
    #[error("authorization failed for group {group_id}: {code}: {message}")]
    Authorization {
        /// The group the member belongs to.
        group_id: String,
        /// Either group or topic authorization.
        code: ErrorCode,
        /// The coordinator's error message, if any.
        message: String,
    },

    /// The coordinator returned an unrecoverable error. The member is now fatal.
    #[error("fatal error from coordinator: {code}: {message}")]
    Fatal {
        /// The error code that caused this.
        code: ErrorCode,
        /// The coordinator's error message, if any.
        message: String,
    },

    /// The transport failed in a way that can't be retried. The member is now fatal.
    #[error("heartbeat transport failed: {0}")]
    Transport(#[source] TransportError),

    /// An application callback failed.
    #[error("{callback} callback failed: {source}")]
    Callback {
        /// The name of the callback.
        callback: &'static str,
        /// What the callback reported.
        #[source]
        source: CallbackError,
    },
}

/// Returned when the other end of a channel has gone away.
///
/// If this error is received, the engine can be assumed to have stopped executing.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("closed")]
pub struct Closed;

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn default_classification() {
        use ErrorCode::*;

        assert_eq!(ErrorKind::Retriable, CoordinatorLoadInProgress.kind());
        assert_eq!(ErrorKind::CoordinatorStale, NotCoordinator.kind());
        assert_eq!(ErrorKind::CoordinatorStale, CoordinatorNotAvailable.kind());
        assert_eq!(ErrorKind::Fencing, FencedMemberEpoch.kind());
        assert_eq!(ErrorKind::Fencing, UnknownMemberId.kind());
        assert_eq!(ErrorKind::Authorization, GroupAuthorizationFailed.kind());
        assert_eq!(ErrorKind::Authorization, TopicAuthorizationFailed.kind());
        assert_eq!(ErrorKind::Fatal, InvalidRequest.kind());
        assert_eq!(ErrorKind::Fatal, UnsupportedVersion.kind());
        assert_eq!(ErrorKind::Fatal, StreamsInvalidTopology.kind());
        assert_eq!(ErrorKind::Fatal, Unknown(9999).kind());
    }

    #[quickcheck]
    fn codes_survive_decoding(code: i16) -> bool {
        ErrorCode::from_code(code).code() == code
    }

    #[test]
    fn only_unsupported_version_is_fatal_at_transport() {
        assert!(TransportError::Timeout.is_retriable());
        assert!(TransportError::Disconnected("eof".into()).is_retriable());
        assert!(TransportError::Network("reset".into()).is_retriable());
        assert!(!TransportError::UnsupportedVersion("v9".into()).is_retriable());
    }
}
