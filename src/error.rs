// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error and cancellation types.
//!
//! A SAS verification never fails with a Rust error on the protocol level,
//! it gets *cancelled* with a [`CancelCode`] that is sent to the other side
//! verbatim. Rust errors exist only at the seams where the state machine
//! talks to the outside world: the transport, the identity store and the
//! signature upload service.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reason a verification flow was cancelled, as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The verification took too long to complete.
    Timeout,
    /// A message was received that is not expected in the current state.
    UnexpectedMessage,
    /// The device does not know how to handle the requested method.
    UnknownMethod,
    /// A message could not be parsed or was missing required fields.
    InvalidMessage,
    /// A different device already accepted the verification.
    Accepted,
    /// A MAC over a long-term key did not match the key we know.
    KeyMismatch,
    /// The hash commitment from the accept message did not match the key
    /// that was later received.
    MismatchedCommitment,
    /// The users decided that the short authentication strings differ.
    MismatchedSas,
    /// A cancel code this crate does not know about.
    Custom(String),
}

impl CancelCode {
    /// The wire representation of this cancel code.
    pub fn as_str(&self) -> &str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::Accepted => "m.accepted",
            CancelCode::KeyMismatch => "m.key_mismatch",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::Custom(c) => c,
        }
    }

    /// A human readable description of the cancel code, used as the `reason`
    /// field of an outgoing `m.key.verification.cancel` message.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::Accepted => {
                "A m.key.verification.request was accepted by a different device."
            }
            CancelCode::KeyMismatch => "The expected key did not match the verified one.",
            CancelCode::MismatchedCommitment => {
                "The hash commitment did not match the expected one."
            }
            CancelCode::MismatchedSas => "The short authentication strings did not match.",
            CancelCode::Custom(_) => "The verification was cancelled for an unknown reason.",
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for CancelCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "m.user" => CancelCode::User,
            "m.timeout" => CancelCode::Timeout,
            "m.unexpected_message" => CancelCode::UnexpectedMessage,
            "m.unknown_method" => CancelCode::UnknownMethod,
            "m.invalid_message" => CancelCode::InvalidMessage,
            "m.accepted" => CancelCode::Accepted,
            "m.key_mismatch" => CancelCode::KeyMismatch,
            "m.mismatched_commitment" => CancelCode::MismatchedCommitment,
            "m.mismatched_sas" => CancelCode::MismatchedSas,
            _ => CancelCode::Custom(s),
        }
    }
}

impl From<CancelCode> for String {
    fn from(c: CancelCode) -> Self {
        c.as_str().to_owned()
    }
}

/// Information about a cancelled verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancel_code: CancelCode,
    reason: String,
    cancelled_by_us: bool,
}

impl CancelInfo {
    pub(crate) fn new(cancel_code: CancelCode, reason: String, cancelled_by_us: bool) -> Self {
        Self { cancel_code, reason, cancelled_by_us }
    }

    /// The cancel code of the cancellation.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// A human readable reason for the cancellation.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Was the verification cancelled by our own side.
    ///
    /// `false` means that the other side sent us a
    /// `m.key.verification.cancel` message.
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

/// Error type for the [`VerificationTransport`] trait.
///
/// [`VerificationTransport`]: crate::VerificationTransport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The message could not be delivered to the other device.
    #[error("the message could not be sent: {0}")]
    Send(String),
}

/// Error type for the [`IdentityStore`] trait.
///
/// [`IdentityStore`]: crate::IdentityStore
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying storage backend failed.
    #[error("the identity store failed: {0}")]
    Backend(String),
}

/// Error type for the [`CrossSigningService`] trait.
///
/// [`CrossSigningService`]: crate::CrossSigningService
#[derive(Debug, Error)]
pub enum SigningError {
    /// The signature could not be created or uploaded.
    #[error("the cross-signing request failed: {0}")]
    Upload(String),
}
