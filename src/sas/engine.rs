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

//! The wrapper around the low level SAS primitives.
//!
//! The engine owns the ephemeral Curve25519 key pair of one transaction and
//! everything derived from it. It starts out with only a public key to
//! offer, becomes established once the other side's public key has been
//! mixed in, and is released on the way into any terminal state, destroying
//! the secret material. A released engine refuses every operation.

use std::{fmt, mem};

use thiserror::Error;
use vodozemac::{
    sas::{EstablishedSas, Mac, Sas},
    Curve25519PublicKey,
};

use crate::{error::CancelCode, sas::SupportedMacMethod};

/// The ways the engine can refuse to work.
#[derive(Debug, Error)]
pub(crate) enum EngineError {
    /// The ephemeral secret has been destroyed already.
    #[error("the ephemeral secret has already been released")]
    Released,
    /// An operation that needs the shared secret was called before the
    /// other side's public key was set.
    #[error("the shared secret hasn't been established yet")]
    NotEstablished,
    /// The other side's public key was set twice.
    #[error("the shared secret has already been established")]
    AlreadyEstablished,
    /// The other side's public key did not parse.
    #[error("the public key of the other side is invalid: {0}")]
    InvalidKey(String),
    /// A received MAC did not decode.
    #[error("the received MAC wasn't valid base64: {0}")]
    InvalidMac(String),
    /// A received MAC decoded but did not match.
    #[error("the MAC check failed")]
    MacMismatch,
}

impl EngineError {
    /// The cancel code a transaction hitting this error should cancel with.
    pub(crate) fn as_cancel_code(&self) -> CancelCode {
        match self {
            EngineError::InvalidKey(_) | EngineError::InvalidMac(_) => CancelCode::InvalidMessage,
            EngineError::MacMismatch => CancelCode::KeyMismatch,
            EngineError::Released
            | EngineError::NotEstablished
            | EngineError::AlreadyEstablished => CancelCode::UnexpectedMessage,
        }
    }
}

enum EngineState {
    Created(Box<Sas>),
    Established(Box<EstablishedSas>),
    Released,
}

/// The per-transaction handle to the ephemeral key pair and the key
/// derivations it powers.
pub(crate) struct SasEngine {
    inner: EngineState,
}

impl SasEngine {
    /// Create a new engine with a fresh ephemeral key pair.
    pub(crate) fn new() -> Self {
        Self { inner: EngineState::Created(Box::new(Sas::new())) }
    }

    /// Our ephemeral public key as unpadded base64.
    pub(crate) fn our_public_key(&self) -> Result<String, EngineError> {
        match &self.inner {
            EngineState::Created(sas) => Ok(sas.public_key().to_base64()),
            EngineState::Established(sas) => Ok(sas.our_public_key().to_base64()),
            EngineState::Released => Err(EngineError::Released),
        }
    }

    /// Mix in the other side's ephemeral public key, establishing the
    /// shared secret.
    pub(crate) fn establish(&mut self, their_public_key: &str) -> Result<(), EngineError> {
        let key = Curve25519PublicKey::from_base64(their_public_key)
            .map_err(|e| EngineError::InvalidKey(e.to_string()))?;

        match mem::replace(&mut self.inner, EngineState::Released) {
            EngineState::Created(sas) => match sas.diffie_hellman(key) {
                Ok(established) => {
                    self.inner = EngineState::Established(Box::new(established));
                    Ok(())
                }
                Err(e) => Err(EngineError::InvalidKey(e.to_string())),
            },
            state @ EngineState::Established(_) => {
                self.inner = state;
                Err(EngineError::AlreadyEstablished)
            }
            EngineState::Released => Err(EngineError::Released),
        }
    }

    /// The other side's ephemeral public key as unpadded base64, once the
    /// shared secret has been established.
    pub(crate) fn their_public_key(&self) -> Result<String, EngineError> {
        Ok(self.established()?.their_public_key().to_base64())
    }

    fn established(&self) -> Result<&EstablishedSas, EngineError> {
        match &self.inner {
            EngineState::Established(sas) => Ok(sas),
            EngineState::Created(_) => Err(EngineError::NotEstablished),
            EngineState::Released => Err(EngineError::Released),
        }
    }

    /// Derive the six bytes the short authentication string is built from,
    /// keyed by the given info string.
    pub(crate) fn generate_bytes(&self, info: &str) -> Result<[u8; 6], EngineError> {
        Ok(*self.established()?.bytes(info).as_bytes())
    }

    /// Calculate the MAC of a message keyed by the given info string, using
    /// the agreed MAC method.
    pub(crate) fn calculate_mac(
        &self,
        input: &str,
        info: &str,
        method: SupportedMacMethod,
    ) -> Result<String, EngineError> {
        let sas = self.established()?;

        Ok(match method {
            SupportedMacMethod::HkdfHmacSha256 => sas.calculate_mac_invalid_base64(input, info),
            SupportedMacMethod::HkdfHmacSha256V2 => sas.calculate_mac(input, info).to_base64(),
        })
    }

    /// Check a MAC the other side sent us against our own calculation.
    pub(crate) fn verify_mac(
        &self,
        input: &str,
        info: &str,
        tag: &str,
        method: SupportedMacMethod,
    ) -> Result<(), EngineError> {
        let sas = self.established()?;

        match method {
            SupportedMacMethod::HkdfHmacSha256 => {
                if sas.calculate_mac_invalid_base64(input, info) == tag {
                    Ok(())
                } else {
                    Err(EngineError::MacMismatch)
                }
            }
            SupportedMacMethod::HkdfHmacSha256V2 => {
                let mac =
                    Mac::from_base64(tag).map_err(|e| EngineError::InvalidMac(e.to_string()))?;
                sas.verify_mac(input, info, &mac).map_err(|_| EngineError::MacMismatch)
            }
        }
    }

    /// Destroy the ephemeral secret material.
    pub(crate) fn release(&mut self) {
        self.inner = EngineState::Released;
    }

    /// Has the secret material been destroyed.
    pub(crate) fn is_released(&self) -> bool {
        matches!(self.inner, EngineState::Released)
    }
}

impl fmt::Debug for SasEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            EngineState::Created(_) => "created",
            EngineState::Established(_) => "established",
            EngineState::Released => "released",
        };

        f.debug_struct("SasEngine").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (SasEngine, SasEngine) {
        let mut alice = SasEngine::new();
        let mut bob = SasEngine::new();

        let alice_key = alice.our_public_key().unwrap();
        let bob_key = bob.our_public_key().unwrap();

        alice.establish(&bob_key).unwrap();
        bob.establish(&alice_key).unwrap();

        (alice, bob)
    }

    #[test]
    fn engines_derive_the_same_bytes() {
        let (alice, bob) = established_pair();

        assert_eq!(
            alice.generate_bytes("INFO").unwrap(),
            bob.generate_bytes("INFO").unwrap()
        );
        assert_ne!(
            alice.generate_bytes("INFO").unwrap(),
            alice.generate_bytes("OTHER").unwrap()
        );
    }

    #[test]
    fn macs_verify_with_both_methods() {
        let (alice, bob) = established_pair();

        for method in [SupportedMacMethod::HkdfHmacSha256, SupportedMacMethod::HkdfHmacSha256V2] {
            let mac = alice.calculate_mac("key", "info", method).unwrap();
            bob.verify_mac("key", "info", &mac, method).unwrap();

            assert!(matches!(
                bob.verify_mac("other key", "info", &mac, method),
                Err(EngineError::MacMismatch)
            ));
        }
    }

    #[test]
    fn bytes_need_an_established_secret() {
        let alice = SasEngine::new();
        assert!(matches!(alice.generate_bytes("INFO"), Err(EngineError::NotEstablished)));
    }

    #[test]
    fn a_released_engine_refuses_to_work() {
        let (mut alice, _) = established_pair();

        alice.release();

        assert!(alice.is_released());
        assert!(matches!(alice.our_public_key(), Err(EngineError::Released)));
        assert!(matches!(alice.generate_bytes("INFO"), Err(EngineError::Released)));
    }

    #[test]
    fn an_invalid_public_key_is_rejected() {
        let mut alice = SasEngine::new();
        assert!(matches!(alice.establish("not base64!"), Err(EngineError::InvalidKey(_))));
    }
}
