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

//! The state machine of a single SAS verification transaction.
//!
//! Everything in here is synchronous and free of IO: the handlers validate
//! the current lifecycle state, mutate the transaction and hand back the
//! message that has to go out, if any. The [`Sas`] wrapper owns the
//! suspension points around it, the transport sends, the identity store
//! reads and the cross-signing uploads.
//!
//! [`Sas`]: super::Sas

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use ruma::OwnedDeviceId;

use super::{
    engine::SasEngine,
    helpers::{
        bytes_to_decimal, bytes_to_emoji, bytes_to_emoji_index, calculate_commitment,
        extra_info_sas, get_mac_content, receive_mac_event, SasIds, VerifiedKeys,
    },
    protocols::{
        negotiate_protocols, AcceptSettings, AcceptedProtocols, SupportedMacMethod,
        VerificationMethod, HASHES, KEY_AGREEMENT_PROTOCOLS, MACS,
    },
};
use crate::{
    emoji::Emoji,
    error::{CancelCode, CancelInfo},
    events::{AcceptContent, CancelContent, KeyContent, MacContent, StartContent},
    identities::DeviceData,
};

/// The max time a SAS flow can take from start to done.
const MAX_AGE: Duration = Duration::from_secs(60 * 5);

/// The max time a SAS flow will wait for a new event to arrive.
const MAX_EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// The emoji representation of the short authentication string, both as
/// table indices and as renderable symbols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmojiShortAuthString {
    /// Seven indices into the emoji table, each in the range 0..=63.
    pub indices: [u8; 7],
    /// The seven emojis that should be shown to the user.
    pub emojis: [Emoji; 7],
}

/// The lifecycle state of a SAS verification transaction.
///
/// Every assignment of a new state is observable through
/// [`Sas::changes()`](super::Sas::changes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction exists but nothing has been sent or received yet.
    Created,
    /// Our `m.key.verification.start` message is on its way out.
    SendingStart,
    /// The start message has been exchanged.
    Started,
    /// Our `m.key.verification.accept` message is on its way out.
    SendingAccept,
    /// We accepted the flow and the protocol set is bound.
    Accepted {
        /// The protocols both sides agreed to use.
        accepted_protocols: AcceptedProtocols,
    },
    /// The other side accepted our start message.
    AcceptReceived {
        /// The protocols both sides agreed to use.
        accepted_protocols: AcceptedProtocols,
    },
    /// Our `m.key.verification.key` message is on its way out.
    SendingKey,
    /// Our ephemeral public key has been sent.
    KeySent,
    /// The other side's ephemeral public key has arrived.
    KeyReceived,
    /// The short authentication string can be presented to the user.
    ShortCodeReady {
        /// The emoji representation, if both sides support it.
        emojis: Option<EmojiShortAuthString>,
        /// The decimal representation.
        decimals: (u16, u16, u16),
    },
    /// Our user confirmed that the short authentication strings match.
    ShortCodeAccepted,
    /// Our `m.key.verification.mac` message is on its way out.
    SendingMac,
    /// Our MAC has been sent, we may still be waiting for theirs.
    MacSent,
    /// Both MACs matched, the trust side effects are being applied.
    Verifying,
    /// The verification finished successfully.
    Verified {
        /// The devices of the other side whose keys have been verified.
        verified_devices: Vec<OwnedDeviceId>,
        /// Did the other user's cross-signing master key get verified.
        master_key_verified: bool,
    },
    /// The verification was cancelled by our side.
    Cancelled(CancelInfo),
    /// The verification was cancelled by the other side.
    PeerCancelled(CancelInfo),
}

impl TransactionState {
    /// Is this a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Verified { .. }
                | TransactionState::Cancelled(_)
                | TransactionState::PeerCancelled(_)
        )
    }

    /// Is this one of the two cancelled states.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransactionState::Cancelled(_) | TransactionState::PeerCancelled(_))
    }

    /// Did the verification finish successfully.
    pub fn is_verified(&self) -> bool {
        matches!(self, TransactionState::Verified { .. })
    }
}

/// A single SAS verification between us and one other device.
#[derive(Debug)]
pub(crate) struct SasTransaction {
    ids: SasIds,
    flow_id: String,
    we_started: bool,
    state: TransactionState,
    engine: SasEngine,
    /// The initiator's start payload; its canonical form is the basis of
    /// the commitment.
    start_content: StartContent,
    commitment: Option<String>,
    /// The protocol set the responder picked at creation, moved into
    /// `accepted` when the accept message goes out.
    negotiated: Option<AcceptedProtocols>,
    accepted: Option<AcceptedProtocols>,
    short_bytes: Option<[u8; 6]>,
    their_mac: Option<MacContent>,
    mac_sent: bool,
    verified_keys: Option<VerifiedKeys>,
    creation_time: Instant,
    last_event_time: Instant,
}

impl SasTransaction {
    /// Create a new outgoing transaction. Nothing is sent yet; the start
    /// message goes out when [`begin_sending_start`] is driven.
    ///
    /// [`begin_sending_start`]: Self::begin_sending_start
    pub(crate) fn start(ids: SasIds, flow_id: String, settings: AcceptSettings) -> Self {
        let start_content = StartContent {
            transaction_id: flow_id.clone(),
            from_device: ids.account.device_id.clone(),
            method: VerificationMethod::SasV1,
            key_agreement_protocols: KEY_AGREEMENT_PROTOCOLS.to_vec(),
            hashes: HASHES.to_vec(),
            message_authentication_codes: MACS.to_vec(),
            short_authentication_string: settings.allowed_methods().to_vec(),
        };

        Self {
            ids,
            flow_id,
            we_started: true,
            state: TransactionState::Created,
            engine: SasEngine::new(),
            start_content,
            commitment: None,
            negotiated: None,
            accepted: None,
            short_bytes: None,
            their_mac: None,
            mac_sent: false,
            verified_keys: None,
            creation_time: Instant::now(),
            last_event_time: Instant::now(),
        }
    }

    /// Create a new incoming transaction from a received
    /// `m.key.verification.start` message.
    ///
    /// The offer is negotiated right away; an offer we cannot serve is
    /// rejected with `m.unknown_method` before a transaction ever exists.
    pub(crate) fn from_start_event(
        ids: SasIds,
        content: StartContent,
        settings: AcceptSettings,
    ) -> Result<Self, CancelCode> {
        let negotiated = negotiate_protocols(&content, &settings)?;

        Ok(Self {
            ids,
            flow_id: content.transaction_id.clone(),
            we_started: false,
            state: TransactionState::Started,
            engine: SasEngine::new(),
            start_content: content,
            commitment: None,
            negotiated: Some(negotiated),
            accepted: None,
            short_bytes: None,
            their_mac: None,
            mac_sent: false,
            verified_keys: None,
            creation_time: Instant::now(),
            last_event_time: Instant::now(),
        })
    }

    pub(crate) fn state(&self) -> &TransactionState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn is_engine_released(&self) -> bool {
        self.engine.is_released()
    }

    fn mac_method(&self) -> Result<SupportedMacMethod, CancelCode> {
        Ok(self
            .accepted
            .as_ref()
            .ok_or(CancelCode::UnexpectedMessage)?
            .message_authentication_code)
    }

    fn touch(&mut self) {
        self.last_event_time = Instant::now();
    }

    /// Has this transaction been sitting around for too long.
    ///
    /// Once the short code is on display the user may take as long as they
    /// want; before and after that point a stalled flow is cancelled with
    /// `m.timeout` by the machine's garbage collection.
    pub(crate) fn timed_out(&self) -> bool {
        if self.state.is_terminal() || matches!(self.state, TransactionState::ShortCodeReady { .. })
        {
            false
        } else {
            self.creation_time.elapsed() > MAX_AGE
                || self.last_event_time.elapsed() > MAX_EVENT_TIMEOUT
        }
    }

    #[cfg(test)]
    pub(crate) fn set_creation_time(&mut self, time: Instant) {
        self.creation_time = time;
        self.last_event_time = time;
    }

    /// Move a fresh outgoing transaction into the sending state, handing
    /// back the start message that needs to go out.
    pub(crate) fn begin_sending_start(&mut self) -> Result<StartContent, CancelCode> {
        if self.we_started && self.state == TransactionState::Created {
            self.state = TransactionState::SendingStart;
            Ok(self.start_content.clone())
        } else {
            Err(CancelCode::UnexpectedMessage)
        }
    }

    /// The start message has been handed to the transport.
    pub(crate) fn mark_start_sent(&mut self) {
        if self.state == TransactionState::SendingStart {
            self.state = TransactionState::Started;
        }
    }

    /// Accept an incoming flow: bind the negotiated protocol set, compute
    /// the commitment over the initiator's start payload and our ephemeral
    /// public key, and hand back the accept message.
    pub(crate) fn begin_accept(&mut self) -> Result<AcceptContent, CancelCode> {
        if self.we_started || self.state != TransactionState::Started || self.accepted.is_some() {
            return Err(CancelCode::UnexpectedMessage);
        }

        let accepted = self.negotiated.clone().ok_or(CancelCode::UnexpectedMessage)?;

        let public_key =
            self.engine.our_public_key().map_err(|e| e.as_cancel_code())?;
        let commitment = calculate_commitment(&public_key, &self.start_content);

        self.commitment = Some(commitment.clone());
        self.accepted = Some(accepted.clone());
        self.state = TransactionState::SendingAccept;

        Ok(AcceptContent {
            transaction_id: self.flow_id.clone(),
            method: VerificationMethod::SasV1,
            key_agreement_protocol: accepted.key_agreement_protocol,
            hash: accepted.hash,
            message_authentication_code: accepted.message_authentication_code.as_wire(),
            short_authentication_string: accepted.short_authentication_string,
            commitment,
        })
    }

    /// The accept message has been handed to the transport.
    pub(crate) fn mark_accept_sent(&mut self) {
        if self.state == TransactionState::SendingAccept {
            let accepted_protocols =
                self.accepted.clone().expect("An accept was sent without bound protocols");
            self.state = TransactionState::Accepted { accepted_protocols };
        }
    }

    /// Handle the other side accepting our start message. Binds the chosen
    /// protocol set and hands back our key message.
    pub(crate) fn receive_accept(
        &mut self,
        content: &AcceptContent,
    ) -> Result<KeyContent, CancelCode> {
        self.touch();

        if !self.we_started
            || self.state != TransactionState::Started
            || self.accepted.is_some()
        {
            return Err(CancelCode::UnexpectedMessage);
        }

        if content.method != VerificationMethod::SasV1
            || !KEY_AGREEMENT_PROTOCOLS.contains(&content.key_agreement_protocol)
            || !HASHES.contains(&content.hash)
        {
            return Err(CancelCode::UnknownMethod);
        }

        let accepted = AcceptedProtocols {
            key_agreement_protocol: content.key_agreement_protocol.clone(),
            hash: content.hash.clone(),
            message_authentication_code: SupportedMacMethod::try_from(
                &content.message_authentication_code,
            )?,
            short_authentication_string: content.short_authentication_string.clone(),
        };

        accepted.check_against_offer(&self.start_content)?;

        let accepted_protocols = accepted.clone();
        self.accepted = Some(accepted);
        self.commitment = Some(content.commitment.clone());
        self.state = TransactionState::AcceptReceived { accepted_protocols };

        Ok(KeyContent {
            transaction_id: self.flow_id.clone(),
            key: self.engine.our_public_key().map_err(|e| e.as_cancel_code())?,
        })
    }

    /// Our key message is on its way out.
    pub(crate) fn begin_sending_key(&mut self) {
        self.state = TransactionState::SendingKey;
    }

    /// The key message has been handed to the transport.
    pub(crate) fn mark_key_sent(&mut self) {
        if self.state == TransactionState::SendingKey {
            self.state = TransactionState::KeySent;
        }
    }

    /// Handle the other side's ephemeral public key.
    ///
    /// On the initiating side this is where the commitment from the accept
    /// message is checked before the key is mixed in; a mismatch means the
    /// other side picked its key after seeing ours and the flow is
    /// cancelled. On the accepting side our own key message is handed back
    /// to be sent out.
    pub(crate) fn receive_key(
        &mut self,
        content: &KeyContent,
    ) -> Result<Option<KeyContent>, CancelCode> {
        self.touch();

        if self.short_bytes.is_some() {
            return Err(CancelCode::UnexpectedMessage);
        }

        if self.we_started {
            if self.state != TransactionState::KeySent {
                return Err(CancelCode::UnexpectedMessage);
            }

            let commitment =
                self.commitment.as_ref().ok_or(CancelCode::UnexpectedMessage)?;

            if *commitment != calculate_commitment(&content.key, &self.start_content) {
                return Err(CancelCode::MismatchedCommitment);
            }

            self.state = TransactionState::KeyReceived;
            self.engine.establish(&content.key).map_err(|e| e.as_cancel_code())?;

            Ok(None)
        } else {
            if !matches!(self.state, TransactionState::Accepted { .. }) {
                return Err(CancelCode::UnexpectedMessage);
            }

            self.state = TransactionState::KeyReceived;
            self.engine.establish(&content.key).map_err(|e| e.as_cancel_code())?;

            Ok(Some(KeyContent {
                transaction_id: self.flow_id.clone(),
                key: self.engine.our_public_key().map_err(|e| e.as_cancel_code())?,
            }))
        }
    }

    /// Derive the short authentication string bytes and make them ready for
    /// presentation.
    ///
    /// This happens exactly once per transaction, after both public keys
    /// are known and, on the initiating side, after the commitment check
    /// has passed.
    pub(crate) fn derive_short_code(&mut self) -> Result<(), CancelCode> {
        if self.short_bytes.is_some() {
            return Err(CancelCode::UnexpectedMessage);
        }

        let accepted = self.accepted.as_ref().ok_or(CancelCode::UnexpectedMessage)?;

        let info = extra_info_sas(
            &self.ids,
            &accepted.key_agreement_protocol,
            &self.engine.our_public_key().map_err(|e| e.as_cancel_code())?,
            &self.engine.their_public_key().map_err(|e| e.as_cancel_code())?,
            &self.flow_id,
            self.we_started,
        );

        let bytes = self.engine.generate_bytes(&info).map_err(|e| e.as_cancel_code())?;
        self.short_bytes = Some(bytes);

        let emojis = accepted.supports_emoji().then(|| EmojiShortAuthString {
            indices: bytes_to_emoji_index(&bytes),
            emojis: bytes_to_emoji(&bytes),
        });

        self.state =
            TransactionState::ShortCodeReady { emojis, decimals: bytes_to_decimal(&bytes) };

        Ok(())
    }

    /// Our user confirmed that the short authentication string matches.
    /// Hands back the MAC message attesting our long-term keys.
    pub(crate) fn confirm(&mut self) -> Result<MacContent, CancelCode> {
        if !matches!(self.state, TransactionState::ShortCodeReady { .. }) {
            return Err(CancelCode::UnexpectedMessage);
        }

        let content = get_mac_content(&self.engine, &self.ids, &self.flow_id, self.mac_method()?)?;

        self.state = TransactionState::ShortCodeAccepted;

        Ok(content)
    }

    /// Our MAC message is on its way out.
    pub(crate) fn begin_sending_mac(&mut self) {
        self.state = TransactionState::SendingMac;
    }

    /// The MAC message has been handed to the transport.
    pub(crate) fn mark_mac_sent(&mut self) {
        if self.state == TransactionState::SendingMac {
            self.mac_sent = true;
            self.state = TransactionState::MacSent;
        }
    }

    /// Handle the other side's MAC message.
    ///
    /// The other user may confirm before ours does, so the MAC is legal any
    /// time from the moment the short code is on display. It is stored and
    /// only checked once our own MAC went out; the returned flag says
    /// whether that point has been reached.
    pub(crate) fn receive_mac(&mut self, content: &MacContent) -> Result<bool, CancelCode> {
        self.touch();

        if self.their_mac.is_some() {
            return Err(CancelCode::UnexpectedMessage);
        }

        match self.state {
            TransactionState::ShortCodeReady { .. }
            | TransactionState::ShortCodeAccepted
            | TransactionState::SendingMac
            | TransactionState::MacSent => {
                self.their_mac = Some(content.clone());
                Ok(self.mac_sent && self.state == TransactionState::MacSent)
            }
            _ => Err(CancelCode::UnexpectedMessage),
        }
    }

    /// Do we have the other side's MAC already.
    pub(crate) fn has_their_mac(&self) -> bool {
        self.their_mac.is_some()
    }

    /// Check the stored MAC of the other side against the long-term keys we
    /// know for them.
    pub(crate) fn verify_their_mac(
        &mut self,
        their_devices: &BTreeMap<OwnedDeviceId, DeviceData>,
    ) -> Result<VerifiedKeys, CancelCode> {
        if self.state != TransactionState::MacSent {
            return Err(CancelCode::UnexpectedMessage);
        }

        let content = self.their_mac.clone().ok_or(CancelCode::UnexpectedMessage)?;

        let verified = receive_mac_event(
            &self.engine,
            &self.ids,
            their_devices,
            &self.flow_id,
            self.mac_method()?,
            &content,
        )?;

        self.verified_keys = Some(verified.clone());
        self.state = TransactionState::Verifying;

        Ok(verified)
    }

    /// The trust side effects have been applied, the flow is over. Releases
    /// the ephemeral secret.
    pub(crate) fn mark_verified(&mut self) {
        if let Some(verified) = &self.verified_keys {
            self.engine.release();
            self.state = TransactionState::Verified {
                verified_devices: verified.devices.clone(),
                master_key_verified: verified.master_key_verified,
            };
        }
    }

    /// Handle a `m.key.verification.done` message from the other side.
    ///
    /// It only carries information once we are done ourselves; in every
    /// other live state it is a protocol violation.
    pub(crate) fn receive_done(&mut self) -> Result<(), CancelCode> {
        self.touch();

        if self.state.is_terminal() {
            Ok(())
        } else {
            Err(CancelCode::UnexpectedMessage)
        }
    }

    /// Cancel the transaction from our side.
    ///
    /// Idempotent: a transaction that is already in a terminal state keeps
    /// its state and reason, and nothing new is sent. Otherwise the
    /// ephemeral secret is released and the cancel message that has to be
    /// sent to the other side is handed back.
    pub(crate) fn cancel(&mut self, code: CancelCode) -> Option<CancelContent> {
        if self.state.is_terminal() {
            return None;
        }

        self.engine.release();

        let reason = code.reason().to_owned();
        self.state = TransactionState::Cancelled(CancelInfo::new(
            code.clone(),
            reason.clone(),
            true,
        ));

        Some(CancelContent { transaction_id: self.flow_id.clone(), code, reason })
    }

    /// Handle a `m.key.verification.cancel` message from the other side.
    ///
    /// Idempotent like [`cancel`](Self::cancel); no reply is sent.
    pub(crate) fn receive_cancel(&mut self, content: &CancelContent) {
        if self.state.is_terminal() {
            return;
        }

        self.engine.release();

        self.state = TransactionState::PeerCancelled(CancelInfo::new(
            content.code.clone(),
            content.reason.clone(),
            false,
        ));
    }
}
