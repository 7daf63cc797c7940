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

//! Protocol negotiation for the SAS flow.
//!
//! Both sides advertise the key agreement protocols, hashes, MAC methods and
//! short authentication string representations they know about; the
//! accepting side picks the first entry of its own preference list that the
//! other side offered as well. An empty intersection in any of the four
//! lists cancels the flow with `m.unknown_method`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{error::CancelCode, events::StartContent};

/// The verification method that is offered in a
/// `m.key.verification.start` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VerificationMethod {
    /// The in-band SAS method, `m.sas.v1`.
    SasV1,
    /// A verification method this crate does not implement.
    Custom(String),
}

impl VerificationMethod {
    /// The wire representation of this verification method.
    pub fn as_str(&self) -> &str {
        match self {
            VerificationMethod::SasV1 => "m.sas.v1",
            VerificationMethod::Custom(m) => m,
        }
    }
}

impl From<String> for VerificationMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "m.sas.v1" => VerificationMethod::SasV1,
            _ => VerificationMethod::Custom(s),
        }
    }
}

impl From<VerificationMethod> for String {
    fn from(m: VerificationMethod) -> Self {
        m.as_str().to_owned()
    }
}

/// The key agreement protocol that is used to establish the shared secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KeyAgreementProtocol {
    /// An ephemeral Curve25519 Diffie-Hellman exchange, the shared secret
    /// feeding the key derivation directly.
    Curve25519,
    /// An ephemeral Curve25519 Diffie-Hellman exchange where the info string
    /// of the key derivation additionally binds both public keys.
    Curve25519HkdfSha256,
    /// A key agreement protocol this crate does not implement.
    Custom(String),
}

impl KeyAgreementProtocol {
    /// The wire representation of this key agreement protocol.
    pub fn as_str(&self) -> &str {
        match self {
            KeyAgreementProtocol::Curve25519 => "curve25519",
            KeyAgreementProtocol::Curve25519HkdfSha256 => "curve25519-hkdf-sha256",
            KeyAgreementProtocol::Custom(p) => p,
        }
    }
}

impl From<String> for KeyAgreementProtocol {
    fn from(s: String) -> Self {
        match s.as_str() {
            "curve25519" => KeyAgreementProtocol::Curve25519,
            "curve25519-hkdf-sha256" => KeyAgreementProtocol::Curve25519HkdfSha256,
            _ => KeyAgreementProtocol::Custom(s),
        }
    }
}

impl From<KeyAgreementProtocol> for String {
    fn from(p: KeyAgreementProtocol) -> Self {
        p.as_str().to_owned()
    }
}

/// The hash algorithm that is used for the commitment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// A hash algorithm this crate does not implement.
    Custom(String),
}

impl HashAlgorithm {
    /// The wire representation of this hash algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Custom(h) => h,
        }
    }
}

impl From<String> for HashAlgorithm {
    fn from(s: String) -> Self {
        match s.as_str() {
            "sha256" => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Custom(s),
        }
    }
}

impl From<HashAlgorithm> for String {
    fn from(h: HashAlgorithm) -> Self {
        h.as_str().to_owned()
    }
}

/// The message authentication code that is used to attest the long-term
/// keys once the users confirmed the short authentication string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageAuthenticationCode {
    /// HKDF-SHA-256 keyed HMAC, with the base64 encoding quirk of the
    /// original libolm implementation.
    HkdfHmacSha256,
    /// HKDF-SHA-256 keyed HMAC with the corrected base64 encoding.
    HkdfHmacSha256V2,
    /// The legacy long-KDF HMAC construction. Recognised on the wire but
    /// never negotiated, the engine does not implement it.
    HmacSha256,
    /// A MAC method this crate does not implement.
    Custom(String),
}

impl MessageAuthenticationCode {
    /// The wire representation of this MAC method.
    pub fn as_str(&self) -> &str {
        match self {
            MessageAuthenticationCode::HkdfHmacSha256 => "hkdf-hmac-sha256",
            MessageAuthenticationCode::HkdfHmacSha256V2 => "hkdf-hmac-sha256.v2",
            MessageAuthenticationCode::HmacSha256 => "hmac-sha256",
            MessageAuthenticationCode::Custom(m) => m,
        }
    }
}

impl From<String> for MessageAuthenticationCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "hkdf-hmac-sha256" => MessageAuthenticationCode::HkdfHmacSha256,
            "hkdf-hmac-sha256.v2" => MessageAuthenticationCode::HkdfHmacSha256V2,
            "hmac-sha256" => MessageAuthenticationCode::HmacSha256,
            _ => MessageAuthenticationCode::Custom(s),
        }
    }
}

impl From<MessageAuthenticationCode> for String {
    fn from(m: MessageAuthenticationCode) -> Self {
        m.as_str().to_owned()
    }
}

/// The representation of the short authentication string that is shown to
/// the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShortAuthenticationString {
    /// Three four-digit numbers.
    Decimal,
    /// Seven emojis.
    Emoji,
    /// A representation this crate does not implement.
    Custom(String),
}

impl ShortAuthenticationString {
    /// The wire representation of this short authentication string method.
    pub fn as_str(&self) -> &str {
        match self {
            ShortAuthenticationString::Decimal => "decimal",
            ShortAuthenticationString::Emoji => "emoji",
            ShortAuthenticationString::Custom(s) => s,
        }
    }
}

impl From<String> for ShortAuthenticationString {
    fn from(s: String) -> Self {
        match s.as_str() {
            "decimal" => ShortAuthenticationString::Decimal,
            "emoji" => ShortAuthenticationString::Emoji,
            _ => ShortAuthenticationString::Custom(s),
        }
    }
}

impl From<ShortAuthenticationString> for String {
    fn from(s: ShortAuthenticationString) -> Self {
        s.as_str().to_owned()
    }
}

/// The MAC methods the engine can actually compute, as opposed to the ones
/// that merely exist on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupportedMacMethod {
    /// `hkdf-hmac-sha256`, with the libolm base64 encoding.
    HkdfHmacSha256,
    /// `hkdf-hmac-sha256.v2`, with the corrected base64 encoding.
    HkdfHmacSha256V2,
}

impl SupportedMacMethod {
    /// The wire level MAC method this supported method corresponds to.
    pub fn as_wire(&self) -> MessageAuthenticationCode {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => MessageAuthenticationCode::HkdfHmacSha256,
            SupportedMacMethod::HkdfHmacSha256V2 => MessageAuthenticationCode::HkdfHmacSha256V2,
        }
    }
}

impl fmt::Display for SupportedMacMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire().as_str())
    }
}

impl TryFrom<&MessageAuthenticationCode> for SupportedMacMethod {
    type Error = CancelCode;

    fn try_from(code: &MessageAuthenticationCode) -> Result<Self, Self::Error> {
        match code {
            MessageAuthenticationCode::HkdfHmacSha256 => Ok(SupportedMacMethod::HkdfHmacSha256),
            MessageAuthenticationCode::HkdfHmacSha256V2 => {
                Ok(SupportedMacMethod::HkdfHmacSha256V2)
            }
            MessageAuthenticationCode::HmacSha256 | MessageAuthenticationCode::Custom(_) => {
                Err(CancelCode::UnknownMethod)
            }
        }
    }
}

/// The key agreement protocols we are able to use, most preferred first.
pub(crate) const KEY_AGREEMENT_PROTOCOLS: &[KeyAgreementProtocol] =
    &[KeyAgreementProtocol::Curve25519, KeyAgreementProtocol::Curve25519HkdfSha256];

/// The hash algorithms we are able to use, most preferred first.
pub(crate) const HASHES: &[HashAlgorithm] = &[HashAlgorithm::Sha256];

/// The MAC methods we are able to use, most preferred first.
pub(crate) const MACS: &[MessageAuthenticationCode] = &[
    MessageAuthenticationCode::HkdfHmacSha256V2,
    MessageAuthenticationCode::HkdfHmacSha256,
];

/// The short authentication string methods we are able to present, most
/// preferred first.
pub(crate) const STRINGS: &[ShortAuthenticationString] =
    &[ShortAuthenticationString::Emoji, ShortAuthenticationString::Decimal];

/// Customize which short authentication string methods a device advertises.
///
/// Not every device can render emoji; such a device should restrict its
/// methods to the decimal representation.
#[derive(Clone, Debug)]
pub struct AcceptSettings {
    allowed_methods: Vec<ShortAuthenticationString>,
}

impl Default for AcceptSettings {
    /// All methods are allowed.
    fn default() -> Self {
        Self { allowed_methods: STRINGS.to_vec() }
    }
}

impl AcceptSettings {
    /// Create settings restricting the allowed SAS methods.
    ///
    /// # Arguments
    ///
    /// * `methods` - The methods this device allows at most.
    pub fn with_allowed_methods(methods: Vec<ShortAuthenticationString>) -> Self {
        Self { allowed_methods: methods }
    }

    pub(crate) fn allowed_methods(&self) -> &[ShortAuthenticationString] {
        &self.allowed_methods
    }
}

/// The set of protocols both sides agreed to use for the SAS flow.
///
/// This is bound exactly once, when the flow is accepted; a message that
/// implies a renegotiation cancels the flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedProtocols {
    /// The agreed key agreement protocol.
    pub key_agreement_protocol: KeyAgreementProtocol,
    /// The agreed commitment hash.
    pub hash: HashAlgorithm,
    /// The agreed MAC method.
    pub message_authentication_code: SupportedMacMethod,
    /// The agreed short authentication string representations, any of which
    /// may be presented to the user.
    pub short_authentication_string: Vec<ShortAuthenticationString>,
}

impl AcceptedProtocols {
    /// Does the agreed set of representations contain the emoji one.
    pub fn supports_emoji(&self) -> bool {
        self.short_authentication_string.contains(&ShortAuthenticationString::Emoji)
    }
}

/// Pick the protocol set to answer a `m.key.verification.start` offer with.
///
/// For every list the first entry of our own preference list that also
/// appears in the offer wins. Any empty intersection means the other device
/// wants something we cannot do and the flow is cancelled with
/// `m.unknown_method`.
pub(crate) fn negotiate_protocols(
    content: &StartContent,
    settings: &AcceptSettings,
) -> Result<AcceptedProtocols, CancelCode> {
    if content.method != VerificationMethod::SasV1 {
        return Err(CancelCode::UnknownMethod);
    }

    let key_agreement_protocol = KEY_AGREEMENT_PROTOCOLS
        .iter()
        .find(|p| content.key_agreement_protocols.contains(p))
        .cloned()
        .ok_or(CancelCode::UnknownMethod)?;

    let hash = HASHES
        .iter()
        .find(|h| content.hashes.contains(h))
        .cloned()
        .ok_or(CancelCode::UnknownMethod)?;

    let message_authentication_code = MACS
        .iter()
        .find(|m| content.message_authentication_codes.contains(m))
        .map(SupportedMacMethod::try_from)
        .transpose()?
        .ok_or(CancelCode::UnknownMethod)?;

    let short_authentication_string: Vec<_> = settings
        .allowed_methods()
        .iter()
        .filter(|m| content.short_authentication_string.contains(m))
        .cloned()
        .collect();

    if short_authentication_string.is_empty() {
        return Err(CancelCode::UnknownMethod);
    }

    Ok(AcceptedProtocols {
        key_agreement_protocol,
        hash,
        message_authentication_code,
        short_authentication_string,
    })
}

impl AcceptedProtocols {
    /// Check that an accepted protocol set only picks things that were part
    /// of the given `m.key.verification.start` offer.
    ///
    /// The side that sent the offer uses this when the accept message comes
    /// in; a choice that we never offered means the other device is trying
    /// to renegotiate and the flow is cancelled with `m.unexpected_message`.
    pub(crate) fn check_against_offer(&self, offer: &StartContent) -> Result<(), CancelCode> {
        if !offer.key_agreement_protocols.contains(&self.key_agreement_protocol)
            || !offer.hashes.contains(&self.hash)
            || !offer
                .message_authentication_codes
                .contains(&self.message_authentication_code.as_wire())
            || self.short_authentication_string.is_empty()
            || self
                .short_authentication_string
                .iter()
                .any(|m| !offer.short_authentication_string.contains(m))
        {
            Err(CancelCode::UnexpectedMessage)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::device_id;

    use super::*;

    fn start_content(
        key_agreement_protocols: &[KeyAgreementProtocol],
        hashes: &[HashAlgorithm],
        macs: &[MessageAuthenticationCode],
        strings: &[ShortAuthenticationString],
    ) -> StartContent {
        StartContent {
            transaction_id: "T1".to_owned(),
            from_device: device_id!("JLAFKJWSCS").to_owned(),
            method: VerificationMethod::SasV1,
            key_agreement_protocols: key_agreement_protocols.to_vec(),
            hashes: hashes.to_vec(),
            message_authentication_codes: macs.to_vec(),
            short_authentication_string: strings.to_vec(),
        }
    }

    fn full_offer() -> StartContent {
        start_content(
            KEY_AGREEMENT_PROTOCOLS,
            HASHES,
            &[
                MessageAuthenticationCode::HkdfHmacSha256,
                MessageAuthenticationCode::HmacSha256,
            ],
            STRINGS,
        )
    }

    #[test]
    fn negotiation_picks_our_preferences() {
        let accepted =
            negotiate_protocols(&full_offer(), &AcceptSettings::default()).unwrap();

        assert_eq!(accepted.key_agreement_protocol, KeyAgreementProtocol::Curve25519);
        assert_eq!(accepted.hash, HashAlgorithm::Sha256);
        assert_eq!(
            accepted.message_authentication_code,
            SupportedMacMethod::HkdfHmacSha256
        );
        assert!(accepted.supports_emoji());
    }

    #[test]
    fn negotiation_is_deterministic() {
        let first = negotiate_protocols(&full_offer(), &AcceptSettings::default()).unwrap();
        let second = negotiate_protocols(&full_offer(), &AcceptSettings::default()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn negotiation_prefers_the_corrected_mac_encoding() {
        let mut offer = full_offer();
        offer.message_authentication_codes = MACS.to_vec();

        let accepted = negotiate_protocols(&offer, &AcceptSettings::default()).unwrap();
        assert_eq!(
            accepted.message_authentication_code,
            SupportedMacMethod::HkdfHmacSha256V2
        );
    }

    #[test]
    fn negotiation_rejects_an_unsupported_mac() {
        let mut offer = full_offer();
        offer.message_authentication_codes = vec![MessageAuthenticationCode::HmacSha256];

        assert_eq!(
            negotiate_protocols(&offer, &AcceptSettings::default()),
            Err(CancelCode::UnknownMethod)
        );
    }

    #[test]
    fn negotiation_rejects_an_empty_intersection() {
        let mut offer = full_offer();
        offer.key_agreement_protocols =
            vec![KeyAgreementProtocol::Custom("x25519-kyber768".to_owned())];

        assert_eq!(
            negotiate_protocols(&offer, &AcceptSettings::default()),
            Err(CancelCode::UnknownMethod)
        );
    }

    #[test]
    fn negotiation_honors_the_allowed_methods() {
        let settings = AcceptSettings::with_allowed_methods(vec![
            ShortAuthenticationString::Decimal,
        ]);

        let accepted = negotiate_protocols(&full_offer(), &settings).unwrap();
        assert_eq!(
            accepted.short_authentication_string,
            [ShortAuthenticationString::Decimal]
        );
        assert!(!accepted.supports_emoji());
    }

    #[test]
    fn accepted_protocols_must_come_from_the_offer() {
        let accepted =
            negotiate_protocols(&full_offer(), &AcceptSettings::default()).unwrap();

        let mut narrow_offer = full_offer();
        narrow_offer.short_authentication_string = vec![ShortAuthenticationString::Decimal];

        assert!(accepted.check_against_offer(&full_offer()).is_ok());
        assert_eq!(
            accepted.check_against_offer(&narrow_offer),
            Err(CancelCode::UnexpectedMessage)
        );
    }
}
