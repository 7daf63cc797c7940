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

//! The `m.key.verification.*` to-device message contents.
//!
//! The field names are the normative wire names; everything here serializes
//! to the exact JSON that independent implementations expect, which matters
//! because the canonical form of the start content is fed into the
//! commitment hash.

use std::collections::BTreeMap;

use ruma::OwnedDeviceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::CancelCode,
    sas::{
        HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
        ShortAuthenticationString, VerificationMethod,
    },
};

/// The content of an `m.key.verification.start` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContent {
    /// The opaque id tying all messages of one verification flow together.
    pub transaction_id: String,
    /// The device that started the verification.
    pub from_device: OwnedDeviceId,
    /// The verification method, `m.sas.v1` for this crate.
    pub method: VerificationMethod,
    /// The key agreement protocols the sender knows about, in preference
    /// order.
    pub key_agreement_protocols: Vec<KeyAgreementProtocol>,
    /// The commitment hash algorithms the sender knows about.
    pub hashes: Vec<HashAlgorithm>,
    /// The MAC methods the sender knows about, in preference order.
    pub message_authentication_codes: Vec<MessageAuthenticationCode>,
    /// The short authentication string representations the sender can
    /// present to its user.
    pub short_authentication_string: Vec<ShortAuthenticationString>,
}

/// The content of an `m.key.verification.accept` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptContent {
    /// The opaque id tying all messages of one verification flow together.
    pub transaction_id: String,
    /// The verification method, `m.sas.v1` for this crate.
    pub method: VerificationMethod,
    /// The chosen key agreement protocol.
    pub key_agreement_protocol: KeyAgreementProtocol,
    /// The chosen commitment hash algorithm.
    pub hash: HashAlgorithm,
    /// The chosen MAC method.
    pub message_authentication_code: MessageAuthenticationCode,
    /// The short authentication string representations both sides are able
    /// to present.
    pub short_authentication_string: Vec<ShortAuthenticationString>,
    /// The hash binding the start content to the accepting side's ephemeral
    /// public key, unpadded base64.
    pub commitment: String,
}

/// The content of an `m.key.verification.key` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContent {
    /// The opaque id tying all messages of one verification flow together.
    pub transaction_id: String,
    /// The sender's ephemeral Curve25519 public key, unpadded base64.
    pub key: String,
}

/// The content of an `m.key.verification.mac` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacContent {
    /// The opaque id tying all messages of one verification flow together.
    pub transaction_id: String,
    /// A map from key id (`ed25519:<device or master key id>`) to the MAC
    /// of that key, computed with the agreed MAC method.
    pub mac: BTreeMap<String, String>,
    /// The MAC of the comma-separated, lexicographically sorted list of key
    /// ids in `mac`.
    pub keys: String,
}

/// The content of an `m.key.verification.cancel` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContent {
    /// The opaque id tying all messages of one verification flow together.
    pub transaction_id: String,
    /// The machine readable reason for the cancellation.
    pub code: CancelCode,
    /// A human readable reason for the cancellation.
    pub reason: String,
}

/// The content of an `m.key.verification.done` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneContent {
    /// The opaque id tying all messages of one verification flow together.
    pub transaction_id: String,
}

/// Any verification message content this crate understands, inbound or
/// outbound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnyVerificationContent {
    /// An `m.key.verification.start` content.
    Start(StartContent),
    /// An `m.key.verification.accept` content.
    Accept(AcceptContent),
    /// An `m.key.verification.key` content.
    Key(KeyContent),
    /// An `m.key.verification.mac` content.
    Mac(MacContent),
    /// An `m.key.verification.cancel` content.
    Cancel(CancelContent),
    /// An `m.key.verification.done` content.
    Done(DoneContent),
}

impl AnyVerificationContent {
    /// Deserialize a verification message out of its event type and JSON
    /// content.
    ///
    /// Returns `Ok(None)` for event types this crate does not know about,
    /// those are silently ignored for forwards compatibility. A known event
    /// type with malformed content is an error; the flow it belongs to gets
    /// cancelled with `m.invalid_message`.
    pub fn from_parts(event_type: &str, content: &Value) -> Result<Option<Self>, serde_json::Error> {
        let content = match event_type {
            "m.key.verification.start" => {
                Self::Start(serde_json::from_value(content.clone())?)
            }
            "m.key.verification.accept" => {
                Self::Accept(serde_json::from_value(content.clone())?)
            }
            "m.key.verification.key" => Self::Key(serde_json::from_value(content.clone())?),
            "m.key.verification.mac" => Self::Mac(serde_json::from_value(content.clone())?),
            "m.key.verification.cancel" => {
                Self::Cancel(serde_json::from_value(content.clone())?)
            }
            "m.key.verification.done" => Self::Done(serde_json::from_value(content.clone())?),
            _ => return Ok(None),
        };

        Ok(Some(content))
    }

    /// The event type this content is sent as.
    pub fn event_type(&self) -> &'static str {
        match self {
            AnyVerificationContent::Start(_) => "m.key.verification.start",
            AnyVerificationContent::Accept(_) => "m.key.verification.accept",
            AnyVerificationContent::Key(_) => "m.key.verification.key",
            AnyVerificationContent::Mac(_) => "m.key.verification.mac",
            AnyVerificationContent::Cancel(_) => "m.key.verification.cancel",
            AnyVerificationContent::Done(_) => "m.key.verification.done",
        }
    }

    /// The transaction id of the flow this content belongs to.
    pub fn transaction_id(&self) -> &str {
        match self {
            AnyVerificationContent::Start(c) => &c.transaction_id,
            AnyVerificationContent::Accept(c) => &c.transaction_id,
            AnyVerificationContent::Key(c) => &c.transaction_id,
            AnyVerificationContent::Mac(c) => &c.transaction_id,
            AnyVerificationContent::Cancel(c) => &c.transaction_id,
            AnyVerificationContent::Done(c) => &c.transaction_id,
        }
    }

    /// Serialize this content into the JSON that goes over the wire.
    pub fn to_json(&self) -> Value {
        let value = match self {
            AnyVerificationContent::Start(c) => serde_json::to_value(c),
            AnyVerificationContent::Accept(c) => serde_json::to_value(c),
            AnyVerificationContent::Key(c) => serde_json::to_value(c),
            AnyVerificationContent::Mac(c) => serde_json::to_value(c),
            AnyVerificationContent::Cancel(c) => serde_json::to_value(c),
            AnyVerificationContent::Done(c) => serde_json::to_value(c),
        };

        value.expect("Can't serialize a verification content")
    }
}

impl From<StartContent> for AnyVerificationContent {
    fn from(c: StartContent) -> Self {
        Self::Start(c)
    }
}

impl From<AcceptContent> for AnyVerificationContent {
    fn from(c: AcceptContent) -> Self {
        Self::Accept(c)
    }
}

impl From<KeyContent> for AnyVerificationContent {
    fn from(c: KeyContent) -> Self {
        Self::Key(c)
    }
}

impl From<MacContent> for AnyVerificationContent {
    fn from(c: MacContent) -> Self {
        Self::Mac(c)
    }
}

impl From<CancelContent> for AnyVerificationContent {
    fn from(c: CancelContent) -> Self {
        Self::Cancel(c)
    }
}

impl From<DoneContent> for AnyVerificationContent {
    fn from(c: DoneContent) -> Self {
        Self::Done(c)
    }
}
