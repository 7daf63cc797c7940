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

//! A no-network state machine for the interactive short authentication
//! string (SAS) verification flow.
//!
//! Two devices that want to trust each other's long-term keys run the flow
//! over any end-to-end channel: they negotiate a protocol set, exchange
//! ephemeral Curve25519 keys, derive a short code both users compare out of
//! band, and finally exchange MACs over their long-term keys. A matching
//! code plus matching MACs marks the other device, and optionally the other
//! user's cross-signing identity, as verified.
//!
//! The [`VerificationMachine`] is the entry point: it owns the in-flight
//! flows and routes inbound `m.key.verification.*` messages into them. The
//! seams to the rest of a client are traits: [`VerificationTransport`] for
//! delivery, [`IdentityStore`] for the long-term key catalog and
//! [`CrossSigningService`] for signature uploads.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod emoji;
mod error;
mod events;
mod identities;
mod machine;
mod sas;
mod store;
#[cfg(test)]
mod test_utils;
mod transport;

pub use emoji::Emoji;
pub use error::{CancelCode, CancelInfo, SigningError, StoreError, TransportError};
pub use events::{
    AcceptContent, AnyVerificationContent, CancelContent, DoneContent, KeyContent, MacContent,
    StartContent,
};
pub use identities::{
    CrossSigningInfo, CrossSigningService, DeviceData, IdentityStore, StaticAccountData,
};
pub use machine::VerificationMachine;
pub use sas::{
    AcceptSettings, AcceptedProtocols, EmojiShortAuthString, HashAlgorithm,
    KeyAgreementProtocol, MessageAuthenticationCode, Sas, ShortAuthenticationString,
    SupportedMacMethod, TransactionState, VerificationMethod,
};
pub use store::MemoryStore;
pub use transport::VerificationTransport;
