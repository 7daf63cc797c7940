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

//! The byte-exact derivations of the SAS flow: the commitment hash, the
//! info strings that key every derivation, the short authentication string
//! codec and the MAC attestation payloads.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use ruma::{CanonicalJsonValue, DeviceId, OwnedDeviceId};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use super::{
    engine::SasEngine,
    protocols::{KeyAgreementProtocol, SupportedMacMethod},
};
use crate::{
    emoji::{emoji_from_index, Emoji},
    error::CancelCode,
    events::{MacContent, StartContent},
    identities::{CrossSigningInfo, DeviceData, StaticAccountData},
};

/// The identities that are doing the SAS dance.
#[derive(Clone, Debug)]
pub(crate) struct SasIds {
    pub account: StaticAccountData,
    pub own_identity: Option<CrossSigningInfo>,
    pub other_device: DeviceData,
    pub other_identity: Option<CrossSigningInfo>,
}

pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Calculate the commitment for an accept event from the public key and the
/// start event that started the flow.
///
/// # Arguments
///
/// * `public_key` - The accepting side's ephemeral public key that is used
///   for the interactive verification.
///
/// * `content` - The `m.key.verification.start` event content that started
///   the interactive verification process.
pub(crate) fn calculate_commitment(public_key: &str, content: &StartContent) -> String {
    let json_content: CanonicalJsonValue = serde_json::to_value(content)
        .expect("Can't serialize start content")
        .try_into()
        .expect("Can't canonicalize start content");

    encode(
        Sha256::new()
            .chain_update(public_key)
            .chain_update(json_content.to_string())
            .finalize(),
    )
}

/// Get the info string that keys the derivation of the short authentication
/// string bytes.
///
/// The initiating side's identity always comes first. The
/// `curve25519-hkdf-sha256` key agreement additionally binds both ephemeral
/// public keys into the info string.
///
/// # Arguments
///
/// * `ids` - The ids that are used for this SAS authentication flow.
///
/// * `flow_id` - The unique id that identifies this SAS verification
///   process.
///
/// * `we_started` - Flag signaling if the SAS process was started on our
///   side.
pub(crate) fn extra_info_sas(
    ids: &SasIds,
    protocol: &KeyAgreementProtocol,
    own_pubkey: &str,
    their_pubkey: &str,
    flow_id: &str,
    we_started: bool,
) -> String {
    let info = match protocol {
        KeyAgreementProtocol::Curve25519HkdfSha256 => {
            let our_info = format!(
                "{}|{}|{}",
                ids.account.user_id, ids.account.device_id, own_pubkey
            );
            let their_info = format!(
                "{}|{}|{}",
                ids.other_device.user_id(),
                ids.other_device.device_id(),
                their_pubkey
            );

            let (first_info, second_info) =
                if we_started { (our_info, their_info) } else { (their_info, our_info) };

            format!("MATRIX_KEY_VERIFICATION_SAS|{first_info}|{second_info}|{flow_id}")
        }
        _ => {
            let our_info = format!("{}{}", ids.account.user_id, ids.account.device_id);
            let their_info =
                format!("{}{}", ids.other_device.user_id(), ids.other_device.device_id());

            let (first_info, second_info) =
                if we_started { (our_info, their_info) } else { (their_info, our_info) };

            format!("MATRIX_KEY_VERIFICATION_SAS{first_info}{second_info}{flow_id}")
        }
    };

    trace!("Generated a SAS extra info: {}", info);

    info
}

/// Get the extra info that will be used when we generate a MAC and need to
/// send it out.
///
/// # Arguments
///
/// * `ids` - The ids that are used for this SAS authentication flow.
///
/// * `flow_id` - The unique id that identifies this SAS verification
///   process.
fn extra_mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.account.user_id,
        first_device = ids.account.device_id,
        second_user = ids.other_device.user_id(),
        second_device = ids.other_device.device_id(),
        transaction_id = flow_id,
    )
}

/// Get the extra info that will be used when we check the MACs of a
/// `m.key.verification.mac` event.
fn extra_mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.other_device.user_id(),
        first_device = ids.other_device.device_id(),
        second_user = ids.account.user_id,
        second_device = ids.account.device_id,
        transaction_id = flow_id,
    )
}

/// Get the decimal version of the short authentication string.
///
/// Returns a tuple containing three 4 digit integer numbers that represent
/// the short auth string. Only the first five of the six bytes are used.
pub(crate) fn bytes_to_decimal(bytes: &[u8; 6]) -> (u16, u16, u16) {
    let bytes: Vec<u16> = bytes.iter().map(|b| *b as u16).collect();

    // This bitwise operation is taken from the [spec]
    // [spec]: https://spec.matrix.org/unstable/client-server-api/#sas-method-decimal
    let first = (bytes[0] << 5) | (bytes[1] >> 3);
    let second = ((bytes[1] & 0x7) << 10) | (bytes[2] << 2) | (bytes[3] >> 6);
    let third = ((bytes[3] & 0x3F) << 7) | (bytes[4] >> 1);

    (first + 1000, second + 1000, third + 1000)
}

/// Turn the six short authentication string bytes into seven 6-bit indices
/// into the emoji table.
pub(crate) fn bytes_to_emoji_index(bytes: &[u8; 6]) -> [u8; 7] {
    let bytes: Vec<u64> = bytes.iter().map(|b| *b as u64).collect();
    // Join the 6 bytes into one 64 bit unsigned int. This u64 will contain
    // 48 bits from our 6 bytes.
    let mut num: u64 = bytes[0] << 40;
    num += bytes[1] << 32;
    num += bytes[2] << 24;
    num += bytes[3] << 16;
    num += bytes[4] << 8;
    num += bytes[5];

    // Take the top 42 bits of our 48 bits from the u64 and convert each 6
    // bits into a 6 bit number.
    [
        ((num >> 42) & 63) as u8,
        ((num >> 36) & 63) as u8,
        ((num >> 30) & 63) as u8,
        ((num >> 24) & 63) as u8,
        ((num >> 18) & 63) as u8,
        ((num >> 12) & 63) as u8,
        ((num >> 6) & 63) as u8,
    ]
}

/// Turn the six short authentication string bytes into the seven emojis
/// that are shown to the user.
pub(crate) fn bytes_to_emoji(bytes: &[u8; 6]) -> [Emoji; 7] {
    let indices = bytes_to_emoji_index(bytes);

    indices.map(emoji_from_index)
}

/// The outcome of a successful MAC check: which long-term keys the other
/// side attested and we were able to confirm.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct VerifiedKeys {
    /// The devices whose fingerprint keys matched.
    pub devices: Vec<OwnedDeviceId>,
    /// Did the MAC over the other user's master key match.
    pub master_key_verified: bool,
}

/// Get the content for an outgoing `m.key.verification.mac` event.
///
/// The MAC always covers our own device fingerprint key. If we have a
/// trusted cross-signing identity of our own its master key is attested as
/// well, so the other side can elevate its trust from our device to our
/// whole user.
pub(crate) fn get_mac_content(
    engine: &SasEngine,
    ids: &SasIds,
    flow_id: &str,
    method: SupportedMacMethod,
) -> Result<MacContent, CancelCode> {
    let mut mac: BTreeMap<String, String> = BTreeMap::new();

    let info = extra_mac_info_send(ids, flow_id);

    let key_id = format!("ed25519:{}", ids.account.device_id);
    let key = &ids.account.ed25519_key;

    mac.insert(
        key_id.clone(),
        engine
            .calculate_mac(key, &format!("{info}{key_id}"), method)
            .map_err(|e| e.as_cancel_code())?,
    );

    if let Some(own_identity) = &ids.own_identity {
        if own_identity.is_trusted() {
            let key = own_identity.master_key();
            let key_id = format!("ed25519:{key}");

            mac.insert(
                key_id.clone(),
                engine
                    .calculate_mac(key, &format!("{info}{key_id}"), method)
                    .map_err(|e| e.as_cancel_code())?,
            );
        }
    }

    let mut keys: Vec<&str> = mac.keys().map(|s| s.as_str()).collect();
    keys.sort_unstable();

    let keys = engine
        .calculate_mac(&keys.join(","), &format!("{info}KEY_IDS"), method)
        .map_err(|e| e.as_cancel_code())?;

    Ok(MacContent { transaction_id: flow_id.to_owned(), mac, keys })
}

/// Check the MACs of a received `m.key.verification.mac` event.
///
/// Returns which devices and whether the master key of the other user could
/// be confirmed. Key ids we know nothing about are skipped; an event that
/// attests nothing we can confirm is treated as a key mismatch.
pub(crate) fn receive_mac_event(
    engine: &SasEngine,
    ids: &SasIds,
    their_devices: &BTreeMap<OwnedDeviceId, DeviceData>,
    flow_id: &str,
    method: SupportedMacMethod,
    content: &MacContent,
) -> Result<VerifiedKeys, CancelCode> {
    let mut verified = VerifiedKeys::default();

    let info = extra_mac_info_receive(ids, flow_id);

    trace!(
        user_id = ids.other_device.user_id().as_str(),
        device_id = ids.other_device.device_id().as_str(),
        "Received a key.verification.mac event"
    );

    let mut keys: Vec<&str> = content.mac.keys().map(|k| k.as_str()).collect();
    keys.sort_unstable();

    engine
        .verify_mac(&keys.join(","), &format!("{info}KEY_IDS"), &content.keys, method)
        .map_err(|e| e.as_cancel_code())?;

    for (key_id, key_mac) in &content.mac {
        trace!(
            user_id = ids.other_device.user_id().as_str(),
            key_id = key_id.as_str(),
            "Checking a SAS MAC",
        );

        let key_name = match key_id.strip_prefix("ed25519:") {
            Some(name) => name,
            None => continue,
        };

        if let Some(device) = their_devices.get(<&DeviceId>::from(key_name)) {
            engine
                .verify_mac(device.ed25519_key(), &format!("{info}{key_id}"), key_mac, method)
                .map_err(|e| e.as_cancel_code())?;

            trace!(key_id = key_id.as_str(), "Successfully verified a device key");
            verified.devices.push(device.device_id().to_owned());
        } else if ids
            .other_identity
            .as_ref()
            .map_or(false, |i| i.master_key() == key_name)
        {
            engine
                .verify_mac(key_name, &format!("{info}{key_id}"), key_mac, method)
                .map_err(|e| e.as_cancel_code())?;

            trace!(key_id = key_id.as_str(), "Successfully verified a master key");
            verified.master_key_verified = true;
        } else {
            warn!(
                "Key ID {} in MAC event from {} {} doesn't belong to any device \
                or user identity",
                key_id,
                ids.other_device.user_id(),
                ids.other_device.device_id()
            );
        }
    }

    if verified.devices.is_empty() && !verified.master_key_verified {
        Err(CancelCode::KeyMismatch)
    } else {
        Ok(verified)
    }
}
