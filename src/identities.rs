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

//! The identity data the verification flow works with, and the traits
//! through which it reaches the outside world.
//!
//! The state machine only ever *reads* identity data; marking a device as
//! verified and uploading cross-signing signatures go back out through the
//! [`IdentityStore`] and [`CrossSigningService`] traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};

use crate::error::{SigningError, StoreError};

/// The public identity of our own account, the static part of what a crypto
/// store holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticAccountData {
    /// Our own user id.
    pub user_id: OwnedUserId,
    /// Our own device id.
    pub device_id: OwnedDeviceId,
    /// The unpadded base64 Ed25519 fingerprint key of this device.
    pub ed25519_key: String,
}

/// The public identity of another device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceData {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    ed25519_key: String,
}

impl DeviceData {
    /// Create a new device from its user id, device id and Ed25519
    /// fingerprint key.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        ed25519_key: impl Into<String>,
    ) -> Self {
        Self { user_id, device_id, ed25519_key: ed25519_key.into() }
    }

    /// The user this device belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of this device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The unpadded base64 Ed25519 fingerprint key of this device.
    pub fn ed25519_key(&self) -> &str {
        &self.ed25519_key
    }
}

/// The cross-signing state of a user, as far as the verification flow is
/// concerned: the public master key and whether we trust it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossSigningInfo {
    user_id: OwnedUserId,
    master_key: String,
    trusted: bool,
}

impl CrossSigningInfo {
    /// Create the cross-signing info of a user from the unpadded base64
    /// public master key and the local trust decision.
    pub fn new(user_id: OwnedUserId, master_key: impl Into<String>, trusted: bool) -> Self {
        Self { user_id, master_key: master_key.into(), trusted }
    }

    /// The user this cross-signing identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unpadded base64 public master key of the user.
    pub fn master_key(&self) -> &str {
        &self.master_key
    }

    /// Do we consider this master key to be trusted.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }
}

/// Read access to the long-term key catalog, plus the single write the flow
/// needs: flipping the local verification flag of a device.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Get a single device of a user, if we know about it.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, StoreError>;

    /// Get all devices we know about for a user, keyed by device id.
    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, StoreError>;

    /// Get the cross-signing info of a user, if we know about it. Pass our
    /// own user id to get our own.
    async fn get_cross_signing_info(
        &self,
        user_id: &UserId,
    ) -> Result<Option<CrossSigningInfo>, StoreError>;

    /// Mark a device as locally verified.
    async fn mark_device_verified(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StoreError>;
}

/// The cross-signing operations a successful verification may trigger.
///
/// Both calls are fire and forget from the state machine's point of view: a
/// failure is logged but a transaction that reached its verified state
/// stays verified.
#[async_trait]
pub trait CrossSigningService: Send + Sync {
    /// Sign the master key of the given user with our user-signing key and
    /// upload the signature.
    async fn trust_user(&self, user_id: &UserId) -> Result<(), SigningError>;

    /// Sign one of our own devices with our self-signing key and upload the
    /// signature.
    async fn sign_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), SigningError>;
}
