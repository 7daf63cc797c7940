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

//! An in-memory identity store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use ruma::{DeviceId, OwnedUserId, UserId};

use crate::{
    error::StoreError,
    identities::{CrossSigningInfo, DeviceData, IdentityStore},
};

/// An in-memory only [`IdentityStore`].
///
/// Nothing survives a restart; this is meant for tests and for clients that
/// hydrate the catalog from their own storage on startup.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: DashMap<OwnedUserId, BTreeMap<String, DeviceData>>,
    identities: DashMap<OwnedUserId, CrossSigningInfo>,
    verified: DashMap<OwnedUserId, Vec<String>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device in the store.
    pub fn save_device(&self, device: DeviceData) {
        self.devices
            .entry(device.user_id().to_owned())
            .or_default()
            .insert(device.device_id().as_str().to_owned(), device);
    }

    /// Add or replace the cross-signing info of a user.
    pub fn save_cross_signing_info(&self, info: CrossSigningInfo) {
        self.identities.insert(info.user_id().to_owned(), info);
    }

    /// Has the given device been marked as locally verified.
    pub fn is_device_verified(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.verified
            .get(user_id)
            .map(|d| d.iter().any(|id| id == device_id.as_str()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, StoreError> {
        Ok(self
            .devices
            .get(user_id)
            .and_then(|d| d.get(device_id.as_str()).cloned()))
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<ruma::OwnedDeviceId, DeviceData>, StoreError> {
        Ok(self
            .devices
            .get(user_id)
            .map(|d| {
                d.values()
                    .map(|device| (device.device_id().to_owned(), device.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_cross_signing_info(
        &self,
        user_id: &UserId,
    ) -> Result<Option<CrossSigningInfo>, StoreError> {
        Ok(self.identities.get(user_id).map(|i| i.clone()))
    }

    async fn mark_device_verified(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StoreError> {
        self.verified
            .entry(user_id.to_owned())
            .or_default()
            .push(device_id.as_str().to_owned());

        Ok(())
    }
}
