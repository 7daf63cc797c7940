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

//! Test doubles for the transport and cross-signing seams.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use async_trait::async_trait;
use ruma::{device_id, user_id, DeviceId, OwnedDeviceId, OwnedUserId, UserId};

use crate::{
    error::{SigningError, TransportError},
    events::AnyVerificationContent,
    identities::{CrossSigningService, DeviceData, StaticAccountData},
    transport::VerificationTransport,
};

pub(crate) fn alice_account() -> StaticAccountData {
    StaticAccountData {
        user_id: user_id!("@alice:example.org").to_owned(),
        device_id: device_id!("JLAFKJWSCS").to_owned(),
        ed25519_key: "nE6W2fCblxDcOFmeEtCHNl8DTW21oIv7nP5YmZVLkNs".to_owned(),
    }
}

pub(crate) fn bob_account() -> StaticAccountData {
    StaticAccountData {
        user_id: user_id!("@bob:example.org").to_owned(),
        device_id: device_id!("BOBDEVCIE").to_owned(),
        ed25519_key: "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4".to_owned(),
    }
}

pub(crate) fn device_of(account: &StaticAccountData) -> DeviceData {
    DeviceData::new(
        account.user_id.clone(),
        account.device_id.clone(),
        account.ed25519_key.clone(),
    )
}

/// A transport that records everything it is asked to deliver.
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<AnyVerificationContent>>,
    done: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Drain the recorded outgoing messages.
    pub fn take_sent(&self) -> Vec<AnyVerificationContent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// The transaction ids `done` was called for.
    pub fn done_transactions(&self) -> Vec<String> {
        self.done.lock().unwrap().clone()
    }
}

#[async_trait]
impl VerificationTransport for RecordingTransport {
    async fn send(
        &self,
        _recipient: &UserId,
        _recipient_device: &DeviceId,
        content: &AnyVerificationContent,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("the recording transport was told to fail".into()));
        }

        self.sent.lock().unwrap().push(content.clone());
        Ok(())
    }

    async fn done(&self, transaction_id: &str) -> Result<(), TransportError> {
        self.done.lock().unwrap().push(transaction_id.to_owned());
        Ok(())
    }
}

/// A cross-signing service that records what it was asked to sign.
#[derive(Debug, Default)]
pub(crate) struct RecordingSigningService {
    trusted: Mutex<Vec<OwnedUserId>>,
    signed: Mutex<Vec<(OwnedUserId, OwnedDeviceId)>>,
    fail: AtomicBool,
}

impl RecordingSigningService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upload fail.
    pub fn fail_uploads(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn trusted_users(&self) -> Vec<OwnedUserId> {
        self.trusted.lock().unwrap().clone()
    }

    pub fn signed_devices(&self) -> Vec<(OwnedUserId, OwnedDeviceId)> {
        self.signed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CrossSigningService for RecordingSigningService {
    async fn trust_user(&self, user_id: &UserId) -> Result<(), SigningError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SigningError::Upload("the recording service was told to fail".into()));
        }

        self.trusted.lock().unwrap().push(user_id.to_owned());
        Ok(())
    }

    async fn sign_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), SigningError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SigningError::Upload("the recording service was told to fail".into()));
        }

        self.signed.lock().unwrap().push((user_id.to_owned(), device_id.to_owned()));
        Ok(())
    }
}
