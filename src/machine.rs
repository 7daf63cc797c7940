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

//! The registry and dispatcher for all in-flight verification flows.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{CancelCode, StoreError},
    events::{AnyVerificationContent, CancelContent, StartContent},
    identities::{CrossSigningService, DeviceData, IdentityStore, StaticAccountData},
    sas::{AcceptSettings, Sas, SasIds},
    transport::VerificationTransport,
};

/// The entry point of the crate: owns every in-flight SAS verification and
/// routes inbound verification messages into the right one.
///
/// Flows are independent of each other; each one serializes its own message
/// dispatch. The machine itself is cheap to clone and can be shared across
/// tasks.
#[derive(Clone)]
pub struct VerificationMachine {
    account: StaticAccountData,
    settings: AcceptSettings,
    store: Arc<dyn IdentityStore>,
    transport: Arc<dyn VerificationTransport>,
    signing: Arc<dyn CrossSigningService>,
    verifications: Arc<DashMap<String, Sas>>,
}

impl std::fmt::Debug for VerificationMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationMachine")
            .field("user_id", &self.account.user_id)
            .field("device_id", &self.account.device_id)
            .field("verifications", &self.verifications.len())
            .finish()
    }
}

impl VerificationMachine {
    /// Create a new verification machine advertising the default short
    /// authentication string methods.
    pub fn new(
        account: StaticAccountData,
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn VerificationTransport>,
        signing: Arc<dyn CrossSigningService>,
    ) -> Self {
        Self::with_settings(account, store, transport, signing, AcceptSettings::default())
    }

    /// Create a new verification machine with custom accept settings, for
    /// devices that cannot present every short authentication string
    /// method.
    pub fn with_settings(
        account: StaticAccountData,
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn VerificationTransport>,
        signing: Arc<dyn CrossSigningService>,
        settings: AcceptSettings,
    ) -> Self {
        Self {
            account,
            settings,
            store,
            transport,
            signing,
            verifications: DashMap::new().into(),
        }
    }

    /// Get the verification flow with the given transaction id, if there is
    /// one.
    pub fn get_sas(&self, transaction_id: &str) -> Option<Sas> {
        self.verifications.get(transaction_id).map(|s| s.value().clone())
    }

    async fn load_ids(&self, other_device: DeviceData) -> Result<SasIds, StoreError> {
        let own_identity = self.store.get_cross_signing_info(&self.account.user_id).await?;
        let other_identity =
            self.store.get_cross_signing_info(other_device.user_id()).await?;

        Ok(SasIds { account: self.account.clone(), own_identity, other_device, other_identity })
    }

    /// Start a new outgoing verification flow with the given device.
    ///
    /// The start message is sent out before this returns; the other side
    /// answers with an accept message that gets routed through
    /// [`receive_event`](Self::receive_event).
    pub async fn start_sas(&self, other_device: DeviceData) -> Result<Sas, StoreError> {
        let flow_id = Uuid::new_v4().to_string();
        let ids = self.load_ids(other_device).await?;

        info!(
            user_id = ids.other_device.user_id().as_str(),
            device_id = ids.other_device.device_id().as_str(),
            flow_id = flow_id.as_str(),
            "Starting a new SAS verification flow"
        );

        let sas = Sas::start(
            ids,
            flow_id.clone(),
            self.settings.clone(),
            self.transport.clone(),
            self.store.clone(),
            self.signing.clone(),
        );

        self.verifications.insert(flow_id, sas.clone());
        sas.send_start().await;

        Ok(sas)
    }

    /// Route a received to-device event into the verification flow it
    /// belongs to.
    ///
    /// Event types this crate does not know are ignored. A known event type
    /// whose content does not parse cancels the flow it names with
    /// `m.invalid_message`.
    pub async fn receive_event(&self, sender: &ruma::UserId, event_type: &str, content: &Value) {
        trace!(sender = sender.as_str(), event_type, "Received a verification event");

        let content = match AnyVerificationContent::from_parts(event_type, content) {
            Ok(Some(content)) => content,
            Ok(None) => {
                trace!(event_type, "Ignoring an unknown verification event type");
                return;
            }
            Err(e) => {
                warn!(
                    sender = sender.as_str(),
                    event_type,
                    error = ?e,
                    "Failed to parse a verification event"
                );

                if let Some(flow_id) = content.get("transaction_id").and_then(Value::as_str) {
                    if let Some(sas) = self.get_sas(flow_id) {
                        sas.cancel_with_code(CancelCode::InvalidMessage).await;
                    }
                }

                return;
            }
        };

        match &content {
            AnyVerificationContent::Start(c) => self.receive_start(sender, c).await,
            _ => {
                if let Some(sas) = self.get_sas(content.transaction_id()) {
                    sas.receive_any_event(sender, &content).await;
                } else {
                    trace!(
                        sender = sender.as_str(),
                        flow_id = content.transaction_id(),
                        "A verification event for an unknown flow, ignoring"
                    );
                }
            }
        }
    }

    async fn receive_start(&self, sender: &ruma::UserId, content: &StartContent) {
        if let Some(sas) = self.get_sas(&content.transaction_id) {
            warn!(
                sender = sender.as_str(),
                flow_id = content.transaction_id.as_str(),
                "Received a start event for an already existing flow, cancelling"
            );

            sas.cancel_with_code(CancelCode::UnexpectedMessage).await;
            return;
        }

        let device = match self.store.get_device(sender, &content.from_device).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(
                    sender = sender.as_str(),
                    device_id = content.from_device.as_str(),
                    "Received a verification start event from an unknown device"
                );
                return;
            }
            Err(e) => {
                warn!(
                    sender = sender.as_str(),
                    error = ?e,
                    "Failed to look up the device of a verification start event"
                );
                return;
            }
        };

        let ids = match self.load_ids(device).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    sender = sender.as_str(),
                    error = ?e,
                    "Failed to load the identities for a verification start event"
                );
                return;
            }
        };

        match Sas::from_start_event(
            ids,
            content.clone(),
            self.settings.clone(),
            self.transport.clone(),
            self.store.clone(),
            self.signing.clone(),
        ) {
            Ok(sas) => {
                info!(
                    sender = sender.as_str(),
                    device_id = content.from_device.as_str(),
                    flow_id = content.transaction_id.as_str(),
                    "Started a new incoming SAS verification flow"
                );

                self.verifications.insert(content.transaction_id.clone(), sas);
            }
            Err(code) => {
                warn!(
                    sender = sender.as_str(),
                    device_id = content.from_device.as_str(),
                    code = code.as_str(),
                    "Can't answer the verification start event, cancelling"
                );

                let cancel = CancelContent {
                    transaction_id: content.transaction_id.clone(),
                    reason: code.reason().to_owned(),
                    code,
                };

                if let Err(e) =
                    self.transport.send(sender, &content.from_device, &cancel.into()).await
                {
                    warn!(
                        sender = sender.as_str(),
                        error = ?e,
                        "Failed to send the cancellation for a rejected start event"
                    );
                }
            }
        }
    }

    /// Cancel every flow that has been stalled for too long and drop the
    /// finished ones from the registry.
    ///
    /// This is meant to be driven by a periodic timer of the surrounding
    /// session manager.
    pub async fn garbage_collect(&self) {
        let verifications: Vec<Sas> =
            self.verifications.iter().map(|s| s.value().clone()).collect();

        for sas in verifications {
            sas.cancel_if_timed_out().await;
        }

        self.verifications.retain(|_, sas| !sas.is_terminal());
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};

    use super::*;
    use crate::{
        sas::TransactionState,
        store::MemoryStore,
        test_utils::{
            alice_account, bob_account, device_of, RecordingSigningService, RecordingTransport,
        },
    };

    struct TestMachine {
        machine: VerificationMachine,
        transport: Arc<RecordingTransport>,
        store: Arc<MemoryStore>,
    }

    fn machine_for(
        account: StaticAccountData,
        known_devices: &[DeviceData],
    ) -> TestMachine {
        let transport = Arc::new(RecordingTransport::new());
        let store = Arc::new(MemoryStore::new());
        let signing = Arc::new(RecordingSigningService::new());

        for device in known_devices {
            store.save_device(device.clone());
        }

        let machine = VerificationMachine::new(
            account,
            store.clone(),
            transport.clone(),
            signing.clone(),
        );

        TestMachine { machine, transport, store }
    }

    fn test_machines() -> (TestMachine, TestMachine) {
        let alice = machine_for(alice_account(), &[device_of(&bob_account())]);
        let bob = machine_for(bob_account(), &[device_of(&alice_account())]);

        (alice, bob)
    }

    /// Deliver everything one side sent to the other machine.
    async fn shuttle(from: &TestMachine, to: &TestMachine, sender: &ruma::UserId) {
        for content in from.transport.take_sent() {
            to.machine.receive_event(sender, content.event_type(), &content.to_json()).await;
        }
    }

    #[tokio::test]
    async fn machine_full_flow() {
        let (alice, bob) = test_machines();
        let alice_id = user_id!("@alice:example.org");
        let bob_id = user_id!("@bob:example.org");

        let alice_sas = alice.machine.start_sas(device_of(&bob_account())).await.unwrap();

        shuttle(&alice, &bob, alice_id).await;

        let bob_sas = bob.machine.get_sas(alice_sas.flow_id()).unwrap();
        bob_sas.accept().await;

        shuttle(&bob, &alice, bob_id).await;
        shuttle(&alice, &bob, alice_id).await;
        shuttle(&bob, &alice, bob_id).await;

        assert_eq!(alice_sas.emoji().unwrap(), bob_sas.emoji().unwrap());
        assert_eq!(alice_sas.decimals().unwrap(), bob_sas.decimals().unwrap());

        alice_sas.confirm().await;
        shuttle(&alice, &bob, alice_id).await;
        bob_sas.confirm().await;
        shuttle(&bob, &alice, bob_id).await;

        assert!(alice_sas.is_verified());
        assert!(bob_sas.is_verified());

        assert!(alice.store.is_device_verified(bob_id, device_id!("BOBDEVCIE")));
        assert!(bob.store.is_device_verified(alice_id, device_id!("JLAFKJWSCS")));
    }

    #[tokio::test]
    async fn a_second_start_for_a_live_flow_cancels_it() {
        let (alice, bob) = test_machines();
        let alice_id = user_id!("@alice:example.org");

        let alice_sas = alice.machine.start_sas(device_of(&bob_account())).await.unwrap();
        let start = alice.transport.take_sent().pop().unwrap();

        bob.machine.receive_event(alice_id, start.event_type(), &start.to_json()).await;
        bob.machine.receive_event(alice_id, start.event_type(), &start.to_json()).await;

        let bob_sas = bob.machine.get_sas(alice_sas.flow_id()).unwrap();
        assert!(bob_sas.is_cancelled());
        assert_eq!(
            bob_sas.cancel_info().unwrap().cancel_code(),
            &CancelCode::UnexpectedMessage
        );
    }

    #[tokio::test]
    async fn a_start_offering_nothing_usable_is_cancelled_without_a_flow() {
        let (alice, bob) = test_machines();
        let alice_id = user_id!("@alice:example.org");

        alice.machine.start_sas(device_of(&bob_account())).await.unwrap();
        let start = alice.transport.take_sent().pop().unwrap();

        let mut json = start.to_json();
        json["message_authentication_codes"] = serde_json::json!(["hmac-sha256"]);

        bob.machine.receive_event(alice_id, start.event_type(), &json).await;

        // No flow was created and no key was sent, only the cancellation.
        assert!(bob.machine.get_sas(start.transaction_id()).is_none());
        let sent = bob.transport.take_sent();
        let code = assert_matches!(
            &sent[..],
            [AnyVerificationContent::Cancel(c)] => c.code.clone()
        );
        assert_eq!(code, CancelCode::UnknownMethod);
    }

    #[tokio::test]
    async fn a_start_from_an_unknown_device_is_ignored() {
        let (alice, bob) = test_machines();
        let alice_id = user_id!("@alice:example.org");

        alice.machine.start_sas(device_of(&bob_account())).await.unwrap();
        let start = alice.transport.take_sent().pop().unwrap();

        let mut json = start.to_json();
        json["from_device"] = serde_json::json!("NOSUCHDEVICE");

        bob.machine.receive_event(alice_id, start.event_type(), &json).await;

        assert!(bob.transport.take_sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_content_cancels_the_flow_it_names() {
        let (alice, bob) = test_machines();
        let alice_id = user_id!("@alice:example.org");
        let bob_id = user_id!("@bob:example.org");

        let alice_sas = alice.machine.start_sas(device_of(&bob_account())).await.unwrap();
        shuttle(&alice, &bob, alice_id).await;

        let bob_sas = bob.machine.get_sas(alice_sas.flow_id()).unwrap();
        bob_sas.accept().await;
        shuttle(&bob, &alice, bob_id).await;

        // A key event without the key field.
        let json = serde_json::json!({ "transaction_id": alice_sas.flow_id() });
        bob.machine.receive_event(alice_id, "m.key.verification.key", &json).await;

        assert!(bob_sas.is_cancelled());
        assert_eq!(
            bob_sas.cancel_info().unwrap().cancel_code(),
            &CancelCode::InvalidMessage
        );
    }

    #[tokio::test]
    async fn events_for_unknown_flows_are_ignored() {
        let (_, bob) = test_machines();
        let alice_id = user_id!("@alice:example.org");

        let json = serde_json::json!({ "transaction_id": "NOSUCHFLOW", "key": "AAAA" });
        bob.machine.receive_event(alice_id, "m.key.verification.key", &json).await;

        assert!(bob.transport.take_sent().is_empty());
    }

    #[tokio::test]
    async fn garbage_collection_cancels_stalled_flows() {
        let (alice, _) = test_machines();

        let alice_sas = alice.machine.start_sas(device_of(&bob_account())).await.unwrap();
        alice.transport.take_sent();

        alice.machine.garbage_collect().await;
        assert!(!alice_sas.is_terminal());

        alice_sas.set_creation_time(Instant::now() - Duration::from_secs(60 * 15)).await;
        alice.machine.garbage_collect().await;

        assert_matches!(alice_sas.state(), TransactionState::Cancelled(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::Timeout);
        });

        // The finished flow is dropped from the registry.
        assert!(alice.machine.get_sas(alice_sas.flow_id()).is_none());
    }
}
