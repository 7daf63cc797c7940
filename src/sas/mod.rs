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

//! Short authentication string verification.

mod engine;
mod helpers;
mod protocols;
mod transaction;

use std::sync::Arc;

use eyeball::SharedObservable;
use futures_core::Stream;
use ruma::{DeviceId, UserId};
use tracing::{trace, warn};

pub use protocols::{
    AcceptSettings, AcceptedProtocols, HashAlgorithm, KeyAgreementProtocol,
    MessageAuthenticationCode, ShortAuthenticationString, SupportedMacMethod, VerificationMethod,
};
pub use transaction::{EmojiShortAuthString, TransactionState};

pub(crate) use helpers::SasIds;
use transaction::SasTransaction;

use crate::{
    emoji::Emoji,
    error::{CancelCode, CancelInfo},
    events::{AnyVerificationContent, StartContent},
    identities::{CrossSigningService, DeviceData, IdentityStore},
    transport::VerificationTransport,
};

/// A handle to an in-flight short authentication string verification.
///
/// One `Sas` drives exactly one transaction with one other device. All
/// message dispatch for the transaction is serialized through it, user
/// decisions ([`confirm`], [`mismatch`], [`cancel`]) included. The current
/// lifecycle state can be read with [`state`] or followed as a stream with
/// [`changes`].
///
/// [`confirm`]: Sas::confirm
/// [`mismatch`]: Sas::mismatch
/// [`cancel`]: Sas::cancel
/// [`state`]: Sas::state
/// [`changes`]: Sas::changes
#[derive(Clone)]
pub struct Sas {
    inner: Arc<SasInner>,
}

struct SasInner {
    transaction: tokio::sync::Mutex<SasTransaction>,
    observable: SharedObservable<TransactionState>,
    ids: SasIds,
    flow_id: String,
    we_started: bool,
    transport: Arc<dyn VerificationTransport>,
    store: Arc<dyn IdentityStore>,
    signing: Arc<dyn CrossSigningService>,
}

impl std::fmt::Debug for Sas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sas")
            .field("flow_id", &self.inner.flow_id)
            .field("user_id", &self.inner.ids.account.user_id)
            .field("other_user_id", &self.inner.ids.other_device.user_id())
            .field("we_started", &self.inner.we_started)
            .field("state", &self.inner.observable.get())
            .finish()
    }
}

impl Sas {
    /// Create a new outgoing verification flow. The start message goes out
    /// once the flow is driven with [`send_start`](Self::send_start).
    pub(crate) fn start(
        ids: SasIds,
        flow_id: String,
        settings: AcceptSettings,
        transport: Arc<dyn VerificationTransport>,
        store: Arc<dyn IdentityStore>,
        signing: Arc<dyn CrossSigningService>,
    ) -> Self {
        let transaction = SasTransaction::start(ids.clone(), flow_id.clone(), settings);
        let observable = SharedObservable::new(transaction.state().clone());

        Self {
            inner: Arc::new(SasInner {
                transaction: tokio::sync::Mutex::new(transaction),
                observable,
                ids,
                flow_id,
                we_started: true,
                transport,
                store,
                signing,
            }),
        }
    }

    /// Create a new incoming verification flow from a received
    /// `m.key.verification.start` message.
    ///
    /// An offer we cannot serve is rejected before a flow exists; the
    /// caller has to send the returned cancel code to the other side.
    pub(crate) fn from_start_event(
        ids: SasIds,
        content: StartContent,
        settings: AcceptSettings,
        transport: Arc<dyn VerificationTransport>,
        store: Arc<dyn IdentityStore>,
        signing: Arc<dyn CrossSigningService>,
    ) -> Result<Self, CancelCode> {
        let flow_id = content.transaction_id.clone();
        let transaction = SasTransaction::from_start_event(ids.clone(), content, settings)?;
        let observable = SharedObservable::new(transaction.state().clone());

        Ok(Self {
            inner: Arc::new(SasInner {
                transaction: tokio::sync::Mutex::new(transaction),
                observable,
                ids,
                flow_id,
                we_started: false,
                transport,
                store,
                signing,
            }),
        })
    }

    /// Get our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.inner.ids.account.user_id
    }

    /// Get our own device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.ids.account.device_id
    }

    /// Get the user id of the other side.
    pub fn other_user_id(&self) -> &UserId {
        self.inner.ids.other_device.user_id()
    }

    /// Get the device id of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        self.inner.ids.other_device.device_id()
    }

    /// Get the device of the other side.
    pub fn other_device(&self) -> &DeviceData {
        &self.inner.ids.other_device
    }

    /// The unique id of this verification flow.
    pub fn flow_id(&self) -> &str {
        &self.inner.flow_id
    }

    /// Did we initiate the verification flow.
    pub fn we_started(&self) -> bool {
        self.inner.we_started
    }

    /// Is this flow verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.inner.ids.account.user_id == *self.inner.ids.other_device.user_id()
    }

    /// The current lifecycle state of the flow.
    pub fn state(&self) -> TransactionState {
        self.inner.observable.get()
    }

    /// Listen for changes in the state of the flow.
    ///
    /// Every state assignment is emitted, the transient sending states
    /// included.
    pub fn changes(&self) -> impl Stream<Item = TransactionState> {
        self.inner.observable.subscribe()
    }

    /// Is the flow done, successfully or not.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Did the flow finish successfully.
    pub fn is_verified(&self) -> bool {
        self.state().is_verified()
    }

    /// Has the flow been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Information about the cancellation, if the flow has been cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match self.state() {
            TransactionState::Cancelled(info) | TransactionState::PeerCancelled(info) => {
                Some(info)
            }
            _ => None,
        }
    }

    /// Get the emoji version of the short authentication string, once it
    /// can be presented to the user.
    ///
    /// Returns `None` before the keys have been exchanged and when the
    /// emoji representation wasn't part of the negotiated set.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        match self.state() {
            TransactionState::ShortCodeReady { emojis: Some(e), .. } => Some(e.emojis),
            _ => None,
        }
    }

    /// Get the indices of the emojis of the short authentication string,
    /// once it can be presented to the user.
    pub fn emoji_index(&self) -> Option<[u8; 7]> {
        match self.state() {
            TransactionState::ShortCodeReady { emojis: Some(e), .. } => Some(e.indices),
            _ => None,
        }
    }

    /// Get the decimal version of the short authentication string, once it
    /// can be presented to the user.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        match self.state() {
            TransactionState::ShortCodeReady { decimals, .. } => Some(decimals),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_creation_time(&self, time: std::time::Instant) {
        self.inner.transaction.lock().await.set_creation_time(time);
    }

    fn publish(&self, transaction: &SasTransaction) {
        self.inner.observable.set(transaction.state().clone());
    }

    /// Send a message to the other device. A delivery failure cancels the
    /// transaction; the return value says whether delivery was accepted.
    async fn deliver(
        &self,
        transaction: &mut SasTransaction,
        content: AnyVerificationContent,
    ) -> bool {
        let result = self
            .inner
            .transport
            .send(self.other_user_id(), self.other_device_id(), &content)
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    flow_id = self.flow_id(),
                    error = ?e,
                    "Failed to send a verification message, cancelling"
                );
                self.cancel_locked(transaction, CancelCode::UnexpectedMessage).await;
                false
            }
        }
    }

    async fn cancel_locked(&self, transaction: &mut SasTransaction, code: CancelCode) {
        if let Some(content) = transaction.cancel(code) {
            self.publish(transaction);

            if let Err(e) = self
                .inner
                .transport
                .send(self.other_user_id(), self.other_device_id(), &content.into())
                .await
            {
                warn!(
                    flow_id = self.flow_id(),
                    error = ?e,
                    "Failed to notify the other side of the cancellation"
                );
            }
        }
    }

    /// Send out the start message of an outgoing flow.
    pub(crate) async fn send_start(&self) {
        let mut transaction = self.inner.transaction.lock().await;

        match transaction.begin_sending_start() {
            Ok(content) => {
                self.publish(&transaction);

                if self.deliver(&mut transaction, content.into()).await {
                    transaction.mark_start_sent();
                    self.publish(&transaction);
                }
            }
            Err(code) => self.cancel_locked(&mut transaction, code).await,
        }
    }

    /// Accept an incoming verification flow.
    ///
    /// This binds the negotiated protocol set, computes the commitment and
    /// sends the accept message. Accepting anything but a freshly started
    /// incoming flow cancels it.
    pub async fn accept(&self) {
        let mut transaction = self.inner.transaction.lock().await;

        match transaction.begin_accept() {
            Ok(content) => {
                self.publish(&transaction);

                if self.deliver(&mut transaction, content.into()).await {
                    transaction.mark_accept_sent();
                    self.publish(&transaction);
                }
            }
            Err(code) => self.cancel_locked(&mut transaction, code).await,
        }
    }

    /// Confirm that the short authentication string matches.
    ///
    /// This needs to be done by the user; it sends our MAC message out and,
    /// if the other side confirmed before us, verifies their MAC right
    /// away.
    pub async fn confirm(&self) {
        let mut transaction = self.inner.transaction.lock().await;

        match transaction.confirm() {
            Ok(content) => {
                self.publish(&transaction);

                transaction.begin_sending_mac();
                self.publish(&transaction);

                if self.deliver(&mut transaction, content.into()).await {
                    transaction.mark_mac_sent();
                    self.publish(&transaction);

                    if transaction.has_their_mac() {
                        self.run_verification(&mut transaction).await;
                    }
                }
            }
            Err(code) => self.cancel_locked(&mut transaction, code).await,
        }
    }

    /// Declare that the short authentication strings do not match.
    ///
    /// Cancels the flow with `m.mismatched_sas`.
    pub async fn mismatch(&self) {
        self.cancel_with_code(CancelCode::MismatchedSas).await;
    }

    /// Cancel the verification flow on behalf of the user.
    pub async fn cancel(&self) {
        self.cancel_with_code(CancelCode::User).await;
    }

    pub(crate) async fn cancel_with_code(&self, code: CancelCode) {
        let mut transaction = self.inner.transaction.lock().await;
        self.cancel_locked(&mut transaction, code).await;
    }

    /// Cancel the flow with `m.timeout` if it has been stalled for too
    /// long.
    pub(crate) async fn cancel_if_timed_out(&self) {
        let mut transaction = self.inner.transaction.lock().await;

        if transaction.timed_out() {
            self.cancel_locked(&mut transaction, CancelCode::Timeout).await;
        }
    }

    /// Dispatch a received verification message into the state machine.
    pub(crate) async fn receive_any_event(
        &self,
        sender: &UserId,
        content: &AnyVerificationContent,
    ) {
        let mut transaction = self.inner.transaction.lock().await;

        let old_state = transaction.state().clone();

        if sender != self.other_user_id() {
            self.cancel_locked(&mut transaction, CancelCode::UnexpectedMessage).await;
            return;
        }

        match content {
            AnyVerificationContent::Start(_) => {
                // A second start for a transaction that is already running.
                self.cancel_locked(&mut transaction, CancelCode::UnexpectedMessage).await;
            }
            AnyVerificationContent::Accept(c) => match transaction.receive_accept(c) {
                Ok(key) => {
                    self.publish(&transaction);

                    transaction.begin_sending_key();
                    self.publish(&transaction);

                    if self.deliver(&mut transaction, key.into()).await {
                        transaction.mark_key_sent();
                        self.publish(&transaction);
                    }
                }
                Err(code) => self.cancel_locked(&mut transaction, code).await,
            },
            AnyVerificationContent::Key(c) => match transaction.receive_key(c) {
                Ok(Some(key)) => {
                    self.publish(&transaction);

                    transaction.begin_sending_key();
                    self.publish(&transaction);

                    if self.deliver(&mut transaction, key.into()).await {
                        transaction.mark_key_sent();
                        self.publish(&transaction);
                        self.derive_short_code(&mut transaction).await;
                    }
                }
                Ok(None) => {
                    self.publish(&transaction);
                    self.derive_short_code(&mut transaction).await;
                }
                Err(code) => self.cancel_locked(&mut transaction, code).await,
            },
            AnyVerificationContent::Mac(c) => match transaction.receive_mac(c) {
                Ok(true) => self.run_verification(&mut transaction).await,
                Ok(false) => {
                    trace!(
                        flow_id = self.flow_id(),
                        "Received the other side's MAC before the user confirmed, deferring"
                    );
                }
                Err(code) => self.cancel_locked(&mut transaction, code).await,
            },
            AnyVerificationContent::Cancel(c) => {
                transaction.receive_cancel(c);
                self.publish(&transaction);
            }
            AnyVerificationContent::Done(_) => {
                if let Err(code) = transaction.receive_done() {
                    self.cancel_locked(&mut transaction, code).await;
                }
            }
        }

        trace!(
            flow_id = self.flow_id(),
            ?old_state,
            new_state = ?transaction.state(),
            "SAS received an event and changed its state"
        );
    }

    async fn derive_short_code(&self, transaction: &mut SasTransaction) {
        match transaction.derive_short_code() {
            Ok(()) => self.publish(transaction),
            Err(code) => self.cancel_locked(transaction, code).await,
        }
    }

    /// Check the other side's MAC and apply the trust side effects.
    ///
    /// The side effects are fire and forget: once both MACs matched the
    /// flow ends up verified even if a signature upload fails.
    async fn run_verification(&self, transaction: &mut SasTransaction) {
        let devices = match self.inner.store.get_user_devices(self.other_user_id()).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(
                    flow_id = self.flow_id(),
                    error = ?e,
                    "Failed to read the device catalog for the MAC check"
                );
                self.cancel_locked(transaction, CancelCode::UnexpectedMessage).await;
                return;
            }
        };

        let verified = match transaction.verify_their_mac(&devices) {
            Ok(verified) => verified,
            Err(code) => {
                self.cancel_locked(transaction, code).await;
                return;
            }
        };

        self.publish(transaction);

        for device_id in &verified.devices {
            if let Err(e) =
                self.inner.store.mark_device_verified(self.other_user_id(), device_id).await
            {
                warn!(
                    flow_id = self.flow_id(),
                    device_id = device_id.as_str(),
                    error = ?e,
                    "Failed to mark a device as verified"
                );
            }
        }

        let is_self_verification = self.is_self_verification();

        if verified.master_key_verified && !is_self_verification {
            if let Err(e) = self.inner.signing.trust_user(self.other_user_id()).await {
                warn!(
                    flow_id = self.flow_id(),
                    user_id = self.other_user_id().as_str(),
                    error = ?e,
                    "Failed to upload the cross-signing signature for the user"
                );
            }
        }

        if is_self_verification {
            if let Err(e) = self
                .inner
                .signing
                .sign_device(self.other_user_id(), self.other_device_id())
                .await
            {
                warn!(
                    flow_id = self.flow_id(),
                    device_id = self.other_device_id().as_str(),
                    error = ?e,
                    "Failed to upload the cross-signing signature for the device"
                );
            }
        }

        if let Err(e) = self.inner.transport.done(self.flow_id()).await {
            warn!(
                flow_id = self.flow_id(),
                error = ?e,
                "Failed to signal the end of the verification flow"
            );
        }

        transaction.mark_verified();
        self.publish(transaction);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures_util::StreamExt;
    use ruma::{device_id, user_id};

    use super::*;
    use crate::{
        identities::{CrossSigningInfo, StaticAccountData},
        store::MemoryStore,
        test_utils::{
            alice_account, bob_account, device_of, RecordingSigningService, RecordingTransport,
        },
    };

    struct TestSide {
        sas: Sas,
        transport: Arc<RecordingTransport>,
        store: Arc<MemoryStore>,
        signing: Arc<RecordingSigningService>,
    }

    fn ids(
        account: StaticAccountData,
        other: &StaticAccountData,
        own_identity: Option<CrossSigningInfo>,
        other_identity: Option<CrossSigningInfo>,
    ) -> SasIds {
        SasIds { account, own_identity, other_device: device_of(other), other_identity }
    }

    fn outgoing_side(ids: SasIds) -> TestSide {
        let transport = Arc::new(RecordingTransport::new());
        let store = Arc::new(MemoryStore::new());
        let signing = Arc::new(RecordingSigningService::new());

        store.save_device(ids.other_device.clone());

        let sas = Sas::start(
            ids,
            "T1".to_owned(),
            AcceptSettings::default(),
            transport.clone(),
            store.clone(),
            signing.clone(),
        );

        TestSide { sas, transport, store, signing }
    }

    fn incoming_side(ids: SasIds, start: StartContent) -> TestSide {
        let transport = Arc::new(RecordingTransport::new());
        let store = Arc::new(MemoryStore::new());
        let signing = Arc::new(RecordingSigningService::new());

        store.save_device(ids.other_device.clone());

        let sas = Sas::from_start_event(
            ids,
            start,
            AcceptSettings::default(),
            transport.clone(),
            store.clone(),
            signing.clone(),
        )
        .unwrap();

        TestSide { sas, transport, store, signing }
    }

    fn sent(transport: &RecordingTransport) -> AnyVerificationContent {
        let mut messages = transport.take_sent();
        assert_eq!(messages.len(), 1, "expected exactly one outgoing message");
        messages.pop().unwrap()
    }

    async fn started_pair() -> (TestSide, TestSide) {
        let alice_ids = ids(alice_account(), &bob_account(), None, None);
        let bob_ids = ids(bob_account(), &alice_account(), None, None);

        let alice = outgoing_side(alice_ids);
        alice.sas.send_start().await;

        let start = assert_matches!(sent(&alice.transport), AnyVerificationContent::Start(c) => c);
        let bob = incoming_side(bob_ids, start);

        (alice, bob)
    }

    /// Drive both sides to the point where the short code is on display.
    async fn exchanged_pair() -> (TestSide, TestSide) {
        let (alice, bob) = started_pair().await;

        bob.sas.accept().await;
        let accept = sent(&bob.transport);
        alice.sas.receive_any_event(bob.sas.user_id(), &accept).await;

        let alice_key = sent(&alice.transport);
        bob.sas.receive_any_event(alice.sas.user_id(), &alice_key).await;

        let bob_key = sent(&bob.transport);
        alice.sas.receive_any_event(bob.sas.user_id(), &bob_key).await;

        (alice, bob)
    }

    #[tokio::test]
    async fn wrapper_full_flow() {
        let (alice, bob) = exchanged_pair().await;

        assert_matches!(alice.sas.state(), TransactionState::ShortCodeReady { .. });
        assert_matches!(bob.sas.state(), TransactionState::ShortCodeReady { .. });

        assert_eq!(alice.sas.emoji().unwrap(), bob.sas.emoji().unwrap());
        assert_eq!(alice.sas.decimals().unwrap(), bob.sas.decimals().unwrap());

        // Bob confirms first, his MAC arrives while Alice still shows the
        // short code.
        bob.sas.confirm().await;
        let bob_mac = sent(&bob.transport);
        alice.sas.receive_any_event(bob.sas.user_id(), &bob_mac).await;

        assert_matches!(alice.sas.state(), TransactionState::ShortCodeReady { .. });

        alice.sas.confirm().await;
        assert!(alice.sas.is_verified());

        let alice_mac = sent(&alice.transport);
        bob.sas.receive_any_event(alice.sas.user_id(), &alice_mac).await;
        assert!(bob.sas.is_verified());

        assert!(alice
            .store
            .is_device_verified(user_id!("@bob:example.org"), device_id!("BOBDEVCIE")));
        assert!(bob
            .store
            .is_device_verified(user_id!("@alice:example.org"), device_id!("JLAFKJWSCS")));

        assert_eq!(alice.transport.done_transactions(), ["T1"]);
        assert_eq!(bob.transport.done_transactions(), ["T1"]);

        assert!(alice.signing.trusted_users().is_empty());
        assert!(alice.signing.signed_devices().is_empty());
    }

    /// Build a pair where Bob attests his own trusted master key and Alice
    /// knows it, and drive it to the point where both confirmed.
    async fn master_key_pair() -> (TestSide, TestSide) {
        let master_key = "MasterKeyPublicPartInUnpaddedBase64Format00";

        let bob_identity = CrossSigningInfo::new(
            user_id!("@bob:example.org").to_owned(),
            master_key,
            true,
        );

        let alice_ids = ids(
            alice_account(),
            &bob_account(),
            None,
            Some(CrossSigningInfo::new(
                user_id!("@bob:example.org").to_owned(),
                master_key,
                false,
            )),
        );
        let bob_ids = ids(bob_account(), &alice_account(), Some(bob_identity), None);

        let alice = outgoing_side(alice_ids);
        alice.sas.send_start().await;
        let start = assert_matches!(sent(&alice.transport), AnyVerificationContent::Start(c) => c);
        let bob = incoming_side(bob_ids, start);

        bob.sas.accept().await;
        alice.sas.receive_any_event(bob.sas.user_id(), &sent(&bob.transport)).await;
        bob.sas.receive_any_event(alice.sas.user_id(), &sent(&alice.transport)).await;
        alice.sas.receive_any_event(bob.sas.user_id(), &sent(&bob.transport)).await;

        (alice, bob)
    }

    #[tokio::test]
    async fn a_verified_master_key_requests_user_trust() {
        let (alice, bob) = master_key_pair().await;

        bob.sas.confirm().await;
        alice.sas.receive_any_event(bob.sas.user_id(), &sent(&bob.transport)).await;
        alice.sas.confirm().await;

        let state = alice.sas.state();
        assert_matches!(state, TransactionState::Verified { master_key_verified: true, .. });
        assert_eq!(alice.signing.trusted_users(), [user_id!("@bob:example.org").to_owned()]);
    }

    #[tokio::test]
    async fn a_failed_signature_upload_keeps_the_flow_verified() {
        let (alice, bob) = master_key_pair().await;

        alice.signing.fail_uploads();

        bob.sas.confirm().await;
        alice.sas.receive_any_event(bob.sas.user_id(), &sent(&bob.transport)).await;
        alice.sas.confirm().await;

        assert!(alice.sas.is_verified());
        assert!(alice.signing.trusted_users().is_empty());
    }

    #[tokio::test]
    async fn a_self_verification_signs_the_other_device() {
        let mut other_account = alice_account();
        other_account.device_id = device_id!("ALICESECOND").to_owned();
        other_account.ed25519_key = "1/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4".to_owned();

        let alice_ids = ids(alice_account(), &other_account, None, None);
        let other_ids = ids(other_account.clone(), &alice_account(), None, None);

        let alice = outgoing_side(alice_ids);
        alice.sas.send_start().await;
        let start = assert_matches!(sent(&alice.transport), AnyVerificationContent::Start(c) => c);
        let other = incoming_side(other_ids, start);

        other.sas.accept().await;
        alice.sas.receive_any_event(other.sas.user_id(), &sent(&other.transport)).await;
        other.sas.receive_any_event(alice.sas.user_id(), &sent(&alice.transport)).await;
        alice.sas.receive_any_event(other.sas.user_id(), &sent(&other.transport)).await;

        other.sas.confirm().await;
        alice.sas.receive_any_event(other.sas.user_id(), &sent(&other.transport)).await;
        alice.sas.confirm().await;

        assert!(alice.sas.is_verified());
        assert_eq!(
            alice.signing.signed_devices(),
            [(
                user_id!("@alice:example.org").to_owned(),
                device_id!("ALICESECOND").to_owned()
            )]
        );
        assert!(alice.signing.trusted_users().is_empty());
    }

    #[tokio::test]
    async fn a_failed_send_cancels_the_flow() {
        let alice_ids = ids(alice_account(), &bob_account(), None, None);
        let alice = outgoing_side(alice_ids);

        alice.transport.fail_sends();
        alice.sas.send_start().await;

        let info = alice.sas.cancel_info().unwrap();
        assert_eq!(info.cancel_code(), &CancelCode::UnexpectedMessage);
        assert!(info.cancelled_by_us());
    }

    #[tokio::test]
    async fn a_peer_cancellation_is_observable() {
        let (alice, _bob) = started_pair().await;

        let cancel = AnyVerificationContent::Cancel(crate::events::CancelContent {
            transaction_id: "T1".to_owned(),
            code: CancelCode::User,
            reason: "The user cancelled the verification.".to_owned(),
        });

        alice.sas.receive_any_event(user_id!("@bob:example.org"), &cancel).await;

        let info = alice.sas.cancel_info().unwrap();
        assert_eq!(info.cancel_code(), &CancelCode::User);
        assert!(!info.cancelled_by_us());

        // Nothing goes back out for a cancellation of the other side.
        assert!(alice.transport.take_sent().is_empty());
    }

    #[tokio::test]
    async fn a_message_from_the_wrong_sender_cancels_the_flow() {
        let (alice, bob) = exchanged_pair().await;

        bob.sas.confirm().await;
        let bob_mac = sent(&bob.transport);

        alice.sas.receive_any_event(user_id!("@mallory:example.org"), &bob_mac).await;

        assert!(alice.sas.is_cancelled());
    }

    #[tokio::test]
    async fn state_changes_are_streamed() {
        let (alice, bob) = started_pair().await;

        let mut changes = alice.sas.changes();

        bob.sas.accept().await;
        alice.sas.receive_any_event(bob.sas.user_id(), &sent(&bob.transport)).await;

        // Rapid transitions coalesce, a subscriber polling late observes
        // the newest state.
        assert_matches!(changes.next().await.unwrap(), TransactionState::KeySent);

        bob.sas.receive_any_event(alice.sas.user_id(), &sent(&alice.transport)).await;
        alice.sas.receive_any_event(bob.sas.user_id(), &sent(&bob.transport)).await;

        assert_matches!(
            changes.next().await.unwrap(),
            TransactionState::ShortCodeReady { .. }
        );
    }

    #[tokio::test]
    async fn a_short_code_mismatch_cancels_the_flow() {
        let (alice, bob) = exchanged_pair().await;

        alice.sas.mismatch().await;

        let info = alice.sas.cancel_info().unwrap();
        assert_eq!(info.cancel_code(), &CancelCode::MismatchedSas);
        assert!(info.cancelled_by_us());

        // The other side is told about it.
        let cancel = sent(&alice.transport);
        bob.sas.receive_any_event(alice.sas.user_id(), &cancel).await;
        assert!(bob.sas.is_cancelled());
    }

    #[tokio::test]
    async fn confirming_too_early_cancels_the_flow() {
        let (alice, _bob) = started_pair().await;

        alice.sas.confirm().await;

        let info = alice.sas.cancel_info().unwrap();
        assert_eq!(info.cancel_code(), &CancelCode::UnexpectedMessage);
    }
}
