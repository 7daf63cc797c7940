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

//! The transport contract the verification flow sends its messages
//! through.

use async_trait::async_trait;
use ruma::{DeviceId, UserId};

use crate::{error::TransportError, events::AnyVerificationContent};

/// Delivery of verification messages to the other device.
///
/// An implementation typically wraps a to-device message send over a
/// homeserver, but any end-to-end channel works; the state machine only
/// cares whether delivery was accepted. A send error cancels the
/// transaction.
#[async_trait]
pub trait VerificationTransport: Send + Sync {
    /// Send a verification message to the given device. Resolves once the
    /// message has been handed off for delivery.
    async fn send(
        &self,
        recipient: &UserId,
        recipient_device: &DeviceId,
        content: &AnyVerificationContent,
    ) -> Result<(), TransportError>;

    /// Signal that the flow with the given transaction id finished
    /// successfully on our side.
    async fn done(&self, transaction_id: &str) -> Result<(), TransportError>;
}
