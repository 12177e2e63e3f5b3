// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Opaque payload codec.
//!
//! Local gRPC clients carry payloads as `google.protobuf.Any`; on the bus
//! the same payload travels as a JSON object with the byte buffer base64
//! encoded. The body is never decoded here, only re-shaped, so the round
//! trip is bitwise.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use prost_types::Any;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Bus-side form of an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusPayload {
    /// The wire `type_url` of the payload.
    pub object_type: String,
    /// base64 of the payload bytes.
    pub value: String,
    /// Identity id of the publishing agent, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload value is not valid base64")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Packs a wire payload for the bus. A missing payload packs as an empty
/// object so the event itself still traverses.
pub fn to_bus(payload: Option<&Any>, source_id: Option<Uuid>) -> BusPayload {
    match payload {
        Some(any) => BusPayload {
            object_type: any.type_url.clone(),
            value: BASE64.encode(&any.value),
            source_id,
        },
        None => BusPayload {
            object_type: String::new(),
            value: String::new(),
            source_id,
        },
    }
}

/// Unpacks a bus payload back into wire form.
pub fn from_bus(payload: &BusPayload) -> Result<Any, PayloadError> {
    Ok(Any {
        type_url: payload.object_type.clone(),
        value: BASE64.decode(&payload.value)?,
    })
}
