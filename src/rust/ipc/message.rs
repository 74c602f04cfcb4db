// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::{
    atomic::{
        AtomicU64,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of message ids. Zero is reserved for "no id".
static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Unit of transfer over an IPC link.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Assigned on send if zero.
    pub id: u64,
    /// Id of the message this one answers, or zero.
    pub reply_to: u64,
    /// Marshalled payload, opaque to the link.
    pub payload: Vec<u8>,
    /// Out-of-band data referenced by the payload.
    pub blobs: Vec<Arc<Vec<u8>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn reply(reply_to: u64, payload: Vec<u8>) -> Self {
        Self {
            reply_to,
            payload,
            ..Default::default()
        }
    }

    pub fn with_blob(mut self, blob: Arc<Vec<u8>>) -> Self {
        self.blobs.push(blob);
        self
    }
}

/// Allocates a process-wide unique message id.
pub fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}
