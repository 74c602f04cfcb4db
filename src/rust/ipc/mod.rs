// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Message links between groups.
//!
//! A link is a pair of endpoints with one bounded mailbox per direction. Named ports let a group publish a
//! well-known name that others connect to. Endpoints and ports are output objects, so they can be waited on together
//! with any other handle.

mod link;
mod message;
mod port;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    link::{
        create_ipc_link,
        IpcEndpoint,
        SendResult,
        MAX_QUEUED_MESSAGES,
    },
    message::{
        next_message_id,
        Message,
    },
    port::{
        NamedPort,
        PortDirectory,
    },
};
