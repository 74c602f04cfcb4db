// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Waitable primitives shared by every component of the job manager.
//!
//! An [Event] is a level-triggered flag backed by a non-blocking pipe, so that it can be combined with sockets and
//! other descriptors in a single [Waiter]. Everything a script can wait on implements [OutputObject].

mod event;
mod output_object;
mod waiter;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    event::Event,
    output_object::{
        Capabilities,
        FdOutputObject,
        OutputObject,
        SignalledStatus,
    },
    waiter::Waiter,
};
