// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::{
        Capabilities,
        Event,
        OutputObject,
        SignalledStatus,
        Waiter,
    },
    ipc::message::{
        next_message_id,
        Message,
    },
    runtime::fail::Fail,
};
use ::parking_lot::Mutex;
use ::std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Mailbox size above which flow-controlled sends are refused.
pub const MAX_QUEUED_MESSAGES: usize = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendResult {
    /// Queued under the given id.
    Sent(u64),
    /// The other endpoint is gone.
    Gone,
    /// Flow control was requested and the peer's mailbox is full.
    LinkFull,
}

struct LinkState {
    /// `mailboxes[side]` holds the messages waiting to be received by endpoint `side`.
    mailboxes: [VecDeque<Message>; 2],
    alive: [bool; 2],
}

struct Link {
    state: Mutex<LinkState>,
    /// Signalled while endpoint `side` has mail or its peer is gone.
    readable: [Event; 2],
    /// Signalled while endpoint `side` may send without hitting flow control, or its peer is gone.
    writable: [Event; 2],
}

/// One end of an IPC link. Dropping it breaks the link for the peer once the peer has drained its mailbox.
pub struct IpcEndpoint {
    link: Arc<Link>,
    side: usize,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates a link and returns its two endpoints.
pub fn create_ipc_link() -> Result<(IpcEndpoint, IpcEndpoint), Fail> {
    let readable: [Event; 2] = [Event::new()?, Event::new()?];
    let writable: [Event; 2] = [Event::new_signalled()?, Event::new_signalled()?];
    let link: Arc<Link> = Arc::new(Link {
        state: Mutex::new(LinkState {
            mailboxes: [VecDeque::new(), VecDeque::new()],
            alive: [true, true],
        }),
        readable,
        writable,
    });
    Ok((
        IpcEndpoint {
            link: link.clone(),
            side: 0,
        },
        IpcEndpoint { link, side: 1 },
    ))
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IpcEndpoint {
    fn peer(&self) -> usize {
        1 - self.side
    }

    /// Queues a message for the peer. Assigns a fresh id if the message has none.
    pub fn send_message(&self, mut message: Message, flow_control: bool) -> SendResult {
        let peer: usize = self.peer();
        let mut state = self.link.state.lock();
        if !state.alive[peer] {
            return SendResult::Gone;
        }
        let mailbox: &mut VecDeque<Message> = &mut state.mailboxes[peer];
        if flow_control && mailbox.len() >= MAX_QUEUED_MESSAGES {
            return SendResult::LinkFull;
        }
        if message.id == 0 {
            message.id = next_message_id();
        }
        let id: u64 = message.id;
        mailbox.push_back(message);
        if mailbox.len() == 1 {
            self.link.readable[peer].signal();
        }
        if mailbox.len() >= MAX_QUEUED_MESSAGES {
            self.link.writable[self.side].reset();
        }
        SendResult::Sent(id)
    }

    /// Takes the oldest message from this endpoint's mailbox.
    pub fn receive_message(&self) -> Option<Message> {
        let peer: usize = self.peer();
        let mut state = self.link.state.lock();
        let message: Message = state.mailboxes[self.side].pop_front()?;
        let remaining: usize = state.mailboxes[self.side].len();
        if remaining == 0 && state.alive[peer] {
            self.link.readable[self.side].reset();
        }
        if remaining < MAX_QUEUED_MESSAGES {
            self.link.writable[peer].signal();
        }
        Some(message)
    }

    /// Whether the peer is gone and every message it sent has been received.
    pub fn is_broken(&self) -> bool {
        let state = self.link.state.lock();
        !state.alive[self.peer()] && state.mailboxes[self.side].is_empty()
    }

    /// Number of messages waiting to be received by this endpoint.
    pub fn queued(&self) -> usize {
        self.link.state.lock().mailboxes[self.side].len()
    }

    /// Event that is signalled while a receive would not come back empty-handed or the link is broken.
    pub fn read_event(&self) -> &Event {
        &self.link.readable[self.side]
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl OutputObject for IpcEndpoint {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READABLE | Capabilities::WRITABLE
    }

    fn is_read_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::from(self.link.readable[self.side].is_signalled())
    }

    fn is_write_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::from(self.link.writable[self.side].is_signalled())
    }

    fn add_to_waiter_read(&self, waiter: &mut Waiter) -> bool {
        self.link.readable[self.side].add_to_waiter_read(waiter)
    }

    fn add_to_waiter_write(&self, waiter: &mut Waiter) -> bool {
        self.link.writable[self.side].add_to_waiter_read(waiter)
    }
}

impl Drop for IpcEndpoint {
    fn drop(&mut self) {
        let peer: usize = self.peer();
        let mut state = self.link.state.lock();
        state.alive[self.side] = false;
        // Nobody will ever receive these.
        state.mailboxes[self.side].clear();
        self.link.readable[peer].signal();
        self.link.writable[peer].signal();
    }
}

impl fmt::Debug for IpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcEndpoint(side={}, queued={})", self.side, self.queued())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        create_ipc_link,
        SendResult,
        MAX_QUEUED_MESSAGES,
    };
    use crate::{
        events::{
            OutputObject,
            SignalledStatus,
        },
        ipc::Message,
    };
    use ::anyhow::Result;

    #[test]
    fn test_mailbox_is_bounded_and_fifo() -> Result<()> {
        let (a, b) = create_ipc_link()?;
        for i in 0..MAX_QUEUED_MESSAGES {
            match a.send_message(Message::new(vec![i as u8]), true) {
                SendResult::Sent(_) => (),
                other => anyhow::bail!("send {} failed with {:?}", i, other),
            }
        }
        crate::ensure_eq!(a.send_message(Message::new(vec![0xff]), true), SendResult::LinkFull);
        crate::ensure_eq!(a.is_write_signalled(None), SignalledStatus::NotSignalled);

        for i in 0..MAX_QUEUED_MESSAGES {
            match b.receive_message() {
                Some(message) => crate::ensure_eq!(message.payload, vec![i as u8]),
                None => anyhow::bail!("message {} missing", i),
            }
        }
        crate::ensure_eq!(b.receive_message().is_none(), true);
        crate::ensure_eq!(a.is_write_signalled(None), SignalledStatus::Signalled);
        Ok(())
    }

    #[test]
    fn test_send_without_flow_control_ignores_limit() -> Result<()> {
        let (a, b) = create_ipc_link()?;
        for _ in 0..MAX_QUEUED_MESSAGES + 5 {
            crate::ensure_neq!(a.send_message(Message::new(Vec::new()), false), SendResult::LinkFull);
        }
        crate::ensure_eq!(b.queued(), MAX_QUEUED_MESSAGES + 5);
        Ok(())
    }

    #[test]
    fn test_messages_survive_peer_death() -> Result<()> {
        let (a, b) = create_ipc_link()?;
        let id: u64 = match a.send_message(Message::new(b"hello".to_vec()), true) {
            SendResult::Sent(id) => id,
            other => anyhow::bail!("send failed with {:?}", other),
        };
        crate::ensure_neq!(id, 0);
        drop(a);

        crate::ensure_eq!(b.is_broken(), false);
        crate::ensure_eq!(b.is_read_signalled(None), SignalledStatus::Signalled);
        let message: Message = match b.receive_message() {
            Some(message) => message,
            None => anyhow::bail!("message lost"),
        };
        crate::ensure_eq!(message.id, id);
        crate::ensure_eq!(message.payload, b"hello".to_vec());
        crate::ensure_eq!(b.is_broken(), true);
        // A broken link stays readable so that waiters notice.
        crate::ensure_eq!(b.is_read_signalled(None), SignalledStatus::Signalled);
        crate::ensure_eq!(b.send_message(Message::new(Vec::new()), false), SendResult::Gone);
        Ok(())
    }

    #[test]
    fn test_read_event_follows_mailbox() -> Result<()> {
        let (a, b) = create_ipc_link()?;
        crate::ensure_eq!(b.is_read_signalled(None), SignalledStatus::NotSignalled);
        a.send_message(Message::reply(7, Vec::new()), false);
        crate::ensure_eq!(b.is_read_signalled(None), SignalledStatus::Signalled);
        crate::ensure_eq!(b.receive_message().map(|m| m.reply_to), Some(7));
        crate::ensure_eq!(b.is_read_signalled(None), SignalledStatus::NotSignalled);
        Ok(())
    }
}
