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
    ipc::link::{
        create_ipc_link,
        IpcEndpoint,
    },
    runtime::fail::Fail,
};
use ::parking_lot::Mutex;
use ::std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Weak,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A listening port. Readable while connections wait to be accepted.
pub struct NamedPort {
    name: String,
    backlog: Mutex<VecDeque<IpcEndpoint>>,
    event: Event,
}

/// Directory of named ports. A name becomes free again once its port is dropped.
#[derive(Default)]
pub struct PortDirectory {
    ports: HashMap<String, Weak<NamedPort>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl NamedPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes the oldest pending connection. Connections whose other end went away before being accepted are
    /// discarded.
    pub fn accept(&self) -> Option<IpcEndpoint> {
        let mut backlog = self.backlog.lock();
        let mut accepted: Option<IpcEndpoint> = None;
        while let Some(endpoint) = backlog.pop_front() {
            if endpoint.is_broken() {
                trace!("accept(): dropping stale connection on port {}", self.name);
                continue;
            }
            accepted = Some(endpoint);
            break;
        }
        if backlog.is_empty() {
            self.event.reset();
        }
        accepted
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    fn push_connection(&self, endpoint: IpcEndpoint) {
        let mut backlog = self.backlog.lock();
        backlog.push_back(endpoint);
        if backlog.len() == 1 {
            self.event.signal();
        }
    }
}

impl PortDirectory {
    /// Registers a port under `name`.
    pub fn create(&mut self, name: &str) -> Result<Arc<NamedPort>, Fail> {
        if self.lookup(name).is_some() {
            let cause: String = format!("named port {} already exists", name);
            error!("create_named_port(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        let port: Arc<NamedPort> = Arc::new(NamedPort {
            name: name.to_string(),
            backlog: Mutex::new(VecDeque::new()),
            event: Event::new()?,
        });
        self.ports.insert(name.to_string(), Arc::downgrade(&port));
        Ok(port)
    }

    /// Connects to the port called `name`, returning our end of the new link.
    pub fn connect(&mut self, name: &str) -> Result<IpcEndpoint, Fail> {
        let port: Arc<NamedPort> = match self.lookup(name) {
            Some(port) => port,
            None => {
                let cause: String = format!("no named port {}", name);
                error!("connect_to_named_port(): {}", cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        };
        let (local, remote) = create_ipc_link()?;
        port.push_connection(remote);
        Ok(local)
    }

    fn lookup(&mut self, name: &str) -> Option<Arc<NamedPort>> {
        match self.ports.get(name).map(Weak::upgrade) {
            Some(Some(port)) => Some(port),
            Some(None) => {
                self.ports.remove(name);
                None
            },
            None => None,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl OutputObject for NamedPort {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READABLE
    }

    fn is_read_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::from(self.event.is_signalled())
    }

    fn add_to_waiter_read(&self, waiter: &mut Waiter) -> bool {
        self.event.add_to_waiter_read(waiter)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        NamedPort,
        PortDirectory,
    };
    use crate::{
        events::{
            OutputObject,
            SignalledStatus,
        },
        ipc::{
            IpcEndpoint,
            Message,
            SendResult,
        },
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn test_names_are_unique_until_dropped() -> Result<()> {
        let mut directory: PortDirectory = PortDirectory::default();
        let port: Arc<NamedPort> = directory.create("svc")?;
        crate::ensure_eq!(directory.create("svc").map(|_| ()).map_err(|e| e.errno), Err(libc::EEXIST));
        drop(port);
        crate::ensure_eq!(directory.create("svc").is_ok(), true);
        crate::ensure_eq!(directory.connect("other").map(|_| ()).map_err(|e| e.errno), Err(libc::ENOENT));
        Ok(())
    }

    #[test]
    fn test_connect_and_accept() -> Result<()> {
        let mut directory: PortDirectory = PortDirectory::default();
        let port: Arc<NamedPort> = directory.create("svc")?;
        crate::ensure_eq!(port.is_read_signalled(None), SignalledStatus::NotSignalled);

        let client: IpcEndpoint = directory.connect("svc")?;
        crate::ensure_eq!(port.is_read_signalled(None), SignalledStatus::Signalled);
        let server: IpcEndpoint = match port.accept() {
            Some(server) => server,
            None => anyhow::bail!("connection missing"),
        };
        crate::ensure_eq!(port.is_read_signalled(None), SignalledStatus::NotSignalled);

        let sent: SendResult = client.send_message(Message::new(b"ping".to_vec()), true);
        crate::ensure_eq!(matches!(sent, SendResult::Sent(_)), true);
        crate::ensure_eq!(server.receive_message().map(|m| m.payload), Some(b"ping".to_vec()));
        Ok(())
    }

    #[test]
    fn test_accept_skips_abandoned_connections() -> Result<()> {
        let mut directory: PortDirectory = PortDirectory::default();
        let port: Arc<NamedPort> = directory.create("svc")?;
        drop(directory.connect("svc")?);
        let _live: IpcEndpoint = directory.connect("svc")?;
        crate::ensure_eq!(port.backlog_len(), 2);
        crate::ensure_eq!(port.accept().is_some(), true);
        crate::ensure_eq!(port.backlog_len(), 0);
        crate::ensure_eq!(port.accept().is_none(), true);
        Ok(())
    }
}
