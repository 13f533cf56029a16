use crate::network::{Client, ClientFlags, ClientId};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Point-in-time view of one client, for logging and inspection.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub addr: Option<SocketAddr>,
    pub fd: RawFd,
    pub age: Duration,
    pub idle: Duration,
    pub flags: ClientFlags,
    pub query_len: usize,
    pub pending_reply_bytes: usize,
    pub commands_processed: u64,
}

/// Every live client plus the pending-write and pending-read queues.
///
/// Queues hold ids. Freeing a client only removes it from the map; ids left
/// in a queue no longer resolve and are skipped when popped. Ids are never
/// reused, so a stale entry can never reach a newer client.
pub struct ClientRegistry<S> {
    clients: HashMap<ClientId, Client<S>>,
    pending_write: VecDeque<ClientId>,
    pending_read: VecDeque<ClientId>,
    next_client_id: u64,
}

impl<S> ClientRegistry<S> {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            pending_write: VecDeque::new(),
            pending_read: VecDeque::new(),
            next_client_id: 1,
        }
    }

    pub fn next_id(&mut self) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        id
    }

    pub fn insert(&mut self, client: Client<S>) {
        self.clients.insert(client.id(), client);
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client<S>> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client<S>> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client<S>> {
        self.clients.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Put a client on the pending-write queue unless it is already there.
    pub fn queue_write(&mut self, id: ClientId) -> bool {
        self.queue(id, ClientFlags::PENDING_WRITE)
    }

    /// Put a client on the pending-read queue unless it is already there.
    pub fn queue_read(&mut self, id: ClientId) -> bool {
        self.queue(id, ClientFlags::PENDING_READ)
    }

    /// Record that `id` was already flagged pending-write by its own reply
    /// path and only needs the queue entry.
    pub(crate) fn push_flagged_write(&mut self, id: ClientId) {
        self.pending_write.push_back(id);
    }

    fn queue(&mut self, id: ClientId, flag: ClientFlags) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        if client.flags().contains(flag) {
            return false;
        }
        client.set_flags(flag);
        if flag == ClientFlags::PENDING_WRITE {
            self.pending_write.push_back(id);
        } else {
            self.pending_read.push_back(id);
        }
        true
    }

    /// Pop the next live pending-write client and clear its flag.
    pub fn pop_pending_write(&mut self) -> Option<ClientId> {
        while let Some(id) = self.pending_write.pop_front() {
            if let Some(client) = self.clients.get_mut(&id) {
                client.clear_flags(ClientFlags::PENDING_WRITE);
                return Some(id);
            }
        }
        None
    }

    /// Drain the pending-read queue, clearing every live client's flag.
    pub fn take_pending_reads(&mut self) -> Vec<ClientId> {
        let queued: Vec<ClientId> = self.pending_read.drain(..).collect();
        queued
            .into_iter()
            .filter(|id| match self.clients.get_mut(id) {
                Some(client) => {
                    client.clear_flags(ClientFlags::PENDING_READ);
                    true
                }
                None => false,
            })
            .collect()
    }

    pub fn has_pending_reads(&self) -> bool {
        !self.pending_read.is_empty()
    }

    pub fn pending_write_len(&self) -> usize {
        self.pending_write.len()
    }

    pub fn pending_read_len(&self) -> usize {
        self.pending_read.len()
    }

    /// Clients idle for longer than `timeout`, excluding replication links
    /// and clients still draining output.
    pub fn idle_clients(&self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|c| !c.flags().contains(ClientFlags::REPLICA))
            .filter(|c| !c.has_pending_output())
            .filter(|c| c.idle_time(now) > timeout)
            .map(|c| c.id())
            .collect()
    }

    pub fn client_info(&self, id: ClientId, now: Instant) -> Option<ClientInfo> {
        self.clients.get(&id).map(|c| ClientInfo {
            id: c.id(),
            addr: c.addr(),
            fd: c.fd(),
            age: c.age(now),
            idle: c.idle_time(now),
            flags: c.flags(),
            query_len: c.query_len(),
            pending_reply_bytes: c.pending_reply_bytes(),
            commands_processed: c.commands_processed(),
        })
    }

    pub fn all_client_info(&self, now: Instant) -> Vec<ClientInfo> {
        let mut ids = self.ids();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.client_info(id, now))
            .collect()
    }
}

impl<S> Default for ClientRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
