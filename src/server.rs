use crate::client_registry::{ClientInfo, ClientRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::ReadDispatcher;
use crate::network::{Client, ClientFlags, ClientId, ReadOutcome, Stream};
use crate::protocol::{CommandHandler, ProtocolError};
use crate::reactor::{EventLoop, Mask, MioPoller, Poller, TimerId};
use mio::net::{TcpListener, TcpStream};
use nix::sys::socket::{setsockopt, sockopt};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a registration on the event loop belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Listener,
    Client(ClientId),
    Cron,
}

/// Event loop driving a [`Server`].
pub type ServerLoop<S = TcpStream> = EventLoop<Server<S>, EventSource>;

/// Cron runs between two statistics log lines.
const STATS_EVERY_SECS: u64 = 5;

/// Server state threaded through every reactor callback.
pub struct Server<S = TcpStream> {
    config: Config,
    registry: ClientRegistry<S>,
    commands: Box<dyn CommandHandler<S>>,
    dispatcher: Option<ReadDispatcher<S>>,
    listener: Option<TcpListener>,
    cron_loops: u64,
    stat_connections: u64,
    stat_rejected: u64,
}

impl<S: Stream> Server<S> {
    /// Create a server without a listener. Clients are added with
    /// [`create_client`](Self::create_client).
    pub fn new(config: Config, commands: Box<dyn CommandHandler<S>>) -> Result<Self> {
        config.validate()?;

        let cpus = num_cpus::get();
        let shards = config.resolve_io_threads(cpus);
        let dispatcher = if shards > 1 {
            info!("Detected {} CPUs, reading sockets on {} shards", cpus, shards);
            Some(ReadDispatcher::new(shards, config.io_threads_cpu_affinity)?)
        } else {
            info!("Detected {} CPUs, socket reads stay on the reactor thread", cpus);
            None
        };

        Ok(Self {
            config,
            registry: ClientRegistry::new(),
            commands,
            dispatcher,
            listener: None,
            cron_loops: 0,
            stat_connections: 0,
            stat_rejected: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of read shards, 1 when the dispatcher is off.
    pub fn io_shards(&self) -> usize {
        self.dispatcher.as_ref().map_or(1, |d| d.shards())
    }

    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }

    pub fn client(&self, id: ClientId) -> Option<&Client<S>> {
        self.registry.get(id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client<S>> {
        self.registry.get_mut(id)
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.registry.all_client_info(Instant::now())
    }

    pub fn pending_read_len(&self) -> usize {
        self.registry.pending_read_len()
    }

    pub fn pending_write_len(&self) -> usize {
        self.registry.pending_write_len()
    }

    /// Create an event loop sized for `max_clients` over the given poller,
    /// with the sleep hooks and the cron timer installed.
    pub fn event_loop_with(&self, poller: Box<dyn Poller>) -> ServerLoop<S> {
        let mut el = EventLoop::new(self.config.event_loop_set_size(), poller);
        el.set_before_sleep(Some(before_sleep::<S>));
        el.set_after_sleep(None);
        el.add_timer(Duration::ZERO, server_cron::<S>, EventSource::Cron);
        el
    }

    /// Register a connected stream as a new client.
    pub fn create_client(
        &mut self,
        el: &mut ServerLoop<S>,
        stream: S,
        addr: Option<SocketAddr>,
    ) -> Result<ClientId> {
        let id = self.registry.next_id();
        let mut client = Client::new(id, stream, addr, self.config.max_reply_buffer)
            .with_query_limit(self.config.max_query_buffer);
        let fd = client.fd();

        if let Err(e) = el.add_file_event(
            fd,
            Mask::READABLE,
            read_query_from_client::<S>,
            EventSource::Client(id),
        ) {
            if matches!(e, Error::FdOutOfRange { .. }) {
                let _ = client.stream_mut().write(&Error::MaxClients.to_resp());
            }
            return Err(e);
        }

        self.registry.insert(client);
        self.stat_connections += 1;
        debug!("Client {} registered on fd {}", id, fd);
        Ok(id)
    }

    /// Deregister and close a client. Unknown ids are ignored.
    pub fn free_client(&mut self, el: &mut ServerLoop<S>, id: ClientId) {
        let Some(client) = self.registry.remove(id) else {
            return;
        };
        // Deregister before the stream is dropped and the fd closed.
        if let Err(e) = el.del_file_event(client.fd(), Mask::READABLE | Mask::WRITABLE) {
            debug!("Deregistering client {} failed: {}", id, e);
        }
        debug!(
            "Client {} closed (fd {}, {} commands)",
            id,
            client.fd(),
            client.commands_processed()
        );
    }

    /// Queue a client for a deferred read before the next sleep.
    pub fn postpone_read(&mut self, id: ClientId) -> bool {
        self.registry.queue_read(id)
    }

    fn read_client_now(&mut self, el: &mut ServerLoop<S>, id: ClientId) {
        let Some(client) = self.registry.get_mut(id) else {
            return;
        };
        if client.is_closing() {
            return;
        }
        let outcome = client.read_into_query();
        self.finish_read(el, id, outcome);
    }

    /// Act on a read outcome: free on EOF or error, otherwise enforce the
    /// query limit, run the commands and schedule the reply.
    fn finish_read(&mut self, el: &mut ServerLoop<S>, id: ClientId, outcome: ReadOutcome) {
        let eof = match outcome {
            ReadOutcome::Data { eof, .. } => eof,
            ReadOutcome::WouldBlock => return,
            ReadOutcome::Eof => {
                debug!("Client {} closed the connection", id);
                self.free_client(el, id);
                return;
            }
            ReadOutcome::Failed(e) => {
                if e.kind() != io::ErrorKind::ConnectionReset {
                    debug!("Reading from client {} failed: {}", id, e);
                }
                self.free_client(el, id);
                return;
            }
        };

        let max_query = self.config.max_query_buffer;
        let Some(client) = self.registry.get_mut(id) else {
            return;
        };

        if client.query_len() > max_query {
            warn!(
                "Client {} query buffer over {} bytes, closing",
                id, max_query
            );
            client.set_protocol_error(ProtocolError::QueryBufferOverflow(max_query));
        } else {
            client.process_input_buffer(self.commands.as_mut());
        }

        let flags = client.flags();
        let drained = !client.has_pending_output();
        let enqueue = client.take_write_enqueue();

        if eof {
            debug!("Client {} closed the connection", id);
        }
        if eof
            || flags.contains(ClientFlags::CLOSE_ASAP)
            || (flags.contains(ClientFlags::CLOSE_AFTER_REPLY) && drained)
        {
            self.free_client(el, id);
            return;
        }
        if enqueue {
            self.registry.push_flagged_write(id);
        }
    }

    /// Read every client on the pending-read list, through the dispatcher
    /// when one is running, then process their input in queue order.
    pub fn handle_clients_with_pending_read(&mut self, el: &mut ServerLoop<S>) -> usize {
        let ids = self.registry.take_pending_reads();
        let ids: Vec<ClientId> = ids
            .into_iter()
            .filter(|id| self.registry.get(*id).is_some_and(|c| !c.is_closing()))
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let mut fds = Vec::with_capacity(ids.len());
        let mut batch = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(client) = self.registry.remove(*id) {
                fds.push(client.fd());
                batch.push(client);
            }
        }

        let batch = match self.dispatcher.as_mut() {
            Some(dispatcher) => dispatcher.fan_out(batch),
            None => {
                let mut batch = batch;
                for client in batch.iter_mut() {
                    client.stage_read();
                }
                batch
            }
        };

        let mut outcomes = HashMap::with_capacity(batch.len());
        for mut client in batch {
            let id = client.id();
            if let Some(outcome) = client.take_staged_read() {
                outcomes.insert(id, outcome);
            }
            self.registry.insert(client);
        }

        for (id, fd) in ids.iter().zip(fds) {
            if self.registry.get(*id).is_none() {
                // Lost together with a dead worker.
                let _ = el.del_file_event(fd, Mask::READABLE | Mask::WRITABLE);
            }
        }

        let mut processed = 0;
        for id in ids {
            if let Some(outcome) = outcomes.remove(&id) {
                self.finish_read(el, id, outcome);
                processed += 1;
            }
        }
        processed
    }

    /// Flush every client on the pending-write list and install a writable
    /// handler for those that still have output.
    pub fn handle_clients_with_pending_write(&mut self, el: &mut ServerLoop<S>) -> usize {
        let mut processed = 0;
        while let Some(id) = self.registry.pop_pending_write() {
            processed += 1;
            if !self.write_to_client(el, id) {
                continue;
            }
            let Some(client) = self.registry.get_mut(id) else {
                continue;
            };
            if !client.has_pending_output() || client.flags().contains(ClientFlags::WRITE_HANDLER) {
                continue;
            }

            let fd = client.fd();
            match el.add_file_event(
                fd,
                Mask::WRITABLE,
                send_reply_to_client::<S>,
                EventSource::Client(id),
            ) {
                Ok(()) => client.set_flags(ClientFlags::WRITE_HANDLER),
                Err(e) => {
                    warn!("Installing write handler for client {} failed: {}", id, e);
                    self.free_client(el, id);
                }
            }
        }
        processed
    }

    /// Write pending output. Returns false if the client was freed.
    pub fn write_to_client(&mut self, el: &mut ServerLoop<S>, id: ClientId) -> bool {
        let Some(client) = self.registry.get_mut(id) else {
            return false;
        };

        if let Err(e) = client.write_pending() {
            debug!("Writing to client {} failed: {}", id, e);
            self.free_client(el, id);
            return false;
        }
        if client.has_pending_output() {
            return true;
        }

        if client.flags().contains(ClientFlags::WRITE_HANDLER) {
            client.clear_flags(ClientFlags::WRITE_HANDLER);
            let fd = client.fd();
            if let Err(e) = el.del_file_event(fd, Mask::WRITABLE) {
                warn!("Removing write handler of client {} failed: {}", id, e);
            }
        }
        if self
            .registry
            .get(id)
            .is_some_and(|c| c.flags().contains(ClientFlags::CLOSE_AFTER_REPLY))
        {
            self.free_client(el, id);
            return false;
        }
        true
    }

    fn close_idle_clients(&mut self, el: &mut ServerLoop<S>) {
        if self.config.client_idle_timeout_secs == 0 {
            return;
        }
        let timeout = Duration::from_secs(self.config.client_idle_timeout_secs);
        for id in self.registry.idle_clients(Instant::now(), timeout) {
            info!("Closing client {} after {:?} idle", id, timeout);
            self.free_client(el, id);
        }
    }

    fn save_on_shutdown(&self) {
        debug!("No persistence configured, nothing to save");
    }

    /// Release everything the running loop used. Call after
    /// [`StopHandle::stop_and_wait`](crate::reactor::StopHandle::stop_and_wait)
    /// returned or [`EventLoop::run`] exited.
    pub fn terminate(&mut self, el: &mut ServerLoop<S>) {
        let ids = self.registry.ids();
        info!("Server terminating, closing {} clients", ids.len());
        for id in ids {
            self.free_client(el, id);
        }

        if let Some(listener) = self.listener.take() {
            let _ = el.del_file_event(listener.as_raw_fd(), Mask::READABLE);
        }

        self.save_on_shutdown();

        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        info!(
            "Server stopped ({} connections served, {} rejected)",
            self.stat_connections, self.stat_rejected
        );
    }
}

impl Server<TcpStream> {
    /// Create a server listening on `config.bind_addr:config.port`.
    pub fn bind(config: Config, commands: Box<dyn CommandHandler<TcpStream>>) -> Result<Self> {
        let mut server = Self::new(config, commands)?;

        let addr = (server.config.bind_addr.as_str(), server.config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Config(format!(
                    "cannot resolve {}:{}",
                    server.config.bind_addr, server.config.port
                ))
            })?;
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener);

        info!("Server listening on {}", listener.local_addr()?);
        server.listener = Some(listener);
        Ok(server)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Event loop over the platform poller with the listener registered.
    pub fn event_loop(&self) -> Result<ServerLoop> {
        let poller = MioPoller::new(self.config.event_loop_set_size().min(4096))?;
        let mut el = self.event_loop_with(Box::new(poller));
        if let Some(listener) = &self.listener {
            el.add_file_event(
                listener.as_raw_fd(),
                Mask::READABLE,
                accept_tcp_handler,
                EventSource::Listener,
            )?;
        }
        Ok(el)
    }

    fn accept_connection(&mut self, el: &mut ServerLoop, mut stream: TcpStream, addr: SocketAddr) {
        debug!("New connection from {}", addr);

        if self.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }
        }
        if self.config.tcp_keepalive {
            if let Err(e) = setsockopt(&stream, sockopt::KeepAlive, &true) {
                warn!("Failed to set SO_KEEPALIVE for {}: {}", addr, e);
            }
        }

        if self.registry.client_count() >= self.config.max_clients {
            self.stat_rejected += 1;
            warn!("Rejecting {}: {}", addr, Error::MaxClients);
            let _ = stream.write(&Error::MaxClients.to_resp());
            return;
        }

        if let Err(e) = self.create_client(el, stream, Some(addr)) {
            self.stat_rejected += 1;
            warn!("Rejecting {}: {}", addr, e);
        }
    }
}

/// Listener callback: accept until the backlog is empty.
pub fn accept_tcp_handler(
    el: &mut ServerLoop,
    server: &mut Server,
    _fd: RawFd,
    _mask: Mask,
    _source: EventSource,
) {
    loop {
        let accepted = match &server.listener {
            Some(listener) => listener.accept(),
            None => return,
        };
        match accepted {
            Ok((stream, addr)) => server.accept_connection(el, stream, addr),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Error accepting connection: {}", e);
                break;
            }
        }
    }
}

/// Readable callback of a client.
pub fn read_query_from_client<S: Stream>(
    el: &mut ServerLoop<S>,
    server: &mut Server<S>,
    _fd: RawFd,
    _mask: Mask,
    source: EventSource,
) {
    let EventSource::Client(id) = source else {
        return;
    };
    if server.dispatcher.is_some() {
        server.postpone_read(id);
    } else {
        server.read_client_now(el, id);
    }
}

/// Writable callback of a client.
pub fn send_reply_to_client<S: Stream>(
    el: &mut ServerLoop<S>,
    server: &mut Server<S>,
    _fd: RawFd,
    _mask: Mask,
    source: EventSource,
) {
    if let EventSource::Client(id) = source {
        server.write_to_client(el, id);
    }
}

/// Runs before every poll: deferred reads first, so their replies go out in
/// the same pass, then pending writes.
pub fn before_sleep<S: Stream>(el: &mut ServerLoop<S>, server: &mut Server<S>) {
    server.handle_clients_with_pending_read(el);
    server.handle_clients_with_pending_write(el);
    el.set_dont_wait(server.registry.has_pending_reads());
}

/// Periodic maintenance.
pub fn server_cron<S: Stream>(
    el: &mut ServerLoop<S>,
    server: &mut Server<S>,
    _id: TimerId,
    _source: EventSource,
) -> Duration {
    let hz = u64::from(server.config.cron_hz.max(1));
    server.cron_loops += 1;

    server.close_idle_clients(el);

    if server.cron_loops % (hz * STATS_EVERY_SECS) == 0 {
        debug!(
            "{} clients connected, {} pending reads, {} pending writes, max fd {}",
            server.registry.client_count(),
            server.registry.pending_read_len(),
            server.registry.pending_write_len(),
            el.max_fd()
        );
    }

    Duration::from_millis(1000 / hz)
}
