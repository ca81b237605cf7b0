use std::collections::BTreeSet;
use std::time::Instant;

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};
use tracing::{debug, trace};

use crate::addr::ServerSpec;
use crate::config::{ChannelConfig, ChannelOptions};
use crate::discovery::{ConfigDiscovery, ResolvConf};
use crate::error::{DnsError, Result};
use crate::transport::{SocketHandle, SysTransport, Transport};
use crate::wire::{self, RecordClass, RecordType};

/// The 16-bit wire id doubles as the query handle.
pub type QueryId = u16;

/// Delivered to a query's callback exactly once.
#[derive(Debug)]
pub struct QueryOutcome {
    /// Raw response payload on success, final error otherwise.
    pub result: std::result::Result<Vec<u8>, DnsError>,
    /// Number of timeouts this query observed across its attempts.
    pub timeouts: u32,
}

/// Per-query completion callback. Runs inside an event-dispatch entry point;
/// it may submit or cancel other queries on the channel, but the query it was
/// registered for has already been detached and its id is no longer valid.
pub type QueryCallback<T> = Box<dyn FnOnce(&mut Channel<T>, QueryOutcome)>;

/// Socket readiness interest reported to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

pub(crate) type SocketStateFn = Box<dyn FnMut(SocketHandle, bool, bool)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnId(pub u64);

/// Per-server retry state carried by each query.
#[derive(Debug, Clone)]
pub(crate) struct QueryServerInfo {
    pub skip_server: bool,
    /// Which TCP socket incarnation of this server the query was sent over.
    pub tcp_generation: u64,
}

pub(crate) struct Query<T: Transport> {
    pub id: QueryId,
    /// Encoded request in length-prefixed form; the UDP payload starts at
    /// offset 2.
    pub tcpbuf: Vec<u8>,
    /// Whether the request carries an OPT RR we appended.
    pub edns: bool,
    pub callback: Option<QueryCallback<T>>,
    pub deadline: Option<Instant>,
    pub try_count: u32,
    pub timeouts: u32,
    /// Server the query was last dispatched to.
    pub server_index: usize,
    pub using_tcp: bool,
    pub no_retries: bool,
    /// Best error observed so far; reported if every attempt fails.
    pub error_status: DnsError,
    pub conn: Option<ConnId>,
    pub server_info: SmallVec<[QueryServerInfo; 4]>,
}

pub(crate) struct Connection {
    pub id: ConnId,
    pub server_index: usize,
    pub socket: SocketHandle,
    pub is_tcp: bool,
    /// Total queries ever dispatched on this connection, for the UDP quota.
    pub total_queries: u64,
    /// Queries currently awaiting an answer on this connection.
    pub queries: Vec<QueryId>,
}

pub(crate) struct ServerState {
    pub spec: ServerSpec,
    /// Live connections, most recently opened first.
    pub connections: Vec<ConnId>,
    pub tcp_conn: Option<ConnId>,
    /// Outbound queue for the TCP connection, already length-prefixed.
    pub tcp_send: BytesMut,
    /// Inbound accumulation buffer; frames are split off as they complete.
    pub tcp_rx: BytesMut,
    /// Socket incarnation counter, bumped on every TCP (re)open.
    pub tcp_generation: u64,
}

/// The resolver instance: owns the server table, all live connections and
/// queries, and the indexes over them. Single-threaded; the embedder drives
/// it from its own event loop via the `process_*` entry points.
pub struct Channel<T: Transport = SysTransport> {
    pub(crate) config: ChannelConfig,
    pub(crate) transport: T,
    pub(crate) servers: Vec<ServerState>,
    pub(crate) connections: FxHashMap<ConnId, Connection>,
    pub(crate) conn_by_socket: FxHashMap<SocketHandle, ConnId>,
    /// Owning store for live queries, keyed by wire id.
    pub(crate) queries: FxHashMap<QueryId, Query<T>>,
    /// Deadline index; the head is the earliest deadline.
    pub(crate) deadlines: BTreeSet<(Instant, QueryId)>,
    pub(crate) next_conn_id: u64,
    pub(crate) tcp_generation: u64,
    pub(crate) last_server: usize,
    /// EDNS starts from configuration and is cleared channel-wide when a
    /// server answers FORMERR without an OPT RR.
    pub(crate) edns_enabled: bool,
    pub(crate) rng: StdRng,
    pub(crate) socket_state: Option<SocketStateFn>,
    pub(crate) destroyed: bool,
}

impl Channel<SysTransport> {
    /// Build a channel over the system's sockets, configuring it from caller
    /// options, the environment, `resolv.conf`, and built-in defaults.
    pub fn new(options: ChannelOptions) -> Result<Channel<SysTransport>> {
        Channel::with_transport(options, &ResolvConf::new(), SysTransport::new())
    }
}

impl<T: Transport> Channel<T> {
    /// Build a channel with an injected transport and discovery source.
    pub fn with_transport(
        options: ChannelOptions,
        discovery: &dyn ConfigDiscovery,
        transport: T,
    ) -> Result<Channel<T>> {
        let seed = options.query_id_seed;
        let config = ChannelConfig::resolve(options, discovery)?;
        Ok(Channel::from_config(config, transport, seed))
    }

    pub(crate) fn from_config(config: ChannelConfig, transport: T, seed: Option<u64>) -> Channel<T> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut channel = Channel {
            servers: Vec::with_capacity(config.nservers()),
            edns_enabled: config.edns,
            config,
            transport,
            connections: FxHashMap::default(),
            conn_by_socket: FxHashMap::default(),
            queries: FxHashMap::default(),
            deadlines: BTreeSet::new(),
            next_conn_id: 0,
            tcp_generation: 0,
            last_server: 0,
            rng,
            socket_state: None,
            destroyed: false,
        };
        for index in 0..channel.config.nservers() {
            channel.tcp_generation += 1;
            channel.servers.push(ServerState {
                spec: channel.config.servers[index],
                connections: Vec::new(),
                tcp_conn: None,
                tcp_send: BytesMut::new(),
                tcp_rx: BytesMut::new(),
                tcp_generation: channel.tcp_generation,
            });
        }
        channel
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Number of in-flight queries.
    pub fn live_queries(&self) -> usize {
        self.queries.len()
    }

    /// Whether EDNS is still active on this channel.
    pub fn edns_active(&self) -> bool {
        self.edns_enabled
    }

    /// Install a callback notified when a socket's readiness interest
    /// changes: `(socket, readable, writable)`; `(false, false)` means the
    /// socket is closed.
    pub fn set_socket_state_callback(
        &mut self,
        callback: impl FnMut(SocketHandle, bool, bool) + 'static,
    ) {
        self.socket_state = Some(Box::new(callback));
    }

    /// Enumerate the sockets the embedder should poll, with their current
    /// interest. A TCP socket is write-interested while its server has
    /// queued outbound data.
    pub fn socket_interests(&self) -> Vec<(SocketHandle, Interest)> {
        let mut out: Vec<(SocketHandle, Interest)> = self
            .connections
            .values()
            .map(|conn| {
                let server = &self.servers[conn.server_index];
                let writable = conn.is_tcp
                    && server.tcp_conn == Some(conn.id)
                    && !server.tcp_send.is_empty();
                (conn.socket, Interest { readable: true, writable })
            })
            .collect();
        out.sort_by_key(|(socket, _)| *socket);
        out
    }

    /// Earliest deadline across all in-flight queries, for the embedder's
    /// poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|&(deadline, _)| deadline)
    }

    /// Submit a single-question query. The callback fires exactly once, with
    /// the raw response payload or the final error.
    pub fn submit(
        &mut self,
        name: &str,
        rtype: RecordType,
        rclass: RecordClass,
        callback: QueryCallback<T>,
    ) -> Result<QueryId> {
        self.submit_at(name, rtype, rclass, Instant::now(), callback)
    }

    pub fn submit_at(
        &mut self,
        name: &str,
        rtype: RecordType,
        rclass: RecordClass,
        now: Instant,
        callback: QueryCallback<T>,
    ) -> Result<QueryId> {
        let edns = self.edns_enabled.then_some(self.config.ednspsz);
        let tcpbuf = wire::build_query(0, name, rtype, rclass, true, edns)?;
        trace!("submitting query for {} type {:?}", name, rtype);
        self.submit_buffer(tcpbuf, edns.is_some(), now, callback)
    }

    /// Submit a caller-encoded DNS message (without length prefix). The
    /// transaction id is rewritten with a freshly generated one.
    pub fn submit_raw(&mut self, message: &[u8], callback: QueryCallback<T>) -> Result<QueryId> {
        self.submit_raw_at(message, Instant::now(), callback)
    }

    pub fn submit_raw_at(
        &mut self,
        message: &[u8],
        now: Instant,
        callback: QueryCallback<T>,
    ) -> Result<QueryId> {
        let tcpbuf = wire::prefix_message(message)?;
        self.submit_buffer(tcpbuf, false, now, callback)
    }

    fn submit_buffer(
        &mut self,
        mut tcpbuf: Vec<u8>,
        edns: bool,
        now: Instant,
        callback: QueryCallback<T>,
    ) -> Result<QueryId> {
        if self.destroyed {
            return Err(DnsError::Destruction);
        }
        let id = self.generate_query_id()?;
        wire::set_query_id(&mut tcpbuf, id);

        let nservers = self.config.nservers();
        let server_index = if self.config.rotate {
            let index = self.last_server;
            self.last_server = (self.last_server + 1) % nservers;
            index
        } else {
            0
        };

        let query = Query {
            id,
            tcpbuf,
            edns,
            callback: Some(callback),
            deadline: None,
            try_count: 0,
            timeouts: 0,
            server_index,
            using_tcp: self.config.use_tcp_only,
            no_retries: false,
            error_status: DnsError::ConnRefused,
            conn: None,
            server_info: smallvec![
                QueryServerInfo { skip_server: false, tcp_generation: 0 };
                nservers
            ],
        };
        self.queries.insert(id, query);
        self.send_query(id, now);
        Ok(id)
    }

    /// Draw an unused 16-bit id. With few in-flight queries a single draw
    /// almost always suffices; near exhaustion we fall back to scanning from
    /// a random start so the id space can actually fill up.
    fn generate_query_id(&mut self) -> Result<QueryId> {
        if self.queries.len() > u16::MAX as usize {
            return Err(DnsError::NoMem);
        }
        for _ in 0..64 {
            let id: QueryId = self.rng.random();
            if !self.queries.contains_key(&id) {
                return Ok(id);
            }
        }
        let start: QueryId = self.rng.random();
        for offset in 0..=u16::MAX {
            let id = start.wrapping_add(offset);
            if !self.queries.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(DnsError::NoMem)
    }

    /// Cancel one query. It is finished with `Cancelled` through the timeout
    /// path on the spot; returns false if the id is not live.
    pub fn cancel(&mut self, id: QueryId) -> bool {
        self.cancel_at(id, Instant::now())
    }

    pub fn cancel_at(&mut self, id: QueryId, now: Instant) -> bool {
        if !self.queries.contains_key(&id) {
            return false;
        }
        self.mark_cancelled(id, now);
        self.process_timeouts_at(now);
        true
    }

    /// Cancel every in-flight query.
    pub fn cancel_all(&mut self) {
        self.cancel_all_at(Instant::now())
    }

    pub fn cancel_all_at(&mut self, now: Instant) {
        let ids: Vec<QueryId> = self.queries.keys().copied().collect();
        for id in ids {
            self.mark_cancelled(id, now);
        }
        self.process_timeouts_at(now);
    }

    fn mark_cancelled(&mut self, id: QueryId, now: Instant) {
        let Some(query) = self.queries.get_mut(&id) else {
            return;
        };
        query.no_retries = true;
        query.error_status = DnsError::Cancelled;
        let old = query.deadline.replace(now);
        if let Some(deadline) = old {
            self.deadlines.remove(&(deadline, id));
        }
        self.deadlines.insert((now, id));
    }

    /// End every in-flight query with `Destruction` and close all sockets.
    /// Runs automatically on drop; safe to call more than once.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        debug!("destroying channel with {} live queries", self.queries.len());
        // Nothing will be dispatched again; drop the per-connection lists in
        // one go rather than unlinking every query individually.
        for conn in self.connections.values_mut() {
            conn.queries.clear();
        }
        for query in self.queries.values_mut() {
            query.conn = None;
        }
        let ids: Vec<QueryId> = self.queries.keys().copied().collect();
        for id in ids {
            if self.queries.contains_key(&id) {
                self.end_query(id, Err(DnsError::Destruction));
            }
        }
        let conn_ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn_id in conn_ids {
            self.destroy_connection(conn_id);
        }
    }

    /// Testing support: verify the cross-index invariants.
    #[doc(hidden)]
    pub fn assert_valid(&self) {
        assert_eq!(self.deadlines.len(), self.queries.len());
        for (&id, query) in &self.queries {
            assert_eq!(query.id, id);
            let deadline = query.deadline.expect("live query without deadline");
            assert!(self.deadlines.contains(&(deadline, id)));
            assert_eq!(query.server_info.len(), self.config.nservers());
            let holders = self
                .connections
                .values()
                .filter(|conn| conn.queries.contains(&id))
                .count();
            match query.conn {
                Some(conn_id) => {
                    assert_eq!(holders, 1);
                    assert!(self.connections[&conn_id].queries.contains(&id));
                }
                None => assert_eq!(holders, 0),
            }
        }
        for &(_, id) in &self.deadlines {
            assert!(self.queries.contains_key(&id));
        }
        assert_eq!(self.conn_by_socket.len(), self.connections.len());
        for (&socket, &conn_id) in &self.conn_by_socket {
            let conn = self.connections.get(&conn_id).expect("stale socket index");
            assert_eq!(conn.socket, socket);
            assert!(self.servers[conn.server_index].connections.contains(&conn_id));
        }
        for (index, server) in self.servers.iter().enumerate() {
            for conn_id in &server.connections {
                assert_eq!(self.connections[conn_id].server_index, index);
            }
            if let Some(tcp) = server.tcp_conn {
                assert!(self.connections[&tcp].is_tcp);
                assert!(server.connections.contains(&tcp));
            }
        }
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
