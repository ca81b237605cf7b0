use std::io;
use std::time::{Duration, Instant};

use bytes::Buf;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ConnId, Connection, QueryId, QueryOutcome};
use crate::error::DnsError;
use crate::transport::{SocketHandle, Transport, would_block};
use crate::wire::{self, MessageView};

const RCODE_FORMERR: u8 = 1;
const RCODE_SERVFAIL: u8 = 2;
const RCODE_NOTIMP: u8 = 4;
const RCODE_REFUSED: u8 = 5;

/// TCP read chunk size per `recv` call; frames are reassembled from the
/// per-server accumulation buffer regardless of how reads split them.
const TCP_READ_CHUNK: usize = 2048;

impl<T: Transport> Channel<T> {
    /// Process readiness on the given sockets and any expired timeouts,
    /// reading the clock once on entry.
    pub fn process(&mut self, readable: &[SocketHandle], writable: &[SocketHandle]) {
        self.process_at(readable, writable, Instant::now());
    }

    pub fn process_at(
        &mut self,
        readable: &[SocketHandle],
        writable: &[SocketHandle],
        now: Instant,
    ) {
        self.process_writable_at(writable, now);
        self.process_readable_at(readable, now);
        self.process_timeouts_at(now);
    }

    /// Flush queued TCP data for every server whose TCP socket is in the
    /// ready set.
    pub fn process_writable_at(&mut self, handles: &[SocketHandle], now: Instant) {
        if handles.is_empty() {
            return;
        }
        for index in 0..self.servers.len() {
            let Some(conn_id) = self.servers[index].tcp_conn else {
                continue;
            };
            if self.servers[index].tcp_send.is_empty() {
                continue;
            }
            let socket = self.connections[&conn_id].socket;
            if !handles.contains(&socket) {
                continue;
            }
            self.flush_tcp_send(index, conn_id, socket, now);
        }
    }

    fn flush_tcp_send(
        &mut self,
        server_index: usize,
        conn_id: ConnId,
        socket: SocketHandle,
        now: Instant,
    ) {
        let Channel { transport, servers, .. } = self;
        let server = &mut servers[server_index];
        match transport.send(socket, &server.tcp_send) {
            Ok(written) => {
                server.tcp_send.advance(written);
                let drained = server.tcp_send.is_empty();
                trace!("wrote {} bytes to {}", written, socket);
                if drained {
                    self.notify_socket_state(socket, true, false);
                }
            }
            Err(err) if would_block(&err) => {}
            Err(err) => {
                warn!("write error on {}: {}", socket, err);
                self.handle_error(conn_id, now);
            }
        }
    }

    /// Route read readiness to the UDP or TCP read path for each socket.
    pub fn process_readable_at(&mut self, handles: &[SocketHandle], now: Instant) {
        for &socket in handles {
            let Some(&conn_id) = self.conn_by_socket.get(&socket) else {
                continue;
            };
            if self.connections[&conn_id].is_tcp {
                self.read_tcp(conn_id, socket, now);
            } else {
                self.read_udp(conn_id, socket, now);
            }
        }
    }

    /// Drain datagrams from a UDP socket. Responses from an address other
    /// than the server's are dropped without further inspection.
    fn read_udp(&mut self, conn_id: ConnId, socket: SocketHandle, now: Instant) {
        let server_index = self.connections[&conn_id].server_index;
        let server_addr = self.servers[server_index].spec.addr;
        let buf_size = u16::max(wire::MAX_UDP_SIZE, self.config.ednspsz) as usize + 1;
        let mut buf = vec![0u8; buf_size];
        loop {
            match self.transport.recv_from(socket, &mut buf) {
                Ok((0, _)) => {
                    // A zero-length datagram, not a closed connection.
                }
                Ok((len, from)) => {
                    if from.ip() != server_addr {
                        trace!("dropping datagram from unexpected source {}", from);
                    } else {
                        self.process_answer(&buf[..len], conn_id, false, now);
                    }
                }
                Err(err) if would_block(&err) => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("read error on {}: {}", socket, err);
                    self.handle_error(conn_id, now);
                    return;
                }
            }
            // The answer may have torn down this connection; stop if so.
            if self.conn_by_socket.get(&socket) != Some(&conn_id) {
                return;
            }
        }
    }

    /// Drain a TCP socket into the server's accumulation buffer, then
    /// deliver every complete length-prefixed frame.
    fn read_tcp(&mut self, conn_id: ConnId, socket: SocketHandle, now: Instant) {
        let server_index = self.connections[&conn_id].server_index;
        let mut chunk = [0u8; TCP_READ_CHUNK];
        loop {
            match self.transport.recv(socket, &mut chunk) {
                Ok(0) => {
                    debug!("server closed tcp connection on {}", socket);
                    self.handle_error(conn_id, now);
                    return;
                }
                Ok(len) => self.servers[server_index].tcp_rx.extend_from_slice(&chunk[..len]),
                Err(err) if would_block(&err) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("read error on {}: {}", socket, err);
                    self.handle_error(conn_id, now);
                    return;
                }
            }
        }
        while let Some(frame) = wire::take_frame(&mut self.servers[server_index].tcp_rx) {
            self.process_answer(&frame[2..], conn_id, true, now);
            if self.conn_by_socket.get(&socket) != Some(&conn_id) {
                return;
            }
        }
    }

    /// Walk the deadline index from the head, retrying every expired query.
    pub fn process_timeouts(&mut self) {
        self.process_timeouts_at(Instant::now());
    }

    pub fn process_timeouts_at(&mut self, now: Instant) {
        loop {
            let Some(&(deadline, id)) = self.deadlines.first() else {
                break;
            };
            if deadline > now {
                break;
            }
            let conn_id = match self.queries.get_mut(&id) {
                Some(query) => {
                    if query.error_status != DnsError::Cancelled {
                        query.error_status = DnsError::Timeout;
                        query.timeouts += 1;
                    }
                    query.conn
                }
                None => {
                    self.deadlines.remove(&(deadline, id));
                    continue;
                }
            };
            let socket = conn_id.and_then(|c| self.connections.get(&c).map(|c| c.socket));
            trace!("query {} timed out", id);
            self.next_server(id, now);
            // A timeout may leave the connection idle and reapable.
            if let Some(socket) = socket {
                self.reap_connection(socket);
            }
        }
    }

    /// Validate an answer against the outstanding request it claims to match
    /// and either finish the query or put it back in flight.
    pub(crate) fn process_answer(
        &mut self,
        abuf: &[u8],
        conn_id: ConnId,
        from_tcp: bool,
        now: Instant,
    ) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let server_index = conn.server_index;
        let socket = conn.socket;

        let Ok(view) = MessageView::parse(abuf) else {
            trace!("dropping unparseable {}-byte payload", abuf.len());
            return;
        };
        let id = view.id();
        let Some(query) = self.queries.get(&id) else {
            trace!("dropping response for unknown id {}", id);
            return;
        };
        // Both the id and the question section must match the request;
        // anything else could be an off-path forgery.
        if !wire::same_questions(&query.tcpbuf[2..], abuf) {
            trace!("dropping response with mismatched question for id {}", id);
            return;
        }

        // We own this answer now: take the query off its connection so the
        // connection can be reaped, but keep it in the other indexes until
        // its fate is decided.
        self.detach_from_conn(id);

        // A FORMERR from a server that echoed no OPT RR means it does not
        // speak EDNS at all: drop the extension channel-wide and resend.
        if self.edns_enabled
            && view.rcode() == RCODE_FORMERR
            && !view.has_opt_rr()
            && self.queries[&id].edns
        {
            debug!("server {} rejected EDNS, disabling for this channel", server_index);
            self.edns_enabled = false;
            let query = self.queries.get_mut(&id).unwrap();
            wire::strip_edns(&mut query.tcpbuf);
            query.edns = false;
            self.send_query(id, now);
            self.reap_connection(socket);
            return;
        }

        let packet_size = self.config.packet_size(self.edns_enabled) as usize;
        if !from_tcp
            && (view.truncated() || abuf.len() > packet_size)
            && !self.config.ignore_truncation
        {
            let query = self.queries.get_mut(&id).unwrap();
            if !query.using_tcp {
                debug!("response for {} truncated, upgrading to tcp", id);
                query.using_tcp = true;
                self.send_query(id, now);
            }
            self.reap_connection(socket);
            return;
        }

        if !self.config.no_check_response {
            let rcode = view.rcode();
            let mapped = match rcode {
                RCODE_SERVFAIL | RCODE_NOTIMP | RCODE_REFUSED => DnsError::from_rcode(rcode),
                _ => None,
            };
            if let Some(status) = mapped {
                debug!("server {} answered {} with rcode {}", server_index, id, rcode);
                let query = self.queries.get_mut(&id).unwrap();
                query.error_status = status;
                let current = query.server_index;
                self.skip_server(id, server_index);
                if current == server_index {
                    self.next_server(id, now);
                }
                self.reap_connection(socket);
                return;
            }
        }

        self.end_query(id, Ok(abuf.to_vec()));
        self.reap_connection(socket);
    }

    /// Dispatch a query to its current server, arming its deadline and
    /// connection membership on success. Failures route through
    /// `next_server` or finish the query.
    pub(crate) fn send_query(&mut self, id: QueryId, now: Instant) {
        let Some(query) = self.queries.get(&id) else {
            return;
        };
        let server_index = query.server_index;
        let conn_id = if query.using_tcp {
            self.send_tcp(id, server_index, now)
        } else {
            self.send_udp(id, server_index, now)
        };
        let Some(conn_id) = conn_id else {
            return;
        };
        self.arm_deadline(id, now);
        self.attach_to_conn(id, conn_id);
    }

    fn send_tcp(&mut self, id: QueryId, server_index: usize, now: Instant) -> Option<ConnId> {
        let conn_id = match self.servers[server_index].tcp_conn {
            Some(conn_id) => conn_id,
            None => match self.open_connection(server_index, true) {
                Ok(conn_id) => conn_id,
                Err(err) => return self.handle_open_failure(id, server_index, err, now),
            },
        };

        let Channel { queries, servers, .. } = self;
        let server = &mut servers[server_index];
        let prior_empty = server.tcp_send.is_empty();
        server.tcp_send.extend_from_slice(&queries[&id].tcpbuf);
        let generation = server.tcp_generation;

        if prior_empty {
            let socket = self.connections[&conn_id].socket;
            self.notify_socket_state(socket, true, true);
        }
        self.queries.get_mut(&id).unwrap().server_info[server_index].tcp_generation = generation;
        Some(conn_id)
    }

    fn send_udp(&mut self, id: QueryId, server_index: usize, now: Instant) -> Option<ConnId> {
        // Reuse the front connection unless it is the TCP one or it has
        // exhausted its query quota.
        let reusable = self.servers[server_index].connections.first().copied().filter(|conn_id| {
            let conn = &self.connections[conn_id];
            if conn.is_tcp {
                return false;
            }
            let max = self.config.udp_max_queries as u64;
            max == 0 || conn.total_queries < max
        });
        let conn_id = match reusable {
            Some(conn_id) => conn_id,
            None => match self.open_connection(server_index, false) {
                Ok(conn_id) => conn_id,
                Err(err) => return self.handle_open_failure(id, server_index, err, now),
            },
        };

        let socket = self.connections[&conn_id].socket;
        let sent = {
            let Channel { queries, transport, .. } = self;
            let payload = &queries[&id].tcpbuf[2..];
            let expected = payload.len();
            transport.send(socket, payload).map(|sent| sent == expected)
        };
        match sent {
            Ok(true) => return Some(conn_id),
            Ok(false) => debug!("udp send to server {} was short", server_index),
            Err(err) => debug!("udp send to server {} failed: {}", server_index, err),
        }
        self.skip_server(id, server_index);
        self.next_server(id, now);
        None
    }

    fn open_connection(&mut self, server_index: usize, is_tcp: bool) -> io::Result<ConnId> {
        let spec = self.servers[server_index].spec;
        let (socket, addr) = if is_tcp {
            let addr = spec.tcp_addr(self.config.tcp_port);
            (self.transport.open_tcp(addr)?, addr)
        } else {
            let addr = spec.udp_addr(self.config.udp_port);
            (self.transport.open_udp(addr)?, addr)
        };

        let conn_id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        self.connections.insert(
            conn_id,
            Connection {
                id: conn_id,
                server_index,
                socket,
                is_tcp,
                total_queries: 0,
                queries: Vec::new(),
            },
        );
        self.conn_by_socket.insert(socket, conn_id);

        if is_tcp {
            self.tcp_generation += 1;
        }
        let generation = self.tcp_generation;
        let server = &mut self.servers[server_index];
        server.connections.insert(0, conn_id);
        if is_tcp {
            server.tcp_conn = Some(conn_id);
            server.tcp_generation = generation;
        }
        debug!(
            "opened {} connection {} to server {} ({})",
            if is_tcp { "tcp" } else { "udp" },
            socket,
            server_index,
            addr
        );
        self.notify_socket_state(socket, true, false);
        Ok(conn_id)
    }

    /// Connection-refused and address-family failures are specific to the
    /// server and worth retrying elsewhere; anything else ends the query.
    fn handle_open_failure(
        &mut self,
        id: QueryId,
        server_index: usize,
        err: io::Error,
        now: Instant,
    ) -> Option<ConnId> {
        debug!("failed to reach server {}: {}", server_index, err);
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Unsupported
            | io::ErrorKind::AddrNotAvailable => {
                self.skip_server(id, server_index);
                self.next_server(id, now);
            }
            io::ErrorKind::OutOfMemory => self.end_query(id, Err(DnsError::NoMem)),
            _ => self.end_query(id, Err(DnsError::ConnRefused)),
        }
        None
    }

    /// Advance to the next usable server, or finish the query with its
    /// accumulated error once every server has had its tries.
    pub(crate) fn next_server(&mut self, id: QueryId, now: Instant) {
        let nservers = self.config.nservers();
        let max_tries = nservers as u32 * self.config.tries;
        let generations: SmallVec<[u64; 4]> =
            self.servers.iter().map(|s| s.tcp_generation).collect();

        let mut final_status = None;
        {
            let Some(query) = self.queries.get_mut(&id) else {
                return;
            };
            loop {
                query.try_count += 1;
                if query.try_count >= max_tries || query.no_retries {
                    final_status = Some(query.error_status.clone());
                    break;
                }
                query.server_index = (query.server_index + 1) % nservers;
                let info = &query.server_info[query.server_index];
                // Skip servers that already failed this query, and, over
                // TCP, the very same socket incarnation we already used.
                let same_socket =
                    query.using_tcp && info.tcp_generation == generations[query.server_index];
                if !info.skip_server && !same_socket {
                    break;
                }
            }
        }
        match final_status {
            None => self.send_query(id, now),
            Some(status) => {
                debug!("query {} out of servers, finishing with {:?}", id, status);
                self.end_query(id, Err(status));
            }
        }
    }

    /// With more than one server available, stop offering this query to a
    /// server that misbehaved. With a single server a retry against it is
    /// still the only hope, so never skip.
    pub(crate) fn skip_server(&mut self, id: QueryId, server_index: usize) {
        if self.config.nservers() > 1 {
            if let Some(query) = self.queries.get_mut(&id) {
                query.server_info[server_index].skip_server = true;
            }
        }
    }

    /// A connection broke: steal its query list, tear the connection down,
    /// then requeue the stolen queries. Destroying first guarantees no retry
    /// lands back on the dying socket.
    pub(crate) fn handle_error(&mut self, conn_id: ConnId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let server_index = conn.server_index;
        let stolen = std::mem::take(&mut conn.queries);
        warn!(
            "connection to server {} failed with {} queries in flight",
            server_index,
            stolen.len()
        );
        self.destroy_connection(conn_id);
        for id in stolen {
            let Some(query) = self.queries.get_mut(&id) else {
                continue;
            };
            query.conn = None;
            self.skip_server(id, server_index);
            self.next_server(id, now);
        }
    }

    pub(crate) fn destroy_connection(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };
        self.conn_by_socket.remove(&conn.socket);
        let server = &mut self.servers[conn.server_index];
        server.connections.retain(|&c| c != conn_id);
        if server.tcp_conn == Some(conn_id) {
            server.tcp_conn = None;
            server.tcp_send.clear();
            server.tcp_rx.clear();
        }
        self.transport.close(conn.socket);
        self.notify_socket_state(conn.socket, false, false);
    }

    /// Close a drained UDP connection that has used up its query quota.
    fn reap_connection(&mut self, socket: SocketHandle) {
        let Some(&conn_id) = self.conn_by_socket.get(&socket) else {
            return;
        };
        let conn = &self.connections[&conn_id];
        if conn.is_tcp || !conn.queries.is_empty() {
            return;
        }
        let max = self.config.udp_max_queries as u64;
        if max > 0 && conn.total_queries >= max {
            debug!("retiring exhausted udp connection {}", socket);
            self.destroy_connection(conn_id);
        }
    }

    /// Compute the retry deadline: the channel timeout, doubled once for
    /// every full pass through the server list, guarding the shift against
    /// overflow.
    fn arm_deadline(&mut self, id: QueryId, now: Instant) {
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let nservers = self.config.nservers() as u32;
        let Some(query) = self.queries.get_mut(&id) else {
            return;
        };
        let shift = query.try_count / nservers;
        let timeplus = if shift <= timeout_ms.leading_zeros() {
            timeout_ms << shift
        } else {
            timeout_ms
        };
        let old = query.deadline.replace(now + Duration::from_millis(timeplus));
        let new = query.deadline.unwrap();
        if let Some(deadline) = old {
            self.deadlines.remove(&(deadline, id));
        }
        self.deadlines.insert((new, id));
    }

    fn attach_to_conn(&mut self, id: QueryId, conn_id: ConnId) {
        self.detach_from_conn(id);
        let conn = self.connections.get_mut(&conn_id).expect("attaching to dead connection");
        conn.queries.push(id);
        conn.total_queries += 1;
        if let Some(query) = self.queries.get_mut(&id) {
            query.conn = Some(conn_id);
        }
    }

    pub(crate) fn detach_from_conn(&mut self, id: QueryId) {
        let Some(query) = self.queries.get_mut(&id) else {
            return;
        };
        let Some(conn_id) = query.conn.take() else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.queries.retain(|&qid| qid != id);
        }
    }

    /// Remove the query from every index, then invoke its callback exactly
    /// once. The id is dead once this returns; the callback may freely
    /// operate on the channel otherwise.
    pub(crate) fn end_query(
        &mut self,
        id: QueryId,
        result: std::result::Result<Vec<u8>, DnsError>,
    ) {
        self.detach_from_conn(id);
        let Some(mut query) = self.queries.remove(&id) else {
            return;
        };
        if let Some(deadline) = query.deadline.take() {
            self.deadlines.remove(&(deadline, id));
        }
        let callback = query.callback.take();
        let outcome = QueryOutcome { result, timeouts: query.timeouts };
        trace!(
            "query {} finished after {} tries ({:?})",
            id,
            query.try_count + 1,
            outcome.result.as_ref().map(|payload| payload.len())
        );
        drop(query);
        if let Some(callback) = callback {
            callback(self, outcome);
        }
    }

    pub(crate) fn notify_socket_state(
        &mut self,
        socket: SocketHandle,
        readable: bool,
        writable: bool,
    ) {
        if let Some(callback) = self.socket_state.as_mut() {
            callback(socket, readable, writable);
        }
    }
}
