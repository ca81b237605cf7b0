use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Instant;

use futures::future::select_all;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::warn;

use crate::channel::{Channel, QueryOutcome};
use crate::config::ChannelOptions;
use crate::error::Result;
use crate::transport::{SocketHandle, SysTransport};
use crate::wire::{RecordClass, RecordType};

/// Tokio-based event loop around a [`Channel`] over the system sockets, for
/// embedders that do not integrate the channel into their own loop.
pub struct Resolver {
    channel: Channel<SysTransport>,
}

impl Resolver {
    pub fn new(options: ChannelOptions) -> Result<Resolver> {
        Ok(Resolver { channel: Channel::new(options)? })
    }

    /// Direct access to the underlying channel, e.g. to submit several
    /// queries before driving them.
    pub fn channel(&mut self) -> &mut Channel<SysTransport> {
        &mut self.channel
    }

    /// Submit one question and drive the channel until its callback fires.
    pub async fn query(
        &mut self,
        name: &str,
        rtype: RecordType,
        rclass: RecordClass,
    ) -> QueryOutcome {
        let slot: Rc<RefCell<Option<QueryOutcome>>> = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        let submitted = self.channel.submit(
            name,
            rtype,
            rclass,
            Box::new(move |_, outcome| *out.borrow_mut() = Some(outcome)),
        );
        let id = match submitted {
            Ok(id) => id,
            Err(err) => return QueryOutcome { result: Err(err), timeouts: 0 },
        };
        loop {
            if let Some(outcome) = slot.borrow_mut().take() {
                return outcome;
            }
            if let Err(err) = self.drive_once().await {
                warn!("event loop error, cancelling query {}: {}", id, err);
                self.channel.cancel(id);
            }
        }
    }

    /// Wait for one readiness event or the next deadline and feed it to the
    /// channel.
    async fn drive_once(&mut self) -> io::Result<()> {
        let interests = self.channel.socket_interests();
        let mut fds: Vec<(SocketHandle, bool, AsyncFd<RawFd>)> =
            Vec::with_capacity(interests.len());
        for (handle, interest) in &interests {
            let Some(fd) = self.channel.transport().raw_fd(*handle) else {
                continue;
            };
            let tokio_interest = if interest.writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            fds.push((*handle, interest.writable, AsyncFd::with_interest(fd, tokio_interest)?));
        }

        let timeout = self
            .channel
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        if fds.is_empty() {
            if let Some(timeout) = timeout {
                tokio::time::sleep(timeout).await;
                self.channel.process_timeouts();
            }
            return Ok(());
        }

        let mut tags: Vec<(SocketHandle, bool)> = Vec::new();
        let mut ready: Vec<Pin<Box<dyn Future<Output = io::Result<()>> + '_>>> = Vec::new();
        for (handle, write_interest, afd) in &fds {
            tags.push((*handle, false));
            ready.push(Box::pin(async move { afd.readable().await.map(drop) }));
            if *write_interest {
                tags.push((*handle, true));
                ready.push(Box::pin(async move { afd.writable().await.map(drop) }));
            }
        }

        match timeout {
            Some(timeout) => {
                tokio::select! {
                    (result, index, _) = select_all(ready) => {
                        result?;
                        let (handle, write) = tags[index];
                        if write {
                            self.channel.process(&[], &[handle]);
                        } else {
                            self.channel.process(&[handle], &[]);
                        }
                    }
                    _ = tokio::time::sleep(timeout) => self.channel.process_timeouts(),
                }
            }
            None => {
                let (result, index, _) = select_all(ready).await;
                result?;
                let (handle, write) = tags[index];
                if write {
                    self.channel.process(&[], &[handle]);
                } else {
                    self.channel.process(&[handle], &[]);
                }
            }
        }
        Ok(())
    }
}
