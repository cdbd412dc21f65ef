//! Readiness multiplexer: `mio::Poll` plus the registration key table.

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::sync::Arc;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token, Waker};
use slab::Slab;

use crate::change::PendingConnect;
use crate::endpoint::SelectableEndPoint;
use crate::error::Error;

/// Token reserved for the cross-thread waker; never a slab index.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Interest/ready operation bitmask.
///
/// Four ops instead of mio's two: `ACCEPT` and `CONNECT` are the
/// listener/pending flavors of readable/writable, separated so dispatch
/// can tell them apart without consulting the channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interests(u8);

impl Interests {
    pub const NONE: Interests = Interests(0);
    pub const READ: Interests = Interests(1);
    pub const WRITE: Interests = Interests(2);
    pub const ACCEPT: Interests = Interests(4);
    pub const CONNECT: Interests = Interests(8);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interests) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    pub fn insert(&mut self, other: Interests) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Interests) {
        self.0 &= !other.0;
    }

    /// Translate to mio's readable/writable pair. `None` when empty.
    fn to_mio(self) -> Option<mio::Interest> {
        let mut interest = None;
        if self.contains(Interests::READ) || self.contains(Interests::ACCEPT) {
            interest = Some(mio::Interest::READABLE);
        }
        if self.contains(Interests::WRITE) || self.contains(Interests::CONNECT) {
            interest = Some(match interest {
                Some(i) => i.add(mio::Interest::WRITABLE),
                None => mio::Interest::WRITABLE,
            });
        }
        interest
    }
}

impl BitOr for Interests {
    type Output = Interests;

    fn bitor(self, rhs: Interests) -> Interests {
        Interests(self.0 | rhs.0)
    }
}

impl fmt::Display for Interests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        for (op, c) in [
            (Interests::READ, 'r'),
            (Interests::WRITE, 'w'),
            (Interests::ACCEPT, 'a'),
            (Interests::CONNECT, 'c'),
        ] {
            if self.contains(op) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// A registered channel: a listening socket or a (connecting or
/// established) stream.
pub enum Channel {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Channel {
    pub fn stream(&self) -> Option<&TcpStream> {
        match self {
            Channel::Stream(s) => Some(s),
            Channel::Listener(_) => None,
        }
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        match self {
            Channel::Listener(l) => Some(l),
            Channel::Stream(_) => None,
        }
    }

    fn source(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Channel::Listener(l) => l,
            Channel::Stream(s) => s,
        }
    }
}

/// What a key currently stands for. Drives readiness dispatch.
pub enum Attachment {
    /// Registered with no owner yet (listeners, freshly accepted keys).
    Nil,
    /// An in-progress outbound connect.
    Pending(PendingConnect),
    /// A live endpoint.
    Live(Arc<dyn SelectableEndPoint>),
}

impl Attachment {
    pub fn endpoint(&self) -> Option<&Arc<dyn SelectableEndPoint>> {
        match self {
            Attachment::Live(ep) => Some(ep),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Attachment::Pending(_))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Attachment::Nil => "nil",
            Attachment::Pending(_) => "pending-connect",
            Attachment::Live(_) => "endpoint",
        }
    }
}

/// One registration: channel, interest/ready ops, attachment.
///
/// Written only on the loop thread.
pub(crate) struct Key {
    pub channel: Channel,
    pub interests: Interests,
    pub ready: Interests,
    pub attachment: Attachment,
    pub valid: bool,
    registered: bool,
    applied: Option<mio::Interest>,
}

/// Registration failure, handing the channel and attachment back so the
/// caller can run its own failure path (the connect path needs both).
pub(crate) struct RegisterError {
    pub error: io::Error,
    pub channel: Channel,
    pub attachment: Attachment,
}

/// The loop-thread view of a key handed to endpoint callbacks.
///
/// Interest edits are recorded in the key and applied to the OS
/// registration once per iteration, after the `update_key` sweep.
pub struct KeyView<'a> {
    token: Token,
    key: &'a mut Key,
}

impl<'a> KeyView<'a> {
    pub(crate) fn new(token: Token, key: &'a mut Key) -> Self {
        KeyView { token, key }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn ready_ops(&self) -> Interests {
        self.key.ready
    }

    pub fn interests(&self) -> Interests {
        self.key.interests
    }

    pub fn set_interests(&mut self, ops: Interests) {
        self.key.interests = ops;
    }

    /// Mark the key invalid. The loop closes the endpoint and drops the
    /// registration when it next sweeps over the key.
    pub fn cancel(&mut self) {
        self.key.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.key.valid
    }

    /// The underlying stream, for loop-thread I/O. `None` for listeners.
    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        match &mut self.key.channel {
            Channel::Stream(s) => Some(s),
            Channel::Listener(_) => None,
        }
    }
}

/// `mio::Poll` + `Events` + the key table, owned by the loop thread.
pub(crate) struct Multiplexer {
    poll: Poll,
    events: Events,
    keys: Slab<Key>,
    closed: bool,
}

impl Multiplexer {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Multiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
            keys: Slab::new(),
            closed: false,
        })
    }

    /// Build the out-of-band wakeup primitive for this poll.
    pub fn make_waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    pub fn register(
        &mut self,
        channel: Channel,
        interests: Interests,
        attachment: Attachment,
    ) -> Result<Token, RegisterError> {
        if self.closed {
            return Err(RegisterError {
                error: io::Error::new(io::ErrorKind::NotConnected, "multiplexer closed"),
                channel,
                attachment,
            });
        }
        let entry = self.keys.vacant_entry();
        let token = Token(entry.key());
        entry.insert(Key {
            channel,
            interests,
            ready: Interests::NONE,
            attachment,
            valid: true,
            registered: false,
            applied: None,
        });
        if let Err(error) = self.apply_interests(token) {
            let key = self.keys.remove(token.0);
            return Err(RegisterError {
                error,
                channel: key.channel,
                attachment: key.attachment,
            });
        }
        Ok(token)
    }

    /// Bring the OS registration in line with the key's interest mask.
    ///
    /// mio cannot hold a zero-interest registration, so an empty mask
    /// deregisters the source while the key stays in the table.
    pub fn apply_interests(&mut self, token: Token) -> io::Result<()> {
        let Multiplexer { poll, keys, .. } = self;
        let Some(key) = keys.get_mut(token.0) else {
            return Ok(());
        };
        match (key.registered, key.interests.to_mio()) {
            (false, Some(interest)) => {
                poll.registry()
                    .register(key.channel.source(), token, interest)?;
                key.registered = true;
                key.applied = Some(interest);
            }
            (true, Some(interest)) if key.applied != Some(interest) => {
                poll.registry()
                    .reregister(key.channel.source(), token, interest)?;
                key.applied = Some(interest);
            }
            (true, None) => {
                poll.registry().deregister(key.channel.source())?;
                key.registered = false;
                key.applied = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Block until readiness or a wakeup. Returns the raw event count.
    pub fn wait(&mut self) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(self.events.iter().count())
    }

    /// Fold the last wait's events into per-key ready ops and collect
    /// the tokens that became ready, in event order.
    pub fn collect_ready(&mut self, out: &mut Vec<Token>) {
        let Multiplexer { events, keys, .. } = self;
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let Some(key) = keys.get_mut(token.0) else {
                continue;
            };
            let ops = ready_ops(event, key);
            if ops.is_empty() {
                continue;
            }
            if key.ready.is_empty() {
                out.push(token);
            }
            key.ready.insert(ops);
        }
    }

    pub fn key(&self, token: Token) -> Option<&Key> {
        self.keys.get(token.0)
    }

    pub fn key_mut(&mut self, token: Token) -> Option<&mut Key> {
        self.keys.get_mut(token.0)
    }

    /// Remove a key, deregistering the channel. Dropping the returned
    /// key closes the socket unless the caller keeps the channel.
    pub fn remove(&mut self, token: Token) -> Option<Key> {
        let mut key = self.keys.try_remove(token.0)?;
        if key.registered {
            let _ = self.poll.registry().deregister(key.channel.source());
        }
        Some(key)
    }

    /// Snapshot of all registered tokens, for stop/dump sweeps.
    pub fn tokens(&self) -> Vec<Token> {
        self.keys.iter().map(|(index, _)| Token(index)).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Drop every registration and refuse further waits.
    pub fn close(&mut self) {
        for token in self.tokens() {
            self.remove(token);
        }
        self.closed = true;
    }
}

/// Map a mio event to this crate's ops for the given key.
///
/// Listener readable means accept; stream writable means connect while
/// the attachment is a pending connect, write afterwards. Closed/error
/// states surface as readiness so the owner discovers them on the next
/// I/O operation.
fn ready_ops(event: &Event, key: &Key) -> Interests {
    let read_side = event.is_readable() || event.is_read_closed();
    let write_side = event.is_writable() || event.is_write_closed() || event.is_error();
    let mut ops = Interests::NONE;
    match &key.channel {
        Channel::Listener(_) => {
            if read_side {
                ops.insert(Interests::ACCEPT);
            }
        }
        Channel::Stream(_) => {
            if key.attachment.is_pending() {
                if write_side {
                    ops.insert(Interests::CONNECT);
                }
            } else {
                if read_side {
                    ops.insert(Interests::READ);
                }
                if write_side {
                    ops.insert(Interests::WRITE);
                }
            }
        }
    }
    ops
}
