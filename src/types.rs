//! Shared types used across the client: reply values, call contexts,
//! pub/sub handles and pool statistics.

use crate::error::Error;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A value travelling over the command interface, in either direction.
///
/// Arguments are converted into `Value` before dispatch; replies come back as
/// `Value`. A missing key surfaces as [`Value::Nil`], never as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Absent value (nil reply).
    Nil,
    /// Integer reply.
    Int(i64),
    /// Bulk string (binary safe).
    Bytes(Bytes),
    /// Simple status string, e.g. `OK`.
    Status(String),
    /// Array reply.
    Array(Vec<Value>),
}

impl Value {
    /// View the value as raw bytes if it carries any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// View the value as UTF-8 text if it carries valid text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            Value::Status(s) => Some(s),
            _ => None,
        }
    }

    /// View the value as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Whether this is the nil reply.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(Bytes::from(s.into_bytes()))
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

/// The reply slot for one command of a pipeline.
#[derive(Debug, Clone)]
pub struct ReplyPair {
    /// Reply value; [`Value::Nil`] when the command failed.
    pub value: Value,
    /// Per-command error, kept in its slot regardless of other slots.
    pub error: Option<Error>,
}

/// The aggregate error of a pipeline: the first per-command error, if any.
pub fn first_error(replies: &[ReplyPair]) -> Option<Error> {
    replies.iter().find_map(|r| r.error.clone())
}

/// One message received from a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    /// The originating channel.
    pub channel: String,
    /// The message payload.
    pub data: Bytes,
}

/// An active subscription.
///
/// Messages are forwarded onto an internal buffered channel by a reader task;
/// the channel closes when the upstream subscription ends or after
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    pub(crate) messages: mpsc::Receiver<SubscribeMessage>,
    pub(crate) stop: CancellationToken,
}

impl Subscription {
    /// Receive the next message. Returns `None` once the subscription closed.
    pub async fn recv(&mut self) -> Option<SubscribeMessage> {
        self.messages.recv().await
    }

    /// Terminate the subscription. The message channel drains and closes.
    pub fn unsubscribe(&self) {
        self.stop.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// One entry of the server command catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    /// Uppercase command name.
    pub name: String,
    /// Command arity as reported by the server (negative = variadic).
    pub arity: i64,
    /// Whether the command only reads data.
    pub read_only: bool,
}

/// Connection pool statistics reported by the driver layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of times a free connection was found in the pool.
    pub hits: u64,
    /// Number of times a free connection was not found.
    pub misses: u64,
    /// Number of waits that ended in a pool timeout.
    pub timeouts: u64,
    /// Total connections in the pool.
    pub total_conns: u32,
    /// Idle connections in the pool.
    pub idle_conns: u32,
    /// Connections removed as stale.
    pub stale_conns: u32,
}

/// Cancellation and deadline scope for a single call.
///
/// Cancellation and deadline expiry are distinct outcomes: cancellation is
/// propagated as [`Error::Cancelled`](crate::error::Error::Cancelled) and is
/// never counted by circuit breakers, while a deadline expiry surfaces as
/// [`Error::DeadlineExceeded`](crate::error::Error::DeadlineExceeded) and is.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context expiring after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context driven by an external cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// A child context sharing this cancellation scope with a deadline that
    /// is the sooner of the existing one and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context (and every context sharing its token).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The absolute deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline has already passed.
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left until the deadline. `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from("foo").as_str(), Some("foo"));
        assert_eq!(Value::from(42i64).as_int(), Some(42));
        assert_eq!(Value::from(7usize), Value::Int(7));
        assert!(Value::Nil.is_nil());
        assert_eq!(Value::Status("OK".into()).as_str(), Some("OK"));
        assert_eq!(Value::from(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_first_error_picks_earliest() {
        let replies = vec![
            ReplyPair {
                value: Value::Int(1),
                error: None,
            },
            ReplyPair {
                value: Value::Nil,
                error: Some(Error::Server("ERR boom".into())),
            },
            ReplyPair {
                value: Value::Nil,
                error: Some(Error::Server("ERR later".into())),
            },
        ];
        assert_eq!(
            first_error(&replies),
            Some(Error::Server("ERR boom".into()))
        );
        assert_eq!(first_error(&replies[..1]), None);
    }

    #[test]
    fn test_context_deadline() {
        let ctx = Context::background();
        assert!(!ctx.deadline_exceeded());
        assert!(ctx.remaining().is_none());

        let ctx = Context::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.deadline_exceeded());

        let ctx = Context::with_timeout(Duration::from_secs(60));
        assert!(!ctx.deadline_exceeded());
        assert!(ctx.remaining().unwrap() > Duration::from_secs(59));
    }

    #[test]
    fn test_child_context_keeps_sooner_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(10));

        parent.cancel();
        assert!(child.is_cancelled());
    }
}
