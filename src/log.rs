//! Durable record of compaction results.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use futures_util::future::{self, BoxFuture};
use thiserror::Error;

use crate::catalog::AddedTrie;

/// Position of a message in the log.
pub type LogOffset = u64;

/// Messages the compactor appends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogMessage {
    /// Tries published by one job.
    TriesAdded(Vec<AddedTrie>),
}

/// Errors raised by a [`Log`].
#[derive(Debug, Error)]
pub enum LogError {
    /// The log no longer accepts appends.
    #[error("log closed")]
    Closed,
    /// The log gave up on an append after its own retries.
    #[error("log append failed: {0}")]
    Append(String),
}

/// Transaction log the compactor publishes to.
///
/// The returned future resolves once the message is durable; retrying
/// transient failures is up to the implementation.
pub trait Log: Send + Sync + fmt::Debug {
    /// Append `message`.
    fn append_message(&self, message: LogMessage) -> BoxFuture<'static, Result<LogOffset, LogError>>;
}

/// Log that keeps messages in memory; appends are durable immediately.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    messages: Mutex<Vec<LogMessage>>,
}

impl InMemoryLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every appended message, oldest first.
    pub fn messages(&self) -> Vec<LogMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Log for InMemoryLog {
    fn append_message(&self, message: LogMessage) -> BoxFuture<'static, Result<LogOffset, LogError>> {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = messages.len() as LogOffset;
        messages.push(message);
        Box::pin(future::ready(Ok(offset)))
    }
}
