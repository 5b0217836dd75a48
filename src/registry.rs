//! Registered event consumers.
//!
//! A registration binds a callback to a stream name and a key pattern. When
//! the compacting source applies an event it dispatches it to every
//! registration whose stream matches and whose pattern matches the whole
//! event key, in registration order.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::{ConsumerError, RegistryError};
use crate::event::Event;

/// Pattern used when a registration does not narrow the keys.
pub const MATCH_ALL: &str = ".*";

/// Callback invoked for each matching event.
pub type ConsumerCallback<T> = Arc<dyn Fn(&Event<T>) -> Result<(), ConsumerError> + Send + Sync>;

struct Registration<T> {
    stream_name: String,
    pattern: String,
    // `None` matches every key.
    key_matcher: Option<Regex>,
    callback: ConsumerCallback<T>,
}

impl<T> Registration<T> {
    fn matches(&self, key: &str) -> bool {
        self.key_matcher.as_ref().is_none_or(|m| m.is_match(key))
    }
}

/// Ordered set of consumer registrations.
pub struct ConsumerRegistry<T> {
    registrations: Vec<Registration<T>>,
}

impl<T> Default for ConsumerRegistry<T> {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }
}

impl<T> fmt::Debug for ConsumerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.registrations
                    .iter()
                    .map(|r| (r.stream_name.as_str(), r.pattern.as_str())),
            )
            .finish()
    }
}

impl<T> ConsumerRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every event of `stream_name` whose key matches
    /// `key_pattern` in full.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPattern`] if the pattern does not
    /// compile.
    pub fn register(
        &mut self,
        stream_name: impl Into<String>,
        key_pattern: &str,
        callback: impl Fn(&Event<T>) -> Result<(), ConsumerError> + Send + Sync + 'static,
    ) -> Result<(), RegistryError> {
        let key_matcher = Regex::new(&format!("^(?:{key_pattern})$")).map_err(|source| {
            RegistryError::InvalidPattern {
                pattern: key_pattern.to_owned(),
                source,
            }
        })?;
        self.registrations.push(Registration {
            stream_name: stream_name.into(),
            pattern: key_pattern.to_owned(),
            key_matcher: Some(key_matcher),
            callback: Arc::new(callback),
        });
        Ok(())
    }

    /// Register `callback` for every event of `stream_name`.
    pub fn register_all(
        &mut self,
        stream_name: impl Into<String>,
        callback: impl Fn(&Event<T>) -> Result<(), ConsumerError> + Send + Sync + 'static,
    ) {
        self.registrations.push(Registration {
            stream_name: stream_name.into(),
            pattern: MATCH_ALL.to_owned(),
            key_matcher: None,
            callback: Arc::new(callback),
        });
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Invoke every matching registration, in registration order.
    ///
    /// # Returns
    ///
    /// The number of callbacks invoked.
    ///
    /// # Errors
    ///
    /// Returns the first callback failure; later registrations are not
    /// invoked for this event.
    pub fn dispatch(&self, stream_name: &str, event: &Event<T>) -> Result<usize, ConsumerError> {
        let mut invoked = 0;
        for registration in self
            .registrations
            .iter()
            .filter(|r| r.stream_name == stream_name && r.matches(event.key()))
        {
            (registration.callback)(event)?;
            invoked += 1;
        }
        Ok(invoked)
    }
}
