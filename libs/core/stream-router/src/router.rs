//! Pattern router
//!
//! Maps a routing path such as `localhost:9092/orders/3` to a registered
//! handler. Dispatch prefers an exact match, then the longest registered
//! pattern that is a string prefix of the path.
//!
//! ```text
//! entries (sorted by pattern length, descending)
//!   localhost:9092/orders/3   ─┐
//!   localhost:9092/orders     ─┼─ first prefix hit wins
//!   localhost:9092            ─┘
//! ```
//!
//! A third segment starting with `#` marks a wildcard route. The marker is
//! stripped and the stripped pattern is what gets indexed.

use crate::error::RouteError;
use crate::event::Event;
use crate::handler::{BoxHandler, Handler, ProcessingOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Path segment separator.
pub const SEPARATOR: char = '/';

/// Leading character marking a wildcard segment.
pub const WILDCARD_MARKER: char = '#';

/// Index of the segment that may carry the wildcard marker.
const WILDCARD_SEGMENT: usize = 2;

/// One registration.
struct RouteEntry {
    pattern: String,
    handler: BoxHandler,
    wildcard: bool,
}

/// Result of a successful dispatch.
#[derive(Clone)]
pub struct RouteMatch<'a> {
    pub handler: &'a BoxHandler,
    pub pattern: &'a str,
    pub wildcard: bool,
}

/// Owned routing table. Build it at startup, then share it read-only.
#[derive(Default)]
pub struct RouteTable {
    exact: HashMap<String, Arc<RouteEntry>>,
    entries: Vec<Arc<RouteEntry>>,
    not_found: Option<BoxHandler>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler invoked by [`RouteTable::route`] when nothing matches.
    pub fn with_not_found(mut self, handler: BoxHandler) -> Self {
        self.not_found = Some(handler);
        self
    }

    /// Register `handler` under `pattern`.
    ///
    /// Fails on an empty pattern, a bare wildcard marker, or a pattern that is
    /// already registered after normalization. These are configuration errors
    /// and should stop the process from starting.
    pub fn register(
        &mut self,
        pattern: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), RouteError> {
        self.register_shared(pattern, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn register_shared(&mut self, pattern: &str, handler: BoxHandler) -> Result<(), RouteError> {
        let (pattern, wildcard) = normalize(pattern)?;

        if self.exact.contains_key(&pattern) {
            return Err(RouteError::DuplicatePattern(pattern));
        }

        let entry = Arc::new(RouteEntry {
            pattern: pattern.clone(),
            handler,
            wildcard,
        });

        // Equal-length patterns keep registration order.
        let position = self
            .entries
            .partition_point(|e| e.pattern.len() >= entry.pattern.len());
        self.entries.insert(position, Arc::clone(&entry));
        self.exact.insert(pattern, entry);

        debug!(routes = self.entries.len(), "Registered route");
        Ok(())
    }

    /// Resolve the handler for `path`.
    pub fn dispatch(&self, path: &str) -> Result<RouteMatch<'_>, RouteError> {
        if let Some(entry) = self.exact.get(path) {
            return Ok(entry.as_match());
        }

        self.entries
            .iter()
            .find(|e| path.starts_with(e.pattern.as_str()))
            .map(|e| e.as_match())
            .ok_or_else(|| RouteError::NotFound(path.to_string()))
    }

    /// Dispatch `event` by its routing path and invoke the handler.
    ///
    /// Falls back to the not-found handler on a miss; without one the miss is
    /// returned to the caller.
    pub async fn route(&self, event: Event) -> Result<ProcessingOutcome, RouteError> {
        match self.dispatch(event.routing_path()) {
            Ok(route) => {
                debug!(
                    path = %event.routing_path(),
                    pattern = %route.pattern,
                    wildcard = route.wildcard,
                    "Dispatching event"
                );
                Ok(route.handler.handle(event).await)
            }
            Err(miss) => match &self.not_found {
                Some(handler) => Ok(handler.handle(event).await),
                None => Err(miss),
            },
        }
    }

    /// Registered patterns, longest first.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.pattern.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RouteEntry {
    fn as_match(&self) -> RouteMatch<'_> {
        RouteMatch {
            handler: &self.handler,
            pattern: &self.pattern,
            wildcard: self.wildcard,
        }
    }
}

#[async_trait]
impl Handler for RouteTable {
    /// A miss with no not-found handler is logged and skipped.
    async fn handle(&self, event: Event) -> ProcessingOutcome {
        match self.route(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Routing miss, skipping event");
                ProcessingOutcome::Skip
            }
        }
    }
}

/// Strip one trailing separator and the wildcard marker.
fn normalize(pattern: &str) -> Result<(String, bool), RouteError> {
    let trimmed = pattern.strip_suffix(SEPARATOR).unwrap_or(pattern);
    if trimmed.is_empty() {
        return Err(RouteError::EmptyPattern(pattern.to_string()));
    }

    let mut segments: Vec<&str> = trimmed.split(SEPARATOR).collect();
    let mut wildcard = false;
    if let Some(stripped) = segments
        .get(WILDCARD_SEGMENT)
        .copied()
        .and_then(|segment| segment.strip_prefix(WILDCARD_MARKER))
    {
        if stripped.is_empty() {
            return Err(RouteError::InvalidWildcard(pattern.to_string()));
        }
        segments[WILDCARD_SEGMENT] = stripped;
        wildcard = true;
    }

    Ok((segments.join("/"), wildcard))
}
