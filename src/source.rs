//! External data-source capability.
//!
//! The engine never talks to a database directly; it consumes the
//! [`FeedSource`] trait, an opaque capability set over whatever client
//! library actually issues the subscription query and pulls batches.
//!
//! # Lifecycle
//!
//! 1. `open()` - run the subscription query, yielding a streaming cursor
//!    and the first batch
//! 2. `next()` - pull the next batch from the cursor, repeatedly
//! 3. `close()` - release the cursor
//!
//! Handle types (`Query`, `Conn`, `Cursor`) are cheaply cloneable values;
//! `next` may be invoked from a different task than the one that opened
//! the cursor, but never concurrently for the same subscription.

use async_trait::async_trait;

use crate::change::ChangeBatch;
use crate::error::SourceError;

/// Capability over the external query/connection client.
///
/// Implementations map their client library's failures onto the
/// [`SourceError`] taxonomy: retriable conditions to `Transient`, query
/// rejections to `Fatal`, and out-of-band closure to `Closed`. A fetch
/// result the implementation cannot make sense of should be reported as
/// `Transient` so the engine tears the cursor down and reconnects.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// Opaque description of the subscription query.
    type Query: Clone + Send + Sync + 'static;

    /// Opaque connection handle the query runs against.
    type Conn: Clone + Send + Sync + 'static;

    /// Opaque handle to a live streaming cursor.
    type Cursor: Clone + Send + Sync + 'static;

    /// Executes the subscription query against a connection.
    ///
    /// On success returns the streaming cursor together with the first
    /// batch the subscription produced.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the subscription could not be
    /// established.
    async fn open(
        &self,
        query: &Self::Query,
        conn: &Self::Conn,
    ) -> Result<(Self::Cursor, ChangeBatch), SourceError>;

    /// Pulls the next batch from a streaming cursor.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the pull failed.
    async fn next(&self, cursor: &Self::Cursor) -> Result<ChangeBatch, SourceError>;

    /// Releases a streaming cursor. Best effort; never fails.
    async fn close(&self, cursor: &Self::Cursor);
}
