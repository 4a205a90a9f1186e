//! A fast, tokio-based database connection pool.
//!
//! Opening a new database connection every time one is needed is both
//! inefficient and can lead to resource exhaustion under high traffic
//! conditions. A connection pool maintains a set of open connections to a
//! database, handing them out for repeated use.
//!
//! duffel is agnostic to the connection type it is managing. Implementors of
//! the [`ManageConnection`] trait provide the database-specific logic to
//! create connections and check their health.
//!
//! Internally the pool is built around a concurrent bag: connections move
//! through an atomic state machine instead of behind a pool-wide lock,
//! releases hand connections directly to parked waiters, and every thread
//! keeps a small cache of its recent releases so an uncontended borrow never
//! touches shared state. A background housekeeper retires connections past
//! their maximum lifetime or idle timeout and keeps at least `min_idle`
//! ready to go.
//!
//! # Example
//!
//! Using an imaginary "foodb" database.
//!
//! ```ignore
//! use duffel;
//! use duffel_foodb;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = duffel_foodb::FooConnectionManager::new("localhost:1234");
//!     let pool = duffel::Pool::builder().build(manager).await.unwrap();
//!
//!     for _ in 0..20 {
//!         let pool = pool.clone();
//!         tokio::spawn(async move {
//!             let conn = pool.get().await.unwrap();
//!             // use the connection
//!             // it will be returned to the pool when it falls out of scope.
//!         });
//!     }
//! }
//! ```
#![allow(clippy::needless_doctest_main)]
#![deny(missing_docs, missing_debug_implementations)]

mod bag;
mod clock;
mod config;
mod conn;
mod entry;
mod error;
mod housekeeper;
mod pool;

pub use crate::config::Builder;
pub use crate::conn::{Dirty, PooledConnection};
pub use crate::error::{PoolError, SuspensionDisabled};
pub use crate::pool::{Pool, State};

use async_trait::async_trait;

/// A trait which provides connection-specific functionality.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    /// The connection type this manager deals with.
    type Connection: Send + 'static;
    /// The error type returned by `Connection`s.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempts to create a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Runs once on each new connection before it enters the pool, e.g. to
    /// apply session initialization statements.
    async fn on_create(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Determines if the connection is still connected to the database.
    ///
    /// Called on checkout for candidates that have sat idle longer than the
    /// alive bypass window, bounded by the pool's `validation_timeout`.
    /// Drivers with a native validity check should use it here; others can
    /// issue a lightweight test query.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// Synchronously determine if the connection is no longer usable, if
    /// possible. Checked on release; broken connections are discarded
    /// instead of returned to the pool.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Restores the session attributes named in `dirty` to the pool default
    /// before the connection is reused.
    async fn reset(
        &self,
        _conn: &mut Self::Connection,
        _dirty: Dirty,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}
