//! Persistence coordination for the Chorus homeserver.
//!
//! This crate sits between request handling and the storage engine. It hands
//! out stream positions, keeps in-memory change indexes so hot queries can
//! skip the database, composes the domain stores into one [`DataStore`], and
//! refuses to start against a database created under a different server name.
//!
//! # Startup
//!
//! ```no_run
//! use std::sync::Arc;
//! use chorusstore::{prepare_database, DataStore, SqliteDatabase, StoreConfig, SystemClock};
//!
//! # async fn run() -> chorusstore::Result<()> {
//! let config = StoreConfig::default();
//! let db = Arc::new(SqliteDatabase::open("homeserver.db")?);
//! prepare_database(db.as_ref(), &config.server_name).await?;
//! let store = DataStore::new(db, Arc::new(SystemClock), config).await?;
//! println!("{:?}", store.current_tokens());
//! # Ok(())
//! # }
//! ```

pub mod change_cache;
pub mod clock;
pub mod consistency;
pub mod data_store;
pub mod database;
pub mod error;
pub mod fault;
pub mod sqlite;
pub mod stores;
pub mod stream_id;
pub mod types;

pub use change_cache::{CacheAnswer, StreamChangeCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use consistency::{check_database_before_upgrade, prepare_database};
pub use data_store::{DataStore, StoreConfig};
pub use database::{CachePrime, CachePrimeQuery, ConsistencyCursor, Database, StreamCounters};
pub use error::{Result, StoreError};
pub use fault::{FaultRecord, FaultRecordError};
pub use sqlite::SqliteDatabase;
pub use stream_id::{Reservation, StreamIdGenerator};
pub use types::StreamToken;
