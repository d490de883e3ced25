//! benchtrace - trace logging, columnar persistence, and checking for
//! hardware-simulation testbenches.
//!
//! Events published during a simulation run are aggregated into
//! transactions, persisted as Parquet payloads with JSON metadata
//! sidecars, and reloaded later as lazy streams for automated checking.
//!
//! # Modules
//!
//! - [`bus`] - publish/subscribe dispatch and the topic-bound [`Logger`]
//! - [`tracker`] - event→transaction aggregation state machines
//! - [`serializer`] - buffered columnar persistence
//! - [`loader`] / [`stream`] - metadata-indexed reloading and lazy streams
//! - [`checker`] - parallel per-transaction validation
//! - [`query`] - bulk time-window queries
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use benchtrace::{
//!     Bus, Checker, CheckContext, CheckFailure, Checkable, Event, Loader,
//!     Logger, Serializer, StorageOptions, TrackContext, Trackable, Tracker,
//!     Transaction,
//! };
//!
//! struct Window {
//!     current: Option<Transaction>,
//! }
//!
//! impl Trackable for Window {
//!     fn track(&mut self, ctx: &mut TrackContext, event: Arc<Event>) -> Option<Transaction> {
//!         let txn = self
//!             .current
//!             .get_or_insert_with(|| ctx.new_transaction());
//!         txn.add_event(event);
//!         if txn.len() == 10 {
//!             let mut done = self.current.take().unwrap();
//!             done.finish();
//!             return Some(done);
//!         }
//!         None
//!     }
//! }
//!
//! struct NonDecreasing;
//!
//! impl Checkable for NonDecreasing {
//!     fn check(&self, txn: &Transaction, ctx: &mut CheckContext<'_>) -> Result<(), CheckFailure> {
//!         let mut last = 0;
//!         for event in txn.iter() {
//!             ctx.assert_(event.time() >= last, "time went backwards")?;
//!             last = event.time();
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> benchtrace::Result<()> {
//! let bus = Bus::new();
//! let serializer = Serializer::new(StorageOptions::local("./trace"))?;
//! let tracker = Tracker::new(&bus, "dut", "test", Window { current: None });
//! tracker.connect(&serializer);
//!
//! let logger = Logger::new(&bus, "dut");
//! for i in 0..100u64 {
//!     logger.log(Event::at(i))?;
//! }
//! bus.flush()?;
//! serializer.finalize()?;
//!
//! let loader = Loader::open("./trace")?;
//! Checker::new(NonDecreasing).run("test", &loader)?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod bus;
pub mod checker;
pub mod errors;
pub mod event;
pub mod loader;
pub mod query;
pub mod schema;
pub mod serializer;
pub mod storage;
pub mod stream;
pub mod tracker;
pub mod transaction;
mod util;
pub mod value;

pub use batch::{Batch, EventBatch, GroupBatch, TransactionBatch};
pub use bus::{Bus, BusSubscriber, Logger, Record};
pub use checker::{CheckContext, CheckFailure, Checkable, Checker};
pub use errors::{Error, Result};
pub use event::{reset_id_allocators, Event};
pub use loader::Loader;
pub use query::QueryHelper;
pub use schema::{AttrSchema, TopicKind, TopicMeta};
pub use serializer::Serializer;
pub use storage::{StorageHandle, StorageOptions};
pub use stream::Stream;
pub use tracker::{TrackContext, Trackable, Tracker};
pub use transaction::{Transaction, TransactionGroup};
pub use value::{AttrType, AttrValue};
