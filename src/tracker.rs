//! Event→transaction aggregation.
//!
//! A tracker subscribes to an event topic and folds the event stream into
//! transactions. The grouping policy is entirely user-supplied through the
//! [`Trackable`] capability trait — fixed-size windows, time boundaries and
//! id ranges are all equally valid — and the framework only handles the
//! wiring: subscription, naming, and re-publication of finished
//! transactions onto the bus.

use std::sync::{Arc, Mutex};

use crate::bus::{Bus, BusSubscriber, Record};
use crate::errors::Result;
use crate::event::Event;
use crate::serializer::Serializer;
use crate::transaction::Transaction;

/// Per-invocation services handed to a [`Trackable`].
pub struct TrackContext {
    txn_topic: String,
    outbox: Vec<(String, Record)>,
}

impl TrackContext {
    fn new(txn_topic: &str) -> Self {
        Self {
            txn_topic: txn_topic.to_string(),
            outbox: Vec::new(),
        }
    }

    /// Allocate a fresh transaction, already named for the tracker's
    /// output topic and registered for eventual re-publication (delivery
    /// happens when the implementation returns it finished).
    pub fn new_transaction(&self) -> Transaction {
        Transaction::named(&self.txn_topic)
    }

    /// Queue a derived record for publication under an explicit topic once
    /// the current `track` call returns — e.g. fanning a transaction group
    /// into its own stream.
    pub fn emit(&mut self, topic: impl Into<String>, record: Record) {
        self.outbox.push((topic.into(), record));
    }
}

/// User-supplied aggregation state machine.
///
/// `track` is invoked once per matching event, in publish order. Return a
/// transaction only once `finish()` has been called on it; the framework
/// publishes it under the tracker's transaction topic. Per open
/// transaction the machine moves through idle → accumulating → finished;
/// the framework does not constrain how events map onto those states.
pub trait Trackable: Send {
    fn track(&mut self, ctx: &mut TrackContext, event: Arc<Event>) -> Option<Transaction>;

    /// Called at flush time: hand back any transactions that were finished
    /// but not yet returned from `track`. The default has none.
    fn drain(&mut self, _ctx: &mut TrackContext) -> Vec<Transaction> {
        Vec::new()
    }
}

struct TrackerNode {
    bus: Arc<Bus>,
    txn_topic: String,
    inner: Box<dyn Trackable>,
}

impl TrackerNode {
    fn publish_finished(&self, mut txn: Transaction) -> Result<()> {
        debug_assert!(txn.finished());
        if txn.name().is_empty() {
            txn.set_name(&self.txn_topic);
        }
        self.bus
            .publish(&self.txn_topic, Record::Transaction(Arc::new(txn)))
    }

    fn drain_outbox(&self, ctx: TrackContext) -> Result<()> {
        for (topic, record) in ctx.outbox {
            self.bus.publish(&topic, record)?;
        }
        Ok(())
    }
}

impl BusSubscriber for TrackerNode {
    fn on_record(&mut self, _topic: &str, record: Record) -> Result<()> {
        // trackers consume events; transactions and groups pass through
        let Record::Event(event) = record else {
            return Ok(());
        };
        let mut ctx = TrackContext::new(&self.txn_topic);
        let finished = self.inner.track(&mut ctx, event);
        if let Some(txn) = finished {
            self.publish_finished(txn)?;
        }
        self.drain_outbox(ctx)
    }

    fn flush(&mut self) -> Result<()> {
        let mut ctx = TrackContext::new(&self.txn_topic);
        for txn in self.inner.drain(&mut ctx) {
            self.publish_finished(txn)?;
        }
        self.drain_outbox(ctx)
    }
}

/// Subscription wiring around a [`Trackable`].
pub struct Tracker {
    bus: Arc<Bus>,
    txn_topic: String,
}

impl Tracker {
    /// Subscribe `inner` to `pattern` on `bus`; finished transactions are
    /// re-published under `txn_topic`.
    pub fn new(
        bus: &Arc<Bus>,
        pattern: impl Into<String>,
        txn_topic: impl Into<String>,
        inner: impl Trackable + 'static,
    ) -> Self {
        let txn_topic = txn_topic.into();
        let node = Arc::new(Mutex::new(TrackerNode {
            bus: bus.clone(),
            txn_topic: txn_topic.clone(),
            inner: Box::new(inner),
        }));
        bus.subscribe(pattern, node);
        Self {
            bus: bus.clone(),
            txn_topic,
        }
    }

    pub fn transaction_topic(&self) -> &str {
        &self.txn_topic
    }

    /// Chain a serializer onto this tracker's output topic.
    pub fn connect(&self, serializer: &Serializer) {
        serializer.connect(&self.bus, &self.txn_topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Logger;

    /// Start a transaction every `window`-th event, finish on the last
    /// event of the window.
    struct WindowTracker {
        window: u64,
        count: u64,
        current: Option<Transaction>,
    }

    impl WindowTracker {
        fn new(window: u64) -> Self {
            Self {
                window,
                count: 0,
                current: None,
            }
        }
    }

    impl Trackable for WindowTracker {
        fn track(&mut self, ctx: &mut TrackContext, event: Arc<Event>) -> Option<Transaction> {
            if self.count % self.window == 0 {
                self.current = Some(ctx.new_transaction());
            }
            let txn = self.current.as_mut().expect("window opened above");
            txn.add_event(event);
            self.count += 1;
            if self.count % self.window == 0 {
                let mut txn = self.current.take().expect("window open");
                txn.finish();
                return Some(txn);
            }
            None
        }
    }

    #[derive(Default)]
    struct Collect {
        txns: Vec<Arc<Transaction>>,
    }

    impl BusSubscriber for Collect {
        fn on_record(&mut self, _topic: &str, record: Record) -> Result<()> {
            if let Record::Transaction(t) = record {
                self.txns.push(t);
            }
            Ok(())
        }
    }

    #[test]
    fn window_tracker_builds_transactions() {
        let bus = Bus::new();
        let _tracker = Tracker::new(&bus, "dut", "test", WindowTracker::new(10));
        let sink = Arc::new(Mutex::new(Collect::default()));
        bus.subscribe("test", sink.clone());

        let logger = Logger::new(&bus, "dut");
        for i in 0..100u64 {
            let mut e = Event::at(i);
            e.add_value("v", i);
            logger.log(e).unwrap();
        }
        bus.flush().unwrap();

        let sink = sink.lock().unwrap();
        assert_eq!(sink.txns.len(), 10);
        for txn in &sink.txns {
            assert_eq!(txn.len(), 10);
            assert_eq!(txn.name(), "test");
            assert!(txn.finished());
        }
        // events land in publish order
        let first = &sink.txns[0];
        assert_eq!(first.get(0).unwrap().time(), 0);
        assert_eq!(first.get(-1).unwrap().time(), 9);
    }
}
