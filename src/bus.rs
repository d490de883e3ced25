//! Publish/subscribe dispatch for trace records.
//!
//! One bus instance is created per run and handed (as an `Arc`) to every
//! logger, tracker, and serializer that needs it. The write path is a
//! single logical producer thread: delivery happens synchronously inside
//! `publish`, so per-topic FIFO order holds by construction and `flush()`
//! only has to drain subscriber-side buffers.
//!
//! A subscriber must not publish to a topic matching its own subscription;
//! dispatch holds the subscriber's lock while it runs.

use std::sync::{Arc, Mutex};

use serde::ser::{Serialize, Serializer};

use crate::errors::Result;
use crate::event::Event;
use crate::transaction::{Transaction, TransactionGroup};

/// Any record that can flow over the bus.
#[derive(Clone, Debug)]
pub enum Record {
    Event(Arc<Event>),
    Transaction(Arc<Transaction>),
    Group(Arc<TransactionGroup>),
}

impl Record {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Record::Event(_) => "event",
            Record::Transaction(_) => "transaction",
            Record::Group(_) => "group",
        }
    }

    pub fn as_transaction(&self) -> Option<&Arc<Transaction>> {
        match self {
            Record::Transaction(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Arc<TransactionGroup>> {
        match self {
            Record::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&Arc<Event>> {
        match self {
            Record::Event(e) => Some(e),
            _ => None,
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Record::Event(e) => e.serialize(serializer),
            Record::Transaction(t) => t.serialize(serializer),
            Record::Group(g) => g.serialize(serializer),
        }
    }
}

/// Capability interface for bus consumers.
pub trait BusSubscriber: Send {
    fn on_record(&mut self, topic: &str, record: Record) -> Result<()>;

    /// Drain any buffered derived work. Called from [`Bus::flush`].
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Subscription {
    pattern: String,
    subscriber: Arc<Mutex<dyn BusSubscriber>>,
}

/// Returns true when `pattern` matches `topic`. `"*"` matches everything;
/// a trailing `*` matches by prefix; anything else is an exact match.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return topic.starts_with(prefix);
    }
    pattern == topic
}

/// Process-wide dispatcher with an explicit lifecycle: construct once per
/// run, subscribe, publish, flush at end of run.
#[derive(Default)]
pub struct Bus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Bus {
    pub fn new() -> Arc<Bus> {
        Arc::new(Bus::default())
    }

    pub fn subscribe(&self, pattern: impl Into<String>, subscriber: Arc<Mutex<dyn BusSubscriber>>) {
        let mut subs = self.subscriptions.lock().unwrap();
        subs.push(Subscription {
            pattern: pattern.into(),
            subscriber,
        });
    }

    /// Deliver `record` to every matching subscriber, in subscription
    /// order. The subscription list lock is released before dispatch so a
    /// subscriber may publish derived records to other topics.
    pub fn publish(&self, topic: &str, record: Record) -> Result<()> {
        let matching: Vec<Arc<Mutex<dyn BusSubscriber>>> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .filter(|s| topic_matches(&s.pattern, topic))
                .map(|s| s.subscriber.clone())
                .collect()
        };
        for subscriber in matching {
            subscriber.lock().unwrap().on_record(topic, record.clone())?;
        }
        Ok(())
    }

    /// Synchronous barrier: every record published before this call has
    /// been delivered (delivery is synchronous) and every subscriber has
    /// drained its buffers when this returns.
    pub fn flush(&self) -> Result<()> {
        let subscribers: Vec<Arc<Mutex<dyn BusSubscriber>>> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter().map(|s| s.subscriber.clone()).collect()
        };
        for subscriber in subscribers {
            subscriber.lock().unwrap().flush()?;
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

/// Topic-bound producer handle.
#[derive(Clone)]
pub struct Logger {
    bus: Arc<Bus>,
    topic: String,
}

impl Logger {
    pub fn new(bus: &Arc<Bus>, topic: impl Into<String>) -> Self {
        Self {
            bus: bus.clone(),
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an event under the bound topic. The event is frozen from
    /// here on.
    pub fn log(&self, event: Event) -> Result<()> {
        self.bus.publish(&self.topic, Record::Event(Arc::new(event)))
    }

    pub fn log_transaction(&self, txn: Transaction) -> Result<()> {
        self.bus
            .publish(&self.topic, Record::Transaction(Arc::new(txn)))
    }

    pub fn log_group(&self, group: TransactionGroup) -> Result<()> {
        self.bus.publish(&self.topic, Record::Group(Arc::new(group)))
    }

    /// Publish under an explicit topic instead of the bound one — used to
    /// fan a derived record into a separate stream from its source events.
    pub fn log_to(&self, topic: &str, record: Record) -> Result<()> {
        self.bus.publish(topic, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink {
        seen: Vec<(String, &'static str)>,
    }

    impl BusSubscriber for Sink {
        fn on_record(&mut self, topic: &str, record: Record) -> Result<()> {
            self.seen.push((topic.to_string(), record.kind_name()));
            Ok(())
        }
    }

    #[test]
    fn pattern_matching() {
        assert!(topic_matches("*", "anything"));
        assert!(topic_matches("dut.*", "dut.cache"));
        assert!(!topic_matches("dut.*", "cpu.cache"));
        assert!(topic_matches("test", "test"));
        assert!(!topic_matches("test", "test2"));
    }

    #[test]
    fn fifo_delivery_per_topic() {
        let bus = Bus::new();
        let sink = Arc::new(Mutex::new(Sink::default()));
        bus.subscribe("test", sink.clone());

        let logger = Logger::new(&bus, "test");
        for i in 0..10u64 {
            logger.log(Event::at(i)).unwrap();
        }
        bus.flush().unwrap();

        let sink = sink.lock().unwrap();
        assert_eq!(sink.seen.len(), 10);
        assert!(sink.seen.iter().all(|(t, k)| t == "test" && *k == "event"));
    }

    #[test]
    fn wildcard_sees_everything_exact_does_not() {
        let bus = Bus::new();
        let wild = Arc::new(Mutex::new(Sink::default()));
        let exact = Arc::new(Mutex::new(Sink::default()));
        bus.subscribe("*", wild.clone());
        bus.subscribe("a", exact.clone());

        let logger = Logger::new(&bus, "a");
        logger.log(Event::new()).unwrap();
        logger.log_to("b", Record::Event(Arc::new(Event::new()))).unwrap();

        assert_eq!(wild.lock().unwrap().seen.len(), 2);
        assert_eq!(exact.lock().unwrap().seen.len(), 1);
    }
}
