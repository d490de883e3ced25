//! Per-transaction validation over persisted streams.
//!
//! Checks are user-supplied through the [`Checkable`] capability trait and
//! run against a loader-provided stream. Transactions are independent and
//! read-only once loaded, so `run` fans the stream's index range out over
//! a bounded worker pool; workers share the decoded columnar table and a
//! failure list, nothing else.
//!
//! Failure handling has two modes. In collect mode (the default) every
//! assertion failure is recorded with its source transaction and `run`
//! completes normally. With `assert_exception(true)` the first failure
//! cancels outstanding work and propagates out of `run`; when several
//! workers fail concurrently, the failure with the lowest persisted index
//! wins, which keeps the surfaced error deterministic.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::bus::Record;
use crate::errors::{Error, Result};
use crate::loader::Loader;
use crate::transaction::Transaction;

/// One assertion that did not hold, tied to its source transaction.
#[derive(Clone, Debug)]
pub struct CheckFailure {
    /// Id of the transaction whose check failed.
    pub txn_id: u64,
    /// Persisted index of the stream record the transaction came from.
    pub index: usize,
    pub message: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction {} (record {}): {}",
            self.txn_id, self.index, self.message
        )
    }
}

/// Assertion sink handed to every `check` invocation.
pub struct CheckContext<'a> {
    raise: bool,
    index: usize,
    txn_id: u64,
    failures: &'a mut Vec<CheckFailure>,
}

impl CheckContext<'_> {
    /// Record a failure when `condition` is false. In immediate-raise mode
    /// the failure is returned as an error so `?` aborts the check;
    /// otherwise it is collected and checking continues.
    pub fn assert_(
        &mut self,
        condition: bool,
        message: impl Into<String>,
    ) -> Result<(), CheckFailure> {
        if condition {
            return Ok(());
        }
        let failure = CheckFailure {
            txn_id: self.txn_id,
            index: self.index,
            message: message.into(),
        };
        if self.raise {
            Err(failure)
        } else {
            self.failures.push(failure);
            Ok(())
        }
    }

    /// Build a failure tied to the transaction under check, for conditions
    /// that short-circuit regardless of mode (e.g. a missing attribute).
    pub fn fail(&self, message: impl Into<String>) -> CheckFailure {
        CheckFailure {
            txn_id: self.txn_id,
            index: self.index,
            message: message.into(),
        }
    }
}

/// User-supplied validation. Implementations hold only immutable state;
/// the same instance is shared by every worker.
pub trait Checkable: Send + Sync {
    fn check(&self, txn: &Transaction, ctx: &mut CheckContext<'_>) -> Result<(), CheckFailure>;
}

pub struct Checker {
    inner: Arc<dyn Checkable>,
    assert_exception: bool,
    workers: usize,
}

impl Checker {
    pub fn new(inner: impl Checkable + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            assert_exception: false,
            workers: 4,
        }
    }

    /// Raise the first failure out of `run` instead of collecting.
    pub fn assert_exception(mut self, value: bool) -> Self {
        self.assert_exception = value;
        self
    }

    /// Size of the worker pool used by `run`.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Check every transaction of `topic` exactly once. Group topics are
    /// flattened: each member transaction is checked. Returns collected
    /// failures in persisted order, or the winning failure as an error in
    /// immediate-raise mode.
    pub fn run(&self, topic: &str, loader: &Loader) -> Result<Vec<CheckFailure>> {
        let stream = loader.stream(topic)?;
        let total = stream.len()?;
        if total == 0 {
            return Ok(Vec::new());
        }
        // decode errors should surface on the calling thread where possible
        stream.preload()?;

        let stream = Arc::new(stream);
        let workers = self.workers.min(total);
        let chunk = total.div_ceil(workers);
        let pool = Pool::<ThunkWorker<()>>::new(workers);

        let failures: Arc<Mutex<Vec<CheckFailure>>> = Arc::new(Mutex::new(Vec::new()));
        let io_errors: Arc<Mutex<Vec<Error>>> = Arc::new(Mutex::new(Vec::new()));
        let cancel = Arc::new(AtomicBool::new(false));
        let raise = self.assert_exception;

        for worker in 0..workers {
            let start = worker * chunk;
            let end = ((worker + 1) * chunk).min(total);
            if start >= end {
                break;
            }
            let stream = stream.clone();
            let inner = self.inner.clone();
            let failures = failures.clone();
            let io_errors = io_errors.clone();
            let cancel = cancel.clone();

            pool.execute(Thunk::of(move || {
                'records: for index in start..end {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let record = match stream.decode_at(index) {
                        Ok(record) => record,
                        Err(e) => {
                            io_errors.lock().unwrap().push(e);
                            cancel.store(true, Ordering::Relaxed);
                            break;
                        }
                    };
                    let txns: Vec<Arc<Transaction>> = match record {
                        Record::Transaction(txn) => vec![txn],
                        Record::Group(group) => group.transactions().to_vec(),
                        Record::Event(_) => continue,
                    };
                    for txn in txns {
                        let mut local = Vec::new();
                        let mut ctx = CheckContext {
                            raise,
                            index,
                            txn_id: txn.id(),
                            failures: &mut local,
                        };
                        let outcome = inner.check(&txn, &mut ctx);
                        if !local.is_empty() {
                            failures.lock().unwrap().extend(local);
                        }
                        if let Err(failure) = outcome {
                            failures.lock().unwrap().push(failure);
                            if raise {
                                cancel.store(true, Ordering::Relaxed);
                                break 'records;
                            }
                        }
                    }
                }
            }));
        }
        pool.join();

        if let Some(error) = io_errors.lock().unwrap().drain(..).next() {
            return Err(error);
        }

        let mut failures = std::mem::take(&mut *failures.lock().unwrap());
        failures.sort_by_key(|f| (f.index, f.txn_id));
        if raise {
            if let Some(first) = failures.into_iter().next() {
                return Err(Error::CheckFailed(first));
            }
            return Ok(Vec::new());
        }
        Ok(failures)
    }
}
