//! Checker behavior over persisted streams: collect mode, immediate-raise
//! mode, and the query helper.

use benchtrace::{
    CheckContext, CheckFailure, Checkable, Checker, Error, Event, Loader, QueryHelper,
    StorageOptions, Serializer, Transaction, TransactionBatch,
};

/// Every event must satisfy `v == time`.
struct ValueMatchesTime;

impl Checkable for ValueMatchesTime {
    fn check(&self, txn: &Transaction, ctx: &mut CheckContext<'_>) -> Result<(), CheckFailure> {
        for event in txn.iter() {
            let v = event.get("v").map_err(|_| ctx.fail("v missing"))?;
            ctx.assert_(
                v.as_uint() == Some(event.time()),
                format!("expect {}, got {}", event.time(), v),
            )?;
        }
        Ok(())
    }
}

/// 10 transactions of 10 events each; event 99 carries a deviant value.
fn write_deviant_topic(dir: &std::path::Path) -> u64 {
    let serializer = Serializer::new(StorageOptions::local(dir)).unwrap();
    let mut batch = TransactionBatch::named("test");
    let mut bad_txn_id = 0;
    for t in 0..10u64 {
        let mut txn = Transaction::named("test");
        for i in (t * 10)..(t * 10 + 10) {
            let mut e = Event::at(i);
            e.add_value("v", if i == 99 { 101u64 } else { i });
            txn.add_event(e);
        }
        txn.finish();
        if t == 9 {
            bad_txn_id = txn.id();
        }
        batch.append(txn);
    }
    serializer.serialize_transactions(&batch).unwrap();
    serializer.finalize().unwrap();
    bad_txn_id
}

#[test]
fn collect_mode_records_the_failing_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let bad_txn_id = write_deviant_topic(dir.path());
    let loader = Loader::open(dir.path()).unwrap();

    let failures = Checker::new(ValueMatchesTime)
        .workers(4)
        .run("test", &loader)
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].txn_id, bad_txn_id);
    assert_eq!(failures[0].index, 9);
    assert!(failures[0].message.contains("expect 99"));
}

#[test]
fn immediate_raise_mode_propagates_out_of_run() {
    let dir = tempfile::tempdir().unwrap();
    let bad_txn_id = write_deviant_topic(dir.path());
    let loader = Loader::open(dir.path()).unwrap();

    let result = Checker::new(ValueMatchesTime)
        .assert_exception(true)
        .workers(4)
        .run("test", &loader);
    match result {
        Err(Error::CheckFailed(failure)) => {
            assert_eq!(failure.txn_id, bad_txn_id);
            assert_eq!(failure.index, 9);
        }
        other => panic!("expected CheckFailed, got {other:?}"),
    }
}

#[test]
fn clean_streams_check_clean() {
    use rand::Rng;

    let dir = tempfile::tempdir().unwrap();
    let serializer = Serializer::new(StorageOptions::local(dir.path())).unwrap();
    let mut batch = TransactionBatch::named("clean");
    // jittered transaction sizes; the invariant holds regardless
    let mut rng = rand::rng();
    let mut time = 0u64;
    for _ in 0..50 {
        let mut txn = Transaction::named("clean");
        for _ in 0..rng.random_range(1..=8) {
            let mut e = Event::at(time);
            e.add_value("v", time);
            time += 1;
            txn.add_event(e);
        }
        txn.finish();
        batch.append(txn);
    }
    serializer.serialize_transactions(&batch).unwrap();
    serializer.finalize().unwrap();

    let loader = Loader::open(dir.path()).unwrap();
    let failures = Checker::new(ValueMatchesTime)
        .workers(8)
        .run("clean", &loader)
        .unwrap();
    assert!(failures.is_empty());

    let raised = Checker::new(ValueMatchesTime)
        .assert_exception(true)
        .run("clean", &loader)
        .unwrap();
    assert!(raised.is_empty());
}

#[test]
fn query_helper_time_windows() {
    let dir = tempfile::tempdir().unwrap();
    let serializer = Serializer::new(StorageOptions::local(dir.path())).unwrap();
    let mut batch = TransactionBatch::named("q");
    for t in 0..10u64 {
        let mut txn = Transaction::named("q");
        for i in (t * 10)..(t * 10 + 10) {
            let mut e = Event::at(i);
            e.add_value("v", i);
            txn.add_event(e);
        }
        txn.finish();
        batch.append(txn);
    }
    serializer.serialize_transactions(&batch).unwrap();
    serializer.finalize().unwrap();

    let loader = Loader::open(dir.path()).unwrap();
    let query = QueryHelper::new(&loader);

    // transactions span [t*10, t*10+9]; window [15, 25] overlaps two
    let txns = query.transactions_between("q", 15, 25).unwrap();
    assert_eq!(txns.len(), 2);

    let events = query.events_between("q", 15, 25).unwrap();
    assert_eq!(events.len(), 11);

    // sidecar time span prunes disjoint windows without decoding
    let none = query.transactions_between("q", 1000, 2000).unwrap();
    assert!(none.is_empty());

    let second = txns.get(0).unwrap();
    let next = query.next_transaction("q", second).unwrap().unwrap();
    assert_eq!(next.start_time(), second.end_time() + 1);
}
