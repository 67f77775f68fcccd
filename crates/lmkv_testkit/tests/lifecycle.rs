//! Handle lifecycle: transaction states, thread binding, closing.

use lmkv_core::{
    CoreError, DatabaseFlags, EnvConfig, Environment, InterruptSignal, TransactionState,
};
use lmkv_testkit::TestEnv;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn committing_parent_terminates_open_child() {
    let test_env = TestEnv::memory();
    let db = test_env.main_db();

    let parent = test_env.begin().unwrap();
    let child = parent.begin_nested().unwrap();
    child.put(&db, b"k", b"v").unwrap();
    let cursor = child.cursor(&db).unwrap();

    parent.commit().unwrap();

    assert!(child.state().is_terminal());
    assert!(matches!(child.commit(), Err(CoreError::TransactionTerminated)));
    assert!(matches!(child.abort(), Err(CoreError::TransactionTerminated)));
    assert!(matches!(
        child.get(&db, b"k"),
        Err(CoreError::TransactionTerminated)
    ));
    assert!(cursor.is_closed());
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn transaction_is_bound_to_its_thread() {
    let test_env = TestEnv::memory();
    let db = test_env.main_db();
    let txn = test_env.begin().unwrap();

    let env = test_env.env.clone();
    let remote = txn.clone();
    let db2 = db.clone();
    thread::spawn(move || {
        assert!(env.active_transaction().unwrap().is_none());
        assert!(matches!(
            remote.put(&db2, b"k", b"v"),
            Err(CoreError::WrongThread)
        ));
        assert!(matches!(remote.abort(), Err(CoreError::WrongThread)));
        assert!(matches!(remote.begin_nested(), Err(CoreError::WrongThread)));
    })
    .join()
    .unwrap();

    assert!(txn.is_open());
    assert_eq!(test_env.active_transaction().unwrap(), Some(txn.clone()));
    txn.commit().unwrap();
}

#[test]
fn put_get_round_trip_and_visibility() {
    let test_env = TestEnv::memory();
    let db = test_env.main_db();

    let txn = test_env.begin().unwrap();
    txn.put(&db, b"kept", b"1").unwrap();
    assert_eq!(txn.get(&db, b"kept").unwrap(), Some(b"1".to_vec()));
    txn.commit().unwrap();
    let visible = test_env
        .read_transaction(|read| read.get(&db, b"kept"))
        .unwrap();
    assert_eq!(visible, Some(b"1".to_vec()));

    let txn = test_env.begin().unwrap();
    txn.put(&db, b"lost", b"1").unwrap();
    txn.abort().unwrap();
    assert_eq!(db.get(b"lost").unwrap(), None);
}

#[test]
fn readers_see_a_snapshot() {
    let test_env = TestEnv::memory();
    let db = test_env.main_db();
    db.put(b"k", b"old").unwrap();

    let reader = test_env.begin_read().unwrap();
    let env = test_env.env.clone();
    let db2 = db.clone();
    thread::spawn(move || env.transaction(|_| db2.put(b"k", b"new")).unwrap())
        .join()
        .unwrap();

    assert_eq!(reader.get(&db, b"k").unwrap(), Some(b"old".to_vec()));
    reader.abort().unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn close_is_idempotent_everywhere() {
    let test_env = TestEnv::memory();
    let db = test_env.main_db();
    db.put(b"a", b"1").unwrap();

    let txn = test_env.begin().unwrap();
    let cursor = db.cursor().unwrap();
    cursor.close();
    cursor.close();
    txn.commit().unwrap();
    cursor.close();

    test_env.close().unwrap();
    test_env.close().unwrap();
    assert!(matches!(db.get(b"a"), Err(CoreError::EnvironmentClosed)));
    assert!(matches!(test_env.stat(), Err(CoreError::EnvironmentClosed)));
}

#[test]
fn close_with_open_transaction_is_refused() {
    let test_env = TestEnv::memory();
    let outer = test_env.begin().unwrap();
    let _inner = outer.begin_nested().unwrap();

    match test_env.close() {
        Err(CoreError::EnvironmentBusy { open_transactions }) => {
            assert_eq!(open_transactions, 2)
        }
        other => panic!("unexpected close result: {other:?}"),
    }
    assert!(test_env.is_open());

    outer.abort().unwrap();
    assert_eq!(test_env.open_transaction_count(), 0);
    test_env.close().unwrap();
}

#[test]
fn dropping_last_handle_aborts() {
    let test_env = TestEnv::memory();
    let db = test_env.main_db();
    {
        let txn = test_env.begin().unwrap();
        txn.put(&db, b"k", b"v").unwrap();
    }
    assert!(test_env.active_transaction().unwrap().is_none());
    assert_eq!(test_env.open_transaction_count(), 0);
    assert_eq!(db.get(b"k").unwrap(), None);

    // The writer slot was released.
    test_env.transaction(|_| db.put(b"k", b"v")).unwrap();
}

#[test]
fn dropping_environment_handle_keeps_engine_alive() {
    let test_env = TestEnv::memory();
    let db = test_env.main_db();
    let env: Environment = test_env.env.clone();
    drop(test_env);

    db.put(b"k", b"v").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(env.is_open());
}

#[test]
fn read_only_environment_forces_read_only_transactions() {
    let test_env = TestEnv::file();
    test_env.main_db().put(b"k", b"v").unwrap();
    let path = test_env.path().unwrap().to_path_buf();
    test_env.close().unwrap();

    let env = Environment::open(&path, EnvConfig::new().read_only(true)).unwrap();
    let txn = env.begin().unwrap();
    assert!(txn.is_read_only());
    let db = env.database(None, DatabaseFlags::new()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(txn.put(&db, b"k", b"w").is_err());
    txn.abort().unwrap();
}

#[test]
fn interrupted_begin_leaves_nothing_behind() {
    let test_env = TestEnv::memory();
    let holder = test_env.begin().unwrap();

    let signal = InterruptSignal::new();
    let remote_signal = signal.clone();
    let env = test_env.env.clone();
    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let result = env.begin_interruptible(false, &remote_signal);
        tx.send(()).unwrap();
        let interrupted = matches!(result, Err(CoreError::Interrupted));
        (interrupted, env.active_transaction().unwrap().is_none())
    });

    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    signal.raise();
    let (interrupted, nothing_active) = waiter.join().unwrap();
    assert!(interrupted);
    assert!(nothing_active);

    assert_eq!(test_env.open_transaction_count(), 1);
    holder.commit().unwrap();
}

#[test]
fn transaction_state_reporting() {
    let test_env = TestEnv::memory();
    let txn = test_env.begin().unwrap();
    assert_eq!(txn.state(), TransactionState::Open);
    assert!(txn.parent().is_none());
    assert!(txn.environment().is_open());
    txn.abort().unwrap();
    assert_eq!(txn.state(), TransactionState::Aborted);
}
