//! Lock manager behaviour against the fake hypervisor

mod common;

use std::time::{Duration, Instant};

use common::{Failure, FakeHypervisor};
use sandvm::hypervisor::{LockState, MachineHandle, SessionId, StorageBus, SATA_CONTROLLER};
use sandvm::lock::LockManager;
use sandvm::Error;

fn machine() -> MachineHandle {
    MachineHandle {
        id: "fake-lock".to_string(),
        name: "lock-test".to_string(),
        settings_file: None,
    }
}

fn manager(fake: &std::sync::Arc<FakeHypervisor>) -> LockManager {
    LockManager::new(fake.clone()).with_timeouts(Duration::from_millis(300), Duration::from_millis(10))
}

#[tokio::test]
async fn test_release_unlocked_is_noop() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);

    let (machine, session) = (machine(), SessionId::new());
    locks.release(&machine, &session).await.unwrap();
    locks.release(&machine, &session).await.unwrap();

    assert_eq!(fake.count("unlock_machine"), 0);
}

#[tokio::test]
async fn test_release_locked_unlocks_and_waits() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    let (machine, session) = (machine(), SessionId::new());
    let guard = locks.acquire(&machine, &session).await.unwrap();
    std::mem::forget(guard);

    locks.release(&machine, &session).await.unwrap();

    assert_eq!(fake.count("unlock_machine"), 1);
    assert_eq!(fake.lock_state_of(&machine).await, LockState::Unlocked);
}

#[tokio::test]
async fn test_release_unlocking_waits_without_unlock_call() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    fake.script_lock_states(&[
        LockState::Unlocking,
        LockState::Unlocking,
        LockState::Unlocking,
        LockState::Unlocked,
    ]);

    locks.release(&machine(), &SessionId::new()).await.unwrap();

    assert_eq!(fake.count("unlock_machine"), 0);
}

#[tokio::test]
async fn test_release_spawning_waits_for_locked_then_unlocks() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    fake.script_lock_states(&[
        LockState::Spawning,
        LockState::Spawning,
        LockState::Spawning,
        LockState::Locked,
    ]);

    let machine = machine();
    locks.release(&machine, &SessionId::new()).await.unwrap();

    assert_eq!(fake.count("unlock_machine"), 1);
    assert_eq!(fake.lock_state_of(&machine).await, LockState::Unlocked);
}

#[tokio::test]
async fn test_release_with_unreadable_state_unlocks() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    let (machine, session) = (machine(), SessionId::new());
    let guard = locks.acquire(&machine, &session).await.unwrap();
    std::mem::forget(guard);
    fake.fail_lock_state(1);

    locks.release(&machine, &session).await.unwrap();

    assert_eq!(fake.count("unlock_machine"), 1);
    assert_eq!(fake.lock_state_of(&machine).await, LockState::Unlocked);
}

#[tokio::test]
async fn test_release_wait_timeout_is_fatal() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    fake.script_lock_states(&[LockState::Unlocking]);

    let start = Instant::now();
    let err = locks
        .release(&machine(), &SessionId::new())
        .await
        .unwrap_err();

    assert!(start.elapsed() >= Duration::from_millis(300));
    match err {
        Error::LockWaitTimeout {
            expected, observed, ..
        } => {
            assert_eq!(expected, LockState::Unlocked);
            assert_eq!(observed, "unlocking");
        }
        other => panic!("expected LockWaitTimeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unlock_that_never_completes_times_out() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    fake.set_unlock_outcome(LockState::Unlocking);
    let (machine, session) = (machine(), SessionId::new());

    let guard = locks.acquire(&machine, &session).await.unwrap();
    let err = guard.release().await.unwrap_err();

    assert!(matches!(err, Error::LockWaitTimeout { .. }));
    assert_eq!(fake.count("unlock_machine"), 1);
}

#[tokio::test]
async fn test_second_acquire_rejected() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    let machine = machine();

    let guard = locks.acquire(&machine, &SessionId::new()).await.unwrap();
    let err = locks
        .acquire(&machine, &SessionId::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::LockUnavailable { .. }));

    guard.release().await.unwrap();
    locks
        .acquire(&machine, &SessionId::new())
        .await
        .unwrap()
        .release()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_acquire_failure_carries_provider_error() {
    let fake = FakeHypervisor::new();
    fake.fail("lock_machine", Failure::Provider("session busy".into()));
    let locks = manager(&fake);

    let err = locks
        .acquire(&machine(), &SessionId::new())
        .await
        .err()
        .unwrap();

    assert!(err.to_string().contains("unavailable"));
    let source = std::error::Error::source(&err).unwrap();
    assert!(source.to_string().contains("session busy"));
}

#[tokio::test]
async fn test_with_lock_runs_body_and_releases() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    let (machine, session) = (machine(), SessionId::new());

    let ports = locks
        .with_lock(&machine, &session, |m| {
            Box::pin(async move {
                m.add_storage_controller(SATA_CONTROLLER, StorageBus::Sata, 1)
                    .await?;
                m.save_settings().await?;
                Ok(1u32)
            })
        })
        .await
        .unwrap();

    assert_eq!(ports, 1);
    assert_eq!(
        fake.calls(),
        vec![
            "lock_machine",
            "add_storage_controller",
            "save_settings",
            "unlock_machine"
        ]
    );
    assert_eq!(fake.lock_state_of(&machine).await, LockState::Unlocked);
}

#[tokio::test]
async fn test_with_lock_releases_when_body_fails() {
    let fake = FakeHypervisor::new();
    fake.fail("save_settings", Failure::Provider("disk full".into()));
    let locks = manager(&fake);
    let (machine, session) = (machine(), SessionId::new());

    let err = locks
        .with_lock(&machine, &session, |m| Box::pin(async move { m.save_settings().await }))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("disk full"));
    assert_eq!(fake.count("unlock_machine"), 1);
    assert_eq!(fake.lock_state_of(&machine).await, LockState::Unlocked);
}

#[tokio::test]
async fn test_body_error_wins_over_release_error() {
    let fake = FakeHypervisor::new();
    fake.fail("save_settings", Failure::Provider("disk full".into()));
    fake.set_unlock_outcome(LockState::Unlocking);
    let locks = manager(&fake);

    let err = locks
        .with_lock(&machine(), &SessionId::new(), |m| {
            Box::pin(async move { m.save_settings().await })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Hypervisor(_)));
    assert!(err.to_string().contains("disk full"));
}

#[tokio::test]
async fn test_dropped_guard_releases_in_background() {
    let fake = FakeHypervisor::new();
    let locks = manager(&fake);
    let machine = machine();

    let guard = locks.acquire(&machine, &SessionId::new()).await.unwrap();
    drop(guard);

    let deadline = Instant::now() + Duration::from_secs(2);
    while fake.lock_state_of(&machine).await != LockState::Unlocked {
        assert!(Instant::now() < deadline, "background release never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fake.count("unlock_machine"), 1);
}
