mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use common::{driver, fresh_coordinator, init, join};
use spoons::{
    platform::recording::{Behavior, Call},
    acquire_shared_state, CaptureService, Error, ErrorKind, PoolOptions, VmId, WarmPool,
};

fn options(target: usize) -> PoolOptions {
    PoolOptions::new().target_size(target).repopulate(false)
}

#[tokio::test]
async fn lease_until_exhausted_then_one_tick_refills() {
    init();
    let (driver, platform) = driver(true);
    let pool = WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(2))
        .await
        .unwrap();
    assert!(pool.shared().is_host());

    let warm = pool.list().await.unwrap();
    assert_eq!(warm.len(), 2);
    assert_ne!(warm[0], warm[1]);

    let first = pool.lease().await.unwrap();
    assert!(warm.contains(first.id()));
    assert_eq!(pool.len().await.unwrap(), 1);

    let second = pool.lease().await.unwrap();
    assert!(warm.contains(second.id()));
    assert_ne!(first.id(), second.id());
    assert_eq!(pool.len().await.unwrap(), 0);

    assert!(matches!(pool.lease().await, Err(Error::PoolExhausted)));
    assert_eq!(pool.len().await.unwrap(), 0);

    assert_eq!(pool.repopulator().tick().await.unwrap(), 2);
    let refilled = pool.list().await.unwrap();
    assert_eq!(refilled.len(), 2);
    assert!(!refilled.contains(first.id()));
    assert!(!refilled.contains(second.id()));

    drop(first);
    drop(second);
    pool.shutdown().await.unwrap();
    assert_eq!(pool.len().await.unwrap(), 0);
    // dry run: nothing ever reached the platform
    assert!(platform.calls().is_empty());
}

#[tokio::test]
async fn concurrent_leases_never_share_a_vm() {
    init();
    let (driver, _) = driver(true);
    let pool = Arc::new(
        WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(8))
            .await
            .unwrap(),
    );
    let warm: HashSet<VmId> = pool.list().await.unwrap().into_iter().collect();
    assert_eq!(warm.len(), 8);

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            pool.lease().await.map(|lease| lease.id().clone())
        }));
    }
    let mut leased = Vec::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(id) => leased.push(id),
            Err(Error::PoolExhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(leased.len(), 8);
    assert_eq!(exhausted, 4);
    let distinct: HashSet<VmId> = leased.iter().cloned().collect();
    assert_eq!(distinct, warm);

    // leased VMs never come back
    pool.repopulator().tick().await.unwrap();
    let refilled: HashSet<VmId> = pool.list().await.unwrap().into_iter().collect();
    assert_eq!(refilled.len(), 8);
    assert!(refilled.is_disjoint(&distinct));
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn leases_from_separate_processes_never_share_a_vm() {
    init();
    let (host_driver, _) = driver(true);
    let host = WarmPool::bootstrap_with(host_driver, &fresh_coordinator(), options(8))
        .await
        .unwrap();
    let warm: HashSet<VmId> = host.list().await.unwrap().into_iter().collect();
    let endpoint = host.shared().endpoint();

    // each pool has a coordinator connection of its own
    let mut pools = vec![Arc::new(host)];
    for _ in 0..3 {
        let (client_driver, _) = driver(true);
        let client = WarmPool::bootstrap_with(client_driver, &join(endpoint), options(8))
            .await
            .unwrap();
        assert!(!client.shared().is_host());
        pools.push(Arc::new(client));
    }
    assert_eq!(pools[0].len().await.unwrap(), 8);

    let mut tasks = Vec::new();
    for n in 0..12 {
        let pool = Arc::clone(&pools[n % pools.len()]);
        tasks.push(tokio::spawn(async move {
            pool.lease().await.map(|lease| lease.id().clone())
        }));
    }
    let mut leased = HashSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(id) => assert!(leased.insert(id), "a VM was leased twice"),
            Err(Error::PoolExhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(leased, warm);
    assert_eq!(exhausted, 4);

    for pool in pools.iter().rev() {
        pool.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn client_takes_over_when_the_host_shuts_down() {
    init();
    let (host_driver, _) = driver(true);
    let host = WarmPool::bootstrap_with(host_driver, &fresh_coordinator(), options(2))
        .await
        .unwrap();
    let old: Vec<VmId> = host.list().await.unwrap();

    let (client_driver, _) = driver(true);
    let client = WarmPool::bootstrap_with(
        client_driver,
        &join(host.shared().endpoint()),
        PoolOptions::new()
            .target_size(2)
            .repopulate_interval(Duration::from_millis(20)),
    )
    .await
    .unwrap();
    assert!(!client.is_repopulating().await);

    host.shutdown().await.unwrap();
    drop(host);

    let mut recovered = false;
    for _ in 0..250 {
        if client.is_repopulating().await && matches!(client.len().await, Ok(2)) {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(recovered);
    assert!(client.shared().is_host());

    let lease = client.lease().await.unwrap();
    assert!(!old.contains(lease.id()));
    drop(lease);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn takeover_without_a_loop_still_serves_leases() {
    init();
    let (host_driver, _) = driver(true);
    let host = WarmPool::bootstrap_with(host_driver, &fresh_coordinator(), options(2))
        .await
        .unwrap();
    let (client_driver, _) = driver(true);
    let client = WarmPool::bootstrap_with(client_driver, &join(host.shared().endpoint()), options(2))
        .await
        .unwrap();
    drop(host);

    // the first request after the host vanished reruns the election
    let mut tick = None;
    for _ in 0..100 {
        match client.repopulator().tick().await {
            Ok(added) => {
                tick = Some(added);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert_eq!(tick, Some(2));
    assert!(client.shared().is_host());
    assert!(client.lease().await.is_ok());
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn host_destroys_vms_taken_by_a_vanished_client() {
    init();
    let (driver, platform) = driver(false);
    let pool = WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(2))
        .await
        .unwrap();
    let other = acquire_shared_state(&join(pool.shared().endpoint()))
        .await
        .unwrap();

    let taken = {
        let mut guard = other.lock().await.unwrap();
        let id = guard.pop().await.unwrap().unwrap();
        // gone without releasing
        id
    };

    let mut destroyed = false;
    for _ in 0..250 {
        if platform.removed().contains(&taken) {
            destroyed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(destroyed);
    let left = pool.list().await.unwrap();
    assert_eq!(left.len(), 1);
    assert!(!left.contains(&taken));

    pool.shutdown().await.unwrap();
    assert_eq!(removals_of(&platform.calls(), &taken), 1);
}

#[tokio::test]
async fn repopulation_loop_converges_to_target() {
    init();
    let (driver, _) = driver(true);
    let options = PoolOptions::new()
        .target_size(3)
        .repopulate_interval(Duration::from_millis(20));
    let pool = WarmPool::bootstrap_with(driver, &fresh_coordinator(), options)
        .await
        .unwrap();
    assert!(pool.is_repopulating().await);

    let mut leased = Vec::new();
    for _ in 0..3 {
        if let Ok(lease) = pool.lease().await {
            leased.push(lease.id().clone());
        }
    }
    assert!(!leased.is_empty());

    let mut converged = false;
    for _ in 0..250 {
        if pool.len().await.unwrap() == 3 {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(converged);

    // and stays there
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let ids = pool.list().await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| !leased.contains(id)));
    }

    pool.shutdown().await.unwrap();
    assert!(!pool.is_repopulating().await);
    assert_eq!(pool.len().await.unwrap(), 0);
}

#[tokio::test]
async fn provisioning_failures_are_tolerated() {
    init();
    let (driver, platform) = driver(false);
    platform.set_create(Behavior::Fail(1));
    let pool = WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(2))
        .await
        .unwrap();
    assert_eq!(pool.len().await.unwrap(), 0);
    assert_eq!(pool.repopulator().tick().await.unwrap(), 0);

    platform.set_create(Behavior::Succeed);
    assert_eq!(pool.repopulator().tick().await.unwrap(), 2);
    assert_eq!(pool.len().await.unwrap(), 2);

    let pooled = pool.list().await.unwrap();
    pool.shutdown().await.unwrap();
    let mut removed = platform.removed();
    removed.sort();
    let mut expected = pooled;
    expected.sort();
    assert_eq!(removed, expected);
}

#[tokio::test]
async fn second_process_joins_without_repopulating() {
    init();
    let (host_driver, _) = driver(true);
    let host = WarmPool::bootstrap_with(host_driver, &fresh_coordinator(), options(2))
        .await
        .unwrap();

    let (client_driver, _) = driver(true);
    let client = WarmPool::bootstrap_with(
        client_driver,
        &join(host.shared().endpoint()),
        PoolOptions::new().target_size(2),
    )
    .await
    .unwrap();
    assert!(!client.shared().is_host());
    assert!(!client.is_repopulating().await);
    // already warm, the client added nothing
    assert_eq!(host.len().await.unwrap(), 2);

    let lease = client.lease().await.unwrap();
    assert_eq!(host.len().await.unwrap(), 1);
    assert!(!host.list().await.unwrap().contains(lease.id()));
    drop(lease);

    client.shutdown().await.unwrap();
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn dry_run_capture_round_trip() {
    init();
    let (driver, platform) = driver(true);
    let pool = Arc::new(
        WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(2))
            .await
            .unwrap(),
    );
    let warm = pool.list().await.unwrap();
    let service = CaptureService::new(Arc::clone(&pool));

    let artifact = service.capture("https://example.com/").await.unwrap();
    assert!(warm.contains(&artifact.vm));
    assert_eq!(
        artifact.path,
        std::path::PathBuf::from(format!("/tmp/spoons-test/{}.wacz", artifact.vm))
    );
    assert_eq!(
        artifact.download_name,
        format!("https___example_com_-{}.wacz", artifact.vm)
    );
    assert_eq!(pool.len().await.unwrap(), 1);
    assert!(!pool.list().await.unwrap().contains(&artifact.vm));

    pool.shutdown().await.unwrap();
    assert!(platform.calls().is_empty());
}

#[tokio::test]
async fn bad_input_consumes_no_vm() {
    init();
    let (driver, _) = driver(true);
    let pool = Arc::new(
        WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(2))
            .await
            .unwrap(),
    );
    let service = CaptureService::new(Arc::clone(&pool));
    let err = service.capture("not a url").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(pool.len().await.unwrap(), 2);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_pool_is_reported_as_retryable() {
    init();
    let (driver, _) = driver(true);
    let pool = Arc::new(
        WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(1))
            .await
            .unwrap(),
    );
    let service = CaptureService::new(Arc::clone(&pool));
    let held = pool.lease().await.unwrap();
    let err = service.capture("https://example.com").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    drop(held);
    pool.shutdown().await.unwrap();
}

fn removals_of(calls: &[Call], id: &VmId) -> usize {
    calls
        .iter()
        .filter(|c| matches!(c, Call::Remove(removed) if removed == id))
        .count()
}

#[tokio::test]
async fn capture_invocation_error_still_destroys_the_vm_once() {
    init();
    let (driver, platform) = driver(false);
    let pool = Arc::new(
        WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(1))
            .await
            .unwrap(),
    );
    let leased = pool.list().await.unwrap()[0].clone();
    platform.set_exec(Behavior::Error);

    let service = CaptureService::new(Arc::clone(&pool));
    let err = service.capture("https://example.com").await.unwrap_err();
    assert!(matches!(err, Error::CaptureInvocation(_)));
    assert_eq!(pool.len().await.unwrap(), 0);

    pool.shutdown().await.unwrap();
    assert_eq!(removals_of(&platform.calls(), &leased), 1);
}

#[tokio::test]
async fn failed_capture_reports_the_vm_and_destroys_it() {
    init();
    let (driver, platform) = driver(false);
    let pool = Arc::new(
        WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(1))
            .await
            .unwrap(),
    );
    let leased = pool.list().await.unwrap()[0].clone();
    platform.set_exec(Behavior::Fail(1));

    let service = CaptureService::new(Arc::clone(&pool));
    match service.capture("https://example.com").await {
        Err(Error::Capture { vm, .. }) => assert_eq!(vm, leased),
        other => panic!("expected a capture failure, got {other:?}"),
    }

    pool.shutdown().await.unwrap();
    assert_eq!(removals_of(&platform.calls(), &leased), 1);
}

#[tokio::test]
async fn successful_capture_copies_out_then_destroys() {
    init();
    let (driver, platform) = driver(false);
    let pool = Arc::new(
        WarmPool::bootstrap_with(driver, &fresh_coordinator(), options(1))
            .await
            .unwrap(),
    );
    let service = CaptureService::new(Arc::clone(&pool));
    let artifact = service.capture("https://example.com").await.unwrap();

    pool.shutdown().await.unwrap();
    let calls = platform.calls();
    let copy_out = calls
        .iter()
        .position(|c| matches!(c, Call::CopyOut(id, _, _) if *id == artifact.vm))
        .unwrap();
    let stop = calls
        .iter()
        .position(|c| matches!(c, Call::Stop(id) if *id == artifact.vm))
        .unwrap();
    assert!(copy_out < stop);
    assert_eq!(removals_of(&calls, &artifact.vm), 1);
}
