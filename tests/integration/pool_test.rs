//! Signer pool lending under concurrency

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use usg_ca_gateway::ErrorKind;

use crate::integration::signer_pool;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_exclusivity() {
    const SIZE: usize = 3;
    let pool = Arc::new(signer_pool(SIZE));
    let in_use: Arc<Vec<AtomicBool>> = Arc::new((0..SIZE).map(|_| AtomicBool::new(false)).collect());
    let peak = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let pool = Arc::clone(&pool);
        let in_use = Arc::clone(&in_use);
        let peak = Arc::clone(&peak);
        let active = Arc::clone(&active);
        handles.push(tokio::spawn(async move {
            let mut lease = pool.borrow(Duration::from_secs(10)).await.unwrap();
            let slot = lease.slot();
            assert!(
                !in_use[slot].swap(true, Ordering::SeqCst),
                "slot {slot} lent twice"
            );
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            lease.signer().sign(b"payload").unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;

            active.fetch_sub(1, Ordering::SeqCst);
            in_use[slot].store(false, Ordering::SeqCst);
            lease.requite();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= SIZE);
    assert_eq!(pool.available(), SIZE);
}

#[tokio::test]
async fn test_lease_conservation_on_failure_paths() {
    let pool = Arc::new(signer_pool(2));

    // Dropped without requite
    {
        let _lease = pool.borrow(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.available(), 1);
    }
    assert_eq!(pool.available(), 2);

    // Holder panics
    let p = Arc::clone(&pool);
    let result = tokio::spawn(async move {
        let _lease = p.borrow(Duration::from_secs(1)).await.unwrap();
        panic!("holder failed");
    })
    .await;
    assert!(result.is_err());
    assert_eq!(pool.available(), 2);

    // Holder cancelled mid-lease
    let p = Arc::clone(&pool);
    let task = tokio::spawn(async move {
        let _lease = p.borrow(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.available(), 1);
    task.abort();
    let _ = task.await;
    assert_eq!(pool.available(), 2);

    // Both handles still usable
    let a = pool.borrow(Duration::from_secs(1)).await.unwrap();
    let b = pool.borrow(Duration::from_secs(1)).await.unwrap();
    assert_ne!(a.slot(), b.slot());
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let pool = signer_pool(1);
    let held = pool.borrow(Duration::from_secs(1)).await.unwrap();

    let err = pool.borrow(Duration::from_millis(50)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(5));

    held.requite();
    let lease = pool.borrow(Duration::from_millis(50)).await.unwrap();
    assert_eq!(lease.slot(), 0);
}

#[tokio::test]
async fn test_waiting_borrower_gets_released_handle() {
    let pool = Arc::new(signer_pool(1));
    let held = pool.borrow(Duration::from_secs(1)).await.unwrap();

    let p = Arc::clone(&pool);
    let waiter = tokio::spawn(async move {
        let lease = p.borrow(Duration::from_secs(5)).await?;
        Ok::<usize, usg_ca_gateway::GatewayError>(lease.slot())
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());
    held.requite();

    assert_eq!(waiter.await.unwrap().unwrap(), 0);
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_closed_pool_refuses() {
    let pool = signer_pool(1);
    pool.close();
    let err = pool.borrow(Duration::from_millis(50)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SigningError);
}
