use anyhow::{Result, anyhow};
use notification_service::{
    error::ErrorCategory, models::retry::RetryConfig, utils::retry_with_backoff,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;

fn retry_config(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay_ms,
        max_delay_ms,
        backoff_multiplier: 2.0,
        ..Default::default()
    }
}

/// Test: Successful operations complete without retry
#[tokio::test]
async fn test_successful_operation_no_retry() -> Result<()> {
    let config = retry_config(2, 100, 1000);

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("sent")
        }
    })
    .await?;

    assert_eq!(result, "sent");
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1, "Should only attempt once");

    Ok(())
}

/// Test: Transient failures are retried until one succeeds
#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let config = retry_config(4, 20, 200);

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            let attempts = counter.fetch_add(1, Ordering::SeqCst);

            // provider unavailable twice, then accepts
            if attempts < 2 {
                Err(anyhow!("503 Service Unavailable"))
            } else {
                Ok("provider-id-1")
            }
        }
    })
    .await?;

    assert_eq!(result, "provider-id-1");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        3,
        "Should retry 2 times then succeed"
    );

    Ok(())
}

/// Test: max_retries counts retries, not attempts
#[tokio::test]
async fn test_persistent_failure_exhausts_retries() -> Result<()> {
    let config = retry_config(3, 10, 100);

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(anyhow!("Timeout"))
        }
    })
    .await;

    assert!(result.is_err(), "Should fail after the last retry");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        4,
        "One initial attempt plus three retries"
    );

    Ok(())
}

/// Test: Retry delays follow exponential backoff
#[tokio::test]
async fn test_exponential_backoff_timing() -> Result<()> {
    let config = retry_config(3, 100, 1000);

    let start = Instant::now();
    let attempt_times = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let times = Arc::clone(&attempt_times);

    let _ = retry_with_backoff(&config, || {
        let times = Arc::clone(&times);
        async move {
            times.lock().await.push(start.elapsed().as_millis());
            Err::<String, _>(anyhow!("Fail"))
        }
    })
    .await;

    let times = attempt_times.lock().await;
    assert_eq!(times.len(), 4);
    assert!(times[0] < 50, "First attempt should be immediate");

    for i in 1..times.len() {
        let delay = times[i] - times[i - 1];
        let nominal = config.delay_for_retry(i as u32 - 1).as_millis();
        let expected_min = nominal * 8 / 10;
        let expected_max = nominal * 13 / 10;

        assert!(
            delay >= expected_min && delay <= expected_max,
            "Delay {} should be between {} and {} (actual: {})",
            i,
            expected_min,
            expected_max,
            delay
        );
    }

    Ok(())
}

/// Test: Max delay cap is respected
#[tokio::test]
async fn test_max_delay_cap_respected() -> Result<()> {
    let config = retry_config(5, 100, 300);

    assert_eq!(config.delay_for_retry(2), Duration::from_millis(300));
    assert_eq!(config.delay_for_retry(10), Duration::from_millis(300));

    let start = Instant::now();
    let attempt_times = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let times = Arc::clone(&attempt_times);

    let _ = retry_with_backoff(&config, || {
        let times = Arc::clone(&times);
        async move {
            times.lock().await.push(start.elapsed().as_millis());
            Err::<String, _>(anyhow!("Fail"))
        }
    })
    .await;

    let times = attempt_times.lock().await;
    for i in 3..times.len() {
        let delay = times[i] - times[i - 1];
        assert!(
            delay <= (config.max_delay_ms * 13 / 10) as u128,
            "Delay should not exceed max_delay_ms cap"
        );
    }

    Ok(())
}

/// Test: Retry state is independent per operation
#[tokio::test]
async fn test_retry_state_independence() -> Result<()> {
    let config = Arc::new(retry_config(4, 10, 100));

    let config1 = Arc::clone(&config);
    let handle1 = tokio::spawn(async move {
        retry_with_backoff(&config1, || async {
            Err::<String, _>(anyhow!("Always fail"))
        })
        .await
    });

    let config2 = Arc::clone(&config);
    let counter2 = Arc::new(AtomicU32::new(0));
    let counter2_clone = Arc::clone(&counter2);
    let handle2 = tokio::spawn(async move {
        retry_with_backoff(&config2, || {
            let counter = Arc::clone(&counter2_clone);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("Fail"))
                } else {
                    Ok("sent")
                }
            }
        })
        .await
    });

    let (result1, result2) = tokio::join!(handle1, handle2);

    assert!(result1?.is_err(), "Operation 1 should fail");
    assert!(result2?.is_ok(), "Operation 2 should succeed");
    assert_eq!(counter2.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Test: Retry eligibility depends on the failure category and attempt number
#[test]
fn test_should_retry_policy() {
    let config = retry_config(3, 10, 100);

    assert!(config.should_retry(ErrorCategory::Timeout, 1));
    assert!(config.should_retry(ErrorCategory::Timeout, 3));
    assert!(!config.should_retry(ErrorCategory::Timeout, 4));
    assert!(config.should_retry(ErrorCategory::RateLimited, 2));
    assert!(!config.should_retry(ErrorCategory::Validation, 1));
}
