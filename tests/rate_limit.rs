mod common;

use std::sync::Arc;
use std::time::Duration;

use chatguard::rate_limit::{FixedWindow, SlidingWindow};
use chatguard::telemetry::{GuardEvent, MemorySink, RateLimitEvent};
use chatguard::{
    DurableStore, GuardError, GuardConfig, InMemoryDurableStore, ManualClock, RateLimitDecision,
    RateLimitPolicy, RateLimiter,
};
use common::{default_config, guard, ExpiryFailingStore, FailingStore};

const START: u64 = 1_700_000_000_000;

fn allowed(decision: Option<&RateLimitDecision>) -> bool {
    decision.is_some_and(RateLimitDecision::is_allowed)
}

#[tokio::test]
async fn burst_is_capped_in_memory() {
    let clock = ManualClock::starting_at(START);
    let (guard, sink) = guard(default_config(), &clock, None);

    for i in 0..10 {
        let admission = guard.admit("burst").await.expect("within quota");
        assert_eq!(admission.remaining, 9 - i);
        assert!(!admission.degraded);
    }

    let err = guard.admit("burst").await.unwrap_err();
    assert!(matches!(err, GuardError::RateLimited { retry_after_ms } if retry_after_ms > 0));
    assert_eq!(err.status_code(), 429);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        GuardEvent::RateLimit(RateLimitEvent::Blocked { identifier, remaining: 0, reset_at_ms })
            if identifier == "burst" && *reset_at_ms == START + 15_000
    ));
}

#[tokio::test]
async fn burst_is_capped_with_durable_store() {
    let clock = ManualClock::starting_at(START);
    let store = InMemoryDurableStore::with_clock(clock.clone());
    let (guard, _sink) = guard(default_config(), &clock, Some(Arc::new(store)));

    for _ in 0..10 {
        guard.admit("burst").await.expect("within quota");
    }
    let retry = guard.admit("burst").await.unwrap_err().retry_after_ms();
    assert!(retry.is_some_and(|ms| ms > 0 && ms <= 15_000));
}

#[tokio::test]
async fn window_reopens_after_reset_time() {
    let clock = ManualClock::starting_at(START);
    let (guard, _sink) = guard(default_config(), &clock, None);

    for _ in 0..10 {
        guard.admit("burst").await.expect("within quota");
    }
    assert!(guard.admit("burst").await.is_err());

    clock.advance(15_000);
    let admission = guard.admit("burst").await.expect("fresh window");
    assert_eq!(admission.remaining, 9);
}

#[tokio::test]
async fn identifiers_do_not_share_quota() {
    let clock = ManualClock::starting_at(START);
    let config = GuardConfig { max_requests: 1, ..default_config() };
    let (guard, _sink) = guard(config, &clock, None);

    assert!(guard.admit("10.0.0.1").await.is_ok());
    assert!(guard.admit("10.0.0.2").await.is_ok());
    assert!(guard.admit("10.0.0.1").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_never_exceeds_cap() {
    let clock = ManualClock::starting_at(START);
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::with_clock(clock.clone()));
    let policy = RateLimitPolicy::new(10, Duration::from_millis(15_000)).unwrap();
    let limiter = RateLimiter::durable(
        SlidingWindow::new(store, "chatbot", policy, clock.clone()),
        None,
        MemorySink::new(),
    );

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { allowed(limiter.admit("burst").await.value()) })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_in_memory_never_exceeds_cap() {
    let clock = ManualClock::starting_at(START);
    let policy = RateLimitPolicy::new(10, Duration::from_millis(15_000)).unwrap();
    let limiter =
        RateLimiter::in_memory(FixedWindow::new(policy, 1_000, clock.clone()), MemorySink::new());

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { allowed(limiter.admit("burst").await.value()) })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn unreachable_store_falls_back_and_still_limits() {
    let clock = ManualClock::starting_at(START);
    let store = Arc::new(FailingStore::default());
    let (guard, sink) = guard(default_config(), &clock, Some(store.clone()));

    for _ in 0..10 {
        let admission = guard.admit("burst").await.expect("fallback admits");
        assert!(admission.degraded);
    }
    assert!(guard.admit("burst").await.unwrap_err().is_rate_limited());
    assert!(store.calls() >= 11);
    assert!(sink.count("chat_rate_guard_error") > 0);
    assert_eq!(sink.count("rate_limit_blocked"), 1);
}

#[tokio::test]
async fn unreachable_store_without_fallback_is_unavailable() {
    let clock = ManualClock::starting_at(START);
    let config = GuardConfig {
        allow_memory_fallback: false,
        redis_url: Some("redis://cache:6379/".into()),
        ..default_config()
    };
    let (guard, _sink) = guard(config, &clock, Some(Arc::new(FailingStore::default())));

    let err = guard.admit("burst").await.unwrap_err();
    assert!(matches!(err, GuardError::StoreUnavailable(_)));
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn fallback_map_evicts_oldest_clients() {
    let clock = ManualClock::starting_at(START);
    let config = GuardConfig { max_keys: 25, max_requests: 1, ..default_config() };
    let (guard, _sink) = guard(config, &clock, None);

    assert!(guard.admit("198.51.100.0").await.is_ok());
    assert!(guard.admit("198.51.100.0").await.is_err());
    for i in 1..500 {
        guard.admit(&format!("198.51.100.{i}")).await.expect("distinct clients");
    }
    let decision = guard.check_admission("198.51.100.0").await;
    assert!(allowed(decision.value()), "oldest client was evicted and starts over");
}

#[tokio::test]
async fn rate_counters_always_carry_their_expiry() {
    let clock = ManualClock::starting_at(START);
    let store = Arc::new(ExpiryFailingStore::new(&clock));
    let (guard, sink) = guard(default_config(), &clock, Some(store.clone()));

    for _ in 0..2 {
        let admission = guard.admit("ip").await.expect("within quota");
        assert!(!admission.degraded);
    }
    let key = format!("chatbot:rate:ip:{}", START / 15_000);
    assert_eq!(store.get(&key).await.unwrap(), Some(2));

    clock.advance(24 * 60 * 60 * 1_000);
    assert_eq!(store.get(&key).await.unwrap(), None);
    assert_eq!(sink.count("chat_rate_guard_error"), 0);
}
