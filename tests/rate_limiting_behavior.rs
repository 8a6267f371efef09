//! Behavior-driven tests for rate limiting
//!
//! These tests verify HOW token buckets and the adaptive limiter pace calls, back off
//! from quota rejections, and recover. Time is tokio's paused clock throughout.

use std::time::Duration;

use cadastro_core::{AdaptiveLimiter, LimiterPolicy, RateBucket};
use tokio::time::{advance, Instant};

// =============================================================================
// Rate Limiting: Token Bucket
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_calls_follow_the_refill_rate_system_never_rejects() {
    // Given: A 30 rpm bucket with its initial burst spent
    let mut bucket = RateBucket::per_minute(30, 0.9).expect("valid bucket");
    while bucket.try_consume(1.0) {}

    // When: One token is requested every refill interval
    let interval = Duration::from_secs(2);
    let mut accepted = 0;
    for _ in 0..50 {
        advance(interval).await;
        if bucket.try_consume(1.0) {
            accepted += 1;
        }
    }

    // Then: Every request is accepted
    assert_eq!(accepted, 50);
}

#[tokio::test(start_paused = true)]
async fn when_burst_exceeds_effective_capacity_system_rejects_until_refill() {
    // Given: A 10 rpm bucket whose safety factor leaves 8 tokens of burst
    let mut bucket = RateBucket::per_minute(10, 0.8).expect("valid bucket");

    // When: Ten calls arrive at once
    let accepted = (0..10).filter(|_| bucket.try_consume(1.0)).count();

    // Then: Only the effective capacity goes through
    assert_eq!(accepted, 8);
    assert!(!bucket.try_consume(1.0));

    // And: The reported wait is enough for the next token
    let wait = bucket.wait_time(1.0);
    assert!(wait > Duration::from_secs(5) && wait < Duration::from_secs(7));
    advance(wait + Duration::from_millis(1)).await;
    assert!(bucket.try_consume(1.0));

    let stats = bucket.stats();
    assert_eq!(stats.allowed, 9);
    assert_eq!(stats.rejected, 3);
}

// =============================================================================
// Rate Limiting: Cooldowns
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_provider_is_cooling_down_system_never_selects_it() {
    // Given: Two 60 rpm providers, one just rate limited
    let limiter = AdaptiveLimiter::new(LimiterPolicy::default());
    limiter.register("receitaws", 60, None).expect("register");
    limiter.register("cnpjws", 60, None).expect("register");
    let cooldown = limiter.mark_rate_limited("receitaws").expect("known provider");
    let cooldown_ends = Instant::now() + cooldown;

    // When: Selection runs at the pacing interval for the whole cooldown
    let pacing = limiter.pacing_interval();
    let mut selected_other = 0;
    while Instant::now() + pacing < cooldown_ends {
        advance(pacing).await;
        match limiter.select_best().as_deref() {
            Some("receitaws") => panic!("provider selected during its cooldown"),
            Some(_) => selected_other += 1,
            None => {}
        }
    }

    // Then: The other provider carried the load and the first is back once cooled down
    assert!(selected_other > 0);
    advance(pacing + Duration::from_secs(1)).await;
    assert!(!limiter.is_in_cooldown("receitaws"));
    limiter.mark_rate_limited("cnpjws");
    advance(pacing).await;
    assert_eq!(limiter.select_best().as_deref(), Some("receitaws"));
}

#[tokio::test(start_paused = true)]
async fn when_rate_limits_repeat_system_doubles_cooldown_up_to_ceiling() {
    // Given: A limiter with a one minute base and ten minute ceiling
    let limiter = AdaptiveLimiter::new(LimiterPolicy::default());
    limiter.register("cnpja_open", 5, None).expect("register");

    // When: The provider is rate limited six times in a row
    let cooldowns: Vec<u64> = (0..6)
        .map(|_| {
            limiter
                .mark_rate_limited("cnpja_open")
                .expect("known provider")
                .as_secs()
        })
        .collect();

    // Then: Each cooldown is base * 2^(k-1), capped at the ceiling
    assert_eq!(cooldowns, vec![60, 120, 240, 480, 600, 600]);
    let snapshot = limiter.snapshot("cnpja_open").expect("snapshot");
    assert!(snapshot.in_cooldown);
    assert_eq!(snapshot.error_count, 6);
    assert_eq!(snapshot.last_cooldown_secs, Some(600.0));
}

#[tokio::test(start_paused = true)]
async fn when_only_provider_cools_down_system_waits_for_it() {
    // Given: A single provider that was just rate limited
    let limiter = AdaptiveLimiter::new(LimiterPolicy::default());
    limiter.register("receitaws", 3, None).expect("register");
    limiter.mark_rate_limited("receitaws");
    let started = Instant::now();

    // When: A caller waits for capacity with a timeout longer than the cooldown
    let selected = limiter.await_available(Duration::from_secs(120)).await;

    // Then: The provider is handed out after its cooldown, not before
    assert_eq!(selected.as_deref(), Some("receitaws"));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn when_no_capacity_appears_before_timeout_system_reports_none() {
    // Given: A single provider cooling down for a minute
    let limiter = AdaptiveLimiter::new(LimiterPolicy::default());
    limiter.register("receitaws", 3, None).expect("register");
    limiter.mark_rate_limited("receitaws");

    // When: A caller waits only five seconds
    let selected = limiter.await_available(Duration::from_secs(5)).await;

    // Then: Nothing is handed out
    assert!(selected.is_none());
}

// =============================================================================
// Rate Limiting: Sustained Load
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_load_stays_within_aggregate_quota_system_always_has_a_provider() {
    // Given: The three public providers at 3, 3 and 5 rpm
    let limiter = AdaptiveLimiter::new(LimiterPolicy::default());
    limiter.register("receitaws", 3, None).expect("register");
    limiter.register("cnpjws", 3, None).expect("register");
    limiter.register("cnpja_open", 5, None).expect("register");
    let pacing = limiter.pacing_interval();
    assert_eq!(limiter.total_requests_per_minute(), 11);

    // When: One selection is made every pacing interval, 11 per minute, for ten minutes
    let mut misses = 0;
    for call in 0..110 {
        if call > 0 {
            advance(pacing).await;
        }
        if limiter.select_best().is_none() {
            misses += 1;
        }
    }

    // Then: The limiter never runs dry
    assert_eq!(misses, 0);
    let used: u64 = limiter.status().iter().map(|snapshot| snapshot.bucket.allowed).sum();
    assert_eq!(used, 110);
}

#[tokio::test(start_paused = true)]
async fn when_selections_come_faster_than_pacing_system_spaces_them() {
    // Given: Providers totalling 11 rpm
    let limiter = AdaptiveLimiter::new(LimiterPolicy::default());
    limiter.register("receitaws", 3, None).expect("register");
    limiter.register("cnpja_open", 5, None).expect("register");
    limiter.register("cnpjws", 3, None).expect("register");

    // When: Two selections are attempted back to back
    let first = limiter.select_best();
    let second = limiter.select_best();

    // Then: Only the first succeeds until the pacing interval passes
    assert!(first.is_some());
    assert!(second.is_none());
    advance(limiter.pacing_interval()).await;
    assert!(limiter.select_best().is_some());
}
