//! Integration tests for the full admission pipeline.
//!
//! These tests drive the gateway end to end: losses escalate into halts and
//! breaker trips, operators override and reset, and admission decisions flow
//! from the combined state.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use tradeguard::{
    EngineConfig, HaltKind, PeriodKind, RiskAssessment, RiskControlGateway, RiskEvent, RiskLevel,
    RiskLimits, Side, StaticAssessmentProvider, StaticPortfolioProvider, UserId,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tradeguard=debug")
        .with_test_writer()
        .try_init();
}

fn assessment(user: &str, risk_score: i64, base_daily: i64) -> RiskAssessment {
    RiskAssessment {
        user: UserId::from(user),
        risk_score: Decimal::new(risk_score, 0),
        risk_level: RiskLevel::Moderate,
        limits: RiskLimits {
            max_daily_loss: Decimal::new(base_daily, 0),
            max_position_size: Decimal::new(10_000, 0),
            max_portfolio_concentration: Decimal::new(25, 0),
        },
        assessed_at: Utc::now(),
    }
}

fn gateway(users: &[(&str, i64, i64)]) -> RiskControlGateway {
    init_tracing();
    let assessments = StaticAssessmentProvider::new();
    for (user, score, base) in users {
        assessments.insert(assessment(user, *score, *base));
    }
    let portfolio = StaticPortfolioProvider::new(Decimal::new(1_000_000, 0));
    let config = EngineConfig {
        operators: vec!["ops-1".to_string()],
        ..EngineConfig::default()
    };
    RiskControlGateway::new(config, Arc::new(assessments), Arc::new(portfolio))
}

async fn check_buy(gw: &RiskControlGateway, user: &UserId) -> tradeguard::TradeDecision {
    gw.check_trade(
        user,
        "AAPL",
        Side::Buy,
        Decimal::new(100, 0),
        Decimal::new(10, 0),
        Utc::now(),
    )
    .await
    .unwrap()
}

/// A $96 loss on a $100 base breaches the daily limit, halts trading, and
/// keeps it halted through override and re-arm until the counters reset.
#[tokio::test]
async fn test_loss_breach_denies_until_counters_reset() {
    let gw = gateway(&[("trader-1", 40, 100)]);
    let user = UserId::from("trader-1");
    gw.initialize_user(&user).await.unwrap();

    assert!(check_buy(&gw, &user).await.allowed);

    let outcome = gw
        .process_loss(&user, Some("session-1"), Decimal::new(96, 0), Some("AAPL"), Utc::now())
        .await
        .unwrap();
    assert!(outcome.halted());

    let decision = check_buy(&gw, &user).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("Daily loss limit exceeded"));

    // Lift every halt and re-arm every breaker: the breached counters still
    // deny on their own.
    let status = gw.status(&user).await.unwrap();
    for halt in &status.active_halts {
        gw.override_halt(halt.id, "ops-1", Some("reviewed")).await.unwrap();
    }
    for breaker in &status.active_breakers {
        gw.rearm_breaker(breaker.id, "ops-1").await.unwrap();
    }
    let decision = check_buy(&gw, &user).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("Daily loss limit exceeded"));

    gw.reset_limits(&user, "ops-1").await.unwrap();
    assert!(check_buy(&gw, &user).await.allowed);
    assert!(gw.status(&user).await.unwrap().can_trade);
}

/// Every risk-limit halt from a loss breach is accompanied by a tripped
/// breaker, and both require an operator to clear.
#[tokio::test]
async fn test_breach_trips_breaker_alongside_halt() {
    let gw = gateway(&[("trader-1", 40, 100)]);
    let user = UserId::from("trader-1");
    gw.initialize_user(&user).await.unwrap();

    gw.process_loss(&user, None, Decimal::new(96, 0), None, Utc::now())
        .await
        .unwrap();

    let status = gw.status(&user).await.unwrap();
    assert!(!status.can_trade);
    assert!(!status.active_halts.is_empty());
    assert_eq!(status.active_breakers.len(), 1);
    assert!(status.active_halts.iter().all(|h| h.override_required));

    // Days later, nothing has cleared by itself.
    let later = Utc::now() + chrono::Duration::days(3);
    let decision = gw
        .check_trade(&user, "AAPL", Side::Buy, Decimal::ONE, Decimal::new(10, 0), later)
        .await
        .unwrap();
    assert!(!decision.allowed);
}

#[tokio::test]
async fn test_override_rejects_unauthorized_operator() {
    let gw = gateway(&[("trader-1", 40, 100)]);
    let user = UserId::from("trader-1");
    gw.initialize_user(&user).await.unwrap();

    let halt = gw
        .trigger_halt(
            &user,
            HaltKind::Compliance,
            "Account under review",
            true,
            serde_json::json!({"case": "compliance-review-17"}),
            None,
        )
        .await
        .unwrap();

    assert!(gw.override_halt(halt.id, "not-an-operator", None).await.is_err());
    assert!(!check_buy(&gw, &user).await.allowed);

    gw.override_halt(halt.id, "ops-1", Some("review finished"))
        .await
        .unwrap();
    assert!(check_buy(&gw, &user).await.allowed);
}

/// High risk score shrinks position limits: score 85 on a $50 stock rounds
/// down to zero permitted shares at the default 100-share lot.
#[tokio::test]
async fn test_high_risk_score_restricts_position_size() {
    let gw = gateway(&[("risky", 85, 1000), ("steady", 20, 1000)]);
    let risky = UserId::from("risky");
    let steady = UserId::from("steady");
    gw.initialize_user(&risky).await.unwrap();
    gw.initialize_user(&steady).await.unwrap();

    let decision = gw
        .check_trade(&risky, "AAPL", Side::Buy, Decimal::new(100, 0), Decimal::new(50, 0), Utc::now())
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.restrictions.len(), 1);
    assert!(decision.restrictions[0].contains("Position size limited to 0 shares"));

    // Low risk score, same trade: no restriction.
    let decision = gw
        .check_trade(&steady, "AAPL", Side::Buy, Decimal::new(100, 0), Decimal::new(50, 0), Utc::now())
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(decision.restrictions.is_empty());
}

/// Concurrent loss events for one user serialize behind the per-user scope:
/// no update is lost and the accumulated total is exact.
#[tokio::test]
async fn test_concurrent_losses_do_not_lose_updates() {
    let gw = Arc::new(gateway(&[("trader-1", 40, 1000)]));
    let user = UserId::from("trader-1");
    gw.initialize_user(&user).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let gw = gw.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            gw.process_loss(&user, None, Decimal::new(60, 0), None, Utc::now())
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let status = gw.status(&user).await.unwrap();
    let daily = status
        .limits
        .iter()
        .find(|l| l.period == PeriodKind::Daily)
        .unwrap();
    assert_eq!(daily.accumulated_loss, Decimal::new(120, 0));
    assert!(status.can_trade);
}

/// The event stream records the whole escalation in order: breach, breaker
/// trip, halt, session halt command.
#[tokio::test]
async fn test_event_stream_records_escalation() {
    let gw = gateway(&[("trader-1", 40, 100)]);
    let user = UserId::from("trader-1");
    let mut rx = gw.take_event_receiver().unwrap();
    gw.initialize_user(&user).await.unwrap();

    gw.process_loss(&user, Some("session-9"), Decimal::new(96, 0), Some("AAPL"), Utc::now())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(RiskEvent::LimitBreach { period: PeriodKind::Daily, .. })
    ));
    assert!(events.iter().any(|e| matches!(e, RiskEvent::BreakerTripped { .. })));
    assert!(events.iter().any(|e| matches!(e, RiskEvent::HaltOpened { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        RiskEvent::SessionsHalted { session_id: Some(s), .. } if s == "session-9"
    )));
}

/// Losses in one account never constrain another.
#[tokio::test]
async fn test_users_are_isolated() {
    let gw = gateway(&[("trader-1", 40, 100), ("trader-2", 40, 100)]);
    let first = UserId::from("trader-1");
    let second = UserId::from("trader-2");
    gw.initialize_user(&first).await.unwrap();
    gw.initialize_user(&second).await.unwrap();

    gw.process_loss(&first, None, Decimal::new(96, 0), None, Utc::now())
        .await
        .unwrap();

    assert!(!check_buy(&gw, &first).await.allowed);
    assert!(check_buy(&gw, &second).await.allowed);
}
