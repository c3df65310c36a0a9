//! Per-user per-period loss limit tracking and reset scheduling.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tradeguard_core::config::LimitConfig;
use tradeguard_core::types::{LimitStatus, LossLimit, PeriodKind, RiskAssessment, UserId};
use tradeguard_core::{Error, Result};

use crate::persistence::{LimitRepository, LimitStorage};

/// Durable per-user loss counters across overlapping time windows.
///
/// In-memory state is authoritative once loaded; the storage backend (when
/// configured) is write-through on every mutation and read once per user via
/// [`LimitStore::hydrate`]. Write failures never block admission decisions.
pub struct LimitStore {
    limits: DashMap<UserId, Vec<LossLimit>>,
    config: LimitConfig,
    repo: Option<Arc<dyn LimitStorage>>,
}

impl LimitStore {
    pub fn new(config: LimitConfig) -> Self {
        Self {
            limits: DashMap::new(),
            config,
            repo: None,
        }
    }

    pub fn with_persistence(config: LimitConfig, pool: PgPool) -> Self {
        Self::with_storage(config, Arc::new(LimitRepository::new(pool)))
    }

    pub fn with_storage(config: LimitConfig, storage: Arc<dyn LimitStorage>) -> Self {
        Self {
            limits: DashMap::new(),
            config,
            repo: Some(storage),
        }
    }

    /// Load the user's limits from storage if they are not in memory yet.
    /// Returns whether anything was loaded.
    pub async fn hydrate(&self, user: &UserId) -> bool {
        if self.limits.contains_key(user) {
            return false;
        }
        let Some(repo) = &self.repo else {
            return false;
        };
        match repo.load_for_user(user).await {
            Ok(loaded) if !loaded.is_empty() => {
                info!(
                    user = %user,
                    limits = loaded.len(),
                    "rehydrated loss limits from storage"
                );
                self.limits.entry(user.clone()).or_insert(loaded);
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!(user = %user, error = %e, "failed to load loss limits");
                false
            }
        }
    }

    /// Create Session/Daily/Weekly/Monthly limits from the user's risk
    /// assessment. Idempotent: an already-initialized user keeps their
    /// existing limits.
    pub async fn initialize(
        &self,
        assessment: &RiskAssessment,
        now: DateTime<Utc>,
    ) -> Result<Vec<LossLimit>> {
        let base_daily = assessment.limits.max_daily_loss;
        if base_daily <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "base daily loss limit must be positive, got {base_daily}"
            )));
        }

        if let Some(existing) = self.limits.get(&assessment.user) {
            debug!(user = %assessment.user, "loss limits already initialized");
            return Ok(existing.clone());
        }

        let limits: Vec<LossLimit> = PeriodKind::ALL
            .iter()
            .map(|&period| {
                let amount = base_daily * self.multiplier(period);
                LossLimit::new(
                    assessment.user.clone(),
                    period,
                    amount,
                    self.config.warning_threshold_pct,
                    self.config.halt_threshold_pct,
                    now,
                    next_boundary(period, now),
                )
            })
            .collect();

        info!(
            user = %assessment.user,
            base_daily = %base_daily,
            "initialized loss limits"
        );

        self.persist_all(&limits).await;
        self.limits.insert(assessment.user.clone(), limits.clone());
        Ok(limits)
    }

    /// Apply a realized loss to every limit of the user.
    ///
    /// Returns, per limit, the resulting usage and whether the warning/halt
    /// thresholds were newly crossed by this call. A non-positive amount is a
    /// no-op, not an error.
    pub async fn apply_loss(
        &self,
        user: &UserId,
        amount: Decimal,
        _now: DateTime<Utc>,
    ) -> Result<Vec<LimitStatus>> {
        if amount <= Decimal::ZERO {
            debug!(user = %user, amount = %amount, "ignoring non-positive loss amount");
            return Ok(Vec::new());
        }

        let mut entry = self
            .limits
            .get_mut(user)
            .ok_or_else(|| Error::UserNotInitialized(user.to_string()))?;

        let mut statuses = Vec::with_capacity(entry.len());
        for limit in entry.iter_mut() {
            let before = limit.pct_used();
            limit.accumulated_loss += amount;
            let after = limit.pct_used();

            let warning_crossed =
                before < limit.warning_threshold_pct && after >= limit.warning_threshold_pct;
            let halt_crossed =
                before < limit.halt_threshold_pct && after >= limit.halt_threshold_pct;
            if halt_crossed {
                limit.breach_count += 1;
            }

            if halt_crossed {
                warn!(
                    user = %user,
                    period = %limit.period,
                    pct_used = %after,
                    "loss limit halt threshold crossed"
                );
            } else if warning_crossed {
                warn!(
                    user = %user,
                    period = %limit.period,
                    pct_used = %after,
                    "loss limit warning threshold crossed"
                );
            }

            statuses.push(LimitStatus {
                period: limit.period,
                limit_amount: limit.limit_amount,
                accumulated_loss: limit.accumulated_loss,
                pct_used: after,
                warning_crossed,
                halt_crossed,
            });
        }

        let snapshot = entry.clone();
        drop(entry);
        self.persist_all(&snapshot).await;

        Ok(statuses)
    }

    /// Reset every limit whose boundary has passed. Idempotent: calling twice
    /// before the next boundary is a no-op. Returns the number of limits
    /// reset.
    pub async fn maybe_reset(&self, user: &UserId, now: DateTime<Utc>) -> usize {
        let mut entry = match self.limits.get_mut(user) {
            Some(e) => e,
            None => return 0,
        };

        let mut reset_count = 0;
        for limit in entry.iter_mut() {
            if limit.next_reset <= now {
                limit.accumulated_loss = Decimal::ZERO;
                limit.last_reset = now;
                // Schedule from `now`, never from the previous boundary, so
                // restarts cannot double- or skip-reset.
                limit.next_reset = next_boundary(limit.period, now);
                reset_count += 1;
                info!(
                    user = %user,
                    period = %limit.period,
                    next_reset = %limit.next_reset,
                    "loss limit reset"
                );
            }
        }

        if reset_count > 0 {
            let snapshot = entry.clone();
            drop(entry);
            self.persist_all(&snapshot).await;
        }
        reset_count
    }

    /// Zero every limit for the user regardless of schedule (operator reset).
    pub async fn force_reset(&self, user: &UserId, now: DateTime<Utc>) -> Result<()> {
        let mut entry = self
            .limits
            .get_mut(user)
            .ok_or_else(|| Error::UserNotInitialized(user.to_string()))?;

        for limit in entry.iter_mut() {
            limit.accumulated_loss = Decimal::ZERO;
            limit.last_reset = now;
            limit.next_reset = next_boundary(limit.period, now);
        }

        info!(user = %user, "loss limits force-reset");
        let snapshot = entry.clone();
        drop(entry);
        self.persist_all(&snapshot).await;
        Ok(())
    }

    pub fn is_initialized(&self, user: &UserId) -> bool {
        self.limits.contains_key(user)
    }

    /// Current limits for a user.
    pub fn limits_for(&self, user: &UserId) -> Vec<LossLimit> {
        self.limits
            .get(user)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Current usage snapshot without any crossing flags.
    pub fn statuses(&self, user: &UserId) -> Vec<LimitStatus> {
        self.limits_for(user)
            .iter()
            .map(|limit| LimitStatus {
                period: limit.period,
                limit_amount: limit.limit_amount,
                accumulated_loss: limit.accumulated_loss,
                pct_used: limit.pct_used(),
                warning_crossed: false,
                halt_crossed: false,
            })
            .collect()
    }

    /// Whether any limit currently meets its halt threshold.
    pub fn any_breached(&self, user: &UserId) -> Option<PeriodKind> {
        self.limits_for(user)
            .iter()
            .find(|l| l.is_breached())
            .map(|l| l.period)
    }

    fn multiplier(&self, period: PeriodKind) -> Decimal {
        match period {
            PeriodKind::Session => self.config.session_multiplier,
            PeriodKind::Daily => Decimal::ONE,
            PeriodKind::Weekly => self.config.weekly_multiplier,
            PeriodKind::Monthly => self.config.monthly_multiplier,
        }
    }

    async fn persist_all(&self, limits: &[LossLimit]) {
        if let Some(repo) = &self.repo {
            for limit in limits {
                if let Err(e) = repo.save(limit).await {
                    error!(
                        user = %limit.user,
                        period = %limit.period,
                        error = %e,
                        "failed to persist loss limit"
                    );
                }
            }
        }
    }
}

/// Next reset boundary for a period, computed from `now`.
///
/// Daily: next midnight UTC. Weekly: next Monday 00:00. Monthly: first of
/// next month 00:00. Session: 24 hours from now.
pub fn next_boundary(period: PeriodKind, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    match period {
        PeriodKind::Session => now + Duration::hours(24),
        PeriodKind::Daily => midnight_utc(today + Duration::days(1), now),
        PeriodKind::Weekly => {
            let days_until_monday = 7 - i64::from(today.weekday().num_days_from_monday());
            midnight_utc(today + Duration::days(days_until_monday), now)
        }
        PeriodKind::Monthly => {
            let (year, month) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today);
            midnight_utc(first, now)
        }
    }
}

fn midnight_utc(date: NaiveDate, fallback_base: DateTime<Utc>) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(fallback_base + Duration::hours(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tradeguard_core::types::{RiskLevel, RiskLimits};

    fn assessment(user: &str, base_daily: Decimal) -> RiskAssessment {
        RiskAssessment {
            user: UserId::from(user),
            risk_score: Decimal::new(40, 0),
            risk_level: RiskLevel::Moderate,
            limits: RiskLimits {
                max_daily_loss: base_daily,
                max_position_size: Decimal::new(10000, 0),
                max_portfolio_concentration: Decimal::new(25, 0),
            },
            assessed_at: Utc::now(),
        }
    }

    fn store() -> LimitStore {
        LimitStore::new(LimitConfig::default())
    }

    #[tokio::test]
    async fn test_initialize_derives_period_amounts() {
        let store = store();
        let now = Utc::now();
        let limits = store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();

        let amount = |p: PeriodKind| {
            limits
                .iter()
                .find(|l| l.period == p)
                .map(|l| l.limit_amount)
                .unwrap()
        };
        assert_eq!(amount(PeriodKind::Session), Decimal::new(50, 0));
        assert_eq!(amount(PeriodKind::Daily), Decimal::new(100, 0));
        assert_eq!(amount(PeriodKind::Weekly), Decimal::new(500, 0));
        assert_eq!(amount(PeriodKind::Monthly), Decimal::new(2000, 0));
    }

    #[tokio::test]
    async fn test_initialize_rejects_non_positive_base() {
        let store = store();
        let result = store
            .initialize(&assessment("u1", Decimal::ZERO), Utc::now())
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = store();
        let now = Utc::now();
        store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();
        store
            .apply_loss(&UserId::from("u1"), Decimal::new(30, 0), now)
            .await
            .unwrap();

        // Re-initializing must not wipe accumulated state.
        let limits = store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();
        let daily = limits.iter().find(|l| l.period == PeriodKind::Daily).unwrap();
        assert_eq!(daily.accumulated_loss, Decimal::new(30, 0));
    }

    #[tokio::test]
    async fn test_apply_loss_accumulates_and_never_decreases() {
        let store = store();
        let now = Utc::now();
        let user = UserId::from("u1");
        store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();

        let mut previous = Decimal::ZERO;
        for amount in [10, 25, 5, 40] {
            let statuses = store
                .apply_loss(&user, Decimal::new(amount, 0), now)
                .await
                .unwrap();
            let daily = statuses
                .iter()
                .find(|s| s.period == PeriodKind::Daily)
                .unwrap();
            assert!(daily.accumulated_loss >= previous);
            assert!(daily.accumulated_loss >= Decimal::ZERO);
            previous = daily.accumulated_loss;
        }
        assert_eq!(previous, Decimal::new(80, 0));
    }

    #[tokio::test]
    async fn test_apply_loss_non_positive_is_noop() {
        let store = store();
        let now = Utc::now();
        let user = UserId::from("u1");
        store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();

        assert!(store
            .apply_loss(&user, Decimal::ZERO, now)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .apply_loss(&user, Decimal::new(-50, 0), now)
            .await
            .unwrap()
            .is_empty());

        let daily = store
            .limits_for(&user)
            .into_iter()
            .find(|l| l.period == PeriodKind::Daily)
            .unwrap();
        assert_eq!(daily.accumulated_loss, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_apply_loss_unknown_user_fails() {
        let store = store();
        let result = store
            .apply_loss(&UserId::from("ghost"), Decimal::new(10, 0), Utc::now())
            .await;
        assert!(matches!(result, Err(Error::UserNotInitialized(_))));
    }

    #[tokio::test]
    async fn test_threshold_crossing_is_edge_triggered() {
        let store = store();
        let now = Utc::now();
        let user = UserId::from("u1");
        store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();

        // 96% of the daily limit: halt threshold (95%) newly crossed.
        let statuses = store
            .apply_loss(&user, Decimal::new(96, 0), now)
            .await
            .unwrap();
        let daily = statuses
            .iter()
            .find(|s| s.period == PeriodKind::Daily)
            .unwrap();
        assert!(daily.warning_crossed);
        assert!(daily.halt_crossed);

        // A further smaller loss must not re-fire either threshold.
        let statuses = store
            .apply_loss(&user, Decimal::new(1, 0), now)
            .await
            .unwrap();
        let daily = statuses
            .iter()
            .find(|s| s.period == PeriodKind::Daily)
            .unwrap();
        assert!(!daily.warning_crossed);
        assert!(!daily.halt_crossed);
        assert_eq!(daily.pct_used, Decimal::new(97, 0));
    }

    #[tokio::test]
    async fn test_maybe_reset_zeroes_and_advances() {
        let store = store();
        let now = Utc::now();
        let user = UserId::from("u1");
        store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();
        store
            .apply_loss(&user, Decimal::new(60, 0), now)
            .await
            .unwrap();

        // Well past every boundary.
        let later = now + Duration::days(40);
        let reset = store.maybe_reset(&user, later).await;
        assert_eq!(reset, 4);

        for limit in store.limits_for(&user) {
            assert_eq!(limit.accumulated_loss, Decimal::ZERO);
            assert!(limit.next_reset > later, "next_reset must strictly advance");
        }

        // Idempotent before the new boundary.
        assert_eq!(store.maybe_reset(&user, later).await, 0);
    }

    #[test]
    fn test_daily_boundary_is_next_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let next = next_boundary(PeriodKind::Daily, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_weekly_boundary_is_next_monday() {
        // 2026-03-14 is a Saturday.
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let next = next_boundary(PeriodKind::Weekly, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap());

        // From a Monday, the boundary is the following Monday, never today.
        let monday = Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap();
        let next = next_boundary(PeriodKind::Weekly, monday);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 23, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_boundary_handles_year_rollover() {
        let now = Utc.with_ymd_and_hms(2026, 12, 20, 8, 0, 0).unwrap();
        let next = next_boundary(PeriodKind::Monthly, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_session_boundary_is_relative() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap();
        let next = next_boundary(PeriodKind::Session, now);
        assert_eq!(next, now + Duration::hours(24));
    }

    #[tokio::test]
    async fn test_hydrate_restores_persisted_state() {
        use crate::persistence::MockLimitStorage;

        let user = UserId::from("u1");
        let now = Utc::now();
        let mut limit = LossLimit::new(
            user.clone(),
            PeriodKind::Daily,
            Decimal::new(100, 0),
            Decimal::new(80, 0),
            Decimal::new(95, 0),
            now,
            now + Duration::hours(24),
        );
        limit.accumulated_loss = Decimal::new(96, 0);
        let stored = vec![limit];

        let mut storage = MockLimitStorage::new();
        storage
            .expect_load_for_user()
            .times(1)
            .returning(move |_| Ok(stored.clone()));

        let store = LimitStore::with_storage(LimitConfig::default(), Arc::new(storage));
        assert!(!store.is_initialized(&user));

        // The breached counter survives the restart.
        assert!(store.hydrate(&user).await);
        assert!(store.is_initialized(&user));
        assert_eq!(store.any_breached(&user), Some(PeriodKind::Daily));

        // Memory is authoritative once loaded: no second storage read.
        assert!(!store.hydrate(&user).await);
    }

    #[tokio::test]
    async fn test_hydrate_without_storage_is_noop() {
        let store = store();
        assert!(!store.hydrate(&UserId::from("u1")).await);
    }

    #[tokio::test]
    async fn test_hydrate_storage_error_leaves_user_uninitialized() {
        use crate::persistence::MockLimitStorage;

        let mut storage = MockLimitStorage::new();
        storage
            .expect_load_for_user()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));

        let store = LimitStore::with_storage(LimitConfig::default(), Arc::new(storage));
        let user = UserId::from("u1");
        assert!(!store.hydrate(&user).await);
        // Nothing loaded: the user stays uninitialized and admission fails
        // closed upstream.
        assert!(!store.is_initialized(&user));
    }

    #[tokio::test]
    async fn test_force_reset() {
        let store = store();
        let now = Utc::now();
        let user = UserId::from("u1");
        store
            .initialize(&assessment("u1", Decimal::new(100, 0)), now)
            .await
            .unwrap();
        store
            .apply_loss(&user, Decimal::new(96, 0), now)
            .await
            .unwrap();
        assert!(store.any_breached(&user).is_some());

        store.force_reset(&user, now).await.unwrap();
        assert!(store.any_breached(&user).is_none());
    }
}
