//! Configuration for the risk control engine.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// How the position-size check in `check_trade` treats violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionCheckMode {
    /// List the violation as a restriction but allow the trade.
    Warn,
    /// Deny the trade outright.
    Deny,
}

/// Loss limit thresholds and period multipliers.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    /// Warning fires at this percentage of a limit (e.g. 80 = 80%).
    pub warning_threshold_pct: Decimal,
    /// Trading halts at this percentage of a limit.
    pub halt_threshold_pct: Decimal,
    /// Soft warnings attach to allowed trades above this usage.
    pub soft_warning_pct: Decimal,
    /// Session limit = base daily amount x this.
    pub session_multiplier: Decimal,
    /// Weekly limit = base daily amount x this.
    pub weekly_multiplier: Decimal,
    /// Monthly limit = base daily amount x this.
    pub monthly_multiplier: Decimal,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            warning_threshold_pct: Decimal::new(80, 0),
            halt_threshold_pct: Decimal::new(95, 0),
            soft_warning_pct: Decimal::new(70, 0),
            session_multiplier: Decimal::new(5, 1),  // 0.5x
            weekly_multiplier: Decimal::new(5, 0),   // 5x
            monthly_multiplier: Decimal::new(20, 0), // 20x
        }
    }
}

/// Default circuit breaker trigger rules.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Loss-limit breaker fires when any daily limit reaches this usage.
    pub loss_limit_trigger_pct: Decimal,
    /// Drawdown breaker fires at this drawdown from the rolling peak
    /// (percentage, e.g. 15 = 15%).
    pub max_drawdown_pct: Decimal,
    /// Window the drawdown peak is measured over.
    pub drawdown_window_hours: i64,
    /// Velocity breaker fires when trade count exceeds this in the window.
    pub velocity_max_trades: usize,
    /// Rolling window for velocity counting.
    pub velocity_window_minutes: i64,
    /// Cooldown after a trip.
    pub cooldown_minutes: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            loss_limit_trigger_pct: Decimal::new(95, 0),
            max_drawdown_pct: Decimal::new(15, 0),
            drawdown_window_hours: 24,
            velocity_max_trades: 50,
            velocity_window_minutes: 60,
            cooldown_minutes: 60,
        }
    }
}

/// Position sizing defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    /// Share counts are rounded down to a multiple of this.
    pub default_lot_size: Decimal,
    pub position_check_mode: PositionCheckMode,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            default_lot_size: Decimal::new(100, 0),
            position_check_mode: PositionCheckMode::Warn,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub limits: LimitConfig,
    pub breakers: BreakerConfig,
    pub sizing: SizingConfig,
    /// Operator ids authorized to override halts and re-arm breakers.
    pub operators: Vec<String>,
    /// How long to wait for the per-user scope before reporting contention.
    pub lock_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: LimitConfig::default(),
            breakers: BreakerConfig::default(),
            sizing: SizingConfig::default(),
            operators: Vec::new(),
            lock_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Self {
            limits: LimitConfig {
                warning_threshold_pct: env_decimal(
                    "TRADEGUARD_WARNING_THRESHOLD_PCT",
                    defaults.limits.warning_threshold_pct,
                ),
                halt_threshold_pct: env_decimal(
                    "TRADEGUARD_HALT_THRESHOLD_PCT",
                    defaults.limits.halt_threshold_pct,
                ),
                soft_warning_pct: env_decimal(
                    "TRADEGUARD_SOFT_WARNING_PCT",
                    defaults.limits.soft_warning_pct,
                ),
                session_multiplier: env_decimal(
                    "TRADEGUARD_SESSION_MULTIPLIER",
                    defaults.limits.session_multiplier,
                ),
                weekly_multiplier: env_decimal(
                    "TRADEGUARD_WEEKLY_MULTIPLIER",
                    defaults.limits.weekly_multiplier,
                ),
                monthly_multiplier: env_decimal(
                    "TRADEGUARD_MONTHLY_MULTIPLIER",
                    defaults.limits.monthly_multiplier,
                ),
            },
            breakers: BreakerConfig {
                loss_limit_trigger_pct: env_decimal(
                    "TRADEGUARD_LOSS_LIMIT_TRIGGER_PCT",
                    defaults.breakers.loss_limit_trigger_pct,
                ),
                max_drawdown_pct: env_decimal(
                    "TRADEGUARD_MAX_DRAWDOWN_PCT",
                    defaults.breakers.max_drawdown_pct,
                ),
                drawdown_window_hours: env_parse(
                    "TRADEGUARD_DRAWDOWN_WINDOW_HOURS",
                    defaults.breakers.drawdown_window_hours,
                ),
                velocity_max_trades: env_parse(
                    "TRADEGUARD_VELOCITY_MAX_TRADES",
                    defaults.breakers.velocity_max_trades,
                ),
                velocity_window_minutes: env_parse(
                    "TRADEGUARD_VELOCITY_WINDOW_MINUTES",
                    defaults.breakers.velocity_window_minutes,
                ),
                cooldown_minutes: env_parse(
                    "TRADEGUARD_COOLDOWN_MINUTES",
                    defaults.breakers.cooldown_minutes,
                ),
            },
            sizing: SizingConfig {
                default_lot_size: env_decimal(
                    "TRADEGUARD_LOT_SIZE",
                    defaults.sizing.default_lot_size,
                ),
                position_check_mode: match env::var("TRADEGUARD_POSITION_CHECK_MODE").as_deref() {
                    Ok("deny") => PositionCheckMode::Deny,
                    Ok("warn") | Err(_) => PositionCheckMode::Warn,
                    Ok(other) => {
                        // A typo must not relax the check silently.
                        tracing::warn!(
                            value = other,
                            "unrecognized TRADEGUARD_POSITION_CHECK_MODE, using warn"
                        );
                        PositionCheckMode::Warn
                    }
                },
            },
            operators: env::var("TRADEGUARD_OPERATORS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            lock_timeout_ms: env_parse("TRADEGUARD_LOCK_TIMEOUT_MS", defaults.lock_timeout_ms),
        }
    }
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|s| Decimal::from_str(&s).ok())
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.halt_threshold_pct, Decimal::new(95, 0));
        assert_eq!(config.limits.session_multiplier, Decimal::new(5, 1));
        assert_eq!(config.breakers.velocity_max_trades, 50);
        assert_eq!(config.sizing.default_lot_size, Decimal::new(100, 0));
        assert_eq!(config.sizing.position_check_mode, PositionCheckMode::Warn);
    }

    // Single test for all TRADEGUARD_POSITION_CHECK_MODE values: tests run
    // in parallel and the env var is process-global.
    #[test]
    fn test_position_check_mode_from_env() {
        env::set_var("TRADEGUARD_POSITION_CHECK_MODE", "deny");
        assert_eq!(
            EngineConfig::from_env().sizing.position_check_mode,
            PositionCheckMode::Deny
        );

        env::set_var("TRADEGUARD_POSITION_CHECK_MODE", "warn");
        assert_eq!(
            EngineConfig::from_env().sizing.position_check_mode,
            PositionCheckMode::Warn
        );

        // A typo falls back to warn, never silently to a different mode.
        env::set_var("TRADEGUARD_POSITION_CHECK_MODE", "denny");
        assert_eq!(
            EngineConfig::from_env().sizing.position_check_mode,
            PositionCheckMode::Warn
        );

        env::remove_var("TRADEGUARD_POSITION_CHECK_MODE");
        assert_eq!(
            EngineConfig::from_env().sizing.position_check_mode,
            PositionCheckMode::Warn
        );
    }

    #[test]
    fn test_multipliers_scale_base_daily() {
        let config = EngineConfig::default();
        let base = Decimal::new(100, 0);
        assert_eq!(base * config.limits.session_multiplier, Decimal::new(50, 0));
        assert_eq!(base * config.limits.weekly_multiplier, Decimal::new(500, 0));
        assert_eq!(
            base * config.limits.monthly_multiplier,
            Decimal::new(2000, 0)
        );
    }
}
