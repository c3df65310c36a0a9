//! Applies realized losses and escalates limit breaches into breaker trips
//! and trading halts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tradeguard_core::types::{
    HaltKind, LimitStatus, RiskEvent, RiskSignal, TradingHalt, UserId,
};
use tradeguard_core::Result;

use crate::breakers::BreakerRegistry;
use crate::halts::HaltRegistry;
use crate::limit_store::LimitStore;

/// Result of processing one loss event.
#[derive(Debug, Clone)]
pub struct LossOutcome {
    pub statuses: Vec<LimitStatus>,
    /// Halts opened by this event (empty when no halt threshold was crossed).
    pub halts: Vec<TradingHalt>,
}

impl LossOutcome {
    pub fn halted(&self) -> bool {
        !self.halts.is_empty()
    }
}

/// Escalation pipeline for realized losses.
///
/// Step 1 (recording the loss) is never rolled back: escalation failures are
/// logged and retries stay idempotent through the store's edge-triggered
/// crossing detection.
pub struct LossEventProcessor {
    limits: Arc<LimitStore>,
    breakers: Arc<BreakerRegistry>,
    halts: Arc<HaltRegistry>,
    events: mpsc::Sender<RiskEvent>,
}

impl LossEventProcessor {
    pub fn new(
        limits: Arc<LimitStore>,
        breakers: Arc<BreakerRegistry>,
        halts: Arc<HaltRegistry>,
        events: mpsc::Sender<RiskEvent>,
    ) -> Self {
        Self {
            limits,
            breakers,
            halts,
            events,
        }
    }

    /// Apply a realized loss and run the escalation pass.
    ///
    /// Caller must hold the per-user scope.
    pub async fn process(
        &self,
        user: &UserId,
        session_id: Option<&str>,
        amount: Decimal,
        symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LossOutcome> {
        self.limits.maybe_reset(user, now).await;

        // Step 1: record the loss. Errors here abort with nothing recorded.
        let statuses = self.limits.apply_loss(user, amount, now).await?;

        let mut halts = Vec::new();
        for status in &statuses {
            // Step 2: newly-crossed warning thresholds emit warning events
            // only.
            if status.warning_crossed && !status.halt_crossed {
                self.emit(RiskEvent::LimitWarning {
                    user: user.clone(),
                    period: status.period,
                    pct_used: status.pct_used,
                });
            }

            // Step 3: newly-crossed halt thresholds escalate into a breaker
            // evaluation and a risk-limit halt.
            if status.halt_crossed {
                self.emit(RiskEvent::LimitBreach {
                    user: user.clone(),
                    period: status.period,
                    pct_used: status.pct_used,
                });

                let signal = RiskSignal::LossBreach {
                    period: status.period,
                    pct_used: status.pct_used,
                };
                for trip in self.breakers.evaluate(user, &signal, now).await {
                    self.emit(RiskEvent::BreakerTripped {
                        user: user.clone(),
                        breaker_id: trip.breaker_id,
                        trigger: trip.trigger,
                        condition: trip.condition,
                    });
                }

                let reason = format!("{} loss limit exceeded", status.period.label());
                let payload = json!({
                    "trigger": "loss_limit",
                    "period": status.period,
                    "symbol": symbol,
                });
                let halt = self
                    .halts
                    .open_halt(user, HaltKind::RiskLimit, &reason, true, payload, None)
                    .await;
                self.emit(RiskEvent::HaltOpened {
                    user: user.clone(),
                    halt_id: halt.id,
                    kind: halt.kind,
                    reason: halt.reason.clone(),
                });
                halts.push(halt);
            }
        }

        // Step 4: command the session collaborator to halt active sessions.
        if !halts.is_empty() {
            warn!(
                user = %user,
                session_id = ?session_id,
                halts = halts.len(),
                "loss event halted trading"
            );
            self.emit(RiskEvent::SessionsHalted {
                user: user.clone(),
                session_id: session_id.map(|s| s.to_string()),
                reason: halts[0].reason.clone(),
            });
        } else if amount > Decimal::ZERO {
            info!(user = %user, amount = %amount, "loss recorded");
        }

        Ok(LossOutcome { statuses, halts })
    }

    /// Best-effort event emission. A full or closed channel must never block
    /// or fail loss processing.
    fn emit(&self, event: RiskEvent) {
        if let Err(e) = self.events.try_send(event) {
            error!(error = %e, "dropping risk event, channel unavailable");
        }
    }
}
