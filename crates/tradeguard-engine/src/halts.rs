//! Per-user trading halts, active or lifted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use tradeguard_core::types::{payload_signature, HaltKind, TradingHalt, UserId};
use tradeguard_core::{Error, Result};

use crate::persistence::{HaltRepository, HaltStorage};

/// Registry of trading halts, keyed by halt id with a per-user index.
pub struct HaltRegistry {
    halts: DashMap<Uuid, TradingHalt>,
    by_user: DashMap<UserId, Vec<Uuid>>,
    /// Operator ids allowed to lift override-required halts.
    operators: HashSet<String>,
    repo: Option<Arc<dyn HaltStorage>>,
}

impl HaltRegistry {
    pub fn new(operators: Vec<String>) -> Self {
        Self {
            halts: DashMap::new(),
            by_user: DashMap::new(),
            operators: operators.into_iter().collect(),
            repo: None,
        }
    }

    pub fn with_persistence(operators: Vec<String>, pool: PgPool) -> Self {
        Self::with_storage(operators, Arc::new(HaltRepository::new(pool)))
    }

    pub fn with_storage(operators: Vec<String>, storage: Arc<dyn HaltStorage>) -> Self {
        Self {
            repo: Some(storage),
            ..Self::new(operators)
        }
    }

    /// Load the user's active halts from storage if nothing is in memory for
    /// them yet. Returns whether anything was loaded.
    pub async fn hydrate(&self, user: &UserId) -> bool {
        if self.by_user.contains_key(user) {
            return false;
        }
        let Some(repo) = &self.repo else {
            return false;
        };
        match repo.load_active_for_user(user).await {
            Ok(loaded) if !loaded.is_empty() => {
                let ids: Vec<Uuid> = loaded.iter().map(|h| h.id).collect();
                info!(
                    user = %user,
                    halts = ids.len(),
                    "rehydrated trading halts from storage"
                );
                for halt in loaded {
                    self.halts.insert(halt.id, halt);
                }
                self.by_user.insert(user.clone(), ids);
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!(user = %user, error = %e, "failed to load trading halts");
                false
            }
        }
    }

    /// Open a halt for a user.
    ///
    /// Idempotent on `(user, kind, payload signature)`: if an active halt
    /// from the same trigger already exists it is returned instead of
    /// creating a duplicate.
    pub async fn open_halt(
        &self,
        user: &UserId,
        kind: HaltKind,
        reason: impl Into<String>,
        override_required: bool,
        payload: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> TradingHalt {
        let signature = payload_signature(&payload);
        if let Some(existing) = self.find_active(user, kind, &signature) {
            info!(
                user = %user,
                halt_id = %existing.id,
                kind = ?kind,
                "suppressing duplicate halt from same trigger"
            );
            return existing;
        }

        let mut halt = TradingHalt::new(user.clone(), kind, reason, override_required, payload);
        if let Some(expiry) = expires_at {
            halt = halt.with_expiry(expiry);
        }

        warn!(
            user = %user,
            halt_id = %halt.id,
            kind = ?kind,
            reason = %halt.reason,
            override_required = override_required,
            "trading halt opened"
        );

        self.by_user
            .entry(user.clone())
            .or_default()
            .push(halt.id);
        self.persist(&halt).await;
        self.halts.insert(halt.id, halt.clone());
        halt
    }

    /// Lift a halt that requires an operator override.
    ///
    /// Fails with `OverrideRequired` when the halt does not accept overrides
    /// or the operator is not authorized. Lifting an already-lifted halt is a
    /// no-op.
    pub async fn override_halt(
        &self,
        halt_id: Uuid,
        operator: &str,
        reason: Option<&str>,
    ) -> Result<TradingHalt> {
        let snapshot = {
            let mut entry = self
                .halts
                .get_mut(&halt_id)
                .ok_or(Error::HaltNotFound(halt_id))?;
            let halt = entry.value_mut();

            if !halt.active {
                return Ok(halt.clone());
            }
            if !halt.override_required || !self.operators.contains(operator) {
                return Err(Error::OverrideRequired { halt_id });
            }

            halt.active = false;
            halt.lifted_at = Some(Utc::now());
            halt.overridden_by = Some(operator.to_string());
            info!(
                user = %halt.user,
                halt_id = %halt_id,
                operator = %operator,
                reason = ?reason,
                "trading halt overridden"
            );
            halt.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Close a halt. Override-required halts additionally demand an
    /// authorized operator. No-op when already lifted.
    pub async fn close_halt(&self, halt_id: Uuid, by: &str) -> Result<TradingHalt> {
        let snapshot = {
            let mut entry = self
                .halts
                .get_mut(&halt_id)
                .ok_or(Error::HaltNotFound(halt_id))?;
            let halt = entry.value_mut();

            if !halt.active {
                return Ok(halt.clone());
            }
            if halt.override_required && !self.operators.contains(by) {
                return Err(Error::OverrideRequired { halt_id });
            }

            halt.active = false;
            halt.lifted_at = Some(Utc::now());
            halt.overridden_by = Some(by.to_string());
            info!(user = %halt.user, halt_id = %halt_id, by = %by, "trading halt closed");
            halt.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Lift expired non-override halts across all users. Override-required
    /// halts never expire.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut lifted = Vec::new();
        for mut entry in self.halts.iter_mut() {
            if expire_if_due(entry.value_mut(), now) {
                lifted.push(*entry.key());
            }
        }
        for id in &lifted {
            if let Some(halt) = self.get(*id) {
                self.persist(&halt).await;
            }
        }
        lifted
    }

    /// Per-user [`tick`](Self::tick), for callers already holding that
    /// user's scope. Touches no other user's state.
    pub async fn tick_user(&self, user: &UserId, now: DateTime<Utc>) -> Vec<Uuid> {
        let ids = self
            .by_user
            .get(user)
            .map(|e| e.clone())
            .unwrap_or_default();
        let mut lifted = Vec::new();
        for id in ids {
            let mut entry = match self.halts.get_mut(&id) {
                Some(e) => e,
                None => continue,
            };
            if expire_if_due(entry.value_mut(), now) {
                lifted.push(id);
            }
        }
        for id in &lifted {
            if let Some(halt) = self.get(*id) {
                self.persist(&halt).await;
            }
        }
        lifted
    }

    /// All halts with `active = true` for a user.
    pub fn active_halts(&self, user: &UserId) -> Vec<TradingHalt> {
        self.by_user
            .get(user)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.halts.get(id).map(|h| h.clone()))
                    .filter(|h| h.active)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, halt_id: Uuid) -> Option<TradingHalt> {
        self.halts.get(&halt_id).map(|h| h.clone())
    }

    fn find_active(&self, user: &UserId, kind: HaltKind, signature: &str) -> Option<TradingHalt> {
        self.active_halts(user)
            .into_iter()
            .find(|h| h.kind == kind && h.signature == signature)
    }

    async fn persist(&self, halt: &TradingHalt) {
        if let Some(repo) = &self.repo {
            if let Err(e) = repo.save(halt).await {
                error!(halt_id = %halt.id, error = %e, "failed to persist trading halt");
            }
        }
    }
}

/// Lift the halt if its expiry has passed. Override-required halts never
/// expire. Returns whether the halt was lifted.
fn expire_if_due(halt: &mut TradingHalt, now: DateTime<Utc>) -> bool {
    if !halt.active || halt.override_required {
        return false;
    }
    if halt.expires_at.map(|t| t <= now).unwrap_or(false) {
        halt.active = false;
        halt.lifted_at = Some(now);
        info!(
            user = %halt.user,
            halt_id = %halt.id,
            "trading halt expired"
        );
        return true;
    }
    false
}
