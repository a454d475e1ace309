use std::sync::{Arc, PoisonError, RwLock};

use glam::Vec3;
use uuid::Uuid;

use crate::dispatch::{CallbackDispatcher, HandlerId};
use crate::net::{Block, FieldValue, MessageType};

/// Who is logged in. Fixed for the life of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentIdentity {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl AgentIdentity {
    pub fn new(agent_id: Uuid, session_id: Uuid) -> Self {
        Self {
            agent_id,
            session_id,
        }
    }

    pub fn random() -> Self {
        Self::new(Uuid::new_v4(), Uuid::new_v4())
    }

    /// The `AgentData` block most agent-originated messages lead with.
    pub fn agent_data(&self) -> Block {
        Block::new("AgentData")
            .with("AgentID", FieldValue::Uuid(self.agent_id))
            .with("SessionID", FieldValue::Uuid(self.session_id))
    }
}

/// Last values reported by the simulator, written by the handlers
/// `AgentCache::attach` registers. Only `name` is set locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentState {
    /// Display name, "First Last". Set locally, never by the simulator.
    pub name: String,
    pub position: Vec3,
    pub look_at: Vec3,
    pub region_handle: Option<u64>,
    pub health: Option<f32>,
    pub balance: Option<i32>,
}

impl AgentState {
    /// Applies a balance delta. An unknown balance counts as zero.
    fn adjust_balance(&mut self, delta: i32) {
        self.balance = Some(self.balance.unwrap_or(0).saturating_add(delta));
    }
}

#[derive(Debug, Default)]
pub struct AgentCache {
    state: RwLock<AgentState>,
}

impl AgentCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> AgentState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update(|state| state.name = name);
    }

    fn update(&self, f: impl FnOnce(&mut AgentState)) {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn attach(self: &Arc<Self>, dispatcher: &CallbackDispatcher) -> Vec<HandlerId> {
        let movement = Arc::clone(self);
        let health = Arc::clone(self);
        let balance = Arc::clone(self);
        let summary = Arc::clone(self);
        let adjust = Arc::clone(self);

        vec![
            dispatcher.register(MessageType::AgentMovementComplete, move |message, _| {
                let data = message.block("Data")?;
                let position = data.vector3("Position")?;
                let look_at = data.vector3("LookAt")?;
                let region_handle = data.u64("RegionHandle")?;
                movement.update(|state| {
                    state.position = position;
                    state.look_at = look_at;
                    state.region_handle = Some(region_handle);
                });
                Ok(())
            }),
            dispatcher.register(MessageType::HealthMessage, move |message, _| {
                let value = message.block("HealthData")?.f32("Health")?;
                health.update(|state| state.health = Some(value));
                Ok(())
            }),
            dispatcher.register(MessageType::MoneyBalanceReply, move |message, _| {
                let data = message.block("MoneyData")?;
                if data.bool("TransactionSuccess")? {
                    let value = data.i32("MoneyBalance")?;
                    balance.update(|state| state.balance = Some(value));
                } else {
                    log::warn!(
                        "Balance request failed: {}",
                        data.string("Description").unwrap_or_default()
                    );
                }
                Ok(())
            }),
            dispatcher.register(MessageType::MoneySummaryReply, move |message, _| {
                let value = message.block("MoneyData")?.i32("Balance")?;
                summary.update(|state| state.balance = Some(value));
                Ok(())
            }),
            dispatcher.register(MessageType::AdjustBalance, move |message, _| {
                let delta = message.block("AgentData")?.i32("Delta")?;
                adjust.update(|state| state.adjust_balance(delta));
                Ok(())
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_data_block() {
        let identity = AgentIdentity::random();
        let block = identity.agent_data();
        assert_eq!(block.uuid("AgentID").unwrap(), identity.agent_id);
        assert_eq!(block.uuid("SessionID").unwrap(), identity.session_id);
    }

    #[test]
    fn test_cache_starts_empty() {
        let cache = AgentCache::new();
        let state = cache.snapshot();
        assert_eq!(state.position, Vec3::ZERO);
        assert!(state.health.is_none() && state.balance.is_none());
    }

    #[test]
    fn test_adjust_balance() {
        let mut state = AgentState::default();
        state.adjust_balance(-30);
        assert_eq!(state.balance, Some(-30));
        state.balance = Some(100);
        state.adjust_balance(25);
        assert_eq!(state.balance, Some(125));
        state.adjust_balance(i32::MAX);
        assert_eq!(state.balance, Some(i32::MAX));
    }
}
