//! Active-pool tracking and failover/recovery detection.

use tracing::info;

use crate::event::{AlertEvent, FailoverEvent, RecoveryEvent};

/// What counts as a recovery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Traffic returns to the pool it most recently departed from.
    #[default]
    ReturnToPrevious,
    /// Traffic switches back to this designated primary pool.
    Primary(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolState {
    Unseen,
    Observed {
        current: String,
        previous: Option<String>,
    },
}

/// A detected change of active pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTransition {
    /// The change itself.
    pub failover: FailoverEvent,
    /// Set when the change brings traffic back to a pool it had left.
    pub recovery: Option<RecoveryEvent>,
}

impl PoolTransition {
    /// Flatten into alert events, failover first.
    pub fn into_events(self) -> Vec<AlertEvent> {
        let mut events = vec![AlertEvent::Failover(self.failover)];
        if let Some(recovery) = self.recovery {
            events.push(AlertEvent::Recovery(recovery));
        }
        events
    }
}

/// Watches the `pool` field of successive entries.
///
/// The first pool seen is a baseline, not a failover. Entries without a pool
/// leave the state untouched.
#[derive(Debug, Clone)]
pub struct FailoverDetector {
    state: PoolState,
    policy: RecoveryPolicy,
}

impl FailoverDetector {
    /// Create a detector with no pool observed yet.
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            state: PoolState::Unseen,
            policy,
        }
    }

    /// Pool currently serving traffic, if one has been observed.
    pub fn current_pool(&self) -> Option<&str> {
        match &self.state {
            PoolState::Unseen => None,
            PoolState::Observed { current, .. } => Some(current),
        }
    }

    /// Pool most recently departed from.
    pub fn previous_pool(&self) -> Option<&str> {
        match &self.state {
            PoolState::Unseen => None,
            PoolState::Observed { previous, .. } => previous.as_deref(),
        }
    }

    /// Feed the pool of one entry.
    pub fn observe(&mut self, pool: Option<&str>) -> Option<PoolTransition> {
        let pool = pool?;

        match &mut self.state {
            PoolState::Unseen => {
                info!(pool, "baseline pool established");
                self.state = PoolState::Observed {
                    current: pool.to_owned(),
                    previous: None,
                };
                None
            }
            PoolState::Observed { current, previous } => {
                if current == pool {
                    return None;
                }

                let recovered = match &self.policy {
                    RecoveryPolicy::ReturnToPrevious => previous.as_deref() == Some(pool),
                    RecoveryPolicy::Primary(primary) => primary == pool,
                };

                let from = std::mem::replace(current, pool.to_owned());
                *previous = Some(from.clone());

                Some(PoolTransition {
                    failover: FailoverEvent {
                        from,
                        to: pool.to_owned(),
                    },
                    recovery: recovered.then(|| RecoveryEvent {
                        pool: pool.to_owned(),
                    }),
                })
            }
        }
    }
}

impl Default for FailoverDetector {
    fn default() -> Self {
        Self::new(RecoveryPolicy::default())
    }
}
