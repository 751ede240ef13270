//! Lifecycle state machine shared by producers and consumers.
//!
//! ```text
//! DOWN -> GOING_UP -> UP -> GOING_DOWN -> DOWN
//!            |                   |
//!            +-- rollback -> DOWN +-- rollback -> UP
//! ```

use crate::error::{QueueError, Result};
use crate::events::{EventBus, QueueEvent};
use strum::Display;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    Down,
    GoingUp,
    Up,
    GoingDown,
}

impl PowerState {
    fn event(self) -> QueueEvent {
        match self {
            PowerState::Down => QueueEvent::Down,
            PowerState::GoingUp => QueueEvent::GoingUp,
            PowerState::Up => QueueEvent::Up,
            PowerState::GoingDown => QueueEvent::GoingDown,
        }
    }
}

#[derive(Debug)]
pub struct PowerManager {
    tx: watch::Sender<PowerState>,
    events: EventBus,
}

impl PowerManager {
    pub fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(PowerState::Down);
        Self { tx, events }
    }

    pub fn state(&self) -> PowerState {
        *self.tx.borrow()
    }

    pub fn is_up(&self) -> bool {
        self.state() == PowerState::Up
    }

    pub fn subscribe(&self) -> watch::Receiver<PowerState> {
        self.tx.subscribe()
    }

    /// DOWN -> GOING_UP
    pub fn going_up(&self) -> Result<()> {
        self.transition(PowerState::Down, PowerState::GoingUp)
    }

    /// UP -> GOING_DOWN
    pub fn going_down(&self) -> Result<()> {
        self.transition(PowerState::Up, PowerState::GoingDown)
    }

    /// Complete the pending transition
    pub fn commit(&self) -> Result<()> {
        match self.state() {
            PowerState::GoingUp => self.transition(PowerState::GoingUp, PowerState::Up),
            PowerState::GoingDown => self.transition(PowerState::GoingDown, PowerState::Down),
            from => Err(QueueError::InvalidTransition {
                from,
                to: PowerState::Up,
            }),
        }
    }

    /// Abort the pending transition
    pub fn rollback(&self) -> Result<()> {
        match self.state() {
            PowerState::GoingUp => self.transition(PowerState::GoingUp, PowerState::Down),
            PowerState::GoingDown => self.transition(PowerState::GoingDown, PowerState::Up),
            from => Err(QueueError::InvalidTransition {
                from,
                to: PowerState::Down,
            }),
        }
    }

    fn transition(&self, from: PowerState, to: PowerState) -> Result<()> {
        let mut actual = from;
        let changed = self.tx.send_if_modified(|state| {
            actual = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if !changed {
            return Err(QueueError::InvalidTransition { from: actual, to });
        }
        debug!(instance_id = %self.events.instance_id(), %from, %to, "Power state changed");
        self.events.emit(to.event());
        Ok(())
    }

    /// Resolve once UP. Fails with `NotRunning` if the instance is down, going
    /// down, or a pending startup rolls back.
    pub async fn wait_until_up(&self) -> Result<()> {
        // Subscribe before reading so a transition in between is not missed
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                PowerState::Up => return Ok(()),
                PowerState::GoingUp => {}
                PowerState::Down | PowerState::GoingDown => return Err(self.not_running()),
            }
            if rx.changed().await.is_err() {
                return Err(self.not_running());
            }
        }
    }

    pub fn not_running(&self) -> QueueError {
        QueueError::NotRunning {
            instance_id: self.events.instance_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager() -> PowerManager {
        PowerManager::new(EventBus::new(Uuid::new_v4()))
    }

    #[test]
    fn test_full_cycle_is_reentrant() {
        let power = manager();
        for _ in 0..2 {
            power.going_up().unwrap();
            power.commit().unwrap();
            assert!(power.is_up());
            power.going_down().unwrap();
            power.commit().unwrap();
            assert_eq!(power.state(), PowerState::Down);
        }
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let power = manager();
        let err = power.going_down().unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: PowerState::Down,
                to: PowerState::GoingDown
            }
        ));
        assert!(power.commit().is_err());

        power.going_up().unwrap();
        assert!(power.going_up().is_err());
    }

    #[test]
    fn test_transitions_emit_events() {
        let bus = EventBus::new(Uuid::new_v4());
        let mut rx = bus.subscribe();
        let power = PowerManager::new(bus);

        power.going_up().unwrap();
        power.commit().unwrap();

        assert_eq!(rx.try_recv().unwrap().event, QueueEvent::GoingUp);
        assert_eq!(rx.try_recv().unwrap().event, QueueEvent::Up);
    }

    #[tokio::test]
    async fn test_wait_until_up_fails_when_down() {
        let power = manager();
        assert!(matches!(
            power.wait_until_up().await,
            Err(QueueError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_until_up_resolves_after_commit() {
        let power = Arc::new(manager());
        power.going_up().unwrap();

        let waiter = {
            let power = power.clone();
            tokio::spawn(async move { power.wait_until_up().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        power.commit().unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_up_fails_on_rollback() {
        let power = Arc::new(manager());
        power.going_up().unwrap();

        let waiter = {
            let power = power.clone();
            tokio::spawn(async move { power.wait_until_up().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        power.rollback().unwrap();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(QueueError::NotRunning { .. })
        ));
    }
}
