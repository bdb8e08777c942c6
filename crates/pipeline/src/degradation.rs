//! Degradation controller actor.
//!
//! A single task owns the [`DegradationMachine`] and is the only writer of
//! the process-wide level. Everyone else holds a [`DegradationHandle`]:
//! samples and operator overrides go in over an mpsc channel, and the
//! current level and its effects come out through a `watch` snapshot that
//! schedulers read without waiting on the actor.

use chrono::Utc;
use reelgen_core::config::DegradationSettings;
use reelgen_core::degradation::{
    DegradationLevel, DegradationMachine, EffectTable, LevelEffects, LevelTransition, MetricsSample,
};
use reelgen_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

const COMMAND_BUFFER: usize = 64;

/// What schedulers read.
#[derive(Debug, Clone, Serialize)]
pub struct DegradationSnapshot {
    pub level: DegradationLevel,
    pub effects: LevelEffects,
    /// When the current level was entered.
    pub since: Timestamp,
    pub healthy_streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<MetricsSample>,
}

enum Command {
    Report {
        sample: MetricsSample,
        reply: oneshot::Sender<Option<LevelTransition>>,
    },
    Force {
        level: DegradationLevel,
        reason: String,
        reply: oneshot::Sender<Option<LevelTransition>>,
    },
    History {
        reply: oneshot::Sender<Vec<LevelTransition>>,
    },
}

/// The single writer of the degradation level.
pub struct DegradationController {
    machine: DegradationMachine,
    effects: EffectTable,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<DegradationSnapshot>,
}

impl DegradationController {
    /// Start the actor at [`DegradationLevel::Full`]. It stops once every
    /// handle has been dropped.
    pub fn spawn(settings: &DegradationSettings) -> DegradationHandle {
        let machine =
            DegradationMachine::new(settings.thresholds.clone(), settings.hysteresis_samples);
        let initial = DegradationSnapshot {
            level: machine.level(),
            effects: settings.effects.get(machine.level()).clone(),
            since: Utc::now(),
            healthy_streak: 0,
            last_sample: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let controller = Self {
            machine,
            effects: settings.effects.clone(),
            commands: command_rx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(controller.run());

        DegradationHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Report { sample, reply } => {
                    let transition = self.machine.evaluate(sample);
                    self.publish(transition.as_ref(), Some(sample));
                    let _ = reply.send(transition);
                }
                Command::Force { level, reason, reply } => {
                    let transition = self.machine.force(level, reason);
                    self.publish(transition.as_ref(), None);
                    let _ = reply.send(transition);
                }
                Command::History { reply } => {
                    let _ = reply.send(self.machine.history().to_vec());
                }
            }
        }
        tracing::debug!("Degradation controller stopped");
    }

    fn publish(&self, transition: Option<&LevelTransition>, sample: Option<MetricsSample>) {
        if let Some(t) = transition {
            if t.to > t.from {
                tracing::warn!(
                    from = t.from.as_str(),
                    to = t.to.as_str(),
                    reason = %t.reason,
                    "Degradation level lowered"
                );
            } else {
                tracing::info!(
                    from = t.from.as_str(),
                    to = t.to.as_str(),
                    reason = %t.reason,
                    "Degradation level raised"
                );
            }
        }
        let level = self.machine.level();
        let effects = self.effects.get(level).clone();
        let healthy_streak = self.machine.healthy_streak();
        self.snapshot.send_modify(|snapshot| {
            if let Some(t) = transition {
                snapshot.since = t.at;
            }
            snapshot.level = level;
            snapshot.effects = effects;
            snapshot.healthy_streak = healthy_streak;
            if sample.is_some() {
                snapshot.last_sample = sample;
            }
        });
    }
}

/// Cheap, cloneable access to the controller.
#[derive(Clone)]
pub struct DegradationHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<DegradationSnapshot>,
}

impl DegradationHandle {
    /// Latest published snapshot. May trail an in-progress evaluation by
    /// one decision.
    pub fn current(&self) -> DegradationSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn level(&self) -> DegradationLevel {
        self.snapshot.borrow().level
    }

    pub fn effects(&self) -> LevelEffects {
        self.snapshot.borrow().effects.clone()
    }

    /// Feed one metrics sample. Returns the transition it caused, if any.
    pub async fn report(&self, sample: MetricsSample) -> Option<LevelTransition> {
        self.ask(|reply| Command::Report { sample, reply }).await.flatten()
    }

    /// Operator override to an explicit level.
    pub async fn force(
        &self,
        level: DegradationLevel,
        reason: impl Into<String>,
    ) -> Option<LevelTransition> {
        let reason = reason.into();
        self.ask(|reply| Command::Force { level, reason, reply }).await.flatten()
    }

    /// Every recorded transition, oldest first.
    pub async fn history(&self) -> Vec<LevelTransition> {
        self.ask(|reply| Command::History { reply }).await.unwrap_or_default()
    }

    /// Watch level changes.
    pub fn subscribe(&self) -> watch::Receiver<DegradationSnapshot> {
        self.snapshot.clone()
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(command(reply)).await.is_err() {
            tracing::error!("Degradation controller is not running");
            return None;
        }
        response.await.ok()
    }
}
