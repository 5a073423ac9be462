//! Interactive control session.
//!
//! One cooperative loop owns the [`Agent`]. Collaborators talk to it only
//! through [`Command`]s and observe it only through [`SandboxEvent`]s, so
//! network and optimizer state are never touched from two places at once.
//!
//! ```text
//!            ┌──────── SetMode ────────┐
//!            ▼                         │
//!  Idle ──► Training ──► Testing ──► Idle
//!   │  ▲       ▲            ▲
//!   ▼  │       │            │
//!  Manual ─────┴────────────┘
//! ```
//!
//! Commands are read at step and episode boundaries. A mode change or
//! policy reset in the middle of an episode abandons it: nothing from the
//! partial trajectory is trained on.

use crate::config::{self, MAX_SPEED};
use crate::rl::agent::{Agent, StepSource};
use anyhow::{Context, Result};
use cartpole_protocol::{Action, Command, EpisodeSummary, Mode, SandboxEvent};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};

const TEST_STEP_DELAY: Duration = Duration::from_millis(20);
const MANUAL_POLL: Duration = Duration::from_millis(20);
const MANUAL_RESTART: Duration = Duration::from_secs(1);
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Per-step delay while training: max(0, 3 − 0.3·speed) ms.
pub fn training_step_delay(speed: u32) -> Duration {
    Duration::from_secs_f64((3.0 - 0.3 * speed as f64).max(0.0) / 1000.0)
}

/// Gap between training episodes: max(1, 50 − 5·speed) ms.
pub fn episode_gap(speed: u32) -> Duration {
    Duration::from_millis(50u64.saturating_sub(5 * speed as u64).max(1))
}

/// Sleep for `d`, or just yield when it is zero.
async fn delay(d: Duration) {
    if d.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(d).await;
    }
}

/// Sender side of a running [`Sandbox`].
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SandboxHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).ok().context("Sandbox has shut down")
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.send(Command::SetMode { mode })
    }
}

pub struct Sandbox {
    agent: Agent,
    mode: Mode,
    paused: bool,
    speed: u32,
    pending_manual: Option<Action>,
    /// Bumped by every mode change and policy reset; a running episode
    /// started under an older epoch is abandoned.
    epoch: u64,
    shutdown: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SandboxEvent>,
}

impl Sandbox {
    pub fn new(agent: Agent, speed: u32) -> (Self, SandboxHandle, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox {
            agent,
            mode: Mode::Idle,
            paused: false,
            speed: speed.clamp(1, MAX_SPEED),
            pending_manual: None,
            epoch: 0,
            shutdown: false,
            commands: cmd_rx,
            events: evt_tx,
        };
        (sandbox, SandboxHandle { commands: cmd_tx }, evt_rx)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Drive the session until `Shutdown` or until every handle is dropped.
    /// Returns the agent so the caller can inspect or save it.
    pub async fn run(mut self) -> Agent {
        tracing::info!(
            arch = %self.agent.network().arch_string(),
            params = self.agent.network().n_params(),
            speed = self.speed,
            "Sandbox started"
        );

        while !self.shutdown {
            match self.mode {
                Mode::Idle => self.wait_for_command().await,
                Mode::Training => {
                    self.play_episode(Mode::Training).await;
                    if self.mode == Mode::Training && !self.shutdown {
                        delay(episode_gap(self.speed)).await;
                    }
                }
                Mode::Testing => {
                    if let Some(summary) = self.play_episode(Mode::Testing).await {
                        tracing::info!(steps = summary.steps, "Test complete");
                        self.set_mode(Mode::Idle);
                    }
                }
                Mode::Manual => self.manual_tick().await,
            }
        }

        tracing::info!(episodes = self.agent.episode(), "Sandbox stopped");
        self.agent
    }

    fn emit(&self, event: SandboxEvent) {
        // Observers are optional; a closed receiver is not an error.
        let _ = self.events.send(event);
    }

    fn reject(&self, reason: String) {
        tracing::debug!(mode = %self.mode, "{reason}");
        self.emit(SandboxEvent::Rejected { reason });
    }

    async fn wait_for_command(&mut self) {
        match self.commands.recv().await {
            Some(command) => self.apply(command),
            None => self.shutdown = true,
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    break;
                }
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::SetMode { mode } => self.request_mode(mode),
            Command::TogglePause => {
                if self.mode != Mode::Training {
                    return self.reject(format!("cannot pause in {} mode", self.mode));
                }
                self.paused = !self.paused;
                tracing::info!(paused = self.paused, "Training pause toggled");
                self.emit(SandboxEvent::Paused { paused: self.paused });
            }
            Command::ManualAction { action } => {
                if self.mode != Mode::Manual {
                    return self.reject(format!("manual action ignored in {} mode", self.mode));
                }
                self.pending_manual = Some(action);
            }
            Command::SetLearningRate { lr } => {
                if let Err(e) = config::validate_learning_rate(lr) {
                    return self.reject(e.to_string());
                }
                self.agent.set_learning_rate(lr);
                tracing::info!(lr, "Learning rate changed");
                self.emit(SandboxEvent::LearningRateChanged { lr });
            }
            Command::SetSpeed { speed } => {
                if !(1..=MAX_SPEED).contains(&speed) {
                    return self.reject(format!("speed must be in 1..={MAX_SPEED}, got {speed}"));
                }
                self.speed = speed;
            }
            Command::ResetPolicy => {
                self.set_mode(Mode::Idle);
                self.agent.reset_policy();
                self.epoch += 1;
                tracing::info!("Policy reset");
                self.emit(SandboxEvent::PolicyReset);
            }
            Command::Shutdown => self.shutdown = true,
        }
    }

    fn request_mode(&mut self, to: Mode) {
        let from = self.mode;
        if from == to {
            return;
        }
        let allowed = match to {
            Mode::Idle => true,
            Mode::Manual => from == Mode::Idle,
            Mode::Testing => true,
            // A test run is a single episode; let it finish.
            Mode::Training => from != Mode::Testing,
        };
        if allowed {
            self.set_mode(to);
        } else {
            self.reject(format!("cannot enter {to} mode from {from}"));
        }
    }

    fn set_mode(&mut self, to: Mode) {
        let from = self.mode;
        if from == to {
            return;
        }
        self.mode = to;
        self.epoch += 1;
        self.paused = false;
        self.pending_manual = None;
        if to == Mode::Manual {
            self.agent.begin_episode();
        }
        tracing::info!(%from, %to, "Mode changed");
        self.emit(SandboxEvent::ModeChanged { from, to });
    }

    fn step_delay(&self, kind: Mode) -> Duration {
        match kind {
            Mode::Training => training_step_delay(self.speed),
            _ => TEST_STEP_DELAY,
        }
    }

    /// Play one training or testing episode, yielding between steps.
    ///
    /// Returns `None` when the episode was abandoned; it is then neither
    /// trained on nor counted.
    async fn play_episode(&mut self, kind: Mode) -> Option<EpisodeSummary> {
        let epoch = self.epoch;
        let (source, train) = match kind {
            Mode::Training => (StepSource::Explore, true),
            _ => (StepSource::Evaluate, false),
        };
        self.agent.begin_episode();

        loop {
            self.drain_commands();
            if self.shutdown || self.epoch != epoch {
                tracing::debug!(episode = self.agent.episode(), "Episode abandoned");
                return None;
            }
            if self.paused {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }

            let report = self.agent.step(source);
            let done = report.done;
            self.emit(SandboxEvent::Step(report));
            if done {
                break;
            }
            delay(self.step_delay(kind)).await;
        }

        let summary = self.agent.finish_episode(train);
        self.emit(SandboxEvent::EpisodeFinished(summary.clone()));
        Some(summary)
    }

    async fn manual_tick(&mut self) {
        self.drain_commands();
        if self.shutdown || self.mode != Mode::Manual {
            return;
        }
        if let Some(action) = self.pending_manual.take() {
            let report = self.agent.step(StepSource::Manual(action));
            let (done, steps) = (report.done, report.step);
            self.emit(SandboxEvent::Step(report));
            if done {
                tracing::info!(steps, "Manual episode ended");
                tokio::time::sleep(MANUAL_RESTART).await;
                self.agent.begin_episode();
            }
        }
        tokio::time::sleep(MANUAL_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartpole_protocol::Hyperparameters;
    use tokio::task::JoinHandle;

    fn start(speed: u32) -> (JoinHandle<Agent>, SandboxHandle, mpsc::UnboundedReceiver<SandboxEvent>) {
        let agent = Agent::new(Hyperparameters::default(), 42);
        let (sandbox, handle, events) = Sandbox::new(agent, speed);
        (tokio::spawn(sandbox.run()), handle, events)
    }

    /// Receive events until one matches, returning everything seen.
    async fn until(
        events: &mut mpsc::UnboundedReceiver<SandboxEvent>,
        pred: impl Fn(&SandboxEvent) -> bool,
    ) -> Vec<SandboxEvent> {
        let mut seen = Vec::new();
        while let Some(e) = events.recv().await {
            let hit = pred(&e);
            seen.push(e);
            if hit {
                return seen;
            }
        }
        panic!("event stream closed; saw {seen:?}");
    }

    fn changed_to(to: Mode) -> impl Fn(&SandboxEvent) -> bool {
        move |e| matches!(e, SandboxEvent::ModeChanged { to: t, .. } if *t == to)
    }

    #[test]
    fn test_delays() {
        assert!((training_step_delay(1).as_secs_f64() - 0.0027).abs() < 1e-9);
        assert!(training_step_delay(10).is_zero());
        assert_eq!(episode_gap(1), Duration::from_millis(45));
        assert_eq!(episode_gap(10), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_testing_runs_one_episode_then_idles() {
        let (task, handle, mut events) = start(5);
        handle.set_mode(Mode::Testing).unwrap();

        let seen = until(&mut events, changed_to(Mode::Idle)).await;
        let finished: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                SandboxEvent::EpisodeFinished(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 1);
        assert!(finished[0].diagnostics.is_none());
        let steps = seen.iter().filter(|e| matches!(e, SandboxEvent::Step(_))).count();
        assert_eq!(steps, finished[0].steps);

        handle.send(Command::Shutdown).unwrap();
        let agent = task.await.unwrap();
        assert_eq!(agent.episode(), 1);
        assert_eq!(agent.exploration(), 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_only_from_idle() {
        let (task, handle, mut events) = start(10);
        handle.set_mode(Mode::Training).unwrap();
        handle.set_mode(Mode::Manual).unwrap();

        let seen = until(&mut events, |e| matches!(e, SandboxEvent::Rejected { .. })).await;
        assert!(seen.contains(&SandboxEvent::ModeChanged { from: Mode::Idle, to: Mode::Training }));

        // Back in Idle, manual is allowed.
        handle.set_mode(Mode::Idle).unwrap();
        handle.set_mode(Mode::Manual).unwrap();
        until(&mut events, changed_to(Mode::Manual)).await;

        handle.send(Command::Shutdown).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_episode_is_not_trained() {
        let (task, handle, mut events) = start(1);
        handle.set_mode(Mode::Training).unwrap();
        until(&mut events, |e| matches!(e, SandboxEvent::Step(_))).await;
        handle.set_mode(Mode::Idle).unwrap();

        let seen = until(&mut events, changed_to(Mode::Idle)).await;
        assert!(!seen.iter().any(|e| matches!(e, SandboxEvent::EpisodeFinished(_))));

        handle.send(Command::Shutdown).unwrap();
        let agent = task.await.unwrap();
        assert_eq!(agent.episode(), 0);
        assert!(agent.last_diagnostics().is_none());
        assert_eq!(agent.exploration(), 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_training_trains_and_pause() {
        let (task, handle, mut events) = start(10);
        handle.set_mode(Mode::Training).unwrap();
        let seen = until(&mut events, |e| matches!(e, SandboxEvent::EpisodeFinished(_))).await;
        match seen.last() {
            Some(SandboxEvent::EpisodeFinished(s)) => assert!(s.diagnostics.is_some()),
            other => panic!("unexpected {other:?}"),
        }

        handle.send(Command::TogglePause).unwrap();
        until(&mut events, |e| *e == SandboxEvent::Paused { paused: true }).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        while let Ok(e) = events.try_recv() {
            assert!(!matches!(e, SandboxEvent::Step(_)), "stepped while paused: {e:?}");
        }

        handle.send(Command::TogglePause).unwrap();
        let seen = until(&mut events, |e| matches!(e, SandboxEvent::Step(_))).await;
        assert!(seen.contains(&SandboxEvent::Paused { paused: false }));
        handle.send(Command::Shutdown).unwrap();
        let agent = task.await.unwrap();
        assert!(agent.episode() >= 1);
        assert!(agent.exploration() < 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_actions_and_rejections() {
        let (task, handle, mut events) = start(5);
        handle.send(Command::ManualAction { action: Action::Left }).unwrap();
        until(&mut events, |e| matches!(e, SandboxEvent::Rejected { .. })).await;

        handle.set_mode(Mode::Manual).unwrap();
        handle.send(Command::ManualAction { action: Action::Right }).unwrap();
        let seen = until(&mut events, |e| matches!(e, SandboxEvent::Step(_))).await;
        match seen.last() {
            Some(SandboxEvent::Step(r)) => {
                assert_eq!(r.action, Action::Right);
                assert_eq!(r.step, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Testing may preempt manual control.
        handle.set_mode(Mode::Testing).unwrap();
        until(&mut events, changed_to(Mode::Testing)).await;
        handle.send(Command::Shutdown).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_episode_restarts_after_delay() {
        let (task, handle, mut events) = start(5);
        handle.set_mode(Mode::Manual).unwrap();
        until(&mut events, changed_to(Mode::Manual)).await;

        let mut last = None;
        for _ in 0..500 {
            handle.send(Command::ManualAction { action: Action::Right }).unwrap();
            let seen = until(&mut events, |e| matches!(e, SandboxEvent::Step(_))).await;
            match seen.last() {
                Some(SandboxEvent::Step(r)) if r.done => {
                    last = Some(r.step);
                    break;
                }
                _ => {}
            }
        }
        let steps = last.expect("pushing right ends the episode");
        assert!(steps > 1);

        let ended = tokio::time::Instant::now();
        handle.send(Command::ManualAction { action: Action::Right }).unwrap();
        let seen = until(&mut events, |e| matches!(e, SandboxEvent::Step(_))).await;
        match seen.last() {
            Some(SandboxEvent::Step(r)) => {
                assert_eq!(r.step, 1);
                assert!(!r.done);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ended.elapsed() >= MANUAL_RESTART);

        handle.send(Command::Shutdown).unwrap();
        let agent = task.await.unwrap();
        assert_eq!(agent.episode(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_learning_rate_and_reset() {
        let (task, handle, mut events) = start(5);
        handle.send(Command::SetLearningRate { lr: 0.5 }).unwrap();
        until(&mut events, |e| matches!(e, SandboxEvent::Rejected { .. })).await;
        handle.send(Command::SetLearningRate { lr: 0.005 }).unwrap();
        until(&mut events, |e| *e == SandboxEvent::LearningRateChanged { lr: 0.005 }).await;
        handle.send(Command::SetSpeed { speed: 11 }).unwrap();
        until(&mut events, |e| matches!(e, SandboxEvent::Rejected { .. })).await;

        handle.set_mode(Mode::Training).unwrap();
        until(&mut events, |e| matches!(e, SandboxEvent::EpisodeFinished(_))).await;
        handle.send(Command::ResetPolicy).unwrap();
        let seen = until(&mut events, |e| *e == SandboxEvent::PolicyReset).await;
        assert!(seen.contains(&SandboxEvent::ModeChanged { from: Mode::Training, to: Mode::Idle }));

        handle.send(Command::Shutdown).unwrap();
        let agent = task.await.unwrap();
        assert_eq!(agent.episode(), 0);
        assert_eq!(agent.trainer().learning_rate(), 0.005);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_session() {
        let (task, handle, _events) = start(5);
        drop(handle);
        let agent = task.await.unwrap();
        assert_eq!(agent.episode(), 0);
    }
}
