use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use crate::command::CommandRunner;
use crate::desktop::DndToggle;
use crate::messages::{LoopPhase, TickOutcome};
use crate::pipewire::PipeWire;
use crate::presence::{Broker, PresencePublisher};

/// The poll-detect-publish loop. Ticks run one at a time, so the publisher
/// and its last known state need no locking.
pub struct Manager<R, B, D> {
    node_name: String,
    pipewire: PipeWire<R>,
    publisher: PresencePublisher<B>,
    dnd: D,
    interval: Duration,
    disconnect_grace: Duration,
    phase: LoopPhase,
}

impl<R, B, D> Manager<R, B, D>
where
    R: CommandRunner,
    B: Broker,
    D: DndToggle,
{
    pub fn new(
        node_name: impl Into<String>,
        pipewire: PipeWire<R>,
        publisher: PresencePublisher<B>,
        dnd: D,
        interval: Duration,
        disconnect_grace: Duration,
    ) -> Self {
        Manager {
            node_name: node_name.into(),
            pipewire,
            publisher,
            dnd,
            interval,
            disconnect_grace,
            phase: LoopPhase::Idle,
        }
    }

    fn enter(&mut self, phase: LoopPhase) {
        if self.phase != phase {
            debug!("{:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// One poll. Every failure is logged and contained here; the only state
    /// carried to the next tick is the publisher's acknowledged state and
    /// whether its last send went unconfirmed.
    pub async fn tick(&mut self) -> TickOutcome {
        self.enter(LoopPhase::Probing);

        let status = match self.pipewire.status_of(&self.node_name).await {
            Ok(status) => status,
            Err(err) => {
                error!("Failed to find PipeWire device {:?}: {}", self.node_name, err);
                self.enter(LoopPhase::Idle);
                return TickOutcome::DeviceNotFound;
            }
        };

        let meeting_found = status.meeting_found();
        let current = self.publisher.last_state();
        if !self.publisher.needs_publish(meeting_found) {
            debug!("Meeting status unchanged ({}), no action taken", current);
            self.enter(LoopPhase::Idle);
            return TickOutcome::Unchanged;
        }

        self.enter(LoopPhase::Transitioning);
        if meeting_found == current {
            // An earlier send failed and may still land with the other value.
            info!(
                "Republishing meeting state {} for {:?} after a failed publish",
                meeting_found, self.node_name
            );
        } else {
            info!(
                "Meeting status changed for {:?}: {} -> {}",
                self.node_name, current, meeting_found
            );
        }

        // The desktop follows what was detected, whatever the broker did.
        let published = match self.publisher.publish(meeting_found).await {
            Ok(_) => true,
            Err(err) => {
                error!("Failed to publish meeting state {}: {}", meeting_found, err);
                false
            }
        };

        let toggled = match self.dnd.set_dnd(meeting_found).await {
            Ok(()) => {
                info!("GNOME Shell DND status set to {}", meeting_found);
                true
            }
            Err(err) => {
                error!("Failed to set DND for meeting state {}: {}", meeting_found, err);
                false
            }
        };

        self.enter(LoopPhase::Idle);
        TickOutcome::Transitioned {
            meeting_found,
            published,
            toggled,
        }
    }

    /// Ticks every interval until `shutdown` fires, then disconnects from the
    /// broker. A tick in progress always finishes first.
    pub async fn run_loop(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut listening = true;

        info!("Waiting for PipeWire node {:?}", self.node_name);

        loop {
            tokio::select! {
                biased;
                res = &mut shutdown, if listening => {
                    if res.is_ok() {
                        break;
                    }
                    warn!("Shutdown listener went away, signals will not stop the loop");
                    listening = false;
                }
                _ = ticker.tick() => {
                    debug!("Ticker ticked, checking PipeWire device status");
                    if let TickOutcome::Transitioned {
                        meeting_found,
                        published,
                        toggled,
                    } = self.tick().await
                    {
                        if !(published && toggled) {
                            warn!(
                                "Transition to meeting state {} incomplete (published: {}, DND set: {})",
                                meeting_found, published, toggled
                            );
                        }
                    }
                }
            }
        }

        self.enter(LoopPhase::Draining);
        info!("Disconnecting from MQTT broker");
        self.publisher.disconnect(self.disconnect_grace).await;
        info!("Stopped gracefully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::config::PipewireConfig;
    use crate::desktop::testing::RecordingDnd;
    use crate::presence::testing::FakeBroker;

    const TOPIC: &str = "office/meeting_active/state";
    const LISTING: &str = "\tid 42, type PipeWire:Interface:Node/3\n\t\tnode-name=\"office-mic\"\n";
    const RUNNING: &str = "\tid: 42\n*\tstate: \"running\"\n";
    const IDLE: &str = "\tid: 42\n*\tstate: \"idle\"\n";

    struct Harness {
        runner: ScriptedRunner,
        broker: FakeBroker,
        dnd: RecordingDnd,
        manager: Manager<ScriptedRunner, FakeBroker, RecordingDnd>,
    }

    fn harness() -> Harness {
        let runner = ScriptedRunner::default();
        let broker = FakeBroker::default();
        let dnd = RecordingDnd::default();
        let pipewire = PipeWire::new(
            runner.clone(),
            &PipewireConfig {
                binary: "pw-cli".to_string(),
                cache_device_id: false,
            },
        );
        let manager = Manager::new(
            "office-mic",
            pipewire,
            PresencePublisher::new(broker.clone(), TOPIC),
            dnd.clone(),
            Duration::from_secs(1),
            Duration::from_millis(250),
        );
        Harness {
            runner,
            broker,
            dnd,
            manager,
        }
    }

    #[tokio::test]
    async fn test_running_device_turns_meeting_on() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", RUNNING);

        let outcome = h.manager.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Transitioned {
                meeting_found: true,
                published: true,
                toggled: true,
            }
        );
        assert_eq!(h.broker.payloads(), vec!["ON"]);
        assert_eq!(h.dnd.calls(), vec![true]);
        assert_eq!(h.manager.phase, LoopPhase::Idle);
    }

    #[tokio::test]
    async fn test_missing_node_is_a_noop() {
        let mut h = harness();
        h.runner.reply(
            "pw-cli ls",
            "\tid 7, type PipeWire:Interface:Node/3\n\t\tnode.name = \"speakers\"\n",
        );

        assert_eq!(h.manager.tick().await, TickOutcome::DeviceNotFound);
        assert!(h.broker.payloads().is_empty());
        assert!(h.dnd.calls().is_empty());
        assert!(!h.manager.publisher.last_state());
        assert!(!h.runner.calls().iter().any(|c| c.starts_with("pw-cli i")));
    }

    #[tokio::test]
    async fn test_resolve_failure_does_not_end_meeting() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", RUNNING);
        h.manager.tick().await;

        h.runner.fail("pw-cli ls", 1);
        assert_eq!(h.manager.tick().await, TickOutcome::DeviceNotFound);
        assert!(h.manager.publisher.last_state());
        assert_eq!(h.broker.payloads(), vec!["ON"]);
    }

    #[tokio::test]
    async fn test_unchanged_state_does_nothing() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", IDLE);

        assert_eq!(h.manager.tick().await, TickOutcome::Unchanged);
        assert!(h.broker.payloads().is_empty());
        assert!(h.dnd.calls().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_reads_as_inactive() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", RUNNING);
        h.manager.tick().await;

        h.runner.fail("pw-cli i 42", 1);
        assert_eq!(
            h.manager.tick().await,
            TickOutcome::Transitioned {
                meeting_found: false,
                published: true,
                toggled: true,
            }
        );
        assert_eq!(h.broker.payloads(), vec!["ON", "OFF"]);
        assert_eq!(h.dnd.calls(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_state_changes_once_per_transition() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        let sequence = [false, true, true, true, false, false, true, false];

        for running in sequence {
            h.runner.reply("pw-cli i 42", if running { RUNNING } else { IDLE });
            h.manager.tick().await;
        }

        assert_eq!(h.broker.payloads(), vec!["ON", "OFF", "ON", "OFF"]);
        assert_eq!(h.dnd.calls(), vec![true, false, true, false]);
    }

    #[tokio::test]
    async fn test_publish_failure_still_toggles_and_retries() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", RUNNING);
        h.broker.set_failing(true);

        assert_eq!(
            h.manager.tick().await,
            TickOutcome::Transitioned {
                meeting_found: true,
                published: false,
                toggled: true,
            }
        );
        assert!(!h.manager.publisher.last_state());
        assert_eq!(h.dnd.calls(), vec![true]);

        h.broker.set_failing(false);
        assert_eq!(
            h.manager.tick().await,
            TickOutcome::Transitioned {
                meeting_found: true,
                published: true,
                toggled: true,
            }
        );
        assert_eq!(h.broker.payloads(), vec!["ON"]);
        assert!(h.manager.publisher.last_state());
    }

    #[tokio::test]
    async fn test_revert_after_unacked_publish_is_resent() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", RUNNING);
        h.broker.set_acks_lost(true);

        assert_eq!(
            h.manager.tick().await,
            TickOutcome::Transitioned {
                meeting_found: true,
                published: false,
                toggled: true,
            }
        );
        assert!(!h.manager.publisher.last_state());

        // Meeting ends before the broker comes back; the late "ON" is retained.
        h.broker.set_acks_lost(false);
        h.runner.reply("pw-cli i 42", IDLE);
        assert_eq!(
            h.manager.tick().await,
            TickOutcome::Transitioned {
                meeting_found: false,
                published: true,
                toggled: true,
            }
        );
        assert_eq!(h.broker.payloads(), vec!["ON", "OFF"]);
        assert_eq!(h.dnd.calls(), vec![true, false]);

        assert_eq!(h.manager.tick().await, TickOutcome::Unchanged);
        assert_eq!(h.broker.payloads(), vec!["ON", "OFF"]);
    }

    #[tokio::test]
    async fn test_toggle_failure_keeps_published_state() {
        let mut h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", RUNNING);
        *h.dnd.failing.lock().unwrap() = true;

        assert_eq!(
            h.manager.tick().await,
            TickOutcome::Transitioned {
                meeting_found: true,
                published: true,
                toggled: false,
            }
        );
        assert!(h.manager.publisher.last_state());
        assert_eq!(h.manager.tick().await, TickOutcome::Unchanged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_idle_disconnects() {
        let h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", RUNNING);
        let (tx, rx) = oneshot::channel();
        let broker = h.broker.clone();
        let runner = h.runner.clone();

        let stop = async {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            tx.send(()).unwrap();
        };
        tokio::join!(h.manager.run_loop(rx), stop);

        let ticks = runner.calls().iter().filter(|c| *c == "pw-cli ls").count();
        assert_eq!(ticks, 2);
        let log = broker.log.lock().unwrap();
        assert_eq!(log.disconnected_with, Some(Duration::from_millis(250)));
        assert_eq!(log.sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_listener_keeps_ticking() {
        let h = harness();
        h.runner.reply("pw-cli ls", LISTING);
        h.runner.reply("pw-cli i 42", IDLE);
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let runner = h.runner.clone();

        let run = tokio::time::timeout(Duration::from_millis(3_500), h.manager.run_loop(rx));
        assert!(run.await.is_err());

        let ticks = runner.calls().iter().filter(|c| *c == "pw-cli ls").count();
        assert_eq!(ticks, 3);
    }
}
