//! Named cancellable timers.
//!
//! A node runs three logical timers: the leader timer (follower waiting
//! for leader traffic), the election timer (candidate waiting for a
//! verdict) and one heartbeat timer per peer. Each is a small abortable
//! task parked on a sleep; firing delivers a [`TimerEvent`] into the
//! node's handler queue so timer reactions are serialized with RPCs and
//! submissions.
//!
//! Re-arming cancels the previous instance first, so at most one instance
//! of each timer exists. Cancelling an already-expired timer is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use gavel_core::NodeId;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TimingConfig;

/// A timer firing, delivered into the node's handler queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The leader timer expired: no leader traffic arrived in time.
    Leader,
    /// The election timer expired: the current election reached no verdict.
    Election,
    /// The heartbeat timer for one peer expired.
    Heartbeat(NodeId),
}

/// The per-node timer table.
pub struct TimerService {
    timing: TimingConfig,
    peers: Vec<NodeId>,
    events: mpsc::Sender<TimerEvent>,
    leader: Option<JoinHandle<()>>,
    election: Option<JoinHandle<()>>,
    heartbeats: HashMap<NodeId, JoinHandle<()>>,
}

impl TimerService {
    /// Creates a timer table delivering events into `events`.
    #[must_use]
    pub fn new(timing: TimingConfig, peers: Vec<NodeId>, events: mpsc::Sender<TimerEvent>) -> Self {
        Self {
            timing,
            peers,
            events,
            leader: None,
            election: None,
            heartbeats: HashMap::new(),
        }
    }

    /// Arms the leader timer with a fresh random interval.
    pub fn arm_leader(&mut self) {
        let interval = random_between(self.timing.leader_timeout_min, self.timing.leader_timeout_max);
        abort(self.leader.take());
        self.leader = Some(spawn_timer(interval, TimerEvent::Leader, self.events.clone()));
    }

    /// Cancels the leader timer.
    pub fn cancel_leader(&mut self) {
        abort(self.leader.take());
    }

    /// Arms the election timer with a fresh random interval.
    pub fn arm_election(&mut self) {
        let interval = random_between(
            self.timing.election_timeout_min,
            self.timing.election_timeout_max,
        );
        abort(self.election.take());
        self.election = Some(spawn_timer(interval, TimerEvent::Election, self.events.clone()));
    }

    /// Cancels the election timer.
    pub fn cancel_election(&mut self) {
        abort(self.election.take());
    }

    /// Cancels and re-arms the heartbeat timer for one peer.
    pub fn arm_heartbeat(&mut self, peer: NodeId) {
        abort(self.heartbeats.remove(&peer));
        self.heartbeats.insert(
            peer,
            spawn_timer(
                self.timing.heartbeat_interval,
                TimerEvent::Heartbeat(peer),
                self.events.clone(),
            ),
        );
    }

    /// Cancels and re-arms the heartbeat timers for every peer.
    pub fn arm_all_heartbeats(&mut self) {
        for peer in self.peers.clone() {
            self.arm_heartbeat(peer);
        }
    }

    /// Cancels every heartbeat timer.
    pub fn cancel_heartbeats(&mut self) {
        for (_, handle) in self.heartbeats.drain() {
            handle.abort();
        }
    }

    /// Cancels everything. Called on shutdown.
    pub fn cancel_all(&mut self) {
        self.cancel_leader();
        self.cancel_election();
        self.cancel_heartbeats();
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn abort(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

fn spawn_timer(
    interval: Duration,
    event: TimerEvent,
    events: mpsc::Sender<TimerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        let _ = events.send(event).await;
    })
}

fn random_between(min: Duration, max: Duration) -> Duration {
    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_timing() -> TimingConfig {
        TimingConfig {
            leader_timeout_min: Duration::from_millis(5),
            leader_timeout_max: Duration::from_millis(10),
            election_timeout_min: Duration::from_millis(5),
            election_timeout_max: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(5),
            min_election_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_leader_timer_fires() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut timers = TimerService::new(quick_timing(), vec![], tx);

        timers.arm_leader();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timer should fire");
        assert_eq!(event, Some(TimerEvent::Leader));
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut timers = TimerService::new(quick_timing(), vec![], tx);

        timers.arm_leader();
        timers.cancel_leader();
        // Cancelling again (already gone) is a no-op.
        timers.cancel_leader();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rearm_keeps_single_instance() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut timers = TimerService::new(quick_timing(), vec![], tx);

        for _ in 0..5 {
            timers.arm_election();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 1, "re-arming must replace the previous instance");
    }

    #[tokio::test]
    async fn test_heartbeat_cancel_is_per_peer() {
        let peers = vec![NodeId::new(2), NodeId::new(3)];
        let (tx, mut rx) = mpsc::channel(16);
        let mut timers = TimerService::new(quick_timing(), peers, tx);

        timers.arm_all_heartbeats();
        timers.arm_heartbeat(NodeId::new(2)); // re-arm only peer 2

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut fired = Vec::new();
        while let Ok(event) = rx.try_recv() {
            fired.push(event);
        }
        assert!(fired.contains(&TimerEvent::Heartbeat(NodeId::new(2))));
        assert!(fired.contains(&TimerEvent::Heartbeat(NodeId::new(3))));
        assert_eq!(fired.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let peers = vec![NodeId::new(2)];
        let (tx, mut rx) = mpsc::channel(16);
        let mut timers = TimerService::new(quick_timing(), peers, tx);

        timers.arm_leader();
        timers.arm_election();
        timers.arm_all_heartbeats();
        timers.cancel_all();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
