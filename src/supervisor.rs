use crate::types::{ConnectionStatus, StatusChange};
use crossbeam_channel::{Receiver, Sender};

/// No-data ticks before liveness is re-evaluated (about 1 s at 25 ms).
pub const RETRY_THRESHOLD: u32 = 100;

/// Capacity of the status-change queue.
pub const STATUS_CHANNEL_CAPACITY: usize = 32;

/// The data-plane operations the supervisor drives every tick.
pub trait DataLink {
    /// Run periodic work and drain pending packets.
    fn tick(&mut self) -> usize;

    /// Return and clear the "new data since last check" flag.
    fn take_new_data(&mut self) -> bool;

    /// Whether packets arrived recently enough.
    fn is_connection_alive(&mut self) -> bool;
}

/// Turns per-tick link observations into a smoothed [`ConnectionStatus`].
///
/// Every genuine transition is queued exactly once on the status channel.
pub struct ConnectionSupervisor {
    status: ConnectionStatus,
    retries: u32,
    sender: Sender<StatusChange>,
    receiver: Receiver<StatusChange>,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(STATUS_CHANNEL_CAPACITY);
        Self {
            status: ConnectionStatus::NotStarted,
            retries: 0,
            sender,
            receiver,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Receiving end of the status-change queue.
    ///
    /// Clones share one queue: each change is delivered to one of them.
    pub fn subscribe(&self) -> Receiver<StatusChange> {
        self.receiver.clone()
    }

    /// Set the status, queuing a notification if it changed.
    pub fn transition(&mut self, status: ConnectionStatus) -> Option<StatusChange> {
        if status == self.status {
            return None;
        }

        let change = StatusChange {
            previous: self.status,
            current: status,
        };
        self.status = status;
        log::info!("Status {:?} -> {:?}", change.previous, change.current);

        if let Err(e) = self.sender.try_send(change) {
            match e {
                crossbeam_channel::TrySendError::Full(_) => {
                    log::warn!("Status channel full, dropping {:?}", change);
                }
                crossbeam_channel::TrySendError::Disconnected(_) => {}
            }
        }
        Some(change)
    }

    /// Start a fresh retry window.
    pub fn reset_retries(&mut self) {
        self.retries = 0;
    }

    /// Tick the link once and update the status.
    pub fn update<L: DataLink>(&mut self, link: &mut L) -> ConnectionStatus {
        link.tick();
        self.observe(link);
        self.status
    }

    /// Evaluate the link without ticking it.
    pub fn observe<L: DataLink>(&mut self, link: &mut L) -> Option<StatusChange> {
        // Ticks with data do not count towards the retry window.
        if link.take_new_data() {
            return self.transition(ConnectionStatus::Ok);
        }

        self.retries += 1;
        if self.retries < RETRY_THRESHOLD {
            return None;
        }
        self.retries = 0;

        // Alive without fresh payloads is acceptable.
        let next = if link.is_connection_alive() {
            ConnectionStatus::Ok
        } else {
            ConnectionStatus::ConnectionDead
        };
        self.transition(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeLink {
        ticks: usize,
        new_data: bool,
        alive: bool,
        liveness_checks: usize,
    }

    impl DataLink for FakeLink {
        fn tick(&mut self) -> usize {
            self.ticks += 1;
            0
        }

        fn take_new_data(&mut self) -> bool {
            std::mem::replace(&mut self.new_data, false)
        }

        fn is_connection_alive(&mut self) -> bool {
            self.liveness_checks += 1;
            self.alive
        }
    }

    fn supervisor_at(status: ConnectionStatus) -> (ConnectionSupervisor, Receiver<StatusChange>) {
        let mut sup = ConnectionSupervisor::new();
        let rx = sup.subscribe();
        sup.transition(status);
        while rx.try_recv().is_ok() {}
        (sup, rx)
    }

    #[test]
    fn test_dead_after_threshold_when_not_alive() {
        let (mut sup, rx) = supervisor_at(ConnectionStatus::Ok);
        let mut link = FakeLink::default();

        for _ in 0..RETRY_THRESHOLD - 1 {
            assert_eq!(sup.update(&mut link), ConnectionStatus::Ok);
        }
        assert_eq!(link.liveness_checks, 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(sup.update(&mut link), ConnectionStatus::ConnectionDead);
        assert_eq!(link.ticks, RETRY_THRESHOLD as usize);
        assert_eq!(
            rx.try_recv().unwrap(),
            StatusChange {
                previous: ConnectionStatus::Ok,
                current: ConnectionStatus::ConnectionDead,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stays_ok_when_alive_without_data() {
        let (mut sup, rx) = supervisor_at(ConnectionStatus::Ok);
        let mut link = FakeLink {
            alive: true,
            ..FakeLink::default()
        };

        for _ in 0..RETRY_THRESHOLD * 3 {
            assert_eq!(sup.update(&mut link), ConnectionStatus::Ok);
        }
        assert_eq!(link.liveness_checks, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_new_data_restores_ok_once() {
        let (mut sup, rx) = supervisor_at(ConnectionStatus::ConnectionDead);
        let mut link = FakeLink::default();

        for _ in 0..5 {
            link.new_data = true;
            assert_eq!(sup.update(&mut link), ConnectionStatus::Ok);
        }
        assert_eq!(rx.try_recv().unwrap().message(), "STATUS OK");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_notified_once_across_windows() {
        let (mut sup, rx) = supervisor_at(ConnectionStatus::Ok);
        let mut link = FakeLink::default();

        for _ in 0..RETRY_THRESHOLD * 4 {
            sup.update(&mut link);
        }
        assert_eq!(sup.status(), ConnectionStatus::ConnectionDead);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_data_ticks_do_not_count() {
        let (mut sup, _rx) = supervisor_at(ConnectionStatus::Ok);
        let mut link = FakeLink {
            alive: true,
            ..FakeLink::default()
        };

        for _ in 0..RETRY_THRESHOLD - 1 {
            sup.update(&mut link);
        }
        link.new_data = true;
        sup.update(&mut link);
        assert_eq!(link.liveness_checks, 0);

        sup.update(&mut link);
        assert_eq!(link.liveness_checks, 1);
        assert_eq!(sup.status(), ConnectionStatus::Ok);
    }

    #[test]
    fn test_reset_retries_restarts_window() {
        let (mut sup, _rx) = supervisor_at(ConnectionStatus::Ok);
        let mut link = FakeLink::default();

        for _ in 0..RETRY_THRESHOLD - 1 {
            sup.update(&mut link);
        }
        sup.reset_retries();
        sup.update(&mut link);
        assert_eq!(link.liveness_checks, 0);
        assert_eq!(sup.status(), ConnectionStatus::Ok);
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let mut sup = ConnectionSupervisor::new();
        for i in 0..STATUS_CHANNEL_CAPACITY * 2 {
            let status = if i % 2 == 0 {
                ConnectionStatus::Ok
            } else {
                ConnectionStatus::ConnectionDead
            };
            assert!(sup.transition(status).is_some());
        }
        assert_eq!(sup.subscribe().try_iter().count(), STATUS_CHANNEL_CAPACITY);
    }
}
