//! Home coordinator of a chaser.
//!
//! Tracks which of the two workers is at home and decides who leaves next,
//! so that exactly one request is parked at the reverse proxy whenever
//! neither side has data to send.

use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// One of the two workers of a chaser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub(crate) enum WorkerId {
    #[display("alpha")]
    Alpha,
    #[display("beta")]
    Beta,
}

impl WorkerId {
    pub(crate) fn other(self) -> Self {
        match self {
            WorkerId::Alpha => WorkerId::Beta,
            WorkerId::Beta => WorkerId::Alpha,
        }
    }
}

/// Snapshot of who is home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Home {
    pub(crate) alpha_home: bool,
    pub(crate) beta_home: bool,
    last_arrival: Option<WorkerId>,
}

impl Default for Home {
    fn default() -> Self {
        Self {
            alpha_home: true,
            beta_home: true,
            last_arrival: None,
        }
    }
}

impl Home {
    pub(crate) fn is_home(&self, worker: WorkerId) -> bool {
        match worker {
            WorkerId::Alpha => self.alpha_home,
            WorkerId::Beta => self.beta_home,
        }
    }

    fn set_home(&mut self, worker: WorkerId, home: bool) {
        match worker {
            WorkerId::Alpha => self.alpha_home = home,
            WorkerId::Beta => self.beta_home = home,
        }
    }

    /// The cached go-now flag a worker checks before waiting.
    ///
    /// Only alpha ever goes on its own, and only while both are home and it
    /// was not the one that just came back.
    pub(crate) fn go_now(&self, worker: WorkerId) -> bool {
        worker == WorkerId::Alpha && self.may_leave(worker)
    }

    /// Whether a go signal sent to `worker` is still current.
    ///
    /// The worker that arrived last stays home and becomes the next to leave.
    pub(crate) fn may_leave(&self, worker: WorkerId) -> bool {
        self.alpha_home && self.beta_home && self.last_arrival != Some(worker)
    }

    pub(crate) fn depart(&mut self, worker: WorkerId) {
        self.set_home(worker, false);
    }

    /// Records an arrival and returns the worker that must leave now.
    pub(crate) fn arrive(&mut self, worker: WorkerId) -> Option<WorkerId> {
        self.set_home(worker, true);
        self.last_arrival = Some(worker);
        let other = worker.other();
        self.is_home(other).then_some(other)
    }
}

/// Messages from the workers to the coordinator.
#[derive(Debug)]
pub(crate) enum HomeEvent {
    Departs {
        worker: WorkerId,
        sent: usize,
    },
    Arrives {
        worker: WorkerId,
        received: usize,
        rtt: Duration,
    },
}

/// Per-worker channels handed out by [`HomeCoordinator::new`].
#[derive(Debug)]
pub(crate) struct HomePorts {
    pub(crate) events: mpsc::Sender<HomeEvent>,
    pub(crate) home: watch::Receiver<Home>,
    pub(crate) tell: mpsc::Receiver<()>,
}

#[derive(Debug)]
pub(crate) struct HomeCoordinator {
    state: Home,
    events: mpsc::Receiver<HomeEvent>,
    home: watch::Sender<Home>,
    tell_alpha: mpsc::Sender<()>,
    tell_beta: mpsc::Sender<()>,
    cancel: CancellationToken,
    inactive_shutdown: Duration,
    last_use: Instant,
    srtt: Option<Duration>,
}

impl HomeCoordinator {
    /// Creates the coordinator and the ports for alpha and beta.
    pub(crate) fn new(
        cancel: CancellationToken,
        inactive_shutdown: Duration,
    ) -> (Self, HomePorts, HomePorts) {
        let (events_tx, events) = mpsc::channel(8);
        let (home, home_rx) = watch::channel(Home::default());
        let (tell_alpha, tell_alpha_rx) = mpsc::channel(1);
        let (tell_beta, tell_beta_rx) = mpsc::channel(1);
        let alpha = HomePorts {
            events: events_tx.clone(),
            home: home_rx.clone(),
            tell: tell_alpha_rx,
        };
        let beta = HomePorts {
            events: events_tx,
            home: home_rx,
            tell: tell_beta_rx,
        };
        let this = Self {
            state: Home::default(),
            events,
            home,
            tell_alpha,
            tell_beta,
            cancel,
            inactive_shutdown,
            last_use: Instant::now(),
            srtt: None,
        };
        (this, alpha, beta)
    }

    /// Runs until the chaser is cancelled, both workers are gone, or the
    /// tunnel went idle.
    pub(crate) async fn run(mut self) {
        loop {
            let idle_deadline = self.last_use + self.inactive_shutdown;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sleep_until(idle_deadline) => {
                    info!(idle = ?self.inactive_shutdown, "tunnel idle, shutting down");
                    self.cancel.cancel();
                    break;
                }
            }
        }
        debug!(srtt = ?self.srtt, "home coordinator finished");
    }

    fn handle(&mut self, event: HomeEvent) {
        let leave = match event {
            HomeEvent::Departs { worker, sent } => {
                if sent > 0 {
                    self.last_use = Instant::now();
                }
                trace!(%worker, sent, "departs");
                self.state.depart(worker);
                None
            }
            HomeEvent::Arrives {
                worker,
                received,
                rtt,
            } => {
                if received > 0 {
                    self.last_use = Instant::now();
                }
                trace!(%worker, received, ?rtt, "arrives");
                self.observe_rtt(rtt);
                self.state.arrive(worker)
            }
        };
        // Publish before signalling so the told worker sees the new state.
        self.home.send_replace(self.state);
        if let Some(leave) = leave {
            let tell = match leave {
                WorkerId::Alpha => &self.tell_alpha,
                WorkerId::Beta => &self.tell_beta,
            };
            // A full channel already carries a go signal.
            tell.try_send(()).ok();
        }
    }

    fn observe_rtt(&mut self, rtt: Duration) {
        self.srtt = Some(match self.srtt {
            None => rtt,
            Some(srtt) => (srtt * 7 + rtt) / 8,
        });
    }
}
