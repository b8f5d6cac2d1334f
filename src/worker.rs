//! Background workers.
//!
//! A pool runs two long-lived threads: the compactor, which drains the
//! compaction queue, and the releaser, which settles orphans and returns
//! stale pages to the page source. Each worker sleeps on a channel of
//! [`Signal`]s. Producers coalesce wakeups through a `need_wakeup` flag, so a
//! burst of frees sends a single `Wake`.
//!
//! In [`Background::Manual`](crate::Background::Manual) mode no threads are
//! spawned and the queues are drained only when the owner asks.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};

use crate::pool::Shared;

pub(crate) enum Signal {
    /// New work was queued.
    Wake,
    /// Drain the queue, then acknowledge.
    Flush(Sender<()>),
    /// Exit the worker loop.
    Shutdown,
}

/// The producer side of a worker.
pub(crate) struct Waker {
    tx: Option<Sender<Signal>>,
    need_wakeup: AtomicBool,
}

impl Waker {
    /// A waker for a worker that runs only when asked to.
    pub(crate) fn manual() -> Waker {
        Waker {
            tx: None,
            need_wakeup: AtomicBool::new(true),
        }
    }

    pub(crate) fn new(tx: Sender<Signal>) -> Waker {
        Waker {
            tx: Some(tx),
            need_wakeup: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_manual(&self) -> bool {
        self.tx.is_none()
    }

    /// Wakes the worker unless a wakeup is already pending.
    pub(crate) fn wake(&self) {
        if let Some(tx) = &self.tx {
            if self.need_wakeup.swap(false, Ordering::AcqRel) {
                // The worker only disconnects after shutdown.
                let _ = tx.send(Signal::Wake);
            }
        }
    }

    /// Blocks until the worker has drained everything queued before the call.
    pub(crate) fn flush(&self) {
        let Some(tx) = &self.tx else { return };

        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if tx.send(Signal::Flush(ack_tx)).is_ok() {
            // An error here means the worker died; there is nothing to wait for.
            let _ = ack_rx.recv();
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Signal::Shutdown);
        }
    }

    fn rearm(&self) {
        self.need_wakeup.store(true, Ordering::Release);
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Role {
    Compact,
    Release,
}

impl Role {
    fn waker(self, shared: &Shared) -> &Waker {
        match self {
            Role::Compact => &shared.compactd,
            Role::Release => &shared.released,
        }
    }

    fn run(self, shared: &Shared) {
        match self {
            Role::Compact => shared.compact_all(),
            Role::Release => shared.release_all(),
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Role::Compact => "compact",
            Role::Release => "release",
        }
    }
}

/// Spawns the worker thread for `role`.
pub(crate) fn spawn(
    role: Role,
    shared: Arc<Shared>,
    rx: Receiver<Signal>,
) -> io::Result<JoinHandle<()>> {
    let name = format!("{}-{}", shared.name, role.suffix());

    thread::Builder::new().name(name).spawn(move || {
        for signal in rx.iter() {
            match signal {
                Signal::Wake => {
                    // Rearm before draining so work queued mid-drain wakes us again.
                    role.waker(&shared).rearm();
                    role.run(&shared);
                }
                Signal::Flush(ack) => {
                    role.waker(&shared).rearm();
                    role.run(&shared);
                    let _ = ack.send(());
                }
                Signal::Shutdown => break,
            }
        }

        log::trace!("{}: {} worker exiting", shared.name, role.suffix());
    })
}
