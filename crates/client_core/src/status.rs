use serde::Serialize;
use tokio::sync::watch;

/// Busy state published to readers of a directory or session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub loading: bool,
    pub syncing: bool,
}

impl StatusFlags {
    /// What a scope without a client reports: permanently busy.
    pub const INERT: StatusFlags = StatusFlags {
        loading: true,
        syncing: true,
    };

    pub fn is_idle(&self) -> bool {
        !self.loading && !self.syncing
    }
}

/// In-flight operation counts. A flag is set while its count is non-zero, so
/// overlapping operations of the same kind do not clear each other's flag.
/// An inert depth reports [`StatusFlags::INERT`] whatever the counts are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusDepth {
    loading: usize,
    syncing: usize,
    inert: bool,
}

impl StatusDepth {
    pub fn flags(&self) -> StatusFlags {
        if self.inert {
            return StatusFlags::INERT;
        }
        StatusFlags {
            loading: self.loading > 0,
            syncing: self.syncing > 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusyKind {
    Loading,
    Syncing,
}

pub(crate) struct StatusTracker {
    depth: watch::Sender<StatusDepth>,
}

impl StatusTracker {
    pub(crate) fn new() -> Self {
        let (depth, _) = watch::channel(StatusDepth::default());
        Self { depth }
    }

    /// Tracker for a scope without a client. Its flags never clear.
    pub(crate) fn inert() -> Self {
        let (depth, _) = watch::channel(StatusDepth {
            inert: true,
            ..StatusDepth::default()
        });
        Self { depth }
    }

    pub(crate) fn flags(&self) -> StatusFlags {
        self.depth.borrow().flags()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<StatusDepth> {
        self.depth.subscribe()
    }

    /// Marks `kind` busy until the returned guard is dropped, whichever way
    /// the surrounding future exits.
    pub(crate) fn acquire(&self, kind: BusyKind) -> BusyGuard<'_> {
        self.adjust(kind, true);
        BusyGuard {
            tracker: self,
            kind,
        }
    }

    fn adjust(&self, kind: BusyKind, increment: bool) {
        self.depth.send_modify(|depth| {
            let counter = match kind {
                BusyKind::Loading => &mut depth.loading,
                BusyKind::Syncing => &mut depth.syncing,
            };
            if increment {
                *counter += 1;
            } else {
                *counter = counter.saturating_sub(1);
            }
        });
    }
}

#[must_use = "the busy flag is released as soon as the guard is dropped"]
pub(crate) struct BusyGuard<'a> {
    tracker: &'a StatusTracker,
    kind: BusyKind,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.tracker.adjust(self.kind, false);
    }
}
