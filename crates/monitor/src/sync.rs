//! Object synchronization: heavyweight monitors, their waiter queues and
//! the machinery that inflates and deflates them.

use std::fmt;

use thiserror::Error;

use crate::{runtime::threads::OwnerId, utils::flags::FlagError};

pub mod contention;
pub mod deflation;
pub mod object_monitor;
pub mod synchronizer;
pub mod waiter;

pub use object_monitor::{ObjectMonitor, TryLockResult, VirtualEnter, VirtualWait, WaitOutcome};

pub(crate) const NO_OWNER: u64 = 0;
pub(crate) const ANONYMOUS_OWNER: u64 = 1;
pub(crate) const DEFLATER_MARKER: u64 = 2;

/// Decoded value of a monitor's owner word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    None,
    /// Locked by a thread whose identity is not known yet.
    Anonymous,
    /// Claimed by the deflater.
    DeflaterMarker,
    Thread(OwnerId),
}

impl Owner {
    pub const fn from_raw(raw: u64) -> Self {
        match raw {
            NO_OWNER => Owner::None,
            ANONYMOUS_OWNER => Owner::Anonymous,
            DEFLATER_MARKER => Owner::DeflaterMarker,
            id => Owner::Thread(OwnerId::from_raw(id)),
        }
    }

    pub const fn into_raw(self) -> u64 {
        match self {
            Owner::None => NO_OWNER,
            Owner::Anonymous => ANONYMOUS_OWNER,
            Owner::DeflaterMarker => DEFLATER_MARKER,
            Owner::Thread(id) => id.as_raw(),
        }
    }

    pub fn thread(self) -> Option<OwnerId> {
        match self {
            Owner::Thread(id) => Some(id),
            _ => None,
        }
    }
}

impl From<OwnerId> for Owner {
    fn from(id: OwnerId) -> Self {
        Owner::Thread(id)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::None => write!(f, "None"),
            Owner::Anonymous => write!(f, "Anonymous"),
            Owner::DeflaterMarker => write!(f, "DeflaterMarker"),
            Owner::Thread(id) => write!(f, "Thread({})", id),
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("waiter arena exhausted: all {capacity} waiter nodes are in use")]
    WaiterArenaExhausted { capacity: usize },
    #[error("virtual thread unparker is not running")]
    UnparkerStopped,
    #[error("invalid monitor option: {0}")]
    InvalidOption(String),
    #[error("failed to spawn the {name} thread")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Flags(#[from] FlagError),
}
