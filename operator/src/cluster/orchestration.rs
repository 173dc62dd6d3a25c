//! Collapses overlapping orchestration requests for a cluster into at most one running pass.
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::debug;

use crate::error::Result;

#[derive(Debug, Default)]
struct Flags {
    needed: bool,
    running: bool,
}

/// The needed and running flags of one cluster.
///
/// Every request raises `needed`. Whoever finds `needed && !running` runs a pass, and keeps
/// running passes while requests keep arriving, so at most one pass runs at a time and at least
/// one pass starts after any request.
#[derive(Debug, Default)]
pub struct SingleFlight {
    flags: Mutex<Flags>,
}

impl SingleFlight {
    fn raise(&self) {
        self.lock().needed = true;
    }

    fn begin(&self) -> bool {
        let mut flags = self.lock();
        if flags.needed && !flags.running {
            flags.needed = false;
            flags.running = true;
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        self.lock().running = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a pass. Runs `orchestrate` here unless a pass is already running, in which case
    /// that runner picks the request up and None is returned.
    ///
    /// Returns the result of the last pass run here. A reload sentinel ends the loop at once.
    pub async fn trigger<T, F, Fut>(&self, mut orchestrate: F) -> Option<Result<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.raise();
        let mut last = None;
        while self.begin() {
            let res = orchestrate().await;
            self.finish();
            let stop = matches!(&res, Err(err) if err.is_successful_rotation());
            last = Some(res);
            if stop {
                break;
            }
        }
        if last.is_none() {
            debug!("orchestration already running, request queued");
        }
        last
    }
}

/// [`SingleFlight`] state by cluster.
#[derive(Debug, Default)]
pub struct Flights {
    clusters: Mutex<HashMap<String, Arc<SingleFlight>>>,
}

impl Flights {
    /// State of the cluster at `key`, created on first use.
    pub fn get(&self, key: &str) -> Arc<SingleFlight> {
        let mut clusters = self
            .clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        clusters.entry(key.to_owned()).or_default().clone()
    }

    /// Drop the state of a deleted cluster.
    pub fn forget(&self, key: &str) {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
