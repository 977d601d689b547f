//! Registry of commit hooks notified when decisions are accepted.

use std::collections::HashMap;
use std::sync::Arc;

use meridian_core::Id;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::errors::FatalError;

/// A hook invoked for every accepted decision on a chain, in acceptance
/// order (ancestor-first). Callbacks run outside every engine lock, so they
/// may do real work, but they must not re-enter the engine.
pub trait Acceptor: Send + Sync {
    fn accept(&self, chain: Id, decision: Id, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> Acceptor for F
where
    F: Fn(Id, Id, &[u8]) -> anyhow::Result<()> + Send + Sync,
{
    fn accept(&self, chain: Id, decision: Id, payload: &[u8]) -> anyhow::Result<()> {
        self(chain, decision, payload)
    }
}

struct Registration {
    name: String,
    acceptor: Arc<dyn Acceptor>,
    die_on_error: bool,
}

/// Shareable registry of acceptors, keyed by chain and hook name.
///
/// Dispatch snapshots the registration list under the read lock and invokes
/// the hooks after releasing it, so a slow acceptor never blocks
/// registration and a hook can safely deregister itself. An error from a
/// `die_on_error` hook is escalated on the engine's fatal channel; other
/// errors are logged and ignored.
#[derive(Default)]
pub struct AcceptorRegistry {
    inner: RwLock<HashMap<Id, Vec<Registration>>>,
}

impl AcceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `acceptor` under `name` for `chain`. Re-registering a name
    /// replaces the previous hook in place, keeping its dispatch position.
    pub fn register(
        &self,
        chain: Id,
        name: impl Into<String>,
        acceptor: Arc<dyn Acceptor>,
        die_on_error: bool,
    ) {
        let name = name.into();
        debug!(%chain, name, die_on_error, "acceptor registered");
        let mut inner = self.inner.write();
        let registrations = inner.entry(chain).or_default();
        match registrations.iter_mut().find(|r| r.name == name) {
            Some(existing) => {
                existing.acceptor = acceptor;
                existing.die_on_error = die_on_error;
            }
            None => registrations.push(Registration {
                name,
                acceptor,
                die_on_error,
            }),
        }
    }

    /// Remove the hook registered under `name`. Returns whether it existed.
    pub fn deregister(&self, chain: &Id, name: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(registrations) = inner.get_mut(chain) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.name != name);
        before != registrations.len()
    }

    /// Number of hooks registered for `chain`.
    pub fn len(&self, chain: &Id) -> usize {
        self.inner.read().get(chain).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, chain: &Id) -> bool {
        self.len(chain) == 0
    }

    /// Invoke every hook for `chain` with one accepted decision.
    pub fn dispatch(
        &self,
        chain: Id,
        decision: Id,
        payload: &[u8],
        fatal: &mpsc::UnboundedSender<FatalError>,
    ) {
        let snapshot: Vec<(String, Arc<dyn Acceptor>, bool)> = {
            let inner = self.inner.read();
            inner
                .get(&chain)
                .map(|registrations| {
                    registrations
                        .iter()
                        .map(|r| (r.name.clone(), Arc::clone(&r.acceptor), r.die_on_error))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (name, acceptor, die_on_error) in snapshot {
            if let Err(source) = acceptor.accept(chain, decision, payload) {
                if die_on_error {
                    error!(%chain, %decision, name, %source, "acceptor failed fatally");
                    let _ = fatal.send(FatalError::AcceptorFailed {
                        chain,
                        decision,
                        name,
                        source,
                    });
                } else {
                    warn!(%chain, %decision, name, %source, "acceptor failed");
                }
            }
        }
    }
}
