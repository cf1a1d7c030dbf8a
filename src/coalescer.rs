//! Single-flight coalescer: in-process deduplication of concurrent identical calls.
//!
//! The in-flight map is a mutex-guarded `HashMap` from key to a broadcast channel carrying
//! the (eventually) settled result — the "shared settable-once result handle" called for in
//! the design notes. The entry is removed immediately after settlement, never lazily, so the
//! next arrival for the same key starts a fresh attempt.
//!
//! The leader's `compute` future is spawned onto a detached task rather than driven inline.
//! If the leader's own caller abandons its wait (request timeout, client disconnect), only
//! that `execute` call is dropped — the spawned task keeps running to completion and still
//! settles the result for any followers, and a drop guard clears the in-flight entry even if
//! the task itself unwinds from a panic before settling normally.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

type Outcome<T, E> = Result<T, E>;
type InFlightMap<T, E> = Arc<Mutex<HashMap<String, broadcast::Sender<Arc<Outcome<T, E>>>>>>;

/// Lets a generic [`Coalescer`] construct an error for waiters of a leader that never
/// settled normally, without knowing anything else about `E`.
pub trait LeaderCancelled {
    fn leader_cancelled() -> Self;
}

/// Whether a caller to [`Coalescer::execute`] became the leader for its key or joined an
/// already in-flight call as a follower. Reported synchronously, in the same critical
/// section that made the decision, so a caller can count coalesced requests without a
/// second, racy lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

pub struct Coalescer<T, E> {
    in_flight: InFlightMap<T, E>,
}

impl<T, E> Default for Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + LeaderCancelled + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + LeaderCancelled + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Joins the in-flight call for `key`, becoming its leader if none exists yet.
    /// Leadership registration is serialised by the map's mutex, so two simultaneous
    /// arrivals for the same key can never both become leader, and `on_join` is always
    /// called with the role that registration actually decided.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        compute: F,
        on_join: impl FnOnce(Role),
    ) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Outcome<T, E>> + Send + 'static,
    {
        enum Joined<T, E> {
            Follower(broadcast::Receiver<Arc<Outcome<T, E>>>),
            Leader {
                rx: broadcast::Receiver<Arc<Outcome<T, E>>>,
                tx: broadcast::Sender<Arc<Outcome<T, E>>>,
            },
        }

        let joined = {
            let mut map = self.in_flight.lock();
            if let Some(tx) = map.get(key) {
                Joined::Follower(tx.subscribe())
            } else {
                let (tx, rx) = broadcast::channel(1);
                map.insert(key.to_string(), tx.clone());
                Joined::Leader { rx, tx }
            }
        };

        match joined {
            Joined::Follower(mut rx) => {
                on_join(Role::Follower);
                // The leader always sends exactly once before returning, and this channel
                // carries only that one message, so a follower's recv cannot lag or close
                // early in practice.
                let outcome = rx
                    .recv()
                    .await
                    .expect("coalescer leader settled without publishing a result");
                (*outcome).clone()
            }
            Joined::Leader { mut rx, tx } => {
                on_join(Role::Leader);
                let guard = SettleGuard {
                    key: key.to_string(),
                    map: self.in_flight.clone(),
                    tx,
                    settled: false,
                };
                tokio::spawn(async move {
                    let outcome = compute().await;
                    guard.settle(outcome);
                });
                let outcome = rx
                    .recv()
                    .await
                    .expect("coalescer leader task settled without publishing a result");
                (*outcome).clone()
            }
        }
    }
}

/// Clears the in-flight entry and publishes the settled result exactly once. If dropped
/// without [`SettleGuard::settle`] having run — the spawned task panicked before
/// `compute` returned — it still clears the entry and publishes a synthetic cancellation
/// error, so no waiter is left stranded.
struct SettleGuard<T, E: LeaderCancelled> {
    key: String,
    map: InFlightMap<T, E>,
    tx: broadcast::Sender<Arc<Outcome<T, E>>>,
    settled: bool,
}

impl<T, E: LeaderCancelled> SettleGuard<T, E> {
    fn settle(mut self, outcome: Outcome<T, E>) {
        self.settled = true;
        self.map.lock().remove(&self.key);
        let _ = self.tx.send(Arc::new(outcome));
    }
}

impl<T, E: LeaderCancelled> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.map.lock().remove(&self.key);
            let _ = self.tx.send(Arc::new(Err(E::leader_cancelled())));
        }
    }
}

#[cfg(test)]
impl LeaderCancelled for String {
    fn leader_cancelled() -> Self {
        "leader cancelled before publishing a result".to_string()
    }
}
