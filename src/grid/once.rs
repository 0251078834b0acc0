//! Single-flight execution of a shared operation
//!
//! One `OnceEntered` guards one operation for its whole lifetime: the first
//! caller is elected owner and starts the work, every other caller (racing
//! or late) joins the same outcome. It cannot be reset.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::core::errors::FlightError;

/// What every joiner of a flight observes
pub type FlightOutcome<T> = Result<Arc<T>, FlightError>;

type SharedFlight<T> = Shared<BoxFuture<'static, FlightOutcome<T>>>;

struct Claim<T> {
    owner: usize,
    flight: SharedFlight<T>,
}

/// Runs a unit of work at most once among any number of callers
pub struct OnceEntered<T> {
    claim: Mutex<Option<Claim<T>>>,
}

impl<T> Default for OnceEntered<T> {
    fn default() -> Self {
        Self {
            claim: Mutex::new(None),
        }
    }
}

impl<T: Send + Sync + 'static> OnceEntered<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` unless another caller already did.
    ///
    /// `claimant` identifies the caller, usually its party index; it is
    /// recorded only if this call wins the election. The elected caller
    /// spawns the work on the current tokio runtime, so it runs to
    /// completion even if every joiner stops waiting. `work` is called
    /// after the election is settled and may query this instance. Must be
    /// called from within a runtime.
    pub fn run_once<F, Fut>(&self, claimant: usize, work: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut claim = self.claim.lock();

        if let Some(existing) = claim.as_ref() {
            debug!(
                "Claimant {} joins flight owned by {}",
                claimant, existing.owner
            );
            return Flight {
                elected: false,
                owner: existing.owner,
                flight: existing.flight.clone(),
            };
        }

        // Elect under the lock; build and start the work after releasing it
        let (done, outcome) = oneshot::channel::<FlightOutcome<T>>();
        let flight = async move {
            outcome.await.unwrap_or_else(|_| {
                Err(FlightError::new(anyhow::anyhow!(
                    "shared operation did not complete"
                )))
            })
        }
        .boxed()
        .shared();

        *claim = Some(Claim {
            owner: claimant,
            flight: flight.clone(),
        });
        drop(claim);

        debug!("Claimant {} elected to run shared operation", claimant);
        let work = work();
        tokio::spawn(async move {
            let result = match work.await {
                Ok(value) => Ok(Arc::new(value)),
                Err(e) => Err(FlightError::new(e)),
            };
            let _ = done.send(result);
        });

        Flight {
            elected: true,
            owner: claimant,
            flight,
        }
    }

    /// Whether `claimant` was elected to run the work
    pub fn is_owner(&self, claimant: usize) -> bool {
        self.owner() == Some(claimant)
    }

    pub fn owner(&self) -> Option<usize> {
        self.claim.lock().as_ref().map(|claim| claim.owner)
    }

    pub fn is_claimed(&self) -> bool {
        self.claim.lock().is_some()
    }

    /// Whether the work has finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.claim
            .lock()
            .as_ref()
            .map(|claim| claim.flight.peek().is_some())
            .unwrap_or(false)
    }
}

/// One caller's handle on a shared operation
pub struct Flight<T> {
    elected: bool,
    owner: usize,
    flight: SharedFlight<T>,
}

impl<T> Clone for Flight<T> {
    fn clone(&self) -> Self {
        Self {
            elected: self.elected,
            owner: self.owner,
            flight: self.flight.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Flight<T> {
    /// True if this call was the one that started the work
    pub fn is_owner(&self) -> bool {
        self.elected
    }

    /// Claimant that started the work
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// The outcome if the work already finished
    pub fn peek(&self) -> Option<FlightOutcome<T>> {
        self.flight.peek().cloned()
    }

    pub async fn wait(self) -> FlightOutcome<T> {
        self.flight.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_caller_joins() {
        let once = OnceEntered::<String>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let first = {
            let runs = runs.clone();
            once.run_once(0, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok("downloaded by 0".to_string())
            })
        };
        let second = {
            let runs = runs.clone();
            once.run_once(1, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok("downloaded by 1".to_string())
            })
        };

        assert!(first.is_owner());
        assert!(!second.is_owner());
        assert_eq!(second.owner(), 0);
        assert!(once.is_owner(0));
        assert!(!once.is_owner(1));

        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.as_str(), "downloaded by 0");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(once.is_done());
    }

    #[tokio::test]
    async fn test_late_caller_gets_completed_result() {
        let once = OnceEntered::<u32>::new();
        let first = once.run_once(3, || async { Ok(7) });
        assert_eq!(*first.wait().await.unwrap(), 7);

        let late = once.run_once(4, || async { Ok(8) });
        assert!(!late.is_owner());
        assert_eq!(late.peek().map(|r| *r.unwrap()), Some(7));
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let once = OnceEntered::<()>::new();
        let owner = once.run_once(0, || async { anyhow::bail!("mirror unreachable") });
        let joiner = once.run_once(1, || async { Ok(()) });

        let a = owner.wait().await.unwrap_err();
        let b = joiner.wait().await.unwrap_err();
        assert!(a.same_failure(&b));
        assert_eq!(a.cause().to_string(), "mirror unreachable");
    }

    #[tokio::test]
    async fn test_work_builder_can_query_the_election() {
        let once = OnceEntered::<bool>::new();
        let flight = once.run_once(5, || {
            let owner = once.owner();
            let claimed = once.is_claimed() && !once.is_done();
            async move { Ok(owner == Some(5) && claimed) }
        });
        assert!(*flight.wait().await.unwrap());
    }

    #[tokio::test]
    async fn test_panicking_work_fails_every_joiner() {
        let once = OnceEntered::<u8>::new();
        let owner = once.run_once(0, || async { panic!("disk on fire") });
        let joiner = once.run_once(1, || async { Ok(1) });

        let a = owner.wait().await.unwrap_err();
        let b = joiner.wait().await.unwrap_err();
        assert!(a.same_failure(&b));
        assert!(a.cause().to_string().contains("did not complete"));
    }

    #[tokio::test]
    async fn test_unclaimed() {
        let once = OnceEntered::<()>::new();
        assert!(!once.is_claimed());
        assert!(!once.is_done());
        assert_eq!(once.owner(), None);
    }
}
