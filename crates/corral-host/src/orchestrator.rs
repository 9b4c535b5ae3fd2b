//! Public entry point: run one task against the process pool.

use tracing::debug;

use crate::cache::{Launcher, SharedCache};
use crate::cancel::CancelToken;
use crate::errors::SessionError;
use crate::session::EnvVars;
use crate::task::{Collaborators, FocusManager, RunIo, TaskInfo};

/// Log target for orchestration.
pub(crate) const ORCHESTRATOR_TARGET: &str = "corral_host::orchestrator";

/// Routes task runs through the shared process cache.
///
/// The cache is an owned value wired in at construction; whoever builds the
/// orchestrator decides its scope, and tests instantiate independent caches
/// instead of resetting shared state.
pub struct Orchestrator<L: Launcher> {
    cache: SharedCache<L>,
}

impl<L: Launcher> Orchestrator<L> {
    /// Builds an orchestrator around a shared cache.
    pub fn new(cache: SharedCache<L>) -> Self {
        Self { cache }
    }

    /// Handle to the underlying cache for the operational surface
    /// (lock, flush, resize, list, environment broadcast).
    #[must_use]
    pub fn cache(&self) -> SharedCache<L> {
        self.cache.clone()
    }

    /// Runs `task` to completion in its executable's process.
    ///
    /// A session comes out of the cache (or is spawned and initialized with
    /// `env`), services the run, and goes back into the cache on success.
    /// On any failure — protocol error, peer error, timeout, cancellation —
    /// the session is killed and never returned to the cache, and the
    /// original error is propagated; if the kill itself fails too, its
    /// description is appended rather than allowed to mask the cause. The
    /// focus collaborator is restored on every path out of the run.
    ///
    /// # Errors
    ///
    /// Returns the [`SessionError`] that ended the run.
    pub fn run(
        &self,
        task: &mut dyn TaskInfo,
        env: &EnvVars,
        io: &mut RunIo<'_>,
        collab: &mut Collaborators<'_>,
        focus: &mut dyn FocusManager,
        cancel: &CancelToken,
    ) -> Result<(), SessionError> {
        let executable = task.executable().to_path_buf();
        let mut session = self
            .cache
            .with_cache(|cache| cache.get(&executable, env))??;

        let result = session.run(task, collab, io, cancel);
        focus.restore_last();

        match result {
            Ok(()) => {
                debug!(
                    target: ORCHESTRATOR_TARGET,
                    executable = %executable.display(),
                    task = task.name(),
                    "run complete; returning process to cache"
                );
                self.cache.with_cache(|cache| cache.put(session))?;
                Ok(())
            }
            Err(primary) => match session.kill() {
                Ok(()) => Err(primary),
                Err(kill_error) => Err(SessionError::Cleanup {
                    primary: Box::new(primary),
                    cleanup: kill_error.to_string(),
                }),
            },
        }
    }
}
