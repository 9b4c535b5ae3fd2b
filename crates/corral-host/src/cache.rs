//! Bounded pool of initialized task-executable sessions.
//!
//! Starting a task executable is expensive: spawn, environment push, setup
//! handshake. The cache keeps sessions alive between runs, keyed by the
//! executable's path. Entries carry a strictly increasing insertion rank;
//! when the pool is full the lowest-ranked unlocked entry is evicted.
//! Locked ("pinned") executables are exempt from eviction unless every
//! entry is locked and a slot must still be freed.
//!
//! Ownership realizes the busy/idle invariant: [`ProcessCache::get`]
//! removes the entry and hands the session to the caller, so a session is
//! either in the cache (idle) or inside a run (busy), never both.
//! [`ProcessCache::put`] re-inserts it with a fresh rank.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use corral_config::Config;

use crate::channel::{ByteChannel, Channel, ChannelSettings};
use crate::errors::{ChannelError, SessionError};
use crate::session::{EnvVars, ProtocolSession, SessionSettings};

/// Log target for cache operations.
pub(crate) const CACHE_TARGET: &str = "corral_host::cache";

/// Argument telling a task executable to run in connected-subprocess mode.
const CONNECTED_FLAG: &str = "-c";

/// Spawning seam so tests can supply channels without real processes.
pub trait Launcher {
    /// The channel type this launcher produces.
    type Chan: Channel;

    /// Starts a child process for `executable` and wires up its pipes.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when the spawn fails or the child dies
    /// during startup.
    fn launch(&mut self, executable: &Path) -> Result<Self::Chan, ChannelError>;
}

/// Production launcher: spawns the executable in connected mode.
#[derive(Debug, Clone)]
pub struct PipeLauncher {
    settings: ChannelSettings,
}

impl PipeLauncher {
    /// Builds a launcher from the shared configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            settings: ChannelSettings::from_config(config),
        }
    }
}

impl Launcher for PipeLauncher {
    type Chan = ByteChannel;

    fn launch(&mut self, executable: &Path) -> Result<ByteChannel, ChannelError> {
        ByteChannel::spawn(executable, &[CONNECTED_FLAG], self.settings.clone())
    }
}

struct CacheEntry<C: Channel> {
    rank: u64,
    session: ProtocolSession<C>,
}

/// One row of the diagnostic listing, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheListing {
    /// Path of the cached executable.
    pub executable: PathBuf,
    /// Whether the entry is pinned against eviction.
    pub locked: bool,
}

/// Keyed pool of idle sessions with pinning and rank eviction.
pub struct ProcessCache<L: Launcher> {
    launcher: L,
    session_settings: SessionSettings,
    capacity: usize,
    entries: HashMap<PathBuf, CacheEntry<L::Chan>>,
    locked: HashSet<PathBuf>,
    counter: u64,
}

impl<L: Launcher> ProcessCache<L> {
    /// Creates an empty cache bounded by the configured capacity.
    pub fn new(launcher: L, config: &Config) -> Self {
        Self {
            launcher,
            session_settings: SessionSettings::from_config(config),
            capacity: config.cache_capacity,
            entries: HashMap::new(),
            locked: HashSet::new(),
            counter: 0,
        }
    }

    /// Number of cached sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current capacity bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a session for `executable` is currently cached.
    #[must_use]
    pub fn contains(&self, executable: &Path) -> bool {
        self.entries.contains_key(executable)
    }

    /// Whether `executable` is pinned against eviction.
    #[must_use]
    pub fn is_locked(&self, executable: &Path) -> bool {
        self.locked.contains(executable)
    }

    /// Hands out a ready session for `executable`.
    ///
    /// A cache hit removes the entry and returns the idle session. A
    /// cached-but-dead process is discarded with a warning and treated as a
    /// miss. On a miss a new child is spawned and walked through setup mode
    /// with `env`; the new session is *not* in the cache until the caller
    /// returns it with [`put`](Self::put).
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] when spawning or initialization fails.
    /// The cache itself is unaffected by a failed get.
    pub fn get(
        &mut self,
        executable: &Path,
        env: &EnvVars,
    ) -> Result<ProtocolSession<L::Chan>, SessionError> {
        if let Some(entry) = self.entries.remove(executable) {
            let mut session = entry.session;
            if session.is_alive() {
                debug!(
                    target: CACHE_TARGET,
                    executable = %executable.display(),
                    "reusing cached process"
                );
                return Ok(session);
            }
            warn!(
                target: CACHE_TARGET,
                executable = %executable.display(),
                "cached process is dead, restarting it"
            );
            if let Err(error) = session.kill() {
                debug!(
                    target: CACHE_TARGET,
                    executable = %executable.display(),
                    error = %error,
                    "discarding dead cached process"
                );
            }
        }

        let channel = self.launcher.launch(executable)?;
        let mut session = ProtocolSession::new(channel, self.session_settings.clone());
        session.initialize(env)?;
        Ok(session)
    }

    /// Returns a session to the pool after a successful run.
    ///
    /// With a zero capacity, or with every slot pinned, the session is
    /// terminated instead of cached. At capacity the lowest-ranked unlocked
    /// entry is evicted first; if everything is locked, the lowest-ranked
    /// entry goes anyway.
    pub fn put(&mut self, mut session: ProtocolSession<L::Chan>) {
        let executable = session.executable().to_path_buf();

        if self.capacity == 0 || self.locked.len() >= self.capacity {
            session.terminate();
            return;
        }

        if let Some(existing) = self.entries.get_mut(&executable) {
            // Another session for the same executable was cached first;
            // keep it and refresh its rank.
            session.terminate();
            self.counter += 1;
            existing.rank = self.counter;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.counter += 1;
        self.entries
            .insert(executable, CacheEntry { rank: self.counter, session });
    }

    /// Evicts the lowest-ranked unlocked entry, or the lowest-ranked entry
    /// outright when everything is locked.
    fn evict_oldest(&mut self) {
        let victim = self
            .entries
            .iter()
            .filter(|(executable, _)| !self.locked.contains(*executable))
            .min_by_key(|(_, entry)| entry.rank)
            .map(|(executable, _)| executable.clone())
            .or_else(|| {
                self.entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.rank)
                    .map(|(executable, _)| executable.clone())
            });
        if let Some(executable) = victim {
            debug!(
                target: CACHE_TARGET,
                executable = %executable.display(),
                "evicting oldest cached process"
            );
            self.locked.remove(&executable);
            if let Some(entry) = self.entries.remove(&executable) {
                let mut session = entry.session;
                session.terminate();
            }
        }
    }

    /// Eagerly caches and pins the named executables, up to capacity.
    ///
    /// # Errors
    ///
    /// Returns the first spawn or initialization failure; executables pinned
    /// before the failure stay pinned.
    pub fn lock(&mut self, executables: &[PathBuf], env: &EnvVars) -> Result<(), SessionError> {
        for executable in executables {
            if self.locked.len() >= self.capacity {
                break;
            }
            if self.entries.contains_key(executable) {
                self.locked.insert(executable.clone());
                continue;
            }
            let session = self.get(executable, env)?;
            self.put(session);
            if self.entries.contains_key(executable) {
                self.locked.insert(executable.clone());
            } else {
                warn!(
                    target: CACHE_TARGET,
                    executable = %executable.display(),
                    "cannot pin executable; cache did not retain it"
                );
            }
        }
        Ok(())
    }

    /// Removes `executable` from the cache (clearing its pin) and kills the
    /// process without asking.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unkillable`] when the process survives the
    /// escalation sequence.
    pub fn kill(&mut self, executable: &Path) -> Result<(), ChannelError> {
        self.locked.remove(executable);
        match self.entries.remove(executable) {
            Some(entry) => {
                let mut session = entry.session;
                session.kill()
            }
            None => Ok(()),
        }
    }

    /// Removes `executable` from the cache (clearing its pin) and stops the
    /// process gracefully: ask for `bye`, wait briefly, then kill.
    pub fn terminate(&mut self, executable: &Path) {
        self.locked.remove(executable);
        if let Some(entry) = self.entries.remove(executable) {
            let mut session = entry.session;
            session.terminate();
        }
    }

    /// Changes the capacity bound, evicting until it holds. A zero bound
    /// clears every pin and flushes the whole pool.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        if capacity == 0 {
            self.locked.clear();
            self.flush(&[]);
            return;
        }
        while self.entries.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Terminates the named executables, or every unlocked one when none
    /// are named. Pins elsewhere are untouched.
    pub fn flush(&mut self, executables: &[PathBuf]) {
        let targets: Vec<PathBuf> = if executables.is_empty() {
            self.entries
                .keys()
                .filter(|executable| !self.locked.contains(*executable))
                .cloned()
                .collect()
        } else {
            executables.to_vec()
        };
        for executable in targets {
            self.terminate(&executable);
        }
    }

    /// Queues an environment directive on every cached session; each will
    /// forward it to its peer at the start of its next run.
    pub fn set_env(&mut self, directive: &str) {
        for entry in self.entries.values_mut() {
            entry.session.append_env(directive);
        }
    }

    /// Lists cached processes newest-first with their pin state.
    #[must_use]
    pub fn list(&self) -> Vec<CacheListing> {
        let mut rows: Vec<(&u64, &PathBuf)> = self
            .entries
            .iter()
            .map(|(executable, entry)| (&entry.rank, executable))
            .collect();
        rows.sort_by(|a, b| b.0.cmp(a.0));
        rows.into_iter()
            .map(|(_, executable)| CacheListing {
                executable: executable.clone(),
                locked: self.locked.contains(executable),
            })
            .collect()
    }
}

impl<L: Launcher> Drop for ProcessCache<L> {
    fn drop(&mut self) {
        self.locked.clear();
        self.flush(&[]);
    }
}

/// Mutex-serialized handle to a [`ProcessCache`] shared between runs.
///
/// Cache operations are short — the lock is never held across a run — so a
/// single mutex is sufficient; sessions for distinct executables can run on
/// distinct threads concurrently.
pub struct SharedCache<L: Launcher> {
    inner: Arc<Mutex<ProcessCache<L>>>,
}

impl<L: Launcher> Clone for SharedCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Launcher> SharedCache<L> {
    /// Wraps a cache for shared use.
    pub fn new(cache: ProcessCache<L>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    /// Executes a closure with exclusive access to the cache.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Internal`] if the cache lock is poisoned.
    pub fn with_cache<F, R>(&self, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut ProcessCache<L>) -> R,
    {
        let mut guard = self.inner.lock().map_err(|_| SessionError::Internal {
            message: "process cache lock poisoned".to_owned(),
        })?;
        Ok(f(&mut guard))
    }
}
