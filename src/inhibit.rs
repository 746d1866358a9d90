//! Refcounted inhibition locks.
//!
//! One [`Lock`] per requester key (a D-Bus unique name, or the daemon's own
//! reserved key). Repeated requests from the same key bump the refcount and
//! hand back the same cookie. Locks live in a key-indexed table with a
//! cookie index kept in step, so release by key or by cookie is O(1).
//!
//! While at least one lock exists, a [`PresenceWatch`] runs so that a
//! requester leaving the bus drops its lock.

use std::collections::HashMap;

use log::{debug, info};

use crate::{error::LockError, message::InhibitChange};

/// Key used by the daemon's own `Inhibit(b)` method.
pub const SELF_INHIBIT_KEY: &str = "LockLumind";
/// Cookie reserved for [`SELF_INHIBIT_KEY`].
pub const SELF_INHIBIT_COOKIE: u32 = u32::MAX;

/// Watches for lock holders disappearing.
#[cfg_attr(test, mockall::automock)]
pub trait PresenceWatch {
    /// Called when the first lock is created.
    fn start(&mut self);
    /// Called when the last lock is removed.
    fn stop(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub cookie: u32,
    pub refs: u32,
    pub app: String,
    pub reason: String,
}

/// How a release finds its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRef<'a> {
    Key(&'a str),
    Cookie(u32),
    /// The caller's own lock if it has one, otherwise whichever lock owns
    /// the cookie.
    KeyOrCookie { key: &'a str, cookie: u32 },
}

pub struct LockManager<W: PresenceWatch> {
    locks: HashMap<String, Lock>,
    cookies: HashMap<u32, String>,
    watch: W,
}

impl<W: PresenceWatch> LockManager<W> {
    pub fn new(watch: W) -> Self {
        Self {
            locks: HashMap::new(),
            cookies: HashMap::new(),
            watch,
        }
    }

    pub fn is_inhibited(&self) -> bool {
        !self.locks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Lock> {
        self.locks.get(key)
    }

    pub fn key_of(&self, cookie: u32) -> Option<&str> {
        self.cookies.get(&cookie).map(String::as_str)
    }

    /// Takes a lock for `key`, or another reference on the one it holds.
    ///
    /// `cookie_hint` is used for a new lock instead of a random cookie.
    /// Returns the cookie, plus the transition to announce when a lock was
    /// created.
    pub fn acquire(
        &mut self,
        key: &str,
        cookie_hint: Option<u32>,
        app: &str,
        reason: &str,
    ) -> (u32, Option<InhibitChange>) {
        if let Some(lock) = self.locks.get_mut(key) {
            lock.refs += 1;
            debug!("inhibition held by {key} now has {} references", lock.refs);
            return (lock.cookie, None);
        }

        let cookie = cookie_hint
            .filter(|c| !self.cookies.contains_key(c))
            .unwrap_or_else(|| self.fresh_cookie());
        let old = self.is_inhibited();
        if self.locks.is_empty() {
            self.watch.start();
        }

        self.cookies.insert(cookie, key.to_string());
        self.locks.insert(
            key.to_string(),
            Lock {
                cookie,
                refs: 1,
                app: app.to_string(),
                reason: reason.to_string(),
            },
        );
        info!("new inhibition for '{app}' ({reason}), cookie {cookie}");

        let change = InhibitChange {
            old,
            new: true,
            force: false,
            app: app.to_string(),
            reason: reason.to_string(),
        };
        (cookie, Some(change))
    }

    /// Drops one reference, or all of them when `force` is set.
    ///
    /// Returns the transition to announce when the last lock went away;
    /// releasing a lock while others are still held changes nothing visible.
    pub fn release(
        &mut self,
        target: LockRef<'_>,
        force: bool,
    ) -> Result<Option<InhibitChange>, LockError> {
        let key = self.resolve(target)?;
        let Some(lock) = self.locks.get_mut(&key) else {
            return Err(LockError::UnknownKey(key));
        };

        lock.refs = if force { 0 } else { lock.refs - 1 };
        if lock.refs > 0 {
            debug!("inhibition held by {key} now has {} references", lock.refs);
            return Ok(None);
        }

        let Some(lock) = self.locks.remove(&key) else {
            return Err(LockError::UnknownKey(key));
        };
        self.cookies.remove(&lock.cookie);
        info!("dropped inhibition held by cookie {}", lock.cookie);
        if !self.locks.is_empty() {
            return Ok(None);
        }
        self.watch.stop();

        Ok(Some(InhibitChange {
            old: true,
            new: false,
            force: key == SELF_INHIBIT_KEY,
            app: lock.app,
            reason: lock.reason,
        }))
    }

    /// A key left the bus: drop its lock whatever the refcount.
    /// Starts the watch again if locks were taken before it could run.
    pub fn resume_watch(&mut self) {
        if !self.locks.is_empty() {
            self.watch.start();
        }
    }

    pub fn vanished(&mut self, key: &str) -> Option<InhibitChange> {
        if !self.locks.contains_key(key) {
            return None;
        }
        debug!("{key} left the bus while holding an inhibition");
        self.release(LockRef::Key(key), true).ok().flatten()
    }

    fn resolve(&self, target: LockRef<'_>) -> Result<String, LockError> {
        let by_cookie = |cookie: u32| {
            self.cookies
                .get(&cookie)
                .cloned()
                .ok_or(LockError::UnknownCookie(cookie))
        };

        match target {
            LockRef::Key(key) if self.locks.contains_key(key) => Ok(key.to_string()),
            LockRef::Key(key) => Err(LockError::UnknownKey(key.to_string())),
            LockRef::Cookie(cookie) => by_cookie(cookie),
            LockRef::KeyOrCookie { key, .. } if self.locks.contains_key(key) => Ok(key.to_string()),
            LockRef::KeyOrCookie { cookie, .. } => by_cookie(cookie),
        }
    }

    fn fresh_cookie(&self) -> u32 {
        loop {
            let cookie = rand::random::<u32>();
            if cookie != SELF_INHIBIT_COOKIE && !self.cookies.contains_key(&cookie) {
                return cookie;
            }
        }
    }

    #[cfg(test)]
    fn watch_mut(&mut self) -> &mut W {
        &mut self.watch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    /// Watch that only tolerates balanced start/stop calls.
    fn watch(starts: usize) -> MockPresenceWatch {
        let mut watch = MockPresenceWatch::new();
        watch.expect_start().times(starts).return_const(());
        watch.expect_stop().times(starts).return_const(());
        watch
    }

    #[test]
    fn same_key_coalesces() {
        let mut locks = LockManager::new(watch(1));

        let (first, change) = locks.acquire(":1.7", None, "mpv", "video");
        assert!(change.is_some());
        let (second, change) = locks.acquire(":1.7", None, "mpv", "video");
        assert_eq!(change, None);
        assert_eq!(first, second);
        assert_eq!(locks.get(":1.7").unwrap().refs, 2);

        assert_eq!(locks.release(LockRef::Key(":1.7"), false), Ok(None));
        assert_eq!(locks.get(":1.7").unwrap().refs, 1);

        let change = locks.release(LockRef::Key(":1.7"), false).unwrap().unwrap();
        assert!(change.old);
        assert!(!change.new);
        assert!(!change.force);
        assert!(locks.is_empty());
    }

    #[test]
    fn forced_release_ignores_refcount() {
        let mut locks = LockManager::new(watch(1));
        for _ in 0..5 {
            locks.acquire(":1.9", None, "firefox", "playing");
        }

        let change = locks.release(LockRef::Key(":1.9"), true).unwrap();
        assert!(change.is_some());
        assert!(locks.get(":1.9").is_none());
        assert_eq!(locks.release(LockRef::Key(":1.9"), true), Err(LockError::UnknownKey(":1.9".into())));
    }

    #[test]
    fn vanished_key_releases_once() {
        let mut locks = LockManager::new(watch(1));
        locks.acquire(":1.3", None, "vlc", "movie");
        locks.acquire(":1.3", None, "vlc", "movie");
        locks.acquire(":1.3", None, "vlc", "movie");

        let change = locks.vanished(":1.3").unwrap();
        assert_eq!(change.app, "vlc");
        assert!(!change.new);
        assert_eq!(locks.vanished(":1.3"), None);
    }

    #[test]
    fn cookie_release_touches_one_lock() {
        let mut locks = LockManager::new(watch(1));
        let (a, _) = locks.acquire(":1.1", None, "a", "x");
        let (b, _) = locks.acquire(":1.2", None, "b", "y");
        assert_ne!(a, b);

        assert_eq!(locks.release(LockRef::Cookie(a), false).unwrap(), None);
        assert!(locks.is_inhibited());
        assert!(locks.get(":1.1").is_none());
        assert_eq!(locks.get(":1.2").unwrap().cookie, b);
        assert_eq!(locks.key_of(b), Some(":1.2"));

        let change = locks.release(LockRef::Cookie(b), false).unwrap().unwrap();
        assert!(change.old && !change.new);
        assert_eq!(change.app, "b");
    }

    #[test]
    fn only_the_last_release_is_announced() {
        let mut locks = LockManager::new(watch(1));
        locks.acquire(":1.1", None, "firefox", "video");
        locks.acquire(":1.2", None, "mpv", "video");

        assert_eq!(locks.vanished(":1.1"), None);
        let last = locks.release(LockRef::Key(":1.2"), true).unwrap();
        assert_eq!(last.map(|c| c.new), Some(false));
    }

    #[test]
    fn key_wins_over_cookie() {
        let mut locks = LockManager::new(watch(1));
        let (a, _) = locks.acquire(":1.1", None, "a", "x");
        locks.acquire(":1.2", None, "b", "y");

        locks
            .release(LockRef::KeyOrCookie { key: ":1.2", cookie: a }, false)
            .unwrap();
        assert!(locks.get(":1.2").is_none());
        assert!(locks.get(":1.1").is_some());

        // A stranger may still drop a lock by cookie.
        locks
            .release(LockRef::KeyOrCookie { key: ":1.99", cookie: a }, false)
            .unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn unknown_cookie_is_a_lookup_miss() {
        let mut locks = LockManager::new(watch(0));
        assert_eq!(
            locks.release(LockRef::Cookie(42), false),
            Err(LockError::UnknownCookie(42))
        );
    }

    #[test]
    fn self_inhibit_uses_reserved_cookie_and_forces() {
        let mut locks = LockManager::new(watch(1));
        let (cookie, _) = locks.acquire(SELF_INHIBIT_KEY, Some(SELF_INHIBIT_COOKIE), "Lumind", "user requested");
        assert_eq!(cookie, SELF_INHIBIT_COOKIE);

        let change = locks
            .release(LockRef::Key(SELF_INHIBIT_KEY), true)
            .unwrap()
            .unwrap();
        assert!(change.force);
    }

    #[test]
    fn watch_follows_lock_table() {
        let mut watch = MockPresenceWatch::new();
        watch.expect_start().times(2).return_const(());
        watch.expect_stop().times(1).return_const(());
        let mut locks = LockManager::new(watch);

        locks.acquire(":1.1", None, "a", "x");
        locks.acquire(":1.2", None, "b", "y");
        locks.release(LockRef::Key(":1.1"), false).unwrap();
        locks.release(LockRef::Key(":1.2"), false).unwrap();
        locks.acquire(":1.3", None, "c", "z");

        locks.watch_mut().checkpoint();
    }

    #[test]
    fn watch_resumes_only_while_locked() {
        let mut watch = MockPresenceWatch::new();
        watch.expect_start().times(2).return_const(());
        watch.expect_stop().times(1).return_const(());
        let mut locks = LockManager::new(watch);

        locks.resume_watch();
        locks.acquire(":1.1", None, "a", "x");
        locks.resume_watch();
        locks.release(LockRef::Key(":1.1"), false).unwrap();
        locks.resume_watch();

        locks.watch_mut().checkpoint();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u8),
        Release(u8, bool),
        ReleaseCookieOf(u8),
        Vanish(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Acquire),
            (0u8..4, any::<bool>()).prop_map(|(k, f)| Op::Release(k, f)),
            (0u8..4).prop_map(Op::ReleaseCookieOf),
            (0u8..4).prop_map(Op::Vanish),
        ]
    }

    proptest! {
        #[test]
        fn refcounts_match_unpaired_calls(ops in prop::collection::vec(op(), 0..60)) {
            let mut watch = MockPresenceWatch::new();
            watch.expect_start().return_const(());
            watch.expect_stop().return_const(());
            let mut locks = LockManager::new(watch);
            let mut model: HashMap<String, u32> = HashMap::new();

            for op in ops {
                let was_inhibited = locks.is_inhibited();
                let releasing = !matches!(op, Op::Acquire(_));
                let change = match op {
                    Op::Acquire(k) => {
                        let key = format!(":1.{k}");
                        let (cookie, change) = locks.acquire(&key, None, "app", "why");
                        prop_assert_eq!(locks.key_of(cookie), Some(key.as_str()));
                        *model.entry(key).or_default() += 1;
                        change
                    }
                    Op::Release(k, force) => {
                        let key = format!(":1.{k}");
                        let res = locks.release(LockRef::Key(&key), force);
                        match model.get_mut(&key) {
                            None => { prop_assert!(res.is_err()); None }
                            Some(refs) => {
                                *refs = if force { 0 } else { *refs - 1 };
                                if *refs == 0 { model.remove(&key); }
                                res.unwrap()
                            }
                        }
                    }
                    Op::ReleaseCookieOf(k) => {
                        let key = format!(":1.{k}");
                        match locks.get(&key).map(|l| l.cookie) {
                            None => None,
                            Some(cookie) => {
                                let refs = model.get_mut(&key).unwrap();
                                *refs -= 1;
                                if *refs == 0 { model.remove(&key); }
                                locks.release(LockRef::Cookie(cookie), false).unwrap()
                            }
                        }
                    }
                    Op::Vanish(k) => {
                        let key = format!(":1.{k}");
                        model.remove(&key);
                        locks.vanished(&key)
                    }
                };

                if releasing {
                    let emptied = was_inhibited && !locks.is_inhibited();
                    prop_assert_eq!(change.is_some(), emptied);
                }
                if let Some(change) = change {
                    prop_assert_eq!(change.old, was_inhibited);
                    prop_assert_eq!(change.new, locks.is_inhibited());
                }
                prop_assert_eq!(locks.len(), model.len());
                for (key, refs) in &model {
                    prop_assert_eq!(locks.get(key).map(|l| l.refs), Some(*refs));
                }
            }
        }
    }
}
