//! Session identifiers and per-visitor session tracking.
//!
//! A session ID is 128 bits: the high half is a salt that is rotated
//! periodically, the low half a per-process counter. Visitors are tracked by
//! an opaque key supplied at ingestion (e.g. a hash of address and user
//! agent); each tracked session remembers which paths it has seen so the
//! first hit on a path can be flagged as a first visit.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u128);

impl SessionId {
    pub const NIL: SessionId = SessionId(0);

    pub fn from_parts(salt: u64, counter: u64) -> Self {
        Self((u128::from(salt) << 64) | u128::from(counter))
    }

    pub fn salt(&self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub fn counter(&self) -> u64 {
        self.0 as u64
    }

    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:016x}", self.salt(), self.counter())
    }
}

#[derive(Debug)]
struct Salt {
    value: u64,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Tracked {
    id: SessionId,
    last_seen: DateTime<Utc>,
    paths: HashSet<i64>,
}

/// Session ID generator and visitor tracking state.
#[derive(Debug)]
pub struct Sessions {
    salt: RwLock<Salt>,
    counter: AtomicU64,
    tracked: Mutex<HashMap<String, Tracked>>,
    max_age: Duration,
    salt_rotation: Duration,
}

impl Sessions {
    pub fn new(max_age: Duration, salt_rotation: Duration) -> Self {
        Self::with_seed(rand::random(), rand::random::<u32>().into(), max_age, salt_rotation)
    }

    /// Deterministic salt and counter start.
    pub fn with_seed(salt: u64, counter: u64, max_age: Duration, salt_rotation: Duration) -> Self {
        Self {
            salt: RwLock::new(Salt {
                value: salt,
                created_at: Utc::now(),
            }),
            counter: AtomicU64::new(counter),
            tracked: Mutex::new(HashMap::new()),
            max_age,
            salt_rotation,
        }
    }

    /// A new ID under the current salt; the counter never repeats within a
    /// process.
    pub fn next_id(&self) -> SessionId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        SessionId::from_parts(self.salt.read().value, counter)
    }

    /// Rotate the salt once it is older than the rotation period. Returns
    /// whether it rotated.
    pub fn refresh_salt(&self, now: DateTime<Utc>) -> bool {
        let mut salt = self.salt.write();
        let age = (now - salt.created_at).to_std().unwrap_or_default();
        if age < self.salt_rotation {
            return false;
        }
        salt.value = new_salt(salt.value);
        salt.created_at = now;
        true
    }

    /// New salt, counter restarted, all tracked sessions forgotten.
    pub fn reset(&self) {
        {
            let mut salt = self.salt.write();
            salt.value = new_salt(salt.value);
            salt.created_at = Utc::now();
        }
        self.counter.store(rand::random::<u32>().into(), Ordering::Relaxed);
        self.tracked.lock().clear();
    }

    /// Session for a visitor key, and whether `path_id` is new for it.
    pub fn assign(&self, key: &str, path_id: i64, now: DateTime<Utc>) -> (SessionId, bool) {
        let mut tracked = self.tracked.lock();
        if let Some(session) = tracked.get_mut(key) {
            session.last_seen = now;
            let first_visit = session.paths.insert(path_id);
            return (session.id, first_visit);
        }

        let id = self.next_id();
        tracked.insert(
            key.to_string(),
            Tracked {
                id,
                last_seen: now,
                paths: HashSet::from([path_id]),
            },
        );
        (id, true)
    }

    /// Forget sessions not seen within the max age. Returns how many were
    /// dropped.
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        let mut tracked = self.tracked.lock();
        let before = tracked.len();
        tracked.retain(|_, s| now - s.last_seen <= max_age);
        before - tracked.len()
    }

    pub fn tracked(&self) -> usize {
        self.tracked.lock().len()
    }
}

fn new_salt(previous: u64) -> u64 {
    loop {
        let salt: u64 = rand::random();
        if salt != previous && salt != 0 {
            return salt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn seeded() -> Sessions {
        Sessions::with_seed(0x0011223344556677, 0x8899aabbccddef00, 4 * HOUR, 4 * HOUR)
    }

    #[test]
    fn test_next_id_sequence() {
        let sessions = seeded();
        let got: Vec<String> = (0..3).map(|_| sessions.next_id().to_string()).collect();
        assert_eq!(
            got,
            vec![
                "11223344556677-8899aabbccddef01",
                "11223344556677-8899aabbccddef02",
                "11223344556677-8899aabbccddef03",
            ]
        );
    }

    #[test]
    fn test_reset_changes_salt() {
        let sessions = seeded();
        let before = sessions.next_id();
        sessions.reset();
        let after = sessions.next_id();
        assert_ne!(before.salt(), after.salt());
    }

    #[test]
    fn test_refresh_salt_respects_rotation() {
        let sessions = seeded();
        let now = Utc::now();
        assert!(!sessions.refresh_salt(now));
        assert_eq!(sessions.next_id().salt(), 0x0011223344556677);

        assert!(sessions.refresh_salt(now + chrono::Duration::hours(5)));
        assert_ne!(sessions.next_id().salt(), 0x0011223344556677);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let sessions = Arc::new(seeded());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sessions = sessions.clone();
                std::thread::spawn(move || {
                    let mut ids: Vec<u64> = (0..1000).map(|_| sessions.next_id().counter()).collect();
                    // Each thread sees its own IDs in increasing order.
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids.sort_unstable();
                    ids
                })
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
    }

    #[test]
    fn test_assign_tracks_first_visit() {
        let sessions = seeded();
        let now = Utc::now();

        let (a, first) = sessions.assign("visitor", 1, now);
        assert!(first);
        let (b, first) = sessions.assign("visitor", 1, now);
        assert!(!first);
        assert_eq!(a, b);
        let (_, first) = sessions.assign("visitor", 2, now);
        assert!(first);

        let (c, _) = sessions.assign("other", 1, now);
        assert_ne!(a, c);
    }

    #[test]
    fn test_evict_stale_sessions() {
        let sessions = seeded();
        let now = Utc::now();
        sessions.assign("old", 1, now - chrono::Duration::hours(5));
        sessions.assign("new", 1, now);

        assert_eq!(sessions.evict(now), 1);
        assert_eq!(sessions.tracked(), 1);

        // An evicted visitor starts over; the hit counts as a first visit
        // again, never as a duplicate session.
        let (_, first) = sessions.assign("old", 1, now);
        assert!(first);
    }

    #[test]
    fn test_session_bytes() {
        let id = SessionId::from_parts(1, 2);
        assert_eq!(SessionId::from_bytes(id.to_bytes()), id);
        assert!(SessionId::NIL.is_nil());
    }
}
