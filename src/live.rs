//! Class freshness fingerprints and the caches keyed on them.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::EngineConfig;
use crate::db::EPOCH_TS;
use crate::error::GradeResult;
use crate::store::active_structure;
use crate::structure::{self, GroupedStructure, NormalizedRow};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// SHA-256 over every freshness signal that can move a class's grades.
pub fn fingerprint(conn: &Connection, class_id: &str) -> GradeResult<String> {
    let (structure_updated, structure_version): (String, i64) = conn.query_row(
        "SELECT COALESCE(MAX(updated_at), ?), COALESCE(MAX(version), 0)
         FROM grade_structures
         WHERE class_id = ? AND is_active = 1",
        (EPOCH_TS, class_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let class_updated: String = conn
        .query_row("SELECT updated_at FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?
        .unwrap_or_else(|| EPOCH_TS.to_string());
    let (enrolled, max_joined): (i64, String) = conn.query_row(
        "SELECT COUNT(1), COALESCE(MAX(joined_at), ?) FROM student_classes WHERE class_id = ?",
        (EPOCH_TS, class_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let (score_count, max_score_updated): (i64, String) = conn.query_row(
        "SELECT COUNT(1), COALESCE(MAX(ss.updated_at), ?)
         FROM student_scores ss
         WHERE ss.student_id IN (SELECT student_id FROM student_classes WHERE class_id = ?)",
        (EPOCH_TS, class_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let max_info_updated: String = conn.query_row(
        "SELECT COALESCE(MAX(pi.updated_at), ?)
         FROM personal_info pi
         JOIN students s ON s.personal_info_id = pi.id
         JOIN student_classes sc ON sc.student_id = s.id
         WHERE sc.class_id = ?",
        (EPOCH_TS, class_id),
        |r| r.get(0),
    )?;

    let payload = [
        structure_updated,
        structure_version.to_string(),
        class_updated,
        enrolled.to_string(),
        max_joined,
        score_count.to_string(),
        max_score_updated,
        max_info_updated,
    ]
    .join("|");

    let digest = Sha256::digest(payload.as_bytes());
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Per-class fingerprint memo reused for a short TTL so polling clients do
/// not rerun the freshness queries on every request.
pub struct LiveVersionCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl LiveVersionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_compute<F>(&self, class_id: &str, compute: F) -> GradeResult<String>
    where
        F: FnOnce() -> GradeResult<String>,
    {
        let now = self.clock.now();
        if let Some((version, at)) = self.entries.lock().get(class_id) {
            if now.saturating_duration_since(*at) < self.ttl {
                return Ok(version.clone());
            }
        }
        let version = compute()?;
        self.entries
            .lock()
            .insert(class_id.to_string(), (version.clone(), now));
        Ok(version)
    }

    pub fn invalidate(&self, class_id: &str) {
        self.entries.lock().remove(class_id);
    }
}

struct Slot<T> {
    value: T,
    inserted_at: Instant,
    seq: u64,
}

struct Slots<T> {
    map: HashMap<String, Slot<T>>,
    next_seq: u64,
}

/// Bounded map that evicts the single oldest insertion when full.
pub struct ResultCache<T> {
    name: &'static str,
    capacity: usize,
    clock: Arc<dyn Clock>,
    slots: Mutex<Slots<T>>,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(name: &'static str, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            clock,
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.slots.lock().map.get(key).map(|s| s.value.clone())
    }

    pub fn put(&self, key: String, value: T) {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        if !slots.map.contains_key(&key) && slots.map.len() >= self.capacity {
            let oldest = slots
                .map
                .iter()
                .min_by_key(|(_, s)| (s.inserted_at, s.seq))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                slots.map.remove(&oldest);
                debug!(
                    cache = self.name,
                    key = %oldest,
                    capacity = self.capacity,
                    "evicted oldest entry"
                );
            }
        }
        let seq = slots.next_seq;
        slots.next_seq += 1;
        slots.map.insert(
            key,
            Slot {
                value,
                inserted_at: now,
                seq,
            },
        );
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().map.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cached<T> {
    pub version: String,
    pub hit: bool,
    pub value: T,
}

/// The caches owned by the application state.
pub struct LiveCaches {
    pub versions: LiveVersionCache,
    pub normalized: ResultCache<Vec<NormalizedRow>>,
    pub grouped: ResultCache<GroupedStructure>,
}

impl LiveCaches {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            versions: LiveVersionCache::new(
                Duration::from_millis(config.live_version_ttl_ms),
                clock.clone(),
            ),
            normalized: ResultCache::new("normalized", config.result_cache_capacity, clock.clone()),
            grouped: ResultCache::new("grouped", config.result_cache_capacity, clock),
        }
    }

    pub fn live_version(&self, conn: &Connection, class_id: &str) -> GradeResult<String> {
        self.versions
            .get_or_compute(class_id, || fingerprint(conn, class_id))
    }

    /// Drops the memoized fingerprint so the next read sees a write made
    /// through this process immediately.
    pub fn invalidate_class(&self, class_id: &str) {
        self.versions.invalidate(class_id);
    }

    pub fn normalized_structure(
        &self,
        conn: &Connection,
        class_id: &str,
    ) -> GradeResult<Cached<Vec<NormalizedRow>>> {
        let version = self.live_version(conn, class_id)?;
        let key = format!("{}:{}", class_id, version);
        if let Some(value) = self.normalized.get(&key) {
            return Ok(Cached {
                version,
                hit: true,
                value,
            });
        }
        let value = active_normalized(conn, class_id)?;
        self.normalized.put(key, value.clone());
        Ok(Cached {
            version,
            hit: false,
            value,
        })
    }

    pub fn grouped_structure(
        &self,
        conn: &Connection,
        class_id: &str,
    ) -> GradeResult<Cached<GroupedStructure>> {
        let version = self.live_version(conn, class_id)?;
        let key = format!("{}:{}", class_id, version);
        if let Some(value) = self.grouped.get(&key) {
            return Ok(Cached {
                version,
                hit: true,
                value,
            });
        }
        let value = structure::group(&active_normalized(conn, class_id)?);
        self.grouped.put(key, value.clone());
        Ok(Cached {
            version,
            hit: false,
            value,
        })
    }
}

// No active structure normalizes to no rows.
fn active_normalized(conn: &Connection, class_id: &str) -> GradeResult<Vec<NormalizedRow>> {
    match active_structure(conn, class_id)? {
        Some(row) => Ok(structure::normalize(&row.definition()?)),
        None => Ok(Vec::new()),
    }
}


#[cfg(test)]
mod tests {
    use super::test_clock::ManualClock;
    use super::*;
    use crate::db::{now_ts, open_in_memory};
    use crate::store::test_support::{insert_active_structure, insert_class, insert_student};
    use serde_json::json;
    use std::cell::Cell;

    fn definition(sub: &str) -> serde_json::Value {
        json!({
            "LECTURE": [
                { "name": sub, "weight": 100, "assessments": [ { "name": "Q1", "max_score": 10 } ] }
            ],
            "LABORATORY": []
        })
    }

    #[test]
    fn micro_cache_honours_ttl() {
        let clock = ManualClock::new();
        let cache = LiveVersionCache::new(Duration::from_millis(2_000), clock.clone());
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok(format!("v{}", calls.get()))
        };

        assert_eq!(cache.get_or_compute("c1", compute).expect("first"), "v1");
        clock.advance(Duration::from_millis(1_999));
        assert_eq!(cache.get_or_compute("c1", compute).expect("cached"), "v1");
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get_or_compute("c1", compute).expect("expired"), "v2");

        cache.invalidate("c1");
        assert_eq!(cache.get_or_compute("c1", compute).expect("invalidated"), "v3");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn result_cache_evicts_oldest_insertion() {
        let clock = ManualClock::new();
        let cache: ResultCache<i32> = ResultCache::new("test", 2, clock.clone());
        cache.put("a".into(), 1);
        clock.advance(Duration::from_millis(5));
        cache.put("b".into(), 2);
        cache.put("a".into(), 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));

        // "b" is now the oldest insertion.
        cache.put("c".into(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn same_instant_insertions_evict_in_order() {
        let clock = ManualClock::new();
        let cache: ResultCache<&str> = ResultCache::new("test", 2, clock);
        cache.put("x".into(), "x");
        cache.put("y".into(), "y");
        cache.put("z".into(), "z");
        assert_eq!(cache.get("x"), None);
        assert_eq!(cache.get("y"), Some("y"));
    }

    #[test]
    fn fingerprint_tracks_only_the_affected_class() {
        let conn = open_in_memory().expect("db");
        insert_class(&conn, "c1");
        insert_class(&conn, "c2");
        insert_student(&conn, "st1", "c1");
        insert_student(&conn, "st2", "c2");
        insert_active_structure(&conn, "c1", "s1", &definition("Quizzes"));
        let before_c1 = fingerprint(&conn, "c1").expect("c1");
        let before_c2 = fingerprint(&conn, "c2").expect("c2");
        assert_eq!(before_c1, fingerprint(&conn, "c1").expect("stable"));
        assert_eq!(before_c1.len(), 64);

        crate::materialize::materialize(&conn, "s1", Default::default()).expect("materialize");
        let sub: String = conn
            .query_row("SELECT id FROM grade_subcategories LIMIT 1", [], |r| r.get(0))
            .expect("sub");
        conn.execute(
            "INSERT INTO grade_assessments(
                id, subcategory_id, name, max_score, position, created_at
             ) VALUES('a1', ?, 'Q1', 10, 1, ?)",
            (&sub, now_ts()),
        )
        .expect("assessment");
        conn.execute(
            "INSERT INTO student_scores(id, assessment_id, student_id, score, updated_at)
             VALUES('sc1', 'a1', 'st1', 7, ?)",
            [now_ts()],
        )
        .expect("score");

        assert_ne!(fingerprint(&conn, "c1").expect("c1 after"), before_c1);
        assert_eq!(fingerprint(&conn, "c2").expect("c2 after"), before_c2);
    }

    #[test]
    fn normalized_cache_hits_until_a_new_structure_lands() {
        let conn = open_in_memory().expect("db");
        insert_class(&conn, "c1");
        insert_active_structure(&conn, "c1", "s1", &definition("Quizzes"));
        let caches = LiveCaches::new(&EngineConfig::default(), ManualClock::new());

        let first = caches.normalized_structure(&conn, "c1").expect("first");
        let second = caches.normalized_structure(&conn, "c1").expect("second");
        assert!(!first.hit);
        assert!(second.hit);
        assert_eq!(first.value, second.value);
        assert_eq!(first.value[0].name, "Quizzes");

        insert_active_structure(&conn, "c1", "s2", &definition("Exams"));
        caches.invalidate_class("c1");
        let third = caches.normalized_structure(&conn, "c1").expect("third");
        assert!(!third.hit);
        assert_ne!(third.version, first.version);
        assert_eq!(third.value[0].name, "Exams");

        let grouped = caches.grouped_structure(&conn, "c1").expect("grouped");
        assert_eq!(grouped.value.strings[0].name, "Exams");
        assert_eq!(grouped.value.numbers[0].max_score, 10.0);
    }

    #[test]
    fn class_without_structure_normalizes_to_nothing() {
        let conn = open_in_memory().expect("db");
        insert_class(&conn, "c1");
        let caches = LiveCaches::new(&EngineConfig::default(), Arc::new(SystemClock));
        assert!(caches.normalized_structure(&conn, "c1").expect("rows").value.is_empty());
    }
}
