/// Persisted list of recently-successful panel addresses.
///
/// The file holds at most [`CACHE_CAPACITY`] entries, unique by IP, sorted
/// by `last_ok` (unix seconds) descending:
///
/// ```json
/// {"candidates":[{"ip":"192.168.1.23","last_ok":1717000000}]}
/// ```
///
/// Reads fail soft: a missing or corrupt file yields an empty list, and
/// individually invalid entries are skipped. Writes go through a temp file
/// in the same directory followed by an atomic rename, so a crash mid-write
/// leaves the previous file intact.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const CACHE_CAPACITY: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub ip: Ipv4Addr,
    pub last_ok: u64,
}

#[derive(Serialize)]
struct CacheFile<'a> {
    candidates: &'a [CacheEntry],
}

#[derive(Deserialize)]
struct RawCacheFile {
    #[serde(default)]
    candidates: Vec<serde_json::Value>,
}

pub struct TargetCache {
    path: PathBuf,
}

impl TargetCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// IPs ordered most-recently-successful first, at most
    /// [`CACHE_CAPACITY`] of them. Never fails.
    pub fn load(&self) -> Vec<Ipv4Addr> {
        let mut entries = self.read_entries();
        entries.sort_by(|a, b| b.last_ok.cmp(&a.last_ok));

        let mut out = Vec::new();
        for e in entries {
            if !out.contains(&e.ip) {
                out.push(e.ip);
            }
            if out.len() == CACHE_CAPACITY {
                break;
            }
        }
        out
    }

    /// Record a successful probe of `ip`, moving it to the front with a
    /// fresh timestamp and truncating to capacity.
    pub fn record_success(&self, ip: Ipv4Addr) -> anyhow::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut entries = vec![CacheEntry { ip, last_ok: now }];
        for e in self.read_entries() {
            if e.ip != ip && !entries.iter().any(|x| x.ip == e.ip) {
                entries.push(e);
            }
        }
        // Stable sort keeps the fresh entry first on timestamp ties.
        entries.sort_by(|a, b| b.last_ok.cmp(&a.last_ok));
        entries.truncate(CACHE_CAPACITY);

        self.write_atomic(&entries)
    }

    fn read_entries(&self) -> Vec<CacheEntry> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let Ok(file) = serde_json::from_str::<RawCacheFile>(&raw) else {
            return Vec::new();
        };
        file.candidates
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    fn write_atomic(&self, entries: &[CacheEntry]) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        // The temp file must live in the target directory: rename is only
        // atomic within one filesystem.
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        serde_json::to_writer_pretty(tmp.as_file(), &CacheFile { candidates: entries })?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_in(dir: &tempfile::TempDir) -> TargetCache {
        TargetCache::new(dir.path().join("target_ips.json"))
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cache_in(&dir).load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        std::fs::write(dir.path().join("target_ips.json"), "{{{{").unwrap();
        assert!(cache.load().is_empty());
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        std::fs::write(
            dir.path().join("target_ips.json"),
            r#"{"candidates":[
                {"ip":"10.0.0.5","last_ok":100},
                {"ip":"not-an-ip","last_ok":200},
                {"last_ok":300},
                {"ip":"10.0.0.6","last_ok":"soon"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(cache.load(), vec![ip("10.0.0.5")]);
    }

    #[test]
    fn record_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        cache.record_success(ip("192.168.1.23")).unwrap();
        assert_eq!(cache.load(), vec![ip("192.168.1.23")]);
    }

    #[test]
    fn recording_twice_is_idempotent_modulo_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        cache.record_success(ip("10.0.0.5")).unwrap();
        cache.record_success(ip("10.0.0.5")).unwrap();
        assert_eq!(cache.load(), vec![ip("10.0.0.5")]);

        let raw = std::fs::read_to_string(dir.path().join("target_ips.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["candidates"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn newest_success_moves_to_front() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        std::fs::write(
            dir.path().join("target_ips.json"),
            r#"{"candidates":[{"ip":"10.0.0.1","last_ok":100},{"ip":"10.0.0.2","last_ok":50}]}"#,
        )
        .unwrap();

        cache.record_success(ip("10.0.0.2")).unwrap();
        assert_eq!(cache.load(), vec![ip("10.0.0.2"), ip("10.0.0.1")]);
    }

    #[test]
    fn capacity_is_bounded_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        for i in 1..=8u8 {
            cache
                .record_success(Ipv4Addr::new(10, 0, 0, i))
                .unwrap();
        }

        let ips = cache.load();
        assert_eq!(ips.len(), CACHE_CAPACITY);
        // Eight successes with ties broken by insertion: newest survive.
        assert_eq!(ips[0], ip("10.0.0.8"));

        let raw = std::fs::read_to_string(dir.path().join("target_ips.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let candidates = parsed["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), CACHE_CAPACITY);

        // sorted by last_ok descending, ips unique
        let times: Vec<u64> = candidates
            .iter()
            .map(|c| c["last_ok"].as_u64().unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn write_is_atomic_against_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        cache.record_success(ip("10.0.0.1")).unwrap();

        // No stray temp files remain next to the cache.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("target_ips.json")]);
    }

    #[test]
    fn parent_directory_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TargetCache::new(dir.path().join("deep").join("target_ips.json"));
        cache.record_success(ip("10.0.0.9")).unwrap();
        assert_eq!(cache.load(), vec![ip("10.0.0.9")]);
    }
}
