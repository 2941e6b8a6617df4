//! Progress parsers and trackers.
//!
//! Three flavors share one text-parsing core: the firmware tracker (tqdm-like
//! download/extract counters keyed by `MODEL_CSC`), the repo tracker (git
//! percent/speed lines with caller-set stages) and the build tracker, which
//! is the firmware tracker carrying the source and target firmware keys.
//! Chunks may be split across CR/LF; trackers slice on both.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;

use uwb_broker::{BuildProgressStore, FirmwareProgressStore, RepoProgressStore};
use uwb_core::progress::{ProgressPhase, ProgressStatus, ProgressUpdate, RepoStage};

use crate::supervisor::ChunkConsumer;

static RE_CACHE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(SM-[A-Z0-9]+_[A-Z0-9]+)").expect("static regex"));
static RE_MODEL_CSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(SM-[A-Z0-9]+)[/_]([A-Z0-9]{2,4})").expect("static regex"));
static RE_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("static regex"));
static RE_BYTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*([KMGTP]?i?B)\s*/\s*(\d+(?:\.\d+)?)\s*([KMGTP]?i?B)")
        .expect("static regex")
});
static RE_SPEED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*([KMGTP]?i?B)/s").expect("static regex"));
static RE_ELAPSED_ETA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d{1,2}:\d{2}(?::\d{2})?)<(\d{1,2}:\d{2}(?::\d{2})?)").expect("static regex")
});

/// Re-emit suppression window for an unchanged percent on one key.
const DEDUP_WINDOW: Duration = Duration::from_millis(900);

/// Normalize `KiB`/`KB`-style units to bytes (base-2 scales, truncating).
pub fn to_bytes(number: f64, unit: &str) -> u64 {
    let normalized = unit.trim().to_uppercase().replace("IB", "B");
    let scale: u64 = match normalized.as_str() {
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1u64 << 40,
        "PB" => 1u64 << 50,
        _ => 1,
    };
    (number * scale as f64) as u64
}

/// `MM:SS` / `HH:MM:SS` to seconds.
fn parse_hms(value: &str) -> u64 {
    let parts: Vec<u64> = value.split(':').filter_map(|x| x.parse().ok()).collect();
    match parts.as_slice() {
        [mm, ss] => mm * 60 + ss,
        [hh, mm, ss] => hh * 3600 + mm * 60 + ss,
        _ => 0,
    }
}

/// Fields parsed out of one progress line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedProgress {
    pub percent: Option<u8>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<u64>,
    pub elapsed_sec: Option<u64>,
    pub eta_sec: Option<u64>,
}

/// Parse a tqdm-like line. A line contributes only when a percent token or a
/// byte pair is present; the byte ratio backfills percent when the token is
/// absent.
pub fn parse_progress(text: &str) -> Option<ParsedProgress> {
    if text.is_empty() {
        return None;
    }
    let pct_match = RE_PERCENT.captures(text);
    let bytes_match = RE_BYTES.captures(text);
    if pct_match.is_none() && bytes_match.is_none() {
        return None;
    }

    let mut parsed = ParsedProgress::default();
    if let Some(captures) = &pct_match {
        let pct: u32 = captures[1].parse().unwrap_or(0);
        parsed.percent = Some(pct.min(100) as u8);
    }
    if let Some(captures) = &bytes_match {
        let done = to_bytes(captures[1].parse().unwrap_or(0.0), &captures[2]);
        let total = to_bytes(captures[3].parse().unwrap_or(0.0), &captures[4]);
        parsed.downloaded_bytes = Some(done);
        parsed.total_bytes = Some(total);
        if parsed.percent.is_none() && total > 0 {
            parsed.percent = Some(((done as f64 / total as f64) * 100.0).min(100.0) as u8);
        }
    }
    if let Some(captures) = RE_SPEED.captures(text) {
        parsed.speed_bps = Some(to_bytes(captures[1].parse().unwrap_or(0.0), &captures[2]));
    }
    if let Some(captures) = RE_ELAPSED_ETA.captures(text) {
        parsed.elapsed_sec = Some(parse_hms(&captures[1]));
        parsed.eta_sec = Some(parse_hms(&captures[2]));
    }
    Some(parsed)
}

/// Pull a firmware key out of a log line, preferring an explicit `MODEL_CSC`
/// token, then a `MODEL/CSC` pair, then any known key mentioned verbatim.
fn guess_fw_key(text: &str, known_keys: &[String]) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    if let Some(captures) = RE_CACHE_KEY.captures(text) {
        return Some(captures[1].to_uppercase());
    }
    if let Some(captures) = RE_MODEL_CSC.captures(text) {
        return Some(format!(
            "{}_{}",
            captures[1].to_uppercase(),
            captures[2].to_uppercase()
        ));
    }
    let upper = text.to_uppercase();
    known_keys
        .iter()
        .find(|key| !key.is_empty() && upper.contains(key.as_str()))
        .cloned()
}

/// Where a firmware tracker publishes: the firmware map alone, or the
/// firmware map plus the per-job build stream.
enum Sink {
    Firmware(FirmwareProgressStore),
    FirmwareAndBuild(FirmwareProgressStore, BuildProgressStore),
}

impl Sink {
    async fn set(&self, fw_key: &str, job_id: &str, update: ProgressUpdate) {
        match self {
            Self::Firmware(fw) => fw.set(fw_key, update).await,
            Self::FirmwareAndBuild(fw, build) => {
                fw.set(fw_key, update.clone()).await;
                build.set(job_id, update).await;
            }
        }
    }
}

/// Publishes tqdm-style progress into the shared store, with per-key
/// dedup and heartbeats while the log is silent.
pub struct FirmwareProgressTracker {
    job_id: String,
    known_keys: Vec<String>,
    current_key: String,
    started_keys: HashSet<String>,
    last_emit: HashMap<String, (i64, Instant)>,
    started_at: HashMap<String, Instant>,
    phase: ProgressPhase,
    sink: Sink,
}

impl FirmwareProgressTracker {
    /// A tracker for firmware extract/download operations.
    pub fn new(
        store: FirmwareProgressStore,
        job_id: impl Into<String>,
        known_keys: Vec<String>,
        phase: ProgressPhase,
    ) -> Self {
        Self::with_sink(Sink::Firmware(store), job_id, known_keys, phase)
    }

    /// The build flavor: hosts the source and target firmware keys and
    /// mirrors every update onto the per-job build stream.
    pub fn for_build(
        firmware: FirmwareProgressStore,
        build: BuildProgressStore,
        job_id: impl Into<String>,
        known_keys: Vec<String>,
    ) -> Self {
        Self::with_sink(
            Sink::FirmwareAndBuild(firmware, build),
            job_id,
            known_keys,
            ProgressPhase::Download,
        )
    }

    fn with_sink(
        sink: Sink,
        job_id: impl Into<String>,
        known_keys: Vec<String>,
        phase: ProgressPhase,
    ) -> Self {
        let known_keys: Vec<String> =
            known_keys.into_iter().filter(|k| !k.is_empty()).collect();
        // With a single known key the current key is implicit.
        let current_key = if known_keys.len() == 1 {
            known_keys[0].clone()
        } else {
            String::new()
        };
        Self {
            job_id: job_id.into(),
            known_keys,
            current_key,
            started_keys: HashSet::new(),
            last_emit: HashMap::new(),
            started_at: HashMap::new(),
            phase,
            sink,
        }
    }

    fn base_update(&self) -> ProgressUpdate {
        let mut update = ProgressUpdate::progress(ProgressStatus::Running);
        update.phase = Some(self.phase);
        update.job_id = Some(self.job_id.clone());
        update
    }

    /// Feed a raw output chunk; lines may be split across CR and LF.
    pub async fn feed_text(&mut self, text: &str) {
        for part in text.split(['\r', '\n']) {
            let line = part.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(guessed) = guess_fw_key(line, &self.known_keys) {
                self.current_key = guessed;
            }
            let Some(parsed) = parse_progress(line) else {
                continue;
            };
            if self.current_key.is_empty() {
                continue;
            }
            let key = self.current_key.clone();

            let pct = parsed.percent.map_or(-1, i64::from);
            let now = Instant::now();
            if let Some((last_pct, last_at)) = self.last_emit.get(&key) {
                if pct >= 0 && pct == *last_pct && now.duration_since(*last_at) < DEDUP_WINDOW {
                    continue;
                }
            }
            self.last_emit.insert(key.clone(), (pct, now));
            self.started_keys.insert(key.clone());
            let started = *self.started_at.entry(key.clone()).or_insert(now);

            let mut update = self.base_update();
            update.percent = parsed.percent;
            update.downloaded_bytes = parsed.downloaded_bytes;
            update.total_bytes = parsed.total_bytes;
            update.speed_bps = parsed.speed_bps;
            update.eta_sec = parsed.eta_sec;
            update.elapsed_sec =
                Some(parsed.elapsed_sec.unwrap_or_else(|| now.duration_since(started).as_secs()));
            self.sink.set(&key, &self.job_id, update).await;
        }
    }

    /// Keep the UI alive when the child prints nothing (extract phases are
    /// often silent for minutes).
    pub async fn emit_heartbeat(&mut self) {
        let targets: Vec<String> = if self.started_keys.is_empty() {
            self.known_keys.clone()
        } else {
            self.started_keys.iter().cloned().collect()
        };
        let now = Instant::now();
        for key in targets {
            let started = *self.started_at.entry(key.clone()).or_insert(now);
            let last_pct = self.last_emit.get(&key).map_or(0, |(pct, _)| (*pct).max(0));

            let mut update = self.base_update();
            update.percent = Some(last_pct.clamp(0, 100) as u8);
            update.elapsed_sec = Some(now.duration_since(started).as_secs());
            self.sink.set(&key, &self.job_id, update).await;
        }
    }

    /// Final state: completed pins 100%, failed keeps the last observed
    /// percent (no fabrication).
    pub async fn finalize(&mut self, ok: bool) {
        let mut targets: Vec<String> = if self.started_keys.is_empty() {
            self.known_keys.clone()
        } else {
            self.started_keys.iter().cloned().collect()
        };
        targets.sort();
        for key in targets {
            let mut update = self.base_update();
            update.status = Some(if ok {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Failed
            });
            update.percent = Some(if ok {
                100
            } else {
                self.last_emit.get(&key).map_or(0, |(pct, _)| (*pct).clamp(0, 100) as u8)
            });
            self.sink.set(&key, &self.job_id, update).await;
        }
    }
}

#[async_trait]
impl ChunkConsumer for FirmwareProgressTracker {
    async fn feed(&mut self, chunk: &str) {
        self.feed_text(chunk).await;
    }

    async fn heartbeat(&mut self) {
        self.emit_heartbeat().await;
    }
}

/// Consumer for repo operations: per-line percent/speed, elapsed from wall
/// clock, ETA extrapolated as `elapsed * (100 - pct) / pct`. The stage is set
/// by the caller when launching each phase, never parsed from output.
pub struct RepoCommandConsumer {
    store: RepoProgressStore,
    stage: RepoStage,
    title: String,
    started_at: Instant,
}

impl RepoCommandConsumer {
    pub fn new(store: RepoProgressStore, stage: RepoStage, title: impl Into<String>) -> Self {
        Self {
            store,
            stage,
            title: title.into(),
            started_at: Instant::now(),
        }
    }

    fn base_update(&self) -> ProgressUpdate {
        let mut update = ProgressUpdate::progress(ProgressStatus::Running);
        update.stage = Some(self.stage);
        update.title = Some(self.title.clone());
        update
    }

    /// Announce the phase before any output arrives.
    pub async fn start(&self) {
        let mut update = self.base_update();
        update.percent = Some(0);
        update.elapsed_sec = Some(0);
        self.store.set(update).await;
    }

    /// Publish the final completed slot with a summary title.
    pub async fn complete(store: &RepoProgressStore, stage: RepoStage, title: &str) {
        let mut update = ProgressUpdate::progress(ProgressStatus::Completed);
        update.stage = Some(stage);
        update.title = Some(title.to_string());
        update.percent = Some(100);
        store.set(update).await;
    }

    fn parse_line(&self, line: &str) -> ProgressUpdate {
        let mut update = self.base_update();
        update.message = Some(line.to_string());

        let elapsed = self.started_at.elapsed().as_secs();
        update.elapsed_sec = Some(elapsed);

        if let Some(captures) = RE_PERCENT.captures(line) {
            let pct: u32 = captures[1].parse().unwrap_or(0);
            let pct = pct.min(100) as u8;
            update.percent = Some(pct);
            if pct > 0 && pct < 100 {
                update.eta_sec = Some(elapsed * u64::from(100 - pct) / u64::from(pct));
            }
        }
        if let Some(captures) = RE_SPEED.captures(line) {
            update.speed_bps = Some(to_bytes(captures[1].parse().unwrap_or(0.0), &captures[2]));
        }
        update
    }
}

#[async_trait]
impl ChunkConsumer for RepoCommandConsumer {
    async fn feed(&mut self, chunk: &str) {
        for part in chunk.split(['\r', '\n']) {
            let line = part.trim();
            if line.is_empty() {
                continue;
            }
            let update = self.parse_line(line);
            self.store.set(update).await;
        }
    }

    async fn heartbeat(&mut self) {
        // Repo phases are short; the per-line updates carry the clock.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uwb_broker::MemoryBus;

    #[test]
    fn byte_units_are_base2_and_truncating() {
        assert_eq!(to_bytes(1.0, "B"), 1);
        assert_eq!(to_bytes(1.0, "KiB"), 1024);
        assert_eq!(to_bytes(1.0, "KB"), 1024);
        assert_eq!(to_bytes(3.2, "MiB"), 3_355_443);
        assert_eq!(to_bytes(4.1, "GiB"), 4_402_341_478);
        assert_eq!(to_bytes(2.0, "TB"), 2 * (1u64 << 40));
        assert_eq!(to_bytes(1.0, "PiB"), 1u64 << 50);
        assert_eq!(to_bytes(5.0, "?"), 5);
    }

    #[test]
    fn parses_the_full_tqdm_line() {
        let parsed = parse_progress("15%  3.2MiB/4.1GiB 2.1MiB/s [00:10<05:12]").unwrap();
        assert_eq!(parsed.percent, Some(15));
        assert_eq!(parsed.downloaded_bytes, Some(3_355_443));
        assert_eq!(parsed.total_bytes, Some(4_402_341_478));
        assert_eq!(parsed.speed_bps, Some(2_202_009));
        assert_eq!(parsed.elapsed_sec, Some(10));
        assert_eq!(parsed.eta_sec, Some(312));
    }

    #[test]
    fn percent_backfills_from_byte_ratio() {
        let parsed = parse_progress("512MiB/1GiB downloading").unwrap();
        assert_eq!(parsed.percent, Some(50));
    }

    #[test]
    fn line_without_progress_tokens_is_ignored() {
        assert!(parse_progress("Checking out files...").is_none());
        assert!(parse_progress("").is_none());
    }

    #[test]
    fn hms_parsing() {
        assert_eq!(parse_hms("00:10"), 10);
        assert_eq!(parse_hms("05:12"), 312);
        assert_eq!(parse_hms("1:02:03"), 3723);
        assert_eq!(parse_hms("bogus"), 0);
    }

    #[test]
    fn fw_key_guessing_prefers_explicit_key() {
        let known = vec!["SM-S901B_EUX".to_string()];
        assert_eq!(
            guess_fw_key("downloading sm-s901b_eux firmware", &known).as_deref(),
            Some("SM-S901B_EUX")
        );
        assert_eq!(
            guess_fw_key("fetch SM-S911B/EUX now", &known).as_deref(),
            Some("SM-S911B_EUX")
        );
        assert_eq!(guess_fw_key("no key here", &known), None);
    }

    fn stores() -> (FirmwareProgressStore, BuildProgressStore) {
        let bus: Arc<dyn uwb_core::ports::Bus> = Arc::new(MemoryBus::new());
        (
            FirmwareProgressStore::new(bus.clone()),
            BuildProgressStore::new(bus),
        )
    }

    #[tokio::test]
    async fn tracker_publishes_single_snapshot_for_scenario_line() {
        let (firmware, _) = stores();
        let mut tracker = FirmwareProgressTracker::new(
            firmware.clone(),
            "job-1",
            vec!["SM-S901B_EUX".to_string()],
            ProgressPhase::Download,
        );

        tracker
            .feed_text("15%  3.2MiB/4.1GiB 2.1MiB/s [00:10<05:12]\n")
            .await;

        let snapshot = firmware.list().await;
        assert_eq!(snapshot.len(), 1);
        let entry = &snapshot["SM-S901B_EUX"];
        assert_eq!(entry["percent"], 15);
        assert_eq!(entry["downloaded_bytes"], 3_355_443u64);
        assert_eq!(entry["total_bytes"], 4_402_341_478u64);
        assert_eq!(entry["speed_bps"], 2_202_009u64);
        assert_eq!(entry["elapsed_sec"], 10);
        assert_eq!(entry["eta_sec"], 312);
        assert_eq!(entry["phase"], "download");
        assert_eq!(entry["job_id"], "job-1");
        assert_eq!(entry["status"], "running");
    }

    #[tokio::test]
    async fn identical_percent_within_window_is_emitted_once() {
        let (firmware, _) = stores();
        let mut tracker = FirmwareProgressTracker::new(
            firmware.clone(),
            "job-1",
            vec!["SM-S901B_EUX".to_string()],
            ProgressPhase::Download,
        );
        let mut rx = firmware.subscribe().await;

        tracker.feed_text("15% 1.0MiB/4.0GiB\n").await;
        tracker.feed_text("15% 1.1MiB/4.0GiB\n").await;

        // First emission arrives...
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["percent"], 15);
        // ...the duplicate within 900 ms does not.
        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn finalize_failed_keeps_last_percent() {
        let (firmware, _) = stores();
        let mut tracker = FirmwareProgressTracker::new(
            firmware.clone(),
            "job-1",
            vec!["SM-S901B_EUX".to_string()],
            ProgressPhase::Extract,
        );
        tracker.feed_text("42% 1.0GiB/2.4GiB\n").await;
        tracker.finalize(false).await;

        let snapshot = firmware.list().await;
        let entry = &snapshot["SM-S901B_EUX"];
        assert_eq!(entry["status"], "failed");
        assert_eq!(entry["percent"], 42);
    }

    #[tokio::test]
    async fn finalize_success_pins_100() {
        let (firmware, _) = stores();
        let mut tracker = FirmwareProgressTracker::new(
            firmware.clone(),
            "job-1",
            vec!["SM-S901B_EUX".to_string()],
            ProgressPhase::Download,
        );
        tracker.feed_text("97% 4.0GiB/4.1GiB\n").await;
        tracker.finalize(true).await;

        let entry = &firmware.list().await["SM-S901B_EUX"];
        assert_eq!(entry["status"], "completed");
        assert_eq!(entry["percent"], 100);
    }

    #[tokio::test]
    async fn build_tracker_mirrors_to_build_stream() {
        let (firmware, build) = stores();
        let mut tracker = FirmwareProgressTracker::for_build(
            firmware.clone(),
            build.clone(),
            "job-7",
            vec!["SM-S901B_EUX".to_string(), "SM-S911B_EUX".to_string()],
        );

        tracker
            .feed_text("SM-S911B_EUX 20% 1.0MiB/5.0MiB\n")
            .await;

        assert!(firmware.list().await.contains_key("SM-S911B_EUX"));
        let build_map = build.list().await;
        assert_eq!(build_map["job-7"]["percent"], 20);
    }

    #[tokio::test]
    async fn repo_consumer_extrapolates_eta() {
        let bus: Arc<dyn uwb_core::ports::Bus> = Arc::new(MemoryBus::new());
        let store = RepoProgressStore::new(bus);
        let mut consumer =
            RepoCommandConsumer::new(store.clone(), RepoStage::Clone, "Clone origin");
        consumer.start().await;
        consumer
            .feed("Receiving objects:  25% (2500/10000), 1.5MiB/s\n")
            .await;

        let slot = store.get().await.unwrap();
        assert_eq!(slot["stage"], "clone");
        assert_eq!(slot["percent"], 25);
        assert_eq!(slot["speed_bps"], 1_572_864u64);
        // elapsed is ~0 in tests, so the extrapolated ETA collapses to 0.
        assert_eq!(slot["eta_sec"], 0);
    }
}
