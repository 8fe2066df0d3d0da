use std::time::Duration;

use mien_core::{AlbumCapacity, RecognitionScore};

/// Engine tuning, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum identify score for a positive match (0..=1000).
    pub recognition_threshold: RecognitionScore,
    /// A new identity is only enrolled when the best match falls this far
    /// below the recognition threshold.
    pub add_margin: RecognitionScore,
    /// How far below the threshold a lower-ranked named match may sit and
    /// still win over a session-only top match.
    pub second_best_margin: RecognitionScore,
    /// Minimum time between feature updates for the same identity.
    pub time_between_updates: Duration,
    /// Album geometry: total slots and samples per slot.
    pub capacity: AlbumCapacity,
    /// Maximum slots a single identity may accumulate across merges.
    pub max_slots_per_identity: usize,
    /// How many runner-up matches to retain per record for debugging.
    pub max_debug_matches: usize,
    /// Keep refreshing samples for named identities even when their slot
    /// is full, by replacing the weakest stored sample.
    pub enroll_when_full: bool,
    /// Use the detection's own timestamp instead of wall-clock time for
    /// enrollment bookkeeping.
    pub use_detection_timestamps: bool,
    /// Run feature extraction inline on the caller thread. Intended for
    /// tests and deterministic replay.
    pub synchronous: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recognition_threshold: 750,
            add_margin: 200,
            second_best_margin: 75,
            time_between_updates: Duration::from_secs(1),
            capacity: AlbumCapacity {
                slots: 100,
                samples_per_slot: 10,
            },
            max_slots_per_identity: 3,
            max_debug_matches: 2,
            enroll_when_full: false,
            use_detection_timestamps: false,
            synchronous: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `MIEN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            recognition_threshold: env_i32(
                "MIEN_RECOGNITION_THRESHOLD",
                defaults.recognition_threshold,
            ),
            add_margin: env_i32("MIEN_ADD_MARGIN", defaults.add_margin),
            second_best_margin: env_i32("MIEN_SECOND_BEST_MARGIN", defaults.second_best_margin),
            time_between_updates: Duration::from_millis(env_u64(
                "MIEN_UPDATE_INTERVAL_MS",
                defaults.time_between_updates.as_millis() as u64,
            )),
            capacity: AlbumCapacity {
                slots: env_usize("MIEN_ALBUM_SLOTS", defaults.capacity.slots),
                samples_per_slot: env_usize(
                    "MIEN_SAMPLES_PER_SLOT",
                    defaults.capacity.samples_per_slot,
                ),
            },
            max_slots_per_identity: env_usize(
                "MIEN_MAX_SLOTS_PER_IDENTITY",
                defaults.max_slots_per_identity,
            ),
            max_debug_matches: env_usize("MIEN_MAX_DEBUG_MATCHES", defaults.max_debug_matches),
            enroll_when_full: env_flag("MIEN_ENROLL_WHEN_FULL", defaults.enroll_when_full),
            use_detection_timestamps: env_flag(
                "MIEN_USE_DETECTION_TIMESTAMPS",
                defaults.use_detection_timestamps,
            ),
            synchronous: env_flag("MIEN_SYNCHRONOUS", defaults.synchronous),
        }
    }
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
