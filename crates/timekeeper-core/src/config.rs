use crate::duration::MAX_DURATION;
use crate::error::{Result, TimekeeperError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Placeholder in room target lists that resolves to the room a timer was
/// created in.
pub const ORIGIN_ROOM: &str = "@origin";

pub const DEFAULT_CONFIG_FILE: &str = "timekeeper.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Countdown handles owned by the external primitive system.
    #[serde(default = "default_handles")]
    pub handles: Vec<String>,
    /// Longest countdown, or extended countdown, the pool will run.
    #[serde(default = "default_max_timer")]
    pub max_timer_secs: u64,
}

fn default_handles() -> Vec<String> {
    (1..=10).map(|n| format!("timer.timekeeper_{n}")).collect()
}

fn default_max_timer() -> u64 {
    7 * 24 * 3600
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            handles: default_handles(),
            max_timer_secs: default_max_timer(),
        }
    }
}

impl PoolConfig {
    pub fn max_timer(&self) -> Duration {
        Duration::from_secs(self.max_timer_secs)
    }
}

// ---------------------------------------------------------------------------
// EscalationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wait after each tier before moving on: room, common areas, phones.
    #[serde(default = "default_stage_delays")]
    pub stage_delays_secs: [u64; 3],
    #[serde(default = "default_room_targets")]
    pub room_targets: Vec<String>,
    #[serde(default = "default_common_area_targets")]
    pub common_area_targets: Vec<String>,
    #[serde(default = "default_phone_targets")]
    pub phone_targets: Vec<String>,
    /// Upper bound on the final phone-tier wait.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    #[serde(default = "default_chime_sound")]
    pub chime_sound: String,
    /// Number of times each announcement is repeated.
    #[serde(default = "default_announce_repeat")]
    pub announce_repeat: u32,
}

fn default_true() -> bool {
    true
}

fn default_stage_delays() -> [u64; 3] {
    [60, 120, 300]
}

fn default_room_targets() -> Vec<String> {
    vec![ORIGIN_ROOM.to_string()]
}

fn default_common_area_targets() -> Vec<String> {
    vec!["kitchen".to_string(), "living_room".to_string()]
}

fn default_phone_targets() -> Vec<String> {
    vec!["mobile_app".to_string()]
}

fn default_max_duration() -> u64 {
    1800
}

fn default_chime_sound() -> String {
    "alarm".to_string()
}

fn default_announce_repeat() -> u32 {
    1
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            stage_delays_secs: default_stage_delays(),
            room_targets: default_room_targets(),
            common_area_targets: default_common_area_targets(),
            phone_targets: default_phone_targets(),
            max_duration_secs: default_max_duration(),
            chime_sound: default_chime_sound(),
            announce_repeat: default_announce_repeat(),
        }
    }
}

impl EscalationConfig {
    pub fn stage_delay(&self, tier: usize) -> Duration {
        self.stage_delays_secs
            .get(tier)
            .map(|s| Duration::from_secs(*s))
            .unwrap_or(Duration::ZERO)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    /// Room targets with the origin placeholder swapped for `origin`.
    ///
    /// A placeholder with no known origin is dropped.
    pub fn resolved_room_targets(&self, origin: Option<&str>) -> Vec<String> {
        resolve_origin(&self.room_targets, origin)
    }

    pub fn resolved_common_area_targets(&self, origin: Option<&str>) -> Vec<String> {
        resolve_origin(&self.common_area_targets, origin)
    }
}

fn resolve_origin(targets: &[String], origin: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(targets.len());
    for t in targets {
        let room = if t == ORIGIN_ROOM {
            match origin {
                Some(o) => o.to_string(),
                None => continue,
            }
        } else {
            t.clone()
        };
        if !out.contains(&room) {
            out.push(room);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// Extra target keyword → domain entries merged over the built-in table.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub domains: HashMap<String, String>,
    /// Room used when a command arrives without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_room: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        tracing::debug!(path = %path.display(), handles = cfg.pool.handles.len(), "loaded config");
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Load and refuse configs with error-level warnings.
    pub fn load_validated(path: &Path) -> Result<Self> {
        let cfg = Self::load_or_default(path)?;
        let errors: Vec<String> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(TimekeeperError::InvalidConfig(errors.join("; ")));
        }
        Ok(cfg)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.pool.handles.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "pool.handles is empty: no timers can be created".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for handle in &self.pool.handles {
            if !seen.insert(handle.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("duplicate pool handle '{handle}'"),
                });
            }
        }

        if self.pool.max_timer_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "pool.max_timer_secs is 0: every timer would be refused".to_string(),
            });
        } else if self.pool.max_timer() > MAX_DURATION {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "pool.max_timer_secs={} is longer than any spoken duration can be ({})",
                    self.pool.max_timer_secs,
                    MAX_DURATION.as_secs()
                ),
            });
        }

        let esc = &self.escalation;
        for (tier, secs) in esc.stage_delays_secs.iter().enumerate() {
            if *secs == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "escalation stage {} delay is 0: that tier gets no time to be acknowledged",
                        tier + 1
                    ),
                });
            }
        }

        if esc.max_duration_secs < esc.stage_delays_secs[2] {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "escalation.max_duration_secs={} cuts the phone stage short (stage delay {})",
                    esc.max_duration_secs, esc.stage_delays_secs[2]
                ),
            });
        }

        if esc.enabled && esc.phone_targets.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "escalation.phone_targets is empty: the phone stage notifies nobody"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
