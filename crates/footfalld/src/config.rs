use footfall_core::PipelineConfig;
use footfall_hw::CameraConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `replay_fps`.
pub const MAX_REPLAY_FPS: f32 = 1000.0;
/// Upper bound for `reconnect_delay_secs`.
pub const MAX_RECONNECT_DELAY_SECS: f32 = 3600.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CameraSection {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraSection {
    fn default() -> Self {
        let camera = CameraConfig::default();
        Self {
            device: camera.device,
            width: camera.width,
            height: camera.height,
        }
    }
}

impl From<&CameraSection> for CameraConfig {
    fn from(c: &CameraSection) -> Self {
        CameraConfig {
            device: c.device.clone(),
            width: c.width,
            height: c.height,
        }
    }
}

/// Daemon configuration: TOML file, then `FOOTFALL_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraSection,
    /// Directory holding `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    /// Where face crops of new visitors are written; empty disables saving.
    pub snapshot_dir: PathBuf,
    /// Replay this image directory instead of opening the camera.
    pub replay_dir: Option<PathBuf>,
    /// Replay pacing in frames per second (0 = as fast as possible).
    pub replay_fps: f32,
    /// Consecutive frame read failures before the source is reset.
    pub reconnect_after_failures: u32,
    pub reconnect_delay_secs: f32,
    /// When set, the top ranked crops of every finished session are written here.
    pub debug_dir: Option<PathBuf>,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        let db_path = footfall_store::default_db_path();
        let snapshot_dir = db_path.with_file_name("snapshots");
        Self {
            camera: CameraSection::default(),
            model_dir: footfall_core::default_model_dir(),
            db_path,
            snapshot_dir,
            replay_dir: None,
            replay_fps: 15.0,
            reconnect_after_failures: 10,
            reconnect_delay_secs: 2.0,
            debug_dir: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// `$FOOTFALL_CONFIG`, else `$XDG_CONFIG_HOME/footfall/footfall.toml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FOOTFALL_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("footfall/footfall.toml")
}

impl Config {
    /// Load the default config file if it exists, apply the environment,
    /// and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_config_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `FOOTFALL_*` overrides looked up through `lookup`. Values that
    /// fail to parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = text("FOOTFALL_CAMERA_DEVICE") {
            self.camera.device = v;
        }
        if let Some(v) = text("FOOTFALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = text("FOOTFALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FOOTFALL_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(v);
        }
        if let Some(v) = text("FOOTFALL_REPLAY_DIR") {
            self.replay_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = text("FOOTFALL_DEBUG_DIR") {
            self.debug_dir = Some(PathBuf::from(v));
        }

        let p = &mut self.pipeline;
        override_parsed(&lookup, "FOOTFALL_CAMERA_WIDTH", &mut self.camera.width);
        override_parsed(&lookup, "FOOTFALL_CAMERA_HEIGHT", &mut self.camera.height);
        override_parsed(&lookup, "FOOTFALL_SIMILARITY_THRESHOLD", &mut p.similarity_threshold);
        override_parsed(&lookup, "FOOTFALL_COOLDOWN_SECS", &mut p.cooldown_secs);
        override_parsed(&lookup, "FOOTFALL_CAPTURE_SECS", &mut p.capture.duration_secs);
        override_parsed(&lookup, "FOOTFALL_TARGET_WIDTH", &mut p.target_width);
        override_parsed(&lookup, "FOOTFALL_DETECT_EVERY_N_FRAMES", &mut p.detect_every_n_frames);
        override_parsed(&lookup, "FOOTFALL_MIN_DETECTION_CONFIDENCE", &mut p.min_detection_confidence);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.replay_fps != 0.0 && !(0.1..=MAX_REPLAY_FPS).contains(&self.replay_fps) {
            return Err(ConfigError::Invalid(format!(
                "replay_fps must be 0 or within [0.1, {MAX_REPLAY_FPS}], got {}",
                self.replay_fps
            )));
        }
        if !(0.0..=MAX_RECONNECT_DELAY_SECS).contains(&self.reconnect_delay_secs) {
            return Err(ConfigError::Invalid(format!(
                "reconnect_delay_secs must be within [0, {MAX_RECONNECT_DELAY_SECS}], got {}",
                self.reconnect_delay_secs
            )));
        }
        Ok(())
    }

    /// Pause between replayed frames; `None` paces as fast as possible.
    pub fn replay_interval(&self) -> Option<Duration> {
        if self.replay_fps <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f32(1.0 / self.replay_fps.min(MAX_REPLAY_FPS)).ok()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::try_from_secs_f32(self.reconnect_delay_secs.clamp(0.0, MAX_RECONNECT_DELAY_SECS)).unwrap_or_default()
    }

    /// `None` when snapshot saving is disabled.
    pub fn snapshot_dir(&self) -> Option<&Path> {
        (!self.snapshot_dir.as_os_str().is_empty()).then_some(self.snapshot_dir.as_path())
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            db_path = "/var/lib/footfall/visitors.db"

            [camera]
            device = "/dev/video4"

            [pipeline]
            similarity_threshold = 0.5

            [pipeline.capture]
            duration_secs = 3.0
            "#,
        )
        .unwrap();

        assert_eq!(config.camera.device, "/dev/video4");
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/footfall/visitors.db"));
        assert!((config.pipeline.similarity_threshold - 0.5).abs() < 1e-6);
        assert!((config.pipeline.capture.duration_secs - 3.0).abs() < 1e-6);
        assert_eq!(config.pipeline.capture.sample_interval_ms, 300);
        assert!((config.pipeline.cooldown_secs - 10.0).abs() < 1e-6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_weights_fail_validation() {
        let config = Config::from_toml("[pipeline.weights]\nsharpness = 0.9\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("FOOTFALL_CAMERA_DEVICE", "/dev/video9"),
            ("FOOTFALL_COOLDOWN_SECS", "4.5"),
            ("FOOTFALL_DETECT_EVERY_N_FRAMES", "2"),
            ("FOOTFALL_SIMILARITY_THRESHOLD", "not-a-number"),
            ("FOOTFALL_REPLAY_DIR", "/tmp/frames"),
            ("FOOTFALL_SNAPSHOT_DIR", ""),
        ]));

        assert_eq!(config.camera.device, "/dev/video9");
        assert!((config.pipeline.cooldown_secs - 4.5).abs() < 1e-6);
        assert_eq!(config.pipeline.detect_every_n_frames, 2);
        assert!((config.pipeline.similarity_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.replay_dir, Some(PathBuf::from("/tmp/frames")));
        assert_eq!(config.snapshot_dir(), None);
    }

    #[test]
    fn test_out_of_range_intervals_rejected() {
        for (key, value) in [
            ("reconnect_delay_secs", "1e20"),
            ("reconnect_delay_secs", "-1.0"),
            ("reconnect_delay_secs", "nan"),
            ("replay_fps", "1e-30"),
            ("replay_fps", "1e9"),
            ("replay_fps", "inf"),
        ] {
            let config = Config::from_toml(&format!("{key} = {value}\n")).unwrap();
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{key} = {value}");
        }

        let config = Config::from_toml("replay_fps = 0.0\nreconnect_delay_secs = 3600.0\n").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.replay_interval(), None);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(3600));
        assert_eq!(Config::default().replay_interval(), Some(Duration::from_secs_f32(1.0 / 15.0)));
    }

    #[test]
    fn test_debug_dir_override() {
        let mut config = Config::default();
        assert_eq!(config.debug_dir, None);
        config.apply_overrides(env(&[("FOOTFALL_DEBUG_DIR", "/tmp/footfall-debug")]));
        assert_eq!(config.debug_dir, Some(PathBuf::from("/tmp/footfall-debug")));
    }

    #[test]
    fn test_malformed_toml_reports_path() {
        let dir = std::env::temp_dir().join(format!("footfalld-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("footfall.toml");
        std::fs::write(&path, "camera = [").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("footfall.toml"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
