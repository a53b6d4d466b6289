use crate::core::errors::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Camera session configuration
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// How long a non-immediate stop waits before tearing the session down
    pub stop_delay: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            stop_delay: Duration::from_secs(3),
        }
    }
}

/// Foreground segmentation configuration
#[derive(Debug, Clone)]
pub struct SegmentationConfig {
    pub mask_model_path: String,
    /// Square model input size (pixels)
    pub input_size: u32,
    /// Minimum instance confidence for an instance to join the combined mask
    pub instance_confidence: f32,
    pub halo_enabled: bool,
    /// Halo width in display points
    pub halo_radius_points: f32,
    /// Pixels per display point
    pub display_scale: f32,
    pub halo_color: [u8; 4],
    /// Worker threads for the compositing pool
    pub compositing_threads: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            mask_model_path: "models/foreground-seg.onnx".to_string(),
            input_size: 640,
            instance_confidence: 0.25,
            halo_enabled: true,
            halo_radius_points: 6.0,
            display_scale: 3.0,
            halo_color: [255, 255, 255, 255],
            compositing_threads: std::cmp::min(num_cpus::get(), 4),
        }
    }
}

/// Which classifier implementation the pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierStrategy {
    Local,
    Remote,
}

impl FromStr for ClassifierStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(ClassifierStrategy::Local),
            "remote" | "cloud" => Ok(ClassifierStrategy::Remote),
            other => Err(ConfigError::InvalidClassifierConfig(format!(
                "unknown classifier strategy '{}'",
                other
            ))),
        }
    }
}

/// Object classification configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub strategy: ClassifierStrategy,
    pub models_dir: String,
    pub model_base_name: String,
    /// One label per line; index-aligned with the model's class ids
    pub labels_path: Option<String>,
    pub input_size: u32,
    pub detection_threshold: f32,
    pub classification_floor: f32,
    pub remote_floor: f32,
    pub max_results: usize,
    pub vision_endpoint: String,
    pub api_key: Option<String>,
    /// Language hint sent with remote label detection
    pub locale: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            strategy: ClassifierStrategy::Local,
            models_dir: "models".to_string(),
            model_base_name: "ObjectClassifier".to_string(),
            labels_path: None,
            input_size: 640,
            detection_threshold: 0.3,
            classification_floor: 0.05,
            remote_floor: 0.7,
            max_results: 3,
            vision_endpoint: "https://vision.googleapis.com/v1/images:annotate".to_string(),
            api_key: None,
            locale: "en".to_string(),
        }
    }
}

/// Translation provider configuration
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub default_targets: Vec<String>,
    /// LRU entries; 0 disables the cache
    pub cache_capacity: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://translation.googleapis.com/language/translate/v2".to_string(),
            api_key: None,
            default_targets: vec!["zh".to_string()],
            cache_capacity: 512,
        }
    }
}

/// Speech narrator configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub preferred_voice: Option<String>,
    pub natural_base_rate: f32,
    pub neutral_base_rate: f32,
    pub max_rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            preferred_voice: None,
            natural_base_rate: 0.48,
            neutral_base_rate: 0.50,
            max_rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

/// Network client configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub content_timeout: Duration,
    pub probe_timeout: Duration,
    pub retries: u32,
    pub slow_threshold: Option<Duration>,
    pub backoff_base: Duration,
    /// host:port the path monitor dials to decide connectivity
    pub connectivity_probe_addr: String,
    pub monitor_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            content_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            retries: 2,
            slow_threshold: Some(Duration::from_secs(2)),
            backoff_base: Duration::from_secs(1),
            connectivity_probe_addr: "1.1.1.1:443".to_string(),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Word store configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_path: String,
    pub image_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/capword.db".to_string(),
            image_dir: "data/images".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub segmentation: SegmentationConfig,
    pub classifier: ClassifierConfig,
    pub translation: TranslationConfig,
    pub speech: SpeechConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse `#RRGGBB` or `#RRGGBBAA`
fn parse_hex_color(s: &str) -> Option<[u8; 4]> {
    let hex = s.trim().trim_start_matches('#');
    if hex.len() != 6 && hex.len() != 8 {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    let alpha = if hex.len() == 8 { byte(6)? } else { 255 };
    Some([byte(0)?, byte(2)?, byte(4)?, alpha])
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        // A single Google Cloud key serves both vision and translation unless overridden
        let google_key = env_string("GOOGLE_API_KEY");

        let camera_defaults = CameraConfig::default();
        let seg = SegmentationConfig::default();
        let cls = ClassifierConfig::default();
        let tr = TranslationConfig::default();
        let sp = SpeechConfig::default();
        let net = NetworkConfig::default();
        let st = StorageConfig::default();

        let strategy = match env_string("CLASSIFIER_STRATEGY") {
            Some(s) => s.parse()?,
            None => cls.strategy,
        };

        let halo_color = match env_string("HALO_COLOR") {
            Some(s) => parse_hex_color(&s).ok_or_else(|| {
                ConfigError::InvalidSegmentationConfig(format!("invalid HALO_COLOR '{}'", s))
            })?,
            None => seg.halo_color,
        };

        // 0 disables slow-link probing
        let slow_threshold = match env_parse::<u64>("NETWORK_SLOW_THRESHOLD_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => net.slow_threshold,
        };

        Ok(Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT").unwrap_or(8787),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                log_level,
            },
            camera: CameraConfig {
                stop_delay: env_millis("CAMERA_STOP_DELAY_MS").unwrap_or(camera_defaults.stop_delay),
            },
            segmentation: SegmentationConfig {
                mask_model_path: env_string("MASK_MODEL_PATH").unwrap_or(seg.mask_model_path),
                input_size: env_parse("MASK_INPUT_SIZE").unwrap_or(seg.input_size),
                instance_confidence: env_parse("MASK_INSTANCE_CONFIDENCE")
                    .unwrap_or(seg.instance_confidence),
                halo_enabled: env_parse("HALO_ENABLED").unwrap_or(seg.halo_enabled),
                halo_radius_points: env_parse("HALO_RADIUS_POINTS")
                    .unwrap_or(seg.halo_radius_points),
                display_scale: env_parse("DISPLAY_SCALE").unwrap_or(seg.display_scale),
                halo_color,
                compositing_threads: env_parse("COMPOSITING_THREADS")
                    .unwrap_or(seg.compositing_threads),
            },
            classifier: ClassifierConfig {
                strategy,
                models_dir: env_string("MODELS_DIR").unwrap_or(cls.models_dir),
                model_base_name: env_string("CLASSIFIER_MODEL_NAME").unwrap_or(cls.model_base_name),
                labels_path: env_string("CLASSIFIER_LABELS_PATH"),
                input_size: env_parse("CLASSIFIER_INPUT_SIZE").unwrap_or(cls.input_size),
                detection_threshold: env_parse("DETECTION_THRESHOLD")
                    .unwrap_or(cls.detection_threshold),
                classification_floor: env_parse("CLASSIFICATION_FLOOR")
                    .unwrap_or(cls.classification_floor),
                remote_floor: env_parse("REMOTE_LABEL_FLOOR").unwrap_or(cls.remote_floor),
                max_results: env_parse("CLASSIFIER_MAX_RESULTS").unwrap_or(cls.max_results),
                vision_endpoint: env_string("VISION_ENDPOINT").unwrap_or(cls.vision_endpoint),
                api_key: env_string("VISION_API_KEY").or_else(|| google_key.clone()),
                locale: env_string("CAPWORD_LOCALE").unwrap_or(cls.locale),
            },
            translation: TranslationConfig {
                endpoint: env_string("TRANSLATION_ENDPOINT").unwrap_or(tr.endpoint),
                api_key: env_string("TRANSLATION_API_KEY").or(google_key),
                default_targets: env::var("DEFAULT_TARGET_LANGUAGES")
                    .ok()
                    .map(|s| {
                        s.split(',')
                            .map(|c| c.trim().to_string())
                            .filter(|c| !c.is_empty())
                            .collect::<Vec<_>>()
                    })
                    .filter(|v| !v.is_empty())
                    .unwrap_or(tr.default_targets),
                cache_capacity: env_parse("TRANSLATION_CACHE_CAPACITY")
                    .unwrap_or(tr.cache_capacity),
            },
            speech: SpeechConfig {
                preferred_voice: env_string("PREFERRED_VOICE"),
                natural_base_rate: env_parse("SPEECH_NATURAL_RATE").unwrap_or(sp.natural_base_rate),
                neutral_base_rate: env_parse("SPEECH_NEUTRAL_RATE").unwrap_or(sp.neutral_base_rate),
                max_rate: env_parse("SPEECH_MAX_RATE").unwrap_or(sp.max_rate),
                pitch: env_parse("SPEECH_PITCH").unwrap_or(sp.pitch),
                volume: env_parse("SPEECH_VOLUME").unwrap_or(sp.volume),
            },
            network: NetworkConfig {
                content_timeout: env_millis("NETWORK_TIMEOUT_MS").unwrap_or(net.content_timeout),
                probe_timeout: env_millis("NETWORK_PROBE_TIMEOUT_MS").unwrap_or(net.probe_timeout),
                retries: env_parse("NETWORK_RETRIES").unwrap_or(net.retries),
                slow_threshold,
                backoff_base: env_millis("NETWORK_BACKOFF_BASE_MS").unwrap_or(net.backoff_base),
                connectivity_probe_addr: env_string("CONNECTIVITY_PROBE_ADDR")
                    .unwrap_or(net.connectivity_probe_addr),
                monitor_interval: env_millis("CONNECTIVITY_INTERVAL_MS")
                    .unwrap_or(net.monitor_interval),
            },
            storage: StorageConfig {
                database_path: env_string("DATABASE_PATH").unwrap_or(st.database_path),
                image_dir: env_string("IMAGE_DIR").unwrap_or(st.image_dir),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("instance_confidence", self.segmentation.instance_confidence),
            ("detection_threshold", self.classifier.detection_threshold),
            ("classification_floor", self.classifier.classification_floor),
            ("remote_floor", self.classifier.remote_floor),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        for (name, size) in [
            ("mask input_size", self.segmentation.input_size),
            ("classifier input_size", self.classifier.input_size),
        ] {
            if !(32..=2048).contains(&size) || size % 32 != 0 {
                return Err(ConfigError::InvalidSegmentationConfig(format!(
                    "{} must be a multiple of 32 between 32 and 2048, got {}",
                    name, size
                )));
            }
        }

        if self.segmentation.display_scale <= 0.0 {
            return Err(ConfigError::InvalidSegmentationConfig(format!(
                "display_scale must be > 0, got {}",
                self.segmentation.display_scale
            )));
        }
        if !(0.0..=64.0).contains(&self.segmentation.halo_radius_points) {
            return Err(ConfigError::InvalidSegmentationConfig(format!(
                "halo_radius_points must be between 0 and 64, got {}",
                self.segmentation.halo_radius_points
            )));
        }
        if self.segmentation.compositing_threads == 0 {
            return Err(ConfigError::InvalidSegmentationConfig(
                "compositing_threads must be > 0".to_string(),
            ));
        }

        if self.classifier.max_results == 0 {
            return Err(ConfigError::InvalidClassifierConfig(
                "max_results must be > 0".to_string(),
            ));
        }
        if self.classifier.strategy == ClassifierStrategy::Remote && self.classifier.api_key.is_none()
        {
            return Err(ConfigError::InvalidClassifierConfig(
                "remote strategy requires VISION_API_KEY or GOOGLE_API_KEY".to_string(),
            ));
        }

        let sp = &self.speech;
        if !(sp.max_rate > 0.1 && sp.max_rate <= 2.0) {
            return Err(ConfigError::InvalidSpeechConfig(format!(
                "max_rate must be in (0.1, 2.0], got {}",
                sp.max_rate
            )));
        }
        for (name, rate) in [
            ("natural_base_rate", sp.natural_base_rate),
            ("neutral_base_rate", sp.neutral_base_rate),
        ] {
            if !(0.1..=sp.max_rate).contains(&rate) {
                return Err(ConfigError::InvalidSpeechConfig(format!(
                    "{} must be between 0.1 and {}, got {}",
                    name, sp.max_rate, rate
                )));
            }
        }
        if !(0.5..=2.0).contains(&sp.pitch) {
            return Err(ConfigError::InvalidSpeechConfig(format!(
                "pitch must be between 0.5 and 2.0, got {}",
                sp.pitch
            )));
        }
        if !(0.0..=1.0).contains(&sp.volume) {
            return Err(ConfigError::InvalidSpeechConfig(format!(
                "volume must be between 0.0 and 1.0, got {}",
                sp.volume
            )));
        }

        if self.network.retries > 10 {
            return Err(ConfigError::InvalidNetworkConfig(format!(
                "retries must be at most 10, got {}",
                self.network.retries
            )));
        }
        if self.network.content_timeout.is_zero() || self.network.probe_timeout.is_zero() {
            return Err(ConfigError::InvalidNetworkConfig(
                "timeouts must be > 0".to_string(),
            ));
        }

        if self.storage.database_path.is_empty() || self.storage.image_dir.is_empty() {
            return Err(ConfigError::InvalidStoragePath(
                "database_path and image_dir must be set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }
}
