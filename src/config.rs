use std::sync::LazyLock;

use serde::Deserialize;

pub const CONFIG_ENV: &str = "VIDEO_TRANSMITTER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransmitterConfig {
    codec: String,
    /// Bits per second. Absent means the codec's quality mode.
    bitrate: Option<i64>,
    width: u32,
    height: u32,
    pixel_format: String,
    fps: u32,
    output: String,
    sample_period_ms: u64,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            bitrate: None,
            width: 1280,
            height: 720,
            pixel_format: "yuv420p".to_string(),
            fps: 30,
            output: "out.h264".to_string(),
            sample_period_ms: 1000,
        }
    }
}

impl TransmitterConfig {
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("read config {}: {}", path, e))?;
                Self::from_json(&text)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            anyhow::bail!(
                "invalid stream {}x{} at {} fps",
                config.width,
                config.height,
                config.fps
            );
        }
        Ok(config)
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn bitrate(&self) -> Option<i64> {
        self.bitrate
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> &str {
        &self.pixel_format
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn sample_period_ms(&self) -> u64 {
        self.sample_period_ms
    }
}

pub fn config() -> &'static TransmitterConfig {
    static CONFIG: LazyLock<TransmitterConfig> = LazyLock::new(|| {
        TransmitterConfig::load().unwrap_or_else(|e| {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}
