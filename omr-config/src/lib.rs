use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 指定配置文件路径的环境变量。
pub const CONFIG_ENV: &str = "OMR_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub score: ScoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate(path)?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `OMR_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        };
        if self.score.default_volume > 127 {
            return Err(invalid(format!(
                "score.default_volume = {} 超出 0..=127",
                self.score.default_volume
            )));
        }
        if self.score.default_tempo == 0 {
            return Err(invalid("score.default_tempo 必须大于 0".to_string()));
        }
        if self.engine.queue_capacity == 0 {
            return Err(invalid("engine.queue_capacity 必须大于 0".to_string()));
        }
        if !(self.engine.boundary_step > 0.0) {
            return Err(invalid("engine.boundary_step 必须大于 0".to_string()));
        }
        if !(self.engine.boundary_margin >= 0.0) {
            return Err(invalid("engine.boundary_margin 不能为负".to_string()));
        }
        Ok(())
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 全书乐谱共享的速度与音量缺省值。
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreConfig {
    /// 每分钟四分音符数。
    #[serde(default = "ScoreConfig::default_tempo")]
    pub default_tempo: u32,
    #[serde(default = "ScoreConfig::default_volume")]
    pub default_volume: u32,
}

impl ScoreConfig {
    fn default_tempo() -> u32 {
        120
    }

    fn default_volume() -> u32 {
        78
    }
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            default_tempo: Self::default_tempo(),
            default_volume: Self::default_volume(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// 每页排队等待的结构修改上限。
    #[serde(default = "EngineConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "EngineConfig::default_boundary_step")]
    pub boundary_step: f64,
    #[serde(default = "EngineConfig::default_boundary_margin")]
    pub boundary_margin: f64,
}

impl EngineConfig {
    fn default_queue_capacity() -> usize {
        16
    }

    fn default_boundary_step() -> f64 {
        24.0
    }

    fn default_boundary_margin() -> f64 {
        2.0
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            boundary_step: Self::default_boundary_step(),
            boundary_margin: Self::default_boundary_margin(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceConfig {
    /// 查找相对路径页面输入文件的目录。
    #[serde(default)]
    pub input_roots: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("配置文件 {path:?} 无效: {message}")]
    Invalid { path: PathBuf, message: String },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "{content}").expect("write config");
        file
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.score.default_tempo, 120);
        assert_eq!(cfg.score.default_volume, 78);
        assert_eq!(cfg.engine.queue_capacity, 16);
        assert_eq!(cfg.engine.boundary_step, 24.0);
        assert_eq!(cfg.engine.boundary_margin, 2.0);
        assert!(cfg.resources.input_roots.is_empty());
    }

    #[test]
    fn load_from_temp_file() {
        let file = write_config(
            r#"
            [logging]
            level = "debug"

            [score]
            default_tempo = 96

            [engine]
            queue_capacity = 4
            boundary_step = 10.0

            [resources]
            input_roots = ["../scans", "../detections"]
            "#,
        );

        let cfg = AppConfig::from_file(file.path()).expect("load config");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.score.default_tempo, 96);
        assert_eq!(cfg.score.default_volume, 78);
        assert_eq!(cfg.engine.queue_capacity, 4);
        assert_eq!(cfg.engine.boundary_step, 10.0);
        assert_eq!(cfg.engine.boundary_margin, 2.0);
        assert_eq!(
            cfg.resources.input_roots,
            vec![PathBuf::from("../scans"), PathBuf::from("../detections")]
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let file = write_config("[score]\ndefault_volume = 200\n");
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::Invalid { .. })
        ));

        let file = write_config("[engine]\nqueue_capacity = 0\n");
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = write_config("[engine\nqueue_capacity = 4\n");
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
