use std::env;
use std::path::{Path, PathBuf};

use omr_config::AppConfig;
use tracing::{debug, trace};

const INPUT_ROOTS_ENV: &str = "OMR_INPUT_ROOTS";

/// 在若干根目录中查找页面检测结果文件。
pub struct SheetLocator {
    search_roots: Vec<PathBuf>,
}

impl SheetLocator {
    /// 优先级：`base_dir`、配置中的 `input_roots`、环境变量 `OMR_INPUT_ROOTS`。
    pub fn from_config(base_dir: Option<&Path>, config: &AppConfig) -> Self {
        let mut roots: Vec<PathBuf> = Vec::new();

        if let Some(dir) = base_dir {
            roots.push(dir.to_path_buf());
        }

        roots.extend(
            config
                .resources
                .input_roots
                .iter()
                .cloned()
                .filter(|path| path.is_dir()),
        );

        if let Some(env_paths) = env::var_os(INPUT_ROOTS_ENV) {
            roots.extend(env::split_paths(&env_paths).filter(|path| path.is_dir()));
        }

        Self::with_roots(roots)
    }

    pub fn with_roots(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        // 去重，保持靠前优先级。
        let mut deduped: Vec<PathBuf> = Vec::new();
        for root in roots {
            if !deduped.contains(&root) {
                deduped.push(root);
            }
        }
        Self {
            search_roots: deduped,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.search_roots
    }

    pub fn resolve(&self, path_str: &str) -> Option<PathBuf> {
        let raw_path = Path::new(path_str);
        if raw_path.is_absolute() {
            if raw_path.is_file() {
                return Some(Self::canonicalize_or_clone(raw_path));
            }
            debug!(
                path = %raw_path.display(),
                "页面输入路径为绝对路径但未找到对应文件"
            );
            return None;
        }

        for root in &self.search_roots {
            let candidate = root.join(raw_path);
            trace!(candidate = %candidate.display(), "sheet locator candidate");
            if candidate.is_file() {
                return Some(Self::canonicalize_or_clone(&candidate));
            }
        }
        None
    }

    fn canonicalize_or_clone(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }
}
