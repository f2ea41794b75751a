use std::env;
use std::path::{Path, PathBuf};

use omr_config::AppConfig;
use omr_core::score::ScoreDefaults;
use omr_core::sheet::SheetInput;
use omr_engine::demo::demo_sheets;
use omr_engine::settings::EngineSettings;
use omr_io::{JsonFacade, SheetInputLoader};
use tracing::{info, warn};

use crate::errors::FrontendError;
use crate::resource_locator::SheetLocator;

/// 逗号分隔的页面输入文件列表。
const SHEETS_ENV: &str = "OMR_CLI_SHEETS";

/// 页面来源，便于前端呈现加载信息。
#[derive(Debug, Clone)]
pub enum SheetSource {
    Files(Vec<PathBuf>),
    Demo,
}

#[derive(Debug)]
pub struct LoadedSheets {
    pub sheets: Vec<SheetInput>,
    pub source: SheetSource,
}

/// 从环境变量 `OMR_CLI_SHEETS` 列出的文件加载页面，
/// 任一文件失败则回退到内置示例。
pub fn load_sheets_from_env_or_demo(config: &AppConfig) -> LoadedSheets {
    if let Some(list) = env::var_os(SHEETS_ENV) {
        let list = list.to_string_lossy().into_owned();
        let names: Vec<&str> = list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        let cwd = env::current_dir().ok();
        let locator = SheetLocator::from_config(cwd.as_deref(), config);
        match load_sheets(&names, &locator) {
            Ok((sheets, paths)) => {
                info!(count = sheets.len(), "从文件加载页面成功");
                return LoadedSheets {
                    sheets,
                    source: SheetSource::Files(paths),
                };
            }
            Err(err) => {
                warn!(error = %err, "加载页面失败，回退到内置示例");
            }
        }
    }

    LoadedSheets {
        sheets: demo_sheets(),
        source: SheetSource::Demo,
    }
}

/// 依次解析并读取页面文件，结果按页码排序。
pub fn load_sheets(
    names: &[&str],
    locator: &SheetLocator,
) -> Result<(Vec<SheetInput>, Vec<PathBuf>), FrontendError> {
    let loader = JsonFacade::new();
    let mut loaded: Vec<(SheetInput, PathBuf)> = Vec::with_capacity(names.len());
    for name in names {
        let path = locator
            .resolve(name)
            .ok_or_else(|| FrontendError::SheetNotFound(name.to_string()))?;
        let sheet = load_one(&loader, &path)?;
        loaded.push((sheet, path));
    }
    loaded.sort_by_key(|(sheet, _)| sheet.number);
    Ok(loaded.into_iter().unzip())
}

fn load_one(loader: &impl SheetInputLoader, path: &Path) -> Result<SheetInput, FrontendError> {
    Ok(loader.load(path)?)
}

pub fn engine_settings(config: &AppConfig) -> EngineSettings {
    EngineSettings {
        queue_capacity: config.engine.queue_capacity,
        boundary_step: config.engine.boundary_step,
        boundary_margin: config.engine.boundary_margin,
    }
}

pub fn score_defaults(config: &AppConfig) -> ScoreDefaults {
    ScoreDefaults::new(config.score.default_tempo, config.score.default_volume)
}

#[cfg(test)]
mod tests {
    use omr_engine::demo::piano_sheet;
    use omr_io::SheetInputSaver;

    use super::*;

    #[test]
    fn sheets_are_loaded_in_page_order() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let facade = JsonFacade::new();
        facade
            .save(&piano_sheet(2, &[false], &[Some(3)]), &dir.path().join("b.json"))
            .expect("save");
        facade
            .save(&piano_sheet(1, &[false], &[Some(4)]), &dir.path().join("a.json"))
            .expect("save");

        let locator = SheetLocator::with_roots([dir.path().to_path_buf()]);
        let (sheets, paths) = load_sheets(&["b.json", "a.json"], &locator).expect("load");
        let numbers: Vec<u32> = sheets.iter().map(|sheet| sheet.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(paths[0].ends_with("a.json"));

        let err = load_sheets(&["c.json"], &locator).unwrap_err();
        assert!(matches!(err, FrontendError::SheetNotFound(_)));
    }

    #[test]
    fn config_values_reach_the_engine() {
        let mut config = AppConfig::default();
        config.engine.queue_capacity = 3;
        config.score.default_volume = 64;
        assert_eq!(engine_settings(&config).queue_capacity, 3);
        assert_eq!(score_defaults(&config).volume.get(), 64);
        assert_eq!(score_defaults(&config).tempo.get(), 120);
    }
}
