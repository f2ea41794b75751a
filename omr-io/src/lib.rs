use std::fs;
use std::path::{Path, PathBuf};

use omr_core::score::{LogicalPart, PageRegistry, Score, ScoreDefaults};
use omr_core::sheet::SheetInput;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// 当前写出的链接文档版本。
pub const LINKS_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

/// 读取单页检测结果。
pub trait SheetInputLoader {
    fn load(&self, path: &Path) -> Result<SheetInput, IoError>;
}

pub trait SheetInputSaver {
    fn save(&self, input: &SheetInput, path: &Path) -> Result<(), IoError>;
}

/// 乐谱页链接的持久化。
pub trait LinksStore {
    fn load_links(&self, path: &Path) -> Result<BookLinks, IoError>;
    fn save_links(&self, links: &BookLinks, path: &Path) -> Result<(), IoError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFacade;

impl JsonFacade {
    pub fn new() -> Self {
        Self
    }
}

fn read(path: &Path) -> Result<String, IoError> {
    fs::read_to_string(path).map_err(|source| IoError::ReadError {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: String) -> Result<(), IoError> {
    fs::write(path, contents).map_err(|source| IoError::WriteError {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T: for<'de> Deserialize<'de>>(path: &Path, data: &str) -> Result<T, IoError> {
    serde_json::from_str(data).map_err(|source| IoError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// 只检查能在读取阶段发现的问题，结构一致性留给引擎。
fn validate_sheet(input: &SheetInput) -> Result<(), IoError> {
    if input.number == 0 {
        return Err(IoError::InvalidDocument(
            "sheet number must start at 1".to_string(),
        ));
    }
    if !(input.width.is_finite() && input.height.is_finite()) {
        return Err(IoError::InvalidDocument(format!(
            "sheet {} has non finite extent",
            input.number
        )));
    }
    Ok(())
}

impl SheetInputLoader for JsonFacade {
    fn load(&self, path: &Path) -> Result<SheetInput, IoError> {
        let data = read(path)?;
        let input: SheetInput = parse(path, &data)?;
        validate_sheet(&input)?;
        debug!(
            sheet = input.number,
            staves = input.staves.len(),
            primitives = input.primitives.len(),
            "已读取页面检测结果 {:?}",
            path
        );
        Ok(input)
    }
}

impl SheetInputSaver for JsonFacade {
    fn save(&self, input: &SheetInput, path: &Path) -> Result<(), IoError> {
        validate_sheet(input)?;
        write(path, serde_json::to_string_pretty(input)?)
    }
}

impl LinksStore for JsonFacade {
    fn load_links(&self, path: &Path) -> Result<BookLinks, IoError> {
        let data = read(path)?;
        let links: BookLinks = parse(path, &data)?;
        if links.version > LINKS_VERSION {
            return Err(IoError::UnsupportedFeature(format!(
                "links version {} (supported up to {LINKS_VERSION})",
                links.version
            )));
        }
        Ok(links)
    }

    fn save_links(&self, links: &BookLinks, path: &Path) -> Result<(), IoError> {
        write(path, serde_json::to_string_pretty(links)?)
    }
}

/// 乐谱中一页的持久化形式：只保存 (页码, 本页内页号)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePageLink {
    pub sheet_number: u32,
    pub sheet_page_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub pages: Vec<ScorePageLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_parts: Option<Vec<LogicalPart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,
}

impl ScoreRecord {
    pub fn from_score(score: &Score) -> Self {
        Self {
            pages: score
                .page_refs()
                .iter()
                .map(|page_ref| ScorePageLink {
                    sheet_number: page_ref.sheet_number,
                    sheet_page_id: page_ref.id,
                })
                .collect(),
            logical_parts: score.logical_parts().map(<[LogicalPart]>::to_vec),
            tempo: score.tempo_param().specific(),
            volume: score.specific_volume(),
        }
    }

    /// 逐个解析页链接；无效或无法解析的链接记录日志后丢弃。
    pub fn restore<R: PageRegistry>(&self, registry: &R, defaults: &ScoreDefaults) -> Score {
        let mut score = Score::new(defaults);
        for link in &self.pages {
            if link.sheet_number == 0 || link.sheet_page_id == 0 {
                info!(
                    sheet = link.sheet_number,
                    page = link.sheet_page_id,
                    "Illegal page link，已丢弃"
                );
                continue;
            }
            let Some(page) = registry.page(link.sheet_number, link.sheet_page_id) else {
                info!(
                    sheet = link.sheet_number,
                    page = link.sheet_page_id,
                    "页链接无法解析，已丢弃"
                );
                continue;
            };
            if let Err(err) = score.add_page_ref(page.sheet_number, page.page_ref()) {
                info!(error = %err, "页链接顺序错误，已丢弃");
            }
        }
        if let Some(parts) = &self.logical_parts {
            score.set_logical_parts(parts.clone());
        }
        score.tempo_param_mut().set_specific(self.tempo);
        score.set_volume(self.volume);
        score
    }
}

/// 整本书的乐谱链接文档。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLinks {
    pub version: u32,
    pub scores: Vec<ScoreRecord>,
}

impl BookLinks {
    pub fn from_scores(scores: &[Score]) -> Self {
        Self {
            version: LINKS_VERSION,
            scores: scores.iter().map(ScoreRecord::from_score).collect(),
        }
    }

    /// 针对当前存活的页面恢复乐谱；所有链接都被丢弃的乐谱不会恢复。
    pub fn restore<R: PageRegistry>(&self, registry: &R, defaults: &ScoreDefaults) -> Vec<Score> {
        let mut scores = Vec::with_capacity(self.scores.len());
        for (index, record) in self.scores.iter().enumerate() {
            let score = record.restore(registry, defaults);
            if score.page_count() == 0 {
                info!(score = index + 1, "乐谱没有可解析的页，已丢弃");
                continue;
            }
            scores.push(score);
        }
        scores
    }
}
