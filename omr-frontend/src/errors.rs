use omr_core::score::ScoreError;
use omr_engine::errors::EngineError;
use omr_io::IoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("找不到页面输入文件: {0}")]
    SheetNotFound(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Score(#[from] ScoreError),
}
