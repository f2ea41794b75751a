use std::sync::{Arc, RwLock};

use omr_core::structure::SheetStructure;

use crate::errors::EngineError;

/// 当前发布的结构快照。替换只交换指针，读者要么看到旧的一代，要么看到新的一代。
#[derive(Debug)]
pub struct SnapshotCell {
    current: RwLock<Arc<SheetStructure>>,
}

impl SnapshotCell {
    pub fn new(initial: SheetStructure) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn load(&self) -> Result<Arc<SheetStructure>, EngineError> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| EngineError::SnapshotPoisoned)
    }

    pub fn publish(&self, next: SheetStructure) -> Result<Arc<SheetStructure>, EngineError> {
        let next = Arc::new(next);
        let mut guard = self
            .current
            .write()
            .map_err(|_| EngineError::SnapshotPoisoned)?;
        *guard = Arc::clone(&next);
        Ok(next)
    }
}
