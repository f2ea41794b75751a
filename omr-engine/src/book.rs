use std::collections::BTreeMap;

use omr_core::score::{Page, PageRegistry, Score, ScoreDefaults};
use omr_core::sheet::SheetInput;
use tracing::{info, warn};

use crate::assembler::{ScoreAssembler, sheet_pages};
use crate::coordinator::{PendingRebuild, RebuildCoordinator, RebuildOutcome};
use crate::errors::EngineError;
use crate::settings::EngineSettings;

/// 书中的一页：结构由专属协调器维护，`pages` 为最近一次切分的结果。
pub struct SheetStub {
    coordinator: RebuildCoordinator,
    pages: Vec<Page>,
}

impl SheetStub {
    #[inline]
    pub fn coordinator(&self) -> &RebuildCoordinator {
        &self.coordinator
    }

    #[inline]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }
}

fn wait_all(
    submitted: Vec<(u32, Result<PendingRebuild, EngineError>)>,
) -> Vec<(u32, Result<RebuildOutcome, EngineError>)> {
    let outcomes: Vec<(u32, Result<RebuildOutcome, EngineError>)> = submitted
        .into_iter()
        .map(|(number, pending)| (number, pending.and_then(PendingRebuild::wait)))
        .collect();
    for (number, outcome) in &outcomes {
        if let Err(err) = outcome {
            warn!(sheet = number, error = %err, "页面构建失败");
        }
    }
    outcomes
}

/// 多页文档：持有所有页面与乐谱，乐谱中的页引用通过本对象按 (页码, 页号) 解析。
pub struct Book {
    stubs: BTreeMap<u32, SheetStub>,
    scores: Vec<Score>,
    defaults: ScoreDefaults,
    settings: EngineSettings,
}

impl Book {
    pub fn new(settings: EngineSettings, defaults: ScoreDefaults) -> Self {
        Self {
            stubs: BTreeMap::new(),
            scores: Vec::new(),
            defaults,
            settings,
        }
    }

    /// 加入一页；同号页面已存在时整页替换，旧结构随之丢弃。
    pub fn add_sheet(&mut self, input: SheetInput) -> Result<(), EngineError> {
        let number = input.number;
        if number == 0 {
            return Err(EngineError::InvalidInput(
                "sheet numbers start at 1".to_string(),
            ));
        }
        let coordinator = RebuildCoordinator::spawn(input, self.settings)?;
        let stub = SheetStub {
            coordinator,
            pages: Vec::new(),
        };
        if self.stubs.insert(number, stub).is_some() {
            info!(sheet = number, "页面已替换");
        }
        Ok(())
    }

    /// 移除一页。引用该页的乐谱保持不变，只是对应的页无法再被解析。
    pub fn remove_sheet(&mut self, number: u32) -> Result<(), EngineError> {
        self.stubs
            .remove(&number)
            .map(|_| ())
            .ok_or(EngineError::SheetNotFound(number))
    }

    pub fn sheet_numbers(&self) -> Vec<u32> {
        self.stubs.keys().copied().collect()
    }

    pub fn sheet(&self, number: u32) -> Result<&SheetStub, EngineError> {
        self.stubs
            .get(&number)
            .ok_or(EngineError::SheetNotFound(number))
    }

    pub fn coordinator(&self, number: u32) -> Result<&RebuildCoordinator, EngineError> {
        self.sheet(number).map(SheetStub::coordinator)
    }

    /// 先向所有页面提交构建，再依次等待，各页在各自的线程上并行执行。
    ///
    /// 单页提交或构建失败只体现在该页的结果中，其余页面照常完成并刷新。
    pub fn build_all(&mut self) -> Result<Vec<(u32, Result<RebuildOutcome, EngineError>)>, EngineError> {
        let submitted: Vec<(u32, Result<PendingRebuild, EngineError>)> = self
            .stubs
            .iter()
            .map(|(number, stub)| (*number, stub.coordinator.build_systems()))
            .collect();
        let outcomes = wait_all(submitted);

        self.refresh_pages()?;
        Ok(outcomes)
    }

    /// 从各页当前发布的结构重新切分 `Page`。
    pub fn refresh_pages(&mut self) -> Result<(), EngineError> {
        for stub in self.stubs.values_mut() {
            let snapshot = stub.coordinator.snapshot()?;
            stub.pages = sheet_pages(&snapshot);
        }
        Ok(())
    }

    /// 全书按顺序排列的页。
    pub fn pages(&self) -> impl Iterator<Item = &Page> + '_ {
        self.stubs.values().flat_map(|stub| stub.pages.iter())
    }

    /// 重新切分页面并组装乐谱，返回乐谱数量。
    pub fn assemble_scores(&mut self) -> Result<usize, EngineError> {
        self.refresh_pages()?;
        let pages: Vec<Page> = self.pages().cloned().collect();
        let count = ScoreAssembler::new(&self.defaults).assemble(&mut self.scores, &pages)?;
        info!(scores = count, pages = pages.len(), "乐谱组装完成");
        Ok(count)
    }

    #[inline]
    pub fn scores(&self) -> &[Score] {
        &self.scores
    }

    /// 乐谱编号即其在书中的 1 起始序号。
    pub fn score(&self, id: usize) -> Option<&Score> {
        self.scores.get(id.checked_sub(1)?)
    }

    pub fn score_mut(&mut self, id: usize) -> Option<&mut Score> {
        self.scores.get_mut(id.checked_sub(1)?)
    }

    /// 包含指定页的乐谱编号。
    pub fn score_id_of(&self, page: &Page) -> Option<usize> {
        self.scores
            .iter()
            .position(|score| score.page_index(page).is_some())
            .map(|index| index + 1)
    }

    /// 用持久化恢复的乐谱整体替换当前乐谱。
    pub fn replace_scores(&mut self, scores: Vec<Score>) {
        self.scores = scores;
    }

    #[inline]
    pub fn defaults(&self) -> &ScoreDefaults {
        &self.defaults
    }

    #[inline]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl PageRegistry for Book {
    fn page(&self, sheet_number: u32, page_id: u32) -> Option<&Page> {
        self.stubs
            .get(&sheet_number)?
            .pages
            .iter()
            .find(|page| page.id == page_id)
    }
}
