use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::sheet::SystemId;

/// 缺省速度，单位为每分钟四分音符数。
pub const DEFAULT_TEMPO: u32 = 120;
/// 缺省 MIDI 音量，取值范围 0..=127。
pub const DEFAULT_VOLUME: u32 = 78;
/// 未指定乐器时使用的 MIDI 音色（原声钢琴）。
pub const DEFAULT_MIDI_PROGRAM: u8 = 0;
pub const MAX_MIDI_PROGRAM: u8 = 127;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("no page with number {number} (score has {count} pages)")]
    PageNumberOutOfRange { number: usize, count: usize },
    #[error(
        "page {sheet_number}/{page_id} appended after {last_sheet}/{last_page}, pages must be in ascending order"
    )]
    PageOutOfOrder {
        sheet_number: u32,
        page_id: u32,
        last_sheet: u32,
        last_page: u32,
    },
    #[error("page reference belongs to sheet {actual}, not to sheet {expected}")]
    SheetMismatch { expected: u32, actual: u32 },
    #[error("page {sheet_number}/{page_id} is not part of this score")]
    PageNotInScore { sheet_number: u32, page_id: u32 },
    #[error("expected {expected} parts data, got {actual}")]
    PartsLengthMismatch { expected: usize, actual: usize },
    #[error("midi program {program} of part #{index} is out of range 0..=127")]
    ProgramOutOfRange { index: usize, program: u8 },
}

/// 页在其所属页面上的引用，持久化时只保留 (页码, 本页内页号)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub sheet_number: u32,
    /// 本页内的页号，从 1 开始。
    pub id: u32,
    /// 本页的小节数；转写失败时为空。
    pub delta_measure_id: Option<i32>,
}

impl PageRef {
    #[inline]
    fn key(&self) -> (u32, u32) {
        (self.sheet_number, self.id)
    }
}

/// 页面结构按乐章切分后的一段。
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub sheet_number: u32,
    pub id: u32,
    pub first_system: SystemId,
    pub last_system: SystemId,
    /// 首个系统缩进，即新乐章从本页开始。
    pub starts_movement: bool,
    pub delta_measure_id: Option<i32>,
    /// 各系统声部数的最大值。
    pub part_count: usize,
}

impl Page {
    pub fn page_ref(&self) -> PageRef {
        PageRef {
            sheet_number: self.sheet_number,
            id: self.id,
            delta_measure_id: self.delta_measure_id,
        }
    }
}

/// 通过 (页码, 页号) 延迟解析当前存活的 `Page`。
pub trait PageRegistry {
    fn page(&self, sheet_number: u32, page_id: u32) -> Option<&Page>;

    fn resolve(&self, page_ref: &PageRef) -> Option<&Page> {
        self.page(page_ref.sheet_number, page_ref.id)
    }
}

/// 全局缺省值，被多个 `Param` 共享，运行期可修改。
#[derive(Debug)]
pub struct DefaultParam<T> {
    value: RwLock<T>,
}

impl<T: Copy> DefaultParam<T> {
    pub fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            value: RwLock::new(value),
        })
    }

    pub fn get(&self) -> T {
        match self.value.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, value: T) {
        match self.value.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

/// 两级参数：本乐谱显式值优先，否则取全局缺省值。
#[derive(Debug, Clone)]
pub struct Param<T> {
    specific: Option<T>,
    parent: Arc<DefaultParam<T>>,
}

impl<T: Copy> Param<T> {
    pub fn new(parent: Arc<DefaultParam<T>>) -> Self {
        Self {
            specific: None,
            parent,
        }
    }

    #[inline]
    pub fn specific(&self) -> Option<T> {
        self.specific
    }

    #[inline]
    pub fn has_specific(&self) -> bool {
        self.specific.is_some()
    }

    pub fn set_specific(&mut self, value: Option<T>) {
        self.specific = value;
    }

    pub fn value(&self) -> T {
        self.specific.unwrap_or_else(|| self.parent.get())
    }
}

/// 一本书内所有乐谱共享的速度与音量缺省值。
#[derive(Debug, Clone)]
pub struct ScoreDefaults {
    pub tempo: Arc<DefaultParam<u32>>,
    pub volume: Arc<DefaultParam<u32>>,
}

impl ScoreDefaults {
    pub fn new(tempo: u32, volume: u32) -> Self {
        Self {
            tempo: DefaultParam::new(tempo),
            volume: DefaultParam::new(volume),
        }
    }
}

impl Default for ScoreDefaults {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPO, DEFAULT_VOLUME)
    }
}

/// 在整部乐谱内有效的声部。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPart {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub midi_program: Option<u8>,
    pub default_program: u8,
}

impl LogicalPart {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: None,
            midi_program: None,
            default_program: DEFAULT_MIDI_PROGRAM,
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("P{}", self.id))
    }

    #[inline]
    pub fn effective_program(&self) -> u8 {
        self.midi_program.unwrap_or(self.default_program)
    }
}

/// 批量读写声部名称与音色的临时视图。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartData {
    pub name: String,
    pub program: u8,
}

impl PartData {
    pub fn new(name: impl Into<String>, program: u8) -> Self {
        Self {
            name: name.into(),
            program,
        }
    }
}

/// 按下标对应 `LogicalPart` 列表的参数视图。
pub struct PartsParam<'a> {
    parts: &'a mut Option<Vec<LogicalPart>>,
}

impl PartsParam<'_> {
    pub fn get_specific(&self) -> Option<Vec<PartData>> {
        self.parts.as_ref().map(|parts| {
            parts
                .iter()
                .map(|part| PartData::new(part.display_name(), part.effective_program()))
                .collect()
        })
    }

    /// 整批写回；任何一项不合法则整批不生效。
    pub fn set_specific(&mut self, data: &[PartData]) -> Result<(), ScoreError> {
        let result = self.try_apply(data);
        match &result {
            Ok(()) => info!(count = data.len(), "乐谱声部已更新"),
            Err(err) => warn!(error = %err, "更新乐谱声部失败"),
        }
        result
    }

    fn try_apply(&mut self, data: &[PartData]) -> Result<(), ScoreError> {
        let expected = self.parts.as_ref().map_or(0, Vec::len);
        if data.len() != expected {
            return Err(ScoreError::PartsLengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        if let Some((index, item)) = data
            .iter()
            .enumerate()
            .find(|(_, item)| item.program > MAX_MIDI_PROGRAM)
        {
            return Err(ScoreError::ProgramOutOfRange {
                index,
                program: item.program,
            });
        }
        if let Some(parts) = self.parts.as_mut() {
            for (part, item) in parts.iter_mut().zip(data) {
                part.name = Some(item.name.clone());
                part.midi_program = Some(item.program);
            }
        }
        Ok(())
    }
}

/// 一个乐章，可能跨越多个页面的若干 `Page`。
#[derive(Debug, Clone)]
pub struct Score {
    page_refs: Vec<PageRef>,
    logical_parts: Option<Vec<LogicalPart>>,
    tempo: Param<u32>,
    volume: Param<u32>,
}

impl Score {
    pub fn new(defaults: &ScoreDefaults) -> Self {
        Self {
            page_refs: Vec::new(),
            logical_parts: None,
            tempo: Param::new(Arc::clone(&defaults.tempo)),
            volume: Param::new(Arc::clone(&defaults.volume)),
        }
    }

    /// 追加一页。必须保持 (页码, 页号) 严格递增。
    pub fn add_page_ref(&mut self, sheet_number: u32, page_ref: PageRef) -> Result<(), ScoreError> {
        if page_ref.sheet_number != sheet_number {
            return Err(ScoreError::SheetMismatch {
                expected: sheet_number,
                actual: page_ref.sheet_number,
            });
        }
        if let Some(last) = self.page_refs.last() {
            if page_ref.key() <= last.key() {
                return Err(ScoreError::PageOutOfOrder {
                    sheet_number,
                    page_id: page_ref.id,
                    last_sheet: last.sheet_number,
                    last_page: last.id,
                });
            }
        }
        self.page_refs.push(page_ref);
        Ok(())
    }

    /// 清空页序列，用于重新组装。
    pub fn clear_page_refs(&mut self) {
        self.page_refs.clear();
    }

    #[inline]
    pub fn page_refs(&self) -> &[PageRef] {
        &self.page_refs
    }

    #[inline]
    pub fn first_page_ref(&self) -> Option<&PageRef> {
        self.page_refs.first()
    }

    #[inline]
    pub fn last_page_ref(&self) -> Option<&PageRef> {
        self.page_refs.last()
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_refs.len()
    }

    #[inline]
    pub fn is_multi_page(&self) -> bool {
        self.page_refs.len() > 1
    }

    /// 本乐谱在指定页面上的页引用。
    pub fn page_ref_for_sheet(&self, sheet_number: u32) -> Option<&PageRef> {
        self.page_refs
            .iter()
            .find(|page_ref| page_ref.sheet_number == sheet_number)
    }

    pub fn sheet_page_id(&self, sheet_number: u32) -> Option<u32> {
        self.page_ref_for_sheet(sheet_number)
            .map(|page_ref| page_ref.id)
    }

    /// 组成本乐谱的页面编号，按顺序去重。
    pub fn sheet_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = Vec::new();
        for page_ref in &self.page_refs {
            if numbers.last() != Some(&page_ref.sheet_number) {
                numbers.push(page_ref.sheet_number);
            }
        }
        numbers
    }

    pub fn page_index(&self, page: &Page) -> Option<usize> {
        self.page_refs
            .iter()
            .position(|page_ref| page_ref.key() == (page.sheet_number, page.id))
    }

    pub fn is_first(&self, page: &Page) -> bool {
        self.page_index(page) == Some(0)
    }

    /// 把页内小节号换算为乐谱绝对编号时需要加上的偏移。
    ///
    /// 前面某页缺少小节数时按 0 计入并记录日志，计算不会中断。
    pub fn measure_id_offset(&self, page: &Page) -> Result<i32, ScoreError> {
        let target = (page.sheet_number, page.id);
        let mut offset = 0;
        for page_ref in &self.page_refs {
            if page_ref.key() == target {
                return Ok(offset);
            }
            match page_ref.delta_measure_id {
                Some(delta) => offset += delta,
                None => info!(
                    sheet = page_ref.sheet_number,
                    page = page_ref.id,
                    "页缺少 deltaMeasureId，按 0 计入"
                ),
            }
        }
        Err(ScoreError::PageNotInScore {
            sheet_number: page.sheet_number,
            page_id: page.id,
        })
    }

    pub fn first_page<'r, R: PageRegistry>(&self, registry: &'r R) -> Option<&'r Page> {
        self.first_page_ref()
            .and_then(|page_ref| registry.resolve(page_ref))
    }

    pub fn last_page<'r, R: PageRegistry>(&self, registry: &'r R) -> Option<&'r Page> {
        self.last_page_ref()
            .and_then(|page_ref| registry.resolve(page_ref))
    }

    /// 按乐谱内 1 起始的序号取页。序号越界属于调用方错误。
    pub fn page<'r, R: PageRegistry>(
        &self,
        number: usize,
        registry: &'r R,
    ) -> Result<Option<&'r Page>, ScoreError> {
        let page_ref = number
            .checked_sub(1)
            .and_then(|index| self.page_refs.get(index))
            .ok_or(ScoreError::PageNumberOutOfRange {
                number,
                count: self.page_refs.len(),
            })?;
        Ok(registry.resolve(page_ref))
    }

    pub fn preceding_page<'r, R: PageRegistry>(
        &self,
        page: &Page,
        registry: &'r R,
    ) -> Option<&'r Page> {
        let index = self.page_index(page)?;
        let previous = self.page_refs.get(index.checked_sub(1)?)?;
        registry.resolve(previous)
    }

    pub fn following_page<'r, R: PageRegistry>(
        &self,
        page: &Page,
        registry: &'r R,
    ) -> Option<&'r Page> {
        let index = self.page_index(page)?;
        registry.resolve(self.page_refs.get(index + 1)?)
    }

    /// 解析全部页，无法解析的引用被跳过。
    pub fn pages<'r, R: PageRegistry>(&self, registry: &'r R) -> Vec<&'r Page> {
        self.page_refs
            .iter()
            .filter_map(|page_ref| registry.resolve(page_ref))
            .collect()
    }

    /// 仅保留位于给定页面上的页。
    pub fn pages_in<'r, R: PageRegistry>(&self, registry: &'r R, sheets: &[u32]) -> Vec<&'r Page> {
        self.page_refs
            .iter()
            .filter(|page_ref| sheets.contains(&page_ref.sheet_number))
            .filter_map(|page_ref| registry.resolve(page_ref))
            .collect()
    }

    #[inline]
    pub fn logical_parts(&self) -> Option<&[LogicalPart]> {
        self.logical_parts.as_deref()
    }

    pub fn set_logical_parts(&mut self, parts: Vec<LogicalPart>) {
        self.logical_parts = Some(parts);
    }

    pub fn parts_param(&mut self) -> PartsParam<'_> {
        PartsParam {
            parts: &mut self.logical_parts,
        }
    }

    #[inline]
    pub fn tempo_param(&self) -> &Param<u32> {
        &self.tempo
    }

    #[inline]
    pub fn tempo_param_mut(&mut self) -> &mut Param<u32> {
        &mut self.tempo
    }

    #[inline]
    pub fn tempo(&self) -> u32 {
        self.tempo.value()
    }

    #[inline]
    pub fn volume(&self) -> u32 {
        self.volume.value()
    }

    #[inline]
    pub fn has_volume(&self) -> bool {
        self.volume.has_specific()
    }

    pub fn set_volume(&mut self, volume: Option<u32>) {
        self.volume.set_specific(volume);
    }

    #[inline]
    pub fn specific_volume(&self) -> Option<u32> {
        self.volume.specific()
    }
}
