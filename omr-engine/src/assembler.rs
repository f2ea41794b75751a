use omr_core::score::{LogicalPart, Page, Score, ScoreDefaults, ScoreError};
use omr_core::structure::{SheetStructure, SystemInfo};
use tracing::{debug, info};

/// 按乐章起点把一页结构切分为若干 `Page`：除首个系统外，每个缩进系统都开始新的一页。
pub fn sheet_pages(structure: &SheetStructure) -> Vec<Page> {
    let sheet_number = structure.sheet_number();
    let mut pages = Vec::new();
    let mut segment: Vec<&SystemInfo> = Vec::new();

    for system in structure.systems() {
        if system.is_indented() && !segment.is_empty() {
            pages.extend(make_page(sheet_number, pages.len() as u32 + 1, &segment));
            segment.clear();
        }
        segment.push(system);
    }
    pages.extend(make_page(sheet_number, pages.len() as u32 + 1, &segment));
    pages
}

fn make_page(sheet_number: u32, id: u32, systems: &[&SystemInfo]) -> Option<Page> {
    let first = systems.first()?;
    let last = systems.last()?;
    // 任意一个系统缺少小节数时整页的小节增量未知
    let delta_measure_id = systems
        .iter()
        .map(|system| system.measure_count())
        .sum::<Option<u32>>()
        .and_then(|total| i32::try_from(total).ok());
    let part_count = systems
        .iter()
        .map(|system| system.parts().len())
        .max()
        .unwrap_or(0);

    Some(Page {
        sheet_number,
        id,
        first_system: first.id(),
        last_system: last.id(),
        starts_movement: first.is_indented(),
        delta_measure_id,
        part_count,
    })
}

/// 把全书按顺序排列的页组装为乐谱。
///
/// 已有的乐谱按序号复用，保留其声部与速度音量设置；多余的乐谱被丢弃。
pub struct ScoreAssembler<'a> {
    defaults: &'a ScoreDefaults,
}

impl<'a> ScoreAssembler<'a> {
    pub fn new(defaults: &'a ScoreDefaults) -> Self {
        Self { defaults }
    }

    /// `pages` 必须按 (页码, 页号) 升序排列。返回组装后的乐谱数量。
    ///
    /// 任一乐章组装失败时 `scores` 保持原样。
    pub fn assemble(&self, scores: &mut Vec<Score>, pages: &[Page]) -> Result<usize, ScoreError> {
        let groups = movements(pages);

        let mut next = Vec::with_capacity(groups.len());
        for (index, group) in groups.iter().enumerate() {
            let mut score = scores
                .get(index)
                .cloned()
                .unwrap_or_else(|| Score::new(self.defaults));
            score.clear_page_refs();
            for page in group {
                score.add_page_ref(page.sheet_number, page.page_ref())?;
            }
            if score.logical_parts().is_none() {
                let count = group.iter().map(|page| page.part_count).max().unwrap_or(0);
                score.set_logical_parts((1..=count as u32).map(LogicalPart::new).collect());
            }
            debug!(
                score = index + 1,
                pages = score.page_count(),
                sheets = ?score.sheet_numbers(),
                "乐谱已组装"
            );
            next.push(score);
        }

        if scores.len() > next.len() {
            info!(
                dropped = scores.len() - next.len(),
                "丢弃不再对应任何乐章的乐谱"
            );
        }
        *scores = next;
        Ok(groups.len())
    }
}

fn movements(pages: &[Page]) -> Vec<Vec<&Page>> {
    let mut groups: Vec<Vec<&Page>> = Vec::new();
    for page in pages {
        let continues = !page.starts_movement && !groups.is_empty();
        if continues {
            if let Some(group) = groups.last_mut() {
                group.push(page);
            }
        } else {
            groups.push(vec![page]);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use omr_core::score::{PageRef, PageRegistry};
    use omr_core::sheet::{SheetInput, SystemId};

    use super::*;
    use crate::coordinator::rebuild;
    use crate::demo::{demo_sheets, piano_sheet};
    use crate::settings::EngineSettings;

    fn built(input: SheetInput) -> SheetStructure {
        let unbuilt = SheetStructure::unbuilt(Arc::new(input.clone()));
        let (structure, _) =
            rebuild(&unbuilt, Arc::new(input), &EngineSettings::default()).expect("build");
        structure
    }

    struct Pages(Vec<Page>);

    impl PageRegistry for Pages {
        fn page(&self, sheet_number: u32, page_id: u32) -> Option<&Page> {
            self.0
                .iter()
                .find(|page| page.sheet_number == sheet_number && page.id == page_id)
        }
    }

    fn demo_pages() -> Vec<Page> {
        demo_sheets()
            .into_iter()
            .flat_map(|input| sheet_pages(&built(input)))
            .collect()
    }

    #[test]
    fn indented_system_splits_a_sheet() {
        let structure = built(piano_sheet(2, &[false, true, false], &[Some(6), Some(3), Some(2)]));
        let pages = sheet_pages(&structure);

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].id, 1);
        assert_eq!(pages[0].first_system, SystemId::new(1));
        assert_eq!(pages[0].last_system, SystemId::new(1));
        assert!(!pages[0].starts_movement);
        assert_eq!(pages[0].delta_measure_id, Some(6));
        assert_eq!(pages[1].id, 2);
        assert_eq!(pages[1].first_system, SystemId::new(2));
        assert_eq!(pages[1].last_system, SystemId::new(3));
        assert!(pages[1].starts_movement);
        assert_eq!(pages[1].delta_measure_id, Some(5));
        assert_eq!(pages[1].part_count, 1);
    }

    #[test]
    fn indented_first_system_does_not_split() {
        let structure = built(piano_sheet(4, &[true, false], &[Some(1), None]));
        let pages = sheet_pages(&structure);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].starts_movement);
        assert_eq!(pages[0].delta_measure_id, None);
    }

    #[test]
    fn unbuilt_sheet_yields_no_page() {
        let structure = SheetStructure::unbuilt(Arc::new(piano_sheet(1, &[false], &[None])));
        assert!(sheet_pages(&structure).is_empty());
    }

    #[test]
    fn movements_become_scores_across_sheets() {
        let pages = demo_pages();
        let defaults = ScoreDefaults::default();
        let mut scores = Vec::new();
        let count = ScoreAssembler::new(&defaults)
            .assemble(&mut scores, &pages)
            .expect("assemble");

        assert_eq!(count, 2);
        let keys = |score: &Score| -> Vec<(u32, u32)> {
            score
                .page_refs()
                .iter()
                .map(|page_ref| (page_ref.sheet_number, page_ref.id))
                .collect()
        };
        assert_eq!(keys(&scores[0]), vec![(1, 1), (2, 1)]);
        assert_eq!(keys(&scores[1]), vec![(2, 2), (3, 1)]);
        assert_eq!(scores[0].logical_parts().map(<[_]>::len), Some(1));

        let registry = Pages(pages);
        let sheet_two = registry.page(2, 1).expect("page");
        assert_eq!(scores[0].measure_id_offset(sheet_two), Ok(9));
        let sheet_three = registry.page(3, 1).expect("page");
        assert_eq!(scores[1].measure_id_offset(sheet_three), Ok(3));
        assert_eq!(
            scores[1].preceding_page(sheet_three, &registry).map(|page| page.id),
            Some(2)
        );
    }

    #[test]
    fn reassembly_reuses_scores_and_their_settings() {
        let pages = demo_pages();
        let defaults = ScoreDefaults::default();
        let assembler = ScoreAssembler::new(&defaults);
        let mut scores = Vec::new();
        assembler.assemble(&mut scores, &pages).expect("assemble");
        scores[0].tempo_param_mut().set_specific(Some(96));
        scores[1].set_volume(Some(100));

        // 去掉第 2 页的乐章起点后只剩一部乐谱
        let merged: Vec<Page> = pages
            .into_iter()
            .map(|mut page| {
                page.starts_movement = false;
                page
            })
            .collect();
        let count = assembler.assemble(&mut scores, &merged).expect("assemble");

        assert_eq!(count, 1);
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].page_count(), 4);
        assert_eq!(scores[0].tempo(), 96);
        assert!(!scores[0].has_volume());
    }

    #[test]
    fn out_of_order_pages_are_rejected() {
        let mut pages = demo_pages();
        pages.swap(0, 1);
        for page in &mut pages {
            page.starts_movement = false;
        }
        let defaults = ScoreDefaults::default();
        let err = ScoreAssembler::new(&defaults)
            .assemble(&mut Vec::new(), &pages)
            .unwrap_err();
        assert!(matches!(err, ScoreError::PageOutOfOrder { .. }));
    }

    #[test]
    fn failed_reassembly_leaves_existing_scores_intact() {
        let mut pages = demo_pages();
        let defaults = ScoreDefaults::default();
        let assembler = ScoreAssembler::new(&defaults);
        let mut scores = Vec::new();
        assembler.assemble(&mut scores, &pages).expect("assemble");
        scores[0].tempo_param_mut().set_specific(Some(84));
        let before: Vec<Vec<PageRef>> = scores.iter().map(|s| s.page_refs().to_vec()).collect();

        // 第一乐章的第二页排在了第一页之前
        pages.swap(0, 1);
        let err = assembler.assemble(&mut scores, &pages).unwrap_err();
        assert!(matches!(err, ScoreError::PageOutOfOrder { .. }));

        let after: Vec<Vec<PageRef>> = scores.iter().map(|s| s.page_refs().to_vec()).collect();
        assert_eq!(after, before);
        assert_eq!(scores.iter().map(Score::page_count).collect::<Vec<_>>(), vec![2, 2]);
        assert_eq!(scores[0].tempo(), 84);
    }
}
