use omr_core::score::{LogicalPart, Page, PageRegistry, PartData, Score, ScoreDefaults};
use omr_core::sheet::SystemId;
use omr_io::{BookLinks, JsonFacade, LinksStore, ScorePageLink};

/// 测试用的页面登记表，按 (页码, 页号) 查找。
struct Sheets {
    pages: Vec<Page>,
}

impl Sheets {
    fn new(layout: &[(u32, u32, Option<i32>, bool)]) -> Self {
        let pages = layout
            .iter()
            .map(|&(sheet_number, id, delta_measure_id, starts_movement)| Page {
                sheet_number,
                id,
                first_system: SystemId::new(1),
                last_system: SystemId::new(1),
                starts_movement,
                delta_measure_id,
                part_count: 2,
            })
            .collect();
        Self { pages }
    }
}

impl PageRegistry for Sheets {
    fn page(&self, sheet_number: u32, page_id: u32) -> Option<&Page> {
        self.pages
            .iter()
            .find(|page| page.sheet_number == sheet_number && page.id == page_id)
    }
}

fn scores(sheets: &Sheets, defaults: &ScoreDefaults) -> Vec<Score> {
    let mut first = Score::new(defaults);
    let mut second = Score::new(defaults);
    for page in &sheets.pages {
        let target = if (page.sheet_number, page.id) >= (2, 2) {
            &mut second
        } else {
            &mut first
        };
        target
            .add_page_ref(page.sheet_number, page.page_ref())
            .expect("追加页失败");
    }
    first.set_logical_parts(vec![LogicalPart::new(1), LogicalPart::new(2)]);
    first
        .parts_param()
        .set_specific(&[PartData::new("Violin", 40), PartData::new("Cello", 42)])
        .expect("写入声部失败");
    first.tempo_param_mut().set_specific(Some(72));
    second.set_volume(Some(64));
    vec![first, second]
}

fn book() -> Sheets {
    Sheets::new(&[
        (1, 1, Some(5), false),
        (2, 1, Some(7), false),
        (2, 2, None, true),
        (3, 1, Some(4), false),
    ])
}

#[test]
fn links_round_trip_through_a_file() {
    let sheets = book();
    let defaults = ScoreDefaults::default();
    let original = scores(&sheets, &defaults);

    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let path = dir.path().join("book-links.json");
    let facade = JsonFacade::new();
    facade
        .save_links(&BookLinks::from_scores(&original), &path)
        .expect("写出链接失败");
    let restored = facade
        .load_links(&path)
        .expect("读取链接失败")
        .restore(&sheets, &defaults);

    assert_eq!(restored.len(), original.len());
    for (before, after) in original.iter().zip(&restored) {
        assert_eq!(after.page_refs(), before.page_refs());
        assert_eq!(after.logical_parts(), before.logical_parts());
        assert_eq!(after.tempo_param().specific(), before.tempo_param().specific());
        assert_eq!(after.specific_volume(), before.specific_volume());
    }
    assert_eq!(restored[0].tempo(), 72);
    assert_eq!(restored[1].tempo(), 120);
    assert_eq!(restored[1].volume(), 64);
}

#[test]
fn unresolvable_links_are_dropped_not_fatal() {
    let sheets = book();
    let defaults = ScoreDefaults::default();
    let mut links = BookLinks::from_scores(&scores(&sheets, &defaults));
    links.scores[0].pages.insert(
        1,
        ScorePageLink {
            sheet_number: 9,
            sheet_page_id: 1,
        },
    );
    links.scores[0].pages.push(ScorePageLink {
        sheet_number: 0,
        sheet_page_id: 3,
    });
    links.scores[1].pages = vec![ScorePageLink {
        sheet_number: 4,
        sheet_page_id: 1,
    }];

    let restored = links.restore(&sheets, &defaults);
    // 第二部乐谱的链接全部失效，不再恢复
    assert_eq!(restored.len(), 1);
    let keys: Vec<(u32, u32)> = restored[0]
        .page_refs()
        .iter()
        .map(|page_ref| (page_ref.sheet_number, page_ref.id))
        .collect();
    assert_eq!(keys, vec![(1, 1), (2, 1)]);
}

#[test]
fn restored_pages_carry_live_measure_deltas() {
    let sheets = book();
    let defaults = ScoreDefaults::default();
    let links = BookLinks::from_scores(&scores(&sheets, &defaults));
    let restored = links.restore(&sheets, &defaults);

    let last = sheets.page(3, 1).expect("页缺失");
    assert_eq!(restored[1].measure_id_offset(last), Ok(0));
    let second = sheets.page(2, 1).expect("页缺失");
    assert_eq!(restored[0].measure_id_offset(second), Ok(5));
}
