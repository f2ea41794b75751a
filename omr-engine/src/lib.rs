pub mod assembler;
pub mod book;
pub mod boundaries;
pub mod builder;
pub mod command;
pub mod coordinator;
pub mod partition;
pub mod snapshot;

pub mod errors {
    use omr_core::score::ScoreError;
    use omr_core::sheet::BoundaryShapeError;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("invalid sheet input: {0}")]
        InvalidInput(String),
        #[error("cannot derive structure of sheet {sheet}: {reason}")]
        Structure { sheet: u32, reason: String },
        #[error("sheet {0} not found")]
        SheetNotFound(u32),
        #[error("sheet {0} has not been built yet")]
        NotBuilt(u32),
        #[error("boundary {0} not found")]
        BoundaryNotFound(u32),
        #[error("boundary {boundary} rejected: {reason}")]
        InvalidBoundary { boundary: u32, reason: String },
        #[error("worker of sheet {0} has stopped")]
        WorkerStopped(u32),
        #[error("failed to start worker of sheet {sheet}: {source}")]
        WorkerSpawn {
            sheet: u32,
            #[source]
            source: std::io::Error,
        },
        #[error("job on sheet {sheet} panicked: {reason}")]
        JobPanicked { sheet: u32, reason: String },
        #[error("structure snapshot lock is poisoned")]
        SnapshotPoisoned,
        #[error(transparent)]
        Score(#[from] ScoreError),
    }

    impl EngineError {
        pub(crate) fn shape(boundary: u32, err: BoundaryShapeError) -> Self {
            Self::InvalidBoundary {
                boundary,
                reason: err.to_string(),
            }
        }
    }
}

pub mod settings {
    /// 引擎运行参数，由前端根据应用配置填写。
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct EngineSettings {
        /// 每页排队等待的结构修改上限。
        pub queue_capacity: usize,
        /// 细化边界时的横向采样间隔（像素）。
        pub boundary_step: f64,
        /// 细化边界与谱表之间保留的最小间距（像素）。
        pub boundary_margin: f64,
    }

    impl Default for EngineSettings {
        fn default() -> Self {
            Self {
                queue_capacity: 16,
                boundary_step: 24.0,
                boundary_margin: 2.0,
            }
        }
    }
}

pub mod demo {
    use omr_core::geometry::Bounds2D;
    use omr_core::sheet::{Primitive, PrimitiveKind, SheetInput, Staff, SystemInput};
    use tracing::debug;

    pub const SHEET_WIDTH: f64 = 800.0;
    pub const SHEET_HEIGHT: f64 = 1000.0;

    /// 三页示例：第 1 页两个钢琴系统，第 2 页第 2 个系统缩进开始新乐章，第 3 页的小节数缺失。
    pub fn demo_sheets() -> Vec<SheetInput> {
        let sheets = vec![
            piano_sheet(1, &[false, false], &[Some(4), Some(5)]),
            piano_sheet(2, &[false, true], &[Some(6), Some(3)]),
            piano_sheet(3, &[false, false], &[Some(4), None]),
        ];
        debug!(count = sheets.len(), "已创建演示页面");
        sheets
    }

    /// 每个系统两行谱表（同一声部），系统间距 400 像素，并在每个系统中放置若干图元。
    /// 系统较多时页面高度随之增加。
    pub fn piano_sheet(number: u32, indented: &[bool], measures: &[Option<u32>]) -> SheetInput {
        let mut staves = Vec::new();
        let mut systems = Vec::new();
        let mut primitives = Vec::new();
        let mut next_primitive = 1_u64;

        for (index, is_indented) in indented.iter().enumerate() {
            let base = 100.0 + 400.0 * index as f64;
            let upper = (2 * index + 1) as u32;
            let left = if *is_indented { 80.0 } else { 20.0 };
            staves.push(Staff::new(upper, left, 780.0, base, base + 40.0));
            staves.push(Staff::new(upper + 1, left, 780.0, base + 120.0, base + 160.0));

            let mut system = SystemInput::new([upper, upper + 1]);
            system.indented = *is_indented;
            system.measure_count = measures.get(index).copied().flatten();
            systems.push(system);

            let shapes = [
                (PrimitiveKind::BarStick, Bounds2D::from_rect(left, base, 3.0, 160.0)),
                (PrimitiveKind::HorizontalSection, Bounds2D::from_rect(300.0, base + 200.0, 40.0, 2.0)),
                (PrimitiveKind::VerticalSection, Bounds2D::from_rect(420.0, base - 40.0, 2.0, 30.0)),
                (PrimitiveKind::Glyph, Bounds2D::from_rect(500.0, base + 60.0, 12.0, 20.0)),
            ];
            for (kind, bounds) in shapes {
                primitives.push(Primitive::new(next_primitive, kind, bounds));
                next_primitive += 1;
            }
        }

        let part_top_of = (0..staves.len()).map(|index| (index / 2 * 2 + 1) as u32).collect();
        SheetInput {
            number,
            width: SHEET_WIDTH,
            height: SHEET_HEIGHT.max(400.0 * indented.len() as f64 + 200.0),
            staves,
            part_top_of,
            systems,
            primitives,
        }
    }
}
