use std::collections::BTreeSet;

use omr_core::sheet::{SheetInput, StaffId, SystemId, SystemInput};
use omr_core::structure::{BuildReport, PartInfo, SystemInfo};
use tracing::{debug, info, warn};

use crate::errors::EngineError;

/// 根据每行谱表的声部键，把网格检测给出的系统细分为声部。
pub struct StructureBuilder<'a> {
    input: &'a SheetInput,
}

#[derive(Debug, Clone)]
pub struct BuiltSystems {
    pub systems: Vec<SystemInfo>,
    pub report: BuildReport,
}

impl<'a> StructureBuilder<'a> {
    pub fn new(input: &'a SheetInput) -> Self {
        Self { input }
    }

    pub fn build(&self) -> Result<BuiltSystems, EngineError> {
        self.check_input()?;
        let segments = self.segments()?;

        let mut systems = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let id = SystemId::new(index as u32 + 1);
            systems.push(self.build_parts(id, segment)?);
        }

        let report = BuildReport::from_systems(&systems);
        info!(sheet = self.input.number, "{report}");
        for system in &systems {
            debug!(
                sheet = self.input.number,
                system = system.id().get(),
                parts = system.parts().len(),
                staves = system.staves().count(),
                "系统结构"
            );
        }
        Ok(BuiltSystems { systems, report })
    }

    fn check_input(&self) -> Result<(), EngineError> {
        let input = self.input;
        if !(input.width > 0.0 && input.height > 0.0) {
            return Err(EngineError::InvalidInput(format!(
                "sheet {} has empty extent {}x{}",
                input.number, input.width, input.height
            )));
        }
        for (index, staff) in input.staves.iter().enumerate() {
            if staff.id.get() as usize != index + 1 {
                return Err(EngineError::InvalidInput(format!(
                    "staff at index {index} has id {}, staves must be numbered 1..n top-down",
                    staff.id.get()
                )));
            }
        }
        if input.part_top_of.len() != input.staves.len() {
            return Err(EngineError::InvalidInput(format!(
                "part_top_of has {} entries for {} staves",
                input.part_top_of.len(),
                input.staves.len()
            )));
        }

        let mut seen = BTreeSet::new();
        for primitive in &input.primitives {
            let id = primitive.id.get();
            if !seen.insert(primitive.id) {
                return Err(EngineError::InvalidInput(format!(
                    "primitive id {id} appears more than once"
                )));
            }
            let (min, max) = (primitive.bounds.min(), primitive.bounds.max());
            let finite = [min.x(), min.y(), max.x(), max.y()]
                .iter()
                .all(|value| value.is_finite());
            if !finite || primitive.bounds.is_empty() {
                return Err(EngineError::InvalidInput(format!(
                    "primitive {id} has malformed bounds ({}, {})..({}, {})",
                    min.x(),
                    min.y(),
                    max.x(),
                    max.y()
                )));
            }
        }
        Ok(())
    }

    /// 系统切分结果，按首行谱表自上而下排序。
    fn segments(&self) -> Result<Vec<SystemInput>, EngineError> {
        let input = self.input;
        if input.systems.is_empty() {
            if input.staves.len() == 1 {
                // 退化情形：只有一行谱表且没有小节线
                warn!(
                    sheet = input.number,
                    "Created one system, one part, one staff"
                );
                return Ok(vec![SystemInput::new([input.staves[0].id.get()])]);
            }
            return Ok(Vec::new());
        }

        let mut seen: BTreeSet<StaffId> = BTreeSet::new();
        let mut segments = Vec::with_capacity(input.systems.len());
        for (index, system) in input.systems.iter().enumerate() {
            if system.staves.is_empty() {
                return Err(self.structure_error(format!("system at index {index} has no staff")));
            }
            let mut segment = system.clone();
            segment.staves.sort();
            for staff in &segment.staves {
                if input.staff(*staff).is_none() {
                    return Err(self.structure_error(format!("unknown staff {staff}")));
                }
                if !seen.insert(*staff) {
                    return Err(
                        self.structure_error(format!("staff {staff} belongs to several systems"))
                    );
                }
            }
            segments.push(segment);
        }

        if let Some(orphan) = input.staves.iter().find(|staff| !seen.contains(&staff.id)) {
            return Err(self.structure_error(format!("staff {} belongs to no system", orphan.id)));
        }

        segments.sort_by_key(|segment| segment.staves[0]);
        for pair in segments.windows(2) {
            let upper_last = pair[0].staves[pair[0].staves.len() - 1];
            if upper_last > pair[1].staves[0] {
                return Err(self.structure_error(format!(
                    "systems interleave around staff {}",
                    pair[1].staves[0]
                )));
            }
        }
        Ok(segments)
    }

    /// 声部键变化时开始新声部，否则把谱表追加到当前声部。
    fn build_parts(&self, id: SystemId, segment: &SystemInput) -> Result<SystemInfo, EngineError> {
        let mut system = SystemInfo::new(id, segment.indented, segment.measure_count);
        let mut current_key: Option<u32> = None;

        for staff in &segment.staves {
            let key = self
                .input
                .part_top(*staff)
                .ok_or_else(|| self.structure_error(format!("no part key for staff {staff}")))?;
            if current_key != Some(key) {
                system.add_part(PartInfo::new(key, *staff));
                current_key = Some(key);
            } else if let Some(part) = system.last_part_mut() {
                part.add_staff(*staff);
            }
        }
        Ok(system)
    }

    fn structure_error(&self, reason: String) -> EngineError {
        EngineError::Structure {
            sheet: self.input.number,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use omr_core::geometry::{Bounds2D, Point2};
    use omr_core::sheet::{Primitive, PrimitiveId, PrimitiveKind, Staff, SystemInput};

    use super::*;
    use crate::demo::piano_sheet;

    fn input(staff_count: u32, part_top_of: Vec<u32>, systems: Vec<SystemInput>) -> SheetInput {
        SheetInput {
            number: 1,
            width: 800.0,
            height: 1200.0,
            staves: (1..=staff_count)
                .map(|id| {
                    let top = 100.0 * id as f64;
                    Staff::new(id, 10.0, 790.0, top, top + 40.0)
                })
                .collect(),
            part_top_of,
            systems,
            primitives: Vec::new(),
        }
    }

    #[test]
    fn parts_follow_part_top_changes() {
        let sheet = input(
            6,
            vec![1, 2, 2, 4, 5, 5],
            vec![SystemInput::new([1, 2, 3]), SystemInput::new([4, 5, 6])],
        );
        let built = StructureBuilder::new(&sheet).build().expect("build");

        let layout: Vec<Vec<Vec<u32>>> = built
            .systems
            .iter()
            .map(|system| {
                system
                    .parts()
                    .iter()
                    .map(|part| part.staves().iter().map(|s| s.get()).collect())
                    .collect()
            })
            .collect();
        assert_eq!(
            layout,
            vec![vec![vec![1], vec![2, 3]], vec![vec![4], vec![5, 6]]]
        );
        assert_eq!(built.report.system_count, 2);
        assert_eq!(built.report.part_count, 2);
        assert_eq!(built.systems[1].top().get(), 1);
        assert_eq!(built.systems[1].bottom().get(), 2);
    }

    #[test]
    fn every_staff_lands_in_exactly_one_system() {
        let sheet = input(
            5,
            vec![1, 1, 3, 3, 5],
            vec![SystemInput::new([3, 4, 5]), SystemInput::new([2, 1])],
        );
        let built = StructureBuilder::new(&sheet).build().expect("build");

        let all: Vec<u32> = built
            .systems
            .iter()
            .flat_map(|system| system.staves().map(StaffId::get).collect::<Vec<_>>())
            .collect();
        let unique: BTreeSet<u32> = all.iter().copied().collect();
        assert_eq!(all.len(), unique.len());
        assert_eq!(unique, (1..=5).collect::<BTreeSet<u32>>());
        // 按首行谱表重新排序
        assert_eq!(built.systems[0].staves().next(), Some(StaffId::new(1)));
    }

    #[test]
    fn single_staff_without_bars_yields_one_system() {
        let sheet = input(1, vec![1], Vec::new());
        let built = StructureBuilder::new(&sheet).build().expect("build");
        assert_eq!(built.systems.len(), 1);
        assert_eq!(built.systems[0].parts().len(), 1);
        assert_eq!(built.systems[0].parts()[0].staves(), &[StaffId::new(1)]);
        assert_eq!(built.report.to_string(), "1 part, 1 system");
    }

    #[test]
    fn zero_systems_is_reported_not_thrown() {
        let sheet = input(3, vec![1, 2, 3], Vec::new());
        let built = StructureBuilder::new(&sheet).build().expect("build");
        assert!(built.report.no_system_found());
        assert_eq!(built.report.to_string(), "no part found, no system found");
    }

    #[test]
    fn inconsistent_inputs_are_step_failures() {
        let shared = input(
            3,
            vec![1, 2, 3],
            vec![SystemInput::new([1, 2]), SystemInput::new([2, 3])],
        );
        assert!(matches!(
            StructureBuilder::new(&shared).build(),
            Err(EngineError::Structure { .. })
        ));

        let orphan = input(3, vec![1, 2, 3], vec![SystemInput::new([1, 2])]);
        assert!(matches!(
            StructureBuilder::new(&orphan).build(),
            Err(EngineError::Structure { .. })
        ));

        let short_keys = input(3, vec![1, 2], vec![SystemInput::new([1, 2, 3])]);
        assert!(matches!(
            StructureBuilder::new(&short_keys).build(),
            Err(EngineError::InvalidInput(_))
        ));

        let interleaved = input(
            4,
            vec![1, 2, 3, 4],
            vec![SystemInput::new([1, 3]), SystemInput::new([2, 4])],
        );
        assert!(matches!(
            StructureBuilder::new(&interleaved).build(),
            Err(EngineError::Structure { .. })
        ));
    }

    #[test]
    fn reversed_or_non_finite_primitive_bounds_are_rejected() {
        let mut reversed = input(2, vec![1, 2], vec![SystemInput::new([1, 2])]);
        reversed.primitives.push(Primitive::new(
            1,
            PrimitiveKind::Glyph,
            Bounds2D::new(Point2::new(50.0, 300.0), Point2::new(40.0, 290.0)),
        ));
        let err = StructureBuilder::new(&reversed).build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(ref reason) if reason.contains("primitive 1")));

        let mut unbounded = input(2, vec![1, 2], vec![SystemInput::new([1, 2])]);
        unbounded.primitives.push(Primitive::new(
            2,
            PrimitiveKind::BarStick,
            Bounds2D::from_rect(10.0, f64::NAN, 2.0, 40.0),
        ));
        assert!(matches!(
            StructureBuilder::new(&unbounded).build(),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn duplicate_primitive_ids_are_rejected() {
        let mut sheet = piano_sheet(1, &[false, false], &[Some(4), Some(5)]);
        let copy = sheet.primitives[3].clone();
        sheet.primitives.push(Primitive { id: PrimitiveId::new(1), ..copy });

        let err = StructureBuilder::new(&sheet).build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(ref reason) if reason.contains("id 1")));

        sheet.primitives.pop();
        assert!(StructureBuilder::new(&sheet).build().is_ok());
    }
}
