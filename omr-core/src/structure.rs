use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::geometry::{Point2, VerticalSide};
use crate::sheet::{Boundary, BoundaryId, PrimitiveId, SheetInput, StaffId, SystemId};

/// 系统内的一个声部：连续、非空、共享同一声部键的谱表序列。
#[derive(Debug, Clone, PartialEq)]
pub struct PartInfo {
    top_key: u32,
    staves: Vec<StaffId>,
}

impl PartInfo {
    pub fn new(top_key: u32, first: StaffId) -> Self {
        Self {
            top_key,
            staves: vec![first],
        }
    }

    pub fn add_staff(&mut self, staff: StaffId) {
        self.staves.push(staff);
    }

    #[inline]
    pub fn top_key(&self) -> u32 {
        self.top_key
    }

    #[inline]
    pub fn staves(&self) -> &[StaffId] {
        &self.staves
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemInfo {
    id: SystemId,
    parts: Vec<PartInfo>,
    top: BoundaryId,
    bottom: BoundaryId,
    indented: bool,
    measure_count: Option<u32>,
}

impl SystemInfo {
    /// 第 `id` 个系统位于边界 `id - 1` 与 `id` 之间。
    pub fn new(id: SystemId, indented: bool, measure_count: Option<u32>) -> Self {
        let raw = id.get();
        Self {
            id,
            parts: Vec::new(),
            top: BoundaryId::new(raw.saturating_sub(1)),
            bottom: BoundaryId::new(raw),
            indented,
            measure_count,
        }
    }

    pub fn add_part(&mut self, part: PartInfo) {
        self.parts.push(part);
    }

    /// 当前最后一个声部，用于逐个追加谱表。
    pub fn last_part_mut(&mut self) -> Option<&mut PartInfo> {
        self.parts.last_mut()
    }

    #[inline]
    pub fn id(&self) -> SystemId {
        self.id
    }

    #[inline]
    pub fn parts(&self) -> &[PartInfo] {
        &self.parts
    }

    #[inline]
    pub fn top(&self) -> BoundaryId {
        self.top
    }

    #[inline]
    pub fn bottom(&self) -> BoundaryId {
        self.bottom
    }

    #[inline]
    pub fn is_indented(&self) -> bool {
        self.indented
    }

    #[inline]
    pub fn measure_count(&self) -> Option<u32> {
        self.measure_count
    }

    pub fn staves(&self) -> impl Iterator<Item = StaffId> + '_ {
        self.parts.iter().flat_map(|part| part.staves.iter().copied())
    }
}

/// 结构重建的统计结果。零系统是合法结果而非错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildReport {
    pub system_count: usize,
    /// 各系统中声部数的最大值。
    pub part_count: usize,
}

impl BuildReport {
    pub fn from_systems(systems: &[SystemInfo]) -> Self {
        Self {
            system_count: systems.len(),
            part_count: systems
                .iter()
                .map(|system| system.parts().len())
                .max()
                .unwrap_or(0),
        }
    }

    #[inline]
    pub fn no_system_found(&self) -> bool {
        self.system_count == 0
    }
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.part_count {
            0 => write!(f, "no part found")?,
            1 => write!(f, "1 part")?,
            n => write!(f, "{n} parts")?,
        }
        match self.system_count {
            0 => write!(f, ", no system found"),
            1 => write!(f, ", 1 system"),
            n => write!(f, ", {n} systems"),
        }
    }
}

/// 图元到系统的完整划分。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    owners: BTreeMap<PrimitiveId, SystemId>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, primitive: PrimitiveId, system: SystemId) {
        self.owners.insert(primitive, system);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn system_of(&self, primitive: PrimitiveId) -> Option<SystemId> {
        self.owners.get(&primitive).copied()
    }

    pub fn primitives_of(&self, system: SystemId) -> Vec<PrimitiveId> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == system)
            .map(|(primitive, _)| *primitive)
            .collect()
    }

    /// 按系统分组的成员集合。
    pub fn members(&self) -> BTreeMap<SystemId, BTreeSet<PrimitiveId>> {
        let mut members: BTreeMap<SystemId, BTreeSet<PrimitiveId>> = BTreeMap::new();
        for (primitive, system) in &self.owners {
            members.entry(*system).or_default().insert(*primitive);
        }
        members
    }

    /// 与上一次划分相比，成员集合发生变化的系统。
    pub fn touched_since(&self, previous: &Partition) -> BTreeSet<SystemId> {
        let before = previous.members();
        let after = self.members();
        let empty = BTreeSet::new();
        before
            .keys()
            .chain(after.keys())
            .copied()
            .filter(|system| {
                before.get(system).unwrap_or(&empty) != after.get(system).unwrap_or(&empty)
            })
            .collect()
    }
}

/// 查找包含 `point` 的系统：第一个下边界在点下方（或恰好经过该点）的系统。
pub fn band_of_point(
    systems: &[SystemInfo],
    boundaries: &[Boundary],
    point: Point2,
) -> Option<SystemId> {
    for system in systems {
        let bottom = boundaries.get(system.bottom().get() as usize)?;
        if bottom.point_side(point) == VerticalSide::Above {
            return Some(system.id());
        }
    }
    systems.last().map(SystemInfo::id)
}

/// 某一代的完整页面结构。
#[derive(Debug, Clone)]
pub struct SheetStructure {
    generation: u64,
    input: Arc<SheetInput>,
    systems: Vec<SystemInfo>,
    boundaries: Vec<Boundary>,
    partition: Partition,
    report: BuildReport,
}

impl SheetStructure {
    /// 尚未构建时的第 0 代：只有输入，没有系统。
    pub fn unbuilt(input: Arc<SheetInput>) -> Self {
        Self {
            generation: 0,
            input,
            systems: Vec::new(),
            boundaries: Vec::new(),
            partition: Partition::new(),
            report: BuildReport::default(),
        }
    }

    pub fn new(
        generation: u64,
        input: Arc<SheetInput>,
        systems: Vec<SystemInfo>,
        boundaries: Vec<Boundary>,
        partition: Partition,
    ) -> Self {
        let report = BuildReport::from_systems(&systems);
        Self {
            generation,
            input,
            systems,
            boundaries,
            partition,
            report,
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn is_built(&self) -> bool {
        self.generation > 0
    }

    #[inline]
    pub fn sheet_number(&self) -> u32 {
        self.input.number
    }

    #[inline]
    pub fn input(&self) -> &Arc<SheetInput> {
        &self.input
    }

    #[inline]
    pub fn systems(&self) -> &[SystemInfo] {
        &self.systems
    }

    pub fn system(&self, id: SystemId) -> Option<&SystemInfo> {
        let index = (id.get() as usize).checked_sub(1)?;
        self.systems.get(index)
    }

    #[inline]
    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    pub fn boundary(&self, id: BoundaryId) -> Option<&Boundary> {
        self.boundaries.get(id.get() as usize)
    }

    /// 边界两侧的系统（上方, 下方）；页面上下沿只有一侧。
    pub fn systems_of(&self, boundary: BoundaryId) -> (Option<SystemId>, Option<SystemId>) {
        let above = self
            .systems
            .iter()
            .find(|system| system.bottom() == boundary)
            .map(SystemInfo::id);
        let below = self
            .systems
            .iter()
            .find(|system| system.top() == boundary)
            .map(SystemInfo::id);
        (above, below)
    }

    /// 是否为页面上沿或下沿。
    pub fn is_outer_edge(&self, boundary: BoundaryId) -> bool {
        boundary.get() == 0 || boundary.get() as usize == self.systems.len()
    }

    #[inline]
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    #[inline]
    pub fn report(&self) -> BuildReport {
        self.report
    }

    pub fn system_at(&self, point: Point2) -> Option<SystemId> {
        band_of_point(&self.systems, &self.boundaries, point)
    }

    pub fn staff_count(&self) -> usize {
        self.systems.iter().map(|system| system.staves().count()).sum()
    }
}
