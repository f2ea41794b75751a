use omr_core::sheet::{Boundary, Primitive, SystemId};
use omr_core::structure::{Partition, SystemInfo, band_of_point};

/// 把页面上的原始图元分配到唯一的系统。
///
/// 图元按竖直范围与各系统条带的重叠长度归属，重叠相同时归上方系统；
/// 与所有条带都不重叠的图元（零高度或位于页面之外）按其中心点归属。
pub struct EntityPartitioner<'a> {
    systems: &'a [SystemInfo],
    boundaries: &'a [Boundary],
}

impl<'a> EntityPartitioner<'a> {
    pub fn new(systems: &'a [SystemInfo], boundaries: &'a [Boundary]) -> Self {
        Self {
            systems,
            boundaries,
        }
    }

    pub fn assign(&self, primitive: &Primitive) -> Option<SystemId> {
        let bounds = primitive.bounds;
        let center = bounds.center();
        let (ymin, ymax) = (bounds.min().y(), bounds.max().y());

        let mut best: Option<(SystemId, f64)> = None;
        for system in self.systems {
            let (Some(top), Some(bottom)) = (
                self.boundaries.get(system.top().get() as usize),
                self.boundaries.get(system.bottom().get() as usize),
            ) else {
                continue;
            };
            let band_top = top.ordinate_at(center.x());
            let band_bottom = bottom.ordinate_at(center.x());
            let overlap = ymax.min(band_bottom) - ymin.max(band_top);
            if overlap > best.map_or(0.0, |(_, value)| value) {
                best = Some((system.id(), overlap));
            }
        }

        match best {
            Some((system, _)) => Some(system),
            None => band_of_point(self.systems, self.boundaries, center),
        }
    }

    pub fn partition(&self, primitives: &[Primitive]) -> Partition {
        let mut partition = Partition::new();
        for primitive in primitives {
            if let Some(system) = self.assign(primitive) {
                partition.assign(primitive.id, system);
            }
        }
        partition
    }
}

#[cfg(test)]
mod tests {
    use omr_core::geometry::{Bounds2D, Point2};
    use omr_core::sheet::{PrimitiveId, PrimitiveKind, StaffId};
    use omr_core::structure::PartInfo;

    use super::*;

    fn systems(count: u32) -> Vec<SystemInfo> {
        (1..=count)
            .map(|id| {
                let mut system = SystemInfo::new(SystemId::new(id), false, None);
                system.add_part(PartInfo::new(id, StaffId::new(id)));
                system
            })
            .collect()
    }

    fn flat(ys: &[f64]) -> Vec<Boundary> {
        ys.iter()
            .map(|y| Boundary::horizontal(*y, 0.0, 100.0))
            .collect()
    }

    fn stick(id: u64, top: f64, bottom: f64) -> Primitive {
        Primitive::new(
            id,
            PrimitiveKind::BarStick,
            Bounds2D::new(Point2::new(40.0, top), Point2::new(42.0, bottom)),
        )
    }

    #[test]
    fn straddling_primitive_goes_to_majority_side() {
        let systems = systems(2);
        let boundaries = flat(&[0.0, 100.0, 200.0]);
        let partitioner = EntityPartitioner::new(&systems, &boundaries);

        assert_eq!(partitioner.assign(&stick(1, 80.0, 110.0)), Some(SystemId::new(1)));
        assert_eq!(partitioner.assign(&stick(2, 95.0, 130.0)), Some(SystemId::new(2)));
        // 上下各占一半时归上方系统
        assert_eq!(partitioner.assign(&stick(3, 90.0, 110.0)), Some(SystemId::new(1)));
    }

    #[test]
    fn degenerate_and_outside_primitives_use_their_center() {
        let systems = systems(2);
        let boundaries = flat(&[0.0, 100.0, 200.0]);
        let partitioner = EntityPartitioner::new(&systems, &boundaries);

        let on_line = Primitive::new(
            1,
            PrimitiveKind::HorizontalSection,
            Bounds2D::new(Point2::new(10.0, 100.0), Point2::new(60.0, 100.0)),
        );
        assert_eq!(partitioner.assign(&on_line), Some(SystemId::new(1)));
        assert_eq!(partitioner.assign(&stick(2, -30.0, -10.0)), Some(SystemId::new(1)));
        assert_eq!(partitioner.assign(&stick(3, 250.0, 260.0)), Some(SystemId::new(2)));
    }

    #[test]
    fn partition_is_complete_and_unique() {
        let systems = systems(3);
        let boundaries = flat(&[0.0, 100.0, 200.0, 300.0]);
        let primitives: Vec<Primitive> = (0..30)
            .map(|i| {
                let top = i as f64 * 10.0 - 5.0;
                stick(i, top, top + 12.0)
            })
            .collect();
        let partition = EntityPartitioner::new(&systems, &boundaries).partition(&primitives);

        assert_eq!(partition.len(), primitives.len());
        let total: usize = partition.members().values().map(|set| set.len()).sum();
        assert_eq!(total, primitives.len());
        assert_eq!(partition.system_of(PrimitiveId::new(0)), Some(SystemId::new(1)));
        assert_eq!(partition.system_of(PrimitiveId::new(29)), Some(SystemId::new(3)));
    }

    #[test]
    fn no_system_means_no_assignment() {
        let partitioner = EntityPartitioner::new(&[], &[]);
        assert!(partitioner.assign(&stick(1, 0.0, 10.0)).is_none());
        assert!(partitioner.partition(&[stick(1, 0.0, 10.0)]).is_empty());
    }
}
