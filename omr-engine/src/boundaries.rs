use omr_core::geometry::{Point2, VerticalSide};
use omr_core::sheet::{Boundary, BoundaryId, SheetInput, Staff};
use omr_core::structure::{SheetStructure, SystemInfo};
use tracing::debug;

use crate::errors::EngineError;
use crate::settings::EngineSettings;

const FLAT_EPSILON: f64 = 1e-9;

/// 对一条系统边界的交互式修改。
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryEdit {
    pub boundary: BoundaryId,
    pub points: Vec<Point2>,
}

impl BoundaryEdit {
    pub fn new(boundary: u32, points: impl IntoIterator<Item = Point2>) -> Self {
        Self {
            boundary: BoundaryId::new(boundary),
            points: points.into_iter().collect(),
        }
    }
}

/// 计算相邻系统之间的边界几何。
pub struct BoundaryLayout<'a> {
    input: &'a SheetInput,
    systems: &'a [SystemInfo],
    settings: &'a EngineSettings,
}

impl<'a> BoundaryLayout<'a> {
    pub fn new(
        input: &'a SheetInput,
        systems: &'a [SystemInfo],
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            input,
            systems,
            settings,
        }
    }

    /// 生成 N + 1 条边界：页面上沿、N - 1 条系统间边界、页面下沿。
    ///
    /// 上一代中人工编辑过、仍不穿过任何谱表且不与相邻边界相交的边界会被原样保留。
    pub fn compute(&self, previous: &[Boundary]) -> Vec<Boundary> {
        let count = self.systems.len();
        if count == 0 {
            return Vec::new();
        }
        let width = self.input.width;
        let reusable = previous.len() == count + 1;

        let mut boundaries = Vec::with_capacity(count + 1);
        let mut kept = Vec::new();
        boundaries.push(Boundary::horizontal(0.0, 0.0, width));
        for index in 1..count {
            let upper = &self.systems[index - 1];
            let lower = &self.systems[index];
            let reused = previous.get(index).filter(|boundary| {
                reusable
                    && boundary.is_edited()
                    && boundary.spans(0.0, width)
                    && self.clears(boundary, upper, lower)
            });
            match reused {
                Some(boundary) => {
                    kept.push(index);
                    boundaries.push(boundary.clone());
                }
                None => boundaries.push(self.refine(upper, lower)),
            }
        }
        boundaries.push(Boundary::horizontal(self.input.height, 0.0, width));

        // 重新计算的边界可能移到保留边界的另一侧，逐条复查直到不再相交
        while let Some(position) = kept.iter().position(|&index| {
            first_crossing(
                &boundaries[index - 1],
                &boundaries[index],
                &boundaries[index + 1],
                width,
            )
            .is_some()
        }) {
            let index = kept.remove(position);
            debug!(
                sheet = self.input.number,
                boundary = index,
                "人工编辑的边界与相邻边界相交，重新计算"
            );
            boundaries[index] = self.refine(&self.systems[index - 1], &self.systems[index]);
        }
        for index in kept {
            debug!(sheet = self.input.number, boundary = index, "保留人工编辑的边界");
        }
        boundaries
    }

    fn staves(&self, system: &SystemInfo) -> Vec<&'a Staff> {
        system
            .staves()
            .filter_map(|id| self.input.staff(id))
            .collect()
    }

    /// 边界是否严格位于上方系统各谱表之下、下方系统各谱表之上。
    fn clears(&self, boundary: &Boundary, upper: &SystemInfo, lower: &SystemInfo) -> bool {
        let samples = |staff: &Staff| -> Vec<f64> {
            let mut xs = vec![staff.left, staff.right];
            xs.extend(
                boundary
                    .abscissas()
                    .filter(|x| *x > staff.left && *x < staff.right),
            );
            xs
        };
        let under_upper = self.staves(upper).into_iter().all(|staff| {
            samples(staff)
                .into_iter()
                .all(|x| boundary.ordinate_at(x) > staff.bottom)
        });
        let over_lower = self.staves(lower).into_iter().all(|staff| {
            samples(staff)
                .into_iter()
                .all(|x| boundary.ordinate_at(x) < staff.top)
        });
        under_upper && over_lower
    }

    /// 在两个系统之间逐列寻找最宽的无图元空隙，取其中点连成折线。
    fn refine(&self, upper: &SystemInfo, lower: &SystemInfo) -> Boundary {
        let width = self.input.width;
        let floor = self
            .staves(upper)
            .iter()
            .map(|staff| staff.bottom)
            .fold(f64::NEG_INFINITY, f64::max);
        let ceiling = self
            .staves(lower)
            .iter()
            .map(|staff| staff.top)
            .fold(f64::INFINITY, f64::min);
        let middle = (floor + ceiling) * 0.5;

        let margin = self.settings.boundary_margin.max(0.0);
        let (low, high) = if floor + margin < ceiling - margin {
            (floor + margin, ceiling - margin)
        } else {
            (middle, middle)
        };

        let step = self.settings.boundary_step.max(1.0);
        let mut columns = Vec::new();
        let mut x = 0.0;
        while x < width {
            columns.push(x);
            x += step;
        }
        columns.push(width);

        let points: Vec<Point2> = columns
            .into_iter()
            .map(|x| Point2::new(x, self.free_ordinate(x, low, high)))
            .collect();
        Boundary::from_points(simplify(points), 0.0, width)
            .unwrap_or_else(|_| Boundary::horizontal(middle, 0.0, width))
    }

    fn free_ordinate(&self, x: f64, low: f64, high: f64) -> f64 {
        if low >= high {
            return low;
        }
        let mut occupied: Vec<(f64, f64)> = self
            .input
            .primitives
            .iter()
            .map(|primitive| primitive.bounds)
            .filter(|bounds| {
                bounds.covers_abscissa(x) && bounds.max().y() > low && bounds.min().y() < high
            })
            .map(|bounds| (bounds.min().y().max(low), bounds.max().y().min(high)))
            .collect();
        occupied.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut best: Option<(f64, f64)> = None;
        let mut cursor = low;
        let mut consider = |start: f64, end: f64| {
            if end - start > best.map_or(0.0, |(s, e)| e - s) {
                best = Some((start, end));
            }
        };
        for (start, end) in occupied {
            if start > cursor {
                consider(cursor, start);
            }
            cursor = cursor.max(end);
        }
        if cursor < high {
            consider(cursor, high);
        }
        match best {
            Some((start, end)) => (start + end) * 0.5,
            None => (low + high) * 0.5,
        }
    }
}

/// 去掉与前后点等高的中间控制点。
fn simplify(points: Vec<Point2>) -> Vec<Point2> {
    let mut kept: Vec<Point2> = Vec::with_capacity(points.len());
    for (index, point) in points.iter().enumerate() {
        let next = points.get(index + 1);
        let redundant = match (kept.last(), next) {
            (Some(previous), Some(next)) => {
                (previous.y() - point.y()).abs() < FLAT_EPSILON
                    && (next.y() - point.y()).abs() < FLAT_EPSILON
            }
            _ => false,
        };
        if !redundant {
            kept.push(*point);
        }
    }
    kept
}

/// 校验一次边界修改并返回新的边界列表；失败时原列表不受影响。
///
/// 新折线必须覆盖整页宽度，且在任意横坐标处都严格位于相邻两条边界之间。
pub fn apply_edit(
    structure: &SheetStructure,
    edit: &BoundaryEdit,
) -> Result<Vec<Boundary>, EngineError> {
    let raw = edit.boundary.get();
    let index = raw as usize;
    let boundaries = structure.boundaries();
    if index >= boundaries.len() {
        return Err(EngineError::BoundaryNotFound(raw));
    }
    if structure.is_outer_edge(edit.boundary) {
        return Err(EngineError::InvalidBoundary {
            boundary: raw,
            reason: "sheet outer edges cannot be edited".to_string(),
        });
    }

    let width = structure.input().width;
    let mut candidate = boundaries[index].clone();
    candidate
        .mutate(edit.points.clone(), 0.0, width)
        .map_err(|err| EngineError::shape(raw, err))?;

    let crossing = first_crossing(
        &boundaries[index - 1],
        &candidate,
        &boundaries[index + 1],
        width,
    );
    if let Some((side, x)) = crossing {
        let neighbour = match side {
            VerticalSide::Above => raw - 1,
            VerticalSide::Below => raw + 1,
        };
        return Err(EngineError::InvalidBoundary {
            boundary: raw,
            reason: format!("crosses boundary {neighbour} at x={x:.1}"),
        });
    }

    let mut next = boundaries.to_vec();
    next[index] = candidate;
    Ok(next)
}

/// 在各折线的控制点横坐标处比较，返回 `line` 第一次碰到上方或下方边界的位置。
///
/// 折线在控制点之间是线性的，因此只需检查这些横坐标。
fn first_crossing(
    above: &Boundary,
    line: &Boundary,
    below: &Boundary,
    width: f64,
) -> Option<(VerticalSide, f64)> {
    let mut samples: Vec<f64> = above
        .abscissas()
        .chain(line.abscissas())
        .chain(below.abscissas())
        .chain([0.0, width])
        .filter(|x| (0.0..=width).contains(x))
        .collect();
    samples.sort_by(f64::total_cmp);
    samples.dedup();

    samples.into_iter().find_map(|x| {
        let y = line.ordinate_at(x);
        if y <= above.ordinate_at(x) {
            Some((VerticalSide::Above, x))
        } else if y >= below.ordinate_at(x) {
            Some((VerticalSide::Below, x))
        } else {
            None
        }
    })
}
