pub mod score;
pub mod structure;

pub mod geometry {
    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示。坐标系与扫描图像一致：x 向右，y 向下。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn vector_to(self, other: Point2) -> Vector2 {
            Vector2(other.0 - self.0)
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.0.is_finite()
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    /// 二维向量。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_points(start: Point2, end: Point2) -> Self {
            Self(end.0 - start.0)
        }

        #[inline]
        pub fn scale(self, factor: f64) -> Self {
            Self(self.0 * factor)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 轴对齐边界框，用于描述检测图元的范围。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn new(min: Point2, max: Point2) -> Self {
            Self { min, max }
        }

        /// 以左上角与宽高构造。
        #[inline]
        pub fn from_rect(x: f64, y: f64, width: f64, height: f64) -> Self {
            Self::new(Point2::new(x, y), Point2::new(x + width, y + height))
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        #[inline]
        pub fn width(&self) -> f64 {
            self.max.x() - self.min.x()
        }

        #[inline]
        pub fn height(&self) -> f64 {
            self.max.y() - self.min.y()
        }

        /// 判断竖直线 `x` 是否穿过该范围（含边界）。
        #[inline]
        pub fn covers_abscissa(&self, x: f64) -> bool {
            !self.is_empty() && self.min.x() <= x && x <= self.max.x()
        }

        #[inline]
        pub fn center(&self) -> Point2 {
            debug_assert!(!self.is_empty());
            let min_vec = self.min.as_vec2();
            let max_vec = self.max.as_vec2();
            let center = (min_vec + max_vec) * 0.5;
            Point2::from_vec(center)
        }
    }

    /// 相对于一条边界线的竖直位置。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum VerticalSide {
        Above,
        Below,
    }
}

pub mod sheet {
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    use crate::geometry::{Bounds2D, Point2, VerticalSide};

    /// 横向坐标比较时允许的误差（像素）。
    pub const ABSCISSA_TOLERANCE: f64 = 1e-6;

    macro_rules! numeric_id {
        ($(#[$meta:meta])* $name:ident, $raw:ty) => {
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name($raw);

            impl $name {
                #[inline]
                pub fn new(raw: $raw) -> Self {
                    Self(raw)
                }

                /// 提供原始数值，便于序列化或日志输出。
                #[inline]
                pub fn get(self) -> $raw {
                    self.0
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "#{}", self.0)
                }
            }
        };
    }

    numeric_id!(
        /// 谱表编号，自上而下从 1 开始。
        StaffId,
        u32
    );
    numeric_id!(
        /// 系统编号，在单页内自上而下从 1 开始。
        SystemId,
        u32
    );
    numeric_id!(
        /// 边界编号：0 为页面上沿，N 为第 N 个系统的下沿。
        BoundaryId,
        u32
    );
    numeric_id!(PrimitiveId, u64);

    /// 检测到的五线谱，检测后不再变化。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Staff {
        pub id: StaffId,
        pub left: f64,
        pub right: f64,
        /// 第一条线的纵坐标。
        pub top: f64,
        /// 第五条线的纵坐标。
        pub bottom: f64,
    }

    impl Staff {
        pub fn new(id: u32, left: f64, right: f64, top: f64, bottom: f64) -> Self {
            Self {
                id: StaffId::new(id),
                left,
                right,
                top,
                bottom,
            }
        }

        /// 谱表中线的纵坐标。
        #[inline]
        pub fn ordinate(&self) -> f64 {
            (self.top + self.bottom) * 0.5
        }

        #[inline]
        pub fn bounds(&self) -> Bounds2D {
            Bounds2D::new(
                Point2::new(self.left, self.top),
                Point2::new(self.right, self.bottom),
            )
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum PrimitiveKind {
        HorizontalSection,
        VerticalSection,
        BarStick,
        Glyph,
    }

    /// 页面级的原始几何图元（水平段、竖直段、小节线竖条、独立符号）。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Primitive {
        pub id: PrimitiveId,
        pub kind: PrimitiveKind,
        pub bounds: Bounds2D,
    }

    impl Primitive {
        pub fn new(id: u64, kind: PrimitiveKind, bounds: Bounds2D) -> Self {
            Self {
                id: PrimitiveId::new(id),
                kind,
                bounds,
            }
        }
    }

    /// 网格检测预先切分出的系统：所含谱表以及上游给出的附加信息。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SystemInput {
        pub staves: Vec<StaffId>,
        /// 系统首部缩进，表示新乐章从此处开始。
        #[serde(default)]
        pub indented: bool,
        /// 转写得到的小节数，转写失败时为空。
        #[serde(default)]
        pub measure_count: Option<u32>,
    }

    impl SystemInput {
        pub fn new(staves: impl IntoIterator<Item = u32>) -> Self {
            Self {
                staves: staves.into_iter().map(StaffId::new).collect(),
                indented: false,
                measure_count: None,
            }
        }

        pub fn indented(mut self) -> Self {
            self.indented = true;
            self
        }

        pub fn with_measures(mut self, count: u32) -> Self {
            self.measure_count = Some(count);
            self
        }
    }

    /// 单页检测结果，是结构重建的全部输入。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SheetInput {
        /// 页在整本文档中的编号，从 1 开始。
        pub number: u32,
        pub width: f64,
        pub height: f64,
        pub staves: Vec<Staff>,
        /// `part_top_of[staff_index]`：由小节线分组得到的声部键。
        pub part_top_of: Vec<u32>,
        #[serde(default)]
        pub systems: Vec<SystemInput>,
        #[serde(default)]
        pub primitives: Vec<Primitive>,
    }

    impl SheetInput {
        pub fn staff(&self, id: StaffId) -> Option<&Staff> {
            let index = (id.get() as usize).checked_sub(1)?;
            self.staves.get(index).filter(|staff| staff.id == id)
        }

        /// 与谱表编号对应的声部键。
        pub fn part_top(&self, id: StaffId) -> Option<u32> {
            let index = (id.get() as usize).checked_sub(1)?;
            self.part_top_of.get(index).copied()
        }
    }

    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum BoundaryShapeError {
        #[error("a boundary needs at least two points, got {0}")]
        TooFewPoints(usize),
        #[error("point #{0} has non finite coordinates")]
        NonFinite(usize),
        #[error("abscissas must strictly increase (point #{0})")]
        NotIncreasing(usize),
        #[error("boundary spans [{from:.1}, {to:.1}] instead of the full width [{left:.1}, {right:.1}]")]
        PartialWidth {
            from: f64,
            to: f64,
            left: f64,
            right: f64,
        },
    }

    /// 分隔上下两个相邻系统的折线。
    ///
    /// 折线以横坐标严格递增的控制点表示，可以看作 `x -> y` 的分段线性函数。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Boundary {
        points: Vec<Point2>,
        /// 是否经过人工编辑；重建时优先保留人工编辑的几何。
        #[serde(default)]
        edited: bool,
    }

    impl Boundary {
        /// 水平直线，用于页面上下沿及缺省边界。
        pub fn horizontal(y: f64, left: f64, right: f64) -> Self {
            Self {
                points: vec![Point2::new(left, y), Point2::new(right, y)],
                edited: false,
            }
        }

        /// 使用给定控制点构造，并校验覆盖 `[left, right]`。
        pub fn from_points(
            points: Vec<Point2>,
            left: f64,
            right: f64,
        ) -> Result<Self, BoundaryShapeError> {
            check_shape(&points, left, right)?;
            Ok(Self {
                points,
                edited: false,
            })
        }

        #[inline]
        pub fn points(&self) -> &[Point2] {
            &self.points
        }

        #[inline]
        pub fn is_edited(&self) -> bool {
            self.edited
        }

        /// 替换控制点。校验失败时保持原几何不变。
        pub fn mutate(
            &mut self,
            points: Vec<Point2>,
            left: f64,
            right: f64,
        ) -> Result<(), BoundaryShapeError> {
            check_shape(&points, left, right)?;
            self.points = points;
            self.edited = true;
            Ok(())
        }

        /// 折线在 `x` 处的纵坐标，超出端点时取端点值。
        pub fn ordinate_at(&self, x: f64) -> f64 {
            let (first, last) = match (self.points.first(), self.points.last()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => return 0.0,
            };
            if x <= first.x() {
                return first.y();
            }
            if x >= last.x() {
                return last.y();
            }
            for pair in self.points.windows(2) {
                let (start, end) = (pair[0], pair[1]);
                if x <= end.x() {
                    let span = start.vector_to(end);
                    let ratio = (x - start.x()) / span.x();
                    return start.translate(span.scale(ratio)).y();
                }
            }
            last.y()
        }

        /// 点相对折线的位置，恰好落在线上时视为在上方。
        pub fn point_side(&self, point: Point2) -> VerticalSide {
            if point.y() <= self.ordinate_at(point.x()) {
                VerticalSide::Above
            } else {
                VerticalSide::Below
            }
        }

        /// 折线是否覆盖 `[left, right]` 的整个宽度。
        pub fn spans(&self, left: f64, right: f64) -> bool {
            match (self.points.first(), self.points.last()) {
                (Some(first), Some(last)) => {
                    first.x() <= left + ABSCISSA_TOLERANCE && last.x() >= right - ABSCISSA_TOLERANCE
                }
                _ => false,
            }
        }

        /// 所有控制点的横坐标。
        pub fn abscissas(&self) -> impl Iterator<Item = f64> + '_ {
            self.points.iter().map(|point| point.x())
        }
    }

    fn check_shape(points: &[Point2], left: f64, right: f64) -> Result<(), BoundaryShapeError> {
        if points.len() < 2 {
            return Err(BoundaryShapeError::TooFewPoints(points.len()));
        }
        for (index, point) in points.iter().enumerate() {
            if !point.is_finite() {
                return Err(BoundaryShapeError::NonFinite(index));
            }
            if index > 0 && point.x() <= points[index - 1].x() {
                return Err(BoundaryShapeError::NotIncreasing(index));
            }
        }
        let from = points[0].x();
        let to = points[points.len() - 1].x();
        if from > left + ABSCISSA_TOLERANCE || to < right - ABSCISSA_TOLERANCE {
            return Err(BoundaryShapeError::PartialWidth {
                from,
                to,
                left,
                right,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn slanted() -> Boundary {
            Boundary::from_points(
                vec![
                    Point2::new(0.0, 100.0),
                    Point2::new(50.0, 120.0),
                    Point2::new(100.0, 100.0),
                ],
                0.0,
                100.0,
            )
            .expect("valid boundary")
        }

        #[test]
        fn ordinate_is_interpolated_and_clamped() {
            let boundary = slanted();
            assert!((boundary.ordinate_at(25.0) - 110.0).abs() < 1e-9);
            assert!((boundary.ordinate_at(50.0) - 120.0).abs() < 1e-9);
            assert!((boundary.ordinate_at(75.0) - 110.0).abs() < 1e-9);
            assert!((boundary.ordinate_at(-10.0) - 100.0).abs() < 1e-9);
            assert!((boundary.ordinate_at(500.0) - 100.0).abs() < 1e-9);
        }

        #[test]
        fn point_side_treats_points_on_the_line_as_above() {
            let boundary = slanted();
            assert_eq!(
                boundary.point_side(Point2::new(50.0, 119.0)),
                VerticalSide::Above
            );
            assert_eq!(
                boundary.point_side(Point2::new(50.0, 120.0)),
                VerticalSide::Above
            );
            assert_eq!(
                boundary.point_side(Point2::new(50.0, 121.0)),
                VerticalSide::Below
            );
            assert_eq!(
                boundary.point_side(Point2::new(0.0, 105.0)),
                VerticalSide::Below
            );
        }

        #[test]
        fn partial_width_mutation_is_rejected_and_geometry_kept() {
            let mut boundary = slanted();
            let before = boundary.clone();

            let err = boundary
                .mutate(
                    vec![Point2::new(10.0, 100.0), Point2::new(100.0, 100.0)],
                    0.0,
                    100.0,
                )
                .unwrap_err();
            assert!(matches!(err, BoundaryShapeError::PartialWidth { .. }));
            assert_eq!(boundary, before);
            assert!(!boundary.is_edited());

            let err = boundary
                .mutate(
                    vec![Point2::new(0.0, 100.0), Point2::new(0.0, 110.0)],
                    0.0,
                    100.0,
                )
                .unwrap_err();
            assert_eq!(err, BoundaryShapeError::NotIncreasing(1));

            boundary
                .mutate(
                    vec![Point2::new(-5.0, 90.0), Point2::new(105.0, 90.0)],
                    0.0,
                    100.0,
                )
                .expect("full width edit");
            assert!(boundary.is_edited());
            assert!(boundary.spans(0.0, 100.0));
            assert!((boundary.ordinate_at(40.0) - 90.0).abs() < 1e-9);
        }

        #[test]
        fn sheet_input_lookups_follow_staff_ids() {
            let input = SheetInput {
                number: 1,
                width: 100.0,
                height: 200.0,
                staves: vec![
                    Staff::new(1, 0.0, 100.0, 10.0, 30.0),
                    Staff::new(2, 0.0, 100.0, 60.0, 80.0),
                ],
                part_top_of: vec![1, 1],
                systems: vec![SystemInput::new([1, 2])],
                primitives: Vec::new(),
            };
            assert_eq!(input.staff(StaffId::new(2)).map(Staff::ordinate), Some(70.0));
            assert!(input.staff(StaffId::new(0)).is_none());
            assert!(input.staff(StaffId::new(3)).is_none());
            assert_eq!(input.part_top(StaffId::new(2)), Some(1));
        }

        #[test]
        fn sheet_input_reads_json_with_defaults() {
            let json = r#"{
                "number": 3,
                "width": 800.0,
                "height": 1000.0,
                "staves": [{"id": 1, "left": 10.0, "right": 790.0, "top": 100.0, "bottom": 140.0}],
                "part_top_of": [1],
                "primitives": [
                    {"id": 7, "kind": "bar_stick", "bounds": {"min": [10.0, 100.0], "max": [12.0, 140.0]}}
                ]
            }"#;
            let input: SheetInput = serde_json::from_str(json).expect("parse sheet input");
            assert_eq!(input.number, 3);
            assert!(input.systems.is_empty());
            assert_eq!(input.primitives[0].kind, PrimitiveKind::BarStick);
            assert_eq!(input.primitives[0].id, PrimitiveId::new(7));
        }
    }
}
