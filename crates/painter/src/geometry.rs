use model::LocalPoint;

/// Oriented rectangle swept by the implement over one sub-step.
///
/// `u` runs along `dir` from `origin`, `v` along the left normal. Epsilons
/// widen the accepted range so neighbouring strips share their seam pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Strip {
    pub origin: LocalPoint,
    pub dir: (f64, f64),
    pub length: f64,
    pub half_width: f64,
    pub eps_u: f64,
    pub eps_left: f64,
    pub eps_right: f64,
}

impl Strip {
    fn normal(&self) -> (f64, f64) {
        (-self.dir.1, self.dir.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        let rel_x = x - self.origin.x;
        let rel_y = y - self.origin.y;
        let (normal_x, normal_y) = self.normal();
        let u = rel_x * self.dir.0 + rel_y * self.dir.1;
        let v = rel_x * normal_x + rel_y * normal_y;
        u >= -self.eps_u
            && u <= self.length + self.eps_u
            && v >= -(self.half_width + self.eps_right)
            && v <= self.half_width + self.eps_left
    }

    /// Axis-aligned bounds of the tolerance-expanded rectangle.
    pub fn bounds(&self) -> (LocalPoint, LocalPoint) {
        let (normal_x, normal_y) = self.normal();
        let u_range = [-self.eps_u, self.length + self.eps_u];
        let v_range = [
            -(self.half_width + self.eps_right),
            self.half_width + self.eps_left,
        ];
        let mut min = LocalPoint::new(f64::INFINITY, f64::INFINITY);
        let mut max = LocalPoint::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for u in u_range {
            for v in v_range {
                let x = self.origin.x + u * self.dir.0 + v * normal_x;
                let y = self.origin.y + u * self.dir.1 + v * normal_y;
                min.x = min.x.min(x);
                min.y = min.y.min(y);
                max.x = max.x.max(x);
                max.y = max.y.max(y);
            }
        }
        (min, max)
    }
}

/// Wraps an angle difference into `(-pi, pi]`.
pub(crate) fn wrap_angle(radians: f64) -> f64 {
    let wrapped = radians.rem_euclid(std::f64::consts::TAU);
    if wrapped > std::f64::consts::PI {
        wrapped - std::f64::consts::TAU
    } else {
        wrapped
    }
}

pub(crate) fn offset(point: LocalPoint, dir: (f64, f64), distance: f64) -> LocalPoint {
    LocalPoint::new(point.x + dir.0 * distance, point.y + dir.1 * distance)
}
