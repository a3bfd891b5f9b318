//! Tangent-plane (gnomonic) deprojection used to express pixel→sky maps.

use std::fmt;

use crate::stars::Point;

use super::{LinearTransform, Transform};

/// Pixel frame → sky coordinates through a linear map onto the tangent
/// plane followed by a gnomonic deprojection around `tangent_point`.
///
/// The linear part maps pixels to tangent-plane offsets in degrees; the
/// output is (ra, dec) in degrees. The transform carries no fittable
/// parameters: the fitter treats sky anchors through models, not through
/// this map, so the parameter capability defaults apply.
#[derive(Debug, Clone)]
pub struct TanProjection {
    pub pix_to_tangent: LinearTransform,
    /// (ra, dec) of the projection center, degrees.
    pub tangent_point: Point,
}

impl TanProjection {
    pub fn new(pix_to_tangent: LinearTransform, tangent_point: Point) -> Self {
        TanProjection {
            pix_to_tangent,
            tangent_point,
        }
    }
}

impl Transform for TanProjection {
    fn apply(&self, p: &Point) -> Point {
        let t = self.pix_to_tangent.apply(p);
        let xi = t.x.to_radians();
        let eta = t.y.to_radians();
        let ra0 = self.tangent_point.x.to_radians();
        let dec0 = self.tangent_point.y.to_radians();
        let (sin_d0, cos_d0) = dec0.sin_cos();
        let denom = cos_d0 - eta * sin_d0;
        let ra = ra0 + xi.atan2(denom);
        let dec = ((sin_d0 + eta * cos_d0) / (xi * xi + denom * denom).sqrt()).atan();
        Point::new(ra.to_degrees(), dec.to_degrees())
    }

    fn kind(&self) -> &'static str {
        "tan-projection"
    }

    fn clone_box(&self) -> Box<dyn Transform> {
        Box::new(self.clone())
    }
}

impl fmt::Display for TanProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tan projection around {} with {}",
            self.tangent_point, self.pix_to_tangent
        )
    }
}
