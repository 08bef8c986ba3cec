//! Straight-line geometry used to seed decay vertices.

use nalgebra::Vector3;

use crate::constants::EPS;

/// A straight trajectory: a point on the line and a (not necessarily unit) direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    pub point: Vector3<f64>,
    pub direction: Vector3<f64>,
}

impl Line {
    pub fn new(point: Vector3<f64>, direction: Vector3<f64>) -> Self {
        Line { point, direction }
    }
}

/// Point of closest approach between two lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosestApproach {
    /// Midpoint of the shortest segment joining the two lines.
    pub point: Vector3<f64>,
    /// Distance of closest approach.
    pub doca: f64,
}

/// Compute the point of closest approach of two lines.
///
/// Arguments
/// -----------------
/// * `first`, `second`: the two trajectories.
///
/// Return
/// ----------
/// * `None` if a direction vanishes or the lines are parallel, in which case the closest
///   approach is not a point.
pub fn closest_approach(first: &Line, second: &Line) -> Option<ClosestApproach> {
    let w0 = first.point - second.point;
    let a = first.direction.norm_squared();
    let b = first.direction.dot(&second.direction);
    let c = second.direction.norm_squared();
    let d = first.direction.dot(&w0);
    let e = second.direction.dot(&w0);

    let denom = a * c - b * b;
    if a <= EPS || c <= EPS || denom <= EPS * a * c {
        return None;
    }

    let s = (b * e - c * d) / denom;
    let t = (a * e - b * d) / denom;
    let on_first = first.point + first.direction * s;
    let on_second = second.point + second.direction * t;

    Some(ClosestApproach {
        point: (on_first + on_second) * 0.5,
        doca: (on_first - on_second).norm(),
    })
}

#[cfg(test)]
mod geometry_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_intersecting_lines() {
        let vertex = Vector3::new(0.3, -0.2, 1.0);
        let l1 = Line::new(vertex + Vector3::new(1.0, 2.0, 0.5) * 3.0, Vector3::new(1.0, 2.0, 0.5));
        let l2 = Line::new(vertex - Vector3::new(-0.4, 0.1, 2.0), Vector3::new(-0.4, 0.1, 2.0));

        let poca = closest_approach(&l1, &l2).unwrap();
        assert_relative_eq!(poca.point, vertex, epsilon = 1e-12);
        assert!(poca.doca < 1e-12);
    }

    #[test]
    fn test_skew_lines() {
        let l1 = Line::new(Vector3::new(0.0, 0.0, 0.0), Vector3::x());
        let l2 = Line::new(Vector3::new(5.0, 3.0, 1.0), Vector3::y());

        let poca = closest_approach(&l1, &l2).unwrap();
        assert_relative_eq!(poca.doca, 1.0, epsilon = 1e-12);
        assert_relative_eq!(poca.point, Vector3::new(5.0, 0.0, 0.5), epsilon = 1e-12);
    }

    #[test]
    fn test_parallel_lines() {
        let l1 = Line::new(Vector3::zeros(), Vector3::z());
        let l2 = Line::new(Vector3::x(), Vector3::z() * 2.0);
        assert!(closest_approach(&l1, &l2).is_none());

        let degenerate = Line::new(Vector3::zeros(), Vector3::zeros());
        assert!(closest_approach(&l1, &degenerate).is_none());
    }
}
