//! Quality indicators computed after an algorithm reported a Pareto front.

/// Dominated hypervolume (S-metric) of a minimization front.
///
/// Each objective is inverted against the front's maximum and shifted by one,
/// `max - v + 1`, so no point lies on an axis; the volume is then measured
/// against the origin as a maximization problem. Points with a different
/// dimension than the first are ignored.
pub fn s_metric(front: &[Vec<f64>]) -> f64 {
    let Some(first) = front.first() else {
        return 0.0;
    };
    let k = first.len();
    if k == 0 {
        return 0.0;
    }
    let points: Vec<&Vec<f64>> = front.iter().filter(|p| p.len() == k).collect();

    let max: Vec<f64> = (0..k)
        .map(|i| points.iter().map(|p| p[i]).fold(f64::NEG_INFINITY, f64::max))
        .collect();
    let inverted: Vec<Vec<f64>> = points
        .iter()
        .map(|p| p.iter().zip(&max).map(|(v, m)| m - v + 1.0).collect())
        .collect();

    hypervolume(inverted, k)
}

/// Volume dominated by `points` (maximization, reference point at the
/// origin), computed by slicing along the last objective.
fn hypervolume(mut points: Vec<Vec<f64>>, k: usize) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    if k == 1 {
        return points.iter().map(|p| p[0]).fold(0.0, f64::max);
    }

    let last = k - 1;
    points.sort_by(|a, b| b[last].total_cmp(&a[last]));

    let mut volume = 0.0;
    for i in 0..points.len() {
        let upper = points[i][last];
        let lower = points.get(i + 1).map_or(0.0, |p| p[last]);
        let depth = upper - lower;
        if depth <= 0.0 {
            continue;
        }
        let slice: Vec<Vec<f64>> = points[..=i].iter().map(|p| p[..last].to_vec()).collect();
        volume += depth * hypervolume(slice, last);
    }
    volume
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_front() {
        assert_eq!(s_metric(&[]), 0.0);
    }

    #[test]
    fn single_point_is_unit_box() {
        assert_eq!(s_metric(&[vec![4.0, 9.0]]), 1.0);
    }

    #[test]
    fn two_point_front() {
        // Inverted: (2, 1) and (1, 2); union of the two boxes is 3.
        let front = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
        assert!((s_metric(&front) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn dominated_points_add_nothing() {
        let front = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
        let mut with_dominated = front.clone();
        with_dominated.push(vec![2.0, 2.0]);
        assert!((s_metric(&front) - s_metric(&with_dominated)).abs() < 1e-9);
    }

    #[test]
    fn three_objectives() {
        // Inverted: (2,1,1), (1,2,1), (1,1,2): three boxes of volume 2
        // overlapping pairwise and jointly in the unit cube.
        let front = vec![
            vec![1.0, 2.0, 2.0],
            vec![2.0, 1.0, 2.0],
            vec![2.0, 2.0, 1.0],
        ];
        assert!((s_metric(&front) - 4.0).abs() < 1e-9);
    }
}
