use std::ops::Range;

/// One display point: the extent of a run of samples starting at `t`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlotPoint {
    /// Seconds from the start of the buffer.
    pub t: f64,
    pub min: f32,
    pub max: f32,
}

impl PlotPoint {
    pub fn sample(t: f64, value: f32) -> Self {
        Self {
            t,
            min: value,
            max: value,
        }
    }
}

/// Index range of bucket `i` when `len` samples are split into `buckets`
/// equal-width buckets. Widths differ by at most one sample.
pub fn bucket_bounds(len: usize, buckets: usize, i: usize) -> Range<usize> {
    let start = i * len / buckets;
    let end = (i + 1) * len / buckets;
    start..end
}

/// Min/max-per-bucket reduction of uniformly sampled data.
///
/// Buffers no longer than `max_points` come back one point per sample.
pub fn decimate(samples: &[f32], dt: f64, max_points: usize) -> Vec<PlotPoint> {
    let max_points = max_points.max(1);
    if samples.len() <= max_points {
        return samples
            .iter()
            .enumerate()
            .map(|(i, &v)| PlotPoint::sample(i as f64 * dt, v))
            .collect();
    }

    (0..max_points)
        .map(|i| {
            let bucket = bucket_bounds(samples.len(), max_points, i);
            let t = bucket.start as f64 * dt;
            let (min, max) = samples[bucket]
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            PlotPoint { t, min, max }
        })
        .collect()
}

/// Further reduces already decimated points, merging extents.
pub fn decimate_points(points: &[PlotPoint], max_points: usize) -> Vec<PlotPoint> {
    let max_points = max_points.max(1);
    if points.len() <= max_points {
        return points.to_vec();
    }
    (0..max_points)
        .map(|i| {
            let bucket = &points[bucket_bounds(points.len(), max_points, i)];
            bucket.iter().skip(1).fold(bucket[0], |acc, p| PlotPoint {
                t: acc.t,
                min: acc.min.min(p.min),
                max: acc.max.max(p.max),
            })
        })
        .collect()
}
