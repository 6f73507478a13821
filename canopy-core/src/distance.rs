//! Distance metrics and split-plane geometry for the forest.
//!
//! Every metric is a zero-sized type implementing [`Distance`]. The index is
//! generic over the metric, so the whole build and search path is
//! monomorphized and no dispatch happens per comparison.
//!
//! # Kernels
//!
//! The two primitive kernels, [`dot`] and [`squared_euclidean`], use 4-way
//! accumulator unrolling to break FMA dependency chains:
//! - x86_64 + AVX2/FMA: runtime detected
//! - aarch64: NEON (always available)
//! - everything else: portable scalar loop

use crate::random::RandomSource;
use anyhow::{Result, bail};
use std::fmt;
use std::str::FromStr;

/// Metric selector for callers that pick the metric at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Cosine-based distance, `sqrt(2 - 2 cos θ)` once normalized
    Angular,
    /// Straight-line L2 distance
    Euclidean,
}

impl Metric {
    /// Name used in configuration and at the C boundary
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Metric::Angular => "angular",
            Metric::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "angular" | "cosine" => Ok(Metric::Angular),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => bail!("Unknown metric '{}': expected 'angular' or 'euclidean'", other),
        }
    }
}

/// Borrowed view of a splitting hyperplane.
///
/// For [`Angular`] the offset is always zero.
#[derive(Debug, Clone, Copy)]
pub struct Hyperplane<'a> {
    /// Normal vector of the plane
    pub normal: &'a [f32],
    /// Constant term added to the projection
    pub offset: f32,
}

/// Owned hyperplane used while a split is being searched for.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPlane {
    /// Normal vector of the plane
    pub normal: Vec<f32>,
    /// Constant term added to the projection
    pub offset: f32,
}

impl SplitPlane {
    /// Zeroed plane for `dimensions`-dimensional vectors
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { normal: vec![0.0; dimensions], offset: 0.0 }
    }

    /// Borrow as a [`Hyperplane`]
    #[must_use]
    pub fn as_hyperplane(&self) -> Hyperplane<'_> {
        Hyperplane { normal: &self.normal, offset: self.offset }
    }

    /// Reset to the zero plane. Every point then has a margin of zero.
    pub fn clear(&mut self) {
        self.normal.fill(0.0);
        self.offset = 0.0;
    }
}

/// A metric the forest can be built over.
pub trait Distance: Copy + Send + Sync + 'static {
    /// Runtime tag for this metric
    const METRIC: Metric;

    /// Extra 4-byte words each record reserves for the plane offset
    const OFFSET_WORDS: usize;

    /// Raw distance between two vectors, in the metric's internal units
    fn distance(x: &[f32], y: &[f32]) -> f32;

    /// Signed projection of `y` onto the plane
    fn margin(plane: Hyperplane<'_>, y: &[f32]) -> f32;

    /// Which side of the plane `y` falls on (`true` is side 1).
    ///
    /// Points exactly on the plane are assigned by a coin flip so that
    /// coplanar sets still get separated.
    fn side<R: RandomSource + ?Sized>(plane: Hyperplane<'_>, y: &[f32], rng: &mut R) -> bool {
        let margin = Self::margin(plane, y);
        if margin != 0.0 { margin > 0.0 } else { rng.flip() }
    }

    /// Pick two distinct points at random and write the plane between them
    /// into `plane`.
    ///
    /// `points` must hold at least two vectors.
    fn create_split<R: RandomSource + ?Sized>(
        points: &[&[f32]],
        rng: &mut R,
        plane: &mut SplitPlane,
    );

    /// Convert a raw distance to user-facing units
    #[inline]
    fn normalized_distance(distance: f32) -> f32 {
        distance.max(0.0).sqrt()
    }
}

/// Angular (cosine) metric.
///
/// Raw distance is the squared chord between the unit vectors,
/// `2 - 2 cos θ`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Angular;

/// Euclidean metric. Raw distance is the squared L2 norm of the difference.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl Distance for Angular {
    const METRIC: Metric = Metric::Angular;
    const OFFSET_WORDS: usize = 0;

    #[inline]
    fn distance(x: &[f32], y: &[f32]) -> f32 {
        let pp = dot(x, x);
        let qq = dot(y, y);
        let pq = dot(x, y);
        let ppqq = pp * qq;
        if ppqq > 0.0 {
            (2.0 - 2.0 * pq / ppqq.sqrt()).max(0.0)
        } else {
            // A zero vector is maximally dissimilar to everything
            2.0
        }
    }

    #[inline]
    fn margin(plane: Hyperplane<'_>, y: &[f32]) -> f32 {
        dot(plane.normal, y)
    }

    fn create_split<R: RandomSource + ?Sized>(
        points: &[&[f32]],
        rng: &mut R,
        plane: &mut SplitPlane,
    ) {
        let (i, j) = pick_pair(points.len(), rng);
        let (x, y) = (points[i], points[j]);
        let x_norm = norm(x);
        let y_norm = norm(y);

        for ((n, &a), &b) in plane.normal.iter_mut().zip(x).zip(y) {
            *n = unit(a, x_norm) - unit(b, y_norm);
        }
        normalize(&mut plane.normal);
        plane.offset = 0.0;
    }
}

impl Distance for Euclidean {
    const METRIC: Metric = Metric::Euclidean;
    const OFFSET_WORDS: usize = 1;

    #[inline]
    fn distance(x: &[f32], y: &[f32]) -> f32 {
        squared_euclidean(x, y)
    }

    #[inline]
    fn margin(plane: Hyperplane<'_>, y: &[f32]) -> f32 {
        plane.offset + dot(plane.normal, y)
    }

    fn create_split<R: RandomSource + ?Sized>(
        points: &[&[f32]],
        rng: &mut R,
        plane: &mut SplitPlane,
    ) {
        let (i, j) = pick_pair(points.len(), rng);
        let (x, y) = (points[i], points[j]);

        // Plane through the midpoint, perpendicular to x - y
        let mut offset = 0.0;
        for ((n, &a), &b) in plane.normal.iter_mut().zip(x).zip(y) {
            *n = a - b;
            offset += -*n * (a + b) / 2.0;
        }
        plane.offset = offset;
    }
}

/// Draw two distinct indices in `[0, count)` with one draw each.
#[inline]
fn pick_pair<R: RandomSource + ?Sized>(count: usize, rng: &mut R) -> (usize, usize) {
    debug_assert!(count >= 2, "need at least two points to split");
    let i = rng.index(count);
    let mut j = rng.index(count - 1);
    if j >= i {
        j += 1;
    }
    (i, j)
}

#[inline]
fn unit(component: f32, norm: f32) -> f32 {
    if norm > 0.0 { component / norm } else { 0.0 }
}

/// L2 norm of a vector
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Scale `v` to unit length. Zero vectors are left untouched.
#[inline]
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

/// Inner product of two equal-length vectors with SIMD acceleration.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: NEON is part of the aarch64 baseline
        unsafe { dot_neon(a, b) }
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        #[cfg(target_arch = "x86_64")]
        {
            if has_avx2_fma() {
                // SAFETY: feature presence checked at runtime
                return unsafe { dot_avx2(a, b) };
            }
        }

        dot_scalar(a, b)
    }
}

/// Squared L2 distance between two equal-length vectors with SIMD
/// acceleration.
#[inline]
#[must_use]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: NEON is part of the aarch64 baseline
        unsafe { squared_euclidean_neon(a, b) }
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        #[cfg(target_arch = "x86_64")]
        {
            if has_avx2_fma() {
                // SAFETY: feature presence checked at runtime
                return unsafe { squared_euclidean_avx2(a, b) };
            }
        }

        squared_euclidean_scalar(a, b)
    }
}

/// Scalar inner product (portable fallback)
#[inline]
#[must_use]
pub fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scalar squared L2 distance (portable fallback)
#[inline]
#[must_use]
pub fn squared_euclidean_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn has_avx2_fma() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

/// Sum the 8 lanes of an AVX register
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn horizontal_sum_avx2(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let high = _mm256_extractf128_ps(v, 1);
    let low = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(low, high);
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 0x55));
    _mm_cvtss_f32(sum32)
}

/// AVX2 inner product, 32 floats per iteration over 4 accumulators
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let len = a.len().min(b.len());
    let (pa, pb) = (a.as_ptr(), b.as_ptr());
    let mut i = 0;

    let mut sum0 = _mm256_setzero_ps();
    let mut sum1 = _mm256_setzero_ps();
    let mut sum2 = _mm256_setzero_ps();
    let mut sum3 = _mm256_setzero_ps();

    while i + 32 <= len {
        // SAFETY: i + 32 <= len for both slices
        unsafe {
            sum0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), sum0);
            sum1 = _mm256_fmadd_ps(
                _mm256_loadu_ps(pa.add(i + 8)),
                _mm256_loadu_ps(pb.add(i + 8)),
                sum1,
            );
            sum2 = _mm256_fmadd_ps(
                _mm256_loadu_ps(pa.add(i + 16)),
                _mm256_loadu_ps(pb.add(i + 16)),
                sum2,
            );
            sum3 = _mm256_fmadd_ps(
                _mm256_loadu_ps(pa.add(i + 24)),
                _mm256_loadu_ps(pb.add(i + 24)),
                sum3,
            );
        }
        i += 32;
    }

    while i + 8 <= len {
        // SAFETY: i + 8 <= len for both slices
        unsafe {
            sum0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), sum0);
        }
        i += 8;
    }

    let combined = _mm256_add_ps(_mm256_add_ps(sum0, sum1), _mm256_add_ps(sum2, sum3));
    // SAFETY: same target features as this function
    let mut total = unsafe { horizontal_sum_avx2(combined) };

    while i < len {
        total += a[i] * b[i];
        i += 1;
    }

    total
}

/// AVX2 squared L2 distance, 32 floats per iteration over 4 accumulators
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn squared_euclidean_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let len = a.len().min(b.len());
    let (pa, pb) = (a.as_ptr(), b.as_ptr());
    let mut i = 0;

    let mut sum0 = _mm256_setzero_ps();
    let mut sum1 = _mm256_setzero_ps();
    let mut sum2 = _mm256_setzero_ps();
    let mut sum3 = _mm256_setzero_ps();

    while i + 32 <= len {
        // SAFETY: i + 32 <= len for both slices
        let (d0, d1, d2, d3) = unsafe {
            (
                _mm256_sub_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i))),
                _mm256_sub_ps(_mm256_loadu_ps(pa.add(i + 8)), _mm256_loadu_ps(pb.add(i + 8))),
                _mm256_sub_ps(_mm256_loadu_ps(pa.add(i + 16)), _mm256_loadu_ps(pb.add(i + 16))),
                _mm256_sub_ps(_mm256_loadu_ps(pa.add(i + 24)), _mm256_loadu_ps(pb.add(i + 24))),
            )
        };
        sum0 = _mm256_fmadd_ps(d0, d0, sum0);
        sum1 = _mm256_fmadd_ps(d1, d1, sum1);
        sum2 = _mm256_fmadd_ps(d2, d2, sum2);
        sum3 = _mm256_fmadd_ps(d3, d3, sum3);
        i += 32;
    }

    while i + 8 <= len {
        // SAFETY: i + 8 <= len for both slices
        let diff = unsafe { _mm256_sub_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i))) };
        sum0 = _mm256_fmadd_ps(diff, diff, sum0);
        i += 8;
    }

    let combined = _mm256_add_ps(_mm256_add_ps(sum0, sum1), _mm256_add_ps(sum2, sum3));
    // SAFETY: same target features as this function
    let mut total = unsafe { horizontal_sum_avx2(combined) };

    while i < len {
        let diff = a[i] - b[i];
        total += diff * diff;
        i += 1;
    }

    total
}

/// NEON inner product, 16 floats per iteration over 4 accumulators
#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let len = a.len().min(b.len());
    let (pa, pb) = (a.as_ptr(), b.as_ptr());
    let mut i = 0;

    let mut sum0 = vdupq_n_f32(0.0);
    let mut sum1 = vdupq_n_f32(0.0);
    let mut sum2 = vdupq_n_f32(0.0);
    let mut sum3 = vdupq_n_f32(0.0);

    while i + 16 <= len {
        // SAFETY: i + 16 <= len for both slices
        unsafe {
            sum0 = vfmaq_f32(sum0, vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i)));
            sum1 = vfmaq_f32(sum1, vld1q_f32(pa.add(i + 4)), vld1q_f32(pb.add(i + 4)));
            sum2 = vfmaq_f32(sum2, vld1q_f32(pa.add(i + 8)), vld1q_f32(pb.add(i + 8)));
            sum3 = vfmaq_f32(sum3, vld1q_f32(pa.add(i + 12)), vld1q_f32(pb.add(i + 12)));
        }
        i += 16;
    }

    while i + 4 <= len {
        // SAFETY: i + 4 <= len for both slices
        unsafe {
            sum0 = vfmaq_f32(sum0, vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i)));
        }
        i += 4;
    }

    let combined = vaddq_f32(vaddq_f32(sum0, sum1), vaddq_f32(sum2, sum3));
    let mut total = vaddvq_f32(combined);

    while i < len {
        total += a[i] * b[i];
        i += 1;
    }

    total
}

/// NEON squared L2 distance, 16 floats per iteration over 4 accumulators
#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn squared_euclidean_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let len = a.len().min(b.len());
    let (pa, pb) = (a.as_ptr(), b.as_ptr());
    let mut i = 0;

    let mut sum0 = vdupq_n_f32(0.0);
    let mut sum1 = vdupq_n_f32(0.0);
    let mut sum2 = vdupq_n_f32(0.0);
    let mut sum3 = vdupq_n_f32(0.0);

    while i + 16 <= len {
        // SAFETY: i + 16 <= len for both slices
        let (d0, d1, d2, d3) = unsafe {
            (
                vsubq_f32(vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i))),
                vsubq_f32(vld1q_f32(pa.add(i + 4)), vld1q_f32(pb.add(i + 4))),
                vsubq_f32(vld1q_f32(pa.add(i + 8)), vld1q_f32(pb.add(i + 8))),
                vsubq_f32(vld1q_f32(pa.add(i + 12)), vld1q_f32(pb.add(i + 12))),
            )
        };
        sum0 = vfmaq_f32(sum0, d0, d0);
        sum1 = vfmaq_f32(sum1, d1, d1);
        sum2 = vfmaq_f32(sum2, d2, d2);
        sum3 = vfmaq_f32(sum3, d3, d3);
        i += 16;
    }

    while i + 4 <= len {
        // SAFETY: i + 4 <= len for both slices
        let diff = unsafe { vsubq_f32(vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i))) };
        sum0 = vfmaq_f32(sum0, diff, diff);
        i += 4;
    }

    let combined = vaddq_f32(vaddq_f32(sum0, sum1), vaddq_f32(sum2, sum3));
    let mut total = vaddvq_f32(combined);

    while i < len {
        let diff = a[i] - b[i];
        total += diff * diff;
        i += 1;
    }

    total
}
