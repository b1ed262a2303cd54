//! Planar similarity/affine transforms and tracked feature points.
//!
//! A [`Transform`] is the 2x3 matrix `[a b tx; c d ty]` over `f64`, with the
//! implicit third row `[0 0 1]`. It is the currency of the whole pipeline:
//! the estimator produces one per frame, the smoother averages them, and the
//! warp consumes the averaged result.

/// Largest translation, in pixels, that a sane inter-frame transform carries.
pub(crate) const MAX_REASONABLE_TRANSLATION: f64 = 200.0;

/// Smallest/largest scale factor that a sane inter-frame transform carries.
pub(crate) const REASONABLE_SCALE_RANGE: (f64, f64) = (0.5, 2.0);

const IDENTITY_EPSILON: f64 = 1e-9;

/// A 2x3 affine transform `[a b tx; c d ty]`.
///
/// Copied by value everywhere; the engine never hands out references to
/// transforms it keeps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Row 0, column 0: x scale/rotation term.
    pub a: f64,
    /// Row 0, column 1: x shear/rotation term.
    pub b: f64,
    /// Row 0, column 2: x translation in pixels.
    pub tx: f64,
    /// Row 1, column 0: y shear/rotation term.
    pub c: f64,
    /// Row 1, column 1: y scale/rotation term.
    pub d: f64,
    /// Row 1, column 2: y translation in pixels.
    pub ty: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Transform::identity()
    }
}

impl Transform {
    /// The identity transform.
    pub const IDENTITY: Transform = Transform {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        c: 0.0,
        d: 1.0,
        ty: 0.0,
    };

    /// Returns the identity transform.
    #[inline]
    pub fn identity() -> Self {
        Transform::IDENTITY
    }

    /// Builds a transform from its six matrix entries, row-major.
    #[inline]
    pub fn new(a: f64, b: f64, tx: f64, c: f64, d: f64, ty: f64) -> Self {
        Transform { a, b, tx, c, d, ty }
    }

    /// Builds a pure translation.
    #[inline]
    pub fn translation(tx: f64, ty: f64) -> Self {
        Transform {
            tx,
            ty,
            ..Transform::IDENTITY
        }
    }

    /// Builds a similarity transform from scale, rotation (radians) and
    /// translation.
    pub fn similarity(scale: f64, angle: f64, tx: f64, ty: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Transform {
            a: scale * cos,
            b: -scale * sin,
            tx,
            c: scale * sin,
            d: scale * cos,
            ty,
        }
    }

    /// The x translation component, in pixels.
    #[inline]
    pub fn translate_x(&self) -> f64 {
        self.tx
    }

    /// The y translation component, in pixels.
    #[inline]
    pub fn translate_y(&self) -> f64 {
        self.ty
    }

    /// The uniform scale factor encoded in the first row.
    #[inline]
    pub fn scale(&self) -> f64 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    /// The rotation angle, in radians.
    #[inline]
    pub fn rotation(&self) -> f64 {
        self.c.atan2(self.a)
    }

    /// Applies the transform to a point.
    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.tx,
            self.c * x + self.d * y + self.ty,
        )
    }

    /// Composes two transforms: the result maps a point through `self`, then
    /// through `other`.
    pub fn compose(&self, other: &Transform) -> Transform {
        Transform {
            a: other.a * self.a + other.b * self.c,
            b: other.a * self.b + other.b * self.d,
            tx: other.a * self.tx + other.b * self.ty + other.tx,
            c: other.c * self.a + other.d * self.c,
            d: other.c * self.b + other.d * self.d,
            ty: other.c * self.tx + other.d * self.ty + other.ty,
        }
    }

    /// Element-wise linear interpolation between `self` (`t = 0`) and `other`
    /// (`t = 1`).
    ///
    /// No polar decomposition: the smoothing windows this feeds are short
    /// enough that element-wise blending is accurate, and it avoids the trig
    /// cost on the per-frame path.
    pub fn lerp(&self, other: &Transform, t: f64) -> Transform {
        let mix = |x: f64, y: f64| x + (y - x) * t;
        Transform {
            a: mix(self.a, other.a),
            b: mix(self.b, other.b),
            tx: mix(self.tx, other.tx),
            c: mix(self.c, other.c),
            d: mix(self.d, other.d),
            ty: mix(self.ty, other.ty),
        }
    }

    /// Inverts the transform. Returns `None` when the linear part is
    /// singular (or numerically indistinguishable from singular).
    pub fn invert(&self) -> Option<Transform> {
        let det = self.a * self.d - self.b * self.c;
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let a = self.d * inv_det;
        let b = -self.b * inv_det;
        let c = -self.c * inv_det;
        let d = self.a * inv_det;
        Some(Transform {
            a,
            b,
            tx: -(a * self.tx + b * self.ty),
            c,
            d,
            ty: -(c * self.tx + d * self.ty),
        })
    }

    /// Whether every entry is finite.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.a.is_finite()
            && self.b.is_finite()
            && self.tx.is_finite()
            && self.c.is_finite()
            && self.d.is_finite()
            && self.ty.is_finite()
    }

    /// Whether every entry is within `1e-9` of the identity.
    pub fn is_identity(&self) -> bool {
        (self.a - 1.0).abs() < IDENTITY_EPSILON
            && self.b.abs() < IDENTITY_EPSILON
            && self.tx.abs() < IDENTITY_EPSILON
            && self.c.abs() < IDENTITY_EPSILON
            && (self.d - 1.0).abs() < IDENTITY_EPSILON
            && self.ty.abs() < IDENTITY_EPSILON
    }

    /// Whether the transform describes a plausible inter-frame camera motion:
    /// all entries finite, translation within 200 px on each axis, and scale
    /// between 0.5x and 2x.
    pub fn is_reasonable(&self) -> bool {
        if !self.is_finite() {
            return false;
        }
        if self.tx.abs() > MAX_REASONABLE_TRANSLATION || self.ty.abs() > MAX_REASONABLE_TRANSLATION
        {
            return false;
        }
        let scale = self.scale();
        scale >= REASONABLE_SCALE_RANGE.0 && scale <= REASONABLE_SCALE_RANGE.1
    }
}

/// A tracked feature position in pixel coordinates.
///
/// Points are allowed to fall outside the frame bounds; the tracker emits
/// out-of-bounds positions and the estimator filters them.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    /// Horizontal position in pixels.
    pub x: f32,
    /// Vertical position in pixels.
    pub y: f32,
}

impl Point {
    /// Builds a point from its coordinates.
    #[inline]
    pub fn new(x: f32, y: f32) -> Self {
        Point { x, y }
    }

    /// Squared Euclidean distance to `other`.
    #[inline]
    pub fn distance_sq(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Whether both coordinates are finite.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}
