use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Hyper-dual number for second-order forward mode AD.
///
/// `re + e1·ε₁ + e2·ε₂ + e12·ε₁ε₂` with `ε₁² = ε₂² = 0`.
/// Seeding `e1` on input `i` and `e2` on input `j` yields `∂f/∂x_i` in `e1`,
/// `∂f/∂x_j` in `e2` and the mixed partial `∂²f/∂x_i∂x_j` in `e12`.
/// Seeding both on the same input gives the pure second derivative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct HyperDual {
    pub re: f64,
    pub e1: f64,
    pub e2: f64,
    pub e12: f64,
}

impl HyperDual {
    pub fn new(re: f64, e1: f64, e2: f64, e12: f64) -> Self {
        Self { re, e1, e2, e12 }
    }

    pub fn constant(re: f64) -> Self {
        Self::new(re, 0.0, 0.0, 0.0)
    }

    /// Seeds a value for differentiation: `first` selects ε₁, `second` selects ε₂.
    pub fn seeded(re: f64, first: bool, second: bool) -> Self {
        Self::new(
            re,
            if first { 1.0 } else { 0.0 },
            if second { 1.0 } else { 0.0 },
            0.0,
        )
    }

    pub fn is_constant(&self) -> bool {
        self.e1 == 0.0 && self.e2 == 0.0 && self.e12 == 0.0
    }

    /// Applies a scalar function given its value and first two derivatives at `re`.
    fn chain(self, f: f64, d1: f64, d2: f64) -> Self {
        Self::new(
            f,
            d1 * self.e1,
            d1 * self.e2,
            d1 * self.e12 + d2 * self.e1 * self.e2,
        )
    }
}

/// `c * v`, exactly zero when `c` is, so vanishing power-rule terms stay finite at 0.
fn scaled(c: f64, v: f64) -> f64 {
    if c == 0.0 {
        0.0
    } else {
        c * v
    }
}

impl Zero for HyperDual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.re == 0.0 && self.is_constant()
    }
}

impl One for HyperDual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for HyperDual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.re + rhs.re,
            self.e1 + rhs.e1,
            self.e2 + rhs.e2,
            self.e12 + rhs.e12,
        )
    }
}

impl Sub for HyperDual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.re - rhs.re,
            self.e1 - rhs.e1,
            self.e2 - rhs.e2,
            self.e12 - rhs.e12,
        )
    }
}

impl Mul for HyperDual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.re * rhs.re,
            self.re * rhs.e1 + self.e1 * rhs.re,
            self.re * rhs.e2 + self.e2 * rhs.re,
            self.re * rhs.e12 + self.e1 * rhs.e2 + self.e2 * rhs.e1 + self.e12 * rhs.re,
        )
    }
}

impl Div for HyperDual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        self * rhs.recip()
    }
}

impl Neg for HyperDual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.re, -self.e1, -self.e2, -self.e12)
    }
}

impl Rem for HyperDual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d(x mod c)/dx = 1 almost everywhere; the divisor is treated as constant.
        Self::new(self.re % rhs.re, self.e1, self.e2, self.e12)
    }
}

impl AddAssign for HyperDual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for HyperDual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for HyperDual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for HyperDual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for HyperDual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for HyperDual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for HyperDual {
    fn to_i64(&self) -> Option<i64> {
        self.re.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.re.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.re)
    }
}

impl FromPrimitive for HyperDual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for HyperDual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for HyperDual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0, -0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.re.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.re.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.re.is_finite()
    }
    fn is_normal(self) -> bool {
        self.re.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.re.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.re.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.re.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.re.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.re.trunc())
    }
    fn fract(self) -> Self {
        self.chain(self.re.fract(), 1.0, 0.0)
    }
    fn abs(self) -> Self {
        let sign = if self.re >= 0.0 { 1.0 } else { -1.0 };
        self.chain(self.re.abs(), sign, 0.0)
    }
    fn signum(self) -> Self {
        Self::constant(self.re.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.re.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.re.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        let x = self.re;
        self.chain(1.0 / x, -1.0 / (x * x), 2.0 / (x * x * x))
    }

    fn powi(self, n: i32) -> Self {
        let x = self.re;
        let n_f = n as f64;
        self.chain(
            x.powi(n),
            scaled(n_f, x.powi(n - 1)),
            scaled(n_f * (n_f - 1.0), x.powi(n - 2)),
        )
    }

    fn powf(self, n: Self) -> Self {
        if n.is_constant() {
            let x = self.re;
            let c = n.re;
            self.chain(
                x.powf(c),
                scaled(c, x.powf(c - 1.0)),
                scaled(c * (c - 1.0), x.powf(c - 2.0)),
            )
        } else {
            // x^y = exp(y * ln(x))
            (self.ln() * n).exp()
        }
    }

    fn sqrt(self) -> Self {
        let s = self.re.sqrt();
        self.chain(s, 0.5 / s, -0.25 / (s * self.re))
    }

    fn exp(self) -> Self {
        let e = self.re.exp();
        self.chain(e, e, e)
    }

    fn exp2(self) -> Self {
        let f = self.re.exp2();
        let ln2 = std::f64::consts::LN_2;
        self.chain(f, f * ln2, f * ln2 * ln2)
    }
    fn ln(self) -> Self {
        let x = self.re;
        self.chain(x.ln(), 1.0 / x, -1.0 / (x * x))
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        let x = self.re;
        let ln2 = std::f64::consts::LN_2;
        self.chain(x.log2(), 1.0 / (x * ln2), -1.0 / (x * x * ln2))
    }
    fn log10(self) -> Self {
        let x = self.re;
        let ln10 = std::f64::consts::LN_10;
        self.chain(x.log10(), 1.0 / (x * ln10), -1.0 / (x * x * ln10))
    }

    fn max(self, other: Self) -> Self {
        if self.re >= other.re {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.re <= other.re {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.re > other.re {
            self - other
        } else {
            Self::zero()
        }
    }

    fn cbrt(self) -> Self {
        let f = self.re.cbrt();
        self.chain(f, 1.0 / (3.0 * f * f), -2.0 / (9.0 * f.powi(5)))
    }
    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }

    fn sin(self) -> Self {
        let (s, c) = self.re.sin_cos();
        self.chain(s, c, -s)
    }
    fn cos(self) -> Self {
        let (s, c) = self.re.sin_cos();
        self.chain(c, -s, -c)
    }
    fn tan(self) -> Self {
        let t = self.re.tan();
        let sec2 = 1.0 + t * t;
        self.chain(t, sec2, 2.0 * t * sec2)
    }
    fn asin(self) -> Self {
        let x = self.re;
        let q = 1.0 - x * x;
        self.chain(x.asin(), 1.0 / q.sqrt(), x / (q * q.sqrt()))
    }
    fn acos(self) -> Self {
        let x = self.re;
        let q = 1.0 - x * x;
        self.chain(x.acos(), -1.0 / q.sqrt(), -x / (q * q.sqrt()))
    }
    fn atan(self) -> Self {
        let x = self.re;
        let q = 1.0 + x * x;
        self.chain(x.atan(), 1.0 / q, -2.0 * x / (q * q))
    }
    fn atan2(self, other: Self) -> Self {
        let angle = (self / other).atan();
        Self {
            re: self.re.atan2(other.re),
            ..angle
        }
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        let e = self.re.exp();
        self.chain(self.re.exp_m1(), e, e)
    }
    fn ln_1p(self) -> Self {
        let q = 1.0 + self.re;
        self.chain(self.re.ln_1p(), 1.0 / q, -1.0 / (q * q))
    }
    fn sinh(self) -> Self {
        let (s, c) = (self.re.sinh(), self.re.cosh());
        self.chain(s, c, s)
    }
    fn cosh(self) -> Self {
        let (s, c) = (self.re.sinh(), self.re.cosh());
        self.chain(c, s, c)
    }
    fn tanh(self) -> Self {
        let t = self.re.tanh();
        let d1 = 1.0 - t * t;
        self.chain(t, d1, -2.0 * t * d1)
    }
    fn asinh(self) -> Self {
        let x = self.re;
        let q = x * x + 1.0;
        self.chain(x.asinh(), 1.0 / q.sqrt(), -x / (q * q.sqrt()))
    }
    fn acosh(self) -> Self {
        let x = self.re;
        let q = x * x - 1.0;
        self.chain(x.acosh(), 1.0 / q.sqrt(), -x / (q * q.sqrt()))
    }
    fn atanh(self) -> Self {
        let x = self.re;
        let q = 1.0 - x * x;
        self.chain(x.atanh(), 1.0 / q, 2.0 * x / (q * q))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.re.integer_decode()
    }
}
