//! Typed band-math expressions.
//!
//! Index formulas are built as operator trees with ordinary Rust arithmetic
//! (`(nir - red) / (nir + red)`) and evaluated array-wise against anything
//! that can hand out named layers. Validity propagates through every node: a
//! result pixel is valid only when all operands were valid there and no
//! division degenerated.

use crate::core::unmix::UnmixingResult;
use crate::types::{
    log_pixel_faults, BandName, FusionError, FusionResult, PixelFault, Raster, Scene,
};
use ndarray::{Array2, Zip};
use std::ops::{Add, Div, Mul, Sub};

/// Denominators with a smaller magnitude make the pixel no-data
pub const DEGENERATE_DENOMINATOR: f64 = 1e-9;

/// Arithmetic over named layers
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A named layer of the source: a canonical band or an endmember fraction
    Band(String),
    Const(f64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn band(name: BandName) -> Self {
        Expr::Band(name.as_str().to_string())
    }

    pub fn fraction(name: &str) -> Self {
        Expr::Band(name.to_string())
    }

    pub fn constant(value: f64) -> Self {
        Expr::Const(value)
    }

    /// Normalized difference `(a - b) / (a + b)`
    pub fn normalized_difference(a: Expr, b: Expr) -> Self {
        (a.clone() - b.clone()) / (a + b)
    }

    /// Names of every layer the expression reads, in first-use order
    pub fn layers(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_layers(&mut names);
        names
    }

    fn collect_layers<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Band(name) => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Expr::Const(_) => {}
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.collect_layers(names);
                b.collect_layers(names);
            }
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Band(name) => write!(f, "{}", name),
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Add(a, b) => write!(f, "({} + {})", a, b),
            Expr::Sub(a, b) => write!(f, "({} - {})", a, b),
            Expr::Mul(a, b) => write!(f, "({} * {})", a, b),
            Expr::Div(a, b) => write!(f, "({} / {})", a, b),
        }
    }
}

macro_rules! impl_expr_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(self), Box::new(rhs))
            }
        }

        impl $trait<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::$variant(Box::new(self), Box::new(Expr::Const(rhs)))
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(Expr::Const(self)), Box::new(rhs))
            }
        }
    };
}

impl_expr_op!(Add, add, Add);
impl_expr_op!(Sub, sub, Sub);
impl_expr_op!(Mul, mul, Mul);
impl_expr_op!(Div, div, Div);

/// Anything that can provide named `f32` layers of a common shape
pub trait BandSource {
    fn layer(&self, name: &str, operation: &str) -> FusionResult<Raster<f32>>;

    fn dim(&self) -> (usize, usize);
}

impl BandSource for Scene {
    fn layer(&self, name: &str, operation: &str) -> FusionResult<Raster<f32>> {
        let band_name: BandName = name.parse().map_err(|_| FusionError::MissingBand {
            band: name.to_string(),
            sensor: self.sensor().to_string(),
            operation: operation.to_string(),
        })?;
        Ok(self.require_band(band_name, operation)?.to_f32())
    }

    fn dim(&self) -> (usize, usize) {
        Scene::dim(self)
    }
}

impl BandSource for UnmixingResult {
    fn layer(&self, name: &str, operation: &str) -> FusionResult<Raster<f32>> {
        self.fraction(name)
            .cloned()
            .ok_or_else(|| FusionError::MissingBand {
                band: name.to_string(),
                sensor: "unmixing result".to_string(),
                operation: operation.to_string(),
            })
    }

    fn dim(&self) -> (usize, usize) {
        UnmixingResult::dim(self)
    }
}

/// Intermediate value of an evaluation
enum Value {
    Scalar(f64),
    Grid { values: Array2<f64>, valid: Array2<bool> },
}

/// Evaluate an expression over a source.
///
/// `operation` names the caller in errors and fault logs.
pub fn evaluate(expr: &Expr, source: &dyn BandSource, operation: &str) -> FusionResult<Raster<f32>> {
    let dim = source.dim();
    let mut degenerate = 0usize;
    let value = eval_node(expr, source, operation, &mut degenerate)?;

    log_pixel_faults(
        operation,
        std::iter::repeat(PixelFault::DegenerateDenominator).take(degenerate),
    );

    match value {
        Value::Scalar(v) => {
            let raster = Raster::new(Array2::from_elem(dim, v as f32));
            if v.is_finite() {
                Ok(raster)
            } else {
                Ok(Raster::no_data(dim, 0.0))
            }
        }
        Value::Grid { values, valid } => {
            if values.dim() != dim {
                return Err(FusionError::ShapeMismatch {
                    operation: operation.to_string(),
                    expected: dim,
                    found: values.dim(),
                });
            }
            Raster::with_validity(values.mapv(|v| v as f32), valid)
        }
    }
}

fn eval_node(
    expr: &Expr,
    source: &dyn BandSource,
    operation: &str,
    degenerate: &mut usize,
) -> FusionResult<Value> {
    match expr {
        Expr::Const(v) => Ok(Value::Scalar(*v)),
        Expr::Band(name) => {
            let raster = source.layer(name, operation)?;
            Ok(Value::Grid {
                values: raster.values().mapv(f64::from),
                valid: raster.validity().to_owned(),
            })
        }
        Expr::Add(a, b) => binary(a, b, source, operation, degenerate, |x, y| Some(x + y)),
        Expr::Sub(a, b) => binary(a, b, source, operation, degenerate, |x, y| Some(x - y)),
        Expr::Mul(a, b) => binary(a, b, source, operation, degenerate, |x, y| Some(x * y)),
        Expr::Div(a, b) => binary(a, b, source, operation, degenerate, safe_divide),
    }
}

/// `None` marks a degenerate quotient
fn safe_divide(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator.abs() < DEGENERATE_DENOMINATOR {
        return None;
    }
    let quotient = numerator / denominator;
    if quotient.is_finite() {
        Some(quotient)
    } else {
        None
    }
}

fn binary<F>(
    a: &Expr,
    b: &Expr,
    source: &dyn BandSource,
    operation: &str,
    degenerate: &mut usize,
    op: F,
) -> FusionResult<Value>
where
    F: Fn(f64, f64) -> Option<f64> + Sync + Send,
{
    let left = eval_node(a, source, operation, degenerate)?;
    let right = eval_node(b, source, operation, degenerate)?;

    let (values, valid) = match (left, right) {
        (Value::Scalar(x), Value::Scalar(y)) => {
            return Ok(match op(x, y) {
                Some(v) => Value::Scalar(v),
                // A degenerate constant sub-expression poisons every pixel
                None => Value::Scalar(f64::NAN),
            });
        }
        (Value::Grid { values, valid }, Value::Scalar(y)) => {
            combine_scalar(&values, &valid, |x| op(x, y))
        }
        (Value::Scalar(x), Value::Grid { values, valid }) => {
            combine_scalar(&values, &valid, |y| op(x, y))
        }
        (
            Value::Grid {
                values: lv,
                valid: lok,
            },
            Value::Grid {
                values: rv,
                valid: rok,
            },
        ) => {
            if lv.dim() != rv.dim() {
                return Err(FusionError::ShapeMismatch {
                    operation: operation.to_string(),
                    expected: lv.dim(),
                    found: rv.dim(),
                });
            }
            combine_grids(&lv, &lok, &rv, &rok, &op)
        }
    };

    // Pixels that were valid going in but failed the operation
    *degenerate += valid.1;
    Ok(Value::Grid {
        values,
        valid: valid.0,
    })
}

type Combined = (Array2<f64>, (Array2<bool>, usize));

fn combine_scalar<F>(values: &Array2<f64>, valid: &Array2<bool>, op: F) -> Combined
where
    F: Fn(f64) -> Option<f64> + Sync + Send,
{
    let apply = |&v: &f64, &ok: &bool| {
        if !ok {
            return (0.0, false, false);
        }
        match op(v) {
            Some(out) if out.is_finite() => (out, true, false),
            _ => (0.0, false, true),
        }
    };

    #[cfg(feature = "parallel")]
    let results = Zip::from(values).and(valid).par_map_collect(apply);
    #[cfg(not(feature = "parallel"))]
    let results = Zip::from(values).and(valid).map_collect(apply);

    split(results)
}

fn combine_grids<F>(
    lv: &Array2<f64>,
    lok: &Array2<bool>,
    rv: &Array2<f64>,
    rok: &Array2<bool>,
    op: &F,
) -> Combined
where
    F: Fn(f64, f64) -> Option<f64> + Sync + Send,
{
    let apply = |&x: &f64, &xo: &bool, &y: &f64, &yo: &bool| {
        if !(xo && yo) {
            return (0.0, false, false);
        }
        match op(x, y) {
            Some(out) if out.is_finite() => (out, true, false),
            _ => (0.0, false, true),
        }
    };

    #[cfg(feature = "parallel")]
    let results = Zip::from(lv).and(lok).and(rv).and(rok).par_map_collect(apply);
    #[cfg(not(feature = "parallel"))]
    let results = Zip::from(lv).and(lok).and(rv).and(rok).map_collect(apply);

    split(results)
}

/// Unzip (value, valid, degenerate) triples
fn split(results: Array2<(f64, bool, bool)>) -> Combined {
    let values = results.mapv(|(v, _, _)| v);
    let valid = results.mapv(|(_, ok, _)| ok);
    let degenerate = results.iter().filter(|(_, _, bad)| *bad).count();
    (values, (valid, degenerate))
}
