//! Interfaces of the Python builtins and of the `numpy` and `math` modules
//! the compiler understands.

use super::tast::{MathFunc, Reduction};
use super::types::{dtype_from_name, TypeDescriptor};

/// A callable known to the compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Range,
    Len,
    Print,
    /// `min`/`max` builtins: scalar arguments or a single array
    MinMax(Reduction),
    /// Array reductions (`np.sum`, `np.amax`, ...)
    Reduce(Reduction),
    /// Builtin `sum`, reducing along the first axis
    BuiltinSum,
    Math(MathFunc),
    /// `math.floor` / `math.ceil` return integers
    IntegerMath(MathFunc),
    /// `int(x)`, `np.float32(x)`, ...
    Cast(CastTarget),
    Complex,
    Zeros,
    Ones,
    Empty,
    Full,
    Array,
    Shape,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastTarget {
    Bool,
    Int(u16),
    Float(u16),
    Complex(u16),
}

impl CastTarget {
    pub fn descriptor(self) -> TypeDescriptor {
        use super::types::BaseKind;
        match self {
            CastTarget::Bool => TypeDescriptor::bool(),
            CastTarget::Int(bits) => TypeDescriptor::scalar(BaseKind::Int, bits),
            CastTarget::Float(bits) => TypeDescriptor::scalar(BaseKind::Float, bits),
            CastTarget::Complex(bits) => TypeDescriptor::scalar(BaseKind::Complex, bits),
        }
    }
}

/// Member of an external module
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Function(Intrinsic),
    Constant(f64),
    /// A dtype name such as `np.float64`; callable as a cast
    Dtype(TypeDescriptor),
}

pub fn builtin(name: &str) -> Option<Intrinsic> {
    let intrinsic = match name {
        "range" => Intrinsic::Range,
        "len" => Intrinsic::Len,
        "print" => Intrinsic::Print,
        "abs" => Intrinsic::Math(MathFunc::Abs),
        "min" => Intrinsic::MinMax(Reduction::Min),
        "max" => Intrinsic::MinMax(Reduction::Max),
        "sum" => Intrinsic::BuiltinSum,
        "int" => Intrinsic::Cast(CastTarget::Int(64)),
        "float" => Intrinsic::Cast(CastTarget::Float(64)),
        "bool" => Intrinsic::Cast(CastTarget::Bool),
        "complex" => Intrinsic::Complex,
        _ => return None,
    };
    Some(intrinsic)
}

pub fn numpy_member(name: &str) -> Option<Member> {
    let function = match name {
        "zeros" => Intrinsic::Zeros,
        "ones" => Intrinsic::Ones,
        "empty" => Intrinsic::Empty,
        "full" => Intrinsic::Full,
        "array" => Intrinsic::Array,
        "shape" => Intrinsic::Shape,
        "size" => Intrinsic::Size,
        "sum" => Intrinsic::Reduce(Reduction::Sum),
        "max" | "amax" => Intrinsic::Reduce(Reduction::Max),
        "min" | "amin" => Intrinsic::Reduce(Reduction::Min),
        "sqrt" => Intrinsic::Math(MathFunc::Sqrt),
        "exp" => Intrinsic::Math(MathFunc::Exp),
        "log" => Intrinsic::Math(MathFunc::Log),
        "sin" => Intrinsic::Math(MathFunc::Sin),
        "cos" => Intrinsic::Math(MathFunc::Cos),
        "tan" => Intrinsic::Math(MathFunc::Tan),
        "abs" | "absolute" => Intrinsic::Math(MathFunc::Abs),
        "floor" => Intrinsic::Math(MathFunc::Floor),
        "pi" => return Some(Member::Constant(std::f64::consts::PI)),
        "e" => return Some(Member::Constant(std::f64::consts::E)),
        other => {
            return match other {
                "int8" | "int16" | "int32" | "int64" | "float32" | "float64" | "complex64"
                | "complex128" | "bool" | "int" | "float" | "complex" => {
                    dtype_from_name(other).map(Member::Dtype)
                }
                _ => None,
            }
        }
    };
    Some(Member::Function(function))
}

pub fn math_member(name: &str) -> Option<Member> {
    let function = match name {
        "sqrt" => Intrinsic::Math(MathFunc::Sqrt),
        "exp" => Intrinsic::Math(MathFunc::Exp),
        "log" => Intrinsic::Math(MathFunc::Log),
        "sin" => Intrinsic::Math(MathFunc::Sin),
        "cos" => Intrinsic::Math(MathFunc::Cos),
        "tan" => Intrinsic::Math(MathFunc::Tan),
        "fabs" => Intrinsic::Math(MathFunc::Abs),
        "floor" => Intrinsic::IntegerMath(MathFunc::Floor),
        "ceil" => Intrinsic::IntegerMath(MathFunc::Ceil),
        "pi" => return Some(Member::Constant(std::f64::consts::PI)),
        "e" => return Some(Member::Constant(std::f64::consts::E)),
        _ => return None,
    };
    Some(Member::Function(function))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::types::Dtype;

    #[test]
    fn numpy_names_resolve() {
        assert_eq!(numpy_member("zeros"), Some(Member::Function(Intrinsic::Zeros)));
        assert_eq!(
            numpy_member("amax"),
            Some(Member::Function(Intrinsic::Reduce(Reduction::Max)))
        );
        match numpy_member("float32") {
            Some(Member::Dtype(ty)) => assert_eq!(ty.dtype(), Some(Dtype::Float32)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(numpy_member("linalg").is_none());
    }

    #[test]
    fn math_floor_is_integer_valued() {
        assert_eq!(
            math_member("floor"),
            Some(Member::Function(Intrinsic::IntegerMath(MathFunc::Floor)))
        );
        assert!(matches!(math_member("pi"), Some(Member::Constant(v)) if v == std::f64::consts::PI));
        assert!(builtin("eval").is_none());
    }
}
