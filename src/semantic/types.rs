//! Type descriptors: dtype, precision, rank, shape, memory order, constness.

use crate::parser::{AnnotatedType, ArrayOrder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base kind ordered along the numeric promotion lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BaseKind {
    Bool,
    Int,
    Float,
    Complex,
    Str,
    Void,
    Tuple,
}

impl BaseKind {
    pub fn is_numeric(&self) -> bool {
        matches!(self, BaseKind::Bool | BaseKind::Int | BaseKind::Float | BaseKind::Complex)
    }

    pub fn default_precision(&self) -> u16 {
        match self {
            BaseKind::Bool => 8,
            BaseKind::Int | BaseKind::Float => 64,
            BaseKind::Complex => 128,
            _ => 0,
        }
    }
}

/// Memory order of arrays with rank > 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Order {
    #[default]
    C,
    F,
}

impl From<ArrayOrder> for Order {
    fn from(order: ArrayOrder) -> Self {
        match order {
            ArrayOrder::C => Order::C,
            ArrayOrder::F => Order::F,
        }
    }
}

/// One array dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Known(i64),
    Unknown,
}

/// Concrete element dtype crossing the native boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Complex64,
    Complex128,
}

impl Dtype {
    /// Numeric code stored in `pyaot_arg.dtype`
    pub fn code(self) -> i32 {
        match self {
            Dtype::Bool => 0,
            Dtype::Int8 => 1,
            Dtype::Int16 => 2,
            Dtype::Int32 => 3,
            Dtype::Int64 => 4,
            Dtype::Float32 => 5,
            Dtype::Float64 => 6,
            Dtype::Complex64 => 7,
            Dtype::Complex128 => 8,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        const ALL: [Dtype; 9] = [
            Dtype::Bool,
            Dtype::Int8,
            Dtype::Int16,
            Dtype::Int32,
            Dtype::Int64,
            Dtype::Float32,
            Dtype::Float64,
            Dtype::Complex64,
            Dtype::Complex128,
        ];
        ALL.into_iter().find(|d| d.code() == code)
    }

    pub fn size(self) -> usize {
        match self {
            Dtype::Bool | Dtype::Int8 => 1,
            Dtype::Int16 => 2,
            Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Float64 | Dtype::Complex64 => 8,
            Dtype::Complex128 => 16,
        }
    }

    pub fn kind(self) -> BaseKind {
        match self {
            Dtype::Bool => BaseKind::Bool,
            Dtype::Int8 | Dtype::Int16 | Dtype::Int32 | Dtype::Int64 => BaseKind::Int,
            Dtype::Float32 | Dtype::Float64 => BaseKind::Float,
            Dtype::Complex64 | Dtype::Complex128 => BaseKind::Complex,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::Bool => "bool",
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Complex64 => "complex64",
            Dtype::Complex128 => "complex128",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved type of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    pub kind: BaseKind,
    /// Width in bits (complex counts both parts)
    pub precision: u16,
    pub rank: usize,
    pub shape: Vec<Dim>,
    pub order: Order,
    pub is_const: bool,
    /// Member types of a tuple
    pub elements: Vec<TypeDescriptor>,
}

impl TypeDescriptor {
    pub fn scalar(kind: BaseKind, precision: u16) -> Self {
        Self {
            kind,
            precision,
            rank: 0,
            shape: Vec::new(),
            order: Order::C,
            is_const: false,
            elements: Vec::new(),
        }
    }

    pub fn of_kind(kind: BaseKind) -> Self {
        Self::scalar(kind, kind.default_precision())
    }

    pub fn int() -> Self {
        Self::of_kind(BaseKind::Int)
    }

    pub fn float() -> Self {
        Self::of_kind(BaseKind::Float)
    }

    pub fn complex() -> Self {
        Self::of_kind(BaseKind::Complex)
    }

    pub fn bool() -> Self {
        Self::of_kind(BaseKind::Bool)
    }

    pub fn str() -> Self {
        Self::of_kind(BaseKind::Str)
    }

    pub fn void() -> Self {
        Self::of_kind(BaseKind::Void)
    }

    pub fn tuple(elements: Vec<TypeDescriptor>) -> Self {
        Self {
            elements,
            ..Self::of_kind(BaseKind::Tuple)
        }
    }

    pub fn from_dtype(dtype: Dtype) -> Self {
        let precision = (dtype.size() * 8) as u16;
        Self::scalar(dtype.kind(), precision)
    }

    /// Array of this element type with unknown extents
    pub fn array(&self, rank: usize, order: Order) -> Self {
        Self {
            rank,
            shape: vec![Dim::Unknown; rank],
            order,
            ..self.element()
        }
    }

    pub fn with_shape(mut self, shape: Vec<Dim>) -> Self {
        self.rank = shape.len();
        self.shape = shape;
        self
    }

    /// Scalar type of one element
    pub fn element(&self) -> Self {
        Self::scalar(self.kind, self.precision)
    }

    pub fn is_scalar(&self) -> bool {
        self.rank == 0 && self.kind != BaseKind::Tuple
    }

    pub fn is_array(&self) -> bool {
        self.rank > 0
    }

    pub fn is_numeric(&self) -> bool {
        self.kind.is_numeric()
    }

    pub fn is_integer(&self) -> bool {
        self.kind == BaseKind::Int
    }

    pub fn dtype(&self) -> Option<Dtype> {
        let dtype = match (self.kind, self.precision) {
            (BaseKind::Bool, _) => Dtype::Bool,
            (BaseKind::Int, 8) => Dtype::Int8,
            (BaseKind::Int, 16) => Dtype::Int16,
            (BaseKind::Int, 32) => Dtype::Int32,
            (BaseKind::Int, 64) => Dtype::Int64,
            (BaseKind::Float, 32) => Dtype::Float32,
            (BaseKind::Float, 64) => Dtype::Float64,
            (BaseKind::Complex, 64) => Dtype::Complex64,
            (BaseKind::Complex, 128) => Dtype::Complex128,
            _ => return None,
        };
        Some(dtype)
    }

    /// Same base kind, rank and element precision. Shapes are not compared.
    pub fn compatible(&self, other: &TypeDescriptor) -> bool {
        self.kind == other.kind
            && self.rank == other.rank
            && self.precision == other.precision
            && self.elements.len() == other.elements.len()
            && self.elements.iter().zip(&other.elements).all(|(a, b)| a.compatible(b))
    }

    /// Whether a value of type `value` may be stored into a slot of this
    /// type: exact match, or numeric widening. A scalar stored into an
    /// array slot is broadcast, which always converts it.
    pub fn accepts(&self, value: &TypeDescriptor) -> Storage {
        if self.compatible(value) {
            return Storage::Exact;
        }
        if !self.is_numeric() || !value.is_numeric() || value.rank > self.rank {
            return Storage::Incompatible;
        }
        if value.rank == 0 && self.rank > 0 {
            return match self.element().accepts(value) {
                Storage::Incompatible => Storage::Incompatible,
                Storage::Exact | Storage::Promote => Storage::Promote,
            };
        }
        if value.rank != self.rank {
            return Storage::Incompatible;
        }
        let widening = value.kind < self.kind
            || (value.kind == self.kind && value.precision < self.precision);
        if widening && (value.rank == 0 || value.kind == self.kind) {
            Storage::Promote
        } else {
            Storage::Incompatible
        }
    }

    /// Result element type of an arithmetic operation on two scalars
    pub fn promote(a: &TypeDescriptor, b: &TypeDescriptor) -> Option<TypeDescriptor> {
        if !a.is_numeric() || !b.is_numeric() {
            return None;
        }
        let kind = a.kind.max(b.kind);
        let precision = [a, b]
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.precision)
            .max()
            .unwrap_or_else(|| kind.default_precision());
        Some(TypeDescriptor::scalar(kind, precision))
    }

    /// Combine the array part of two operands. One side may be a scalar;
    /// otherwise ranks must agree and known extents must match.
    pub fn broadcast(a: &TypeDescriptor, b: &TypeDescriptor) -> Result<(usize, Vec<Dim>, Order), String> {
        match (a.rank, b.rank) {
            (0, 0) => Ok((0, Vec::new(), Order::C)),
            (_, 0) => Ok((a.rank, a.shape.clone(), a.order)),
            (0, _) => Ok((b.rank, b.shape.clone(), b.order)),
            (ra, rb) if ra != rb => Err(format!("cannot combine arrays of rank {} and {}", ra, rb)),
            _ => {
                if a.rank > 1 && a.order != b.order {
                    return Err("cannot combine arrays with different memory orders".to_string());
                }
                let mut shape = Vec::with_capacity(a.rank);
                for (da, db) in a.shape.iter().zip(&b.shape) {
                    let dim = match (da, db) {
                        (Dim::Known(x), Dim::Known(y)) if x != y => {
                            return Err(format!("array extents {} and {} differ", x, y));
                        }
                        (Dim::Known(x), _) | (_, Dim::Known(x)) => Dim::Known(*x),
                        _ => Dim::Unknown,
                    };
                    shape.push(dim);
                }
                Ok((a.rank, shape, a.order))
            }
        }
    }

    /// Build a descriptor from one annotation alternative
    pub fn from_annotated(annotated: &AnnotatedType) -> Result<TypeDescriptor, String> {
        let element = dtype_from_name(&annotated.dtype)
            .ok_or_else(|| format!("unknown type '{}'", annotated.dtype))?;
        if annotated.rank > 0 && !element.is_numeric() {
            return Err(format!("arrays of '{}' are not supported", annotated.dtype));
        }
        let order = annotated.order.map(Order::from).unwrap_or_default();
        let mut descriptor = if annotated.rank > 0 {
            element.array(annotated.rank, order)
        } else {
            element
        };
        descriptor.is_const = annotated.is_const;
        Ok(descriptor)
    }

    /// Annotation spelling, e.g. `float64[:,:](order=F)`
    pub fn annotation(&self) -> String {
        let base = match self.dtype() {
            Some(dtype) => dtype.name().to_string(),
            None => match self.kind {
                BaseKind::Str => "str".to_string(),
                BaseKind::Tuple => {
                    let parts: Vec<String> = self.elements.iter().map(|e| e.annotation()).collect();
                    return format!("tuple[{}]", parts.join(", "));
                }
                _ => "None".to_string(),
            },
        };
        let mut text = if self.is_const { format!("const {}", base) } else { base };
        if self.rank > 0 {
            text.push('[');
            text.push_str(&vec![":"; self.rank].join(","));
            text.push(']');
            if self.rank > 1 && self.order == Order::F {
                text.push_str("(order=F)");
            }
        }
        text
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.annotation())
    }
}

/// Outcome of [`TypeDescriptor::accepts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Exact,
    /// Allowed after an implicit widening cast
    Promote,
    Incompatible,
}

/// Dtype names usable in annotations, `dtype=` arguments and numpy casts
pub fn dtype_from_name(name: &str) -> Option<TypeDescriptor> {
    let descriptor = match name {
        "bool" => TypeDescriptor::bool(),
        "int" => TypeDescriptor::int(),
        "int8" => TypeDescriptor::scalar(BaseKind::Int, 8),
        "int16" => TypeDescriptor::scalar(BaseKind::Int, 16),
        "int32" => TypeDescriptor::scalar(BaseKind::Int, 32),
        "int64" => TypeDescriptor::scalar(BaseKind::Int, 64),
        "float" | "double" | "float64" => TypeDescriptor::float(),
        "float32" => TypeDescriptor::scalar(BaseKind::Float, 32),
        "complex" | "complex128" => TypeDescriptor::complex(),
        "complex64" => TypeDescriptor::scalar(BaseKind::Complex, 64),
        "str" => TypeDescriptor::str(),
        "void" | "None" => TypeDescriptor::void(),
        _ => return None,
    };
    Some(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_follows_lattice() {
        let int32 = TypeDescriptor::scalar(BaseKind::Int, 32);
        let float = TypeDescriptor::float();
        let promoted = TypeDescriptor::promote(&int32, &float).unwrap();
        assert_eq!((promoted.kind, promoted.precision), (BaseKind::Float, 64));

        let int64 = TypeDescriptor::int();
        let promoted = TypeDescriptor::promote(&int32, &int64).unwrap();
        assert_eq!(promoted.precision, 64);

        let b = TypeDescriptor::bool();
        let c = TypeDescriptor::complex();
        assert_eq!(TypeDescriptor::promote(&b, &c).unwrap().kind, BaseKind::Complex);
        assert!(TypeDescriptor::promote(&TypeDescriptor::str(), &int64).is_none());
    }

    #[test]
    fn storage_allows_widening_only() {
        let float = TypeDescriptor::float();
        let int = TypeDescriptor::int();
        assert_eq!(float.accepts(&int), Storage::Promote);
        assert_eq!(int.accepts(&float), Storage::Incompatible);
        assert_eq!(int.accepts(&int), Storage::Exact);
        let array = float.array(1, Order::C);
        assert_eq!(array.accepts(&int.array(1, Order::C)), Storage::Incompatible);
        assert_eq!(array.accepts(&float), Storage::Promote);
        assert_eq!(array.accepts(&int), Storage::Promote);
        assert_eq!(int.array(1, Order::C).accepts(&float), Storage::Incompatible);
    }

    #[test]
    fn broadcast_unifies_known_extents() {
        let a = TypeDescriptor::float().with_shape(vec![Dim::Known(3), Dim::Unknown]);
        let b = TypeDescriptor::float().with_shape(vec![Dim::Unknown, Dim::Known(4)]);
        let (rank, shape, _) = TypeDescriptor::broadcast(&a, &b).unwrap();
        assert_eq!(rank, 2);
        assert_eq!(shape, vec![Dim::Known(3), Dim::Known(4)]);

        let c = TypeDescriptor::float().with_shape(vec![Dim::Known(5), Dim::Unknown]);
        assert!(TypeDescriptor::broadcast(&a, &c).is_err());
        assert!(TypeDescriptor::broadcast(&a, &TypeDescriptor::float().array(1, Order::C)).is_err());
    }

    #[test]
    fn annotations_round_trip_through_descriptors() {
        let annotated = AnnotatedType {
            dtype: "int32".to_string(),
            rank: 2,
            order: Some(ArrayOrder::F),
            is_const: true,
        };
        let descriptor = TypeDescriptor::from_annotated(&annotated).unwrap();
        assert_eq!(descriptor.dtype(), Some(Dtype::Int32));
        assert_eq!(descriptor.annotation(), "const int32[:,:](order=F)");
    }
}
