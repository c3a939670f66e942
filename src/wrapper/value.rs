//! Values crossing the wrapper boundary: scalars of every dtype, owned
//! n-dimensional arrays and tuples of results.

use super::abi::{contiguous_strides, order_code, order_from_code, PyaotArg, MAX_RANK};
use crate::semantic::{Dtype, Order};
use std::fmt;
use std::mem::size_of;
use std::ptr;
use std::slice;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    pub fn new(re: T, im: T) -> Self {
        Self { re, im }
    }
}

/// A Rust type with a native dtype. Elements are stored in native byte order.
pub trait Element: Copy + fmt::Debug {
    const DTYPE: Dtype;

    fn read(bytes: &[u8]) -> Self;

    fn write(self, out: &mut [u8]);
}

macro_rules! primitive_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {$(
        impl Element for $ty {
            const DTYPE: Dtype = Dtype::$dtype;

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..size_of::<$ty>()]);
                <$ty>::from_ne_bytes(raw)
            }

            fn write(self, out: &mut [u8]) {
                out[..size_of::<$ty>()].copy_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

primitive_element!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
);

impl Element for bool {
    const DTYPE: Dtype = Dtype::Bool;

    fn read(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }
}

macro_rules! complex_element {
    ($($part:ty => $dtype:ident),* $(,)?) => {$(
        impl Element for Complex<$part> {
            const DTYPE: Dtype = Dtype::$dtype;

            fn read(bytes: &[u8]) -> Self {
                let half = size_of::<$part>();
                Complex::new(<$part>::read(bytes), <$part>::read(&bytes[half..]))
            }

            fn write(self, out: &mut [u8]) {
                let half = size_of::<$part>();
                self.re.write(out);
                self.im.write(&mut out[half..]);
            }
        }
    )*};
}

complex_element!(f32 => Complex64, f64 => Complex128);

/// Largest element size of any dtype
const SCALAR_BYTES: usize = 16;

/// One value of a native dtype
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Complex64(Complex<f32>),
    Complex128(Complex<f64>),
}

impl Scalar {
    pub fn dtype(&self) -> Dtype {
        match self {
            Scalar::Bool(_) => Dtype::Bool,
            Scalar::Int8(_) => Dtype::Int8,
            Scalar::Int16(_) => Dtype::Int16,
            Scalar::Int32(_) => Dtype::Int32,
            Scalar::Int64(_) => Dtype::Int64,
            Scalar::Float32(_) => Dtype::Float32,
            Scalar::Float64(_) => Dtype::Float64,
            Scalar::Complex64(_) => Dtype::Complex64,
            Scalar::Complex128(_) => Dtype::Complex128,
        }
    }

    /// Decode one element of `dtype` from the start of `bytes`
    pub fn read(dtype: Dtype, bytes: &[u8]) -> Self {
        match dtype {
            Dtype::Bool => Scalar::Bool(bool::read(bytes)),
            Dtype::Int8 => Scalar::Int8(i8::read(bytes)),
            Dtype::Int16 => Scalar::Int16(i16::read(bytes)),
            Dtype::Int32 => Scalar::Int32(i32::read(bytes)),
            Dtype::Int64 => Scalar::Int64(i64::read(bytes)),
            Dtype::Float32 => Scalar::Float32(f32::read(bytes)),
            Dtype::Float64 => Scalar::Float64(f64::read(bytes)),
            Dtype::Complex64 => Scalar::Complex64(Complex::<f32>::read(bytes)),
            Dtype::Complex128 => Scalar::Complex128(Complex::<f64>::read(bytes)),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        match *self {
            Scalar::Bool(v) => v.write(out),
            Scalar::Int8(v) => v.write(out),
            Scalar::Int16(v) => v.write(out),
            Scalar::Int32(v) => v.write(out),
            Scalar::Int64(v) => v.write(out),
            Scalar::Float32(v) => v.write(out),
            Scalar::Float64(v) => v.write(out),
            Scalar::Complex64(v) => v.write(out),
            Scalar::Complex128(v) => v.write(out),
        }
    }

    pub fn of<T: Element>(value: T) -> Self {
        let mut raw = [0u8; SCALAR_BYTES];
        value.write(&mut raw);
        Scalar::read(T::DTYPE, &raw)
    }

    /// The value as `T`, when the dtype is exactly `T`'s
    pub fn get<T: Element>(&self) -> Option<T> {
        if self.dtype() != T::DTYPE {
            return None;
        }
        let mut raw = [0u8; SCALAR_BYTES];
        self.write(&mut raw);
        Some(T::read(&raw))
    }

    pub fn as_i64(&self) -> Option<i64> {
        i64::try_from(self.integer()?).ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Scalar::Float32(v) => Some(f64::from(v)),
            Scalar::Float64(v) => Some(v),
            Scalar::Complex64(_) | Scalar::Complex128(_) => None,
            _ => self.integer().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Scalar::Bool(v) => Some(v),
            _ => None,
        }
    }

    fn integer(&self) -> Option<i128> {
        match *self {
            Scalar::Bool(v) => Some(i128::from(v)),
            Scalar::Int8(v) => Some(i128::from(v)),
            Scalar::Int16(v) => Some(i128::from(v)),
            Scalar::Int32(v) => Some(i128::from(v)),
            Scalar::Int64(v) => Some(i128::from(v)),
            _ => None,
        }
    }

    fn exact_f64(&self) -> Option<f64> {
        match *self {
            Scalar::Float32(v) => Some(f64::from(v)),
            Scalar::Float64(v) => Some(v),
            Scalar::Complex64(_) | Scalar::Complex128(_) => None,
            _ => {
                let v = self.integer()?;
                let f = v as f64;
                (f as i128 == v).then_some(f)
            }
        }
    }

    fn exact_f32(&self) -> Option<f32> {
        match *self {
            Scalar::Float32(v) => Some(v),
            Scalar::Float64(v) => narrow(v),
            Scalar::Complex64(_) | Scalar::Complex128(_) => None,
            _ => {
                let v = self.integer()?;
                let f = v as f32;
                (f as i128 == v).then_some(f)
            }
        }
    }

    /// Convert to `target` when no information is lost: integers that fit,
    /// integers and floats exactly representable in the target float,
    /// anything real into a complex with a zero imaginary part.
    pub fn promote(&self, target: Dtype) -> Option<Scalar> {
        if self.dtype() == target {
            return Some(*self);
        }
        let promoted = match target {
            Dtype::Bool => return None,
            Dtype::Int8 => Scalar::Int8(i8::try_from(self.integer()?).ok()?),
            Dtype::Int16 => Scalar::Int16(i16::try_from(self.integer()?).ok()?),
            Dtype::Int32 => Scalar::Int32(i32::try_from(self.integer()?).ok()?),
            Dtype::Int64 => Scalar::Int64(i64::try_from(self.integer()?).ok()?),
            Dtype::Float32 => Scalar::Float32(self.exact_f32()?),
            Dtype::Float64 => Scalar::Float64(self.exact_f64()?),
            Dtype::Complex64 => match *self {
                Scalar::Complex128(c) => Scalar::Complex64(Complex::new(narrow(c.re)?, narrow(c.im)?)),
                _ => Scalar::Complex64(Complex::new(self.exact_f32()?, 0.0)),
            },
            Dtype::Complex128 => match *self {
                Scalar::Complex64(c) => Scalar::Complex128(Complex::new(f64::from(c.re), f64::from(c.im))),
                _ => Scalar::Complex128(Complex::new(self.exact_f64()?, 0.0)),
            },
        };
        Some(promoted)
    }
}

fn narrow(v: f64) -> Option<f32> {
    let n = v as f32;
    (f64::from(n) == v || v.is_nan()).then_some(n)
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{}", if *v { "True" } else { "False" }),
            Scalar::Int8(v) => write!(f, "{}", v),
            Scalar::Int16(v) => write!(f, "{}", v),
            Scalar::Int32(v) => write!(f, "{}", v),
            Scalar::Int64(v) => write!(f, "{}", v),
            Scalar::Float32(v) => write!(f, "{}", v),
            Scalar::Float64(v) => write!(f, "{}", v),
            Scalar::Complex64(c) => write!(f, "({}{:+}j)", c.re, c.im),
            Scalar::Complex128(c) => write!(f, "({}{:+}j)", c.re, c.im),
        }
    }
}

/// Row-major multi-index of the `flat`-th element
fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for axis in (0..shape.len()).rev() {
        index[axis] = flat % shape[axis];
        flat /= shape[axis];
    }
    index
}

/// Byte offset of `index` given byte strides, `None` when out of bounds
pub(crate) fn strided_offset(index: &[usize], shape: &[usize], strides: &[i64]) -> Option<isize> {
    if index.len() != shape.len() {
        return None;
    }
    let mut offset = 0isize;
    for ((&i, &extent), &stride) in index.iter().zip(shape).zip(strides) {
        if i >= extent {
            return None;
        }
        offset += i as isize * stride as isize;
    }
    Some(offset)
}

/// Owned contiguous array in C or Fortran order
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    dtype: Dtype,
    shape: Vec<usize>,
    order: Order,
    /// 8-byte aligned element bytes
    storage: Vec<u64>,
}

impl NdArray {
    pub fn zeros(dtype: Dtype, shape: &[usize], order: Order) -> Self {
        let bytes = shape.iter().product::<usize>() * dtype.size();
        Self {
            dtype,
            shape: shape.to_vec(),
            order,
            storage: vec![0; bytes.div_ceil(8)],
        }
    }

    /// Build from values listed in row-major order, whatever the storage
    /// order. `None` when the count does not match the shape.
    pub fn from_vec<T: Element>(values: Vec<T>, shape: &[usize], order: Order) -> Option<Self> {
        if values.len() != shape.iter().product::<usize>() || shape.len() > MAX_RANK {
            return None;
        }
        let mut array = Self::zeros(T::DTYPE, shape, order);
        let size = T::DTYPE.size();
        for (flat, value) in values.into_iter().enumerate() {
            let offset = array.offset(&unravel(flat, shape))?;
            value.write(&mut array.bytes_mut()[offset * size..]);
        }
        Some(array)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element offset of a multi-index in storage order
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() || index.iter().zip(&self.shape).any(|(i, n)| i >= n) {
            return None;
        }
        let mut offset = 0;
        let mut step = 1;
        let axes: Vec<usize> = match self.order {
            Order::C => (0..self.rank()).rev().collect(),
            Order::F => (0..self.rank()).collect(),
        };
        for axis in axes {
            offset += index[axis] * step;
            step *= self.shape[axis];
        }
        Some(offset)
    }

    pub fn get(&self, index: &[usize]) -> Option<Scalar> {
        let size = self.dtype.size();
        let offset = self.offset(index)? * size;
        Some(Scalar::read(self.dtype, &self.bytes()[offset..offset + size]))
    }

    /// Store `value` after a lossless conversion to the array's dtype
    pub fn set(&mut self, index: &[usize], value: Scalar) -> Option<()> {
        let value = value.promote(self.dtype)?;
        let size = self.dtype.size();
        let offset = self.offset(index)? * size;
        value.write(&mut self.bytes_mut()[offset..offset + size]);
        Some(())
    }

    /// Elements in row-major order, when the dtype is exactly `T`'s
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if self.dtype != T::DTYPE {
            return None;
        }
        let size = self.dtype.size();
        (0..self.len())
            .map(|flat| {
                let offset = self.offset(&unravel(flat, &self.shape))? * size;
                Some(T::read(&self.bytes()[offset..]))
            })
            .collect()
    }

    fn bytes(&self) -> &[u8] {
        let len = self.len() * self.dtype.size();
        // SAFETY: storage holds at least `len` initialised bytes and u8 has
        // no alignment requirement.
        unsafe { slice::from_raw_parts(self.storage.as_ptr().cast::<u8>(), len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len() * self.dtype.size();
        // SAFETY: as in `bytes`, and the borrow is exclusive.
        unsafe { slice::from_raw_parts_mut(self.storage.as_mut_ptr().cast::<u8>(), len) }
    }

    /// Descriptor pointing into this array's own buffer
    pub(crate) fn descriptor(&mut self) -> PyaotArg {
        let mut arg = PyaotArg {
            data: self.storage.as_mut_ptr().cast(),
            dtype: self.dtype.code(),
            rank: self.rank() as i32,
            order: order_code(self.order),
            ..PyaotArg::default()
        };
        let strides = contiguous_strides(&self.shape, self.order, self.dtype.size());
        for axis in 0..self.rank() {
            arg.shape[axis] = self.shape[axis] as i64;
            arg.strides[axis] = strides[axis];
        }
        arg
    }

    /// Copy the array a native descriptor describes
    ///
    /// # Safety
    ///
    /// `arg.data` must point at live storage matching the descriptor's
    /// dtype, shape and strides.
    pub(crate) unsafe fn from_descriptor(arg: &PyaotArg, dtype: Dtype) -> Option<Self> {
        let rank = usize::try_from(arg.rank).ok().filter(|&r| r <= MAX_RANK)?;
        let shape = arg.shape[..rank]
            .iter()
            .map(|&n| usize::try_from(n).ok())
            .collect::<Option<Vec<_>>>()?;
        let strides = &arg.strides[..rank];
        let mut array = Self::zeros(dtype, &shape, order_from_code(arg.order));
        let size = dtype.size();
        let source = arg.data.cast::<u8>().cast_const();
        for flat in 0..array.len() {
            let index = unravel(flat, &shape);
            let from = strided_offset(&index, &shape, strides)?;
            let to = array.offset(&index)? * size;
            let target = array.bytes_mut()[to..to + size].as_mut_ptr();
            ptr::copy_nonoverlapping(source.offset(from), target, size);
        }
        Some(array)
    }
}

impl<T: Element> From<Vec<T>> for NdArray {
    fn from(values: Vec<T>) -> Self {
        let mut array = Self::zeros(T::DTYPE, &[values.len()], Order::C);
        let size = T::DTYPE.size();
        for (k, value) in values.into_iter().enumerate() {
            value.write(&mut array.bytes_mut()[k * size..]);
        }
        array
    }
}

/// Argument or result of a wrapped call
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Scalar(Scalar),
    Array(NdArray),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_scalar()?.as_f64()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar()?.as_i64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_scalar()?.as_bool()
    }

    /// Type in annotation syntax, for error messages
    pub fn describe(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Scalar(s) => s.dtype().to_string(),
            Value::Array(a) => {
                let dims = vec![":"; a.rank()].join(",");
                let order = if a.order() == Order::F && a.rank() > 1 { "(order=F)" } else { "" };
                format!("{}[{}]{}", a.dtype(), dims, order)
            }
            Value::Tuple(items) => {
                let items: Vec<String> = items.iter().map(Value::describe).collect();
                format!("tuple[{}]", items.join(", "))
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Scalar {
            fn from(value: $ty) -> Self {
                Scalar::of(value)
            }
        }

        impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Scalar(Scalar::of(value))
            }
        }
    )*};
}

value_from!(bool, i8, i16, i32, i64, f32, f64, Complex<f32>, Complex<f64>);

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<NdArray> for Value {
    fn from(value: NdArray) -> Self {
        Value::Array(value)
    }
}

impl<T: Element> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(NdArray::from(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_never_loses_information() {
        assert_eq!(Scalar::Int64(3).promote(Dtype::Int32), Some(Scalar::Int32(3)));
        assert_eq!(Scalar::Int64(1 << 40).promote(Dtype::Int32), None);
        assert_eq!(Scalar::Int64(2).promote(Dtype::Float64), Some(Scalar::Float64(2.0)));
        assert_eq!(Scalar::Int64((1 << 53) + 1).promote(Dtype::Float64), None);
        assert_eq!(Scalar::Float64(0.5).promote(Dtype::Float32), Some(Scalar::Float32(0.5)));
        assert_eq!(Scalar::Float64(0.1).promote(Dtype::Float32), None);
        assert_eq!(Scalar::Float64(2.5).promote(Dtype::Int64), None);
        assert_eq!(Scalar::Int64(1).promote(Dtype::Bool), None);
        assert_eq!(
            Scalar::Float64(1.5).promote(Dtype::Complex128),
            Some(Scalar::Complex128(Complex::new(1.5, 0.0)))
        );
    }

    #[test]
    fn fortran_ordered_arrays_keep_logical_indexing() {
        let array = NdArray::from_vec(vec![1i32, 2, 3, 4, 5, 6], &[2, 3], Order::F).unwrap();
        assert_eq!(array.get(&[0, 1]), Some(Scalar::Int32(2)));
        assert_eq!(array.get(&[1, 0]), Some(Scalar::Int32(4)));
        assert_eq!(array.offset(&[1, 0]), Some(1));
        assert_eq!(array.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(array.get(&[2, 0]), None);
    }

    #[test]
    fn set_converts_to_the_array_dtype() {
        let mut array = NdArray::from(vec![0.0f64; 3]);
        array.set(&[1], Scalar::Int64(7)).unwrap();
        assert_eq!(array.to_vec::<f64>().unwrap(), vec![0.0, 7.0, 0.0]);
        assert!(array.set(&[1], Scalar::Complex128(Complex::new(1.0, 1.0))).is_none());
    }

    #[test]
    fn descriptors_copy_back_into_arrays() {
        let mut array = NdArray::from_vec(vec![1.5f64, 2.5, 3.5, 4.5], &[2, 2], Order::C).unwrap();
        let arg = array.descriptor();
        assert_eq!(arg.strides[..2], [16, 8]);
        let copy = unsafe { NdArray::from_descriptor(&arg, Dtype::Float64) }.unwrap();
        assert_eq!(copy, array);
    }

    #[test]
    fn values_describe_their_type() {
        let array = NdArray::zeros(Dtype::Int32, &[2, 2], Order::F);
        assert_eq!(Value::from(array).describe(), "int32[:,:](order=F)");
        assert_eq!(Value::from(vec![1.0f64]).describe(), "float64[:]");
        assert_eq!(Value::Tuple(vec![Value::from(true), Value::None]).describe(), "tuple[bool, None]");
    }
}
