//! Calling convention shared by the generated wrappers and the loader.
//!
//! Every exported wrapper takes arrays of [`PyaotArg`] descriptors. The C
//! and Fortran declarations below are emitted into the wrapper sources and
//! must stay layout-compatible with the Rust struct.

use crate::semantic::Order;
use std::ffi::c_void;
use std::ptr;

/// Largest rank a descriptor can describe
pub const MAX_RANK: usize = 7;

pub const STATUS_OK: i32 = 0;
pub const STATUS_BAD_COUNT: i32 = 1;
pub const STATUS_BAD_DTYPE: i32 = 2;
pub const STATUS_BAD_RANK: i32 = 3;
pub const STATUS_BAD_ORDER: i32 = 4;

pub const ORDER_C: i32 = 0;
pub const ORDER_F: i32 = 1;

/// Argument, result or module variable descriptor. Scalars point at one
/// element and have rank 0; strides are in bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PyaotArg {
    pub data: *mut c_void,
    pub dtype: i32,
    pub rank: i32,
    pub order: i32,
    pub pad: i32,
    pub shape: [i64; MAX_RANK],
    pub strides: [i64; MAX_RANK],
}

impl Default for PyaotArg {
    fn default() -> Self {
        Self {
            data: ptr::null_mut(),
            dtype: -1,
            rank: 0,
            order: ORDER_C,
            pad: 0,
            shape: [0; MAX_RANK],
            strides: [0; MAX_RANK],
        }
    }
}

pub type WrapFn = unsafe extern "C" fn(args: *mut PyaotArg, nargs: i64, results: *mut PyaotArg) -> i32;
pub type GlobalFn = unsafe extern "C" fn(out: *mut PyaotArg) -> i32;
pub type InitFn = unsafe extern "C" fn();
pub type ReleaseFn = unsafe extern "C" fn(data: *mut c_void);

pub fn order_code(order: Order) -> i32 {
    match order {
        Order::C => ORDER_C,
        Order::F => ORDER_F,
    }
}

pub fn order_from_code(code: i32) -> Order {
    if code == ORDER_F {
        Order::F
    } else {
        Order::C
    }
}

/// Byte strides of a contiguous array
pub fn contiguous_strides(shape: &[usize], order: Order, element_size: usize) -> Vec<i64> {
    let mut strides = vec![0i64; shape.len()];
    let mut step = element_size as i64;
    let axes: Vec<usize> = match order {
        Order::C => (0..shape.len()).rev().collect(),
        Order::F => (0..shape.len()).collect(),
    };
    for axis in axes {
        strides[axis] = step;
        step *= shape[axis] as i64;
    }
    strides
}

/// Human readable meaning of a wrapper status
pub fn describe_status(status: i32) -> &'static str {
    match status {
        STATUS_OK => "ok",
        STATUS_BAD_COUNT => "wrong number of arguments",
        STATUS_BAD_DTYPE => "argument dtype mismatch",
        STATUS_BAD_RANK => "argument rank mismatch",
        STATUS_BAD_ORDER => "argument memory order mismatch",
        _ => "unknown wrapper status",
    }
}

/// C declaration of the descriptor and its stride helper
pub const C_DECLARATIONS: &str = "\
typedef struct {
    void *data;
    int32_t dtype;
    int32_t rank;
    int32_t order;
    int32_t pad;
    int64_t shape[7];
    int64_t strides[7];
} pyaot_arg;

static void pyaot_fill_strides(pyaot_arg *arg, int64_t itemsize)
{
    int64_t step = itemsize;
    for (int32_t k = 0; k < arg->rank; k++) {
        const int32_t axis = arg->order == 0 ? arg->rank - 1 - k : k;
        arg->strides[axis] = step;
        step *= arg->shape[axis];
    }
}
";

/// Fortran declaration of the descriptor type
pub const FORTRAN_DECLARATIONS: &str = "\
type, bind(c) :: pyaot_arg
  type(c_ptr) :: data
  integer(c_int32_t) :: dtype
  integer(c_int32_t) :: rank
  integer(c_int32_t) :: order
  integer(c_int32_t) :: pad
  integer(c_int64_t) :: shape(7)
  integer(c_int64_t) :: strides(7)
end type pyaot_arg
";

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn descriptor_layout_matches_the_c_struct() {
        assert_eq!(mem::size_of::<PyaotArg>(), 8 + 4 * 4 + 2 * 7 * 8);
        assert_eq!(mem::align_of::<PyaotArg>(), 8);
    }

    #[test]
    fn strides_follow_memory_order() {
        assert_eq!(contiguous_strides(&[2, 3], Order::C, 8), vec![24, 8]);
        assert_eq!(contiguous_strides(&[2, 3], Order::F, 8), vec![8, 16]);
        assert_eq!(contiguous_strides(&[], Order::C, 8), Vec::<i64>::new());
    }

    #[test]
    fn order_codes_round_trip() {
        assert_eq!(order_from_code(order_code(Order::F)), Order::F);
        assert_eq!(order_from_code(order_code(Order::C)), Order::C);
        assert_eq!(describe_status(STATUS_BAD_RANK), "argument rank mismatch");
    }
}
