//! Wrapper Loader: opens a built artifact and calls its exported functions
//! with [`Value`]s, following the recorded [`WrapperInterface`].

pub mod abi;
pub mod value;

pub use value::{Complex, Element, NdArray, Scalar, Value};

use crate::build::Artifact;
use crate::codegen::interface::{ArgSpec, GlobalInterface, InstanceInterface};
use crate::codegen::WrapperInterface;
use crate::error::WrapError;
use crate::semantic::Dtype;
use abi::{describe_status, GlobalFn, InitFn, PyaotArg, ReleaseFn, WrapFn, STATUS_OK};
use libloading::{Library, Symbol};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use value::strided_offset;

/// A loaded compiled module
pub struct Module {
    library: Library,
    interface: WrapperInterface,
    path: PathBuf,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.interface.module)
            .field("path", &self.path)
            .finish()
    }
}

impl Module {
    /// Load the artifact and its interface file, then run the module
    /// initialisation
    pub fn open(artifact: &Artifact) -> Result<Self, WrapError> {
        let interface = WrapperInterface::load(&artifact.interface_path).map_err(|e| WrapError::Load {
            path: artifact.interface_path.clone(),
            message: e.to_string(),
        })?;
        Self::load(&artifact.path, interface)
    }

    pub fn load(path: &Path, interface: WrapperInterface) -> Result<Self, WrapError> {
        // SAFETY: the library was produced by the build driver; its
        // initialisers only set up module variables.
        let library = unsafe { Library::new(path) }.map_err(|e| WrapError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let module = Self {
            library,
            interface,
            path: path.to_path_buf(),
        };

        for instance in module.interface.instances() {
            module.symbol::<WrapFn>(&instance.symbol)?;
        }
        for global in &module.interface.globals {
            module.symbol::<GlobalFn>(&global.symbol)?;
        }
        if module.interface.returns_arrays() {
            module.symbol::<ReleaseFn>(&module.interface.release_symbol)?;
        }
        let init = module.symbol::<InitFn>(&module.interface.init_symbol)?;
        // SAFETY: the initialiser takes no arguments and guards against
        // running twice.
        unsafe { init() };
        info!(module = %module.interface.module, path = %path.display(), "module loaded");
        Ok(module)
    }

    pub fn name(&self) -> &str {
        &self.interface.module
    }

    pub fn interface(&self) -> &WrapperInterface {
        &self.interface
    }

    fn symbol<T: Copy>(&self, name: &str) -> Result<T, WrapError> {
        // SAFETY: every symbol name comes from the interface recorded with
        // the artifact, which fixes its signature.
        let symbol: Symbol<T> =
            unsafe { self.library.get(name.as_bytes()) }.map_err(|_| WrapError::MissingExport(name.to_string()))?;
        Ok(*symbol)
    }

    /// Call an exported function. Arrays are passed by reference: writes
    /// made by the native code land in the caller's buffers. Zero results
    /// give `Value::None`, several give `Value::Tuple`.
    pub fn call(&self, name: &str, args: &mut [Value]) -> Result<Value, WrapError> {
        let function = self
            .interface
            .function(name)
            .ok_or_else(|| WrapError::UnknownFunction(name.to_string()))?;
        let (instance, scalars) = select(&function.instances, args).ok_or_else(|| WrapError::NoMatchingOverload {
            function: name.to_string(),
            arguments: args.iter().map(Value::describe).collect::<Vec<_>>().join(", "),
        })?;
        debug!(function = name, instance = %instance.mangled, "dispatching");

        let mut scalar_storage: Vec<[u64; 2]> = vec![[0; 2]; args.len()];
        let mut descriptors = Vec::with_capacity(args.len());
        for (k, (arg, storage)) in args.iter_mut().zip(scalar_storage.iter_mut()).enumerate() {
            let descriptor = match (arg, &scalars[k]) {
                (Value::Array(array), _) => array.descriptor(),
                (_, Some(scalar)) => {
                    scalar.write(as_bytes(storage));
                    PyaotArg {
                        data: storage.as_mut_ptr().cast(),
                        dtype: scalar.dtype().code(),
                        ..PyaotArg::default()
                    }
                }
                _ => {
                    return Err(WrapError::Marshalling {
                        function: name.to_string(),
                        index: k,
                        message: "value cannot cross the native boundary".to_string(),
                    })
                }
            };
            descriptors.push(descriptor);
        }

        let mut result_storage: Vec<[u64; 2]> = vec![[0; 2]; instance.results.len()];
        let mut results: Vec<PyaotArg> = result_storage
            .iter_mut()
            .map(|storage| PyaotArg {
                data: storage.as_mut_ptr().cast(),
                ..PyaotArg::default()
            })
            .collect();

        let wrap = self.symbol::<WrapFn>(&instance.symbol)?;
        // SAFETY: descriptors point at live buffers matching the instance
        // signature; scalar and result storage outlive the call.
        let status = unsafe { wrap(descriptors.as_mut_ptr(), descriptors.len() as i64, results.as_mut_ptr()) };
        if status != STATUS_OK {
            return Err(WrapError::CallFailed {
                function: name.to_string(),
                message: describe_status(status).to_string(),
            });
        }

        let mut values = Vec::with_capacity(instance.results.len());
        for (k, spec) in instance.results.iter().enumerate() {
            if spec.rank == 0 {
                values.push(Value::Scalar(Scalar::read(spec.dtype, as_bytes(&mut result_storage[k]))));
            } else {
                values.push(self.take_array(name, &results[k], spec)?);
            }
        }
        Ok(match values.len() {
            0 => Value::None,
            1 => values.remove(0),
            _ => Value::Tuple(values),
        })
    }

    /// Copy an array result out of the buffer the wrapper allocated for it,
    /// then hand the buffer back
    fn take_array(&self, function: &str, result: &PyaotArg, spec: &ArgSpec) -> Result<Value, WrapError> {
        let release = self.symbol::<ReleaseFn>(&self.interface.release_symbol)?;
        // SAFETY: the wrapper described a buffer it allocated for this
        // result and filled before returning.
        let array = unsafe { NdArray::from_descriptor(result, spec.dtype) };
        if !result.data.is_null() {
            // SAFETY: the buffer came from the library's allocator and is
            // not referenced after the copy.
            unsafe { release(result.data) };
        }
        array.map(Value::Array).ok_or_else(|| WrapError::CallFailed {
            function: function.to_string(),
            message: "invalid array result".to_string(),
        })
    }

    fn describe_global(&self, name: &str) -> Result<(&GlobalInterface, PyaotArg), WrapError> {
        let global = self
            .interface
            .global(name)
            .ok_or_else(|| WrapError::UnknownGlobal(name.to_string()))?;
        let accessor = self.symbol::<GlobalFn>(&global.symbol)?;
        let mut out = PyaotArg::default();
        // SAFETY: the accessor only fills in the descriptor.
        let status = unsafe { accessor(&mut out) };
        if status != STATUS_OK || Dtype::from_code(out.dtype) != Some(global.dtype) {
            return Err(WrapError::CallFailed {
                function: global.symbol.clone(),
                message: describe_status(status).to_string(),
            });
        }
        Ok((global, out))
    }

    /// Copy of a module variable with its dtype, rank and shape
    pub fn global(&self, name: &str) -> Result<Value, WrapError> {
        let (global, out) = self.describe_global(name)?;
        if out.data.is_null() {
            return Ok(Value::None);
        }
        if global.rank == 0 {
            // SAFETY: a rank-0 descriptor points at one element of its dtype.
            let bytes = unsafe { std::slice::from_raw_parts(out.data.cast::<u8>(), global.dtype.size()) };
            return Ok(Value::Scalar(Scalar::read(global.dtype, bytes)));
        }
        // SAFETY: the accessor described the variable's live storage.
        unsafe { NdArray::from_descriptor(&out, global.dtype) }
            .map(Value::Array)
            .ok_or_else(|| WrapError::CallFailed {
                function: global.symbol.clone(),
                message: "invalid array descriptor".to_string(),
            })
    }

    /// Read/write access to a module variable's native storage
    pub fn global_view(&self, name: &str) -> Result<GlobalView<'_>, WrapError> {
        let (global, out) = self.describe_global(name)?;
        if out.data.is_null() {
            return Err(WrapError::CallFailed {
                function: global.symbol.clone(),
                message: "variable is not allocated".to_string(),
            });
        }
        let rank = global.rank.min(abi::MAX_RANK);
        Ok(GlobalView {
            name: global.name.clone(),
            data: out.data.cast(),
            dtype: global.dtype,
            shape: out.shape[..rank].iter().map(|&n| n.max(0) as usize).collect(),
            strides: out.strides[..rank].to_vec(),
            is_const: global.is_const,
            _module: PhantomData,
        })
    }
}

/// First instance the arguments fit exactly, else the first one they fit
/// after lossless scalar promotion. Returns the converted scalars.
fn select<'i>(instances: &'i [InstanceInterface], args: &[Value]) -> Option<(&'i InstanceInterface, Vec<Option<Scalar>>)> {
    let exact = instances.iter().find_map(|instance| {
        matches(instance, args, |scalar, spec| (scalar.dtype() == spec.dtype).then_some(*scalar))
            .map(|scalars| (instance, scalars))
    });
    exact.or_else(|| {
        instances.iter().find_map(|instance| {
            matches(instance, args, |scalar, spec| scalar.promote(spec.dtype)).map(|scalars| (instance, scalars))
        })
    })
}

fn matches(
    instance: &InstanceInterface,
    args: &[Value],
    convert: impl Fn(&Scalar, &ArgSpec) -> Option<Scalar>,
) -> Option<Vec<Option<Scalar>>> {
    if instance.params.len() != args.len() {
        return None;
    }
    instance
        .params
        .iter()
        .zip(args)
        .map(|(spec, arg)| match arg {
            Value::Scalar(scalar) if spec.rank == 0 => convert(scalar, spec).map(Some),
            Value::Array(array)
                if spec.rank == array.rank()
                    && spec.dtype == array.dtype()
                    && (!spec.order_matters() || spec.order == array.order()) =>
            {
                Some(None)
            }
            _ => None,
        })
        .collect()
}

fn as_bytes(storage: &mut [u64; 2]) -> &mut [u8] {
    // SAFETY: 16 initialised bytes, exclusively borrowed.
    unsafe { std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast::<u8>(), 16) }
}

/// Live view on a module variable. Holds the module borrowed so the
/// library stays loaded.
#[derive(Debug)]
pub struct GlobalView<'m> {
    name: String,
    data: *mut u8,
    dtype: Dtype,
    shape: Vec<usize>,
    strides: Vec<i64>,
    is_const: bool,
    _module: PhantomData<&'m Module>,
}

impl GlobalView<'_> {
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element at `index`; scalars use an empty index
    pub fn get(&self, index: &[usize]) -> Option<Scalar> {
        let offset = strided_offset(index, &self.shape, &self.strides)?;
        // SAFETY: the offset was bounds checked against the native shape.
        let bytes = unsafe { std::slice::from_raw_parts(self.data.offset(offset), self.dtype.size()) };
        Some(Scalar::read(self.dtype, bytes))
    }

    pub fn set(&mut self, index: &[usize], value: Scalar) -> Result<(), WrapError> {
        let failed = |message: &str| WrapError::CallFailed {
            function: self.name.clone(),
            message: message.to_string(),
        };
        if self.is_const {
            return Err(failed("variable is declared const"));
        }
        let value = value
            .promote(self.dtype)
            .ok_or_else(|| failed(&format!("cannot store {} into {}", value.dtype(), self.dtype)))?;
        let offset = strided_offset(index, &self.shape, &self.strides).ok_or_else(|| failed("index out of bounds"))?;
        // SAFETY: as in `get`, and the view is borrowed mutably.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.data.offset(offset), self.dtype.size()) };
        value.write(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::interface::{wrapper_symbol, Intent};
    use crate::semantic::Order;

    fn spec(dtype: Dtype, rank: usize) -> ArgSpec {
        ArgSpec {
            name: "x".to_string(),
            dtype,
            rank,
            order: Order::C,
            intent: Intent::In,
        }
    }

    fn instance(mangled: &str, params: Vec<ArgSpec>) -> InstanceInterface {
        InstanceInterface {
            symbol: wrapper_symbol(mangled),
            mangled: mangled.to_string(),
            params,
            results: Vec::new(),
        }
    }

    #[test]
    fn exact_matches_win_over_promotion() {
        let instances = vec![
            instance("f_00", vec![spec(Dtype::Float64, 0)]),
            instance("f_01", vec![spec(Dtype::Int64, 0)]),
        ];
        let (chosen, _) = select(&instances, &[Value::from(2i64)]).unwrap();
        assert_eq!(chosen.mangled, "f_01");
        let (chosen, scalars) = select(&instances, &[Value::from(2.5f64)]).unwrap();
        assert_eq!(chosen.mangled, "f_00");
        assert_eq!(scalars[0], Some(Scalar::Float64(2.5)));
    }

    #[test]
    fn python_ints_are_promoted_when_lossless() {
        let instances = vec![instance("g", vec![spec(Dtype::Int32, 0), spec(Dtype::Float64, 1)])];
        let args = [Value::from(7i64), Value::from(vec![1.0f64, 2.0])];
        let (_, scalars) = select(&instances, &args).unwrap();
        assert_eq!(scalars[0], Some(Scalar::Int32(7)));
        assert_eq!(scalars[1], None);

        let args = [Value::from(1i64 << 40), Value::from(vec![1.0f64])];
        assert!(select(&instances, &args).is_none());
    }

    #[test]
    fn arrays_must_match_dtype_and_rank() {
        let instances = vec![instance("h", vec![spec(Dtype::Float64, 1)])];
        assert!(select(&instances, &[Value::from(vec![1i64, 2])]).is_none());
        assert!(select(&instances, &[Value::from(1.0f64)]).is_none());
        assert!(select(&instances, &[]).is_none());
    }

    #[test]
    fn loading_a_missing_library_fails_cleanly() {
        let interface = WrapperInterface {
            module: "m".to_string(),
            language: crate::codegen::Language::C,
            init_symbol: "pyaot_init_m".to_string(),
            release_symbol: "pyaot_release_m".to_string(),
            functions: Vec::new(),
            globals: Vec::new(),
        };
        let error = Module::load(Path::new("/nonexistent/libm_pyaot.so"), interface).unwrap_err();
        assert!(matches!(error, WrapError::Load { .. }));
    }
}
