//! Module loading and the host side of the call boundary.
//!
//! A [`ModuleLoader`] owns the serialized binary, deserializes and verifies
//! it on the first `load()`, and memoizes the result; repeat calls hand back
//! the same loaded state. Verification checks both directions of the
//! boundary: the exports the host relies on must be present, and every
//! import the module declares must be one the host knows how to supply.

pub mod marshal;
pub mod memory;

use fnv::{FnvHashMap, FnvHashSet};
use log::debug;
use parity_wasm::elements::{deserialize_buffer, External, Internal, Module};

use crate::errors::{HastyError, HastyResult};
use crate::loader::marshal::{HostHeap, Marshaller, WasmWord};
use crate::loader::memory::{Heap, LoaderConfig};
use crate::reflect::ReflectionTable;

lazy_static! {
    /// Runtime array operations, named before their element-type suffix.
    static ref RUNTIME_ARRAY_OPS: FnvHashSet<&'static str> = [
        "new_array",
        "array_get",
        "array_set",
        "array_fill_ii",
        "array_fill_iii",
        "array_length",
        "array_set_length",
        "array_pop",
        "array_shift",
        "array_push",
        "array_unshift",
        "delete_array",
    ]
    .iter()
    .cloned()
    .collect();

    static ref MATH_IMPORTS: FnvHashSet<&'static str> =
        ["pow", "fmod", "round"].iter().cloned().collect();
}

const ELEM_SUFFIXES: [&str; 5] = ["i1", "i8", "i32", "f64", "ptr"];
const GC_EXPORT: &str = "hastyGc";

fn is_runtime_array_import(name: &str) -> bool {
    ELEM_SUFFIXES.iter().any(|suffix| {
        name.strip_suffix(suffix)
            .and_then(|base| base.strip_suffix('_'))
            .map_or(false, |op| RUNTIME_ARRAY_OPS.contains(op))
    })
}

/// `invoke_<shape>` trampolines; the shape spells the signature one letter
/// per slot, return first.
fn is_trampoline_import(name: &str) -> HastyResult<bool> {
    let shape = match name.strip_prefix("invoke_") {
        Some(shape) => shape,
        None => return Ok(false),
    };
    if shape.is_empty() || !shape.chars().all(|c| c == 'i' || c == 'v' || c == 'd') {
        return Err(HastyError::runtime(format!(
            "unknown trampoline shape `{}`",
            name
        )));
    }
    Ok(true)
}

fn is_exception_import(name: &str) -> bool {
    name.starts_with("__cxa_") || name == "__resumeException" || name == "abort"
}

pub struct LoadedModule {
    pub module: Module,
    /// Function exports by name.
    pub exports: FnvHashMap<String, u32>,
    pub heap: Heap,
    pub host: HostHeap,
    /// Set when the module exports its own allocator pair; the host-side
    /// emulation is only used before that point.
    pub module_allocator: bool,
    /// Export index of the collector entry point, when the module has one.
    pub gc: Option<u32>,
}

impl LoadedModule {
    pub fn export(&self, name: &str) -> Option<u32> {
        self.exports.get(name).cloned()
    }

    /// Supplies one imported host function. Math and `sbrk` imports are
    /// implemented; exception machinery fails loudly when reached.
    pub fn host_import(&mut self, name: &str, args: &[WasmWord]) -> HastyResult<Option<WasmWord>> {
        let arg = |i: usize| -> HastyResult<f64> {
            args.get(i).map(|w| w.as_f64()).ok_or_else(|| {
                HastyError::runtime(format!("import `{}` is missing argument {}", name, i))
            })
        };
        match name {
            "sbrk" => {
                let increment = args
                    .first()
                    .map(|w| w.as_i32())
                    .ok_or_else(|| HastyError::runtime(str!("`sbrk` takes an increment")))?;
                Ok(Some(WasmWord::I32(self.heap.sbrk(increment)? as i32)))
            }
            "pow" => Ok(Some(WasmWord::F64(arg(0)?.powf(arg(1)?)))),
            "fmod" => Ok(Some(WasmWord::F64(arg(0)? % arg(1)?))),
            "round" => Ok(Some(WasmWord::F64(arg(0)?.round()))),
            _ if is_exception_import(name) || is_trampoline_import(name)? => {
                Err(HastyError::runtime(format!(
                    "exceptions are not supported (import `{}` was invoked)",
                    name
                )))
            }
            _ => Err(HastyError::runtime(format!(
                "no host implementation for import `{}`",
                name
            ))),
        }
    }
}

pub struct ModuleLoader {
    source: Vec<u8>,
    config: LoaderConfig,
    types: ReflectionTable,
    /// Exports the caller depends on, beyond the allocator pair.
    required_exports: Vec<String>,
    loaded: Option<LoadedModule>,
    loads: u32,
}

impl ModuleLoader {
    pub fn new(
        source: Vec<u8>,
        types: ReflectionTable,
        required_exports: Vec<String>,
        config: LoaderConfig,
    ) -> ModuleLoader {
        ModuleLoader {
            source,
            config,
            types,
            required_exports,
            loaded: None,
            loads: 0,
        }
    }

    /// Builds a loader from a binary and its serialized reflection sidecar.
    pub fn with_sidecar(
        source: Vec<u8>,
        sidecar: &[u8],
        required_exports: Vec<String>,
        config: LoaderConfig,
    ) -> HastyResult<ModuleLoader> {
        let types = ReflectionTable::from_bytes(sidecar)?;
        Ok(ModuleLoader::new(source, types, required_exports, config))
    }

    pub fn types(&self) -> &ReflectionTable {
        &self.types
    }

    /// Loads the module, at most once; repeat calls return the memoized
    /// state with its heap and host arena intact.
    pub fn load(&mut self) -> HastyResult<&mut LoadedModule> {
        if self.loaded.is_none() {
            let loaded = self.instantiate()?;
            self.loaded = Some(loaded);
            self.loads += 1;
        }
        match self.loaded {
            Some(ref mut loaded) => Ok(loaded),
            None => panic!("COMPILER BUG: module loader lost its instance"),
        }
    }

    /// A marshaller over the loaded module's heap and host arena.
    pub fn marshaller(&mut self) -> HastyResult<Marshaller> {
        self.load()?;
        let types = &self.types;
        match self.loaded {
            Some(ref mut loaded) => Ok(Marshaller::new(types, &mut loaded.heap, &mut loaded.host)),
            None => panic!("COMPILER BUG: module loader lost its instance"),
        }
    }

    fn instantiate(&self) -> HastyResult<LoadedModule> {
        let module: Module = deserialize_buffer(&self.source)
            .map_err(|e| HastyError::runtime(format!("malformed binary module: {}", e)))?;
        self.verify_imports(&module)?;
        let exports = self.verify_exports(&module)?;
        let heap = Heap::new(&self.config)?;
        let gc = exports.get(GC_EXPORT).cloned();
        let module_allocator = exports.contains_key("malloc") && exports.contains_key("free");
        debug!(
            "loaded module with {} function exports",
            exports.len()
        );
        Ok(LoadedModule {
            module,
            exports,
            heap,
            host: HostHeap::new(),
            module_allocator,
            gc,
        })
    }

    fn verify_exports(&self, module: &Module) -> HastyResult<FnvHashMap<String, u32>> {
        let mut exports = FnvHashMap::default();
        if let Some(section) = module.export_section() {
            for entry in section.entries() {
                if let Internal::Function(idx) = entry.internal() {
                    exports.insert(entry.field().to_string(), *idx);
                }
            }
        }
        for name in ["malloc", "free"]
            .iter()
            .copied()
            .chain(self.required_exports.iter().map(|n| n.as_str()))
        {
            if !exports.contains_key(name) {
                return Err(HastyError::runtime(format!(
                    "module does not export `{}`",
                    name
                )));
            }
        }
        Ok(exports)
    }

    fn verify_imports(&self, module: &Module) -> HastyResult {
        let entries = match module.import_section() {
            Some(section) => section.entries(),
            None => return Ok(()),
        };
        for entry in entries {
            if entry.module() != "env" {
                return Err(HastyError::runtime(format!(
                    "unsupported import module `{}`",
                    entry.module()
                )));
            }
            let name = entry.field();
            let supported = match entry.external() {
                External::Memory(_) => name == "memory",
                External::Global(_) => name == "STACKTOP" || name == "__dso_handle",
                External::Function(_) => {
                    MATH_IMPORTS.contains(name)
                        || name == "sbrk"
                        || is_exception_import(name)
                        || is_trampoline_import(name)?
                        || is_runtime_array_import(name)
                }
                External::Table(_) => false,
            };
            if !supported {
                return Err(HastyError::runtime(format!(
                    "unsupported import `env.{}`",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod loader_test {
    use super::*;
    use crate::codegen::wasm;
    use crate::lir;

    fn empty_config() -> LoaderConfig {
        LoaderConfig {
            total_stack: 4096,
            initial_memory: 256 * 1024,
            global_base: 1024,
            static_bump: 0,
        }
    }

    fn answer_program() -> lir::Program {
        let mut prog = lir::Program::default();
        prog.funcs.push(lir::Func {
            name: str!("answer"),
            params: vec![],
            ret_ty: Some(lir::IrType::I32),
            locals: vec![],
            blocks: vec![lir::Block {
                label: 0,
                insts: vec![lir::Inst::Return(Some(lir::Value::ConstI32(42)))],
            }],
            frame_size: 0,
            loops: vec![],
            ifs: vec![],
            exported: true,
        });
        prog
    }

    fn serialized(prog: &lir::Program) -> Vec<u8> {
        parity_wasm::serialize(wasm::codegen(prog)).unwrap()
    }

    #[test]
    fn test_load_is_memoized() {
        let bytes = serialized(&answer_program());
        let mut loader = ModuleLoader::new(
            bytes,
            ReflectionTable::new(),
            vec![str!("answer")],
            empty_config(),
        );
        loader.load().unwrap();
        loader.load().unwrap();
        assert_eq!(loader.loads, 1);
    }

    #[test]
    fn test_heap_state_survives_reload() {
        let bytes = serialized(&answer_program());
        let mut loader = ModuleLoader::new(
            bytes,
            ReflectionTable::new(),
            vec![],
            empty_config(),
        );
        let top = loader.load().unwrap().heap.sbrk(64).unwrap();
        let next = loader.load().unwrap().heap.sbrk(0).unwrap();
        assert_eq!(next, top + 64);
    }

    #[test]
    fn test_missing_export_is_rejected() {
        let bytes = serialized(&answer_program());
        let mut loader = ModuleLoader::new(
            bytes,
            ReflectionTable::new(),
            vec![str!("isPrime")],
            empty_config(),
        );
        let err = loader.load().map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("isPrime"));
    }

    #[test]
    fn test_unknown_import_is_rejected() {
        let mut prog = answer_program();
        prog.add_extern(lir::Extern {
            name: str!("mystery"),
            params: vec![lir::IrType::I32],
            ret_ty: Some(lir::IrType::I32),
        });
        let mut loader = ModuleLoader::new(
            serialized(&prog),
            ReflectionTable::new(),
            vec![],
            empty_config(),
        );
        assert!(loader.load().is_err());
    }

    #[test]
    fn test_runtime_array_imports_are_accepted() {
        let mut prog = answer_program();
        prog.add_extern(lir::Extern {
            name: str!("array_push_f64"),
            params: vec![lir::IrType::Ptr, lir::IrType::Ptr, lir::IrType::I32],
            ret_ty: Some(lir::IrType::I32),
        });
        let mut loader = ModuleLoader::new(
            serialized(&prog),
            ReflectionTable::new(),
            vec![],
            empty_config(),
        );
        assert!(loader.load().is_ok());
    }

    #[test]
    fn test_math_imports_and_exception_stubs() {
        let bytes = serialized(&answer_program());
        let mut loader = ModuleLoader::new(
            bytes,
            ReflectionTable::new(),
            vec![],
            empty_config(),
        );
        let loaded = loader.load().unwrap();
        assert_eq!(
            loaded
                .host_import("pow", &[WasmWord::F64(2.0), WasmWord::F64(10.0)])
                .unwrap(),
            Some(WasmWord::F64(1024.0))
        );
        let err = loaded.host_import("__cxa_throw", &[]).unwrap_err();
        assert!(err.to_string().contains("not supported"));
        assert!(loaded.host_import("invoke_iq", &[]).is_err());
    }
}
