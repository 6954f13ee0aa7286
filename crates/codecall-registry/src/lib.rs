#![warn(missing_docs)]

//! # codecall-registry
//!
//! Function registry for the codecall runtime.
//!
//! [`Registry::discover`] scans a source root for TypeScript and JavaScript
//! files, statically extracts the signatures of their top-level exported
//! functions, and builds an immutable table of [`FunctionDescriptor`]s keyed
//! by name. Each source file is also reduced to plain JavaScript
//! ([`SourceModule::runtime_js`]) so the privileged function host can load it
//! without a TypeScript toolchain.
//!
//! A built [`Registry`] is never mutated. [`LiveRegistry`] swaps whole
//! registries atomically for refresh, and running sessions keep the snapshot
//! they started with.

pub mod descriptor;
mod extract;
pub mod live;
pub mod strip;
pub mod types;
#[cfg(feature = "watch")]
pub mod watcher;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use codecall_error::{CallError, ErrorKind};
use oxc_allocator::Allocator;
use oxc_parser::Parser;
use oxc_span::SourceType;
use thiserror::Error;

pub use descriptor::{FunctionDescriptor, Param};
pub use live::LiveRegistry;
pub use strip::ExportBinding;
pub use types::{Field, PrimitiveKind, TypeMismatch, TypeTree};
#[cfg(feature = "watch")]
pub use watcher::RegistryWatcher;

/// File extensions recognized as function sources.
pub const SOURCE_EXTENSIONS: &[&str] = &["ts", "mts", "js", "mjs"];

/// Errors that prevent a registry from being built. Always fatal at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistrationError {
    /// The configured source root does not exist or is not a directory.
    #[error("function root not found: {}", path.display())]
    RootNotFound {
        /// The configured root.
        path: PathBuf,
    },

    /// A source file or directory could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// The path being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A source file has syntax errors.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Source file relative to the root.
        path: String,
        /// First parser diagnostic.
        message: String,
    },

    /// A source file uses a construct the function host cannot run.
    #[error("unsupported construct in {path}: {detail}")]
    Unsupported {
        /// Source file relative to the root.
        path: String,
        /// What was found.
        detail: String,
    },

    /// Two exports share a name.
    #[error("duplicate function '{name}' exported by {first} and {second}")]
    DuplicateFunction {
        /// The contested name.
        name: String,
        /// Where the name was first registered.
        first: String,
        /// The conflicting definition.
        second: String,
    },
}

impl RegistrationError {
    /// Taxonomy kind. Always [`ErrorKind::RegistrationError`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::RegistrationError
    }
}

/// One loaded source file, ready for the function host.
#[derive(Debug, Clone)]
pub struct SourceModule {
    /// Path relative to the registry root, `/`-separated.
    pub path: String,
    /// Exported value bindings.
    pub exports: Vec<ExportBinding>,
    /// A JavaScript function expression taking a single `register` callback.
    /// Calling it evaluates the module body and passes an object mapping
    /// exported names to values.
    pub runtime_js: String,
}

/// Immutable table of callable functions.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    functions: BTreeMap<String, FunctionDescriptor>,
    modules: Vec<SourceModule>,
    root: Option<PathBuf>,
}

impl Registry {
    /// A registry with no functions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry from explicit descriptors, without any source
    /// modules. Used with hosts whose implementations are not scripts.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = FunctionDescriptor>,
    ) -> Result<Self, RegistrationError> {
        let mut registry = Self::empty();
        for d in descriptors {
            registry.insert(d)?;
        }
        Ok(registry)
    }

    /// Scan `root` recursively and build the registry.
    ///
    /// Files are visited in sorted path order. Hidden directories,
    /// `node_modules`, and declaration files (`.d.ts`) are skipped. Any
    /// unreadable, unparsable, or unsupported file, and any duplicate
    /// function name, fails the whole build.
    pub fn discover(root: impl AsRef<Path>) -> Result<Self, RegistrationError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(RegistrationError::RootNotFound {
                path: root.to_path_buf(),
            });
        }

        let mut files = Vec::new();
        collect_sources(root, &mut files)?;

        let mut registry = Self {
            root: Some(root.to_path_buf()),
            ..Self::default()
        };
        // Every export, described or not, claims its name.
        let mut exporters: BTreeMap<String, String> = BTreeMap::new();
        for file in &files {
            let rel = relative_path(root, file);
            let source = std::fs::read_to_string(file).map_err(|e| RegistrationError::Io {
                path: file.clone(),
                source: e,
            })?;
            let (module, descriptors) = load_module(file, &rel, &source)?;
            for export in &module.exports {
                if let Some(first) = exporters.get(&export.exported) {
                    return Err(RegistrationError::DuplicateFunction {
                        name: export.exported.clone(),
                        first: first.clone(),
                        second: rel.clone(),
                    });
                }
                exporters.insert(export.exported.clone(), rel.clone());
            }
            for d in descriptors {
                registry.insert(d)?;
            }
            if !module.exports.is_empty() {
                registry.modules.push(module);
            }
        }

        tracing::info!(
            root = %root.display(),
            files = files.len(),
            functions = registry.functions.len(),
            "function registry built"
        );
        Ok(registry)
    }

    fn insert(&mut self, descriptor: FunctionDescriptor) -> Result<(), RegistrationError> {
        if let Some(existing) = self.functions.get(&descriptor.name) {
            return Err(RegistrationError::DuplicateFunction {
                name: descriptor.name.clone(),
                first: existing.source_file.clone(),
                second: descriptor.source_file,
            });
        }
        self.functions.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Look up a function by name.
    ///
    /// Misses carry a "did you mean" suggestion when a registered name is
    /// close enough.
    pub fn lookup(&self, name: &str) -> Result<&FunctionDescriptor, CallError> {
        self.functions
            .get(name)
            .ok_or_else(|| CallError::UnknownFunction {
                name: name.to_string(),
                suggestion: codecall_error::suggest(name, self.names()),
            })
    }

    /// Look up a function by name without building an error.
    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(name)
    }

    /// All descriptors, ordered by name.
    pub fn descriptors(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.functions.values()
    }

    /// All registered names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Loaded source modules, in path order.
    pub fn modules(&self) -> &[SourceModule] {
        &self.modules
    }

    /// The scanned root, for registries built by [`discover`](Self::discover).
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether no functions are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn is_source_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.ends_with(".d.ts") || name.ends_with(".d.mts") {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RegistrationError> {
    let io_err = |e| RegistrationError::Io {
        path: dir.to_path_buf(),
        source: e,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "node_modules" {
            continue;
        }
        let file_type = entry.file_type().map_err(io_err)?;
        if file_type.is_dir() {
            collect_sources(&path, out)?;
        } else if is_source_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn relative_path(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parse one source file into a host module and its descriptors.
fn load_module(
    file: &Path,
    rel: &str,
    source: &str,
) -> Result<(SourceModule, Vec<FunctionDescriptor>), RegistrationError> {
    let source_type = SourceType::from_path(file).map_err(|e| RegistrationError::Unsupported {
        path: rel.to_string(),
        detail: e.to_string(),
    })?;

    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        return Err(RegistrationError::Parse {
            path: rel.to_string(),
            message: ret
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "parser panicked on malformed input".into()),
        });
    }

    let blanked = strip::blank_types(source, &ret.program).map_err(|detail| {
        RegistrationError::Unsupported {
            path: rel.to_string(),
            detail,
        }
    })?;
    let descriptors = extract::extract_functions(&ret.program, rel, &blanked.exports);

    let runtime_js = module_wrapper(&blanked.code, &blanked.exports);
    check_runtime_js(&runtime_js).map_err(|detail| RegistrationError::Unsupported {
        path: rel.to_string(),
        detail,
    })?;

    tracing::debug!(
        file = %rel,
        exports = blanked.exports.len(),
        functions = descriptors.len(),
        "loaded function source"
    );

    Ok((
        SourceModule {
            path: rel.to_string(),
            exports: blanked.exports,
            runtime_js,
        },
        descriptors,
    ))
}

/// Wrap erased module code in a function expression that hands its exports
/// to a register callback. The body starts on the first line so line
/// numbers match the source file.
fn module_wrapper(code: &str, exports: &[ExportBinding]) -> String {
    let entries = exports
        .iter()
        .map(|e| {
            let key = serde_json::to_string(&e.exported).unwrap_or_else(|_| "\"\"".into());
            format!("{key}: {}", e.local)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("(function (__codecall_register) {{ {code}\n;__codecall_register({{ {entries} }});\n}})")
}

/// Parse erased output as JavaScript to catch TypeScript syntax that
/// survived erasure.
fn check_runtime_js(js: &str) -> Result<(), String> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, js, SourceType::mjs()).parse();
    match ret.errors.first() {
        Some(e) => Err(format!("type erasure left invalid JavaScript: {e}")),
        None if ret.panicked => Err("type erasure left invalid JavaScript".into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeTree;

    fn double() -> FunctionDescriptor {
        FunctionDescriptor::new(
            "double",
            vec![Param::new("x", TypeTree::number())],
            TypeTree::number(),
            "math.ts",
        )
    }

    #[test]
    fn from_descriptors_rejects_duplicates() {
        let mut other = double();
        other.source_file = "other.ts".into();
        let err = Registry::from_descriptors([double(), other]).unwrap_err();
        match err {
            RegistrationError::DuplicateFunction {
                name,
                first,
                second,
            } => {
                assert_eq!(name, "double");
                assert_eq!(first, "math.ts");
                assert_eq!(second, "other.ts");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lookup_hit_and_miss() {
        let registry = Registry::from_descriptors([double()]).unwrap();
        assert_eq!(registry.lookup("double").unwrap().name, "double");

        let err = registry.lookup("dubble").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFunction);
        assert_eq!(
            err.to_payload().suggestion.as_deref(),
            Some("Did you mean 'double'?")
        );
    }

    #[test]
    fn empty_registry_lookup_is_unknown_function() {
        let registry = Registry::empty();
        let err = registry.lookup("anything").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFunction);
        assert!(err.to_payload().suggestion.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn source_file_filter() {
        assert!(is_source_file(Path::new("a/b.ts")));
        assert!(is_source_file(Path::new("b.mjs")));
        assert!(!is_source_file(Path::new("b.d.ts")));
        assert!(!is_source_file(Path::new("b.json")));
        assert!(!is_source_file(Path::new("b.tsx")));
    }

    #[test]
    fn wrapper_registers_exports() {
        let js = module_wrapper(
            "function a() {}",
            &[ExportBinding {
                exported: "b".into(),
                local: "a".into(),
            }],
        );
        assert!(js.starts_with("(function (__codecall_register) { function a() {}"));
        assert!(js.contains("__codecall_register({ \"b\": a })"));
        assert!(check_runtime_js(&js).is_ok());
    }

    #[test]
    fn leftover_type_syntax_is_caught() {
        assert!(check_runtime_js("(function () { let x: number = 1; })").is_err());
    }
}
