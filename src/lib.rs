// Hazel Programming Language - compiler front-end
// Turns source text into an executable FunctionProto for the external VM.

pub mod ast;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod parser;

use std::rc::Rc;

use rustc_hash::FxHashMap;

use compiler::CodegenVisitor;
use lexer::Scanner;
use parser::Parser;

pub use compiler::proto::{self, FunctionProto, LiteralValue};
pub use error::{CompileError, CompileResult, ErrorKind, Position, Span};

// Language feature bits. A set bit switches the feature away from its
// permissive default.
pub const FEATURE_EXPLICIT_THIS: u32 = 1 << 0;
pub const FEATURE_NO_FUNC_DECL_SUGAR: u32 = 1 << 1;
pub const FEATURE_NO_CLASS_DECL_SUGAR: u32 = 1 << 2;
pub const FEATURE_NO_ROOT_ACCESS: u32 = 1 << 3;
pub const FEATURE_NO_OPTIMIZER: u32 = 1 << 4;

/// A compile-time constant value: scalars plus immutable tables built by
/// `enum` declarations. Field access on a table folds at compile time.
#[derive(Debug, Clone)]
pub enum ConstValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Table(Rc<ConstTable>),
}

impl ConstValue {
    /// Pool representation of a scalar constant; `None` for tables.
    pub fn to_literal(&self) -> Option<LiteralValue> {
        match self {
            ConstValue::Integer(n) => Some(LiteralValue::Integer(*n)),
            ConstValue::Float(n) => Some(LiteralValue::Float(*n)),
            ConstValue::Boolean(b) => Some(LiteralValue::Boolean(*b)),
            ConstValue::String(s) => Some(LiteralValue::String(s.clone())),
            ConstValue::Table(_) => None,
        }
    }
}

/// Named compile-time constants. Used for the context-wide table, the
/// per-compile scoped table, and enum member tables.
#[derive(Debug, Clone, Default)]
pub struct ConstTable {
    entries: FxHashMap<String, ConstValue>,
}

impl ConstTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ConstValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: ConstValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Host callback invoked on compile failure when `raise_error` is set:
/// `(source_name, message, line, column)`.
pub type ErrorCallback = Box<dyn FnMut(&str, &str, usize, usize)>;

/// Per-compile knobs.
pub struct CompileOptions {
    /// Extra outermost scope of named constants, consulted after locals and
    /// outers and before the context constant table.
    pub scoped_bindings: Option<ConstTable>,
    /// Invoke the context error callback on failure.
    pub raise_error: bool,
    /// Emit per-statement `Line` marker instructions.
    pub emit_line_info: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            scoped_bindings: None,
            raise_error: false,
            emit_line_info: true,
        }
    }
}

/// Long-lived compiler state owned by the embedding host: the global constant
/// table, the default feature mask seeding each compile, and the error
/// callback.
#[derive(Default)]
pub struct CompilerContext {
    pub consts: ConstTable,
    pub default_features: u32,
    pub error_callback: Option<ErrorCallback>,
}

impl CompilerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile one source unit into a function prototype.
    pub fn compile(
        &mut self,
        source: &str,
        source_name: &str,
        options: CompileOptions,
    ) -> CompileResult<FunctionProto> {
        let result = self.compile_inner(source, source_name, &options);

        if let Err(ref err) = result {
            if options.raise_error {
                if let Some(callback) = self.error_callback.as_mut() {
                    callback(
                        source_name,
                        &err.message,
                        err.span.start.line,
                        err.span.start.column,
                    );
                }
            }
        }

        result
    }

    fn compile_inner(
        &mut self,
        source: &str,
        source_name: &str,
        options: &CompileOptions,
    ) -> CompileResult<FunctionProto> {
        let seed_features = self.default_features;
        let mut scanner = Scanner::new(source, source_name, seed_features);
        let tokens = scanner.scan_tokens()?;

        if let Some(defaults) = scanner.new_defaults {
            self.default_features = defaults;
        }
        let features = scanner.features;

        let mut parser = Parser::new(
            tokens,
            scanner.feature_updates,
            seed_features,
            source_name,
            source,
        );
        let program = parser.parse()?;

        let codegen = CodegenVisitor::new(
            &mut self.consts,
            options.scoped_bindings.as_ref(),
            features,
            options.emit_line_info,
            source_name,
            source,
        );
        codegen.generate(&program)
    }
}

/// One-shot convenience wrapper around a throwaway context.
pub fn compile(source: &str, source_name: &str) -> CompileResult<FunctionProto> {
    CompilerContext::new().compile(source, source_name, CompileOptions::default())
}
