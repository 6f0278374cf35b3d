// This module defines the error types of the JIT using the thiserror crate. CompileError
// covers IR verification, instruction encoding and object file emission failures raised
// while turning a module into relocatable machine code. LinkError covers malformed objects,
// relocation kinds the linker does not understand, relocation overflow, unresolved symbols
// and memory mapping failures. JitError is the error surfaced by the execution session and
// wraps the layer errors; undefined symbols and memory exhaustion coming out of the linker
// are promoted to their own JitError variants so callers can match on them directly.
// CompileResult and JitResult are convenience aliases.

//! Error types for the JIT.

use crate::ir::parser::ParseError;
use crate::jit::memory::MemoryError;
use crate::jit::session::ModuleKey;
use crate::x64::encoder::EncodingError;
use thiserror::Error;

/// Failure while compiling IR to an object file.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Invalid IR in {function}: {reason}")]
    InvalidIr { function: String, reason: String },

    #[error("Instruction encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    #[error("Object emission failed: {reason}")]
    ObjectWrite { reason: String },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Failure while linking an object into executable memory.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Malformed object file: {reason}")]
    MalformedObject { reason: String },

    #[error("Unsupported relocation {kind} ({size} bits) at {section}+{offset:#x}")]
    UnsupportedRelocation {
        kind: String,
        size: u8,
        section: String,
        offset: u64,
    },

    #[error("Relocation against {symbol} does not fit in {size} bits")]
    RelocationOverflow { symbol: String, size: u8 },

    #[error("Undefined symbol: {name}")]
    UndefinedSymbol { name: String },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors reported by the execution session.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("Unsupported host target: {reason}")]
    TargetDetection { reason: String },

    #[error("Compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("Linking failed: {0}")]
    Link(LinkError),

    #[error("Undefined symbol: {name}")]
    UndefinedSymbol { name: String },

    #[error("Duplicate definition of symbol: {name}")]
    DuplicateSymbol { name: String },

    #[error("Symbol not found: {name}")]
    SymbolNotFound { name: String },

    #[error("Unknown module key: {0}")]
    UnknownKey(ModuleKey),

    #[error("Resource allocation failed: {0}")]
    Resource(MemoryError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

impl From<LinkError> for JitError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::UndefinedSymbol { name } => JitError::UndefinedSymbol { name },
            LinkError::Memory(mem) => JitError::Resource(mem),
            other => JitError::Link(other),
        }
    }
}

impl From<MemoryError> for JitError {
    fn from(err: MemoryError) -> Self {
        JitError::Resource(err)
    }
}

/// Result type alias for session operations.
pub type JitResult<T> = Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_errors_are_promoted() {
        let err: JitError = LinkError::UndefinedSymbol {
            name: "missing".into(),
        }
        .into();
        assert!(matches!(err, JitError::UndefinedSymbol { ref name } if name == "missing"));

        let err: JitError = LinkError::Memory(MemoryError::Map {
            size: 4096,
            errno: 12,
        })
        .into();
        assert!(matches!(err, JitError::Resource(_)));

        let err: JitError = LinkError::RelocationOverflow {
            symbol: "far".into(),
            size: 32,
        }
        .into();
        assert!(matches!(err, JitError::Link(_)));
        assert!(err.to_string().contains("far"));
    }
}
