//! Error Types for blockforge
//!
//! Two disjoint failure classes come out of the backend: internal invariant
//! violations (the input or an earlier pass is broken) and operations the
//! selected target cannot express. Runtime faults of the compiled program are
//! not errors at all; they are lowered to branches into code stubs.

use std::fmt;

/// Unified error type for blockforge operations
#[derive(Debug, Clone, PartialEq)]
pub enum CodegenError {
    /// Compiler invariant violated (unreachable block, no legal schedule, ...)
    Internal(String),
    /// Operation is not implemented on the selected target
    Unsupported(String),
    /// Input graph failed validation
    MalformedGraph(String),
    /// Compilation exceeded its size budget
    BudgetExceeded(String),
    /// Invalid configuration
    Config(String),
    /// I/O operation failed
    Io(String),
}

impl CodegenError {
    /// True for failures that indicate a bug in the input or in a pass
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CodegenError::Internal(_) | CodegenError::MalformedGraph(_)
        )
    }

    /// True when the target lacks the requested operation
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CodegenError::Unsupported(_))
    }

    /// Short label used for metrics
    pub fn class(&self) -> &'static str {
        match self {
            CodegenError::Internal(_) => "internal",
            CodegenError::Unsupported(_) => "unsupported",
            CodegenError::MalformedGraph(_) => "malformed",
            CodegenError::BudgetExceeded(_) => "budget",
            CodegenError::Config(_) => "config",
            CodegenError::Io(_) => "io",
        }
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::Internal(msg) => write!(f, "Internal compiler error: {}", msg),
            CodegenError::Unsupported(msg) => {
                write!(f, "Not implemented on this platform: {}", msg)
            }
            CodegenError::MalformedGraph(msg) => write!(f, "Malformed graph: {}", msg),
            CodegenError::BudgetExceeded(msg) => write!(f, "Budget exceeded: {}", msg),
            CodegenError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CodegenError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for CodegenError {}

/// Result type alias for blockforge operations
pub type Result<T> = std::result::Result<T, CodegenError>;

impl From<std::io::Error> for CodegenError {
    fn from(err: std::io::Error) -> Self {
        CodegenError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CodegenError {
    fn from(err: serde_json::Error) -> Self {
        CodegenError::Config(format!("JSON error: {}", err))
    }
}

/// Size limits for a single compilation
///
/// The broker abandons a method wholesale when any of these trips; the
/// per-compilation context is simply dropped.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CompileBudget {
    /// Maximum IR nodes in the input graph
    pub max_nodes: usize,
    /// Maximum basic blocks after CFG construction
    pub max_blocks: usize,
    /// Maximum emitted LIR operations
    pub max_lir_ops: usize,
}

impl Default for CompileBudget {
    fn default() -> Self {
        Self {
            max_nodes: 80_000,
            max_blocks: 10_000,
            max_lir_ops: 200_000,
        }
    }
}

impl CompileBudget {
    /// Tight limits for background compilation of small methods
    pub fn strict() -> Self {
        Self {
            max_nodes: 4_000,
            max_blocks: 500,
            max_lir_ops: 10_000,
        }
    }

    /// Effectively unbounded limits
    pub fn trusted() -> Self {
        Self {
            max_nodes: 1_000_000,
            max_blocks: 250_000,
            max_lir_ops: 4_000_000,
        }
    }

    pub fn check_node_count(&self, count: usize) -> Result<()> {
        if count > self.max_nodes {
            return Err(CodegenError::BudgetExceeded(format!(
                "Node count {} exceeds limit {}",
                count, self.max_nodes
            )));
        }
        Ok(())
    }

    pub fn check_block_count(&self, count: usize) -> Result<()> {
        if count > self.max_blocks {
            return Err(CodegenError::BudgetExceeded(format!(
                "Block count {} exceeds limit {}",
                count, self.max_blocks
            )));
        }
        Ok(())
    }

    pub fn check_lir_count(&self, count: usize) -> Result<()> {
        if count > self.max_lir_ops {
            return Err(CodegenError::BudgetExceeded(format!(
                "LIR op count {} exceeds limit {}",
                count, self.max_lir_ops
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodegenError::Unsupported("CRC32 intrinsic".to_string());
        assert!(err.to_string().contains("Not implemented on this platform"));
        assert!(err.is_unsupported());
        assert!(!err.is_internal());
    }

    #[test]
    fn test_error_classes_are_disjoint() {
        let internal = CodegenError::Internal("block B3 unreachable".into());
        assert!(internal.is_internal());
        assert!(!internal.is_unsupported());
        assert_eq!(internal.class(), "internal");
    }

    #[test]
    fn test_budget_default() {
        let budget = CompileBudget::default();
        assert!(budget.check_node_count(1000).is_ok());
        assert!(budget.check_node_count(100_000).is_err());
    }

    #[test]
    fn test_budget_strict() {
        let budget = CompileBudget::strict();
        assert!(budget.check_block_count(100).is_ok());
        assert!(budget.check_block_count(501).is_err());
        assert!(budget.check_lir_count(20_000).is_err());
    }
}
