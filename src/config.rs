//! Compilation options
//!
//! Everything here is plain data with serde derives so a driver can load it
//! from JSON next to the graph being compiled.

use crate::error::{CodegenError, CompileBudget, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// GC write-barrier emission contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// Collector needs the previous value before an object store (SATB)
    pub pre_barrier: bool,
    /// Emit a card mark after object stores
    pub card_mark: bool,
    /// log2 of the card size in bytes
    pub card_shift: u8,
    /// Biased base of the card byte map
    pub card_table_base: i64,
    /// Check the card before dirtying it
    pub conditional_card_mark: bool,
    /// Full StoreLoad fence before the conditional card check (concurrent sweep)
    pub storeload_before_card_check: bool,
    /// StoreStore fence before an unconditional card write
    pub storestore_before_card_mark: bool,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            pre_barrier: false,
            card_mark: true,
            card_shift: 9,
            card_table_base: 0x7f00_0000,
            conditional_card_mark: false,
            storeload_before_card_check: false,
            storestore_before_card_mark: false,
        }
    }
}

impl BarrierConfig {
    /// SATB collector: pre-barrier plus conditional card marking
    pub fn satb() -> Self {
        Self {
            pre_barrier: true,
            conditional_card_mark: true,
            storeload_before_card_check: true,
            ..Self::default()
        }
    }

    /// No barriers at all (epsilon-style collector)
    pub fn none() -> Self {
        Self {
            pre_barrier: false,
            card_mark: false,
            ..Self::default()
        }
    }

    /// Dirty card sentinel
    pub fn dirty_card(&self) -> i64 {
        0
    }
}

/// Per-compiler options shared by every method it compiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Emit array bounds checks
    pub range_checks: bool,
    /// Emit array store type checks for object arrays
    pub store_checks: bool,
    /// Request store profiling (forces the store check even for null)
    pub profile_stores: bool,
    /// Increment backedge counters at safepoint branches
    pub count_backedges: bool,
    /// Increment applied to the backedge counter
    pub backedge_step: i32,
    /// Reserve the extra scratch register biased locking needs
    pub biased_locking: bool,
    /// Edges whose relative weight is below this percentage are infrequent
    pub block_layout_min_diamond_percentage: u32,
    /// Rotate loops so the exit test falls through
    pub block_layout_rotate_loops: bool,
    pub barrier: BarrierConfig,
    pub budget: CompileBudget,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            range_checks: true,
            store_checks: true,
            profile_stores: false,
            count_backedges: true,
            backedge_step: 1,
            biased_locking: false,
            block_layout_min_diamond_percentage: 20,
            block_layout_rotate_loops: true,
            barrier: BarrierConfig::default(),
            budget: CompileBudget::default(),
        }
    }
}

impl CompileOptions {
    /// Load options from a JSON file; missing fields take defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let options: CompileOptions = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_layout_min_diamond_percentage > 100 {
            return Err(CodegenError::Config(format!(
                "block_layout_min_diamond_percentage {} is not a percentage",
                self.block_layout_min_diamond_percentage
            )));
        }
        if self.barrier.card_shift == 0 || self.barrier.card_shift > 20 {
            return Err(CodegenError::Config(format!(
                "card_shift {} out of range",
                self.barrier.card_shift
            )));
        }
        Ok(())
    }
}
