//! Compilation driver
//!
//! One method runs the whole pass pipeline on the calling thread:
//! CFG, dominators, loop tree, frequencies, code motion, LIR generation and
//! block layout. Independent methods compile in parallel in
//! [`Compiler::compile_batch`], each with its own [`CompileContext`].

use crate::cfg::{dom, gcm, layout, loops, BlockId, Cfg};
use crate::config::CompileOptions;
use crate::error::{CodegenError, Result};
use crate::ir::Graph;
use crate::lir::{CodeStub, LirBlock};
use crate::lirgen::LirGenerator;
use crate::operand::VReg;
use crate::target::{Isa, TargetDescriptor, TargetFamily};
use crossbeam::channel;
use metrics::{counter, histogram};
use std::cell::Cell;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

/// Per-compilation state: the private copy of the graph and the virtual
/// register counter
///
/// Dropped as a whole when the method finishes or is abandoned.
pub struct CompileContext<'a> {
    pub graph: Graph,
    pub target: &'a TargetDescriptor,
    pub isa: &'static dyn Isa,
    pub options: &'a CompileOptions,
    next_vreg: Cell<u32>,
}

impl<'a> CompileContext<'a> {
    pub fn new(graph: Graph, target: &'a TargetDescriptor, options: &'a CompileOptions) -> Self {
        Self {
            graph,
            target,
            isa: target.isa(),
            options,
            next_vreg: Cell::new(0),
        }
    }

    pub fn new_vreg(&self) -> VReg {
        let v = self.next_vreg.get();
        self.next_vreg.set(v + 1);
        VReg(v)
    }

    pub fn vreg_count(&self) -> u32 {
        self.next_vreg.get()
    }
}

/// Result of compiling one method
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub name: String,
    pub target: TargetFamily,
    /// Blocks in final layout order
    pub blocks: Vec<LirBlock>,
    pub stubs: Vec<CodeStub>,
    pub vreg_count: u32,
    /// Loop heads the assembler should align
    pub loop_heads: Vec<BlockId>,
}

impl CompiledMethod {
    pub fn op_count(&self) -> usize {
        self.blocks.iter().map(|b| b.ops.len()).sum()
    }

    pub fn block_order(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id).collect()
    }
}

impl fmt::Display for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "method {} ({}, {} blocks, {} vregs)",
            self.name,
            self.target,
            self.blocks.len(),
            self.vreg_count
        )?;
        for block in &self.blocks {
            write!(f, "  {}", block)?;
        }
        if !self.stubs.is_empty() {
            writeln!(f, "  stubs:")?;
            for stub in &self.stubs {
                write!(f, "    S{} {:?}", stub.id.0, stub.kind)?;
                if let Some(info) = stub.info {
                    write!(f, " @{}", info.bci)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

pub struct Compiler {
    target: TargetDescriptor,
    options: CompileOptions,
}

impl Compiler {
    pub fn new(target: TargetDescriptor, options: CompileOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { target, options })
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Compile one method; the input graph is left untouched
    pub fn compile_method(&self, graph: &Graph) -> Result<CompiledMethod> {
        let span = info_span!("compile", method = %graph.name, target = %self.target.family);
        let _enter = span.enter();
        let started = Instant::now();

        let result = self.run_passes(graph);
        match &result {
            Ok(method) => {
                counter!("blockforge_methods_compiled", 1, "target" => self.target.family.to_string());
                histogram!("blockforge_compile_seconds", started.elapsed().as_secs_f64());
                histogram!("blockforge_lir_ops", method.op_count() as f64);
                histogram!("blockforge_blocks", method.blocks.len() as f64);
                info!(
                    blocks = method.blocks.len(),
                    ops = method.op_count(),
                    stubs = method.stubs.len(),
                    "compiled"
                );
            }
            Err(e) => {
                counter!("blockforge_compile_failures", 1, "class" => e.class());
                warn!(error = %e, "compilation failed");
            }
        }
        result
    }

    fn run_passes(&self, graph: &Graph) -> Result<CompiledMethod> {
        let budget = &self.options.budget;
        budget.check_node_count(graph.len())?;
        graph.validate()?;

        let mut private = graph.clone();
        let split = private.split_critical_edges();
        let ctx = CompileContext::new(private, &self.target, &self.options);
        let graph = &ctx.graph;

        let mut cfg = Cfg::build(graph)?;
        budget.check_block_count(cfg.len())?;
        dom::compute_dominators(&mut cfg)?;
        loops::build_loop_tree(&mut cfg)?;
        loops::estimate_frequency(&mut cfg);
        let gcm_stats = gcm::global_code_motion(graph, &mut cfg)?;
        debug!(
            blocks = cfg.len(),
            split_edges = split,
            loops = cfg.loop_tree.len().saturating_sub(1),
            floating = gcm_stats.floating,
            hoisted = gcm_stats.hoisted,
            "scheduled"
        );

        let lir = LirGenerator::new(&ctx, &cfg).generate()?;
        budget.check_lir_count(lir.op_count())?;
        let (blocks, stats) = layout::layout_blocks(graph, &cfg, &self.options, lir.blocks)?;
        debug!(
            traces = stats.traces,
            fall_throughs = stats.fall_throughs,
            "laid out"
        );

        let loop_heads = blocks.iter().filter(|b| b.aligned).map(|b| b.id).collect();
        Ok(CompiledMethod {
            name: graph.name.clone(),
            target: self.target.family,
            blocks,
            stubs: lir.stubs,
            vreg_count: ctx.vreg_count(),
            loop_heads,
        })
    }

    /// Compile independent methods on `workers` threads
    ///
    /// Results come back in input order.
    pub fn compile_batch(&self, graphs: Vec<Graph>, workers: usize) -> Vec<Result<CompiledMethod>> {
        let total = graphs.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = workers.clamp(1, total);
        let (job_tx, job_rx) = channel::unbounded::<(usize, Graph)>();
        let (result_tx, result_rx) = channel::unbounded::<(usize, Result<CompiledMethod>)>();
        for job in graphs.into_iter().enumerate() {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let scoped = crossbeam::scope(|s| {
            for worker in 0..workers {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                s.spawn(move |_| {
                    for (index, graph) in jobs.iter() {
                        debug!(worker, index, method = %graph.name, "picked up method");
                        if results.send((index, self.compile_method(&graph))).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);
        if scoped.is_err() {
            warn!("a compile worker panicked");
        }

        let mut slots: Vec<Option<Result<CompiledMethod>>> = (0..total).map(|_| None).collect();
        for (index, result) in result_rx.iter() {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    Err(CodegenError::Internal(format!("method {} was abandoned by its worker", i)))
                })
            })
            .collect()
    }
}
