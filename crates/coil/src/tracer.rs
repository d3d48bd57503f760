//! Interpreter execution tracing.
//!
//! The [`VmTracer`] trait defines hook points at the interesting moments of execution
//! (instruction dispatch, frame push/pop, exceptions being raised and handled, block
//! unwinding). Every hook has an empty inlined default, and the interpreter carries
//! the tracer as a type parameter, so `NoopTracer` disappears after monomorphization
//! the same way `NoLimitTracker` removes resource checks.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency and per-function call counters |
//! | [`RecordingTracer`] | Full event recording for tests and post-mortem analysis |

use std::fmt;

use ahash::AHashMap;

use crate::bytecode::Opcode;

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched at the given byte offset.
    Instruction {
        ip: usize,
        opcode: Opcode,
        /// Operand stack depth of the current frame at dispatch time.
        stack_depth: usize,
    },
    /// A frame was pushed.
    Call { name: String, depth: usize },
    /// A frame was popped.
    Return { depth: usize },
    /// An exception started unwinding the current frame.
    ExceptionRaised { exc_type: String, depth: usize },
    /// An except or finally handler was entered for an exception.
    ExceptionHandled { exc_type: String, handler: usize },
    /// The block stack was unwound for a non-exception reason.
    Unwind { reason: &'static str, depth: usize },
}

/// Trait for interpreter execution tracing.
///
/// All methods have default no-op implementations; implementations only override the
/// hooks they care about.
pub trait VmTracer: fmt::Debug {
    /// Called before each opcode dispatch. This is the hottest hook.
    ///
    /// # Arguments
    /// * `ip` - Byte offset of the opcode in the code object's bytecode
    /// * `opcode` - The opcode about to be executed
    /// * `stack_depth` - Number of values on the current frame's operand stack
    /// * `frame_depth` - Number of frames on the frame stack
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called after a frame is pushed, with the code object's name.
    #[inline(always)]
    fn on_call(&mut self, _name: &str, _depth: usize) {}

    /// Called after a frame is popped.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when an exception starts unwinding a frame.
    #[inline(always)]
    fn on_exception_raised(&mut self, _exc_type: &str, _depth: usize) {}

    /// Called when an exception enters an except or finally handler.
    #[inline(always)]
    fn on_exception_handled(&mut self, _exc_type: &str, _handler: usize) {}

    /// Called when `return`, `break` or `continue` unwinds through the block stack.
    #[inline(always)]
    fn on_unwind(&mut self, _reason: &'static str, _depth: usize) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Tracer that prints a human-readable execution log to stderr.
///
/// ```text
/// [    0] LoadConst  stack=0  frames=1
///   >>> CALL f                    depth=2
/// [    0] LoadFast  stack=0  frames=2
///   <<< RETURN              depth=1
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Maximum number of instructions to trace. None = unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    /// Creates a new stderr tracer with no instruction limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new stderr tracer that goes quiet after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[{ip:>5}] {opcode:?}  stack={stack_depth}  frames={frame_depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> CALL {name:<20} depth={depth}");
        }
    }

    fn on_return(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< RETURN              depth={depth}");
        }
    }

    fn on_exception_raised(&mut self, exc_type: &str, depth: usize) {
        if !self.stopped {
            eprintln!("  !!! RAISE {exc_type:<19} depth={depth}");
        }
    }

    fn on_exception_handled(&mut self, exc_type: &str, handler: usize) {
        if !self.stopped {
            eprintln!("  ... HANDLE {exc_type:<18} handler={handler}");
        }
    }

    fn on_unwind(&mut self, reason: &'static str, depth: usize) {
        if !self.stopped {
            eprintln!("  ... UNWIND {reason:<18} depth={depth}");
        }
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

/// Tracer that collects execution statistics.
///
/// Retrieve results via [`ProfilingTracer::report`] after execution.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: AHashMap<Opcode, u64>,
    call_counts: AHashMap<String, u64>,
    total_instructions: u64,
    total_calls: u64,
    total_exceptions: u64,
    max_depth: usize,
}

/// Summary report from a profiling trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilingReport {
    /// Per-opcode execution counts, most executed first.
    pub opcode_counts: Vec<(Opcode, u64)>,
    /// Per-function call counts, most called first.
    pub call_counts: Vec<(String, u64)>,
    pub total_instructions: u64,
    pub total_calls: u64,
    pub total_exceptions: u64,
    pub max_depth: usize,
}

impl ProfilingTracer {
    /// Creates a new profiling tracer with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a report from the collected data.
    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        // ties are broken by opcode byte so reports are deterministic
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then((a.0 as u8).cmp(&(b.0 as u8))));
        let mut call_counts: Vec<_> = self.call_counts.iter().map(|(k, &v)| (k.clone(), v)).collect();
        call_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ProfilingReport {
            opcode_counts,
            call_counts,
            total_instructions: self.total_instructions,
            total_calls: self.total_calls,
            total_exceptions: self.total_exceptions,
            max_depth: self.max_depth,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
        if let Some(count) = self.call_counts.get_mut(name) {
            *count += 1;
        } else {
            self.call_counts.insert(name.to_owned(), 1);
        }
    }

    fn on_exception_raised(&mut self, _exc_type: &str, _depth: usize) {
        self.total_exceptions += 1;
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Exceptions raised:  {}", self.total_exceptions)?;
        writeln!(f, "Max frame depth:    {}", self.max_depth)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions.max(1) as f64) * 100.0;
            writeln!(f, "  {opcode:<20?} {count:>10}  ({pct:>5.1}%)")?;
        }
        writeln!(f)?;
        writeln!(f, "--- Calls ---")?;
        for (name, count) in &self.call_counts {
            writeln!(f, "  {name:<20} {count:>10}")?;
        }
        Ok(())
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Tracer that records every event, optionally up to a limit.
///
/// This is the most expensive tracer (it allocates per event), so use it for tests
/// and for recording short executions.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    /// Creates a new recording tracer with no event limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new recording tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    /// Returns the recorded events.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Consumes the tracer and returns the recorded events.
    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_none_or(|l| self.events.len() < l) {
            self.events.push(event);
        }
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        self.record(TraceEvent::Instruction {
            ip,
            opcode,
            stack_depth,
        });
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        self.record(TraceEvent::Call {
            name: name.to_owned(),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_exception_raised(&mut self, exc_type: &str, depth: usize) {
        self.record(TraceEvent::ExceptionRaised {
            exc_type: exc_type.to_owned(),
            depth,
        });
    }

    fn on_exception_handled(&mut self, exc_type: &str, handler: usize) {
        self.record(TraceEvent::ExceptionHandled {
            exc_type: exc_type.to_owned(),
            handler,
        });
    }

    fn on_unwind(&mut self, reason: &'static str, depth: usize) {
        self.record(TraceEvent::Unwind { reason, depth });
    }
}
