use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::exception_private::{ExcType, RunError, SimpleException};

/// Threshold in bytes above which `check_large_result` is called.
///
/// Operations that may produce results larger than this (shifts, powers, repeated
/// sequences) ask the tracker before building the result, so a limit can reject
/// `1 << 100000000` before the digits are allocated.
pub const LARGE_RESULT_THRESHOLD: usize = 100_000;

/// Recommended maximum recursion depth if not otherwise specified.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Error returned when a resource limit is exceeded during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum number of allocations exceeded.
    Allocation { limit: usize, count: usize },
    /// Maximum instruction count exceeded.
    Operation { limit: usize, count: usize },
    /// Maximum execution time exceeded.
    Time { limit: Duration, elapsed: Duration },
    /// Maximum memory usage exceeded.
    Memory { limit: usize, used: usize },
    /// Maximum recursion depth exceeded.
    Recursion { limit: usize, depth: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => write!(f, "allocation limit exceeded: {count} > {limit}"),
            Self::Operation { limit, count } => write!(f, "operation limit exceeded: {count} > {limit}"),
            Self::Time { limit, elapsed } => write!(f, "time limit exceeded: {elapsed:?} > {limit:?}"),
            Self::Memory { limit, used } => write!(f, "memory limit exceeded: {used} bytes > {limit} bytes"),
            Self::Recursion { .. } => write!(f, "maximum recursion depth exceeded"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<ResourceError> for RunError {
    /// Maps a limit violation onto the exception the running code observes.
    ///
    /// - `Allocation` / `Memory` become a message-less `MemoryError`, which is reported
    ///   through the pre-allocated singleton instance
    /// - `Recursion` becomes a catchable `RuntimeError`
    /// - `Time` / `Operation` are uncatchable: no handler or finally block runs
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Allocation { .. } | ResourceError::Memory { .. } => {
                Self::Exc(Box::new(SimpleException::new_none(ExcType::MemoryError)))
            }
            ResourceError::Recursion { .. } => {
                Self::Exc(Box::new(SimpleException::new_msg(ExcType::RuntimeError, err)))
            }
            ResourceError::Time { .. } | ResourceError::Operation { .. } => {
                Self::Uncatchable(Box::new(SimpleException::new_msg(ExcType::RuntimeError, err)))
            }
        }
    }
}

/// Trait for tracking resource usage.
///
/// The heap calls into the tracker on every allocation and free, the interpreter on
/// every instruction and every frame push. `NoLimitTracker` implements all of these as
/// inlined no-ops so unrestricted execution pays nothing for the hooks.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap allocation.
    ///
    /// Returns `Ok(())` if the allocation should proceed, or `Err(ResourceError)`
    /// if a limit would be exceeded. The size closure is only evaluated when memory
    /// is actually tracked.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called before inserting an item into an existing container (list append,
    /// dict insert), so in-place growth still counts against the allocation budget.
    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        self.on_allocate(|| 0)
    }

    /// Called when a heap value is freed.
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Called before each instruction is dispatched; enforces the operation and time limits.
    fn on_instruction(&mut self) -> Result<(), ResourceError>;

    /// Called before pushing a new frame.
    ///
    /// # Arguments
    /// * `current_depth` - Current frame depth (before the new frame is pushed)
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;

    /// Called before operations that may produce results above `LARGE_RESULT_THRESHOLD`.
    fn check_large_result(&self, estimated_bytes: usize) -> Result<(), ResourceError>;

    /// Returns the total number of allocations tracked, if this tracker records them.
    fn allocation_count(&self) -> Option<usize> {
        None
    }

    /// Returns the current approximate memory usage in bytes, if tracked.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// A resource tracker that enforces nothing but the default recursion depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}

    #[inline]
    fn on_instruction(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Without a configured limit native recursion would eventually overflow the Rust
    /// stack, so the default depth still applies.
    #[inline]
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if current_depth >= DEFAULT_MAX_RECURSION_DEPTH {
            Err(ResourceError::Recursion {
                limit: DEFAULT_MAX_RECURSION_DEPTH,
                depth: current_depth + 1,
            })
        } else {
            Ok(())
        }
    }

    #[inline]
    fn check_large_result(&self, _estimated_bytes: usize) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Limits enforced by [`LimitedTracker`]; `None` disables one.
///
/// `ResourceLimits::default()` disables everything including the recursion depth, which
/// lets deep recursion overflow the native stack. Prefer [`ResourceLimits::new`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of executed instructions.
    pub max_operations: Option<usize>,
    /// Maximum number of heap allocations allowed.
    pub max_allocations: Option<usize>,
    /// Maximum execution time.
    pub max_duration: Option<Duration>,
    /// Maximum heap memory in bytes (approximate).
    pub max_memory: Option<usize>,
    /// Maximum frame depth.
    pub max_recursion_depth: Option<usize>,
}

impl ResourceLimits {
    /// Creates limits with everything disabled except the recursion depth, which
    /// defaults to [`DEFAULT_MAX_RECURSION_DEPTH`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            ..Default::default()
        }
    }

    /// Sets the maximum number of allocations.
    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    /// Sets the maximum number of executed instructions.
    #[must_use]
    pub fn max_operations(mut self, limit: usize) -> Self {
        self.max_operations = Some(limit);
        self
    }

    /// Sets the maximum execution duration.
    #[must_use]
    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    /// Sets the maximum memory usage in bytes.
    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }

    /// Sets the maximum frame depth.
    #[must_use]
    pub fn max_recursion_depth(mut self, limit: Option<usize>) -> Self {
        self.max_recursion_depth = limit;
        self
    }
}

/// A resource tracker that enforces configurable limits.
///
/// Tracks allocation count, memory usage, instruction count and execution time,
/// returning errors when limits are exceeded.
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    /// When execution started (for time limit checking).
    start_time: Instant,
    /// Total number of allocations made.
    allocation_count: usize,
    /// Number of instructions executed.
    operation_count: usize,
    /// Current approximate memory usage in bytes.
    current_memory: usize,
}

impl LimitedTracker {
    /// The clock for `max_duration` starts here, not when execution starts.
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            start_time: Instant::now(),
            allocation_count: 0,
            operation_count: 0,
            current_memory: 0,
        }
    }

    /// Returns the current approximate memory usage.
    #[must_use]
    pub fn current_memory(&self) -> usize {
        self.current_memory
    }

    /// Returns the elapsed time since tracker creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns the configured limits.
    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn count_allocation(&mut self) -> Result<(), ResourceError> {
        match self.limits.max_allocations {
            Some(limit) if self.allocation_count >= limit => Err(ResourceError::Allocation {
                limit,
                count: self.allocation_count + 1,
            }),
            _ => {
                self.allocation_count += 1;
                Ok(())
            }
        }
    }

    fn memory_check(&self, extra: usize) -> Result<(), ResourceError> {
        match self.limits.max_memory {
            Some(limit) if self.current_memory.saturating_add(extra) > limit => Err(ResourceError::Memory {
                limit,
                used: self.current_memory.saturating_add(extra),
            }),
            _ => Ok(()),
        }
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        let size = get_size();
        self.memory_check(size)?;
        self.count_allocation()?;
        self.current_memory += size;
        Ok(())
    }

    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        self.count_allocation()
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        self.current_memory = self.current_memory.saturating_sub(get_size());
    }

    fn on_instruction(&mut self) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_operations {
            self.operation_count += 1;
            if self.operation_count > limit {
                return Err(ResourceError::Operation {
                    limit,
                    count: self.operation_count,
                });
            }
        }
        if let Some(limit) = self.limits.max_duration {
            let elapsed = self.start_time.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        match self.limits.max_recursion_depth {
            Some(limit) if current_depth >= limit => Err(ResourceError::Recursion {
                limit,
                depth: current_depth + 1,
            }),
            _ => Ok(()),
        }
    }

    fn check_large_result(&self, estimated_bytes: usize) -> Result<(), ResourceError> {
        self.memory_check(estimated_bytes)
    }

    fn allocation_count(&self) -> Option<usize> {
        Some(self.allocation_count)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_limit_rejects_the_next_allocation() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(2));
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert_eq!(
            tracker.on_allocate(|| 8),
            Err(ResourceError::Allocation { limit: 2, count: 3 })
        );
    }

    #[test]
    fn freed_memory_is_returned_to_the_budget() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_memory(100));
        assert!(tracker.on_allocate(|| 60).is_ok());
        assert!(tracker.on_allocate(|| 60).is_err());
        tracker.on_free(|| 60);
        assert!(tracker.on_allocate(|| 60).is_ok());
        assert_eq!(tracker.current_memory(), 60);
    }

    #[test]
    fn recursion_limit_counts_frames_before_the_push() {
        let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(Some(3)));
        assert!(tracker.check_recursion_depth(2).is_ok());
        assert!(tracker.check_recursion_depth(3).is_err());
        assert!(NoLimitTracker.check_recursion_depth(DEFAULT_MAX_RECURSION_DEPTH).is_err());
    }

    #[test]
    fn operation_limit_is_uncatchable() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_operations(1));
        assert!(tracker.on_instruction().is_ok());
        let err = tracker.on_instruction().unwrap_err();
        assert!(matches!(RunError::from(err), RunError::Uncatchable(_)));
    }
}
