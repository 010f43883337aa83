/// Failure taxonomy of the virtual-memory layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    /// Misaligned or non-canonical address, or an operation that would
    /// shatter an existing large-page mapping.
    #[error("invalid address or mapping request")]
    Invalid,
    /// A page-table frame could not be allocated.
    #[error("out of memory for page tables")]
    OutOfMemory,
    /// Unmap or resolve of a virtual page with no present mapping.
    #[error("no mapping for the given virtual address")]
    NoMap,
    /// Map over an already-present leaf entry.
    #[error("virtual page is already mapped")]
    Busy,
    /// The request needs a CPU feature this kernel does not program.
    #[error("unsupported mapping attribute")]
    Unsupported,
    /// The VMM singleton has not been initialized yet.
    #[error("virtual memory manager not initialized")]
    NotInitialized,
}
