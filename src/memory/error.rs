use std::fmt;

use crate::memory::vm::VmError;

/// Why an allocation was not served.
#[derive(Debug)]
pub enum AllocError {
    /// The arena has no page left for the class.
    OutOfMemory { size: usize },
    /// The OS refused to back a page.
    Commit(VmError),
    /// Above the segregated size-class ceiling (or an alignment no class
    /// satisfies). Routing signal for a large-object allocator; not a
    /// failure of this heap.
    LargeObject { size: usize, align: usize },
}

impl AllocError {
    pub fn is_large_object(&self) -> bool {
        matches!(self, AllocError::LargeObject { .. })
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { size } => {
                write!(f, "out of memory: arena exhausted serving {size} bytes")
            }
            AllocError::Commit(e) => write!(f, "allocation failed: {e}"),
            AllocError::LargeObject { size, align } => write!(
                f,
                "{size} bytes aligned to {align} is a large object; route it elsewhere"
            ),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Commit(e) => Some(e),
            AllocError::OutOfMemory { .. } | AllocError::LargeObject { .. } => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::Commit(e)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display() {
        assert_eq!(
            AllocError::OutOfMemory { size: 64 }.to_string(),
            "out of memory: arena exhausted serving 64 bytes"
        );
        let large = AllocError::LargeObject { size: 9000, align: 16 };
        assert!(large.is_large_object());
        assert!(large.to_string().contains("9000"));
    }

    #[test]
    fn test_commit_source_chain() {
        let err: AllocError =
            VmError::CommitFailed(std::io::Error::other("no memory")).into();
        assert!(!err.is_large_object());
        let source = err.source().expect("commit errors carry their VM cause");
        assert!(source.to_string().contains("no memory"));
    }
}
