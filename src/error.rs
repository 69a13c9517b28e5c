use core::fmt;

/// Recoverable kernel failures.
///
/// Anything that would leave shared state inconsistent panics instead of
/// showing up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    ProcessTableFull,
    NoChildren,
    Killed,
    NoSuchProcess,
    NotMapped,
    AccessDenied,
    InvalidArgument,
    OutOfRange,
    BadDescriptor,
    NoSpace,
    InvalidConfig(&'static str),
}

impl KernelError {
    /// True for failures caused by running out of a fixed resource.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            KernelError::OutOfMemory | KernelError::ProcessTableFull | KernelError::NoSpace
        )
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of physical memory"),
            KernelError::ProcessTableFull => write!(f, "No free process slot"),
            KernelError::NoChildren => write!(f, "No child processes"),
            KernelError::Killed => write!(f, "Process was killed"),
            KernelError::NoSuchProcess => write!(f, "No such process"),
            KernelError::NotMapped => write!(f, "Address not mapped"),
            KernelError::AccessDenied => write!(f, "Page not user accessible"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::OutOfRange => write!(f, "Address out of range"),
            KernelError::BadDescriptor => write!(f, "Bad descriptor"),
            KernelError::NoSpace => write!(f, "No space left in table"),
            KernelError::InvalidConfig(why) => write!(f, "Invalid configuration: {}", why),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn exhaustion_covers_fixed_resources_only() {
        assert!(KernelError::OutOfMemory.is_exhaustion());
        assert!(KernelError::ProcessTableFull.is_exhaustion());
        assert!(!KernelError::NoChildren.is_exhaustion());
        assert!(!KernelError::Killed.is_exhaustion());
    }

    #[test]
    fn display_names_the_config_problem() {
        let msg = KernelError::InvalidConfig("ncpu is zero").to_string();
        assert_eq!(msg, "Invalid configuration: ncpu is zero");
    }
}
