//! User functions applied to line data by INVOKE.

use bytes::Bytes;

use crate::{LineId, Result};

/// Outcome of applying a [`LineFunction`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// New line contents
    pub data: Option<Bytes>,
    /// Value returned to the caller
    pub result: Bytes,
}

/// A function applied to a line's data on its owner node. Functions are
/// registered by name on every node and invoked remotely by that name, so
/// they must be deterministic.
pub trait LineFunction: Send + Sync {
    fn invoke(&self, line: LineId, data: Option<&Bytes>, args: &Bytes) -> Result<Invocation>;
}

impl<F> LineFunction for F
where
    F: Fn(LineId, Option<&Bytes>, &Bytes) -> Result<Invocation> + Send + Sync,
{
    fn invoke(&self, line: LineId, data: Option<&Bytes>, args: &Bytes) -> Result<Invocation> {
        self(line, data, args)
    }
}
