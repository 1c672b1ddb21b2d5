use super::panic_message;
use ng_connectivity_sdk::{ConnectivityError, TopicPath};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Result of one mapper invocation for one input.
#[derive(Debug, Clone)]
pub enum MappingOutcome<T> {
    /// The mapper produced `value`; a mapper emitting several values yields one outcome each.
    Mapped {
        mapper_id: String,
        value: T,
        topic_path: Option<TopicPath>,
    },
    /// The mapper was blocked, its condition did not hold, or it produced nothing.
    Dropped { mapper_id: String },
    Error {
        mapper_id: String,
        error: ConnectivityError,
        topic_path: Option<TopicPath>,
    },
}

impl<T> MappingOutcome<T> {
    pub fn mapper_id(&self) -> &str {
        match self {
            MappingOutcome::Mapped { mapper_id, .. }
            | MappingOutcome::Dropped { mapper_id }
            | MappingOutcome::Error { mapper_id, .. } => mapper_id,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, MappingOutcome::Mapped { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, MappingOutcome::Dropped { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MappingOutcome::Error { .. })
    }

    /// Dispatches the outcome to `visitor`.
    ///
    /// A `Mapped` visit that fails, either by returning an error or by panicking, is
    /// handed to [`OutcomeVisitor::on_error`] with the outcome's topic path.
    pub fn accept<V: OutcomeVisitor<T>>(self, visitor: &mut V) -> V::Output {
        match self {
            MappingOutcome::Mapped {
                mapper_id,
                value,
                topic_path,
            } => {
                let visited = catch_unwind(AssertUnwindSafe(|| visitor.on_mapped(&mapper_id, value)));
                match visited {
                    Ok(Ok(output)) => output,
                    Ok(Err(error)) => visitor.on_error(&mapper_id, error, topic_path.as_ref()),
                    Err(panic) => {
                        let error = ConnectivityError::Internal {
                            message: panic_message(panic),
                        };
                        visitor.on_error(&mapper_id, error, topic_path.as_ref())
                    }
                }
            }
            MappingOutcome::Dropped { mapper_id } => visitor.on_dropped(&mapper_id),
            MappingOutcome::Error {
                mapper_id,
                error,
                topic_path,
            } => visitor.on_error(&mapper_id, error, topic_path.as_ref()),
        }
    }
}

/// Exhaustive handler of [`MappingOutcome`] variants.
pub trait OutcomeVisitor<T> {
    type Output;

    fn on_mapped(&mut self, mapper_id: &str, value: T) -> Result<Self::Output, ConnectivityError>;

    fn on_dropped(&mut self, mapper_id: &str) -> Self::Output;

    fn on_error(
        &mut self,
        mapper_id: &str,
        error: ConnectivityError,
        topic_path: Option<&TopicPath>,
    ) -> Self::Output;
}
