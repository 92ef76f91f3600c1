use thiserror::Error;

/// Errors raised at construction or compile time. Runtime (per-row)
/// evaluation faults never surface here: they degrade to NULL and set a
/// statistics flag so a single bad row cannot wedge a circuit.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid source/view configuration: bad name, missing key, unknown
    /// join mode. The owning object is not created.
    #[error("configuration error: {0}")]
    Config(String),

    /// The SQL AST references a non-existent table, an ambiguous column,
    /// or a construct the compiler does not support.
    #[error("compile error: {0}")]
    Compile(String),

    /// An upstream has not published its schema yet. Transient: the view
    /// stays registered and compilation is retried when upstreams become
    /// ready.
    #[error("schema not ready for upstream '{0}'")]
    SchemaNotReady(String),

    /// A named source or view does not exist.
    #[error("unknown stream '{0}'")]
    UnknownStream(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        EngineError::Compile(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::SchemaNotReady(_))
    }
}
