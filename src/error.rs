//! Crate-wide error type
use crate::graph::{ExecuteError, GraphError};
use ndarray::ShapeError;
use std::fmt;

#[derive(Debug)]
pub enum NasError {
    /// Invalid construction parameters: unknown mode, unknown candidate, even kernel, ...
    Configuration {
        message: String,
    },
    /// A sampled/max selection node was evaluated before an active index was chosen.
    SelectionNotInitialized {
        module: String,
    },
    InvalidState {
        message: String,
    },
    /// Static shapes that cannot be reconciled, raised while the graph is built.
    ShapeMismatch {
        message: String,
    },
    /// NaN or Inf reached a value the caller asked to check.
    Numeric {
        message: String,
    },
    Graph(GraphError),
    Execute(ExecuteError),
    Shape(ShapeError),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Logging(String),
}

impl NasError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn shape_mismatch<S: Into<String>>(message: S) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    pub fn numeric<S: Into<String>>(message: S) -> Self {
        Self::Numeric {
            message: message.into(),
        }
    }

    pub fn selection_not_initialized<S: Into<String>>(module: S) -> Self {
        Self::SelectionNotInitialized {
            module: module.into(),
        }
    }
}

impl fmt::Display for NasError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Configuration { message } => write!(f, "configuration error: {}", message),
            Self::SelectionNotInitialized { module } => {
                write!(f, "active index of {} was not initialized", module)
            }
            Self::InvalidState { message } => write!(f, "invalid state: {}", message),
            Self::ShapeMismatch { message } => write!(f, "shape mismatch: {}", message),
            Self::Numeric { message } => write!(f, "numeric error: {}", message),
            Self::Graph(err) => write!(f, "graph error: {:?}", err),
            Self::Execute(err) => write!(f, "execution error: {:?}", err),
            Self::Shape(err) => write!(f, "array shape error: {}", err),
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Serialization(err) => write!(f, "serialization error: {}", err),
            Self::Logging(message) => write!(f, "logging error: {}", message),
        }
    }
}

impl std::error::Error for NasError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shape(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GraphError> for NasError {
    fn from(err: GraphError) -> Self {
        Self::Graph(err)
    }
}

impl From<ExecuteError> for NasError {
    fn from(err: ExecuteError) -> Self {
        Self::Execute(err)
    }
}

impl From<ShapeError> for NasError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

impl From<std::io::Error> for NasError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for NasError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err)
    }
}
