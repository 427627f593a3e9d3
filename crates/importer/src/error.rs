use std::fmt;
use std::path::PathBuf;

use blkgraph_graph::GraphError;

#[derive(Debug)]
pub enum ImportError {
    Graph(GraphError),
    Io(std::io::Error),
    NoBlockFiles(PathBuf),
    InvalidSetting(String),
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::Graph(err) => write!(f, "{err}"),
            ImportError::Io(err) => write!(f, "{err}"),
            ImportError::NoBlockFiles(dir) => {
                write!(f, "no blkNNNNN.dat files found in {}", dir.display())
            }
            ImportError::InvalidSetting(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<GraphError> for ImportError {
    fn from(err: GraphError) -> Self {
        ImportError::Graph(err)
    }
}

impl From<blkgraph_storage::StoreError> for ImportError {
    fn from(err: blkgraph_storage::StoreError) -> Self {
        ImportError::Graph(GraphError::Store(err))
    }
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::Io(err)
    }
}
