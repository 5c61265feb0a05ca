use camino::Utf8PathBuf;
use thiserror::Error;

/// Failures of name- and substring-based lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Node '{0}' not found")]
    NotFound(String),

    #[error("Node name '{name}' is ambiguous, candidates: {}", candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Substring '{needle}' not found in '{haystack}'")]
    Substring { needle: String, haystack: String },

    #[error("Node '{node}' does not declare a file template for field '{field}'")]
    Field { node: String, field: String },
}

/// Violations of the graph invariants, reported while the graph is assembled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("A node named '{0}' already exists in workflow '{1}'")]
    DuplicateNode(String, String),

    #[error("Name '{0}' is not usable as a node name, it must be non-empty and free of path separators")]
    InvalidName(String),

    #[error("Node index {0} does not belong to workflow '{1}'")]
    UnknownNode(usize, String),

    #[error("Node '{node}' has no {direction} slot '{slot}'")]
    UnknownSlot {
        node: String,
        slot: String,
        direction: &'static str,
    },

    #[error("Input '{slot}' of node '{node}' is already connected")]
    AlreadyConnected { node: String, slot: String },

    #[error("Connecting '{from}' to '{to}' would create a cycle")]
    Cycle { from: String, to: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("Missing value for '{0}'")]
    Missing(String),

    #[error("Value '{slot}' should be {expected}, found {found}")]
    Type {
        slot: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Couldn't read image '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("Couldn't write image '{path}'.\n{source}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("Expected a {expected}-D image, found shape {found:?}")]
    Rank { expected: usize, found: Vec<usize> },

    #[error("Volume {index} out of range, image has {count} volumes")]
    Volume { index: usize, count: usize },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Couldn't access table file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: couldn't parse '{token}' as a number")]
    Parse { line: usize, token: String },

    #[error("Line {line}: expected {expected} columns, found {found}")]
    Ragged {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("No input images were given")]
    NoInput,

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Image {index} has shape {found:?}, expected {expected:?}")]
    Dimension {
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Image {index} has a different affine than image 0")]
    Affine { index: usize },

    #[error("Mask is not on the voxel grid of the images (shape {found:?}, images have {expected:?})")]
    Mask {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Confounds have {rows} rows, image {index} has {volumes} volumes")]
    Confounds {
        index: usize,
        rows: usize,
        volumes: usize,
    },

    #[error("Decomposition estimator failed.\n{0}")]
    Estimator(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RsnError {
    #[error("Couldn't read labels file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Labels line {line}: couldn't parse index '{token}'")]
    Label { line: usize, token: String },

    #[error("The number of labels is larger than the number of images. Got {labels} and {images}.")]
    TooManyLabels { labels: usize, images: usize },

    #[error("Network index {0} is not listed in the labels file")]
    UnknownNetwork(usize),

    #[error("Images are not on the same voxel grid: {0:?} vs {1:?}")]
    Grid(Vec<usize>, Vec<usize>),

    #[error("Vector has {found} samples, data has {expected}")]
    Samples { expected: usize, found: usize },

    #[error(transparent)]
    Image(#[from] ImageError),
}

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("Template '{template}' has no field '{field}'")]
    Field { field: String, template: String },

    #[error("No statistics files match '{0}'")]
    NoFiles(String),

    #[error("Unexpected statistics file '{path}': {reason}")]
    Layout { path: Utf8PathBuf, reason: String },

    #[error("Couldn't read statistics file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse statistics file.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't write motion sheet.\n{0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    NonUtf8(#[from] camino::FromPathBufError),
}

/// Errors raised by [`attach_rest_preprocessing`](crate::rest::attach_rest_preprocessing).
#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Workflow '{0}' contains a cycle through node '{1}'")]
    Cycle(String, String),

    #[error("Node '{node}' is missing mandatory input '{slot}'")]
    MissingInput { node: String, slot: String },

    #[error("Node '{node}' did not produce output '{slot}'")]
    MissingOutput { node: String, slot: String },

    #[error("Couldn't prepare the working directory.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't persist node result.\n{0}")]
    Result(#[from] serde_json::Error),

    #[error(transparent)]
    Template(#[from] indicatif::style::TemplateError),

    #[error("Scheduler channel closed before all nodes finished")]
    Disconnected,

    #[error("Node '{0}':\n{1}")]
    Node(String, anyhow::Error),
}
