//! Error types and handling
//!
//! Domain errors are grouped by subsystem and wrapped in a single [`DcxError`]
//! so the binary can map any failure onto a process exit code. Errors raised
//! while classifying container state are recovered locally (the planner sees
//! `Unknown`/`Broken` instead); errors raised while executing a chosen action
//! propagate to the caller.

use thiserror::Error;

/// Top-level error for the dcx core library
#[derive(Error, Debug)]
pub enum DcxError {
    /// Configuration discovery, parsing, or validation errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Feature fetching errors (registry, tarball, archive)
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Feature dependency ordering errors
    #[error(transparent)]
    Ordering(#[from] OrderingError),

    /// Derived-image recipe or build errors
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Container runtime CLI errors
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// State classification errors
    #[error(transparent)]
    State(#[from] StateError),

    /// In-container command execution errors
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// SSH transport, proxy, and config-patching errors
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// Cooperative cancellation; never logged as an error
    #[error("operation cancelled")]
    Cancelled,

    /// Underlying I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DcxError {
    /// Map this error onto the documented process exit codes:
    /// `2` for configuration/validation problems, `130` for cancellation,
    /// `1` for everything else. Lifecycle hook failures preserve the hook's
    /// own exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            DcxError::Config(_) => 2,
            DcxError::Cancelled => 130,
            DcxError::Exec(ExecError::NonZeroExit { code, .. }) => *code,
            _ => 1,
        }
    }
}

/// Configuration errors, surfaced with file path and field path
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Workspace root does not exist
    #[error("workspace not found: {path}")]
    WorkspaceNotFound { path: String },

    /// No configuration file at any of the permitted locations
    #[error("no devcontainer configuration found under {root}")]
    NotFound { root: String },

    /// More than one `.devcontainer/<folder>/devcontainer.json` candidate
    #[error("ambiguous configuration, candidates: {}", candidates.join(", "))]
    Ambiguous { candidates: Vec<String> },

    /// Malformed JSON / JSONC
    #[error("failed to parse {path}: {message}")]
    ParseInvalid { path: String, message: String },

    /// A polymorphic field had an unrecognized shape
    #[error("unrecognized shape for {field}: {message}")]
    SchemaMismatch { field: String, message: String },

    /// Semantic validation failure, annotated with the offending field path
    #[error("invalid configuration at {field}: {message}")]
    Validation { field: String, message: String },

    /// Configuration file I/O error
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Feature fetch errors; non-local features are reported with their canonical id
#[derive(Error, Debug)]
pub enum FetchError {
    /// Feature reference string could not be parsed
    #[error("invalid feature reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Registry or tarball endpoint returned a failure status
    #[error("fetch failed for {reference}: {message}")]
    FetchFailed { reference: String, message: String },

    /// Bearer token acquisition handshake failed
    #[error("token acquisition failed for {registry}: {message}")]
    TokenAcquisition { registry: String, message: String },

    /// A tar entry would escape the extraction directory
    #[error("refusing to extract unsafe path '{entry}'")]
    UnsafePath { entry: String },

    /// Archive contained no entries
    #[error("archive for {reference} contained no entries")]
    EmptyArchive { reference: String },

    /// Archive bytes were not a valid (gzipped) tar stream
    #[error("invalid archive for {reference}: {message}")]
    InvalidArchive { reference: String, message: String },

    /// Local feature directory missing or lacking a manifest
    #[error("local feature at {path} is invalid: {message}")]
    LocalFeature { path: String, message: String },

    /// Feature manifest failed to parse
    #[error("invalid feature manifest for {reference}: {message}")]
    InvalidManifest { reference: String, message: String },
}

/// Feature ordering errors, reporting the offending edges
#[derive(Error, Debug)]
pub enum OrderingError {
    /// Circular dependency between features
    #[error("circular dependency between features: {}", members.join(" -> "))]
    CycleDetected { members: Vec<String> },

    /// A hard dependency never resolved after the fetch fixpoint
    #[error("feature '{from}' depends on '{to}' which could not be resolved")]
    MissingDependency { from: String, to: String },
}

/// Derived-image build errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// A recipe-generation invariant was violated
    #[error("recipe generation failed: {message}")]
    Recipe { message: String },

    /// The runtime build subcommand exited non-zero
    #[error("image build failed: {message}")]
    BuildFailed { message: String },

    /// Build context staging failed
    #[error("failed to stage build context at {path}: {message}")]
    Context { path: String, message: String },
}

/// Container runtime CLI errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime daemon not reachable; surfaced once, further operations short-circuit
    #[error("container runtime unavailable: {message}")]
    Unavailable { message: String },

    /// A runtime subcommand exited non-zero
    #[error("runtime command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Container or image not found
    #[error("not found: {reference}")]
    NotFound { reference: String },

    /// Runtime output could not be parsed
    #[error("failed to parse runtime output: {message}")]
    ParseOutput { message: String },

    /// Image pull failed
    #[error("failed to pull image {reference}: {message}")]
    PullFailed { reference: String, message: String },

    /// Container creation failed
    #[error("failed to create container: {message}")]
    CreateFailed { message: String },
}

/// State classification errors
#[derive(Error, Debug)]
pub enum StateError {
    /// Observed labels do not match any classification
    #[error("container {id} is in an inconsistent state: {message}")]
    Inconsistent { id: String, message: String },
}

/// In-container execution errors
#[derive(Error, Debug)]
pub enum ExecError {
    /// Command exited non-zero; the code is preserved as the process exit code
    #[error("command `{command}` exited with code {code}")]
    NonZeroExit { command: String, code: i32 },

    /// Command could not be spawned
    #[error("failed to execute `{command}`: {message}")]
    Spawn { command: String, message: String },
}

/// SSH subsystem errors
#[derive(Error, Debug)]
pub enum SshError {
    /// No usable host agent socket
    #[error("no usable SSH agent socket: {message}")]
    AgentUnavailable { message: String },

    /// Host-side proxy setup failed
    #[error("agent proxy error: {message}")]
    Proxy { message: String },

    /// In-container agent did not signal readiness within the deadline
    #[error("container agent did not become ready within {timeout_ms} ms")]
    AgentNotReady { timeout_ms: u64 },

    /// SSH config file locking or editing failed
    #[error("failed to update ssh config: {message}")]
    ConfigPatch { message: String },
}

/// Convenience type alias for Results with DcxError
pub type Result<T> = std::result::Result<T, DcxError>;
