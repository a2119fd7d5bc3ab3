use std::path::PathBuf;

/// Hard failures of one conversion. Everything else (missing spec, malformed
/// spec nodes) degrades the output and is reported through diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("input not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    InputUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse playbook {}: {message}", path.display())]
    PlaybookParse { path: PathBuf, message: String },

    #[error("failed to render JSON document: {0}")]
    RenderJson(#[from] serde_json::Error),

    #[error("failed to render YAML document: {0}")]
    RenderYaml(#[from] serde_yaml::Error),
}

/// Read a source file as one scoped acquisition: opened, fully read, released.
pub(crate) fn read_source(path: &std::path::Path) -> Result<String, ConvertError> {
    if !path.exists() {
        return Err(ConvertError::InputNotFound { path: path.to_path_buf() });
    }
    std::fs::read_to_string(path).map_err(|source| ConvertError::InputUnreadable {
        path: path.to_path_buf(),
        source,
    })
}
