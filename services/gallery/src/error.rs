use thiserror::Error;

/// Errors surfaced at the component boundaries of the gallery service.
///
/// Every adapter converts its SDK or driver failure into one of these
/// variants, so handlers never see a raw AWS, sqlx or HTTP client error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad file name, extension or payload. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The object store was unreachable or rejected a write.
    #[error("object store write failed: {0}")]
    StorageWrite(String),

    /// The object store could not be read or could not sign a URL.
    #[error("object store read failed: {0}")]
    StorageRead(String),

    /// The metadata database was unreachable or rejected a write.
    #[error("metadata write failed: {0}")]
    MetadataWrite(String),

    /// The metadata database could not be queried.
    #[error("metadata read failed: {0}")]
    MetadataRead(String),

    /// The caption model failed, timed out or returned nothing.
    #[error("caption generation failed: {0}")]
    CaptionGeneration(String),

    /// No record exists for the requested key.
    #[error("image not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::StorageWrite(_) => "STORAGE_WRITE_ERROR",
            Error::StorageRead(_) => "STORAGE_READ_ERROR",
            Error::MetadataWrite(_) => "METADATA_WRITE_ERROR",
            Error::MetadataRead(_) => "METADATA_READ_ERROR",
            Error::CaptionGeneration(_) => "CAPTION_GENERATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(Error::NotFound("cat.png".into()).code(), "NOT_FOUND");
        assert_eq!(
            Error::MetadataWrite("down".into()).to_string(),
            "metadata write failed: down"
        );
    }
}
